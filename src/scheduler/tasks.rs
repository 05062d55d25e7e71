//! Built-in update-check task types.
//!
//! - [`LoopUpdateTask`]: due every `interval_secs`, optionally a limited
//!   number of times.
//! - [`TimePointUpdateTask`]: due at a fixed time, optionally repeating on a
//!   calendar unit.
//! - [`UpdateTaskList`]: runs its items one after another.
//!
//! All three persist as JSON and are restored by a [`JsonTaskBuilder`].
//!
//! Advancing a task skips every due point that already passed, so a task
//! restored long after its due time is reported once rather than once per
//! missed cycle.

use crate::task::{TaskBuilder, TaskType, UpdateTask};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use tracing::{debug, warn};

/// Tag of [`LoopUpdateTask`].
pub const LOOP_UPDATE_TASK: &str = "loop_update_task";

/// Tag of [`TimePointUpdateTask`].
pub const TIME_POINT_UPDATE_TASK: &str = "time_point_update_task";

/// Tag of [`UpdateTaskList`].
pub const UPDATE_TASK_LIST: &str = "update_task_list";

/// Calendar unit a [`TimePointUpdateTask`] repeats on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repeat {
    /// Due once.
    #[default]
    Never,
    /// Due every hour after the time point.
    Hourly,
    /// Due every day at the time point's time of day.
    Daily,
    /// Due every week on the time point's weekday.
    Weekly,
}

impl Repeat {
    fn step(self) -> Option<Duration> {
        match self {
            Self::Never => None,
            Self::Hourly => Some(Duration::hours(1)),
            Self::Daily => Some(Duration::days(1)),
            Self::Weekly => Some(Duration::weeks(1)),
        }
    }
}

impl std::fmt::Display for Repeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => write!(f, "once"),
            Self::Hourly => write!(f, "hourly"),
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
        }
    }
}

/// Task due every `interval_secs`, starting at `next_run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopUpdateTask {
    /// Seconds between due points, clamped to one second .. ten years.
    pub interval_secs: u64,
    /// Next due point.
    pub next_run: DateTime<Utc>,
    /// Due points left; `None` repeats forever.
    pub remaining: Option<u32>,
}

impl LoopUpdateTask {
    /// First due point is one interval from now.
    pub fn new(interval_secs: u64, remaining: Option<u32>) -> Self {
        Self {
            interval_secs,
            next_run: Utc::now() + step_secs(interval_secs),
            remaining,
        }
    }

    /// Override the first due point.
    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run = at;
        self
    }

    /// Consume one due point as of `now`, skipping any others already missed.
    pub fn advance_at(&mut self, now: DateTime<Utc>) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        match next_after(self.next_run, step_secs(self.interval_secs), now) {
            Some(next) => self.next_run = next,
            None => self.remaining = Some(0),
        }
    }
}

/// Longest supported interval (ten years).
const MAX_INTERVAL_SECS: u64 = 10 * 365 * 86_400;

fn step_secs(secs: u64) -> Duration {
    Duration::seconds(secs.clamp(1, MAX_INTERVAL_SECS) as i64)
}

/// First point `start + n * step` (n >= 1) strictly after `now`.
fn next_after(start: DateTime<Utc>, step: Duration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = start.checked_add_signed(step)?;
    if next > now {
        return Some(next);
    }
    let step = step.num_seconds().max(1);
    let missed = (now - start).num_seconds() / step + 1;
    start.checked_add_signed(Duration::seconds(step.checked_mul(missed)?))
}

fn encode<T: Serialize>(task: &T, tag: &str) -> Vec<u8> {
    match serde_json::to_vec(task) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(task_type = tag, "cannot encode task payload: {e}");
            Vec::new()
        }
    }
}

impl UpdateTask for LoopUpdateTask {
    fn task_type(&self) -> TaskType {
        TaskType::new(LOOP_UPDATE_TASK)
    }

    fn store(&self) -> Vec<u8> {
        encode(self, LOOP_UPDATE_TASK)
    }

    fn current_due(&self) -> Option<DateTime<Utc>> {
        match self.remaining {
            Some(0) => None,
            _ => Some(self.next_run),
        }
    }

    fn advance(&mut self) {
        self.advance_at(Utc::now());
    }
}

/// Task due at `at`, repeating per `repeat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePointUpdateTask {
    /// Next due point.
    pub at: DateTime<Utc>,
    /// Repetition unit.
    #[serde(default)]
    pub repeat: Repeat,
    /// Set once a non-repeating task has fired.
    #[serde(default)]
    pub finished: bool,
}

impl TimePointUpdateTask {
    /// Task due at `at`.
    pub fn new(at: DateTime<Utc>, repeat: Repeat) -> Self {
        Self {
            at,
            repeat,
            finished: false,
        }
    }

    /// Consume the current due point as of `now`. Repeating tasks move to
    /// the first repetition after `now`.
    pub fn advance_at(&mut self, now: DateTime<Utc>) {
        match self.repeat.step().and_then(|step| next_after(self.at, step, now)) {
            Some(next) => self.at = next,
            None => self.finished = true,
        }
    }
}

impl UpdateTask for TimePointUpdateTask {
    fn task_type(&self) -> TaskType {
        TaskType::new(TIME_POINT_UPDATE_TASK)
    }

    fn store(&self) -> Vec<u8> {
        encode(self, TIME_POINT_UPDATE_TASK)
    }

    fn current_due(&self) -> Option<DateTime<Utc>> {
        (!self.finished).then_some(self.at)
    }

    fn advance(&mut self) {
        self.advance_at(Utc::now());
    }
}

/// One item of an [`UpdateTaskList`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListItem {
    /// A looping item.
    Loop(LoopUpdateTask),
    /// A time-point item.
    TimePoint(TimePointUpdateTask),
}

impl ListItem {
    fn task(&self) -> &dyn UpdateTask {
        match self {
            Self::Loop(task) => task,
            Self::TimePoint(task) => task,
        }
    }

    fn advance_at(&mut self, now: DateTime<Utc>) {
        match self {
            Self::Loop(task) => task.advance_at(now),
            Self::TimePoint(task) => task.advance_at(now),
        }
    }
}

/// Runs its items in order; an item starts once the previous one is
/// exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTaskList {
    /// Items in execution order.
    pub items: Vec<ListItem>,
}

impl UpdateTaskList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item.
    pub fn push(mut self, item: ListItem) -> Self {
        self.items.push(item);
        self
    }

    fn current(&self) -> Option<&ListItem> {
        self.items.iter().find(|item| item.task().has_pending_work())
    }

    /// Advance the first item that still has pending work.
    pub fn advance_at(&mut self, now: DateTime<Utc>) {
        if let Some(item) = self
            .items
            .iter_mut()
            .find(|item| item.task().has_pending_work())
        {
            item.advance_at(now);
        }
    }
}

impl UpdateTask for UpdateTaskList {
    fn task_type(&self) -> TaskType {
        TaskType::new(UPDATE_TASK_LIST)
    }

    fn store(&self) -> Vec<u8> {
        encode(self, UPDATE_TASK_LIST)
    }

    fn current_due(&self) -> Option<DateTime<Utc>> {
        self.current().and_then(|item| item.task().current_due())
    }

    fn advance(&mut self) {
        self.advance_at(Utc::now());
    }
}

/// Builder restoring a task type that persists itself as JSON.
pub struct JsonTaskBuilder<T> {
    _task: PhantomData<fn() -> T>,
}

impl<T> JsonTaskBuilder<T> {
    /// Create the builder.
    pub fn new() -> Self {
        Self { _task: PhantomData }
    }
}

impl<T> Default for JsonTaskBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskBuilder for JsonTaskBuilder<T>
where
    T: UpdateTask + DeserializeOwned + 'static,
{
    fn build_task(&self, data: &[u8]) -> Option<Box<dyn UpdateTask>> {
        match serde_json::from_slice::<T>(data) {
            Ok(task) => Some(Box::new(task)),
            Err(e) => {
                debug!("cannot decode task payload: {e}");
                None
            }
        }
    }
}

/// Builders for every built-in task type.
pub fn builtin_builders() -> Vec<(TaskType, Box<dyn TaskBuilder>)> {
    vec![
        (
            TaskType::new(LOOP_UPDATE_TASK),
            Box::new(JsonTaskBuilder::<LoopUpdateTask>::new()) as Box<dyn TaskBuilder>,
        ),
        (
            TaskType::new(TIME_POINT_UPDATE_TASK),
            Box::new(JsonTaskBuilder::<TimePointUpdateTask>::new()) as Box<dyn TaskBuilder>,
        ),
        (
            TaskType::new(UPDATE_TASK_LIST),
            Box::new(JsonTaskBuilder::<UpdateTaskList>::new()) as Box<dyn TaskBuilder>,
        ),
    ]
}
