//! Timer-driven task dispatcher.
//!
//! The dispatcher tracks live tasks on its own tokio task, independent of the
//! scheduler. Tasks are handed over through a channel and every notification
//! flows back as a [`DispatchEvent`] on the scheduler's event channel, so
//! neither side ever calls into the other synchronously.
//!
//! Events for one task are sent in the order they are raised. Each event is
//! stamped with the generation of the dispatcher that raised it, which lets
//! the scheduler discard stragglers from a dispatcher it already destroyed.

use crate::task::{SharedTask, TaskKey};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Longest single sleep before due dates are re-evaluated.
const MAX_SLEEP: Duration = Duration::from_secs(3600);

/// What happened to a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEventKind {
    /// The task reached one of its due points.
    Ready,
    /// The task has no pending work left and is no longer tracked.
    Done,
}

/// Notification from a dispatcher to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchEvent {
    /// Generation of the dispatcher that raised the event.
    pub generation: u64,
    /// Task the event is about.
    pub key: TaskKey,
    /// Event kind.
    pub kind: DispatchEventKind,
}

/// Sending half handed to a dispatcher; stamps its generation on every event.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<DispatchEvent>,
}

impl EventSink {
    /// Create a sink for dispatcher `generation`.
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<DispatchEvent>) -> Self {
        Self { generation, tx }
    }

    /// Generation stamped on events from this sink.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report that `key` is due. Returns `false` if the scheduler is gone.
    pub fn ready(&self, key: TaskKey) -> bool {
        self.send(key, DispatchEventKind::Ready)
    }

    /// Report that `key` finished. Returns `false` if the scheduler is gone.
    pub fn done(&self, key: TaskKey) -> bool {
        self.send(key, DispatchEventKind::Done)
    }

    fn send(&self, key: TaskKey, kind: DispatchEventKind) -> bool {
        self.tx
            .send(DispatchEvent {
                generation: self.generation,
                key,
                kind,
            })
            .is_ok()
    }
}

/// Contract the scheduler needs from a due-date engine.
pub trait Dispatcher: Send {
    /// Start tracking `task`. Returns before the task is necessarily tracked.
    fn add_task(&mut self, task: SharedTask);

    /// Stop tracking everything and release dispatcher resources. The tasks
    /// themselves are left to their owner.
    fn destroy(&mut self);
}

/// Creates a dispatcher wired to the given sink.
pub type DispatcherFactory = Box<dyn Fn(EventSink) -> Box<dyn Dispatcher> + Send>;

/// Factory for [`TimerDispatcher`]. Must be invoked inside a tokio runtime.
pub fn timer_dispatcher_factory() -> DispatcherFactory {
    Box::new(|sink| Box::new(TimerDispatcher::spawn(sink)))
}

/// Dispatcher backed by a tokio task that sleeps until the next due point.
pub struct TimerDispatcher {
    task_tx: mpsc::UnboundedSender<SharedTask>,
    cancel: CancellationToken,
}

impl TimerDispatcher {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(sink: EventSink) -> Self {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker = TimerWorker {
            task_rx,
            sink,
            cancel: cancel.clone(),
            tracked: Vec::new(),
        };
        tokio::spawn(worker.run());
        Self { task_tx, cancel }
    }
}

impl Dispatcher for TimerDispatcher {
    fn add_task(&mut self, task: SharedTask) {
        if self.task_tx.send(task).is_err() {
            debug!("timer dispatcher already stopped; task not tracked");
        }
    }

    fn destroy(&mut self) {
        self.cancel.cancel();
    }
}

impl Drop for TimerDispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct TimerWorker {
    task_rx: mpsc::UnboundedReceiver<SharedTask>,
    sink: EventSink,
    cancel: CancellationToken,
    tracked: Vec<SharedTask>,
}

impl TimerWorker {
    async fn run(mut self) {
        info!(generation = self.sink.generation(), "timer dispatcher started");

        loop {
            if !self.fire_due(Utc::now()) {
                debug!("scheduler event channel closed; stopping dispatcher");
                break;
            }

            let wait = self.next_wait(Utc::now());
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                task = self.task_rx.recv() => match task {
                    Some(task) => {
                        if !self.track(task) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = sleep_for(wait) => {}
            }
        }

        info!(
            generation = self.sink.generation(),
            released = self.tracked.len(),
            "timer dispatcher stopped"
        );
    }

    /// Start tracking `task`, or finish it at once if it has nothing due.
    fn track(&mut self, task: SharedTask) -> bool {
        let pending = task.lock().has_pending_work();
        if pending {
            debug!(key = %task.key(), "dispatcher tracking task");
            self.tracked.push(task);
            true
        } else {
            self.sink.done(task.key())
        }
    }

    /// Raise one `Ready` for every task due at `now`, advancing it, and a
    /// `Done` for tasks that ran out of due points.
    fn fire_due(&mut self, now: DateTime<Utc>) -> bool {
        let mut index = 0;
        while index < self.tracked.len() {
            let task = &self.tracked[index];
            let key = task.key();
            let (fired, exhausted) = {
                let mut guard = task.lock();
                match guard.current_due() {
                    Some(due) if due <= now => {
                        guard.advance();
                        (true, !guard.has_pending_work())
                    }
                    Some(_) => (false, false),
                    None => (false, true),
                }
            };

            if fired && !self.sink.ready(key) {
                return false;
            }
            if exhausted {
                self.tracked.remove(index);
                if !self.sink.done(key) {
                    return false;
                }
            } else {
                index += 1;
            }
        }
        true
    }

    /// Time until the earliest tracked due point; `None` when idle.
    fn next_wait(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.tracked
            .iter()
            .filter_map(|task| task.lock().current_due())
            .min()
            .map(|due| (due - now).to_std().unwrap_or(Duration::ZERO).min(MAX_SLEEP))
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending::<()>().await,
    }
}
