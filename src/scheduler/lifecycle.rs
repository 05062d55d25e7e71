//! Scheduler lifecycle state machine.
//!
//! [`SchedulerCore`] owns the builder registry, the persisted-task store, the
//! list of scheduled entries and the running dispatcher. Every method takes
//! `&mut self`; callers on other tasks go through
//! [`SchedulerHandle`](super::runner::SchedulerHandle), which marshals calls
//! onto the single task that owns the core.
//!
//! ```text
//! Inactive --start()--> Active --stop()--> Inactive
//! ```
//!
//! `start` restores persisted entries and hands every entry to a fresh
//! dispatcher. `stop` destroys the dispatcher and writes every entry that
//! still has pending work back to storage.

use crate::dispatcher::{
    DispatchEvent, DispatchEventKind, Dispatcher, DispatcherFactory, EventSink,
    timer_dispatcher_factory,
};
use crate::error::Result;
use crate::registry::BuilderRegistry;
use crate::store::{DEFAULT_NAMESPACE, KeyValueStore, PersistedEntry, PersistentTaskStore};
use crate::task::{SharedTask, TaskBuilder, TaskKey, TaskType, UpdateTask};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Notification that the task scheduled under `group_id` is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskReady {
    /// Group ID the task was scheduled under.
    pub group_id: i32,
}

/// One scheduled task and the group ID it was scheduled under.
#[derive(Debug)]
struct ScheduledEntry {
    task: SharedTask,
    group_id: i32,
}

/// Scheduler state owned by a single context.
pub struct SchedulerCore {
    active: bool,
    store: Option<PersistentTaskStore>,
    settings_path: PathBuf,
    registry: BuilderRegistry,
    entries: Vec<ScheduledEntry>,
    dispatcher: Option<Box<dyn Dispatcher>>,
    dispatcher_factory: DispatcherFactory,
    /// Generation of the current (or last) dispatcher.
    generation: u64,
    event_tx: mpsc::UnboundedSender<DispatchEvent>,
    ready_tx: mpsc::UnboundedSender<TaskReady>,
}

impl SchedulerCore {
    /// Create an inactive scheduler.
    ///
    /// Dispatcher events are sent to `event_tx` and must be fed back through
    /// [`handle_dispatch_event`](Self::handle_dispatch_event). Ready
    /// notifications go to `ready_tx`.
    pub fn new(
        ready_tx: mpsc::UnboundedSender<TaskReady>,
        event_tx: mpsc::UnboundedSender<DispatchEvent>,
    ) -> Self {
        Self {
            active: false,
            store: None,
            settings_path: crate::app_dirs::settings_file(),
            registry: BuilderRegistry::new(),
            entries: Vec::new(),
            dispatcher: None,
            dispatcher_factory: timer_dispatcher_factory(),
            generation: 0,
            event_tx,
            ready_tx,
        }
    }

    /// Settings document used when binding a namespace.
    pub fn with_settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = path.into();
        self
    }

    /// Replace the dispatcher used on `start`.
    pub fn with_dispatcher_factory(mut self, factory: DispatcherFactory) -> Self {
        self.dispatcher_factory = factory;
        self
    }

    /// Register (or replace) the builder for `task_type`. Allowed at any time.
    pub fn register_task_builder(&mut self, task_type: TaskType, builder: Box<dyn TaskBuilder>) {
        self.registry.register(task_type, builder);
    }

    /// Bind storage to `namespace` in the settings document.
    ///
    /// Returns `false` while active.
    pub fn configure_namespace(&mut self, namespace: &str) -> bool {
        if self.active {
            return false;
        }
        self.store = Some(PersistentTaskStore::with_namespace(
            self.settings_path.clone(),
            namespace,
        ));
        true
    }

    /// Adopt a caller-provided store.
    ///
    /// Returns `false` while active.
    pub fn bind_external_storage(&mut self, store: Box<dyn KeyValueStore>) -> bool {
        if self.active {
            return false;
        }
        self.store = Some(PersistentTaskStore::new(store));
        true
    }

    /// Restore persisted tasks and start dispatching. No-op while active.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be synced; the scheduler stays
    /// inactive in that case.
    pub fn start(&mut self) -> Result<()> {
        if self.active {
            return Ok(());
        }

        let settings_path = &self.settings_path;
        let store = self.store.get_or_insert_with(|| {
            PersistentTaskStore::with_namespace(settings_path.clone(), DEFAULT_NAMESPACE)
        });
        store.sync()?;

        let persisted = store.load_entries();
        let total = persisted.len();
        let mut restored = 0_usize;
        for entry in persisted {
            let task_type = entry.task_type();
            match self.registry.build(&task_type, &entry.data) {
                Some(task) => {
                    self.entries.push(ScheduledEntry {
                        task: SharedTask::new(task),
                        group_id: entry.task_id,
                    });
                    restored += 1;
                }
                None => {
                    let reason = if self.registry.contains(&task_type) {
                        "builder rejected payload"
                    } else {
                        "no builder registered"
                    };
                    debug!(
                        task_type = %task_type,
                        group_id = entry.task_id,
                        reason,
                        "dropping persisted task"
                    );
                }
            }
        }

        self.active = true;
        self.generation += 1;
        let sink = EventSink::new(self.generation, self.event_tx.clone());
        let mut dispatcher = (self.dispatcher_factory)(sink);
        for entry in &self.entries {
            dispatcher.add_task(entry.task.clone());
        }
        self.dispatcher = Some(dispatcher);

        info!(
            restored,
            dropped = total - restored,
            scheduled = self.entries.len(),
            generation = self.generation,
            "update scheduler started"
        );
        Ok(())
    }

    /// Stop dispatching and persist every task with pending work. No-op
    /// while inactive.
    ///
    /// The scheduler is inactive afterwards even if persisting fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule cannot be written to storage.
    pub fn stop(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }

        if let Some(mut dispatcher) = self.dispatcher.take() {
            dispatcher.destroy();
        }
        self.active = false;

        let entries = std::mem::take(&mut self.entries);
        let persisted: Vec<PersistedEntry> = entries
            .iter()
            .filter_map(|entry| {
                let task = entry.task.lock();
                if !task.has_pending_work() {
                    return None;
                }
                let task_type = task.task_type();
                Some(PersistedEntry {
                    hash: task_type.hash,
                    name: task_type.name,
                    task_id: entry.group_id,
                    data: task.store(),
                })
            })
            .collect();
        drop(entries);

        info!(
            persisted = persisted.len(),
            "update scheduler stopped"
        );

        match self.store.as_mut() {
            Some(store) => store.replace_entries(&persisted),
            None => {
                warn!("no storage bound at stop; schedule not persisted");
                Ok(())
            }
        }
    }

    /// Schedule `task` under an explicit group ID.
    ///
    /// Uniqueness of `group_id` is the caller's responsibility. While
    /// inactive the task is held until the next [`start`](Self::start).
    pub fn schedule_task_with_id(&mut self, task: Box<dyn UpdateTask>, group_id: i32) {
        let task = SharedTask::new(task);
        debug!(key = %task.key(), group_id, "task scheduled");
        if let Some(dispatcher) = self.dispatcher.as_mut() {
            dispatcher.add_task(task.clone());
        }
        self.entries.push(ScheduledEntry { task, group_id });
    }

    /// Schedule `task` under a freshly allocated group ID and return it.
    pub fn schedule_task(&mut self, task: Box<dyn UpdateTask>) -> i32 {
        let group_id = self.allocate_group_id();
        self.schedule_task_with_id(task, group_id);
        group_id
    }

    /// Draw from the full `i32` range until the value collides with no
    /// scheduled entry.
    fn allocate_group_id(&self) -> i32 {
        loop {
            let candidate = rand::random::<i32>();
            if !self.entries.iter().any(|e| e.group_id == candidate) {
                return candidate;
            }
        }
    }

    /// Route one dispatcher event.
    ///
    /// Events from a destroyed dispatcher, or received while inactive, are
    /// dropped.
    pub fn handle_dispatch_event(&mut self, event: DispatchEvent) {
        if !self.active || event.generation != self.generation {
            debug!(
                key = %event.key,
                generation = event.generation,
                "dropping event from stale dispatcher"
            );
            return;
        }

        match event.kind {
            DispatchEventKind::Ready => self.task_fired(event.key),
            DispatchEventKind::Done => self.task_done(event.key),
        }
    }

    fn task_fired(&self, key: TaskKey) {
        let Some(entry) = self.entries.iter().find(|e| e.task.key() == key) else {
            return;
        };
        debug!(key = %key, group_id = entry.group_id, "task ready");
        if self
            .ready_tx
            .send(TaskReady {
                group_id: entry.group_id,
            })
            .is_err()
        {
            warn!(group_id = entry.group_id, "task ready receiver closed");
        }
    }

    fn task_done(&mut self, key: TaskKey) {
        if let Some(index) = self.entries.iter().position(|e| e.task.key() == key) {
            let entry = self.entries.remove(index);
            debug!(key = %key, group_id = entry.group_id, "task finished");
        }
    }

    /// Returns `true` between `start` and `stop`.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Group IDs of all scheduled entries, in scheduling order.
    pub fn group_ids(&self) -> Vec<i32> {
        self.entries.iter().map(|e| e.group_id).collect()
    }

    /// Number of scheduled entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered builders.
    pub fn registry(&self) -> &BuilderRegistry {
        &self.registry
    }
}

impl Drop for SchedulerCore {
    fn drop(&mut self) {
        if let Some(mut dispatcher) = self.dispatcher.take() {
            dispatcher.destroy();
        }
    }
}

impl std::fmt::Debug for SchedulerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerCore")
            .field("active", &self.active)
            .field("entries", &self.entries)
            .field("generation", &self.generation)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::dispatcher::testing::RecordingDispatchers;
    use crate::store::MemoryStore;
    use crate::task::testing::{COUNTING_TAG, CountingBuilder, CountingTask};
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;

    struct Harness {
        core: SchedulerCore,
        dispatchers: RecordingDispatchers,
        memory: MemoryStore,
        ready_rx: mpsc::UnboundedReceiver<TaskReady>,
        _event_rx: mpsc::UnboundedReceiver<DispatchEvent>,
    }

    fn harness() -> Harness {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let dispatchers = RecordingDispatchers::default();
        let memory = MemoryStore::new();
        let mut core = SchedulerCore::new(ready_tx, event_tx)
            .with_dispatcher_factory(dispatchers.factory());
        assert!(core.bind_external_storage(Box::new(memory.clone())));
        core.register_task_builder(TaskType::new(COUNTING_TAG), Box::new(CountingBuilder::new("")));
        Harness {
            core,
            dispatchers,
            memory,
            ready_rx,
            _event_rx: event_rx,
        }
    }

    fn ready(h: &Harness, key: TaskKey) -> DispatchEvent {
        DispatchEvent {
            generation: h.dispatchers.last_sink().generation(),
            key,
            kind: DispatchEventKind::Ready,
        }
    }

    fn done(h: &Harness, key: TaskKey) -> DispatchEvent {
        DispatchEvent {
            kind: DispatchEventKind::Done,
            ..ready(h, key)
        }
    }

    fn labels(memory: &MemoryStore) -> Vec<(i32, Vec<u8>)> {
        memory
            .schedule()
            .into_iter()
            .map(|e| (e.task_id, e.data))
            .collect()
    }

    #[test]
    fn new_core_is_inactive_and_empty() {
        let h = harness();
        assert!(!h.core.is_active());
        assert!(h.core.is_empty());
        assert_eq!(h.core.registry().len(), 1);
    }

    #[test]
    fn start_and_stop_toggle_active() {
        let mut h = harness();
        h.core.start().unwrap();
        assert!(h.core.is_active());
        h.core.stop().unwrap();
        assert!(!h.core.is_active());

        h.core.start().unwrap();
        assert!(h.core.is_active());
        assert_eq!(h.dispatchers.created(), 2);
    }

    #[test]
    fn start_twice_creates_one_dispatcher() {
        let mut h = harness();
        h.core.start().unwrap();
        h.core.start().unwrap();
        assert_eq!(h.dispatchers.created(), 1);
        assert_eq!(h.memory.sync_count(), 1);
    }

    #[test]
    fn stop_twice_persists_once() {
        let mut h = harness();
        h.core.schedule_task_with_id(Box::new(CountingTask::new("a", 1)), 1);
        h.core.start().unwrap();
        h.core.stop().unwrap();
        let syncs = h.memory.sync_count();
        let stored = labels(&h.memory);

        h.core.stop().unwrap();
        assert_eq!(h.memory.sync_count(), syncs);
        assert_eq!(labels(&h.memory), stored);
        assert_eq!(h.dispatchers.destroyed(), vec![1]);
    }

    #[test]
    fn stop_while_inactive_is_noop() {
        let mut h = harness();
        h.core.schedule_task_with_id(Box::new(CountingTask::new("a", 1)), 1);
        h.core.stop().unwrap();
        assert_eq!(h.memory.sync_count(), 0);
        assert_eq!(h.core.len(), 1);
    }

    #[test]
    fn configuration_rejected_while_active() {
        let mut h = harness();
        h.core.start().unwrap();
        assert!(!h.core.configure_namespace("Other"));
        assert!(!h.core.bind_external_storage(Box::new(MemoryStore::new())));
        h.core.stop().unwrap();
        assert!(h.core.bind_external_storage(Box::new(MemoryStore::new())));
        assert!(h.core.configure_namespace("Other"));
    }

    #[test]
    fn stop_persists_only_pending_tasks_in_order() {
        let mut h = harness();
        h.core.start().unwrap();
        h.core.schedule_task_with_id(Box::new(CountingTask::new("a", 2)), 10);
        h.core.schedule_task_with_id(Box::new(CountingTask::new("idle", 0)), 20);
        h.core.schedule_task_with_id(Box::new(CountingTask::new("c", 1)), 30);
        h.core.stop().unwrap();

        assert_eq!(
            labels(&h.memory),
            vec![(10, b"a:2".to_vec()), (30, b"c:1".to_vec())]
        );
        assert!(h.core.is_empty());
        let stored = h.memory.schedule();
        assert_eq!(stored[0].name, COUNTING_TAG);
        assert_eq!(stored[0].hash, TaskType::new(COUNTING_TAG).hash);
    }

    #[test]
    fn restart_restores_pending_tasks_with_ids() {
        let mut h = harness();
        h.core.schedule_task_with_id(Box::new(CountingTask::new("a", 2)), 7);
        h.core.schedule_task_with_id(Box::new(CountingTask::new("b", 1)), -3);
        h.core.start().unwrap();
        h.core.stop().unwrap();

        h.core.start().unwrap();
        assert_eq!(h.core.group_ids(), vec![7, -3]);
        let added = h.dispatchers.state.lock().unwrap().added.len();
        // two on the first start, two restored on the second
        assert_eq!(added, 4);
    }

    #[test]
    fn restore_skips_unregistered_types() {
        let mut h = harness();
        let other = TaskType::new("unregistered_task");
        h.memory.clone().set(
            crate::store::SCHEDULE_KEY,
            serde_json::to_value(vec![
                PersistedEntry {
                    hash: TaskType::new(COUNTING_TAG).hash,
                    name: COUNTING_TAG.to_owned(),
                    task_id: 1,
                    data: b"a:1".to_vec(),
                },
                PersistedEntry {
                    hash: other.hash,
                    name: other.name.clone(),
                    task_id: 2,
                    data: b"b:1".to_vec(),
                },
                PersistedEntry {
                    hash: TaskType::new(COUNTING_TAG).hash,
                    name: COUNTING_TAG.to_owned(),
                    task_id: 3,
                    data: b"c:1".to_vec(),
                },
            ])
            .unwrap(),
        );

        h.core.start().unwrap();
        assert_eq!(h.core.group_ids(), vec![1, 3]);
    }

    #[test]
    fn restore_skips_payloads_the_builder_rejects() {
        let mut h = harness();
        let counting = TaskType::new(COUNTING_TAG);
        h.memory.clone().set(
            crate::store::SCHEDULE_KEY,
            serde_json::to_value(vec![
                PersistedEntry {
                    hash: counting.hash,
                    name: counting.name.clone(),
                    task_id: 4,
                    data: b"no separator".to_vec(),
                },
                PersistedEntry {
                    hash: counting.hash,
                    name: counting.name.clone(),
                    task_id: 5,
                    data: b"ok:2".to_vec(),
                },
            ])
            .unwrap(),
        );

        h.core.start().unwrap();
        assert!(h.core.registry().contains(&counting));
        assert_eq!(h.core.group_ids(), vec![5]);
    }

    #[test]
    fn replaced_builder_is_used_for_restore() {
        let mut h = harness();
        h.core.schedule_task_with_id(Box::new(CountingTask::new("t", 1)), 7);
        h.core.start().unwrap();
        h.core.stop().unwrap();

        let second = CountingBuilder::new("second-");
        let built = second.built.clone();
        h.core
            .register_task_builder(TaskType::new(COUNTING_TAG), Box::new(second));
        h.core.start().unwrap();
        h.core.stop().unwrap();

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(labels(&h.memory), vec![(7, b"second-t:1".to_vec())]);
    }

    #[test]
    fn scheduling_while_active_hands_task_to_dispatcher() {
        let mut h = harness();
        h.core.start().unwrap();
        assert!(h.dispatchers.added_keys().is_empty());
        h.core.schedule_task_with_id(Box::new(CountingTask::new("a", 1)), 1);
        assert_eq!(h.dispatchers.added_keys().len(), 1);
    }

    #[test]
    fn scheduling_while_inactive_waits_for_start() {
        let mut h = harness();
        h.core.schedule_task_with_id(Box::new(CountingTask::new("a", 1)), 1);
        assert_eq!(h.dispatchers.created(), 0);
        h.core.start().unwrap();
        assert_eq!(h.dispatchers.added_keys().len(), 1);
    }

    #[test]
    fn generated_ids_are_distinct() {
        let mut h = harness();
        let ids: Vec<i32> = (0..3)
            .map(|i| h.core.schedule_task(Box::new(CountingTask::new(&i.to_string(), 1))))
            .collect();
        let unique: HashSet<i32> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 3);
        assert_eq!(h.core.group_ids(), ids);
    }

    #[test]
    fn generated_id_avoids_existing_ids() {
        let mut h = harness();
        for id in 0..200 {
            h.core.schedule_task_with_id(Box::new(CountingTask::new("x", 1)), id);
        }
        for _ in 0..50 {
            let existing: HashSet<i32> = h.core.group_ids().into_iter().collect();
            let id = h.core.allocate_group_id();
            assert!(!existing.contains(&id));
        }
    }

    #[test]
    fn ready_event_emits_group_id() {
        let mut h = harness();
        h.core.start().unwrap();
        h.core.schedule_task_with_id(Box::new(CountingTask::new("a", 2)), 42);
        let key = h.dispatchers.added_keys()[0];

        h.core.handle_dispatch_event(ready(&h, key));
        h.core.handle_dispatch_event(ready(&h, key));
        assert_eq!(h.ready_rx.try_recv().unwrap(), TaskReady { group_id: 42 });
        assert_eq!(h.ready_rx.try_recv().unwrap(), TaskReady { group_id: 42 });
        assert!(h.ready_rx.try_recv().is_err());
    }

    #[test]
    fn done_event_removes_entry_and_suppresses_later_ready() {
        let mut h = harness();
        h.core.start().unwrap();
        h.core.schedule_task_with_id(Box::new(CountingTask::new("a", 1)), 1);
        h.core.schedule_task_with_id(Box::new(CountingTask::new("b", 1)), 2);
        let keys = h.dispatchers.added_keys();

        h.core.handle_dispatch_event(done(&h, keys[0]));
        assert_eq!(h.core.group_ids(), vec![2]);

        h.core.handle_dispatch_event(ready(&h, keys[0]));
        assert!(h.ready_rx.try_recv().is_err());

        // unknown key is a no-op
        h.core.handle_dispatch_event(done(&h, keys[0]));
        assert_eq!(h.core.group_ids(), vec![2]);
    }

    #[test]
    fn done_drops_task_once_dispatcher_releases_it() {
        let mut h = harness();
        h.core.start().unwrap();
        h.core.schedule_task_with_id(Box::new(CountingTask::new("a", 1)), 1);
        let task = h.dispatchers.state.lock().unwrap().added[0].1.clone();
        assert_eq!(task.ref_count(), 3);

        h.core.handle_dispatch_event(done(&h, task.key()));
        h.dispatchers.state.lock().unwrap().added.clear();
        assert_eq!(task.ref_count(), 1);
    }

    #[test]
    fn events_from_destroyed_dispatcher_are_dropped() {
        let mut h = harness();
        h.core.start().unwrap();
        h.core.schedule_task_with_id(Box::new(CountingTask::new("a", 1)), 5);
        let key = h.dispatchers.added_keys()[0];
        let stale = ready(&h, key);
        h.core.stop().unwrap();

        h.core.handle_dispatch_event(stale);
        assert!(h.ready_rx.try_recv().is_err());

        h.core.start().unwrap();
        let restored_key = h.dispatchers.added_keys()[1];
        h.core.handle_dispatch_event(DispatchEvent {
            key: restored_key,
            ..stale
        });
        assert!(h.ready_rx.try_recv().is_err(), "old generation must be ignored");

        h.core.handle_dispatch_event(ready(&h, restored_key));
        assert_eq!(h.ready_rx.try_recv().unwrap(), TaskReady { group_id: 5 });
    }

    #[test]
    fn failed_sync_keeps_scheduler_inactive() {
        let mut h = harness();
        h.memory.set_fail_sync(true);
        assert!(h.core.start().is_err());
        assert!(!h.core.is_active());
        assert_eq!(h.dispatchers.created(), 0);
    }

    #[test]
    fn failed_persist_still_stops() {
        let mut h = harness();
        h.core.start().unwrap();
        h.core.schedule_task_with_id(Box::new(CountingTask::new("a", 1)), 1);
        h.memory.set_fail_sync(true);
        assert!(h.core.stop().is_err());
        assert!(!h.core.is_active());
        assert_eq!(h.dispatchers.destroyed(), vec![1]);
    }

    #[test]
    fn default_namespace_binds_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let (ready_tx, _ready_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let dispatchers = RecordingDispatchers::default();
        let mut core = SchedulerCore::new(ready_tx, event_tx)
            .with_settings_path(&path)
            .with_dispatcher_factory(dispatchers.factory());
        core.register_task_builder(TaskType::new(COUNTING_TAG), Box::new(CountingBuilder::new("")));

        core.start().unwrap();
        core.schedule_task_with_id(Box::new(CountingTask::new("a", 1)), 9);
        core.stop().unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let array = raw["AutoUpdater/UpdateScheduler/scheduleMemory"]
            .as_array()
            .unwrap();
        assert_eq!(array.len(), 1);
        assert_eq!(array[0]["taskID"], 9);

        core.start().unwrap();
        assert_eq!(core.group_ids(), vec![9]);
    }
}
