//! Scheduler background loop.
//!
//! Spawns a tokio task that owns the [`SchedulerCore`] and serializes every
//! operation on it: commands from any number of [`SchedulerHandle`]s and
//! events from the running dispatcher are handled one at a time on that task.
//!
//! When the last handle is dropped (or [`SchedulerHandle::shutdown`] is
//! called) the loop stops the scheduler once, persisting pending tasks, and
//! exits.

use crate::dispatcher::{DispatchEvent, DispatcherFactory};
use crate::error::{Result, SchedulerError};
use crate::scheduler::lifecycle::{SchedulerCore, TaskReady};
use crate::store::KeyValueStore;
use crate::task::{TaskBuilder, TaskType, UpdateTask};
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Requests marshalled onto the scheduler task.
enum Command {
    RegisterBuilder {
        task_type: TaskType,
        builder: Box<dyn TaskBuilder>,
    },
    ConfigureNamespace {
        namespace: String,
        reply: oneshot::Sender<bool>,
    },
    BindStorage {
        store: Box<dyn KeyValueStore>,
        reply: oneshot::Sender<bool>,
    },
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    Schedule {
        task: Box<dyn UpdateTask>,
        group_id: Option<i32>,
        reply: oneshot::Sender<i32>,
    },
    IsActive {
        reply: oneshot::Sender<bool>,
    },
    GroupIds {
        reply: oneshot::Sender<Vec<i32>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Background scheduler that owns the core and its dispatcher events.
pub struct Scheduler {
    core: SchedulerCore,
    event_rx: mpsc::UnboundedReceiver<DispatchEvent>,
}

impl Scheduler {
    /// Create a new scheduler sending ready notifications to `ready_tx`.
    pub fn new(ready_tx: mpsc::UnboundedSender<TaskReady>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            core: SchedulerCore::new(ready_tx, event_tx),
            event_rx,
        }
    }

    /// Use a different settings document for namespace binding.
    pub fn with_settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.core = self.core.with_settings_path(path);
        self
    }

    /// Use a different dispatcher implementation.
    pub fn with_dispatcher_factory(mut self, factory: DispatcherFactory) -> Self {
        self.core = self.core.with_dispatcher_factory(factory);
        self
    }

    /// Direct access for setup before the loop is spawned.
    pub fn core_mut(&mut self) -> &mut SchedulerCore {
        &mut self.core
    }

    /// Spawn the scheduler loop and return a handle to it.
    pub fn run(self) -> (SchedulerHandle, tokio::task::JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(self.event_loop(command_rx));
        (SchedulerHandle { command_tx }, join)
    }

    async fn event_loop(mut self, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        info!("scheduler loop started");

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => {
                        if !self.apply(command) {
                            break;
                        }
                    }
                    None => {
                        debug!("all scheduler handles dropped");
                        if let Err(e) = self.core.stop() {
                            warn!("cannot persist schedule on shutdown: {e}");
                        }
                        break;
                    }
                },
                Some(event) = self.event_rx.recv() => self.core.handle_dispatch_event(event),
            }
        }

        info!("scheduler loop exited");
    }

    /// Apply one command. Returns `false` once the loop should exit.
    fn apply(&mut self, command: Command) -> bool {
        // A dropped reply receiver only means the caller stopped waiting.
        match command {
            Command::RegisterBuilder { task_type, builder } => {
                self.core.register_task_builder(task_type, builder);
            }
            Command::ConfigureNamespace { namespace, reply } => {
                let _ = reply.send(self.core.configure_namespace(&namespace));
            }
            Command::BindStorage { store, reply } => {
                let _ = reply.send(self.core.bind_external_storage(store));
            }
            Command::Start { reply } => {
                let _ = reply.send(self.core.start());
            }
            Command::Stop { reply } => {
                let _ = reply.send(self.core.stop());
            }
            Command::Schedule {
                task,
                group_id,
                reply,
            } => {
                let group_id = match group_id {
                    Some(group_id) => {
                        self.core.schedule_task_with_id(task, group_id);
                        group_id
                    }
                    None => self.core.schedule_task(task),
                };
                let _ = reply.send(group_id);
            }
            Command::IsActive { reply } => {
                let _ = reply.send(self.core.is_active());
            }
            Command::GroupIds { reply } => {
                let _ = reply.send(self.core.group_ids());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(self.core.stop());
                return false;
            }
        }
        true
    }
}

/// Cloneable handle to a running [`Scheduler`].
///
/// Every call is queued onto the scheduler task; the async methods resolve
/// once the scheduler has processed the request.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| SchedulerError::Channel("scheduler loop has exited".to_owned()))
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply))?;
        response
            .await
            .map_err(|_| SchedulerError::Channel("scheduler dropped the request".to_owned()))
    }

    /// Register (or replace) the builder for `task_type`.
    pub fn register_task_builder(
        &self,
        task_type: TaskType,
        builder: Box<dyn TaskBuilder>,
    ) -> Result<()> {
        self.send(Command::RegisterBuilder { task_type, builder })
    }

    /// Bind storage to `namespace`. `Ok(false)` while active.
    pub async fn configure_namespace(&self, namespace: impl Into<String>) -> Result<bool> {
        let namespace = namespace.into();
        self.request(|reply| Command::ConfigureNamespace { namespace, reply })
            .await
    }

    /// Adopt a caller-provided store. `Ok(false)` while active.
    pub async fn bind_external_storage(&self, store: Box<dyn KeyValueStore>) -> Result<bool> {
        self.request(|reply| Command::BindStorage { store, reply })
            .await
    }

    /// Restore persisted tasks and start dispatching.
    pub async fn start(&self) -> Result<()> {
        self.request(|reply| Command::Start { reply }).await?
    }

    /// Stop dispatching and persist pending tasks.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await?
    }

    /// Schedule `task` under an explicit group ID.
    pub async fn schedule_task_with_id(
        &self,
        task: Box<dyn UpdateTask>,
        group_id: i32,
    ) -> Result<()> {
        self.request(|reply| Command::Schedule {
            task,
            group_id: Some(group_id),
            reply,
        })
        .await
        .map(|_| ())
    }

    /// Schedule `task` under a freshly allocated group ID.
    pub async fn schedule_task(&self, task: Box<dyn UpdateTask>) -> Result<i32> {
        self.request(|reply| Command::Schedule {
            task,
            group_id: None,
            reply,
        })
        .await
    }

    /// Returns `true` between `start` and `stop`.
    pub async fn is_active(&self) -> Result<bool> {
        self.request(|reply| Command::IsActive { reply }).await
    }

    /// Group IDs of all scheduled entries, in scheduling order.
    pub async fn group_ids(&self) -> Result<Vec<i32>> {
        self.request(|reply| Command::GroupIds { reply }).await
    }

    /// Stop the scheduler and end its loop. Other handles fail afterwards.
    pub async fn shutdown(self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await?
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("closed", &self.command_tx.is_closed())
            .finish()
    }
}
