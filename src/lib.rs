//! Persistent scheduler for recurring update-check tasks.
//!
//! Tasks are opaque [`UpdateTask`] objects identified by a [`TaskType`] and an
//! integer group ID. The scheduler keeps them across process restarts and
//! notifies the consumer whenever one becomes due.
//!
//! # Architecture
//!
//! - **Registry**: maps each [`TaskType`] to the [`TaskBuilder`] that restores it
//! - **Store**: persists the schedule as one array in a grouped key-value store
//! - **Dispatcher**: background tokio task tracking due dates
//! - **Scheduler**: lifecycle state machine tying the above together, driven
//!   from a single owner task through [`SchedulerHandle`]

pub mod app_dirs;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod task;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use registry::BuilderRegistry;
pub use scheduler::{Scheduler, SchedulerCore, SchedulerHandle, TaskReady};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, PersistedEntry};
pub use task::{SharedTask, TaskBuilder, TaskKey, TaskType, UpdateTask};
