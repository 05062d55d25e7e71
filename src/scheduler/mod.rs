//! Update-check task scheduler.
//!
//! [`SchedulerCore`] is the lifecycle state machine; [`Scheduler`] runs it on
//! a background tokio task and hands out [`SchedulerHandle`]s. Built-in task
//! types live in [`tasks`].

pub mod lifecycle;
pub mod runner;
pub mod tasks;

pub use lifecycle::{SchedulerCore, TaskReady};
pub use runner::{Scheduler, SchedulerHandle};
pub use tasks::{LoopUpdateTask, Repeat, TimePointUpdateTask, UpdateTaskList, builtin_builders};
