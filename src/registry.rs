//! Type-keyed task builder registry.

use crate::task::{TaskBuilder, TaskType, UpdateTask};
use std::collections::HashMap;
use tracing::debug;

/// Maps a [`TaskType`] to the builder that restores tasks of that type.
#[derive(Default)]
pub struct BuilderRegistry {
    builders: HashMap<TaskType, Box<dyn TaskBuilder>>,
}

impl BuilderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `builder` for `task_type`, dropping any builder previously
    /// registered for the same type.
    pub fn register(&mut self, task_type: TaskType, builder: Box<dyn TaskBuilder>) {
        if let Some(old) = self.builders.remove(&task_type) {
            debug!(task_type = %task_type, "replacing task builder");
            drop(old);
        }
        self.builders.insert(task_type, builder);
    }

    /// Rebuild a task of `task_type` from `data`.
    ///
    /// Returns `None` when no builder is registered or the builder rejects
    /// the payload.
    pub fn build(&self, task_type: &TaskType, data: &[u8]) -> Option<Box<dyn UpdateTask>> {
        self.builders.get(task_type)?.build_task(data)
    }

    /// Returns `true` if a builder is registered for `task_type`.
    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.builders.contains_key(task_type)
    }

    /// Number of registered builders.
    pub fn len(&self) -> usize {
        self.builders.len()
    }

    /// Returns `true` when no builder is registered.
    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

impl std::fmt::Debug for BuilderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderRegistry")
            .field("types", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}
