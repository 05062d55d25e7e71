//! Task capabilities and identities.
//!
//! A task is an opaque unit of schedulable work. The scheduler only needs to
//! know its [`TaskType`], how to serialize it, and when it is next due. Tasks
//! are rebuilt from their serialized payload by a [`TaskBuilder`] registered
//! for the same type.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Identity of a task implementation.
///
/// Built from a tag string chosen by the implementation. The hash is derived
/// from the tag with blake3, so equal tags give equal identities in every
/// process run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskType {
    /// 64-bit digest of [`name`](Self::name).
    pub hash: u64,
    /// Tag chosen by the task implementation.
    pub name: String,
}

impl TaskType {
    /// Create the identity for the given tag.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            hash: tag_hash(&name),
            name,
        }
    }

    /// Rebuild an identity from persisted parts.
    ///
    /// No check is made that `hash` matches `name`; a mismatch simply never
    /// finds a builder.
    pub fn from_parts(hash: u64, name: impl Into<String>) -> Self {
        Self {
            hash,
            name: name.into(),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:016x}", self.name, self.hash)
    }
}

fn tag_hash(name: &str) -> u64 {
    let digest = blake3::hash(name.as_bytes());
    let mut head = [0_u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

/// A schedulable unit of work.
pub trait UpdateTask: Send {
    /// Stable identity of the concrete task type.
    fn task_type(&self) -> TaskType;

    /// Serialize the task so its builder can restore it later.
    fn store(&self) -> Vec<u8>;

    /// Next moment this task is due, or `None` once it is exhausted.
    fn current_due(&self) -> Option<DateTime<Utc>>;

    /// Consume the current due point and move to the next one.
    fn advance(&mut self);

    /// Returns `true` while the task still has due points left.
    fn has_pending_work(&self) -> bool {
        self.current_due().is_some()
    }
}

/// Reconstructs tasks of one type from serialized bytes.
pub trait TaskBuilder: Send {
    /// Build a task from its payload. `None` means the payload is unusable.
    fn build_task(&self, data: &[u8]) -> Option<Box<dyn UpdateTask>>;
}

/// Process-unique handle for one scheduled task instance.
///
/// Used to match dispatcher events back to scheduler entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey(u64);

impl TaskKey {
    /// Allocate the next key.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A task shared between the scheduler and the dispatcher.
///
/// The scheduler owns the entry; the dispatcher only holds a clone while it
/// tracks due dates, so the task outlives every dispatcher reference.
#[derive(Clone)]
pub struct SharedTask {
    key: TaskKey,
    inner: Arc<Mutex<Box<dyn UpdateTask>>>,
}

impl SharedTask {
    /// Wrap a task under a freshly allocated key.
    pub fn new(task: Box<dyn UpdateTask>) -> Self {
        Self {
            key: TaskKey::next(),
            inner: Arc::new(Mutex::new(task)),
        }
    }

    /// Key identifying this task instance.
    pub fn key(&self) -> TaskKey {
        self.key
    }

    /// Lock the task for reading or advancing.
    ///
    /// A poisoned lock is recovered; tasks hold no invariants a panic could
    /// break halfway.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn UpdateTask>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of live references (scheduler entry plus dispatcher clones).
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for SharedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTask")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Minimal tasks used by unit tests across the crate.

    use super::*;
    use std::sync::atomic::AtomicUsize;

    pub(crate) const COUNTING_TAG: &str = "counting_task";

    /// Task due `remaining` more times, starting now; payload is a label plus
    /// the remaining count.
    #[derive(Debug, Clone)]
    pub(crate) struct CountingTask {
        pub label: String,
        pub remaining: u32,
        pub due: DateTime<Utc>,
    }

    impl CountingTask {
        pub(crate) fn new(label: &str, remaining: u32) -> Self {
            Self {
                label: label.to_owned(),
                remaining,
                due: Utc::now(),
            }
        }
    }

    impl UpdateTask for CountingTask {
        fn task_type(&self) -> TaskType {
            TaskType::new(COUNTING_TAG)
        }

        fn store(&self) -> Vec<u8> {
            format!("{}:{}", self.label, self.remaining).into_bytes()
        }

        fn current_due(&self) -> Option<DateTime<Utc>> {
            (self.remaining > 0).then_some(self.due)
        }

        fn advance(&mut self) {
            self.remaining = self.remaining.saturating_sub(1);
        }
    }

    /// Builder for [`CountingTask`] that counts how many tasks it built and
    /// how many times it was dropped.
    pub(crate) struct CountingBuilder {
        pub built: Arc<AtomicUsize>,
        pub dropped: Arc<AtomicUsize>,
        pub prefix: &'static str,
    }

    impl CountingBuilder {
        pub(crate) fn new(prefix: &'static str) -> Self {
            Self {
                built: Arc::new(AtomicUsize::new(0)),
                dropped: Arc::new(AtomicUsize::new(0)),
                prefix,
            }
        }
    }

    impl TaskBuilder for CountingBuilder {
        fn build_task(&self, data: &[u8]) -> Option<Box<dyn UpdateTask>> {
            let text = std::str::from_utf8(data).ok()?;
            let (label, remaining) = text.rsplit_once(':')?;
            let remaining = remaining.parse().ok()?;
            self.built.fetch_add(1, Ordering::SeqCst);
            Some(Box::new(CountingTask {
                label: format!("{}{label}", self.prefix),
                remaining,
                due: Utc::now(),
            }))
        }
    }

    impl Drop for CountingBuilder {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }
}
