//! Polling slot: single-task producer-to-consumer handoff.
//!
//! Each leaf owns one slot. A producer that cannot hand a task to the
//! consumer directly enqueues instead; the consumer always checks the
//! slot before its queue, so handoff wins over queued work.

use crate::task::Task;
use parking_lot::Mutex;
use std::sync::Arc;

/// A single-task handoff cell.
#[derive(Default)]
pub struct PollingSlot {
    task: Mutex<Option<Arc<Task>>>,
}

impl PollingSlot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to place a task. On failure (slot already full) the task
    /// is handed back.
    pub fn try_set(&self, task: Arc<Task>) -> Result<(), Arc<Task>> {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return Err(task);
        }
        *slot = Some(task);
        Ok(())
    }

    /// Takes the task, if any.
    pub fn take(&self) -> Option<Arc<Task>> {
        self.task.lock().take()
    }

    /// Whether the slot currently holds a task.
    #[must_use]
    pub fn is_occupied(&self) -> bool {
        self.task.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskBuilder;

    #[test]
    fn second_set_fails_and_returns_the_task() {
        let slot = PollingSlot::new();
        let a = TaskBuilder::new().body(|| {}).build();
        let b = TaskBuilder::new().body(|| {}).build();
        assert!(slot.try_set(Arc::clone(&a)).is_ok());
        let rejected = slot.try_set(Arc::clone(&b)).unwrap_err();
        assert_eq!(rejected.id(), b.id());
        assert_eq!(slot.take().unwrap().id(), a.id());
        assert!(slot.take().is_none());
    }

    #[test]
    fn take_empties_the_slot() {
        let slot = PollingSlot::new();
        let a = TaskBuilder::new().body(|| {}).build();
        slot.try_set(a).unwrap();
        assert!(slot.is_occupied());
        let _ = slot.take();
        assert!(!slot.is_occupied());
    }
}
