//! Ready-task queue.
//!
//! One queue per scheduler tree entry. The configured policy fixes the
//! order within each priority bucket: FIFO preserves arrival order, LIFO
//! reverses it. When priority is enabled the queue keeps buckets in
//! descending priority order; otherwise every task lands in one bucket.
//!
//! Dequeue always takes the head. Batch extraction takes from the tail —
//! the end opposite to dequeueing — so overflow hands the coldest work to
//! the parent.

use crate::config::SchedulingPolicy;
use crate::task::Task;
use std::collections::VecDeque;
use std::sync::Arc;

struct Entry {
    priority: i64,
    task: Arc<Task>,
}

/// A policy- and priority-aware task queue.
pub struct ReadyQueue {
    entries: VecDeque<Entry>,
    policy: SchedulingPolicy,
    priority_enabled: bool,
}

impl ReadyQueue {
    /// Creates an empty queue with the given discipline.
    #[must_use]
    pub fn new(policy: SchedulingPolicy, priority_enabled: bool) -> Self {
        Self {
            entries: VecDeque::new(),
            policy,
            priority_enabled,
        }
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enqueues a task; returns the new queue size.
    pub fn add(&mut self, task: Arc<Task>) -> usize {
        let priority = if self.priority_enabled {
            task.priority()
        } else {
            0
        };
        let index = match self.policy {
            // FIFO: after the existing tasks of the same priority.
            SchedulingPolicy::Fifo => self
                .entries
                .iter()
                .position(|e| e.priority < priority)
                .unwrap_or(self.entries.len()),
            // LIFO: before the existing tasks of the same priority.
            SchedulingPolicy::Lifo => self
                .entries
                .iter()
                .position(|e| e.priority <= priority)
                .unwrap_or(self.entries.len()),
        };
        self.entries.insert(index, Entry { priority, task });
        self.entries.len()
    }

    /// Enqueues a whole batch, preserving its order.
    pub fn add_batch(&mut self, batch: Vec<Arc<Task>>) -> usize {
        for task in batch {
            self.add(task);
        }
        self.entries.len()
    }

    /// Dequeues the head task.
    pub fn pop(&mut self) -> Option<Arc<Task>> {
        self.entries.pop_front().map(|e| e.task)
    }

    /// Extracts up to `count` tasks from the tail, head-most first within
    /// the returned batch.
    pub fn get_batch(&mut self, count: usize) -> Vec<Arc<Task>> {
        let take = count.min(self.entries.len());
        let start = self.entries.len() - take;
        self.entries.drain(start..).map(|e| e.task).collect()
    }

    /// Drains every queued task.
    pub fn drain_all(&mut self) -> Vec<Arc<Task>> {
        self.entries.drain(..).map(|e| e.task).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskBuilder;

    fn task(priority: i64) -> Arc<Task> {
        TaskBuilder::new().priority(priority).body(|| {}).build()
    }

    fn ids(queue: &mut ReadyQueue) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(t) = queue.pop() {
            out.push(t.id().as_u64());
        }
        out
    }

    #[test]
    fn fifo_preserves_arrival_order() {
        let mut queue = ReadyQueue::new(SchedulingPolicy::Fifo, false);
        let tasks: Vec<_> = (0..5).map(|_| task(0)).collect();
        for t in &tasks {
            queue.add(Arc::clone(t));
        }
        let expected: Vec<_> = tasks.iter().map(|t| t.id().as_u64()).collect();
        assert_eq!(ids(&mut queue), expected);
    }

    #[test]
    fn lifo_reverses_arrival_order() {
        let mut queue = ReadyQueue::new(SchedulingPolicy::Lifo, false);
        let tasks: Vec<_> = (0..5).map(|_| task(0)).collect();
        for t in &tasks {
            queue.add(Arc::clone(t));
        }
        let mut expected: Vec<_> = tasks.iter().map(|t| t.id().as_u64()).collect();
        expected.reverse();
        assert_eq!(ids(&mut queue), expected);
    }

    #[test]
    fn priority_beats_arrival_order() {
        let mut queue = ReadyQueue::new(SchedulingPolicy::Fifo, true);
        let low = task(1);
        let high = task(10);
        let mid = task(5);
        queue.add(Arc::clone(&low));
        queue.add(Arc::clone(&high));
        queue.add(Arc::clone(&mid));
        assert_eq!(
            ids(&mut queue),
            vec![
                high.id().as_u64(),
                mid.id().as_u64(),
                low.id().as_u64()
            ]
        );
    }

    #[test]
    fn equal_priority_bucket_follows_policy() {
        let mut queue = ReadyQueue::new(SchedulingPolicy::Fifo, true);
        let a = task(5);
        let b = task(5);
        queue.add(Arc::clone(&a));
        queue.add(Arc::clone(&b));
        assert_eq!(ids(&mut queue), vec![a.id().as_u64(), b.id().as_u64()]);

        let mut queue = ReadyQueue::new(SchedulingPolicy::Lifo, true);
        queue.add(Arc::clone(&a));
        queue.add(Arc::clone(&b));
        assert_eq!(ids(&mut queue), vec![b.id().as_u64(), a.id().as_u64()]);
    }

    #[test]
    fn batch_takes_from_the_tail() {
        let mut queue = ReadyQueue::new(SchedulingPolicy::Fifo, false);
        let tasks: Vec<_> = (0..6).map(|_| task(0)).collect();
        for t in &tasks {
            queue.add(Arc::clone(t));
        }
        let batch = queue.get_batch(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id(), tasks[4].id());
        assert_eq!(batch[1].id(), tasks[5].id());
        // Head is untouched.
        assert_eq!(queue.pop().unwrap().id(), tasks[0].id());
    }

    #[test]
    fn batch_larger_than_queue_drains_it() {
        let mut queue = ReadyQueue::new(SchedulingPolicy::Fifo, false);
        queue.add(task(0));
        let batch = queue.get_batch(10);
        assert_eq!(batch.len(), 1);
        assert!(queue.is_empty());
    }
}
