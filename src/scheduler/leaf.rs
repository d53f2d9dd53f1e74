//! Per-CPU leaf of the scheduler tree.

use crate::scheduler::node::NodeScheduler;
use crate::scheduler::queue::ReadyQueue;
use crate::scheduler::slot::PollingSlot;
use crate::scheduler::{ReadyTaskHint, TreeContext};
use crate::hardware::Cpu;
use crate::task::Task;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Leaf scheduler: one queue, one polling slot, one idle flag.
///
/// The `global_lock` covers the polling slot and the idle flag together,
/// so a producer observing "slot set succeeded while idle" can wake the
/// worker without racing the worker's own idle transition.
pub struct LeafScheduler {
    ctx: Arc<TreeContext>,
    /// The CPU this leaf feeds; `None` for device-tree leaves, which have
    /// no worker to park or wake.
    cpu: Option<Arc<Cpu>>,
    parent: Arc<NodeScheduler>,
    child_index: AtomicUsize,

    queue: Mutex<ReadyQueue>,
    slot: PollingSlot,
    idle: AtomicBool,
    queue_threshold: AtomicUsize,
    rebalance: AtomicBool,

    global_lock: Mutex<()>,
}

impl LeafScheduler {
    /// Creates a leaf and registers it with its parent.
    pub fn new(
        ctx: Arc<TreeContext>,
        cpu: Option<Arc<Cpu>>,
        parent: &Arc<NodeScheduler>,
        queue_threshold: usize,
    ) -> Arc<Self> {
        let leaf = Arc::new(Self {
            queue: Mutex::new(ReadyQueue::new(ctx.policy, ctx.priority_enabled)),
            ctx,
            cpu,
            parent: Arc::clone(parent),
            child_index: AtomicUsize::new(usize::MAX),
            slot: PollingSlot::new(),
            idle: AtomicBool::new(false),
            queue_threshold: AtomicUsize::new(queue_threshold),
            rebalance: AtomicBool::new(false),
            global_lock: Mutex::new(()),
        });
        let index = parent.set_child(super::node::SchedulerChild::Leaf(Arc::clone(&leaf)));
        leaf.child_index.store(index, Ordering::Release);
        leaf
    }

    /// The CPU this leaf feeds, if any.
    #[must_use]
    pub fn cpu(&self) -> Option<&Arc<Cpu>> {
        self.cpu.as_ref()
    }

    /// Index of this leaf within its parent.
    #[must_use]
    pub fn child_index(&self) -> usize {
        self.child_index.load(Ordering::Acquire)
    }

    /// Whether the leaf is currently marked idle.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Current queue population (diagnostics and tests).
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the polling slot holds a task (diagnostics and tests).
    #[must_use]
    pub fn slot_occupied(&self) -> bool {
        self.slot.is_occupied()
    }

    fn handle_queue_overflow(&self) {
        let threshold = self.queue_threshold.load(Ordering::Acquire);
        let take = (threshold / 2).max(1);
        let batch = self.queue.lock().get_batch(take);
        // The queue might have been emptied a moment ago.
        if !batch.is_empty() {
            self.parent.add_task_batch(Some(self.child_index()), batch);
        }
    }

    /// Adds a ready task.
    ///
    /// With `has_compute_place`, the submitter runs on this leaf's own
    /// CPU: the task goes straight to the local queue and no one needs
    /// waking. Otherwise the polling slot is tried first; a full slot
    /// falls back to the queue.
    pub fn add_task(&self, task: Arc<Task>, has_compute_place: bool, _hint: ReadyTaskHint) {
        if has_compute_place {
            // The submitter runs on this CPU. An idle mark can still be
            // set when the worker's last pull bypassed the leaf (successor
            // slot, unblocked queue); it is stale, clear it.
            if self.idle.swap(false, Ordering::AcqRel) {
                if let Some(cpu) = &self.cpu {
                    self.ctx.registry.unidle_cpu(cpu);
                }
            }
            let elements = self.queue.lock().add(task);
            if elements > self.queue_threshold.load(Ordering::Acquire) {
                self.handle_queue_overflow();
            }
        } else {
            let (placed, was_idle) = {
                let _guard = self.global_lock.lock();
                let placed = self.slot.try_set(task);
                (placed, self.idle.load(Ordering::Acquire))
            };
            match placed {
                Ok(()) => {
                    if was_idle {
                        if let Some(cpu) = &self.cpu {
                            self.ctx.resume_idle(cpu);
                        }
                    }
                }
                Err(task) => {
                    let elements = self.queue.lock().add(task);
                    if elements > self.queue_threshold.load(Ordering::Acquire) {
                        self.handle_queue_overflow();
                    }
                }
            }
        }

        // Queue is balanced now.
        self.rebalance.store(false, Ordering::Release);
    }

    /// Receives a batch from the parent: the tail task goes into the
    /// polling slot when free, the rest into the queue.
    pub fn add_task_batch(&self, mut batch: Vec<Arc<Task>>) {
        debug_assert!(!batch.is_empty());

        if let Some(tail) = batch.last().cloned() {
            let (placed, was_idle) = {
                let _guard = self.global_lock.lock();
                let placed = self.slot.try_set(tail);
                (placed.is_ok(), self.idle.load(Ordering::Acquire))
            };
            if placed {
                batch.pop();
                if was_idle {
                    if let Some(cpu) = &self.cpu {
                        self.ctx.resume_idle(cpu);
                    }
                }
            }
        }

        if !batch.is_empty() {
            self.queue.lock().add_batch(batch);
        }
    }

    /// Pulls a task for this leaf's consumer.
    ///
    /// With `do_wait`, busy-polls the slot up to the configured iteration
    /// budget after asking the parent; a budget of zero skips the wait
    /// entirely. Returns `None` only after marking the leaf idle under the
    /// lock, with a final slot recheck.
    pub fn get_task(&self, do_wait: bool) -> Option<Arc<Task>> {
        if self.idle.swap(false, Ordering::AcqRel) {
            if let Some(cpu) = &self.cpu {
                self.ctx.registry.unidle_cpu(cpu);
            }
        }

        if let Some(task) = self.slot.take() {
            self.rebalance.store(false, Ordering::Release);
            return Some(task);
        }

        let popped = self.queue.lock().pop();
        if let Some(task) = popped {
            if self
                .rebalance
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let threshold = self.queue_threshold.load(Ordering::Acquire);
                if self.queue.lock().len() * 2 > threshold * 3 {
                    self.handle_queue_overflow();
                }
            }
            return Some(task);
        }

        self.rebalance.store(false, Ordering::Release);

        self.parent.get_task_for_child(self.child_index());

        if do_wait {
            let budget = self.ctx.polling_iterations;
            for _ in 0..budget {
                if let Some(task) = self.slot.take() {
                    return Some(task);
                }
            }
        } else if let Some(task) = self.slot.take() {
            return Some(task);
        }

        // Timed out: mark idle, rechecking the slot under the lock.
        let _guard = self.global_lock.lock();
        if let Some(task) = self.slot.take() {
            return Some(task);
        }
        self.idle.store(true, Ordering::Release);
        if let Some(cpu) = &self.cpu {
            self.ctx.registry.cpu_becomes_idle(cpu);
        }
        None
    }

    /// Decommissions the leaf: drains queue and slot to the parent.
    pub fn disable(&self) {
        if self.idle.swap(false, Ordering::AcqRel) {
            self.parent.unidle_child(self.child_index());
            if let Some(cpu) = &self.cpu {
                self.ctx.registry.unidle_cpu(cpu);
            }
        }

        let mut batch = self.queue.lock().drain_all();
        if let Some(task) = self.slot.take() {
            // A task may arrive in the slot before the parent learns the
            // leaf is gone.
            batch.push(task);
        }

        if !batch.is_empty() {
            self.parent.add_task_batch(Some(self.child_index()), batch);
        }
    }

    /// Re-enables a previously disabled leaf.
    pub fn enable(&self) {}

    /// Updates the overflow threshold; shrinking arms a rebalance on the
    /// next successful dequeue.
    pub fn update_queue_threshold(&self, threshold: usize) {
        if threshold < self.queue_threshold.load(Ordering::Acquire) {
            self.rebalance.store(true, Ordering::Release);
        }
        self.queue_threshold.store(threshold, Ordering::Release);
    }
}
