//! Interior node of the scheduler tree.
//!
//! Nodes store whole batches: a leaf that overflows pushes a batch up,
//! and a leaf that runs dry asks downward-flowing batches back. The idle
//! bitmap remembers which children asked and got nothing, so the next
//! batch that arrives is handed straight down to one of them (bit order,
//! lowest index first).

use crate::scheduler::leaf::LeafScheduler;
use crate::scheduler::TreeContext;
use crate::task::Task;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A child entry of a node: either a per-CPU leaf or a nested node.
#[derive(Clone)]
pub enum SchedulerChild {
    /// A per-CPU (or per-device-place) leaf.
    Leaf(Arc<LeafScheduler>),
    /// A nested interior node.
    Node(Arc<NodeScheduler>),
}

impl SchedulerChild {
    fn receive_batch(&self, batch: Vec<Arc<Task>>) {
        match self {
            Self::Leaf(leaf) => leaf.add_task_batch(batch),
            Self::Node(node) => node.add_task_batch(None, batch),
        }
    }
}

/// Interior scheduler node.
pub struct NodeScheduler {
    #[allow(dead_code)]
    ctx: Arc<TreeContext>,
    /// Upward link; `None` at the root. Parents own their children, so the
    /// back-reference is weak.
    parent: Weak<NodeScheduler>,
    index_in_parent: AtomicUsize,

    children: Mutex<Vec<SchedulerChild>>,
    idle_children: Mutex<Vec<bool>>,
    batches: Mutex<VecDeque<Vec<Arc<Task>>>>,
}

impl NodeScheduler {
    /// Creates a root node.
    #[must_use]
    pub fn new_root(ctx: Arc<TreeContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            parent: Weak::new(),
            index_in_parent: AtomicUsize::new(usize::MAX),
            children: Mutex::new(Vec::new()),
            idle_children: Mutex::new(Vec::new()),
            batches: Mutex::new(VecDeque::new()),
        })
    }

    /// Creates a node under `parent` and registers it there.
    pub fn new_child(ctx: Arc<TreeContext>, parent: &Arc<NodeScheduler>) -> Arc<Self> {
        let node = Arc::new(Self {
            ctx,
            parent: Arc::downgrade(parent),
            index_in_parent: AtomicUsize::new(usize::MAX),
            children: Mutex::new(Vec::new()),
            idle_children: Mutex::new(Vec::new()),
            batches: Mutex::new(VecDeque::new()),
        });
        let index = parent.set_child(SchedulerChild::Node(Arc::clone(&node)));
        node.index_in_parent.store(index, Ordering::Release);
        node
    }

    /// Registers a child; returns its index.
    pub fn set_child(&self, child: SchedulerChild) -> usize {
        let mut children = self.children.lock();
        children.push(child);
        self.idle_children.lock().push(false);
        children.len() - 1
    }

    /// Number of registered children.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    /// Number of batches parked at this node (diagnostics and tests).
    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    /// Clears a child's idle mark.
    pub fn unidle_child(&self, index: usize) {
        let mut idle = self.idle_children.lock();
        if let Some(bit) = idle.get_mut(index) {
            *bit = false;
        }
    }

    /// Accepts a batch from a child (overflow) or from the parent
    /// (downward redistribution). Prefers handing it to an idle child in
    /// bit order, excluding the sender; otherwise parks it here.
    pub fn add_task_batch(&self, sender: Option<usize>, batch: Vec<Arc<Task>>) {
        debug_assert!(!batch.is_empty());

        let target = {
            let mut idle = self.idle_children.lock();
            let found = idle
                .iter()
                .enumerate()
                .position(|(i, is_idle)| *is_idle && Some(i) != sender);
            if let Some(index) = found {
                idle[index] = false;
            }
            found
        };

        match target {
            Some(index) => {
                let child = self.children.lock()[index].clone();
                child.receive_batch(batch);
            }
            None => self.batches.lock().push_back(batch),
        }
    }

    /// Serves a requesting child: hands it a parked batch if one exists,
    /// otherwise marks it idle and forwards the request upward.
    pub fn get_task_for_child(&self, child_index: usize) {
        let batch = self.batches.lock().pop_front();
        if let Some(batch) = batch {
            let child = self.children.lock()[child_index].clone();
            child.receive_batch(batch);
            return;
        }

        {
            let mut idle = self.idle_children.lock();
            if let Some(bit) = idle.get_mut(child_index) {
                *bit = true;
            }
        }

        if let Some(parent) = self.parent.upgrade() {
            parent.get_task_for_child(self.index_in_parent.load(Ordering::Acquire));
        }
    }
}
