//! Hierarchical ready-task scheduler.
//!
//! Two kinds of trees run in parallel: one host tree whose leaves feed the
//! CPU workers, and one tree per enabled device kind (cuda, opencl,
//! cluster). The facade routes `add_ready_task` by the task's target
//! compute-place type.
//!
//! Within a tree, work flows down through polling slots and batches:
//! producers hand single tasks to consumers through a leaf's slot, leaves
//! that overflow push batches to their parent, and parents hand batches
//! back to whichever child asked and found nothing (tracked in an idle
//! bitmap).

pub mod leaf;
pub mod node;
pub mod queue;
pub mod slot;

pub use leaf::LeafScheduler;
pub use node::{NodeScheduler, SchedulerChild};
pub use queue::ReadyQueue;
pub use slot::PollingSlot;

use crate::config::{RuntimeConfig, SchedulingPolicy};
use crate::hardware::{Cpu, CpuRegistry};
use crate::places::{ComputePlace, Device};
use crate::task::Task;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Placement hint attached to a ready-task submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyTaskHint {
    /// No placement preference.
    #[default]
    None,
    /// The task is a child of the submitting task.
    Child,
    /// The task is a sibling unblocked by the submitter's release.
    Sibling,
    /// The task is waking from a taskwait.
    Unblocked,
}

/// Wakes parked workers. Implemented by the worker pool; the scheduler
/// only holds a weak handle so tree and pool can own each other's callers
/// without a reference cycle.
pub trait IdleWake: Send + Sync {
    /// Resumes an idle worker on (or migrated to) `cpu`.
    fn resume_idle(&self, cpu: &Arc<Cpu>);
}

/// Shared context of one scheduler instance's trees.
pub struct TreeContext {
    pub(crate) registry: Arc<CpuRegistry>,
    pub(crate) policy: SchedulingPolicy,
    pub(crate) priority_enabled: bool,
    pub(crate) polling_iterations: u32,
    wake: OnceLock<Weak<dyn IdleWake>>,
}

impl TreeContext {
    pub(crate) fn resume_idle(&self, cpu: &Arc<Cpu>) {
        if let Some(waker) = self.wake.get().and_then(Weak::upgrade) {
            waker.resume_idle(cpu);
        }
    }
}

struct DeviceTree {
    #[allow(dead_code)]
    root: Arc<NodeScheduler>,
    leaves: Vec<Arc<LeafScheduler>>,
}

impl DeviceTree {
    fn build(
        ctx: &Arc<TreeContext>,
        cpus: &[Option<Arc<Cpu>>],
        queue_threshold: usize,
    ) -> Self {
        let root = NodeScheduler::new_root(Arc::clone(ctx));
        let leaves = cpus
            .iter()
            .map(|cpu| LeafScheduler::new(Arc::clone(ctx), cpu.clone(), &root, queue_threshold))
            .collect();
        Self { root, leaves }
    }
}

/// Scheduler facade: host tree plus one tree per enabled device kind.
pub struct Scheduler {
    ctx: Arc<TreeContext>,
    immediate_successor_enabled: bool,

    host: DeviceTree,
    cuda: Option<DeviceTree>,
    opencl: Option<DeviceTree>,
    cluster: Option<DeviceTree>,

    /// Tasks waking from a taskwait; they outrank fresh ready tasks.
    unblocked: SegQueue<Arc<Task>>,
    /// Per-CPU successor fast-path slot.
    immediate_successor: Vec<Mutex<Option<Arc<Task>>>>,
    round_robin: AtomicUsize,
}

impl Scheduler {
    /// Builds the scheduler trees for the registered CPUs and the given
    /// per-device place counts.
    #[must_use]
    pub fn new(
        config: &RuntimeConfig,
        registry: Arc<CpuRegistry>,
        device_places: &[(Device, usize)],
    ) -> Arc<Self> {
        let ctx = Arc::new(TreeContext {
            registry: Arc::clone(&registry),
            policy: config.scheduling_policy,
            priority_enabled: config.priority,
            polling_iterations: config.polling_iterations,
            wake: OnceLock::new(),
        });

        let threshold = config.effective_queue_threshold(registry.total_cpus());
        let host_cpus: Vec<Option<Arc<Cpu>>> =
            registry.cpus().iter().cloned().map(Some).collect();
        let host = DeviceTree::build(&ctx, &host_cpus, threshold);

        let mut cuda = None;
        let mut opencl = None;
        let mut cluster = None;
        for &(device, count) in device_places {
            if count == 0 {
                continue;
            }
            let places: Vec<Option<Arc<Cpu>>> = vec![None; count];
            let tree = DeviceTree::build(&ctx, &places, threshold);
            match device {
                Device::Cuda => cuda = Some(tree),
                Device::OpenCl => opencl = Some(tree),
                Device::Cluster => cluster = Some(tree),
                Device::Host => {}
            }
        }

        let immediate_successor = (0..registry.total_cpus())
            .map(|_| Mutex::new(None))
            .collect();

        Arc::new(Self {
            ctx,
            immediate_successor_enabled: config.immediate_successor,
            host,
            cuda,
            opencl,
            cluster,
            unblocked: SegQueue::new(),
            immediate_successor,
            round_robin: AtomicUsize::new(0),
        })
    }

    /// Installs the worker-wake handle. Called once during runtime
    /// initialization.
    pub fn attach_waker(&self, waker: Weak<dyn IdleWake>) {
        let _ = self.ctx.wake.set(waker);
    }

    fn tree_for(&self, device: Device) -> Option<&DeviceTree> {
        match device {
            Device::Host => Some(&self.host),
            Device::Cuda => self.cuda.as_ref(),
            Device::OpenCl => self.opencl.as_ref(),
            Device::Cluster => self.cluster.as_ref(),
        }
    }

    /// Host leaf for a CPU (tests and diagnostics).
    #[must_use]
    pub fn host_leaf(&self, virtual_cpu: u32) -> &Arc<LeafScheduler> {
        &self.host.leaves[virtual_cpu as usize]
    }

    /// Submits a ready task, routed by its target compute-place type.
    ///
    /// Returns a compute place whose worker the caller should resume, if
    /// the submission left an idle CPU that the add path did not wake
    /// itself.
    pub fn add_ready_task(
        &self,
        task: Arc<Task>,
        origin: Option<ComputePlace>,
        hint: ReadyTaskHint,
    ) -> Option<ComputePlace> {
        let target = task.target().unwrap_or_else(|| ComputePlace::host(0));
        crate::instrument::backend().task_submitted(task.id(), target);

        match target.kind() {
            Device::Host => self.add_host_task(task, origin, hint),
            Device::Cuda | Device::OpenCl | Device::Cluster => {
                let tree = self
                    .tree_for(target.kind())
                    .expect("task targets a device with no scheduler tree");
                let index = (target.index() as usize) % tree.leaves.len();
                tree.leaves[index].add_task(task, false, hint);
                None
            }
        }
    }

    fn add_host_task(
        &self,
        task: Arc<Task>,
        origin: Option<ComputePlace>,
        hint: ReadyTaskHint,
    ) -> Option<ComputePlace> {
        if hint == ReadyTaskHint::Unblocked {
            self.unblocked.push(task);
            return self.ctx.registry.get_idle_compute_place(false);
        }

        let origin_cpu = origin.filter(|o| o.kind() == Device::Host);

        // Successor fast-path: the releasing CPU keeps the task it just
        // unblocked. A displaced previous occupant joins the local queue.
        if self.immediate_successor_enabled && hint == ReadyTaskHint::Sibling {
            if let Some(origin) = origin_cpu {
                let slot = &self.immediate_successor[origin.index() as usize];
                let displaced = slot.lock().replace(task);
                if let Some(displaced) = displaced {
                    self.host.leaves[origin.index() as usize].add_task(
                        displaced,
                        true,
                        ReadyTaskHint::None,
                    );
                }
                return None;
            }
        }

        match origin_cpu {
            Some(origin) => {
                self.host.leaves[origin.index() as usize].add_task(task, true, hint);
                None
            }
            None => {
                let index = self.round_robin.fetch_add(1, Ordering::Relaxed)
                    % self.host.leaves.len();
                self.host.leaves[index].add_task(task, false, hint);
                self.ctx.registry.get_idle_compute_place(false)
            }
        }
    }

    /// Submits a ready task and resumes a worker for it when the
    /// submission reports an idle compute place. Internal paths (copy
    /// completion, satisfiability flushes) use this so no wake-up is lost.
    pub fn add_ready_task_and_wake(
        &self,
        task: Arc<Task>,
        origin: Option<ComputePlace>,
        hint: ReadyTaskHint,
    ) {
        if let Some(place) = self.add_ready_task(task, origin, hint) {
            let cpu = Arc::clone(self.ctx.registry.cpu(place.index()));
            self.ctx.resume_idle(&cpu);
        }
    }

    /// Whether work is already visible for this CPU (successor slot,
    /// unblocked queue, or its leaf). Workers recheck this after joining
    /// the idle deque so a submission racing the park is not lost.
    #[must_use]
    pub fn has_local_work(&self, cpu: &Arc<Cpu>) -> bool {
        if self.immediate_successor[cpu.virtual_id() as usize]
            .lock()
            .is_some()
        {
            return true;
        }
        if !self.unblocked.is_empty() {
            return true;
        }
        let leaf = &self.host.leaves[cpu.virtual_id() as usize];
        leaf.slot_occupied() || leaf.queue_len() > 0
    }

    /// Re-admits a task waking from a taskwait. Unblocked tasks outrank
    /// fresh ready tasks on every CPU.
    pub fn task_gets_unblocked(&self, task: Arc<Task>, _origin: Option<ComputePlace>) {
        self.unblocked.push(task);
        if let Some(place) = self.ctx.registry.get_idle_compute_place(false) {
            let cpu = Arc::clone(self.ctx.registry.cpu(place.index()));
            self.ctx.resume_idle(&cpu);
        }
    }

    /// Pulls the next task for a CPU worker. May busy-poll up to the
    /// configured budget before giving up.
    pub fn get_ready_task(&self, cpu: &Arc<Cpu>) -> Option<Arc<Task>> {
        let slot = &self.immediate_successor[cpu.virtual_id() as usize];
        if let Some(task) = slot.lock().take() {
            return Some(task);
        }
        if let Some(task) = self.unblocked.pop() {
            return Some(task);
        }
        self.host.leaves[cpu.virtual_id() as usize].get_task(true)
    }

    /// Pulls the next task for a device place, without waiting.
    pub fn get_ready_device_task(&self, device: Device, index: u32) -> Option<Arc<Task>> {
        let tree = self.tree_for(device)?;
        let leaf = tree.leaves.get(index as usize)?;
        leaf.get_task(false)
    }

    /// Pops an idle compute place from the registry.
    #[must_use]
    pub fn get_idle_compute_place(&self, force: bool) -> Option<ComputePlace> {
        self.ctx.registry.get_idle_compute_place(force)
    }

    /// Takes a CPU out of service: drains its leaf into the parent.
    pub fn disable_cpu(&self, cpu: &Arc<Cpu>) {
        self.host.leaves[cpu.virtual_id() as usize].disable();
        cpu.set_state(crate::hardware::CpuState::Disabled);
    }

    /// Returns a disabled CPU to service.
    pub fn enable_cpu(&self, cpu: &Arc<Cpu>) {
        cpu.set_state(crate::hardware::CpuState::Active);
        self.host.leaves[cpu.virtual_id() as usize].enable();
    }

    /// Updates the overflow threshold on every host leaf.
    pub fn update_queue_threshold(&self, threshold: usize) {
        for leaf in &self.host.leaves {
            leaf.update_queue_threshold(threshold);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskBuilder;

    fn test_config(threshold: usize, polling: u32) -> RuntimeConfig {
        RuntimeConfig {
            queue_threshold: threshold,
            polling_iterations: polling,
            priority: false,
            ..RuntimeConfig::default()
        }
    }

    fn scheduler(cpus: usize, threshold: usize) -> Arc<Scheduler> {
        let registry = Arc::new(CpuRegistry::new_for_test(cpus));
        Scheduler::new(&test_config(threshold, 0), registry, &[])
    }

    fn task() -> Arc<Task> {
        TaskBuilder::new().body(|| {}).build()
    }

    fn host_task() -> Arc<Task> {
        let t = task();
        t.set_target(ComputePlace::host(0));
        t
    }

    #[test]
    fn local_add_then_get_roundtrip() {
        let sched = scheduler(1, 8);
        let cpu = Arc::clone(sched.ctx.registry.cpu(0));
        let t = host_task();
        sched.add_ready_task(Arc::clone(&t), Some(cpu.compute_place()), ReadyTaskHint::None);
        let got = sched.get_ready_task(&cpu).unwrap();
        assert_eq!(got.id(), t.id());
    }

    #[test]
    fn slot_handoff_wins_over_queue() {
        let sched = scheduler(1, 16);
        let leaf = sched.host_leaf(0);
        let queued = task();
        let slotted = task();
        // Local add goes to the queue; remote add takes the free slot.
        leaf.add_task(Arc::clone(&queued), true, ReadyTaskHint::None);
        leaf.add_task(Arc::clone(&slotted), false, ReadyTaskHint::None);
        assert!(leaf.slot_occupied());
        assert_eq!(leaf.get_task(false).unwrap().id(), slotted.id());
        assert_eq!(leaf.get_task(false).unwrap().id(), queued.id());
    }

    #[test]
    fn no_overflow_exactly_at_threshold() {
        let sched = scheduler(1, 4);
        let leaf = sched.host_leaf(0);
        for _ in 0..4 {
            leaf.add_task(task(), true, ReadyTaskHint::None);
        }
        assert_eq!(leaf.queue_len(), 4);
        assert_eq!(sched.host.root.batch_count(), 0);
    }

    #[test]
    fn overflow_at_threshold_plus_one_moves_half() {
        let sched = scheduler(1, 4);
        let leaf = sched.host_leaf(0);
        for _ in 0..5 {
            leaf.add_task(task(), true, ReadyTaskHint::None);
        }
        // threshold/2 = 2 moved to the parent.
        assert_eq!(leaf.queue_len(), 3);
        assert_eq!(sched.host.root.batch_count(), 1);
    }

    #[test]
    fn overflow_with_threshold_one_moves_at_least_one() {
        let sched = scheduler(1, 1);
        let leaf = sched.host_leaf(0);
        leaf.add_task(task(), true, ReadyTaskHint::None);
        leaf.add_task(task(), true, ReadyTaskHint::None);
        assert!(leaf.queue_len() <= 1);
        assert!(sched.host.root.batch_count() >= 1);
    }

    #[test]
    fn overflow_keeps_local_head_order() {
        let sched = scheduler(1, 4);
        let leaf = sched.host_leaf(0);
        let tasks: Vec<_> = (0..10).map(|_| task()).collect();
        for t in &tasks {
            leaf.add_task(Arc::clone(t), true, ReadyTaskHint::None);
        }
        // Oldest task is still first locally.
        assert_eq!(leaf.get_task(false).unwrap().id(), tasks[0].id());
    }

    #[test]
    fn batch_from_parent_fills_slot_with_tail() {
        let sched = scheduler(1, 8);
        let leaf = sched.host_leaf(0);
        let tasks: Vec<_> = (0..3).map(|_| task()).collect();
        leaf.add_task_batch(tasks.clone());
        assert!(leaf.slot_occupied());
        // Slot holds the tail; the queue holds the rest in order.
        assert_eq!(leaf.get_task(false).unwrap().id(), tasks[2].id());
        assert_eq!(leaf.get_task(false).unwrap().id(), tasks[0].id());
        assert_eq!(leaf.get_task(false).unwrap().id(), tasks[1].id());
    }

    #[test]
    fn empty_leaf_marks_idle_and_unidles_on_next_get() {
        let sched = scheduler(1, 4);
        let cpu = Arc::clone(sched.ctx.registry.cpu(0));
        let leaf = sched.host_leaf(0);
        assert!(leaf.get_task(false).is_none());
        assert!(leaf.is_idle());
        assert!(sched.ctx.registry.is_idle(&cpu));
        // A queued task un-idles the CPU on the next pull.
        leaf.add_task(task(), false, ReadyTaskHint::None);
        assert!(leaf.get_task(false).is_some());
        assert!(!leaf.is_idle());
        assert!(!sched.ctx.registry.is_idle(&cpu));
    }

    #[test]
    fn parent_redistributes_to_idle_leaf() {
        let sched = scheduler(2, 2);
        let starving = sched.host_leaf(1);
        // Leaf 1 asks and finds nothing: marked idle in the parent.
        assert!(starving.get_task(false).is_none());
        // Leaf 0 overflows; the batch lands on the idle leaf 1.
        let full = sched.host_leaf(0);
        for _ in 0..3 {
            full.add_task(task(), true, ReadyTaskHint::None);
        }
        assert!(starving.slot_occupied() || starving.queue_len() > 0);
    }

    #[test]
    fn unblocked_tasks_outrank_leaf_work() {
        let sched = scheduler(1, 8);
        let cpu = Arc::clone(sched.ctx.registry.cpu(0));
        let fresh = host_task();
        let woken = host_task();
        sched.add_ready_task(Arc::clone(&fresh), Some(cpu.compute_place()), ReadyTaskHint::None);
        sched.task_gets_unblocked(Arc::clone(&woken), None);
        assert_eq!(sched.get_ready_task(&cpu).unwrap().id(), woken.id());
        assert_eq!(sched.get_ready_task(&cpu).unwrap().id(), fresh.id());
    }

    #[test]
    fn immediate_successor_is_taken_first_by_releasing_cpu() {
        let sched = scheduler(2, 8);
        let cpu = Arc::clone(sched.ctx.registry.cpu(0));
        let successor = host_task();
        sched.add_ready_task(
            Arc::clone(&successor),
            Some(cpu.compute_place()),
            ReadyTaskHint::Sibling,
        );
        assert_eq!(sched.get_ready_task(&cpu).unwrap().id(), successor.id());
    }

    #[test]
    fn displaced_successor_joins_local_queue() {
        let sched = scheduler(1, 8);
        let cpu = Arc::clone(sched.ctx.registry.cpu(0));
        let first = host_task();
        let second = host_task();
        let origin = Some(cpu.compute_place());
        sched.add_ready_task(Arc::clone(&first), origin, ReadyTaskHint::Sibling);
        sched.add_ready_task(Arc::clone(&second), origin, ReadyTaskHint::Sibling);
        // Newest successor sits in the slot; the displaced one is queued.
        assert_eq!(sched.get_ready_task(&cpu).unwrap().id(), second.id());
        assert_eq!(sched.get_ready_task(&cpu).unwrap().id(), first.id());
    }

    #[test]
    fn cluster_tasks_route_to_the_cluster_tree() {
        let registry = Arc::new(CpuRegistry::new_for_test(1));
        let sched = Scheduler::new(
            &test_config(4, 0),
            registry,
            &[(Device::Cluster, 2)],
        );
        let t = task();
        t.set_target(ComputePlace::cluster(crate::types::NodeIndex(1)));
        sched.add_ready_task(Arc::clone(&t), None, ReadyTaskHint::None);
        let got = sched.get_ready_device_task(Device::Cluster, 1).unwrap();
        assert_eq!(got.id(), t.id());
        assert!(sched.get_ready_device_task(Device::Cluster, 0).is_none());
    }

    #[test]
    fn disable_drains_queue_and_slot_to_parent() {
        let sched = scheduler(1, 8);
        let leaf = sched.host_leaf(0);
        leaf.add_task(task(), true, ReadyTaskHint::None);
        leaf.add_task(task(), true, ReadyTaskHint::None);
        leaf.add_task(task(), false, ReadyTaskHint::None); // slot
        assert!(leaf.slot_occupied());
        leaf.disable();
        assert_eq!(leaf.queue_len(), 0);
        assert!(!leaf.slot_occupied());
        assert_eq!(sched.host.root.batch_count(), 1);
    }

    #[test]
    fn shrinking_threshold_arms_rebalance() {
        let sched = scheduler(1, 8);
        let leaf = sched.host_leaf(0);
        for _ in 0..8 {
            leaf.add_task(task(), true, ReadyTaskHint::None);
        }
        leaf.update_queue_threshold(2);
        // Next successful dequeue rebalances: 7 remaining > 1.5 * 2.
        assert!(leaf.get_task(false).is_some());
        assert!(leaf.queue_len() <= 6);
        assert!(sched.host.root.batch_count() >= 1);
    }
}
