//! Per-task execution workflows.
//!
//! Every task gets a small dataflow graph the first time `execute_task`
//! sees it: one data-copy step per access, an execution step, a
//! data-release step and a notification step, wired copy → execute →
//! release → notify. Steps live in an arena inside their workflow and
//! name successors by [`StepId`]; a step fires when its pending-
//! predecessor counter reaches zero, and firing decrements successors.
//!
//! Null copies complete synchronously. Cluster copies that need a fetch
//! are grouped by source node and handed to the transport as vectorised
//! requests; the transfer-completion poller finishes them later.

mod execute;
mod finalization;

pub use execute::{execute_task, setup_taskwait_workflow};

use crate::deps::AccessRef;
use crate::places::MemoryPlace;
use crate::runtime::RuntimeShared;
use crate::task::Task;
use crate::types::{DataRegion, NodeIndex, StepId};
use parking_lot::Mutex;
use std::sync::Arc;

/// Callback of a notification step.
pub type NotificationFn = Box<dyn FnOnce(&Arc<RuntimeShared>) + Send>;

/// A cluster data-copy step's payload.
pub struct ClusterCopy {
    /// Source location; `None` when the access is not yet read-satisfied
    /// (registration is deferred until satisfiability arrives).
    pub source: Option<MemoryPlace>,
    /// Destination of the copy.
    pub target: MemoryPlace,
    /// Region being moved.
    pub region: DataRegion,
    /// Handle of the access this copy serves.
    pub access: AccessRef,
    /// Number of region fragments this step contributes to a fetch.
    pub fragments: usize,
    /// Whether bytes actually move (false for directory-sourced data and
    /// same-place copies, which only need registration).
    pub needs_transfer: bool,
    /// Whether this copy serves a taskwait fragment.
    pub is_taskwait: bool,
}

impl ClusterCopy {
    /// Whether this step must go through the transfer layer.
    #[must_use]
    pub fn requires_data_fetch(&self) -> bool {
        self.needs_transfer || self.is_taskwait
    }
}

/// What a step does when it fires.
pub enum StepKind {
    /// Immediately satisfied; used wherever no data motion is needed.
    Null,
    /// A fetch (or remote registration) from another cluster node.
    ClusterDataCopy(ClusterCopy),
    /// Runs the task body on a host CPU.
    HostExecution {
        /// The task to run.
        task: Arc<Task>,
    },
    /// Submits the task to a remote node.
    ClusterExecution {
        /// The task being offloaded.
        task: Arc<Task>,
        /// Destination node.
        target: NodeIndex,
    },
    /// Propagates per-region location updates after the body ran.
    DataRelease {
        /// The finished task.
        task: Arc<Task>,
        /// Cluster variant: also emits per-region release messages.
        cluster: bool,
        /// Accesses to release.
        accesses: Vec<AccessRef>,
    },
    /// Runs the finalisation callback.
    Notification {
        /// Cluster variant marker (offloaded-task notification).
        cluster: bool,
        /// The callback; consumed on fire.
        callback: Option<NotificationFn>,
    },
}

struct Step {
    kind: StepKind,
    pending: usize,
    successors: Vec<StepId>,
    started: bool,
}

/// A per-task step DAG.
#[derive(Default)]
pub struct Workflow {
    steps: Mutex<Vec<Step>>,
    roots: Mutex<Vec<StepId>>,
}

enum FiredAction {
    Complete,
    RegisterAndComplete {
        access: AccessRef,
        target: MemoryPlace,
    },
    RunBody {
        task: Arc<Task>,
    },
    Requeue {
        task: Arc<Task>,
    },
    Offload {
        task: Arc<Task>,
        target: NodeIndex,
    },
    Release {
        task: Arc<Task>,
        cluster: bool,
        accesses: Vec<AccessRef>,
    },
    Notify {
        callback: Option<NotificationFn>,
    },
}

impl Workflow {
    /// Creates an empty workflow.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a step; it becomes a root only if registered via
    /// [`Workflow::add_root_step`].
    pub fn add_step(&self, kind: StepKind) -> StepId {
        let mut steps = self.steps.lock();
        let id = StepId(u32::try_from(steps.len()).expect("step count fits u32"));
        steps.push(Step {
            kind,
            pending: 0,
            successors: Vec::new(),
            started: false,
        });
        id
    }

    /// Orders `pred` before `succ`.
    pub fn enforce_order(&self, pred: StepId, succ: StepId) {
        let mut steps = self.steps.lock();
        steps[pred.index()].successors.push(succ);
        steps[succ.index()].pending += 1;
    }

    /// Registers a root step, started when the workflow starts.
    pub fn add_root_step(&self, step: StepId) {
        self.roots.lock().push(step);
    }

    /// Whether the step has no pending predecessors.
    #[must_use]
    pub fn step_ready(&self, step: StepId) -> bool {
        self.steps.lock()[step.index()].pending == 0
    }

    /// Appends an access to a data-release step.
    pub fn add_release_access(&self, release: StepId, access: AccessRef) {
        let mut steps = self.steps.lock();
        if let StepKind::DataRelease { accesses, .. } = &mut steps[release.index()].kind {
            accesses.push(access);
        } else {
            debug_assert!(false, "not a data-release step");
        }
    }

    /// Number of steps (tests and diagnostics).
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.lock().len()
    }

    /// Starts the workflow: cluster copies requiring a fetch are grouped
    /// by source node and submitted as vector fetches; every other root
    /// starts immediately.
    pub fn start(self: &Arc<Self>, shared: &Arc<RuntimeShared>) {
        let roots = self.roots.lock().clone();

        let mut groups: Vec<(MemoryPlace, usize, Vec<crate::cluster::PendingCopy>)> = Vec::new();
        let mut immediate = Vec::new();

        for id in roots {
            let fetch_source = {
                let steps = self.steps.lock();
                match &steps[id.index()].kind {
                    StepKind::ClusterDataCopy(copy) if copy.requires_data_fetch() => {
                        Some((copy.source.unwrap_or(copy.target), copy.fragments))
                    }
                    _ => None,
                }
            };
            match fetch_source {
                Some((source, fragments)) => {
                    let pending = crate::cluster::PendingCopy {
                        workflow: Arc::clone(self),
                        step: id,
                    };
                    if let Some(group) = groups.iter_mut().find(|(s, _, _)| *s == source) {
                        group.1 += fragments;
                        group.2.push(pending);
                    } else {
                        groups.push((source, fragments, vec![pending]));
                    }
                }
                None => immediate.push(id),
            }
        }

        for id in immediate {
            self.run_step(shared, id);
        }

        for (source, fragments, copies) in groups {
            shared
                .transport
                .fetch_vector(fragments, copies, source, &shared.transfers);
        }
    }

    /// Fires a step whose predecessors are all satisfied.
    pub(crate) fn run_step(self: &Arc<Self>, shared: &Arc<RuntimeShared>, id: StepId) {
        let action = {
            let mut steps = self.steps.lock();
            let step = &mut steps[id.index()];
            if step.started {
                return;
            }
            match &mut step.kind {
                StepKind::Null => {
                    step.started = true;
                    FiredAction::Complete
                }
                StepKind::ClusterDataCopy(copy) => {
                    step.started = true;
                    // Non-fetch cluster copies only register the new
                    // location (directory-sourced or already in place);
                    // an unsatisfied source defers registration entirely.
                    if copy.source.is_some() && !copy.needs_transfer {
                        FiredAction::RegisterAndComplete {
                            access: copy.access,
                            target: copy.target,
                        }
                    } else {
                        FiredAction::Complete
                    }
                }
                StepKind::HostExecution { task } => {
                    let on_own_worker = crate::executor::WorkerThread::current()
                        .and_then(|w| w.current_task())
                        .is_some_and(|t| t.id() == task.id());
                    if on_own_worker {
                        step.started = true;
                        FiredAction::RunBody {
                            task: Arc::clone(task),
                        }
                    } else {
                        // Became ready outside the owning worker (copy
                        // completion): hand the task back to the
                        // scheduler; the pulling worker re-enters here.
                        FiredAction::Requeue {
                            task: Arc::clone(task),
                        }
                    }
                }
                StepKind::ClusterExecution { task, target } => {
                    step.started = true;
                    FiredAction::Offload {
                        task: Arc::clone(task),
                        target: *target,
                    }
                }
                StepKind::DataRelease {
                    task,
                    cluster,
                    accesses,
                } => {
                    step.started = true;
                    FiredAction::Release {
                        task: Arc::clone(task),
                        cluster: *cluster,
                        accesses: accesses.clone(),
                    }
                }
                StepKind::Notification { callback, .. } => {
                    step.started = true;
                    FiredAction::Notify {
                        callback: callback.take(),
                    }
                }
            }
        };

        match action {
            FiredAction::Complete => self.complete_step(shared, id),
            FiredAction::RegisterAndComplete { access, target } => {
                shared
                    .registrar
                    .with_access(access, &mut |a| a.set_location(target));
                self.complete_step(shared, id);
            }
            FiredAction::RunBody { task } => {
                task.run_body();
                task.set_execution_step(None);
                self.complete_step(shared, id);
            }
            FiredAction::Requeue { task } => {
                shared
                    .scheduler
                    .add_ready_task_and_wake(task, None, crate::scheduler::ReadyTaskHint::None);
            }
            FiredAction::Offload { task, target } => {
                shared.transport.offload_task(&task, target);
                task.set_execution_step(None);
                self.complete_step(shared, id);
            }
            FiredAction::Release {
                task,
                cluster,
                accesses,
            } => {
                let location = task.memory_place();
                let mut regions = Vec::new();
                for access in accesses {
                    shared.registrar.with_access(access, &mut |a| {
                        if let Some(location) = location {
                            a.set_location(location);
                        }
                        regions.push(a.region());
                    });
                }
                if cluster {
                    if let Some(location) = location {
                        for region in regions {
                            shared.transport.release_region(&task, region, location);
                        }
                    }
                }
                self.complete_step(shared, id);
            }
            FiredAction::Notify { callback } => {
                if let Some(callback) = callback {
                    callback(shared);
                }
                self.complete_step(shared, id);
            }
        }
    }

    /// Completion entry point for cluster copies finished by the transfer
    /// layer: registers the new location, then releases successors.
    pub(crate) fn finish_cluster_copy(
        self: &Arc<Self>,
        shared: &Arc<RuntimeShared>,
        id: StepId,
    ) {
        let registration = {
            let mut steps = self.steps.lock();
            let step = &mut steps[id.index()];
            if step.started {
                return;
            }
            step.started = true;
            match &step.kind {
                StepKind::ClusterDataCopy(copy) => Some((copy.access, copy.target)),
                _ => None,
            }
        };
        if let Some((access, target)) = registration {
            shared
                .registrar
                .with_access(access, &mut |a| a.set_location(target));
        }
        self.complete_step(shared, id);
    }

    /// Marks a step finished and fires any successor whose pending count
    /// reaches zero.
    pub(crate) fn complete_step(self: &Arc<Self>, shared: &Arc<RuntimeShared>, id: StepId) {
        let ready = {
            let mut steps = self.steps.lock();
            let successors = steps[id.index()].successors.clone();
            let mut ready = Vec::new();
            for succ in successors {
                let step = &mut steps[succ.index()];
                debug_assert!(step.pending > 0, "successor counter underflow");
                step.pending -= 1;
                if step.pending == 0 {
                    ready.push(succ);
                }
            }
            ready
        };
        for succ in ready {
            self.run_step(shared, succ);
        }
    }
}

impl core::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Workflow")
            .field("steps", &self.step_count())
            .field("roots", &self.roots.lock().len())
            .finish()
    }
}
