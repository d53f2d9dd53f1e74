//! Workflow construction: `execute_task` and the taskwait mini-workflow.

use crate::deps::{AccessRef, DataAccess, DependencyScratch};
use crate::places::{ComputePlace, Device, MemoryPlace};
use crate::runtime::RuntimeShared;
use crate::task::{Task, WorkflowState};
use crate::types::{NodeIndex, StepId};
use crate::workflow::finalization;
use crate::workflow::{ClusterCopy, StepKind, Workflow};
use std::sync::Arc;

/// Builds a data-copy step for one access, per the creation-time decision
/// table:
///
/// - reduction/commutative/concurrent accesses never move data;
/// - the directory is never a legal target;
/// - an unsatisfied source (`None`) is looked up as host and its
///   registration deferred;
/// - a directory source in cluster mode always yields a cluster copy (the
///   new location must be registered remotely even though no bytes move);
/// - otherwise only host↔cluster and cluster↔cluster pairs move data, and
///   every other pairing degrades to a null step.
fn create_data_copy_step(
    shared: &Arc<RuntimeShared>,
    workflow: &Arc<Workflow>,
    access_ref: AccessRef,
    access: &mut DataAccess,
    target: MemoryPlace,
    is_taskwait: bool,
) -> StepId {
    crate::instrument::backend().creating_copy_step(is_taskwait);

    if access.access_type().never_copies() {
        let step = workflow.add_step(StepKind::Null);
        crate::instrument::backend().copy_step_created(is_taskwait);
        return step;
    }

    debug_assert!(
        !shared.directory.is_directory_memory_place(target),
        "the directory is never a copy target"
    );

    let source = access.location();
    let source_kind = source.map_or(Device::Host, MemoryPlace::kind);
    let target_kind = target.kind();

    // A task starting on the host (or on this node's own memory) is not in
    // a remote namespace.
    if target_kind == Device::Host || target == shared.transport.current_memory_node() {
        access.set_valid_namespace_self(shared.transport.current_node());
    }

    let directory_source =
        source.is_some_and(|s| shared.directory.is_directory_memory_place(s));

    let step = if directory_source && shared.transport.in_cluster_mode() {
        // In the directory means uninitialised: nothing to move, but the
        // new location must be registered in the remote dependency system.
        cluster_copy(workflow, source, target, access_ref, access, is_taskwait)
    } else {
        match (source_kind, target_kind) {
            (Device::Host, Device::Cluster)
            | (Device::Cluster, Device::Host | Device::Cluster) => {
                cluster_copy(workflow, source, target, access_ref, access, is_taskwait)
            }
            // Unsupported hybrid pairs fall back to no-op in this release.
            _ => workflow.add_step(StepKind::Null),
        }
    };

    crate::instrument::backend().copy_step_created(is_taskwait);
    step
}

fn cluster_copy(
    workflow: &Arc<Workflow>,
    source: Option<MemoryPlace>,
    target: MemoryPlace,
    access_ref: AccessRef,
    access: &DataAccess,
    is_taskwait: bool,
) -> StepId {
    let needs_transfer = source.is_some_and(|s| !s.is_directory() && s != target);
    workflow.add_step(StepKind::ClusterDataCopy(ClusterCopy {
        source,
        target,
        region: access.region(),
        access: access_ref,
        fragments: 1,
        needs_transfer,
        is_taskwait,
    }))
}

fn create_execution_step(
    workflow: &Arc<Workflow>,
    task: &Arc<Task>,
    target: ComputePlace,
) -> StepId {
    match target.kind() {
        Device::Host => workflow.add_step(StepKind::HostExecution {
            task: Arc::clone(task),
        }),
        Device::Cluster => workflow.add_step(StepKind::ClusterExecution {
            task: Arc::clone(task),
            target: target.node().unwrap_or(NodeIndex(0)),
        }),
        Device::Cuda | Device::OpenCl => {
            unreachable!("execution workflow does not support this device yet")
        }
    }
}

fn create_notification_step(
    workflow: &Arc<Workflow>,
    target: Option<ComputePlace>,
    callback: crate::workflow::NotificationFn,
) -> StepId {
    let cluster = target.is_some_and(|t| t.kind() == Device::Cluster);
    workflow.add_step(StepKind::Notification {
        cluster,
        callback: Some(callback),
    })
}

/// Entry point from the worker loop.
///
/// The first call for a task builds its workflow and starts it. A later
/// call with the workflow still present fires the pending execution step
/// (the task's copies have completed and a worker now owns it). A call on
/// a task whose workflow is gone is the wake-up from a `wait` clause and
/// resumes the delayed finalisation.
pub fn execute_task(
    shared: &Arc<RuntimeShared>,
    task: &Arc<Task>,
    target_compute: ComputePlace,
    target_memory: MemoryPlace,
) {
    match task.workflow_state() {
        WorkflowState::Running(workflow) => {
            match task.execution_step() {
                Some(execution_step) => workflow.run_step(shared, execution_step),
                // The notification step already ran and the task parked in
                // a wait clause; its children finished and this is the
                // wake-up.
                None => finalization::resume_after_wait(shared, task, target_memory),
            }
            return;
        }
        WorkflowState::FinishedAwaitingWait => {
            finalization::resume_after_wait(shared, task, target_memory);
            return;
        }
        WorkflowState::Complete => {
            debug_assert!(false, "execute_task on a finalised task");
            return;
        }
        WorkflowState::NotCreated => {}
    }

    // The memory place recorded here updates the accesses' locations once
    // the task completes, unless release overrides it.
    task.set_memory_place(target_memory);

    let workflow = Workflow::new();

    let execution_step = create_execution_step(&workflow, task, target_compute);

    let notification_task = Arc::clone(task);
    let notification_step = create_notification_step(
        &workflow,
        Some(target_compute),
        Box::new(move |shared| {
            finalization::notification_finalize(shared, &notification_task, target_memory);
        }),
    );

    let release_step = workflow.add_step(StepKind::DataRelease {
        task: Arc::clone(task),
        cluster: task.is_remote(),
        accesses: Vec::new(),
    });
    workflow.enforce_order(execution_step, release_step);
    workflow.enforce_order(release_step, notification_step);

    shared
        .registrar
        .process_all_data_accesses(task.id(), &mut |access_ref, access| {
            #[cfg(debug_assertions)]
            check_known_region(shared, task, access, target_compute);

            let copy_step = create_data_copy_step(
                shared,
                &workflow,
                access_ref,
                access,
                target_memory,
                false,
            );
            workflow.enforce_order(copy_step, execution_step);
            workflow.add_root_step(copy_step);
            workflow.add_release_access(release_step, access_ref);
            true
        });

    if workflow.step_ready(execution_step) {
        workflow.enforce_order(execution_step, notification_step);
        workflow.add_root_step(execution_step);
    }

    task.set_execution_step(Some(execution_step));
    task.set_workflow_state(WorkflowState::Running(Arc::clone(&workflow)));
    task.set_compute_place(target_compute);

    // Either runs the task to completion right here (no pending
    // transfers) or leaves the execution step armed for the transfer
    // layer to release.
    workflow.start(shared);
}

/// Debug-mode check: a non-weak access over a region the directory does
/// not know is a usage error worth failing loudly on.
#[cfg(debug_assertions)]
fn check_known_region(
    shared: &Arc<RuntimeShared>,
    task: &Arc<Task>,
    access: &DataAccess,
    target_compute: ComputePlace,
) {
    if access.is_weak() || !shared.transport.in_cluster_mode() {
        return;
    }
    let in_directory = access
        .location()
        .is_some_and(|l| shared.directory.is_directory_memory_place(l));
    if in_directory && target_compute.kind() == Device::Host {
        let homes = shared.directory.find(access.region());
        assert!(
            !homes.is_empty(),
            "non-weak access {} of {} is an unknown region",
            access.region(),
            task.label()
        );
    }
}

/// Builds the taskwait mini-workflow: one copy step plus one notification
/// step that releases the fragment. A fragment with no output location
/// needs no copy and is released immediately.
pub fn setup_taskwait_workflow(
    shared: &Arc<RuntimeShared>,
    task: &Arc<Task>,
    fragment: &mut DataAccess,
    scratch: &mut DependencyScratch,
) {
    crate::instrument::backend().entering_taskwait_setup();

    let region = fragment.region();
    let Some(target) = fragment.output_location() else {
        shared
            .registrar
            .release_taskwait_fragment(task, region, scratch, false);
        crate::instrument::backend().exited_taskwait_setup();
        return;
    };

    let workflow = Workflow::new();

    let release_task = Arc::clone(task);
    let notification_step = create_notification_step(
        &workflow,
        crate::executor::WorkerThread::current().map(|w| w.cpu().compute_place()),
        Box::new(move |shared| {
            // Always a local scratch: the releasing thread may already be
            // inside the dependency system with its CPU's own buffer.
            let mut local = DependencyScratch::default();
            shared
                .registrar
                .release_taskwait_fragment(&release_task, region, &mut local, true);
            finalization::flush_satisfied(shared, &mut local);
        }),
    );

    // Taskwait fragments are not registered accesses; the sentinel index
    // makes location registration a no-op.
    let access_ref = AccessRef {
        task: task.id(),
        index: usize::MAX,
    };
    let copy_step =
        create_data_copy_step(shared, &workflow, access_ref, fragment, target, true);

    workflow.add_root_step(copy_step);
    workflow.enforce_order(copy_step, notification_step);
    workflow.start(shared);

    crate::instrument::backend().exited_taskwait_setup();
}
