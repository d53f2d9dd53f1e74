//! Task finalisation coordination.
//!
//! The notification callback executes in whichever worker drove the final
//! copy/execute transition. The ordering that matters for clusters: the
//! task-finished message leaves this node inside the registrar's
//! finalisation callback, before any satisfiability is propagated to
//! successors — satisfied tasks only reach the scheduler once the
//! unregistration has returned.

use crate::deps::DependencyScratch;
use crate::executor::WorkerThread;
use crate::places::MemoryPlace;
use crate::runtime::RuntimeShared;
use crate::scheduler::ReadyTaskHint;
use crate::task::{Task, WorkflowState};
use std::sync::Arc;

/// Runs `f` with the current CPU's dependency scratch, or a local one when
/// called from a non-worker context.
fn with_scratch<R>(f: impl FnOnce(&mut DependencyScratch) -> R) -> (R, Vec<Arc<Task>>) {
    match WorkerThread::current() {
        Some(worker) => {
            let cpu = worker.cpu();
            let mut guard = cpu.dependency_data();
            let result = f(&mut guard);
            let satisfied = guard.drain_satisfied();
            (result, satisfied)
        }
        None => {
            let mut local = DependencyScratch::default();
            let result = f(&mut local);
            let satisfied = local.drain_satisfied();
            (result, satisfied)
        }
    }
}

/// Submits every task a dependency operation just satisfied.
pub(crate) fn flush_satisfied(shared: &Arc<RuntimeShared>, scratch: &mut DependencyScratch) {
    let origin = WorkerThread::current().map(|w| w.cpu().compute_place());
    for task in scratch.drain_satisfied() {
        shared
            .scheduler
            .add_ready_task_and_wake(task, origin, ReadyTaskHint::Sibling);
    }
}

fn submit_satisfied(shared: &Arc<RuntimeShared>, satisfied: Vec<Arc<Task>>) {
    let origin = WorkerThread::current().map(|w| w.cpu().compute_place());
    for task in satisfied {
        shared
            .scheduler
            .add_ready_task_and_wake(task, origin, ReadyTaskHint::Sibling);
    }
}

/// Cluster-aware completion: the task-finished message for an offloaded
/// task leaves before any satisfiability derived from its release.
fn task_finished(shared: &Arc<RuntimeShared>, task: &Arc<Task>) {
    if task.is_remote() {
        shared.transport.send_task_finished(task);
    }
}

/// Disposes a finished, released task. If this was the last live child of
/// a parent parked in a wait clause, the parent re-enters the scheduler
/// as unblocked.
pub(crate) fn dispose_task(shared: &Arc<RuntimeShared>, task: &Arc<Task>) {
    if let Some(parent) = task.dispose() {
        shared.scheduler.task_gets_unblocked(parent, None);
    }
}

/// The notification-step callback body.
pub(crate) fn notification_finalize(
    shared: &Arc<RuntimeShared>,
    task: &Arc<Task>,
    target_memory: MemoryPlace,
) {
    let ((), satisfied) = with_scratch(|scratch| {
        shared.registrar.unregister_locally_propagated(task, scratch);

        if task.mark_as_finished() {
            shared.registrar.unregister_task_data_accesses(
                task,
                scratch,
                Some(target_memory),
                false,
                &mut || {
                    task_finished(shared, task);
                    if task.mark_as_released() {
                        dispose_task(shared, task);
                    }
                },
            );
            task.set_workflow_state(WorkflowState::Complete);
        } else {
            // Wait clause: the workflow is gone but the finalisation is
            // not; the task resumes through `execute_task` once its
            // children finish. The resume may already have raced ahead,
            // in which case the state stays Complete.
            task.workflow_to_wait_if_running();
        }
    });
    submit_satisfied(shared, satisfied);
}

/// Wake-up from a wait clause: everything after `mark_as_finished`
/// returned false, without re-running the body.
pub(crate) fn resume_after_wait(
    shared: &Arc<RuntimeShared>,
    task: &Arc<Task>,
    target_memory: MemoryPlace,
) {
    debug_assert!(task.must_delay_release());
    debug_assert!(task.has_finished());

    let ((), satisfied) = with_scratch(|scratch| {
        task.complete_delayed_release();
        task.mark_as_unblocked();
        shared.registrar.handle_exit_taskwait(task, scratch);

        shared.registrar.unregister_task_data_accesses(
            task,
            scratch,
            Some(target_memory),
            false,
            &mut || {
                task_finished(shared, task);
                if task.mark_as_released() {
                    dispose_task(shared, task);
                }
            },
        );
        task.set_workflow_state(WorkflowState::Complete);
    });
    submit_satisfied(shared, satisfied);
}
