//! Instrumentation entry points.
//!
//! Every subsystem calls into this module at its interesting transitions.
//! The active [`Backend`] decides what happens; the default no-op backend
//! makes every hook behaviour-neutral. The verbose backend logs through
//! [`crate::tracing_compat`] and is selected by the
//! `verbose_cluster_messages` configuration knob.
//!
//! Hooks are plain functions with stable signatures so alternative
//! backends (tracing sinks, counters) can be swapped in without touching
//! call sites.

use crate::places::ComputePlace;
use crate::types::{NodeIndex, TaskId};
use std::sync::OnceLock;

/// An instrumentation backend.
///
/// All methods default to no-ops; a backend overrides the ones it cares
/// about.
pub trait Backend: Send + Sync {
    /// A worker thread was created.
    fn thread_created(&self, _worker: usize) {}
    /// A worker thread resumed on a CPU.
    fn thread_resumed(&self, _worker: usize, _virtual_cpu: u32) {}
    /// A worker thread suspended itself.
    fn thread_suspended(&self, _worker: usize) {}
    /// A worker thread exited.
    fn thread_exited(&self, _worker: usize) {}
    /// A task was added to a scheduler tree.
    fn task_submitted(&self, _task: TaskId, _target: ComputePlace) {}
    /// A data-copy step is being created. Paired with `copy_step_created`.
    fn creating_copy_step(&self, _is_taskwait: bool) {}
    /// A data-copy step finished creation.
    fn copy_step_created(&self, _is_taskwait: bool) {}
    /// A taskwait workflow is being set up.
    fn entering_taskwait_setup(&self) {}
    /// A taskwait workflow setup completed.
    fn exited_taskwait_setup(&self) {}
    /// A group fetch was submitted to the cluster transport.
    fn fetch_submitted(&self, _fragments: usize, _source: NodeIndex) {}
    /// A task-finished message is leaving this node.
    fn task_finished_sent(&self, _task: TaskId) {}
}

/// The no-op backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

impl Backend for NoopBackend {}

/// Verbose backend: logs every hook through the tracing layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerboseBackend;

#[allow(unused_variables)]
impl Backend for VerboseBackend {
    fn thread_created(&self, worker: usize) {
        crate::tracing_compat::debug!(worker, "worker thread created");
    }

    fn thread_resumed(&self, worker: usize, virtual_cpu: u32) {
        crate::tracing_compat::trace!(worker, virtual_cpu, "worker resumed");
    }

    fn thread_suspended(&self, worker: usize) {
        crate::tracing_compat::trace!(worker, "worker suspended");
    }

    fn thread_exited(&self, worker: usize) {
        crate::tracing_compat::debug!(worker, "worker exited");
    }

    fn task_submitted(&self, task: TaskId, target: ComputePlace) {
        crate::tracing_compat::trace!(task = %task, target = ?target, "task submitted");
    }

    fn fetch_submitted(&self, fragments: usize, source: NodeIndex) {
        crate::tracing_compat::debug!(fragments, source = %source, "vector fetch submitted");
    }

    fn task_finished_sent(&self, task: TaskId) {
        crate::tracing_compat::debug!(task = %task, "task-finished message sent");
    }
}

static BACKEND: OnceLock<Box<dyn Backend>> = OnceLock::new();
static NOOP: NoopBackend = NoopBackend;

/// Installs the process-wide backend. The first call wins; later calls are
/// ignored (re-entry of the runtime lifecycle is forbidden anyway).
pub fn set_backend(backend: Box<dyn Backend>) {
    let _ = BACKEND.set(backend);
}

/// The active backend.
#[must_use]
pub fn backend() -> &'static dyn Backend {
    BACKEND.get().map_or(&NOOP as &dyn Backend, Box::as_ref)
}
