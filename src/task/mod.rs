//! Task records and their finalisation state machine.
//!
//! A task is exclusively owned by the runtime from submission until
//! `dispose`. The lifecycle invariants are:
//!
//! - `mark_as_finished` precedes `mark_as_released` precedes `dispose`
//! - a task reaches `released` at most once
//! - `disposed` implies `released` and `has_finished`
//!
//! A task with a `wait` clause whose children are still alive delays its
//! release: `mark_as_finished` returns false and the task's workflow
//! transitions to [`WorkflowState::FinishedAwaitingWait`] instead of being
//! torn down. Re-entry through `execute_task` resumes the finalisation.

use crate::places::{ComputePlace, MemoryPlace};
use crate::types::{NodeIndex, StepId, TaskId};
use crate::workflow::Workflow;
use core::fmt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A task body.
pub type TaskBody = Box<dyn FnOnce() + Send>;

/// Hook invoked when a task is disposed (test and bookkeeping seam).
pub type DisposeHook = Box<dyn Fn(TaskId) + Send + Sync>;

/// Workflow linkage of a task.
///
/// The original runtime kept a dangling workflow pointer as the sentinel
/// for "came back via a wait clause"; here the state is explicit.
#[derive(Default, Clone)]
pub enum WorkflowState {
    /// `execute_task` has not run yet.
    #[default]
    NotCreated,
    /// The workflow exists; the task is between its first `execute_task`
    /// and its notification step.
    Running(Arc<Workflow>),
    /// The notification step ran but the task must wait for children; the
    /// workflow itself is gone.
    FinishedAwaitingWait,
    /// Finalisation completed and the workflow was torn down.
    Complete,
}

impl fmt::Debug for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCreated => f.write_str("NotCreated"),
            Self::Running(_) => f.write_str("Running"),
            Self::FinishedAwaitingWait => f.write_str("FinishedAwaitingWait"),
            Self::Complete => f.write_str("Complete"),
        }
    }
}

/// A schedulable task.
pub struct Task {
    id: TaskId,
    label: String,
    priority: i64,
    body: Mutex<Option<TaskBody>>,

    /// Routing target; set at submission.
    target: Mutex<Option<ComputePlace>>,
    /// Compute place the task is currently bound to.
    compute_place: Mutex<Option<ComputePlace>>,
    /// Memory place used to update access locations at release.
    memory_place: Mutex<Option<MemoryPlace>>,

    workflow: Mutex<WorkflowState>,
    execution_step: Mutex<Option<StepId>>,

    /// Offloader node when this task runs here on behalf of a remote node.
    offloader: Option<NodeIndex>,
    weak_only: AtomicBool,
    must_delay_release: AtomicBool,
    has_finished: AtomicBool,
    blocked: AtomicBool,
    released: AtomicBool,
    disposed: AtomicBool,

    parent: Option<Weak<Task>>,
    live_children: AtomicUsize,

    on_dispose: Option<DisposeHook>,
}

impl Task {
    /// Unique id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Diagnostic label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Scheduling priority (higher runs earlier under priority queues).
    #[must_use]
    pub fn priority(&self) -> i64 {
        self.priority
    }

    /// Routing target, if already submitted.
    #[must_use]
    pub fn target(&self) -> Option<ComputePlace> {
        *self.target.lock()
    }

    /// Sets the routing target at submission.
    pub fn set_target(&self, target: ComputePlace) {
        *self.target.lock() = Some(target);
    }

    /// Compute place the task is currently bound to.
    #[must_use]
    pub fn compute_place(&self) -> Option<ComputePlace> {
        *self.compute_place.lock()
    }

    /// Binds the task to a compute place.
    pub fn set_compute_place(&self, place: ComputePlace) {
        *self.compute_place.lock() = Some(place);
    }

    /// Memory place used for release-time location updates.
    #[must_use]
    pub fn memory_place(&self) -> Option<MemoryPlace> {
        *self.memory_place.lock()
    }

    /// Sets the release-time memory place.
    pub fn set_memory_place(&self, place: MemoryPlace) {
        *self.memory_place.lock() = Some(place);
    }

    /// Current workflow linkage.
    #[must_use]
    pub fn workflow_state(&self) -> WorkflowState {
        self.workflow.lock().clone()
    }

    /// Replaces the workflow linkage, returning the previous state.
    pub fn set_workflow_state(&self, state: WorkflowState) -> WorkflowState {
        std::mem::replace(&mut self.workflow.lock(), state)
    }

    /// Drops the workflow for a wait-clause park, unless the resume path
    /// already finalised the task.
    pub fn workflow_to_wait_if_running(&self) {
        let mut workflow = self.workflow.lock();
        if matches!(*workflow, WorkflowState::Running(_)) {
            *workflow = WorkflowState::FinishedAwaitingWait;
        }
    }

    /// The workflow's execution step, while one is outstanding.
    #[must_use]
    pub fn execution_step(&self) -> Option<StepId> {
        *self.execution_step.lock()
    }

    /// Records or clears the outstanding execution step.
    pub fn set_execution_step(&self, step: Option<StepId>) {
        *self.execution_step.lock() = step;
    }

    /// Whether this task runs here on behalf of a remote node.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.offloader.is_some()
    }

    /// Node that offloaded this task, if remote.
    #[must_use]
    pub fn offloader(&self) -> Option<NodeIndex> {
        self.offloader
    }

    /// Whether every access of the task is weak.
    #[must_use]
    pub fn is_weak_only(&self) -> bool {
        self.weak_only.load(Ordering::Acquire)
    }

    /// Marks the task weak-only (computed at submission).
    pub fn set_weak_only(&self, value: bool) {
        self.weak_only.store(value, Ordering::Release);
    }

    /// Whether a `wait` clause delays this task's release.
    #[must_use]
    pub fn must_delay_release(&self) -> bool {
        self.must_delay_release.load(Ordering::Acquire)
    }

    /// Finishes the delayed release started when `mark_as_finished`
    /// returned false.
    pub fn complete_delayed_release(&self) {
        self.must_delay_release.store(false, Ordering::Release);
    }

    /// Whether the body has finished.
    #[must_use]
    pub fn has_finished(&self) -> bool {
        self.has_finished.load(Ordering::Acquire)
    }

    /// Whether the task is blocked in a wait clause.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    /// Unblocks a task parked in a wait clause.
    pub fn mark_as_unblocked(&self) {
        self.blocked.store(false, Ordering::Release);
    }

    /// Whether the task's accesses have been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Whether the task has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of children still alive.
    #[must_use]
    pub fn live_children(&self) -> usize {
        self.live_children.load(Ordering::Acquire)
    }

    /// Registers one more live child.
    pub fn add_child(&self) {
        self.live_children.fetch_add(1, Ordering::AcqRel);
    }

    /// Runs the task body. At most one invocation ever runs it; later
    /// calls are no-ops.
    pub fn run_body(&self) {
        let body = self.body.lock().take();
        if let Some(body) = body {
            body();
        }
    }

    /// Transitions to finished. Returns false when the task must delay its
    /// release for live children under a wait clause; in that case the
    /// caller leaves the finalisation to the wait-clause re-entry path.
    pub fn mark_as_finished(&self) -> bool {
        self.has_finished.store(true, Ordering::Release);
        if self.must_delay_release() && self.live_children() > 0 {
            self.blocked.store(true, Ordering::Release);
            // The last child may have finished between the count read and
            // the blocked mark without observing it; whoever wins the flag
            // ends the wait.
            if self.live_children() == 0
                && self
                    .blocked
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return true;
            }
            return false;
        }
        true
    }

    /// Transitions to released. True exactly once, and only after
    /// `mark_as_finished`.
    pub fn mark_as_released(&self) -> bool {
        debug_assert!(self.has_finished(), "released before finished");
        self.released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Disposes the task. Returns the parent if this was its last live
    /// child and the parent is parked in a wait clause — the caller must
    /// resubmit it as unblocked.
    pub fn dispose(self: &Arc<Self>) -> Option<Arc<Task>> {
        debug_assert!(self.is_released(), "disposed before released");
        debug_assert!(self.has_finished(), "disposed before finished");
        let first = self
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        debug_assert!(first, "task disposed twice");
        if let Some(hook) = &self.on_dispose {
            hook(self.id);
        }

        let parent = self.parent.as_ref().and_then(Weak::upgrade)?;
        let remaining = parent.live_children.fetch_sub(1, Ordering::AcqRel) - 1;
        let ends_wait = remaining == 0
            && parent.has_finished()
            && parent
                .blocked
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        ends_wait.then_some(parent)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("finished", &self.has_finished())
            .field("released", &self.is_released())
            .field("disposed", &self.is_disposed())
            .field("workflow", &self.workflow_state())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Task`].
pub struct TaskBuilder {
    label: String,
    priority: i64,
    wait: bool,
    offloader: Option<NodeIndex>,
    parent: Option<Weak<Task>>,
    body: Option<TaskBody>,
    on_dispose: Option<DisposeHook>,
}

impl TaskBuilder {
    /// Starts a builder with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            label: String::new(),
            priority: 0,
            wait: false,
            offloader: None,
            parent: None,
            body: None,
            on_dispose: None,
        }
    }

    /// Diagnostic label.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Scheduling priority.
    #[must_use]
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches a `wait` clause: release is delayed until children finish.
    #[must_use]
    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Marks the task as executed here on behalf of `node`.
    #[must_use]
    pub fn offloaded_from(mut self, node: NodeIndex) -> Self {
        self.offloader = Some(node);
        self
    }

    /// Registers the task as a child of `parent`.
    #[must_use]
    pub fn child_of(mut self, parent: &Arc<Task>) -> Self {
        parent.add_child();
        self.parent = Some(Arc::downgrade(parent));
        self
    }

    /// The task body.
    #[must_use]
    pub fn body(mut self, body: impl FnOnce() + Send + 'static) -> Self {
        self.body = Some(Box::new(body));
        self
    }

    /// Hook run at disposal.
    #[must_use]
    pub fn on_dispose(mut self, hook: impl Fn(TaskId) + Send + Sync + 'static) -> Self {
        self.on_dispose = Some(Box::new(hook));
        self
    }

    /// Builds the task.
    #[must_use]
    pub fn build(self) -> Arc<Task> {
        let id = TaskId::next();
        Arc::new(Task {
            id,
            label: if self.label.is_empty() {
                format!("task-{}", id.as_u64())
            } else {
                self.label
            },
            priority: self.priority,
            body: Mutex::new(self.body),
            target: Mutex::new(None),
            compute_place: Mutex::new(None),
            memory_place: Mutex::new(None),
            workflow: Mutex::new(WorkflowState::NotCreated),
            execution_step: Mutex::new(None),
            offloader: self.offloader,
            weak_only: AtomicBool::new(false),
            must_delay_release: AtomicBool::new(self.wait),
            has_finished: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            released: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            parent: self.parent,
            live_children: AtomicUsize::new(0),
            on_dispose: self.on_dispose,
        })
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// `FnOnce() + Send` bodies and `Fn(TaskId) + Send + Sync` hooks make the
// record transferable between workers as a whole.
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn body_runs_exactly_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let task = TaskBuilder::new()
            .body(move || {
                c.fetch_add(1, Ordering::Relaxed);
            })
            .build();
        task.run_body();
        task.run_body();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn finish_release_dispose_ordering() {
        let task = TaskBuilder::new().body(|| {}).build();
        assert!(task.mark_as_finished());
        assert!(task.mark_as_released());
        // Released at most once.
        assert!(!task.mark_as_released());
        assert!(task.dispose().is_none());
        assert!(task.is_disposed());
    }

    #[test]
    fn wait_clause_with_live_children_delays_release() {
        let parent = TaskBuilder::new().wait(true).body(|| {}).build();
        let child = TaskBuilder::new().child_of(&parent).body(|| {}).build();
        assert_eq!(parent.live_children(), 1);

        assert!(!parent.mark_as_finished());
        assert!(parent.is_blocked());

        child.mark_as_finished();
        child.mark_as_released();
        let unblocked = child.dispose().expect("last child unblocks parent");
        assert_eq!(unblocked.id(), parent.id());
    }

    #[test]
    fn wait_clause_without_children_finishes_normally() {
        let task = TaskBuilder::new().wait(true).body(|| {}).build();
        assert!(task.mark_as_finished());
    }

    #[test]
    fn dispose_hook_fires_with_task_id() {
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let task = TaskBuilder::new()
            .body(|| {})
            .on_dispose(move |id| {
                *s.lock() = Some(id);
            })
            .build();
        task.mark_as_finished();
        task.mark_as_released();
        task.dispose();
        assert_eq!(*seen.lock(), Some(task.id()));
    }

    #[test]
    fn default_label_names_the_task() {
        let task = TaskBuilder::new().body(|| {}).build();
        assert!(task.label().starts_with("task-"));
    }
}
