//! Data accesses and the dependency-registrar seam.
//!
//! The dependency-registration data structures themselves are an external
//! collaborator: this module declares the access records the workflow
//! engine consumes plus the [`DependencyRegistrar`] API, and bundles an
//! in-process registrar sufficient to drive the core (and its tests)
//! end-to-end. Access records are owned by the registrar; the workflow
//! engine addresses them through [`AccessRef`] handles scoped to a single
//! task's lifetime.

use crate::places::MemoryPlace;
use crate::task::Task;
use crate::types::{DataRegion, NodeIndex, TaskId};
use core::fmt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Declared access type of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    /// Read-only access.
    Read,
    /// Write-only access.
    Write,
    /// Read-write access.
    ReadWrite,
    /// Weak read (no execution dependency, data may be fetched lazily).
    WeakRead,
    /// Weak write.
    WeakWrite,
    /// Weak read-write.
    WeakReadWrite,
    /// Reduction access.
    Reduction,
    /// Commutative access.
    Commutative,
    /// Concurrent access.
    Concurrent,
}

impl AccessType {
    /// Whether this is one of the weak variants.
    #[must_use]
    pub const fn is_weak(self) -> bool {
        matches!(self, Self::WeakRead | Self::WeakWrite | Self::WeakReadWrite)
    }

    /// Reduction, commutative and concurrent accesses never participate in
    /// data-copy steps.
    #[must_use]
    pub const fn never_copies(self) -> bool {
        matches!(self, Self::Reduction | Self::Commutative | Self::Concurrent)
    }
}

/// One declared data access of a task.
#[derive(Clone)]
pub struct DataAccess {
    region: DataRegion,
    access_type: AccessType,
    /// Current location; `None` means not yet read-satisfied.
    location: Option<MemoryPlace>,
    /// Where a taskwait over this access must leave the data.
    output_location: Option<MemoryPlace>,
    /// Set when the access target is local to this node.
    valid_namespace_self: Option<NodeIndex>,
}

impl DataAccess {
    /// Creates an access over `region` with the given type and current
    /// location.
    #[must_use]
    pub const fn new(
        region: DataRegion,
        access_type: AccessType,
        location: Option<MemoryPlace>,
    ) -> Self {
        Self {
            region,
            access_type,
            location,
            output_location: None,
            valid_namespace_self: None,
        }
    }

    /// Sets the taskwait output location.
    #[must_use]
    pub const fn with_output_location(mut self, output: MemoryPlace) -> Self {
        self.output_location = Some(output);
        self
    }

    /// The accessed region.
    #[must_use]
    pub const fn region(&self) -> DataRegion {
        self.region
    }

    /// The declared access type.
    #[must_use]
    pub const fn access_type(&self) -> AccessType {
        self.access_type
    }

    /// Whether the access is weak.
    #[must_use]
    pub const fn is_weak(&self) -> bool {
        self.access_type.is_weak()
    }

    /// Current location of the data, if read-satisfied.
    #[must_use]
    pub const fn location(&self) -> Option<MemoryPlace> {
        self.location
    }

    /// Updates the current location.
    pub fn set_location(&mut self, location: MemoryPlace) {
        self.location = Some(location);
    }

    /// Taskwait output location, if any.
    #[must_use]
    pub const fn output_location(&self) -> Option<MemoryPlace> {
        self.output_location
    }

    /// Namespace-self index, set when the target is local.
    #[must_use]
    pub const fn valid_namespace_self(&self) -> Option<NodeIndex> {
        self.valid_namespace_self
    }

    /// Marks the access as locally valid in the given namespace.
    pub fn set_valid_namespace_self(&mut self, node: NodeIndex) {
        self.valid_namespace_self = Some(node);
    }
}

impl fmt::Debug for DataAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataAccess")
            .field("region", &self.region)
            .field("type", &self.access_type)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// Handle to one access of one task, valid while the task is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRef {
    /// Owning task.
    pub task: TaskId,
    /// Position within the task's access list.
    pub index: usize,
}

/// Per-CPU scratch buffer for dependency processing.
///
/// Collects tasks whose dependencies became satisfied during an operation;
/// the caller flushes them to the scheduler once the registrar returns.
/// Non-worker callers use a local scratch instead of a CPU's own.
#[derive(Debug, Default)]
pub struct DependencyScratch {
    satisfied: Vec<Arc<Task>>,
}

impl DependencyScratch {
    /// Queues a task made ready by a release.
    pub fn add_satisfied(&mut self, task: Arc<Task>) {
        self.satisfied.push(task);
    }

    /// Drains the satisfied tasks for submission.
    pub fn drain_satisfied(&mut self) -> Vec<Arc<Task>> {
        std::mem::take(&mut self.satisfied)
    }

    /// Whether any satisfied task is pending submission.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.satisfied.is_empty()
    }
}

/// Dependency-registration API consumed by the execution workflow.
pub trait DependencyRegistrar: Send + Sync {
    /// Registers a task's declared accesses. Called once per task at
    /// submission.
    fn register_task_accesses(&self, task: &Arc<Task>, accesses: Vec<DataAccess>);

    /// Visits every access of a task, in registration order. The visitor
    /// may mutate the access (location, namespace marks); returning false
    /// stops the walk.
    fn process_all_data_accesses(
        &self,
        task: TaskId,
        visitor: &mut dyn FnMut(AccessRef, &mut DataAccess) -> bool,
    );

    /// Mutates a single access through its handle.
    fn with_access(&self, access: AccessRef, f: &mut dyn FnMut(&mut DataAccess));

    /// Unregisters all of a task's accesses, updating their location to
    /// `location`. `finalizer` runs inside the unregistration, after
    /// locations are final but before any satisfiability is propagated
    /// (successors enter `scratch` only after it returns).
    fn unregister_task_data_accesses(
        &self,
        task: &Arc<Task>,
        scratch: &mut DependencyScratch,
        location: Option<MemoryPlace>,
        first_registration: bool,
        finalizer: &mut dyn FnMut(),
    );

    /// Early-releases accesses propagated through the offload namespace.
    fn unregister_locally_propagated(&self, task: &Arc<Task>, scratch: &mut DependencyScratch);

    /// Releases one taskwait fragment of a task.
    fn release_taskwait_fragment(
        &self,
        task: &Arc<Task>,
        region: DataRegion,
        scratch: &mut DependencyScratch,
        first: bool,
    );

    /// Completes a taskwait: the task's children have finished and its
    /// delayed dependencies may flow again.
    fn handle_exit_taskwait(&self, task: &Arc<Task>, scratch: &mut DependencyScratch);
}

/// In-process registrar.
///
/// Keeps each task's access list and an explicit successor graph. Real
/// deployments substitute the full region-linkage implementation; the
/// interface is what the core depends on.
#[derive(Default)]
pub struct InProcessRegistrar {
    accesses: Mutex<HashMap<TaskId, Vec<DataAccess>>>,
    successors: Mutex<HashMap<TaskId, Vec<Arc<Task>>>>,
    taskwait_releases: Mutex<Vec<(TaskId, DataRegion, bool)>>,
}

impl InProcessRegistrar {
    /// Creates an empty registrar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that `successor` becomes satisfied when `predecessor`'s
    /// accesses are unregistered.
    pub fn add_successor(&self, predecessor: TaskId, successor: Arc<Task>) {
        self.successors
            .lock()
            .entry(predecessor)
            .or_default()
            .push(successor);
    }

    /// Snapshot of a task's accesses (test observability).
    #[must_use]
    pub fn accesses_of(&self, task: TaskId) -> Vec<DataAccess> {
        self.accesses.lock().get(&task).cloned().unwrap_or_default()
    }

    /// Taskwait fragments released so far, in release order.
    #[must_use]
    pub fn taskwait_releases(&self) -> Vec<(TaskId, DataRegion, bool)> {
        self.taskwait_releases.lock().clone()
    }
}

impl DependencyRegistrar for InProcessRegistrar {
    fn register_task_accesses(&self, task: &Arc<Task>, accesses: Vec<DataAccess>) {
        let previous = self.accesses.lock().insert(task.id(), accesses);
        debug_assert!(previous.is_none(), "task accesses registered twice");
    }

    fn process_all_data_accesses(
        &self,
        task: TaskId,
        visitor: &mut dyn FnMut(AccessRef, &mut DataAccess) -> bool,
    ) {
        let mut accesses = self.accesses.lock();
        if let Some(list) = accesses.get_mut(&task) {
            for (index, access) in list.iter_mut().enumerate() {
                if !visitor(AccessRef { task, index }, access) {
                    break;
                }
            }
        }
    }

    fn with_access(&self, access: AccessRef, f: &mut dyn FnMut(&mut DataAccess)) {
        let mut accesses = self.accesses.lock();
        if let Some(entry) = accesses
            .get_mut(&access.task)
            .and_then(|list| list.get_mut(access.index))
        {
            f(entry);
        }
    }

    fn unregister_task_data_accesses(
        &self,
        task: &Arc<Task>,
        scratch: &mut DependencyScratch,
        location: Option<MemoryPlace>,
        _first_registration: bool,
        finalizer: &mut dyn FnMut(),
    ) {
        if let Some(list) = self.accesses.lock().get_mut(&task.id()) {
            if let Some(location) = location {
                for access in list.iter_mut() {
                    access.set_location(location);
                }
            }
        }

        // The finalizer must observe final locations but run before any
        // satisfiability leaves this call.
        finalizer();

        let successors = self.successors.lock().remove(&task.id()).unwrap_or_default();
        for successor in successors {
            scratch.add_satisfied(successor);
        }
        self.accesses.lock().remove(&task.id());
    }

    fn unregister_locally_propagated(&self, task: &Arc<Task>, _scratch: &mut DependencyScratch) {
        // Namespace-propagated accesses are released eagerly; the bundled
        // registrar tracks them inside the main access list, so there is
        // nothing to split off here.
        let _ = task;
    }

    fn release_taskwait_fragment(
        &self,
        task: &Arc<Task>,
        region: DataRegion,
        _scratch: &mut DependencyScratch,
        first: bool,
    ) {
        self.taskwait_releases.lock().push((task.id(), region, first));
    }

    fn handle_exit_taskwait(&self, task: &Arc<Task>, scratch: &mut DependencyScratch) {
        let successors = self.successors.lock().remove(&task.id()).unwrap_or_default();
        for successor in successors {
            scratch.add_satisfied(successor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskBuilder;

    fn make_task() -> Arc<Task> {
        TaskBuilder::new().body(|| {}).build()
    }

    #[test]
    fn weak_and_specialized_classification() {
        assert!(AccessType::WeakRead.is_weak());
        assert!(!AccessType::Read.is_weak());
        assert!(AccessType::Reduction.never_copies());
        assert!(AccessType::Commutative.never_copies());
        assert!(AccessType::Concurrent.never_copies());
        assert!(!AccessType::ReadWrite.never_copies());
    }

    #[test]
    fn visitor_sees_accesses_in_registration_order() {
        let registrar = InProcessRegistrar::new();
        let task = make_task();
        registrar.register_task_accesses(
            &task,
            vec![
                DataAccess::new(DataRegion::new(0x1000, 8), AccessType::Read, None),
                DataAccess::new(DataRegion::new(0x2000, 8), AccessType::Write, None),
            ],
        );

        let mut seen = Vec::new();
        registrar.process_all_data_accesses(task.id(), &mut |aref, access| {
            seen.push((aref.index, access.region()));
            true
        });
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (0, DataRegion::new(0x1000, 8)));
        assert_eq!(seen[1], (1, DataRegion::new(0x2000, 8)));
    }

    #[test]
    fn unregister_updates_locations_then_runs_finalizer_then_satisfies() {
        let registrar = InProcessRegistrar::new();
        let task = make_task();
        let successor = make_task();
        registrar.register_task_accesses(
            &task,
            vec![DataAccess::new(
                DataRegion::new(0x1000, 8),
                AccessType::ReadWrite,
                Some(MemoryPlace::cluster(NodeIndex(1))),
            )],
        );
        registrar.add_successor(task.id(), Arc::clone(&successor));

        let mut scratch = DependencyScratch::default();
        let mut finalizer_ran = false;
        registrar.unregister_task_data_accesses(
            &task,
            &mut scratch,
            Some(MemoryPlace::host(0)),
            false,
            &mut || {
                finalizer_ran = true;
            },
        );
        assert!(finalizer_ran);
        let satisfied = scratch.drain_satisfied();
        assert_eq!(satisfied.len(), 1);
        assert_eq!(satisfied[0].id(), successor.id());
        assert!(registrar.accesses_of(task.id()).is_empty());
    }

    #[test]
    fn taskwait_releases_are_recorded_in_order() {
        let registrar = InProcessRegistrar::new();
        let task = make_task();
        let mut scratch = DependencyScratch::default();
        let r1 = DataRegion::new(0x10, 4);
        let r2 = DataRegion::new(0x20, 4);
        registrar.release_taskwait_fragment(&task, r1, &mut scratch, false);
        registrar.release_taskwait_fragment(&task, r2, &mut scratch, true);
        let releases = registrar.taskwait_releases();
        assert_eq!(releases, vec![(task.id(), r1, false), (task.id(), r2, true)]);
    }
}
