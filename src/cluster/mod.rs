//! Cluster transport seam.
//!
//! The message transport (and its completion-polling backend) is an
//! external collaborator. The core needs five things from it: whether the
//! process runs in cluster mode, which memory node is "here", vectorised
//! region fetches, the outbound task-finished message, and task offload.
//! The bundled [`LoopbackTransport`] is a single-node stand-in whose
//! fetches complete immediately.

pub mod transfer;

pub use transfer::{DataTransfer, TransferPoller, TransferQueue};

use crate::places::MemoryPlace;
use crate::task::Task;
use crate::types::{NodeIndex, StepId};
use crate::workflow::Workflow;
use std::sync::Arc;

/// Handle to a cluster copy step awaiting its transfer.
///
/// Completing the handle decrements the step's pending-predecessor
/// counter inside its workflow.
#[derive(Clone)]
pub struct PendingCopy {
    /// The workflow owning the copy step.
    pub workflow: Arc<Workflow>,
    /// The copy step to complete when the transfer lands.
    pub step: StepId,
}

/// Cluster message transport API.
pub trait ClusterTransport: Send + Sync {
    /// Whether this process participates in a cluster.
    fn in_cluster_mode(&self) -> bool;

    /// Index of this node.
    fn current_node(&self) -> NodeIndex;

    /// Number of nodes in the cluster (1 outside cluster mode).
    fn node_count(&self) -> usize {
        1
    }

    /// The cluster memory place of this node.
    fn current_memory_node(&self) -> MemoryPlace {
        MemoryPlace::cluster(self.current_node())
    }

    /// Fetches `total_fragments` region fragments from `source` in one
    /// vectorised request. Each entry of `copies` must be completed (via
    /// the transfer queue) when its data has landed.
    fn fetch_vector(
        &self,
        total_fragments: usize,
        copies: Vec<PendingCopy>,
        source: MemoryPlace,
        transfers: &TransferQueue,
    );

    /// Emits the task-finished message for an offloaded task.
    fn send_task_finished(&self, task: &Arc<Task>);

    /// Emits a per-region release message: the region of `task` now lives
    /// at `location`.
    fn release_region(
        &self,
        _task: &Arc<Task>,
        _region: crate::types::DataRegion,
        _location: MemoryPlace,
    ) {
    }

    /// Submits a task for execution on a remote node.
    fn offload_task(&self, task: &Arc<Task>, target: NodeIndex);
}

/// Single-node transport: never in cluster mode, fetches complete
/// immediately through the transfer queue, offloads run nowhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackTransport;

impl ClusterTransport for LoopbackTransport {
    fn in_cluster_mode(&self) -> bool {
        false
    }

    fn current_node(&self) -> NodeIndex {
        NodeIndex(0)
    }

    fn fetch_vector(
        &self,
        total_fragments: usize,
        copies: Vec<PendingCopy>,
        source: MemoryPlace,
        transfers: &TransferQueue,
    ) {
        crate::instrument::backend().fetch_submitted(
            total_fragments,
            source.node().unwrap_or(NodeIndex(0)),
        );
        for copy in copies {
            let transfer = DataTransfer::new(source, copy);
            transfer.mark_completed();
            transfers.add_pending(Arc::new(transfer));
        }
    }

    fn send_task_finished(&self, task: &Arc<Task>) {
        crate::instrument::backend().task_finished_sent(task.id());
    }

    fn offload_task(&self, _task: &Arc<Task>, _target: NodeIndex) {}
}
