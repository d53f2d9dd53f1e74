//! Shared helpers for unit and integration tests.

use crate::cluster::{ClusterTransport, DataTransfer, PendingCopy, TransferQueue};
use crate::places::MemoryPlace;
use crate::task::Task;
use crate::types::{DataRegion, NodeIndex, TaskId};
use parking_lot::Mutex;
use std::sync::{Arc, MutexGuard, OnceLock, PoisonError};

/// Serialises tests that mutate process environment variables.
pub fn env_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<std::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| std::sync::Mutex::new(()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// An outbound transport interaction, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A vectorised fetch was submitted.
    FetchVector {
        /// Total fragments requested.
        fragments: usize,
        /// Source memory place.
        source: MemoryPlace,
        /// Number of copy steps in the group.
        copies: usize,
    },
    /// A task-finished message left this node.
    TaskFinished(TaskId),
    /// A per-region release message left this node.
    ReleaseRegion(TaskId, DataRegion),
    /// A task was offloaded.
    Offload(TaskId, NodeIndex),
}

/// Cluster-mode transport that records every outbound interaction and
/// optionally holds transfers for manual completion.
pub struct RecordingTransport {
    node: NodeIndex,
    nodes: usize,
    auto_complete: bool,
    events: Mutex<Vec<TransportEvent>>,
    held_transfers: Mutex<Vec<Arc<DataTransfer>>>,
}

impl RecordingTransport {
    /// A transport for node `node` of `nodes`, completing fetches
    /// immediately.
    #[must_use]
    pub fn new(node: NodeIndex, nodes: usize) -> Self {
        Self {
            node,
            nodes,
            auto_complete: true,
            events: Mutex::new(Vec::new()),
            held_transfers: Mutex::new(Vec::new()),
        }
    }

    /// Same, but transfers stay pending until
    /// [`RecordingTransport::complete_all_transfers`] is called.
    #[must_use]
    pub fn with_manual_completion(node: NodeIndex, nodes: usize) -> Self {
        Self {
            auto_complete: false,
            ..Self::new(node, nodes)
        }
    }

    /// Snapshot of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().clone()
    }

    /// Number of fetch groups recorded.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, TransportEvent::FetchVector { .. }))
            .count()
    }

    /// Number of transfers held for manual completion.
    #[must_use]
    pub fn pending_transfer_count(&self) -> usize {
        self.held_transfers.lock().len()
    }

    /// Marks every held transfer as landed; the poller fires their
    /// completions on its next pass.
    pub fn complete_all_transfers(&self) {
        for transfer in self.held_transfers.lock().drain(..) {
            transfer.mark_completed();
        }
    }
}

impl ClusterTransport for RecordingTransport {
    fn in_cluster_mode(&self) -> bool {
        true
    }

    fn current_node(&self) -> NodeIndex {
        self.node
    }

    fn node_count(&self) -> usize {
        self.nodes
    }

    fn fetch_vector(
        &self,
        total_fragments: usize,
        copies: Vec<PendingCopy>,
        source: MemoryPlace,
        transfers: &TransferQueue,
    ) {
        self.events.lock().push(TransportEvent::FetchVector {
            fragments: total_fragments,
            source,
            copies: copies.len(),
        });
        for copy in copies {
            let transfer = Arc::new(DataTransfer::new(source, copy));
            if self.auto_complete {
                transfer.mark_completed();
            } else {
                self.held_transfers.lock().push(Arc::clone(&transfer));
            }
            transfers.add_pending(transfer);
        }
    }

    fn send_task_finished(&self, task: &Arc<Task>) {
        self.events
            .lock()
            .push(TransportEvent::TaskFinished(task.id()));
    }

    fn release_region(&self, task: &Arc<Task>, region: DataRegion, _location: MemoryPlace) {
        self.events
            .lock()
            .push(TransportEvent::ReleaseRegion(task.id(), region));
    }

    fn offload_task(&self, task: &Arc<Task>, target: NodeIndex) {
        self.events
            .lock()
            .push(TransportEvent::Offload(task.id(), target));
    }
}
