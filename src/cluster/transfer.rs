//! Data-transfer completion polling.
//!
//! Pending transfers sit in a global queue polled at a runtime-controlled
//! cadence by a background service. Each entry references a
//! [`DataTransfer`] whose completion handler decrements the owning copy
//! step. The service is registered once at startup and unregistered at
//! shutdown; it drains completed transfers before worker join completes.

use crate::cluster::PendingCopy;
use crate::places::MemoryPlace;
use crate::runtime::RuntimeShared;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// One in-flight region transfer.
pub struct DataTransfer {
    source: MemoryPlace,
    completed: AtomicBool,
    copy: parking_lot::Mutex<Option<PendingCopy>>,
}

impl DataTransfer {
    /// Creates a pending transfer for a copy step.
    #[must_use]
    pub fn new(source: MemoryPlace, copy: PendingCopy) -> Self {
        Self {
            source,
            completed: AtomicBool::new(false),
            copy: parking_lot::Mutex::new(Some(copy)),
        }
    }

    /// Source memory place of the transfer.
    #[must_use]
    pub fn source(&self) -> MemoryPlace {
        self.source
    }

    /// Marks the transfer landed. The poller runs the completion on its
    /// next pass.
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    /// Whether the data has landed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    fn take_copy(&self) -> Option<PendingCopy> {
        self.copy.lock().take()
    }
}

/// Global queue of pending transfers.
#[derive(Default)]
pub struct TransferQueue {
    pending: SegQueue<Arc<DataTransfer>>,
}

impl TransferQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pending transfer to be polled for completion.
    pub fn add_pending(&self, transfer: Arc<DataTransfer>) {
        self.pending.push(transfer);
    }

    /// Number of transfers currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no transfer is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// One polling pass: completes landed transfers, requeues the rest.
    /// Returns the number of completions fired.
    pub fn poll_once(&self, shared: &Arc<RuntimeShared>) -> usize {
        let mut fired = 0;
        let mut still_pending = Vec::new();
        while let Some(transfer) = self.pending.pop() {
            if transfer.is_completed() {
                if let Some(copy) = transfer.take_copy() {
                    copy.workflow.finish_cluster_copy(shared, copy.step);
                    fired += 1;
                }
            } else {
                still_pending.push(transfer);
            }
        }
        for transfer in still_pending {
            self.pending.push(transfer);
        }
        fired
    }
}

/// Background polling service for transfer completion.
pub struct TransferPoller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TransferPoller {
    /// Registers the polling service: spawns the poller thread at the
    /// configured cadence.
    #[must_use]
    pub fn register(shared: Arc<RuntimeShared>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let interval = Duration::from_micros(shared.config.transfer_poll_interval_us);
        let handle = std::thread::Builder::new()
            .name(format!("{}-transfers", shared.config.thread_name_prefix))
            .spawn(move || {
                loop {
                    shared.transfers.poll_once(&shared);
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    std::thread::sleep(interval);
                }
                // Final drain: fire everything that has landed. Transfers
                // that never complete belong to the transport's retry
                // policy, not to this service.
                shared.transfers.poll_once(&shared);
            })
            .expect("failed to spawn transfer poller thread");
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Unregisters the service, draining completed transfers first.
    pub fn unregister(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TransferPoller {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
