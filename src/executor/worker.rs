//! Worker threads.
//!
//! One worker per enabled CPU, kernel-pinned. A worker parks on its own
//! suspension primitive when the scheduler has nothing for it; whoever
//! resumes it first writes the `cpu_to_be_resumed_on` hint (and rebinds
//! the kernel affinity when migrating), and the worker re-reads the hint
//! after waking.

use crate::hardware::Cpu;
use crate::task::Task;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::thread::JoinHandle;

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<WorkerThread>>> = const { RefCell::new(None) };
}

/// Binary-semaphore suspension primitive.
///
/// A resume before the suspend is not lost: the notification is consumed
/// by the next `suspend`.
#[derive(Default)]
struct Suspension {
    notified: StdMutex<bool>,
    condvar: Condvar,
}

impl Suspension {
    fn suspend(&self) {
        let mut notified = self.notified.lock().expect("suspension lock poisoned");
        while !*notified {
            notified = self
                .condvar
                .wait(notified)
                .expect("suspension wait poisoned");
        }
        *notified = false;
    }

    fn resume(&self) {
        {
            let mut notified = self.notified.lock().expect("suspension lock poisoned");
            *notified = true;
        }
        self.condvar.notify_one();
    }
}

/// An OS worker thread bound to a CPU.
pub struct WorkerThread {
    index: usize,
    tid: AtomicI32,
    suspension: Suspension,
    cpu: Mutex<Arc<Cpu>>,
    /// Written only by the resumer, re-read by the worker after waking.
    cpu_to_be_resumed_on: Mutex<Option<Arc<Cpu>>>,
    must_shutdown: AtomicBool,
    current_task: Mutex<Option<Arc<Task>>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerThread {
    /// Creates a worker record for `cpu`.
    #[must_use]
    pub fn new(index: usize, cpu: Arc<Cpu>) -> Arc<Self> {
        Arc::new(Self {
            index,
            tid: AtomicI32::new(0),
            suspension: Suspension::default(),
            cpu: Mutex::new(cpu),
            cpu_to_be_resumed_on: Mutex::new(None),
            must_shutdown: AtomicBool::new(false),
            current_task: Mutex::new(None),
            join_handle: Mutex::new(None),
        })
    }

    /// The worker currently running on this thread, if any. Non-worker
    /// callers observe `None`.
    #[must_use]
    pub fn current() -> Option<Arc<WorkerThread>> {
        CURRENT_WORKER.with(|cell| cell.borrow().clone())
    }

    pub(crate) fn set_current(worker: &Arc<WorkerThread>) {
        CURRENT_WORKER.with(|cell| *cell.borrow_mut() = Some(Arc::clone(worker)));
    }

    pub(crate) fn clear_current() {
        CURRENT_WORKER.with(|cell| cell.borrow_mut().take());
    }

    /// Instrumentation id of the worker.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Kernel thread id, once the thread has started.
    #[must_use]
    pub fn tid(&self) -> i32 {
        self.tid.load(Ordering::Acquire)
    }

    pub(crate) fn set_tid(&self, tid: i32) {
        self.tid.store(tid, Ordering::Release);
    }

    /// The CPU the worker is bound to.
    #[must_use]
    pub fn cpu(&self) -> Arc<Cpu> {
        Arc::clone(&self.cpu.lock())
    }

    /// Sets the migration hint. Only the resumer writes this.
    pub fn set_resume_hint(&self, cpu: Arc<Cpu>) {
        *self.cpu_to_be_resumed_on.lock() = Some(cpu);
    }

    /// Applies a pending migration hint after waking.
    pub fn apply_resume_hint(&self) {
        if let Some(cpu) = self.cpu_to_be_resumed_on.lock().take() {
            *self.cpu.lock() = cpu;
        }
    }

    /// Parks until resumed.
    pub fn suspend(&self) {
        crate::instrument::backend().thread_suspended(self.index);
        self.suspension.suspend();
        crate::instrument::backend()
            .thread_resumed(self.index, self.cpu().virtual_id());
    }

    /// Unparks the worker.
    pub fn resume(&self) {
        self.suspension.resume();
    }

    /// Signals the worker to exit its loop at the next wake-up.
    pub fn signal_shutdown(&self) {
        self.must_shutdown.store(true, Ordering::Release);
    }

    /// Whether shutdown was signalled.
    #[must_use]
    pub fn must_shutdown(&self) -> bool {
        self.must_shutdown.load(Ordering::Acquire)
    }

    /// The task this worker is executing right now.
    #[must_use]
    pub fn current_task(&self) -> Option<Arc<Task>> {
        self.current_task.lock().clone()
    }

    pub(crate) fn set_current_task(&self, task: Option<Arc<Task>>) {
        *self.current_task.lock() = task;
    }

    pub(crate) fn store_join_handle(&self, handle: JoinHandle<()>) {
        *self.join_handle.lock() = Some(handle);
    }

    pub(crate) fn take_join_handle(&self) -> Option<JoinHandle<()>> {
        self.join_handle.lock().take()
    }
}

impl core::fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerThread")
            .field("index", &self.index)
            .field("tid", &self.tid())
            .field("cpu", &self.cpu().virtual_id())
            .field("must_shutdown", &self.must_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn resume_before_suspend_is_not_lost() {
        let suspension = Arc::new(Suspension::default());
        suspension.resume();
        // Returns immediately: the notification was buffered.
        suspension.suspend();
    }

    #[test]
    fn suspend_blocks_until_resume() {
        let worker = WorkerThread::new(0, Arc::new(Cpu::new(0, 0)));
        let w = Arc::clone(&worker);
        let handle = std::thread::spawn(move || {
            w.suspend();
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        worker.resume();
        handle.join().unwrap();
    }

    #[test]
    fn resume_hint_migrates_the_worker() {
        let from = Arc::new(Cpu::new(0, 0));
        let to = Arc::new(Cpu::new(1, 1));
        let worker = WorkerThread::new(0, from);
        worker.set_resume_hint(Arc::clone(&to));
        worker.apply_resume_hint();
        assert_eq!(worker.cpu().virtual_id(), 1);
        // Hint is consumed.
        worker.apply_resume_hint();
        assert_eq!(worker.cpu().virtual_id(), 1);
    }

    #[test]
    fn non_worker_thread_observes_no_current() {
        assert!(WorkerThread::current().is_none());
    }
}
