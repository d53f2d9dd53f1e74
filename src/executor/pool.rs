//! Worker pool: spawn, idle bookkeeping, migration, collective shutdown.
//!
//! # Shutdown protocol
//!
//! The initiating thread sets `must_exit`, seeds `shutdown_threads` with
//! the total thread count, and designates one *shutdown controller* per
//! CPU still accepting work (the first one becomes the *main* controller).
//! Each controller drains the idle deque — signal, resume, join — and
//! stops when no idle worker remains and it is either a non-main
//! controller (the main one mops up stragglers) or it is itself the last
//! worker alive. Controllers are kept in LIFO order so the initiator
//! joins the main controller last. Every worker decrements
//! `shutdown_threads` on its way out; after the join loop the counter is
//! zero and the total thread count is unchanged.

use crate::error::{Error, Result};
use crate::executor::worker::WorkerThread;
use crate::hardware::{affinity, Cpu};
use crate::runtime::RuntimeShared;
use crate::scheduler::IdleWake;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Pool of one worker per enabled CPU.
pub struct WorkerPool {
    shared: Arc<RuntimeShared>,
    workers: Vec<Arc<WorkerThread>>,
    idle_workers: Mutex<VecDeque<Arc<WorkerThread>>>,

    total_threads: usize,
    shutdown_threads: AtomicUsize,
    must_exit: AtomicBool,

    /// Per-CPU shutdown controller, virtual-id indexed.
    controllers: Mutex<Vec<Option<Arc<WorkerThread>>>>,
    main_controller: Mutex<Option<Arc<WorkerThread>>>,
}

impl WorkerPool {
    /// Spawns one worker per registered CPU. Each worker binds to its
    /// CPU, initializes it, then suspends awaiting first activation; the
    /// pool resumes them all before returning.
    pub fn initialize(shared: Arc<RuntimeShared>) -> Result<Arc<Self>> {
        let cpus = shared.registry.cpus().to_vec();
        let workers: Vec<Arc<WorkerThread>> = cpus
            .iter()
            .enumerate()
            .map(|(index, cpu)| WorkerThread::new(index, Arc::clone(cpu)))
            .collect();

        let pool = Arc::new(Self {
            shared,
            workers: workers.clone(),
            idle_workers: Mutex::new(VecDeque::new()),
            total_threads: cpus.len(),
            shutdown_threads: AtomicUsize::new(0),
            must_exit: AtomicBool::new(false),
            controllers: Mutex::new(vec![None; cpus.len()]),
            main_controller: Mutex::new(None),
        });

        for worker in &workers {
            let pool_ref = Arc::clone(&pool);
            let worker_ref = Arc::clone(worker);
            let name = format!(
                "{}-{}",
                pool.shared.config.thread_name_prefix,
                worker.index()
            );
            let handle = std::thread::Builder::new()
                .name(name)
                .stack_size(pool.shared.config.worker_stack_size)
                .spawn(move || worker_main(&pool_ref, &worker_ref))
                .map_err(|e| Error::os("spawning worker thread").with_source(e))?;
            worker.store_join_handle(handle);
        }

        // First activation: every worker wakes on its own CPU.
        for worker in &workers {
            worker.set_resume_hint(worker.cpu());
            worker.resume();
        }

        Ok(pool)
    }

    /// Number of workers the pool owns.
    #[must_use]
    pub fn total_threads(&self) -> usize {
        self.total_threads
    }

    /// Whether shutdown has been initiated.
    #[must_use]
    pub fn must_exit(&self) -> bool {
        self.must_exit.load(Ordering::Acquire)
    }

    /// Number of workers currently parked in the idle deque.
    #[must_use]
    pub fn idle_worker_count(&self) -> usize {
        self.idle_workers.lock().len()
    }

    fn add_idle_worker(&self, worker: &Arc<WorkerThread>) {
        let mut idle = self.idle_workers.lock();
        if !idle.iter().any(|w| Arc::ptr_eq(w, worker)) {
            idle.push_back(Arc::clone(worker));
        }
    }

    /// Pops an idle worker, preferring one already bound to `cpu`.
    pub fn get_idle_thread(&self, cpu: &Arc<Cpu>, pop: bool) -> Option<Arc<WorkerThread>> {
        let mut idle = self.idle_workers.lock();
        let position = idle
            .iter()
            .position(|w| w.cpu().virtual_id() == cpu.virtual_id())
            .unwrap_or(0);
        if pop {
            let len = idle.len();
            idle.remove(position.min(len.checked_sub(1)?))
        } else {
            idle.get(position).cloned()
        }
    }

    fn resume_worker_on(&self, worker: &Arc<WorkerThread>, cpu: &Arc<Cpu>) {
        worker.set_resume_hint(Arc::clone(cpu));
        if worker.cpu().virtual_id() != cpu.virtual_id() {
            // Migration: rebind the kernel affinity before resumption.
            let _ = affinity::bind_thread(worker.tid(), cpu.system_id());
        }
        worker.resume();
    }

    /// Collective shutdown. Returns once every worker thread has been
    /// joined; afterwards `shutdown_threads` is zero.
    pub fn shutdown(&self) {
        self.must_exit.store(true, Ordering::Release);
        self.shutdown_threads
            .store(self.total_threads, Ordering::Release);

        // Designate controllers, LIFO so the main one is joined last.
        let mut participating: VecDeque<Arc<Cpu>> = VecDeque::new();
        for cpu in self.shared.registry.cpus() {
            if !cpu.accepts_work() {
                continue;
            }
            while cpu.is_being_initialized() {
                std::thread::yield_now();
            }

            let mut idle = self.get_idle_thread(cpu, true);
            // Threads can lag behind (not idle yet), but we need at least
            // one; controllers already running can deplete the rest.
            while idle.is_none() && self.shutdown_threads.load(Ordering::Acquire) > 0 {
                std::thread::yield_now();
                idle = self.get_idle_thread(cpu, true);
            }

            if let Some(worker) = idle {
                {
                    let mut controllers = self.controllers.lock();
                    let slot = &mut controllers[cpu.virtual_id() as usize];
                    debug_assert!(slot.is_none(), "cpu already has a shutdown controller");
                    *slot = Some(Arc::clone(&worker));
                }
                {
                    let mut main = self.main_controller.lock();
                    if main.is_none() {
                        *main = Some(Arc::clone(&worker));
                    }
                }
                worker.signal_shutdown();
                self.resume_worker_on(&worker, cpu);
                participating.push_front(Arc::clone(cpu));
            }
        }

        debug_assert!(self.main_controller.lock().is_some() || self.total_threads == 0);

        for cpu in participating {
            let controller = self.controllers.lock()[cpu.virtual_id() as usize].clone();
            if let Some(controller) = controller {
                if let Some(handle) = controller.take_join_handle() {
                    let _ = handle.join();
                }
            }
        }

        debug_assert_eq!(self.shutdown_threads.load(Ordering::Acquire), 0);
    }

    fn is_controller_of(&self, worker: &Arc<WorkerThread>, cpu: &Arc<Cpu>) -> bool {
        self.controllers.lock()[cpu.virtual_id() as usize]
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, worker))
    }

    fn is_main_controller(&self, worker: &Arc<WorkerThread>) -> bool {
        self.main_controller
            .lock()
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, worker))
    }

    /// Runs a worker's part of the collective: controllers collect and
    /// join the idle workers of their CPU.
    fn thread_shutdown_sequence(&self, worker: &Arc<WorkerThread>) {
        let cpu = worker.cpu();
        if !self.is_controller_of(worker, &cpu) {
            return;
        }

        let is_main = self.is_main_controller(worker);
        loop {
            let next = self.get_idle_thread(&cpu, true);
            if let Some(next) = next {
                debug_assert!(next.current_task().is_none());
                next.signal_shutdown();
                self.resume_worker_on(&next, &cpu);
                if let Some(handle) = next.take_join_handle() {
                    let _ = handle.join();
                }
            } else if !is_main {
                // Let the main controller handle lagging threads.
                break;
            } else if self.shutdown_threads.load(Ordering::Acquire) == 1 {
                // Main controller and last worker alive.
                break;
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Snapshot of the shutdown counter (tests).
    #[must_use]
    pub fn shutdown_threads(&self) -> usize {
        self.shutdown_threads.load(Ordering::Acquire)
    }

    /// Controller designations after a shutdown (tests): per-CPU entries
    /// plus which worker was main.
    #[must_use]
    pub fn controller_report(&self) -> (usize, Option<usize>) {
        let count = self
            .controllers
            .lock()
            .iter()
            .filter(|c| c.is_some())
            .count();
        let main = self.main_controller.lock().as_ref().map(|w| w.index());
        (count, main)
    }
}

impl IdleWake for WorkerPool {
    fn resume_idle(&self, cpu: &Arc<Cpu>) {
        if let Some(worker) = self.get_idle_thread(cpu, true) {
            self.resume_worker_on(&worker, cpu);
        }
    }
}

/// The body every worker thread runs.
fn worker_main(pool: &Arc<WorkerPool>, me: &Arc<WorkerThread>) {
    me.set_tid(affinity::current_tid());
    let cpu = me.cpu();
    let _ = affinity::bind_thread(me.tid(), cpu.system_id());

    WorkerThread::set_current(me);
    crate::instrument::backend().thread_created(me.index());

    // Initialize the CPU before the thread can observe a shutdown signal.
    cpu.thread_initialization();

    // The activator unblocks us when the runtime is ready.
    me.suspend();
    me.apply_resume_hint();

    loop {
        if me.must_shutdown() {
            pool.thread_shutdown_sequence(me);
            break;
        }

        let cpu = me.cpu();
        if let Some(task) = pool.shared.scheduler.get_ready_task(&cpu) {
            me.set_current_task(Some(Arc::clone(&task)));
            crate::workflow::execute_task(
                &pool.shared,
                &task,
                cpu.compute_place(),
                cpu.compute_place().memory_place(),
            );
            me.set_current_task(None);
        } else {
            // The leaf marked us idle; park until someone has work.
            pool.add_idle_worker(me);
            // A producer may have placed work between the idle mark and
            // the deque registration; recheck before sleeping. Staying in
            // the deque is fine — a spurious resume is buffered.
            if pool.shared.scheduler.has_local_work(&cpu) {
                continue;
            }
            me.suspend();
            me.apply_resume_hint();
        }
    }

    WorkerThread::clear_current();
    pool.shutdown_threads.fetch_sub(1, Ordering::AcqRel);
    crate::instrument::backend().thread_exited(me.index());
}
