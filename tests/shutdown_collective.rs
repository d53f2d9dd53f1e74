//! Collective shutdown protocol tests.

mod common;

use common::{quick_config, wait_until};
use std::sync::Arc;
use std::time::Duration;
use taskgrid::cluster::{LoopbackTransport, TransferQueue};
use taskgrid::deps::InProcessRegistrar;
use taskgrid::executor::WorkerPool;
use taskgrid::hardware::CpuRegistry;
use taskgrid::memory::HomeNodeMap;
use taskgrid::runtime::RuntimeShared;
use taskgrid::scheduler::{IdleWake, Scheduler};

const TIMEOUT: Duration = Duration::from_secs(5);

fn pool_with_cpus(count: usize) -> Arc<WorkerPool> {
    let config = quick_config();
    let registry = Arc::new(CpuRegistry::new_for_test(count));
    let scheduler = Scheduler::new(&config, Arc::clone(&registry), &[]);
    let shared = Arc::new(RuntimeShared {
        config,
        registry,
        scheduler,
        registrar: Arc::new(InProcessRegistrar::new()),
        directory: Arc::new(HomeNodeMap::new()),
        transport: Arc::new(LoopbackTransport),
        transfers: Arc::new(TransferQueue::new()),
    });
    let pool = WorkerPool::initialize(Arc::clone(&shared)).expect("pool initialize");
    let pool_dyn: Arc<dyn IdleWake> = pool.clone();
    let waker: std::sync::Weak<dyn IdleWake> = Arc::downgrade(&pool_dyn);
    shared.scheduler.attach_waker(waker);
    pool
}

#[test]
fn four_cpu_collective_shutdown_joins_every_worker() {
    let pool = pool_with_cpus(4);
    assert_eq!(pool.total_threads(), 4);

    // Let every worker park before initiating the collective.
    assert!(wait_until(TIMEOUT, || pool.idle_worker_count() == 4));

    pool.shutdown();

    assert_eq!(pool.shutdown_threads(), 0);
    assert_eq!(pool.total_threads(), 4);
    let (controllers, main) = pool.controller_report();
    assert!(controllers >= 1 && controllers <= 4);
    // The first designated controller became the main one: the worker of
    // the first CPU, since all workers were parked on their own CPUs.
    assert_eq!(main, Some(0));
}

#[test]
fn single_cpu_worker_is_always_the_main_controller() {
    let pool = pool_with_cpus(1);
    assert!(wait_until(TIMEOUT, || pool.idle_worker_count() == 1));

    pool.shutdown();

    assert_eq!(pool.shutdown_threads(), 0);
    let (controllers, main) = pool.controller_report();
    assert_eq!(controllers, 1);
    assert_eq!(main, Some(0));
}

#[test]
fn shutdown_after_work_completes_cleanly() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskgrid::places::ComputePlace;
    use taskgrid::task::TaskBuilder;

    let runtime = common::start_runtime(None);
    let counter = Arc::new(AtomicUsize::new(0));
    let total = 32;
    let mut tasks = Vec::new();
    for i in 0..total {
        let c = Arc::clone(&counter);
        let task = TaskBuilder::new()
            .label(format!("work-{i}"))
            .body(move || {
                c.fetch_add(1, Ordering::AcqRel);
            })
            .build();
        runtime
            .submit_task(Arc::clone(&task), ComputePlace::host(0), Vec::new())
            .unwrap();
        tasks.push(task);
    }

    assert!(wait_until(TIMEOUT, || tasks.iter().all(|t| t.is_disposed())));
    assert_eq!(counter.load(Ordering::Acquire), total);

    runtime.shutdown().unwrap();
}
