//! End-to-end runtime tests: dependency chains, taskwait workflows, and
//! sustained submission across CPUs.

mod common;

use common::{quick_config, start_runtime, wait_until};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskgrid::deps::{AccessType, DataAccess, DependencyScratch, InProcessRegistrar};
use taskgrid::places::{ComputePlace, MemoryPlace};
use taskgrid::runtime::RuntimeBuilder;
use taskgrid::task::TaskBuilder;
use taskgrid::test_utils::RecordingTransport;
use taskgrid::types::{DataRegion, NodeIndex};
use taskgrid::workflow::setup_taskwait_workflow;

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn dependency_chain_runs_in_order() {
    let registrar = Arc::new(InProcessRegistrar::new());
    let runtime = RuntimeBuilder::new()
        .config(quick_config())
        .registrar(registrar.clone())
        .preinitialize()
        .unwrap();
    runtime.initialize().unwrap();

    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let make = |name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>| {
        let log = Arc::clone(log);
        TaskBuilder::new()
            .label(name)
            .body(move || log.lock().unwrap().push(name))
            .build()
    };

    let a = make("a", &log);
    let b = make("b", &log);
    let c = make("c", &log);
    b.set_target(ComputePlace::host(0));
    c.set_target(ComputePlace::host(0));
    registrar.add_successor(a.id(), Arc::clone(&b));
    registrar.add_successor(b.id(), Arc::clone(&c));

    runtime
        .submit_task(Arc::clone(&a), ComputePlace::host(0), Vec::new())
        .unwrap();

    assert!(wait_until(TIMEOUT, || c.is_disposed()));
    assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    assert!(a.is_disposed() && b.is_disposed());

    runtime.shutdown().unwrap();
}

#[test]
fn sustained_submission_completes_every_task() {
    let runtime = start_runtime(None);
    let counter = Arc::new(AtomicUsize::new(0));
    let total = 200;

    let mut tasks = Vec::new();
    for i in 0..total {
        let c = Arc::clone(&counter);
        let task = TaskBuilder::new()
            .priority(i64::from(i % 7))
            .body(move || {
                c.fetch_add(1, Ordering::AcqRel);
            })
            .build();
        let access = DataAccess::new(
            DataRegion::new(0x1_0000 + (i as usize) * 64, 64),
            AccessType::ReadWrite,
            Some(MemoryPlace::host(0)),
        );
        runtime
            .submit_task(Arc::clone(&task), ComputePlace::host(0), vec![access])
            .unwrap();
        tasks.push(task);
    }

    assert!(wait_until(TIMEOUT, || tasks.iter().all(|t| t.is_disposed())));
    assert_eq!(counter.load(Ordering::Acquire), total as usize);

    runtime.shutdown().unwrap();
}

#[test]
fn taskwait_fragment_without_output_location_releases_immediately() {
    let registrar = Arc::new(InProcessRegistrar::new());
    let runtime = RuntimeBuilder::new()
        .config(quick_config())
        .registrar(registrar.clone())
        .preinitialize()
        .unwrap();

    let task = TaskBuilder::new().label("waiter").body(|| {}).build();
    let region = DataRegion::new(0x5000, 32);
    let mut fragment = DataAccess::new(region, AccessType::ReadWrite, Some(MemoryPlace::host(0)));
    let mut scratch = DependencyScratch::default();

    setup_taskwait_workflow(runtime.shared(), &task, &mut fragment, &mut scratch);

    assert_eq!(
        registrar.taskwait_releases(),
        vec![(task.id(), region, false)]
    );
}

#[test]
fn taskwait_fragment_with_local_output_releases_synchronously() {
    let registrar = Arc::new(InProcessRegistrar::new());
    let runtime = RuntimeBuilder::new()
        .config(quick_config())
        .registrar(registrar.clone())
        .preinitialize()
        .unwrap();

    let task = TaskBuilder::new().label("waiter").body(|| {}).build();
    let region = DataRegion::new(0x6000, 32);
    let mut fragment = DataAccess::new(region, AccessType::ReadWrite, Some(MemoryPlace::host(0)))
        .with_output_location(MemoryPlace::host(0));
    let mut scratch = DependencyScratch::default();

    setup_taskwait_workflow(runtime.shared(), &task, &mut fragment, &mut scratch);

    // Host-to-host copy is a null step: the mini-workflow ran to its
    // notification inline, releasing the fragment with first=true.
    assert_eq!(
        registrar.taskwait_releases(),
        vec![(task.id(), region, true)]
    );
}

#[test]
fn taskwait_fragment_with_remote_source_waits_for_the_transfer() {
    let registrar = Arc::new(InProcessRegistrar::new());
    let transport = Arc::new(RecordingTransport::with_manual_completion(NodeIndex(0), 2));
    let runtime = RuntimeBuilder::new()
        .config(quick_config())
        .registrar(registrar.clone())
        .transport(transport.clone())
        .preinitialize()
        .unwrap();
    runtime.initialize().unwrap();

    let task = TaskBuilder::new().label("waiter").body(|| {}).build();
    let region = DataRegion::new(0x7000, 32);
    let mut fragment = DataAccess::new(
        region,
        AccessType::ReadWrite,
        Some(MemoryPlace::cluster(NodeIndex(1))),
    )
    .with_output_location(MemoryPlace::host(0));
    let mut scratch = DependencyScratch::default();

    setup_taskwait_workflow(runtime.shared(), &task, &mut fragment, &mut scratch);

    // The copy is in flight: no release yet.
    assert_eq!(transport.fetch_count(), 1);
    std::thread::sleep(Duration::from_millis(30));
    assert!(registrar.taskwait_releases().is_empty());

    transport.complete_all_transfers();
    assert!(wait_until(TIMEOUT, || {
        registrar.taskwait_releases() == vec![(task.id(), region, true)]
    }));

    runtime.shutdown().unwrap();
}
