//! Shared helpers for the end-to-end tests.

use std::sync::Arc;
use std::time::{Duration, Instant};
use taskgrid::cluster::ClusterTransport;
use taskgrid::config::RuntimeConfig;
use taskgrid::runtime::{Runtime, RuntimeBuilder};

/// A configuration that keeps busy-wait budgets short enough for tests.
pub fn quick_config() -> RuntimeConfig {
    RuntimeConfig {
        polling_iterations: 200,
        transfer_poll_interval_us: 100,
        queue_threshold: 8,
        ..RuntimeConfig::default()
    }
}

/// Builds and initializes a runtime with an optional transport override.
pub fn start_runtime(transport: Option<Arc<dyn ClusterTransport>>) -> Runtime {
    let mut builder = RuntimeBuilder::new().config(quick_config());
    if let Some(transport) = transport {
        builder = builder.transport(transport);
    }
    let runtime = builder.preinitialize().expect("preinitialize");
    runtime.initialize().expect("initialize");
    runtime
}

/// Polls `pred` until it holds or the timeout elapses; returns whether it
/// held.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    pred()
}
