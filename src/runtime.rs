//! Process-wide runtime lifecycle.
//!
//! The lifecycle is `preinitialize` (read configuration, discover CPUs,
//! build the scheduler trees) → `initialize` (spawn one worker per CPU
//! and the transfer poller) → `shutdown` (drain the poller, run the
//! collective worker shutdown). Re-entry is forbidden: each stage runs at
//! most once per runtime.

use crate::cluster::{ClusterTransport, LoopbackTransport, TransferPoller, TransferQueue};
use crate::config::RuntimeConfig;
use crate::deps::{DataAccess, DependencyRegistrar, InProcessRegistrar};
use crate::error::{Error, Result};
use crate::executor::{WorkerPool, WorkerThread};
use crate::hardware::{CpuRegistry, HardwareTopology, SystemTopology};
use crate::memory::{HomeNodeMap, MemoryDirectory};
use crate::places::{ComputePlace, Device};
use crate::scheduler::{IdleWake, ReadyTaskHint, Scheduler};
use crate::task::Task;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Shared context threaded through workers, workflows and the transfer
/// poller.
pub struct RuntimeShared {
    /// Resolved configuration.
    pub config: RuntimeConfig,
    /// CPU registry.
    pub registry: Arc<CpuRegistry>,
    /// The scheduler facade.
    pub scheduler: Arc<Scheduler>,
    /// Dependency-registrar collaborator.
    pub registrar: Arc<dyn DependencyRegistrar>,
    /// Memory-directory collaborator.
    pub directory: Arc<dyn MemoryDirectory>,
    /// Cluster-transport collaborator.
    pub transport: Arc<dyn ClusterTransport>,
    /// Pending data transfers.
    pub transfers: Arc<TransferQueue>,
}

const STATE_PREINITIALIZED: u8 = 0;
const STATE_INITIALIZED: u8 = 1;
const STATE_SHUT_DOWN: u8 = 2;

/// Builder for a [`Runtime`] with substituted collaborators.
pub struct RuntimeBuilder {
    config: Option<RuntimeConfig>,
    topology: Box<dyn HardwareTopology>,
    registrar: Option<Arc<dyn DependencyRegistrar>>,
    directory: Option<Arc<dyn MemoryDirectory>>,
    transport: Option<Arc<dyn ClusterTransport>>,
}

impl RuntimeBuilder {
    /// Starts a builder with the bundled collaborators.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: None,
            topology: Box::new(SystemTopology),
            registrar: None,
            directory: None,
            transport: None,
        }
    }

    /// Uses an explicit configuration instead of environment resolution.
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Substitutes the hardware-topology collaborator.
    #[must_use]
    pub fn topology(mut self, topology: impl HardwareTopology + 'static) -> Self {
        self.topology = Box::new(topology);
        self
    }

    /// Substitutes the dependency registrar.
    #[must_use]
    pub fn registrar(mut self, registrar: Arc<dyn DependencyRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Substitutes the memory directory.
    #[must_use]
    pub fn directory(mut self, directory: Arc<dyn MemoryDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Substitutes the cluster transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn ClusterTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Reads the configuration, registers the CPUs allowed by the process
    /// affinity mask, and builds the scheduler trees. No thread is
    /// spawned yet.
    pub fn preinitialize(self) -> Result<Runtime> {
        let mut config = match self.config {
            Some(config) => config,
            None => RuntimeConfig::from_env()?,
        };
        config.normalize();

        if config.verbose_cluster_messages {
            crate::instrument::set_backend(Box::new(crate::instrument::VerboseBackend));
        }

        let registry = Arc::new(CpuRegistry::preinitialize(self.topology.as_ref())?);
        if registry.total_cpus() == 0 {
            return Err(Error::new(crate::error::ErrorKind::Configuration)
                .with_context("process affinity mask allows no usable CPU"));
        }

        let transport: Arc<dyn ClusterTransport> = self
            .transport
            .unwrap_or_else(|| Arc::new(LoopbackTransport));

        let device_places = [
            (Device::Cuda, self.topology.device_count(Device::Cuda)),
            (Device::OpenCl, self.topology.device_count(Device::OpenCl)),
            (
                Device::Cluster,
                if transport.in_cluster_mode() {
                    transport.node_count()
                } else {
                    0
                },
            ),
        ];
        let scheduler = Scheduler::new(&config, Arc::clone(&registry), &device_places);

        let shared = Arc::new(RuntimeShared {
            config,
            registry,
            scheduler,
            registrar: self
                .registrar
                .unwrap_or_else(|| Arc::new(InProcessRegistrar::new())),
            directory: self.directory.unwrap_or_else(|| Arc::new(HomeNodeMap::new())),
            transport,
            transfers: Arc::new(TransferQueue::new()),
        });

        Ok(Runtime {
            shared,
            pool: Mutex::new(None),
            poller: Mutex::new(None),
            state: AtomicU8::new(STATE_PREINITIALIZED),
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The runtime: owns the worker pool and the transfer poller.
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    poller: Mutex<Option<TransferPoller>>,
    state: AtomicU8,
}

impl Runtime {
    /// Preinitializes with environment configuration and the bundled
    /// collaborators.
    pub fn preinitialize() -> Result<Self> {
        RuntimeBuilder::new().preinitialize()
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// The shared context.
    #[must_use]
    pub fn shared(&self) -> &Arc<RuntimeShared> {
        &self.shared
    }

    /// The scheduler facade.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.shared.scheduler
    }

    /// Spawns one worker per registered CPU and registers the transfer
    /// poller. Each worker binds to its CPU, initializes it, then parks
    /// until first activation.
    pub fn initialize(&self) -> Result<()> {
        self.state
            .compare_exchange(
                STATE_PREINITIALIZED,
                STATE_INITIALIZED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::lifecycle("initialize called out of order"))?;

        let pool = WorkerPool::initialize(Arc::clone(&self.shared))?;
        let pool_concrete: Arc<WorkerPool> = Arc::clone(&pool);
        let pool_dyn: Arc<dyn IdleWake> = pool_concrete;
        let waker: Weak<dyn IdleWake> = Arc::downgrade(&pool_dyn);
        self.shared.scheduler.attach_waker(waker);
        *self.pool.lock() = Some(pool);

        *self.poller.lock() = Some(TransferPoller::register(Arc::clone(&self.shared)));
        Ok(())
    }

    /// Submits a ready task with its declared accesses.
    pub fn submit_task(
        &self,
        task: Arc<Task>,
        target: ComputePlace,
        accesses: Vec<DataAccess>,
    ) -> Result<()> {
        if self.state.load(Ordering::Acquire) != STATE_INITIALIZED {
            return Err(Error::lifecycle("submit_task outside initialize/shutdown"));
        }
        task.set_target(target);
        task.set_weak_only(!accesses.is_empty() && accesses.iter().all(DataAccess::is_weak));
        self.shared.registrar.register_task_accesses(&task, accesses);

        let origin = WorkerThread::current().map(|w| w.cpu().compute_place());
        self.shared
            .scheduler
            .add_ready_task_and_wake(task, origin, ReadyTaskHint::None);
        Ok(())
    }

    /// Shuts the runtime down: drains the transfer poller, then runs the
    /// collective worker shutdown. Returns once every worker thread has
    /// been joined.
    pub fn shutdown(&self) -> Result<()> {
        self.state
            .compare_exchange(
                STATE_INITIALIZED,
                STATE_SHUT_DOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::lifecycle("shutdown called out of order"))?;

        // The poller drains before any worker join completes.
        if let Some(poller) = self.poller.lock().take() {
            poller.unregister();
        }
        if let Some(pool) = self.pool.lock().take() {
            pool.shutdown();
        }
        Ok(())
    }

    /// Whether `shutdown` has completed.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_SHUT_DOWN
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) == STATE_INITIALIZED {
            let _ = self.shutdown();
        }
    }
}
