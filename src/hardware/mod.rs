//! CPU registry, process affinity, and the hardware-topology seam.
//!
//! `preinitialize` reads the process CPU affinity mask and registers each
//! CPU reported by hardware discovery iff its system id appears in the
//! mask. The total CPU count is fixed from that point on.

pub mod affinity;
pub mod cpu;

pub use cpu::{Cpu, CpuState};

use crate::error::Result;
use crate::places::{ComputePlace, Device};
use crate::util::Bitset;
use parking_lot::Mutex;
use std::sync::Arc;

/// One compute node reported by hardware discovery.
#[derive(Debug, Clone, Copy)]
pub struct HardwareNode {
    /// Kernel CPU id of the node.
    pub system_cpu_id: usize,
}

/// Hardware discovery seam.
///
/// Topology backends are external collaborators; the bundled
/// [`SystemTopology`] reports one host CPU per unit of available
/// parallelism, which is sufficient for single-node deployments and tests.
pub trait HardwareTopology: Send + Sync {
    /// Enumerates host compute nodes.
    fn compute_nodes(&self) -> Vec<HardwareNode>;

    /// Number of compute places for a device kind.
    fn device_count(&self, device: Device) -> usize;
}

/// Default topology: one host CPU per unit of available parallelism,
/// system id equal to the index.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTopology;

impl HardwareTopology for SystemTopology {
    fn compute_nodes(&self) -> Vec<HardwareNode> {
        let count = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        (0..count)
            .map(|system_cpu_id| HardwareNode { system_cpu_id })
            .collect()
    }

    fn device_count(&self, device: Device) -> usize {
        match device {
            Device::Host => self.compute_nodes().len(),
            Device::Cuda | Device::OpenCl | Device::Cluster => 0,
        }
    }
}

/// Registry of the CPUs this process may run workers on.
#[derive(Debug)]
pub struct CpuRegistry {
    cpus: Vec<Arc<Cpu>>,
    idle: Mutex<Bitset>,
}

impl CpuRegistry {
    /// Builds the registry from hardware discovery filtered by the process
    /// affinity mask. The CPU count is fixed thereafter.
    pub fn preinitialize(topology: &dyn HardwareTopology) -> Result<Self> {
        let mask = affinity::process_mask()?;
        let mut cpus = Vec::new();
        for node in topology.compute_nodes() {
            let allowed = mask.get(node.system_cpu_id).copied().unwrap_or(false);
            if allowed {
                let virtual_id = u32::try_from(cpus.len()).expect("cpu count fits u32");
                cpus.push(Arc::new(Cpu::new(virtual_id, node.system_cpu_id)));
            }
        }
        let idle = Mutex::new(Bitset::new(cpus.len()));
        Ok(Self { cpus, idle })
    }

    /// Builds a registry with `count` synthetic CPUs (system id = index).
    #[doc(hidden)]
    #[must_use]
    pub fn new_for_test(count: usize) -> Self {
        let cpus: Vec<Arc<Cpu>> = (0..count)
            .map(|i| Arc::new(Cpu::new(u32::try_from(i).expect("cpu count fits u32"), i)))
            .collect();
        for cpu in &cpus {
            cpu.thread_initialization();
        }
        Self {
            idle: Mutex::new(Bitset::new(cpus.len())),
            cpus,
        }
    }

    /// Number of registered CPUs.
    #[must_use]
    pub fn total_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// All registered CPUs, virtual-id order.
    #[must_use]
    pub fn cpus(&self) -> &[Arc<Cpu>] {
        &self.cpus
    }

    /// The CPU with the given virtual id.
    #[must_use]
    pub fn cpu(&self, virtual_id: u32) -> &Arc<Cpu> {
        &self.cpus[virtual_id as usize]
    }

    /// Marks a CPU idle in the idle set.
    pub fn cpu_becomes_idle(&self, cpu: &Cpu) {
        let mut idle = self.idle.lock();
        idle.set(cpu.virtual_id() as usize);
        cpu.set_state(CpuState::Idle);
    }

    /// Clears a CPU from the idle set.
    pub fn unidle_cpu(&self, cpu: &Cpu) {
        let mut idle = self.idle.lock();
        idle.clear(cpu.virtual_id() as usize);
        cpu.set_state(CpuState::Active);
    }

    /// Whether the given CPU is currently in the idle set.
    #[must_use]
    pub fn is_idle(&self, cpu: &Cpu) -> bool {
        self.idle.lock().get(cpu.virtual_id() as usize)
    }

    /// Number of CPUs currently idle.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().count()
    }

    /// Pops an idle CPU (lowest virtual id first) and returns its compute
    /// place. With `force`, falls back to the first registered CPU even
    /// when none is idle.
    #[must_use]
    pub fn get_idle_compute_place(&self, force: bool) -> Option<ComputePlace> {
        let taken = {
            let mut idle = self.idle.lock();
            idle.take_first_set()
        };
        match taken {
            Some(index) => {
                let cpu = &self.cpus[index];
                cpu.set_state(CpuState::Active);
                Some(cpu.compute_place())
            }
            None if force && !self.cpus.is_empty() => Some(self.cpus[0].compute_place()),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(n: usize) -> CpuRegistry {
        CpuRegistry::new_for_test(n)
    }

    #[test]
    fn preinitialize_respects_affinity_mask() {
        let reg = CpuRegistry::preinitialize(&SystemTopology).unwrap();
        assert!(reg.total_cpus() >= 1);
        for (i, cpu) in reg.cpus().iter().enumerate() {
            assert_eq!(cpu.virtual_id() as usize, i);
        }
    }

    #[test]
    fn idle_roundtrip_leaves_bitset_unchanged() {
        let reg = registry(4);
        let before = reg.idle_count();
        reg.cpu_becomes_idle(&reg.cpu(2).clone());
        reg.unidle_cpu(&reg.cpu(2).clone());
        assert_eq!(reg.idle_count(), before);
    }

    #[test]
    fn get_idle_compute_place_prefers_lowest_id() {
        let reg = registry(4);
        reg.cpu_becomes_idle(&reg.cpu(3).clone());
        reg.cpu_becomes_idle(&reg.cpu(1).clone());
        let place = reg.get_idle_compute_place(false).unwrap();
        assert_eq!(place.index(), 1);
        let place = reg.get_idle_compute_place(false).unwrap();
        assert_eq!(place.index(), 3);
        assert!(reg.get_idle_compute_place(false).is_none());
    }

    #[test]
    fn forced_idle_lookup_falls_back_to_first_cpu() {
        let reg = registry(2);
        assert!(reg.get_idle_compute_place(false).is_none());
        let place = reg.get_idle_compute_place(true).unwrap();
        assert_eq!(place.index(), 0);
    }
}
