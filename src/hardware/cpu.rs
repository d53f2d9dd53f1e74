//! Per-CPU state.

use crate::deps::DependencyScratch;
use crate::places::ComputePlace;
use core::fmt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuState {
    /// Its worker thread is still in the initialization phase.
    Starting = 0,
    /// Accepting and running work.
    Active = 1,
    /// In the idle set; its worker is parked or about to park.
    Idle = 2,
    /// Taken out of service; its leaf has been drained.
    Disabled = 3,
}

impl CpuState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Active,
            2 => Self::Idle,
            _ => Self::Disabled,
        }
    }
}

/// A CPU registered from the process affinity mask.
///
/// Process-lifetime object: virtual and system ids never change. The
/// per-CPU dependency scratch buffer lives here so workers touch their own
/// cache lines during dependency processing.
pub struct Cpu {
    virtual_id: u32,
    system_id: usize,
    state: AtomicU8,
    dependency_data: Mutex<DependencyScratch>,
}

impl Cpu {
    /// Creates a CPU record in the `Starting` state.
    #[must_use]
    pub fn new(virtual_id: u32, system_id: usize) -> Self {
        Self {
            virtual_id,
            system_id,
            state: AtomicU8::new(CpuState::Starting as u8),
            dependency_data: Mutex::new(DependencyScratch::default()),
        }
    }

    /// Runtime-assigned virtual id (index into the registry).
    #[must_use]
    pub const fn virtual_id(&self) -> u32 {
        self.virtual_id
    }

    /// Kernel CPU id.
    #[must_use]
    pub const fn system_id(&self) -> usize {
        self.system_id
    }

    /// The compute place naming this CPU.
    #[must_use]
    pub const fn compute_place(&self) -> ComputePlace {
        ComputePlace::host(self.virtual_id)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CpuState {
        CpuState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sets the lifecycle state.
    pub fn set_state(&self, state: CpuState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether this CPU currently accepts work.
    #[must_use]
    pub fn accepts_work(&self) -> bool {
        matches!(self.state(), CpuState::Active | CpuState::Idle)
    }

    /// Whether the worker is still initializing.
    #[must_use]
    pub fn is_being_initialized(&self) -> bool {
        self.state() == CpuState::Starting
    }

    /// Marks initialization done. Called by the CPU's own worker before it
    /// first suspends.
    pub fn thread_initialization(&self) {
        let _ = self.state.compare_exchange(
            CpuState::Starting as u8,
            CpuState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// The per-CPU dependency scratch buffer.
    pub fn dependency_data(&self) -> parking_lot::MutexGuard<'_, DependencyScratch> {
        self.dependency_data.lock()
    }
}

impl fmt::Debug for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cpu")
            .field("virtual_id", &self.virtual_id)
            .field("system_id", &self.system_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialization_transitions_starting_to_active() {
        let cpu = Cpu::new(0, 0);
        assert!(cpu.is_being_initialized());
        assert!(!cpu.accepts_work());
        cpu.thread_initialization();
        assert_eq!(cpu.state(), CpuState::Active);
        assert!(cpu.accepts_work());
        // Re-running is harmless.
        cpu.thread_initialization();
        assert_eq!(cpu.state(), CpuState::Active);
    }

    #[test]
    fn disabled_cpu_rejects_work() {
        let cpu = Cpu::new(1, 5);
        cpu.set_state(CpuState::Disabled);
        assert!(!cpu.accepts_work());
        assert_eq!(cpu.system_id(), 5);
    }
}
