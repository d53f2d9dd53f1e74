//! Compute and memory place model.
//!
//! A *compute place* is an execution target (a CPU, a device, a remote
//! cluster node); a *memory place* is an addressable memory domain. Each
//! compute place has an associated memory place. One distinguished
//! *directory* memory place marks data that is uninitialised and lives
//! wherever the directory says; it is never a legal copy target and only
//! ever appears as a copy source.

use crate::types::NodeIndex;
use core::fmt;

/// Device kind of a place.
///
/// The universe is closed: adding a device kind is a source-level change
/// and every dispatch over it is exhaustive, so an unsupported-device
/// combination is a compile-time obligation rather than a runtime
/// fallthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host CPUs.
    Host,
    /// CUDA devices.
    Cuda,
    /// OpenCL devices.
    OpenCl,
    /// Remote cluster nodes.
    Cluster,
}

impl Device {
    /// All device kinds, in dispatch order.
    pub const ALL: [Self; 4] = [Self::Host, Self::Cuda, Self::OpenCl, Self::Cluster];

    /// Stable name used in diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Cuda => "cuda",
            Self::OpenCl => "opencl",
            Self::Cluster => "cluster",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sentinel index of the directory memory place.
const DIRECTORY_INDEX: u32 = u32::MAX;

/// An addressable memory domain.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryPlace {
    device: Device,
    index: u32,
}

impl MemoryPlace {
    /// The distinguished directory memory place.
    pub const DIRECTORY: Self = Self {
        device: Device::Host,
        index: DIRECTORY_INDEX,
    };

    /// Memory place of a host NUMA domain (or the single host domain).
    #[must_use]
    pub const fn host(index: u32) -> Self {
        Self {
            device: Device::Host,
            index,
        }
    }

    /// Memory place of a cluster node.
    #[must_use]
    pub const fn cluster(node: NodeIndex) -> Self {
        Self {
            device: Device::Cluster,
            index: node.0,
        }
    }

    /// Memory place of a non-host, non-cluster device.
    #[must_use]
    pub const fn device(device: Device, index: u32) -> Self {
        Self { device, index }
    }

    /// Device kind of this place.
    #[must_use]
    pub const fn kind(self) -> Device {
        self.device
    }

    /// Raw index within the device kind.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Cluster node index, if this is a cluster memory place.
    #[must_use]
    pub const fn node(self) -> Option<NodeIndex> {
        match self.device {
            Device::Cluster => Some(NodeIndex(self.index)),
            Device::Host | Device::Cuda | Device::OpenCl => None,
        }
    }

    /// Whether this is the directory sentinel.
    #[must_use]
    pub const fn is_directory(self) -> bool {
        self.index == DIRECTORY_INDEX
    }
}

impl fmt::Debug for MemoryPlace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_directory() {
            write!(f, "MemoryPlace(directory)")
        } else {
            write!(f, "MemoryPlace({}:{})", self.device, self.index)
        }
    }
}

/// An execution target.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputePlace {
    device: Device,
    index: u32,
}

impl ComputePlace {
    /// Compute place of a host CPU, by virtual CPU id.
    #[must_use]
    pub const fn host(virtual_cpu: u32) -> Self {
        Self {
            device: Device::Host,
            index: virtual_cpu,
        }
    }

    /// Compute place of a cluster node.
    #[must_use]
    pub const fn cluster(node: NodeIndex) -> Self {
        Self {
            device: Device::Cluster,
            index: node.0,
        }
    }

    /// Compute place of a non-host, non-cluster device.
    #[must_use]
    pub const fn device(device: Device, index: u32) -> Self {
        Self { device, index }
    }

    /// Device kind of this place.
    #[must_use]
    pub const fn kind(self) -> Device {
        self.device
    }

    /// Raw index within the device kind (virtual CPU id for host).
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Cluster node index, if this is a cluster compute place.
    #[must_use]
    pub const fn node(self) -> Option<NodeIndex> {
        match self.device {
            Device::Cluster => Some(NodeIndex(self.index)),
            Device::Host | Device::Cuda | Device::OpenCl => None,
        }
    }

    /// The memory place associated with this compute place.
    #[must_use]
    pub const fn memory_place(self) -> MemoryPlace {
        MemoryPlace {
            device: self.device,
            index: self.index,
        }
    }
}

impl fmt::Debug for ComputePlace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComputePlace({}:{})", self.device, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_is_never_a_regular_place() {
        assert!(MemoryPlace::DIRECTORY.is_directory());
        assert!(!MemoryPlace::host(0).is_directory());
        assert!(!MemoryPlace::cluster(NodeIndex(3)).is_directory());
    }

    #[test]
    fn cluster_places_carry_their_node() {
        let mp = MemoryPlace::cluster(NodeIndex(2));
        assert_eq!(mp.node(), Some(NodeIndex(2)));
        assert_eq!(mp.kind(), Device::Cluster);
        assert_eq!(MemoryPlace::host(0).node(), None);
    }

    #[test]
    fn compute_place_maps_to_its_memory_place() {
        let cp = ComputePlace::cluster(NodeIndex(1));
        assert_eq!(cp.memory_place(), MemoryPlace::cluster(NodeIndex(1)));
        let host = ComputePlace::host(4);
        assert_eq!(host.memory_place().kind(), Device::Host);
    }
}
