//! Memory directory seam.
//!
//! The directory knows, per region, which cluster nodes hold the home copy
//! of the data. The runtime only asks two questions: "is this place the
//! directory sentinel?" and "who is home for this region?". The full
//! directory is an external collaborator; the bundled [`HomeNodeMap`]
//! answers from an explicit region map and is enough to run the core.

use crate::places::MemoryPlace;
use crate::types::{DataRegion, NodeIndex};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Home-node lookup API.
pub trait MemoryDirectory: Send + Sync {
    /// Whether `place` is the directory sentinel.
    fn is_directory_memory_place(&self, place: MemoryPlace) -> bool {
        place.is_directory()
    }

    /// Home nodes of a region. An empty result means the region is unknown
    /// to the directory.
    fn find(&self, region: DataRegion) -> Vec<NodeIndex>;
}

/// Directory backed by an explicit region map.
#[derive(Default)]
pub struct HomeNodeMap {
    regions: Mutex<BTreeMap<DataRegion, Vec<NodeIndex>>>,
}

impl HomeNodeMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `region` as homed on `nodes`.
    pub fn register_region(&self, region: DataRegion, nodes: Vec<NodeIndex>) {
        self.regions.lock().insert(region, nodes);
    }
}

impl MemoryDirectory for HomeNodeMap {
    fn find(&self, region: DataRegion) -> Vec<NodeIndex> {
        let regions = self.regions.lock();
        // Exact entry or any registered region that covers the request.
        if let Some(nodes) = regions.get(&region) {
            return nodes.clone();
        }
        regions
            .iter()
            .find(|(owned, _)| owned.contains(region))
            .map(|(_, nodes)| nodes.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_region_finds_no_home() {
        let dir = HomeNodeMap::new();
        assert!(dir.find(DataRegion::new(0x1000, 64)).is_empty());
    }

    #[test]
    fn covered_subregion_inherits_home_nodes() {
        let dir = HomeNodeMap::new();
        dir.register_region(DataRegion::new(0x1000, 0x1000), vec![NodeIndex(2)]);
        assert_eq!(dir.find(DataRegion::new(0x1100, 0x10)), vec![NodeIndex(2)]);
        assert_eq!(dir.find(DataRegion::new(0x1000, 0x1000)), vec![NodeIndex(2)]);
    }

    #[test]
    fn directory_sentinel_is_recognised() {
        let dir = HomeNodeMap::new();
        assert!(dir.is_directory_memory_place(MemoryPlace::DIRECTORY));
        assert!(!dir.is_directory_memory_place(MemoryPlace::host(0)));
    }
}
