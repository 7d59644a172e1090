//! The guest physical memory map: ordered, non-overlapping regions, each
//! with a backing policy that drives how the shadow tables map it.

use alloc::vec::Vec;

/// How a region of guest physical address space is realized.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionBacking {
    /// Backed by host memory at a fixed offset; mapped at full speed.
    Allocated { host_base: u64 },
    /// Backed by host memory, but writes are emulated. Reads proceed at
    /// memory speed.
    WriteHook { host_base: u64 },
    /// Never mapped; every access is emulated.
    FullHook,
}

/// A contiguous range of guest physical addresses with one backing policy.
/// `guest_end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowRegion {
    pub guest_start: u64,
    pub guest_end: u64,
    pub backing: RegionBacking,
}

impl ShadowRegion {
    pub fn contains(&self, guest_pa: u64) -> bool {
        (self.guest_start..self.guest_end).contains(&guest_pa)
    }

    /// Host address backing `guest_pa`, if the region carries host memory.
    pub fn host_addr(&self, guest_pa: u64) -> Option<u64> {
        debug_assert!(self.contains(guest_pa));
        match self.backing {
            RegionBacking::Allocated { host_base } | RegionBacking::WriteHook { host_base } => {
                Some(host_base + (guest_pa - self.guest_start))
            }
            RegionBacking::FullHook => None,
        }
    }
}

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionError {
    #[error("region has no extent")]
    Empty,
    #[error("region bounds or backing are not page-aligned")]
    Unaligned,
    #[error("region overlaps an existing one")]
    Overlap,
}

/// The set of regions, kept sorted by start address for binary search.
#[derive(Debug, Default, Clone)]
pub struct RegionMap {
    regions: Vec<ShadowRegion>,
}

impl RegionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, region: ShadowRegion) -> Result<(), RegionError> {
        if region.guest_start >= region.guest_end {
            return Err(RegionError::Empty);
        }
        let host_base = match region.backing {
            RegionBacking::Allocated { host_base } | RegionBacking::WriteHook { host_base } => {
                host_base
            }
            RegionBacking::FullHook => 0,
        };
        if (region.guest_start | region.guest_end | host_base) & 0xfff != 0 {
            return Err(RegionError::Unaligned);
        }
        let at = self
            .regions
            .partition_point(|existing| existing.guest_start < region.guest_start);
        if at > 0 && self.regions[at - 1].guest_end > region.guest_start {
            return Err(RegionError::Overlap);
        }
        if at < self.regions.len() && self.regions[at].guest_start < region.guest_end {
            return Err(RegionError::Overlap);
        }
        self.regions.insert(at, region);
        Ok(())
    }

    /// The region covering `guest_pa`, if any. A miss during a guest fault
    /// is fatal to the guest, but that is the caller's call to make.
    pub fn lookup(&self, guest_pa: u64) -> Option<&ShadowRegion> {
        let at = self
            .regions
            .partition_point(|region| region.guest_end <= guest_pa);
        self.regions.get(at).filter(|region| region.contains(guest_pa))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShadowRegion> {
        self.regions.iter()
    }
}
