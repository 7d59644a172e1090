//! Four-level long-mode shadow page tables: PML4, PDPT, PD and PT of 512
//! entries each, 4KB pages with optional 1GB and 2MB large pages at the
//! intermediate levels.

use crate::{error::SvmError, platform::Platform};

use super::{
    arena::TableArena,
    region::{RegionBacking, RegionMap},
    FaultOutcome, PfErrorCode,
};

bitfield::bitfield! {
    /// A 64-bit paging entry, any level.
    ///
    /// See: Figure 5-20 through 5-23 (4-Kbyte Page Translation, Long Mode)
    #[derive(Clone, Copy)]
    pub struct Entry64(u64);
    impl Debug;
    pub present, set_present: 0;
    pub writable, set_writable: 1;
    pub user, set_user: 2;
    pub large, set_large: 7;
    pub pfn, set_pfn: 51, 12;
}

// Shifts of the three intermediate levels, root first.
const LEVEL_SHIFTS: [u32; 3] = [39, 30, 21];

const fn index(addr: u64, shift: u32) -> usize {
    ((addr >> shift) & 0x1ff) as usize
}

/// See [`super::pt32::handle_fault`]; same algorithm over four levels.
pub(super) fn handle_fault<P: Platform>(
    platform: &P,
    arena: &mut TableArena,
    root_pa: u64,
    regions: &RegionMap,
    fault_addr: u64,
    access: PfErrorCode,
) -> Result<FaultOutcome, SvmError> {
    let region = regions
        .lookup(fault_addr)
        .ok_or(SvmError::UnmappedFault { addr: fault_addr })?;

    let mut table_pa = root_pa;
    for shift in LEVEL_SHIFTS {
        let at = index(fault_addr, shift);
        let entry =
            arena.table64(table_pa).ok_or(SvmError::UnmappedFault { addr: fault_addr })?[at];
        table_pa = if entry.present() {
            entry.pfn() << 12
        } else {
            let pa = arena.allocate(platform)?;
            let mut fresh = Entry64(0);
            fresh.set_present(true);
            fresh.set_writable(true);
            fresh.set_user(true);
            fresh.set_pfn(pa >> 12);
            arena
                .table64_mut(table_pa)
                .ok_or(SvmError::UnmappedFault { addr: fault_addr })?[at] = fresh;
            pa
        };
    }

    let pt = arena
        .table64_mut(table_pa)
        .ok_or(SvmError::UnmappedFault { addr: fault_addr })?;
    let pte = &mut pt[index(fault_addr, 12)];

    let guest_page = fault_addr & !0xfff;
    match region.backing {
        RegionBacking::Allocated { host_base } => {
            let host = host_base + (guest_page - region.guest_start);
            pte.set_present(true);
            pte.set_writable(true);
            pte.set_user(true);
            pte.set_pfn(host >> 12);
            Ok(FaultOutcome::Mapped)
        }
        RegionBacking::WriteHook { host_base } => {
            let host = host_base + (guest_page - region.guest_start);
            pte.set_present(true);
            pte.set_writable(false);
            pte.set_user(true);
            pte.set_pfn(host >> 12);
            if access.write() {
                Ok(FaultOutcome::ForwardWrite)
            } else {
                Ok(FaultOutcome::Mapped)
            }
        }
        RegionBacking::FullHook => Ok(FaultOutcome::ForwardFull),
    }
}

/// See [`super::pt32::invalidate`]; a large-page entry at any intermediate
/// level is dropped whole.
pub(super) fn invalidate(arena: &mut TableArena, root_pa: u64, addr: u64) -> Result<(), SvmError> {
    let mut table_pa = root_pa;
    for shift in LEVEL_SHIFTS {
        let at = index(addr, shift);
        let Some(table) = arena.table64(table_pa) else {
            return Ok(());
        };
        let entry = table[at];
        if !entry.present() {
            return Ok(());
        }
        if entry.large() {
            arena
                .table64_mut(table_pa)
                .ok_or(SvmError::UnmappedFault { addr })?[at]
                .set_present(false);
            return Ok(());
        }
        table_pa = entry.pfn() << 12;
    }
    if let Some(pt) = arena.table64_mut(table_pa) {
        pt[index(addr, 12)].set_present(false);
    }
    Ok(())
}

/// See [`super::pt32::translate`].
pub(super) fn translate(arena: &TableArena, root_pa: u64, addr: u64) -> Option<u64> {
    let mut table_pa = root_pa;
    for shift in LEVEL_SHIFTS {
        let entry = arena.table64(table_pa)?[index(addr, shift)];
        if !entry.present() {
            return None;
        }
        if entry.large() {
            let span = (1u64 << shift) - 1;
            let base = (entry.pfn() << 12) & !span;
            return Some(base | (addr & span));
        }
        table_pa = entry.pfn() << 12;
    }
    let pte = arena.table64(table_pa)?[index(addr, 12)];
    pte.present().then(|| (pte.pfn() << 12) | (addr & 0xfff))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_bits_round_trip() {
        let mut entry = Entry64(0);
        entry.set_present(true);
        entry.set_writable(true);
        entry.set_user(true);
        entry.set_pfn(0x1_2345_6789);
        assert_eq!(entry.0, 0x1_2345_6789_007);
        assert_eq!(entry.pfn(), 0x1_2345_6789);
    }

    #[test]
    fn index_walks_nine_bits_per_level() {
        let addr = 0x0000_7fcd_1234_5000_u64;
        assert_eq!(index(addr, 39), (addr >> 39) as usize & 0x1ff);
        assert_eq!(index(addr, 12), 0x345);
        assert_eq!(index(0xffff_ffff_ffff_f000, 39), 0x1ff);
    }
}
