//! Two-level (non-PAE 32-bit) shadow page tables: a page directory of 1024
//! entries over page tables of 1024 entries, 4KB pages with optional 4MB
//! large pages at the directory level.

use crate::{error::SvmError, platform::Platform};

use super::{
    arena::TableArena,
    region::{RegionBacking, RegionMap},
    FaultOutcome, PfErrorCode,
};

bitfield::bitfield! {
    /// A 32-bit paging entry, directory or table level.
    ///
    /// See: Figure 5-10 and 5-11 (4-Kbyte Page Translation, Legacy Mode)
    #[derive(Clone, Copy)]
    pub struct Entry32(u32);
    impl Debug;
    pub present, set_present: 0;
    pub writable, set_writable: 1;
    pub user, set_user: 2;
    pub large, set_large: 7;
    pub pfn, set_pfn: 31, 12;
}

const fn pd_index(addr: u64) -> usize {
    ((addr >> 22) & 0x3ff) as usize
}

const fn pt_index(addr: u64) -> usize {
    ((addr >> 12) & 0x3ff) as usize
}

/// Repairs the shadow mapping for a faulting guest access, or reports that
/// the access belongs to an emulation hook. An address outside every region
/// is a guest-fatal condition.
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

    // Fix up the directory entry first. Intermediate levels are always
    // present, writable and user; access policy lives at the leaf.
    let pde = arena.table32(root_pa).ok_or(SvmError::UnmappedFault { addr: fault_addr })?
        [pd_index(fault_addr)];
    let pt_pa = if pde.present() {
        u64::from(pde.pfn()) << 12
    } else {
        let pa = arena.allocate(platform)?;
        debug_assert!(
            pa >> 12 <= 0xf_ffff,
            "table frame {pa:#x} does not fit a 32-bit entry"
        );
        let mut entry = Entry32(0);
        entry.set_present(true);
        entry.set_writable(true);
        entry.set_user(true);
        entry.set_pfn((pa >> 12) as u32);
        arena
            .table32_mut(root_pa)
            .ok_or(SvmError::UnmappedFault { addr: fault_addr })?[pd_index(fault_addr)] = entry;
        pa
    };

    let pt = arena
        .table32_mut(pt_pa)
        .ok_or(SvmError::UnmappedFault { addr: fault_addr })?;
    let pte = &mut pt[pt_index(fault_addr)];

    let guest_page = fault_addr & !0xfff;
    match region.backing {
        RegionBacking::Allocated { host_base } => {
            let host = host_base + (guest_page - region.guest_start);
            debug_assert!(
                host >> 12 <= 0xf_ffff,
                "host frame {host:#x} does not fit a 32-bit entry"
            );
            pte.set_present(true);
            pte.set_writable(true);
            pte.set_user(true);
            pte.set_pfn((host >> 12) as u32);
            Ok(FaultOutcome::Mapped)
        }
        RegionBacking::WriteHook { host_base } => {
            // Map read-only so reads run at memory speed and only writes
            // fault back into the hook.
            let host = host_base + (guest_page - region.guest_start);
            debug_assert!(
                host >> 12 <= 0xf_ffff,
                "host frame {host:#x} does not fit a 32-bit entry"
            );
            pte.set_present(true);
            pte.set_writable(false);
            pte.set_user(true);
            pte.set_pfn((host >> 12) as u32);
            if access.write() {
                Ok(FaultOutcome::ForwardWrite)
            } else {
                Ok(FaultOutcome::Mapped)
            }
        }
        RegionBacking::FullHook => Ok(FaultOutcome::ForwardFull),
    }
}

/// Drops the shadow leaf for `addr` so the next access refaults. Absent
/// mappings invalidate trivially; a large-page directory entry is dropped
/// whole.
pub(super) fn invalidate(arena: &mut TableArena, root_pa: u64, addr: u64) -> Result<(), SvmError> {
    let Some(pd) = arena.table32(root_pa) else {
        return Ok(());
    };
    let pde = pd[pd_index(addr)];
    if !pde.present() {
        return Ok(());
    }
    if pde.large() {
        arena
            .table32_mut(root_pa)
            .ok_or(SvmError::UnmappedFault { addr })?[pd_index(addr)]
            .set_present(false);
        return Ok(());
    }
    let pt_pa = u64::from(pde.pfn()) << 12;
    if let Some(pt) = arena.table32_mut(pt_pa) {
        pt[pt_index(addr)].set_present(false);
    }
    Ok(())
}

/// Walks the shadow tables without modifying them.
pub(super) fn translate(arena: &TableArena, root_pa: u64, addr: u64) -> Option<u64> {
    let pde = arena.table32(root_pa)?[pd_index(addr)];
    if !pde.present() {
        return None;
    }
    if pde.large() {
        let base = (u64::from(pde.pfn()) << 12) & !0x3f_ffff;
        return Some(base | (addr & 0x3f_ffff));
    }
    let pte = arena.table32(u64::from(pde.pfn()) << 12)?[pt_index(addr)];
    pte.present()
        .then(|| (u64::from(pte.pfn()) << 12) | (addr & 0xfff))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_bits_round_trip() {
        let mut entry = Entry32(0);
        entry.set_present(true);
        entry.set_writable(true);
        entry.set_user(true);
        entry.set_pfn(0xabcde);
        assert_eq!(entry.0, 0xabcd_e007);
        assert_eq!(entry.pfn(), 0xabcde);
        assert!(!entry.large());
    }

    #[test]
    fn indices_split_the_address() {
        assert_eq!(pd_index(0x0000_0000), 0);
        assert_eq!(pd_index(0x0040_0000), 1);
        assert_eq!(pd_index(0xffc0_0000), 1023);
        assert_eq!(pt_index(0x0000_1000), 1);
        assert_eq!(pt_index(0x003f_f000), 1023);
    }
}
