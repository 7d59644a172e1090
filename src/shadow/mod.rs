//! Shadow paging: guest-physical-to-host translation maintained by software.
//!
//! The guest runs under tables it never sees. Nothing is mapped eagerly; the
//! first touch of a page faults into [`ShadowPageTables::handle_fault`],
//! which either repairs the mapping from the region map and resumes the
//! guest, or reports that the access belongs to an emulation hook.

mod arena;
mod pt32;
mod pt64;
mod region;

pub use region::{RegionBacking, RegionError, RegionMap, ShadowRegion};

use crate::{error::SvmError, platform::Platform};

use arena::TableArena;

bitfield::bitfield! {
    /// The page-fault error code pushed by hardware, as delivered in
    /// EXITINFO1 on an intercepted #PF.
    ///
    /// See: 8.4.2 Page-Fault Error Code
    #[derive(Clone, Copy)]
    pub struct PfErrorCode(u64);
    impl Debug;
    pub present, set_present: 0;
    pub write, set_write: 1;
    pub user, set_user: 2;
    pub rsvd, set_rsvd: 3;
    pub fetch, set_fetch: 4;
}

/// Shape of the tables hardware is asked to walk.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PagingWidth {
    /// Two levels, non-PAE. Entries hold 32-bit frame numbers.
    Bits32,
    /// Four levels, long mode.
    Bits64,
}

/// What a repaired fault means for the faulting instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum FaultOutcome {
    /// The mapping is fixed; re-run the instruction at full speed.
    Mapped,
    /// Write to a write-hooked region; emulate the write.
    ForwardWrite,
    /// Access to a fully hooked region; emulate the access.
    ForwardFull,
}

/// One guest's shadow tables: a root table plus whatever lower-level tables
/// faults have demanded so far.
#[derive(Debug)]
pub struct ShadowPageTables {
    width: PagingWidth,
    arena: TableArena,
    root_pa: u64,
}

impl ShadowPageTables {
    /// Builds an empty hierarchy: just the root, every entry non-present.
    pub(crate) fn new<P: Platform>(platform: &P, width: PagingWidth) -> Result<Self, SvmError> {
        let mut arena = TableArena::new();
        let root_pa = arena.allocate(platform)?;
        Ok(Self {
            width,
            arena,
            root_pa,
        })
    }

    /// Physical address of the root table, as loaded into the guest's CR3.
    pub fn root_pa(&self) -> u64 {
        self.root_pa
    }

    pub(crate) fn handle_fault<P: Platform>(
        &mut self,
        platform: &P,
        regions: &RegionMap,
        fault_addr: u64,
        access: PfErrorCode,
    ) -> Result<FaultOutcome, SvmError> {
        let outcome = match self.width {
            PagingWidth::Bits32 => pt32::handle_fault(
                platform,
                &mut self.arena,
                self.root_pa,
                regions,
                fault_addr,
                access,
            ),
            PagingWidth::Bits64 => pt64::handle_fault(
                platform,
                &mut self.arena,
                self.root_pa,
                regions,
                fault_addr,
                access,
            ),
        }?;
        log::debug!("shadow fix-up at {fault_addr:#x}: {outcome:?}");
        Ok(outcome)
    }

    /// Removes the mapping covering `addr`, if any, so the next access
    /// refaults. The TLB still needs flushing separately.
    pub(crate) fn invalidate(&mut self, addr: u64) -> Result<(), SvmError> {
        match self.width {
            PagingWidth::Bits32 => pt32::invalidate(&mut self.arena, self.root_pa, addr),
            PagingWidth::Bits64 => pt64::invalidate(&mut self.arena, self.root_pa, addr),
        }
    }

    /// Host address currently shadow-mapped for `addr`, if any.
    pub fn translate(&self, addr: u64) -> Option<u64> {
        match self.width {
            PagingWidth::Bits32 => pt32::translate(&self.arena, self.root_pa, addr),
            PagingWidth::Bits64 => pt64::translate(&self.arena, self.root_pa, addr),
        }
    }

    #[cfg(test)]
    pub(crate) fn table_count(&self) -> usize {
        self.arena.len()
    }
}
