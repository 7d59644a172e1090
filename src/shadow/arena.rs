//! Backing store for shadow page tables: an owned pool of page-sized,
//! page-aligned allocations indexed by their physical address.
//!
//! Hardware walks the tables by physical address while software walks them
//! by index. Funneling every table through the arena keeps the raw-memory
//! casts in one place and guarantees a page either is one of ours or the
//! walk stops.

use alloc::{boxed::Box, collections::btree_map::BTreeMap, vec::Vec};

use crate::{error::SvmError, platform::Platform, support::try_zeroed_box};

use super::{pt32::Entry32, pt64::Entry64};

#[repr(C, align(4096))]
pub(crate) struct TablePage([u8; 4096]);

pub(crate) struct TableArena {
    pages: Vec<Box<TablePage>>,
    by_pa: BTreeMap<u64, usize>,
}

impl TableArena {
    pub(crate) fn new() -> Self {
        Self {
            pages: Vec::new(),
            by_pa: BTreeMap::new(),
        }
    }

    /// Allocates a zeroed table page and returns its physical address.
    pub(crate) fn allocate<P: Platform>(&mut self, platform: &P) -> Result<u64, SvmError> {
        let page = try_zeroed_box::<TablePage>()?;
        let pa = platform.pa(page.as_ref() as *const _ as *const _);
        debug_assert_eq!(pa & 0xfff, 0);
        self.by_pa.insert(pa, self.pages.len());
        self.pages.push(page);
        Ok(pa)
    }

    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }

    fn page(&self, pa: u64) -> Option<&TablePage> {
        self.by_pa.get(&pa).map(|&at| self.pages[at].as_ref())
    }

    fn page_mut(&mut self, pa: u64) -> Option<&mut TablePage> {
        let at = *self.by_pa.get(&pa)?;
        Some(self.pages[at].as_mut())
    }

    // The casts below are sound because every page is owned, page-sized,
    // page-aligned and reachable through exactly one index entry, and both
    // entry types are plain integers with no invalid bit patterns.

    pub(crate) fn table32(&self, pa: u64) -> Option<&[Entry32; 1024]> {
        self.page(pa)
            .map(|page| unsafe { &*page.0.as_ptr().cast::<[Entry32; 1024]>() })
    }

    pub(crate) fn table32_mut(&mut self, pa: u64) -> Option<&mut [Entry32; 1024]> {
        self.page_mut(pa)
            .map(|page| unsafe { &mut *page.0.as_mut_ptr().cast::<[Entry32; 1024]>() })
    }

    pub(crate) fn table64(&self, pa: u64) -> Option<&[Entry64; 512]> {
        self.page(pa)
            .map(|page| unsafe { &*page.0.as_ptr().cast::<[Entry64; 512]>() })
    }

    pub(crate) fn table64_mut(&mut self, pa: u64) -> Option<&mut [Entry64; 512]> {
        self.page_mut(pa)
            .map(|page| unsafe { &mut *page.0.as_mut_ptr().cast::<[Entry64; 512]>() })
    }
}

impl core::fmt::Debug for TableArena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TableArena")
            .field("pages", &self.pages.len())
            .finish()
    }
}
