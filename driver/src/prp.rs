/*
Copyright © 2025 Mako and JayAndJef

This file is part of nvmeboot.

nvmeboot is free software: you can redistribute it and/or modify it under the terms of the GNU General
Public License as published by the Free Software Foundation, either version 3 of the License, or (at
your option) any later version.

nvmeboot is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the
implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public
License for more details.

You should have received a copy of the GNU General Public License along with nvmeboot. If not, see
<https://www.gnu.org/licenses/>.
*/

//! Physical Region Page (PRP) construction
//!
//! PRP1 of a command points at the first (possibly unaligned) byte of the
//! transfer. PRP2 is either the second page or, for transfers spanning more
//! than two pages, the first page of a PRP list. Every list page holds 512
//! entries; when more pages follow, the last entry of a page chains to the
//! next list page instead of describing data.

use log::trace;
use x86_64::PhysAddr;

use super::{
    dma::{DmaPages, DmaService, PAGE_SIZE},
    error::NvmeError,
};

/// Number of PRP entries per list page (4096 / 8 = 512)
pub const PRP_ENTRIES_PER_PAGE: usize = PAGE_SIZE / core::mem::size_of::<u64>();

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Number of list pages needed to describe `entries` data pages.
///
/// Non-final list pages carry 511 data entries plus a chain pointer; the
/// final page may use all 512 slots for data. `entries` counts the pages
/// after the one PRP1 points into.
pub fn list_pages(entries: usize) -> usize {
    if entries == 0 {
        return 0;
    }
    core::cmp::max(1, (entries - 1).div_ceil(PRP_ENTRIES_PER_PAGE - 1))
}

/// Number of memory pages touched by `len` bytes starting at `addr`
pub fn pages_spanned(addr: PhysAddr, len: usize) -> usize {
    ((addr.as_u64() & PAGE_MASK) as usize + len).div_ceil(PAGE_SIZE)
}

/// A materialised PRP list, owned until the command that uses it is done
#[derive(Debug)]
pub struct PrpList {
    pages: DmaPages,
    entries: usize,
}

impl PrpList {
    /// Build a list describing `entries` consecutive pages starting at the
    /// page-aligned device address `first_page`.
    pub fn build<D: DmaService + ?Sized>(
        dma: &D,
        first_page: PhysAddr,
        entries: usize,
    ) -> Result<Self, NvmeError> {
        if entries == 0 || first_page.as_u64() & PAGE_MASK != 0 {
            return Err(NvmeError::InvalidParameter);
        }
        let page_count = list_pages(entries);
        let mut pages = dma.allocate(page_count)?;

        if let Err(err) = fill(&mut pages, first_page, entries) {
            dma.free(pages);
            return Err(err);
        }

        trace!(
            "PRP list of {} entries in {} page(s) at {:#x}",
            entries,
            page_count,
            pages.phys().as_u64()
        );
        Ok(Self { pages, entries })
    }

    /// Device address of the first list page, for PRP2
    pub fn phys(&self) -> PhysAddr {
        self.pages.phys()
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn page_count(&self) -> usize {
        self.pages.pages()
    }

    pub fn entry(&self, index: usize) -> Result<u64, NvmeError> {
        self.pages.read_u64(index)
    }

    pub fn release<D: DmaService + ?Sized>(self, dma: &D) {
        dma.free(self.pages);
    }
}

fn fill(list: &mut DmaPages, first_page: PhysAddr, entries: usize) -> Result<(), NvmeError> {
    let page_count = list.pages();
    let mut remaining = entries;
    let mut addr = first_page.as_u64();

    for page in 0..page_count {
        let base = page * PRP_ENTRIES_PER_PAGE;
        let last = page + 1 == page_count;
        let data_slots = if last { remaining } else { PRP_ENTRIES_PER_PAGE - 1 };
        if data_slots > PRP_ENTRIES_PER_PAGE {
            return Err(NvmeError::InvalidParameter);
        }

        for slot in 0..data_slots {
            list.write_u64(base + slot, addr)?;
            addr += PAGE_SIZE as u64;
        }
        remaining -= data_slots;

        if !last {
            let next = list.page_phys(page + 1).ok_or(NvmeError::InvalidParameter)?;
            list.write_u64(base + PRP_ENTRIES_PER_PAGE - 1, next.as_u64())?;
        }
    }
    Ok(())
}

/// PRP1/PRP2 values for one mapped transfer, plus the list backing PRP2
#[derive(Debug, Default)]
pub struct PrpEntries {
    pub prp1: u64,
    pub prp2: u64,
    pub list: Option<PrpList>,
}

impl PrpEntries {
    /// Describe `len` bytes at device address `phys`
    pub fn for_transfer<D: DmaService + ?Sized>(
        dma: &D,
        phys: PhysAddr,
        len: usize,
    ) -> Result<Self, NvmeError> {
        let next_page = (phys.as_u64() + PAGE_SIZE as u64) & !PAGE_MASK;
        match pages_spanned(phys, len) {
            0 | 1 => Ok(Self { prp1: phys.as_u64(), prp2: 0, list: None }),
            2 => Ok(Self { prp1: phys.as_u64(), prp2: next_page, list: None }),
            spanned => {
                let list = PrpList::build(dma, PhysAddr::new(next_page), spanned - 1)?;
                Ok(Self { prp1: phys.as_u64(), prp2: list.phys().as_u64(), list: Some(list) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimController;
    use proptest::prelude::*;

    #[test]
    fn list_page_counts_at_chain_boundaries() {
        let cases = [
            (0, 0),
            (1, 1),
            (2, 1),
            (510, 1),
            (511, 1),
            (512, 1),   // final page uses the chain slot for data
            (513, 2),
            (1021, 2),
            (1022, 2),
            (1023, 2),
            (1024, 3),
            (1533, 3),
            (1534, 3),
            (1535, 4),
        ];
        for (entries, pages) in cases {
            assert_eq!(list_pages(entries), pages, "entries = {entries}");
        }
    }

    proptest! {
        #[test]
        fn list_pages_hold_exactly_the_entries(entries in 1usize..5000) {
            let pages = list_pages(entries);
            let capacity = pages * (PRP_ENTRIES_PER_PAGE - 1) + 1;
            prop_assert!(entries <= capacity);
            // one page fewer would not be enough
            let smaller = (pages - 1) * (PRP_ENTRIES_PER_PAGE - 1) + 1;
            prop_assert!(pages == 1 || entries > smaller);
        }
    }

    #[test]
    fn span_counts_page_offset() {
        assert_eq!(pages_spanned(PhysAddr::new(0x1000), 4096), 1);
        assert_eq!(pages_spanned(PhysAddr::new(0x1800), 4096), 2);
        assert_eq!(pages_spanned(PhysAddr::new(0x1FFF), 2), 2);
        assert_eq!(pages_spanned(PhysAddr::new(0x1000), 8193), 3);
    }

    #[test]
    fn two_page_transfer_uses_next_boundary() {
        let sim = SimController::new();
        let prp = PrpEntries::for_transfer(&sim, PhysAddr::new(0x4000_0200), 4096).unwrap();
        assert_eq!(prp.prp1, 0x4000_0200);
        assert_eq!(prp.prp2, 0x4000_1000);
        assert!(prp.list.is_none());
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn list_chains_between_pages() {
        let sim = SimController::new();
        let first = PhysAddr::new(0x10_0000_0000);
        let list = PrpList::build(&sim, first, 1023).unwrap();
        assert_eq!(list.page_count(), 2);

        // page 0: 511 data entries then a chain pointer
        assert_eq!(list.entry(0).unwrap(), first.as_u64());
        assert_eq!(list.entry(510).unwrap(), first.as_u64() + 510 * 4096);
        assert_eq!(list.entry(511).unwrap(), list.phys().as_u64() + 4096);
        // page 1: the remaining 512 entries, no chain
        assert_eq!(list.entry(512).unwrap(), first.as_u64() + 511 * 4096);
        assert_eq!(list.entry(1023).unwrap(), first.as_u64() + 1022 * 4096);

        assert_eq!(sim.live_allocations(), 1);
        list.release(&sim);
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn allocation_failure_is_out_of_resources() {
        let sim = SimController::new();
        sim.fail_allocations(true);
        let err = PrpEntries::for_transfer(&sim, PhysAddr::new(0x8000_0000), 3 * 4096).unwrap_err();
        assert_eq!(err, NvmeError::OutOfResources);
        assert_eq!(sim.live_allocations(), 0);
    }
}
