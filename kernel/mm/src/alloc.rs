//! The buddy page allocator.
//!
//! [`PhysicalMemory`] is the process-wide registry built once at boot:
//! the frame table, the sections, and the zones. After construction the
//! allocation and free entry points take `&self` and synchronize through
//! the per-section locks and the zones' atomic counters.
//!
//! Allocation walks the requested zone's sections with non-blocking lock
//! attempts and falls through the zone's fallback chain; exhaustion is a
//! `None` return, never a panic. Frees always land (blocking lock) and
//! coalesce one hop in each direction when the merge would promote the
//! run to the next order.

use core::ptr;

use alloc_crate::vec::Vec;

use tauon_core::addr::{PhysAddr, VirtAddr};
use tauon_core::paging::LargePageLevel;
use tauon_core::{kdebug, kinfo, kwarn};

use crate::page::{FrameTable, PageFlags, PageInfo, PageState};
use crate::section::{PageSection, SectionFreelists};
use crate::zone::Zone;
use crate::{INVALID_PFN, MAX_ORDER, MmError, PAGE_SIZE, PhysMemoryRegion};

bitflags::bitflags! {
    /// Modifiers for an allocation request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Zero the pages before returning them.
        const ZERO = 1 << 0;
    }
}

/// Fill pattern written into freed pages when `tauon_debug_page_poison`
/// is enabled, and verified on the next allocation of the run.
const POISON_BYTE: u8 = 0x5A;

/// The physical-memory registry and buddy allocator.
pub struct PhysicalMemory {
    frames: FrameTable,
    sections: Vec<PageSection>,
    zones: Vec<Zone>,
    default_zone: usize,
    hhdm_offset: u64,
}

impl PhysicalMemory {
    /// Creates a registry covering frames `0..page_count`, all initially
    /// boot-reserved. `hhdm_offset` is the virtual base at which physical
    /// memory is linearly mapped.
    pub fn new(page_count: u64, hhdm_offset: u64) -> Self {
        Self {
            frames: FrameTable::new(page_count),
            sections: Vec::new(),
            zones: Vec::new(),
            default_zone: 0,
            hhdm_offset,
        }
    }

    /// The per-frame metadata table.
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// Registers a zone and returns its index. `fallback` is tried when
    /// this zone cannot satisfy an allocation.
    pub fn add_zone(&mut self, name: &'static str, fallback: Option<usize>) -> usize {
        debug_assert!(fallback.is_none_or(|f| f < self.zones.len()));
        self.zones.push(Zone::new(name, fallback));
        self.zones.len() - 1
    }

    /// Selects the zone tried first by [`Self::alloc_pages`].
    pub fn set_default_zone(&mut self, zone: usize) {
        debug_assert!(zone < self.zones.len());
        self.default_zone = zone;
    }

    /// Returns the zone at `index`.
    pub fn zone(&self, index: usize) -> &Zone {
        &self.zones[index]
    }

    /// Returns the section at `index`.
    pub fn section(&self, index: usize) -> &PageSection {
        &self.sections[index]
    }

    /// Registers a section of `page_count` frames at `base` under `zone`
    /// and points the covered frames back at it. Its pages stay
    /// boot-reserved until seeded via the early-free entry points.
    pub fn add_section(
        &mut self,
        zone: usize,
        base: PhysAddr,
        page_count: u64,
    ) -> Result<usize, MmError> {
        let base_pfn = base.page_frame_number();
        if base_pfn + page_count > self.frames.page_count() {
            return Err(MmError::RegionOutOfRange);
        }
        let index = self.sections.len();
        self.sections.push(PageSection::new(zone, base, page_count));
        if !self.zones[zone].add_section(index) {
            self.sections.pop();
            return Err(MmError::ZoneFull);
        }
        for pfn in base_pfn..base_pfn + page_count {
            self.frames.page(pfn).set_section(index);
        }
        kinfo!(
            "mm: section {index}: {base:?} + {page_count} pages -> zone {}",
            self.zones[zone].name()
        );
        Ok(index)
    }

    /// Registers one section per usable region under `zone`, trimming
    /// each region inward to page boundaries.
    pub fn add_usable_regions(
        &mut self,
        zone: usize,
        regions: &[PhysMemoryRegion],
    ) -> Result<(), MmError> {
        for region in regions.iter().filter(|r| r.usable) {
            let start = region.start.align_up(PAGE_SIZE as u64);
            let end = (region.start + region.size).align_down(PAGE_SIZE as u64);
            if end.as_u64() <= start.as_u64() {
                continue;
            }
            let pages = (end.as_u64() - start.as_u64()) / PAGE_SIZE as u64;
            self.add_section(zone, start, pages)?;
        }
        Ok(())
    }

    /// Approximate free pages across all zones.
    pub fn free_page_count(&self) -> u64 {
        self.zones.iter().map(Zone::free_pages).sum()
    }

    /// Virtual address of physical address `phys` through the HHDM.
    pub fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new(self.hhdm_offset + phys.as_u64())
    }

    /// Virtual address of the first byte of frame `pfn`.
    pub fn pfn_to_virt(&self, pfn: u64) -> VirtAddr {
        self.phys_to_virt(PhysAddr::from_pfn(pfn))
    }

    // -----------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------

    /// Allocates `2^order` contiguous pages tagged with `state`, trying
    /// the default zone and then its fallback chain. Returns the run's
    /// first frame number, or `None` when no zone can satisfy the
    /// request.
    pub fn alloc_pages(&self, state: PageState, flags: AllocFlags, order: usize) -> Option<u64> {
        self.alloc_pages_from_zone(self.default_zone, state, flags, order, true)
    }

    /// [`Self::alloc_pages`] with an explicit starting zone and
    /// caller-controlled fallback.
    pub fn alloc_pages_from_zone(
        &self,
        zone: usize,
        state: PageState,
        flags: AllocFlags,
        order: usize,
        allow_fallback: bool,
    ) -> Option<u64> {
        if order >= MAX_ORDER {
            kwarn!("page_alloc: rejecting order {order} request (max {})", MAX_ORDER - 1);
            return None;
        }
        debug_assert!(
            state.is_allocation_target() && state != PageState::LargeHead,
            "cannot allocate pages into state {state:?}"
        );
        let mut next = Some(zone);
        while let Some(index) = next {
            if let Some(pfn) = self.try_alloc_pages_from_zone(index, order) {
                self.commit_alloc(pfn, order, state, flags);
                return Some(pfn);
            }
            next = if allow_fallback {
                self.zones[index].fallback()
            } else {
                None
            };
        }
        None
    }

    /// Single-zone allocation attempt. Fast-rejects on the zone's atomic
    /// counter, then circles the zone's sections with non-blocking lock
    /// attempts until every section has been inspected once; a visited
    /// bitmask bounds the circular walk.
    fn try_alloc_pages_from_zone(&self, zone_index: usize, order: usize) -> Option<u64> {
        let zone = &self.zones[zone_index];
        if zone.free_pages() < 1u64 << order {
            return None;
        }
        let sections = zone.sections();
        let count = sections.len();
        if count == 0 {
            return None;
        }
        let full: u64 = if count >= 64 { u64::MAX } else { (1 << count) - 1 };
        let mut visited: u64 = 0;
        let mut i = 0;
        loop {
            if visited & (1 << i) == 0 {
                let section = &self.sections[sections[i]];
                if let Some(mut lists) = section.try_lock() {
                    visited |= 1 << i;
                    if let Some(pfn) = Self::alloc_from_section(&self.frames, &mut lists, order) {
                        drop(lists);
                        zone.sub_free(1 << order);
                        return Some(pfn);
                    }
                } else {
                    // Contended; revisit on a later lap.
                    core::hint::spin_loop();
                }
            }
            if visited == full {
                return None;
            }
            i = (i + 1) % count;
        }
    }

    /// Pulls a run of exactly `order` out of a locked section, splitting
    /// a larger run if that is what the freelists offer.
    fn alloc_from_section(
        frames: &FrameTable,
        lists: &mut SectionFreelists,
        order: usize,
    ) -> Option<u64> {
        if lists.free_pages() < 1u64 << order {
            return None;
        }
        for o in order.max(lists.min_order())..lists.max_order() {
            if let Some(pfn) = lists.pop_free_run(frames, o) {
                Self::split_back(frames, lists, pfn, o, order);
                return Some(pfn);
            }
        }
        None
    }

    /// Returns the upper halves of a split run to the freelists, halving
    /// from order `have` down to order `want`.
    fn split_back(
        frames: &FrameTable,
        lists: &mut SectionFreelists,
        pfn: u64,
        mut have: usize,
        want: usize,
    ) {
        while have > want {
            have -= 1;
            lists.add_free_run(frames, pfn + (1u64 << have), have);
        }
    }

    /// Tags an exclusively-owned run with its post-allocation state and
    /// applies the request flags.
    fn commit_alloc(&self, pfn: u64, order: usize, state: PageState, flags: AllocFlags) {
        self.retag_run(pfn, order, state);
        if cfg!(tauon_debug_page_poison) {
            self.check_poison(pfn, 1u64 << order);
        }
        if flags.contains(AllocFlags::ZERO) {
            let base = self.pfn_to_virt(pfn).as_mut_ptr::<u8>();
            // SAFETY: The run is exclusively owned by this allocation and
            // the HHDM maps all of physical memory.
            unsafe { ptr::write_bytes(base, 0, (1usize << order) * PAGE_SIZE) };
        }
    }

    fn retag_run(&self, pfn: u64, order: usize, state: PageState) {
        let head = self.frames.page(pfn);
        head.set_state(state);
        head.set_order(order);
        head.clear_flag(PageFlags::all());
        // SAFETY: No page of the run is on a freelist; this call owns it.
        unsafe {
            head.set_info(match state {
                PageState::SlabHead => PageInfo::SlabHead { free_objects: 0 },
                _ => PageInfo::Used { refcount: 1 },
            });
        }
        for p in pfn + 1..pfn + (1u64 << order) {
            let tail = self.frames.page(p);
            tail.clear_flag(PageFlags::all());
            if state == PageState::SlabHead {
                tail.set_state(PageState::SlabTail);
                // SAFETY: As above.
                unsafe { tail.set_info(PageInfo::SlabTail { head: pfn }) };
            } else {
                tail.set_state(state);
                // SAFETY: As above.
                unsafe { tail.set_info(PageInfo::None) };
            }
        }
    }

    /// Allocates one zeroed page for a page table.
    pub fn alloc_table(&self) -> Option<u64> {
        self.alloc_pages(PageState::Table, AllocFlags::ZERO, 0)
    }

    /// Allocates `2^order` zeroed pages for a user stack.
    pub fn alloc_user_stack(&self, order: usize) -> Option<u64> {
        self.alloc_pages(PageState::UserStack, AllocFlags::ZERO, order)
    }

    /// Allocates `2^order` zeroed pages for a kernel stack.
    pub fn alloc_kernel_stack(&self, order: usize) -> Option<u64> {
        self.alloc_pages(PageState::KernelStack, AllocFlags::ZERO, order)
    }

    // -----------------------------------------------------------------
    // Large pages
    // -----------------------------------------------------------------

    /// Allocates one hardware large page of the given tier (see
    /// [`LargePageLevel`]), naturally aligned, from the default zone and
    /// its fallback chain. Every constituent page starts with reference
    /// count 1 so sub-ranges can be released independently.
    pub fn alloc_large_page(&self, tier: usize, flags: AllocFlags) -> Option<u64> {
        self.alloc_large_page_from_zone(self.default_zone, tier, flags, true)
    }

    /// [`Self::alloc_large_page`] with an explicit starting zone.
    pub fn alloc_large_page_from_zone(
        &self,
        zone: usize,
        tier: usize,
        flags: AllocFlags,
        allow_fallback: bool,
    ) -> Option<u64> {
        let level = LargePageLevel::get(tier)?;
        let order = level.order as usize;
        if order >= MAX_ORDER {
            kwarn!("page_alloc: rejecting large-page tier {tier} (order {order})");
            return None;
        }
        let mut next = Some(zone);
        while let Some(index) = next {
            if let Some(pfn) = self.try_alloc_large_from_zone(index, order) {
                self.retag_large_run(pfn, order, tier);
                if cfg!(tauon_debug_page_poison) {
                    self.check_poison(pfn, 1u64 << order);
                }
                if flags.contains(AllocFlags::ZERO) {
                    let base = self.pfn_to_virt(pfn).as_mut_ptr::<u8>();
                    // SAFETY: Exclusively owned run, HHDM-mapped.
                    unsafe { ptr::write_bytes(base, 0, (1usize << order) * PAGE_SIZE) };
                }
                kdebug!("page_alloc: large page tier {tier} at pfn {pfn:#x}");
                return Some(pfn);
            }
            next = if allow_fallback {
                self.zones[index].fallback()
            } else {
                None
            };
        }
        None
    }

    fn try_alloc_large_from_zone(&self, zone_index: usize, order: usize) -> Option<u64> {
        let zone = &self.zones[zone_index];
        if zone.free_pages() < 1u64 << order {
            return None;
        }
        let sections = zone.sections();
        let count = sections.len();
        if count == 0 {
            return None;
        }
        let full: u64 = if count >= 64 { u64::MAX } else { (1 << count) - 1 };
        let mut visited: u64 = 0;
        let mut i = 0;
        loop {
            if visited & (1 << i) == 0 {
                let section = &self.sections[sections[i]];
                if let Some(mut lists) = section.try_lock() {
                    visited |= 1 << i;
                    if let Some(pfn) = self.large_from_section(&mut lists, order) {
                        drop(lists);
                        zone.sub_free(1 << order);
                        return Some(pfn);
                    }
                } else {
                    core::hint::spin_loop();
                }
            }
            if visited == full {
                return None;
            }
            i = (i + 1) % count;
        }
    }

    /// Finds an aligned run of `order` pages inside a locked section.
    ///
    /// At the exact order the freelist is scanned for an aligned head
    /// rather than blindly popped, since freelists are not sorted by
    /// alignment. Above it, an aligned sub-run is carved out of a larger
    /// run and the leading/trailing remainders go back at lower orders.
    fn large_from_section(&self, lists: &mut SectionFreelists, order: usize) -> Option<u64> {
        let size = 1u64 << order;
        if lists.free_pages() < size {
            return None;
        }
        for o in order.max(lists.min_order())..lists.max_order() {
            if o == order {
                if let Some(pfn) = lists.find_aligned_run(&self.frames, o, size) {
                    lists.remove_free_run(&self.frames, pfn, o);
                    return Some(pfn);
                }
            } else {
                let mut run = lists.list(o).head;
                while run != INVALID_PFN {
                    // SAFETY: Section lock held.
                    let PageInfo::FreeHead { next, .. } = (unsafe { self.frames.page(run).info() })
                    else {
                        panic!("freelist link {run:#x} has no head payload");
                    };
                    if let Some(pfn) = self.carve_aligned(lists, run, o, order) {
                        return Some(pfn);
                    }
                    run = next;
                }
            }
        }
        None
    }

    /// Carves an aligned `2^want`-page sub-run out of the free run headed
    /// at `run`. Alignment arithmetic is checked; overflow means the run
    /// cannot hold an aligned sub-run and the carve is declined.
    fn carve_aligned(
        &self,
        lists: &mut SectionFreelists,
        run: u64,
        run_order: usize,
        want: usize,
    ) -> Option<u64> {
        let size = 1u64 << want;
        let aligned = run.checked_add(size - 1)? & !(size - 1);
        let end = run + (1u64 << run_order);
        if aligned.checked_add(size)? > end {
            return None;
        }
        lists.remove_free_run(&self.frames, run, run_order);
        Self::free_range_locked(&self.frames, lists, run, aligned - run);
        Self::free_range_locked(&self.frames, lists, aligned + size, end - (aligned + size));
        Some(aligned)
    }

    fn retag_large_run(&self, pfn: u64, order: usize, tier: usize) {
        let head = self.frames.page(pfn);
        head.set_state(PageState::LargeHead);
        head.set_order(order);
        head.clear_flag(PageFlags::all());
        // SAFETY: Exclusively owned run.
        unsafe {
            head.set_info(PageInfo::LargeHead {
                refcount: 1,
                level: tier as u8,
            });
        }
        for p in pfn + 1..pfn + (1u64 << order) {
            let tail = self.frames.page(p);
            tail.set_state(PageState::LargeTail);
            tail.set_order(order);
            tail.clear_flag(PageFlags::all());
            // SAFETY: Exclusively owned run.
            unsafe {
                tail.set_info(PageInfo::LargeTail {
                    head: pfn,
                    refcount: 1,
                });
            }
        }
    }

    // -----------------------------------------------------------------
    // Free paths
    // -----------------------------------------------------------------

    /// Returns the allocated run `pfn..pfn + 2^order` to its section's
    /// freelists, merging one hop in each direction where the merge
    /// promotes to a higher order.
    ///
    /// # Panics
    ///
    /// Panics when freeing a boot-reserved or already-free page; both are
    /// ownership bugs in the caller and continuing would corrupt physical
    /// memory.
    pub fn free_pages(&self, pfn: u64, order: usize) {
        if order >= MAX_ORDER {
            kwarn!("page_alloc: ignoring free of order {order} at pfn {pfn:#x}");
            return;
        }
        let state = self.frames.page(pfn).state();
        assert!(
            state != PageState::SystemCrucial,
            "freeing boot-reserved page {pfn:#x}"
        );
        assert!(
            state.is_allocated(),
            "freeing page {pfn:#x} in state {state:?}"
        );
        self.release_run(pfn, order);
    }

    /// Frees `count` pages starting at `pfn`, decomposed into naturally
    /// aligned power-of-two runs. `count` need not be a power of two.
    pub fn free_page_range(&self, mut pfn: u64, mut count: u64) {
        while count > 0 {
            let order = Self::decompose_order(pfn, count);
            self.free_pages(pfn, order);
            pfn += 1 << order;
            count -= 1 << order;
        }
    }

    /// Boot-time seeding: moves a boot-reserved run onto the freelists.
    /// Uncontended at this stage (single core), but takes the section
    /// lock anyway so the path is valid at any point.
    pub fn early_free_pages(&self, pfn: u64, order: usize) {
        debug_assert!(order < MAX_ORDER);
        debug_assert_eq!(self.frames.page(pfn).state(), PageState::SystemCrucial);
        self.release_run(pfn, order);
    }

    /// Boot-time seeding of an arbitrary byte range, trimmed inward to
    /// page boundaries and decomposed into aligned runs.
    pub fn early_free_range(&self, start: PhysAddr, size: u64) {
        let first = start.align_up(PAGE_SIZE as u64).page_frame_number();
        let last = (start + size).align_down(PAGE_SIZE as u64).page_frame_number();
        let mut pfn = first;
        while pfn < last {
            let order = Self::decompose_order(pfn, last - pfn);
            self.early_free_pages(pfn, order);
            pfn += 1 << order;
        }
    }

    /// Largest order such that a run at `pfn` stays naturally aligned and
    /// within `count` pages.
    fn decompose_order(pfn: u64, count: u64) -> usize {
        let align = if pfn == 0 {
            MAX_ORDER - 1
        } else {
            pfn.trailing_zeros() as usize
        };
        align
            .min(63 - count.leading_zeros() as usize)
            .min(MAX_ORDER - 1)
    }

    fn release_run(&self, pfn: u64, order: usize) {
        if cfg!(tauon_debug_page_poison) {
            self.poison_range(pfn, 1u64 << order);
        }
        let section = self.section_of(pfn);
        debug_assert!(section.contains(pfn) && section.contains(pfn + (1u64 << order) - 1));
        let mut lists = section.lock();
        self.insert_run_coalescing(section, &mut lists, pfn, 1u64 << order);
        drop(lists);
        self.zones[section.zone].add_free(1u64 << order);
    }

    /// Inserts a run, first attempting one merge with the free run ending
    /// just below it and one with the free run starting just above it.
    /// A merge happens only when the combined range is a naturally
    /// aligned power of two; anything less would break the alignment
    /// invariant the split and carve paths rely on.
    fn insert_run_coalescing(
        &self,
        section: &PageSection,
        lists: &mut SectionFreelists,
        mut start: u64,
        mut count: u64,
    ) {
        debug_assert!(count.is_power_of_two());
        if start > section.base_pfn {
            if let Some((below, below_order)) = self.free_run_ending_at(start - 1) {
                let combined = count + (1u64 << below_order);
                if combined.is_power_of_two() && below % combined == 0 {
                    lists.remove_free_run(&self.frames, below, below_order);
                    start = below;
                    count = combined;
                }
            }
        }
        let end = start + count;
        if end < section.base_pfn + section.page_count
            && self.frames.page(end).state() == PageState::FreeListHead
        {
            let above_order = self.frames.page(end).order();
            let combined = count + (1u64 << above_order);
            if combined.is_power_of_two() && start % combined == 0 {
                lists.remove_free_run(&self.frames, end, above_order);
                count = combined;
            }
        }
        lists.add_free_run(&self.frames, start, count.ilog2() as usize);
    }

    /// Identifies a free run whose last page is `pfn`, if the page is a
    /// genuine freelist boundary marker. Middle pages of free runs keep
    /// stale states but are never probed: a probe lands on a middle page
    /// only if the run being freed overlaps a free run, which the state
    /// asserts in the free path already rule out.
    fn free_run_ending_at(&self, pfn: u64) -> Option<(u64, usize)> {
        let page = self.frames.page(pfn);
        match page.state() {
            PageState::FreeListTail => {
                // SAFETY: Section lock held by the caller.
                let PageInfo::FreeTail { head } = (unsafe { page.info() }) else {
                    panic!("freelist tail {pfn:#x} has no tail payload");
                };
                Some((head, self.frames.page(head).order()))
            }
            // A single-page run is its own last page.
            PageState::FreeListHead if page.order() == 0 => Some((pfn, 0)),
            _ => None,
        }
    }

    /// Adds `[start, start + count)` to a locked section's freelists as
    /// aligned power-of-two runs, without merge attempts. Used for the
    /// remainders of a large-page carve and for partially freed large
    /// runs, where the neighbors are known not to be mergeable.
    fn free_range_locked(
        frames: &FrameTable,
        lists: &mut SectionFreelists,
        mut start: u64,
        mut count: u64,
    ) {
        while count > 0 {
            let order = Self::decompose_order(start, count);
            lists.add_free_run(frames, start, order);
            start += 1 << order;
            count -= 1 << order;
        }
    }

    /// Releases one reference from every page of the large run headed at
    /// `head_pfn` and returns the sub-ranges whose pages dropped to zero
    /// references, coalesced into maximal contiguous pieces. Supports
    /// partial teardown: pages still referenced elsewhere stay allocated.
    pub fn free_large_page(&self, head_pfn: u64) {
        let head = self.frames.page(head_pfn);
        assert_eq!(
            head.state(),
            PageState::LargeHead,
            "freeing a large run at a non-head page {head_pfn:#x}"
        );
        let count = 1u64 << head.order();
        let section = self.section_of(head_pfn);
        let mut freed = 0u64;
        let mut lists = section.lock();
        let mut run_start: Option<u64> = None;
        for pfn in head_pfn..head_pfn + count {
            let page = self.frames.page(pfn);
            // SAFETY: Section lock held.
            let remaining = unsafe {
                match page.info() {
                    PageInfo::LargeHead { refcount, level } => {
                        let Some(rc) = refcount.checked_sub(1) else {
                            panic!("releasing unreferenced large-page head {pfn:#x}");
                        };
                        page.set_info(PageInfo::LargeHead { refcount: rc, level });
                        rc
                    }
                    PageInfo::LargeTail { head, refcount } => {
                        let Some(rc) = refcount.checked_sub(1) else {
                            panic!("releasing unreferenced large-page tail {pfn:#x}");
                        };
                        page.set_info(PageInfo::LargeTail { head, refcount: rc });
                        rc
                    }
                    other => panic!("page {pfn:#x} in a large run has payload {other:?}"),
                }
            };
            if remaining == 0 {
                if run_start.is_none() {
                    run_start = Some(pfn);
                }
            } else if let Some(start) = run_start.take() {
                self.flush_large_subrange(&mut lists, start, pfn - start);
                freed += pfn - start;
            }
        }
        if let Some(start) = run_start {
            let len = head_pfn + count - start;
            self.flush_large_subrange(&mut lists, start, len);
            freed += len;
        }
        drop(lists);
        if freed > 0 {
            self.zones[section.zone].add_free(freed);
        }
    }

    fn flush_large_subrange(&self, lists: &mut SectionFreelists, start: u64, count: u64) {
        if cfg!(tauon_debug_page_poison) {
            self.poison_range(start, count);
        }
        Self::free_range_locked(&self.frames, lists, start, count);
    }

    // -----------------------------------------------------------------
    // Reference counting
    // -----------------------------------------------------------------

    /// Adds a reference to an allocated page (the head of a used run, or
    /// any page of a large run).
    pub fn page_ref_inc(&self, pfn: u64) {
        let section = self.section_of(pfn);
        let _lists = section.lock();
        let page = self.frames.page(pfn);
        // SAFETY: Section lock held.
        unsafe {
            match page.info() {
                PageInfo::Used { refcount } => {
                    page.set_info(PageInfo::Used { refcount: refcount + 1 });
                }
                PageInfo::LargeHead { refcount, level } => {
                    page.set_info(PageInfo::LargeHead { refcount: refcount + 1, level });
                }
                PageInfo::LargeTail { head, refcount } => {
                    page.set_info(PageInfo::LargeTail { head, refcount: refcount + 1 });
                }
                other => panic!("cannot reference page {pfn:#x} with payload {other:?}"),
            }
        }
    }

    /// Drops a reference from an allocated page. When the count reaches
    /// zero the page's run (for a used head) or the single page (for a
    /// large-run member) is freed; returns `true` in that case.
    pub fn page_ref_dec(&self, pfn: u64) -> bool {
        let section = self.section_of(pfn);
        let page = self.frames.page(pfn);
        let release: Option<usize>;
        {
            let _lists = section.lock();
            // SAFETY: Section lock held.
            release = unsafe {
                match page.info() {
                    PageInfo::Used { refcount } => {
                        let Some(rc) = refcount.checked_sub(1) else {
                            panic!("releasing unreferenced page {pfn:#x}");
                        };
                        page.set_info(PageInfo::Used { refcount: rc });
                        (rc == 0).then(|| page.order())
                    }
                    PageInfo::LargeHead { refcount, level } => {
                        let Some(rc) = refcount.checked_sub(1) else {
                            panic!("releasing unreferenced page {pfn:#x}");
                        };
                        page.set_info(PageInfo::LargeHead { refcount: rc, level });
                        (rc == 0).then_some(0)
                    }
                    PageInfo::LargeTail { head, refcount } => {
                        let Some(rc) = refcount.checked_sub(1) else {
                            panic!("releasing unreferenced page {pfn:#x}");
                        };
                        page.set_info(PageInfo::LargeTail { head, refcount: rc });
                        (rc == 0).then_some(0)
                    }
                    other => panic!("cannot release page {pfn:#x} with payload {other:?}"),
                }
            };
        }
        match release {
            Some(order) => {
                self.free_pages(pfn, order);
                true
            }
            None => false,
        }
    }

    fn section_of(&self, pfn: u64) -> &PageSection {
        let Some(index) = self.frames.page(pfn).section() else {
            panic!("page {pfn:#x} does not belong to any section");
        };
        &self.sections[index]
    }

    // -----------------------------------------------------------------
    // Debug poisoning
    // -----------------------------------------------------------------

    fn poison_range(&self, pfn: u64, count: u64) {
        let base = self.pfn_to_virt(pfn).as_mut_ptr::<u8>();
        // SAFETY: The range is owned by the free path and HHDM-mapped.
        unsafe { ptr::write_bytes(base, POISON_BYTE, count as usize * PAGE_SIZE) };
    }

    fn check_poison(&self, pfn: u64, count: u64) {
        let base = self.pfn_to_virt(pfn).as_mut_ptr::<u8>();
        for offset in 0..count as usize * PAGE_SIZE {
            // SAFETY: Exclusively owned run, HHDM-mapped.
            let byte = unsafe { base.add(offset).read() };
            assert!(
                byte == POISON_BYTE,
                "free-page poison overwritten at pfn {pfn:#x} offset {offset:#x}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a registry over `pages` frames in one zone and one section,
    /// backed by a real heap buffer so HHDM access works.
    fn setup(pages: u64) -> PhysicalMemory {
        let buf = vec![0u8; pages as usize * PAGE_SIZE].leak();
        let mut pm = PhysicalMemory::new(pages, buf.as_mut_ptr() as u64);
        let zone = pm.add_zone("normal", None);
        pm.set_default_zone(zone);
        pm.add_section(zone, PhysAddr::zero(), pages).unwrap();
        pm
    }

    /// Seeds the whole section as free runs.
    fn seed(pm: &PhysicalMemory, pages: u64) {
        pm.early_free_range(PhysAddr::zero(), pages * PAGE_SIZE as u64);
    }

    /// Free pages currently on section 0's lists, recomputed from the
    /// lists themselves rather than any cached counter.
    fn list_pages(pm: &PhysicalMemory) -> u64 {
        let lists = pm.section(0).lock();
        (0..MAX_ORDER)
            .map(|o| lists.list(o).count * (1u64 << o))
            .sum()
    }

    fn list_count(pm: &PhysicalMemory, order: usize) -> u64 {
        pm.section(0).lock().list(order).count
    }

    #[test]
    fn early_free_range_decomposes_aligned() {
        let pm = setup(16);
        // Pages 3..13: runs 3(o0), 4..8(o2), 8..12(o2), 12(o0).
        pm.early_free_range(PhysAddr::new(3 * 4096), 10 * 4096);
        assert_eq!(list_count(&pm, 0), 2);
        assert_eq!(list_count(&pm, 2), 2);
        assert_eq!(pm.free_page_count(), 10);
    }

    #[test]
    fn alloc_splits_larger_run() {
        let pm = setup(16);
        pm.early_free_pages(0, 4);
        let pfn = pm.alloc_pages(PageState::Used, AllocFlags::empty(), 0).unwrap();
        assert_eq!(pfn, 0);
        // The split left one run at each lower order.
        for order in 0..4 {
            assert_eq!(list_count(&pm, order), 1, "order {order}");
        }
        assert_eq!(pm.free_page_count(), 15);
        assert_eq!(pm.frames().page(pfn).state(), PageState::Used);
    }

    #[test]
    fn alloc_exhaustion_returns_none() {
        let pm = setup(8);
        seed(&pm, 8);
        assert!(pm.alloc_pages(PageState::Used, AllocFlags::empty(), 4).is_none());
        assert!(pm.alloc_pages(PageState::Used, AllocFlags::empty(), MAX_ORDER).is_none());
        assert!(pm.alloc_pages(PageState::Used, AllocFlags::empty(), 3).is_some());
    }

    #[test]
    fn buddy_pair_free_merges_upward() {
        // Only pages 0..2 are free, so the merge target is unambiguous.
        let pm = setup(4);
        pm.early_free_pages(0, 1);
        let a = pm.alloc_pages(PageState::Used, AllocFlags::empty(), 0).unwrap();
        let b = pm.alloc_pages(PageState::Used, AllocFlags::empty(), 0).unwrap();
        assert_eq!(b, a ^ 1, "consecutive order-0 allocations are buddies");
        pm.free_pages(a, 0);
        pm.free_pages(b, 0);
        assert_eq!(list_count(&pm, 0), 0);
        assert_eq!(list_count(&pm, 1), 1);
    }

    #[test]
    fn misaligned_neighbors_do_not_merge() {
        let pm = setup(8);
        // Pages 1 and 2 are adjacent but 1 % 2 != 0: no promotion.
        pm.early_free_pages(1, 0);
        pm.early_free_pages(2, 0);
        assert_eq!(list_count(&pm, 0), 2);
        assert_eq!(list_count(&pm, 1), 0);
    }

    #[test]
    fn unequal_neighbors_do_not_merge() {
        let pm = setup(8);
        // 2..4 (order 1) and 4..8 (order 2): combined 6 pages, not a
        // power of two.
        pm.early_free_pages(2, 1);
        pm.early_free_pages(4, 2);
        assert_eq!(list_count(&pm, 1), 1);
        assert_eq!(list_count(&pm, 2), 1);
    }

    #[test]
    fn merge_works_in_both_directions() {
        let pm = setup(8);
        pm.early_free_pages(0, 1);
        pm.early_free_pages(4, 1);
        pm.early_free_pages(6, 1);
        // 2..4 merges with 0..2 below, then 4..8 above: one order-3 run.
        pm.early_free_pages(2, 1);
        assert_eq!(list_count(&pm, 1), 0);
        assert_eq!(list_count(&pm, 2), 0);
        assert_eq!(list_count(&pm, 3), 1);
    }

    #[test]
    fn conservation_over_mixed_traffic() {
        const PAGES: u64 = 64;
        let pm = setup(PAGES);
        seed(&pm, PAGES);
        let mut live: Vec<(u64, usize)> = Vec::new();
        let mut rng: u64 = 0x2545_F491_4F6C_DD1D;
        let mut allocated = 0u64;
        for _ in 0..400 {
            rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let order = (rng >> 33) as usize % 4;
            if rng & 1 == 0 || live.is_empty() {
                if let Some(pfn) = pm.alloc_pages(PageState::Used, AllocFlags::empty(), order) {
                    assert_eq!(pfn % (1 << order), 0, "run not naturally aligned");
                    live.push((pfn, order));
                    allocated += 1 << order;
                }
            } else {
                let (pfn, order) = live.swap_remove((rng >> 17) as usize % live.len());
                pm.free_pages(pfn, order);
                allocated -= 1 << order;
            }
            assert_eq!(list_pages(&pm) + allocated, PAGES);
            assert_eq!(pm.free_page_count(), PAGES - allocated);
        }
    }

    #[test]
    fn zero_flag_clears_memory() {
        let pm = setup(4);
        seed(&pm, 4);
        let pfn = pm.alloc_pages(PageState::Used, AllocFlags::empty(), 0).unwrap();
        let ptr = pm.pfn_to_virt(pfn).as_mut_ptr::<u8>();
        unsafe { ptr::write_bytes(ptr, 0xAB, PAGE_SIZE) };
        pm.free_pages(pfn, 0);

        let pfn = pm.alloc_pages(PageState::Used, AllocFlags::ZERO, 0).unwrap();
        let ptr = pm.pfn_to_virt(pfn).as_mut_ptr::<u8>();
        for i in 0..PAGE_SIZE {
            assert_eq!(unsafe { ptr.add(i).read() }, 0);
        }
    }

    #[test]
    fn convenience_allocators_tag_states() {
        let pm = setup(16);
        seed(&pm, 16);
        let table = pm.alloc_table().unwrap();
        assert_eq!(pm.frames().page(table).state(), PageState::Table);
        let ustack = pm.alloc_user_stack(1).unwrap();
        assert_eq!(pm.frames().page(ustack).state(), PageState::UserStack);
        assert_eq!(pm.frames().page(ustack + 1).state(), PageState::UserStack);
        let kstack = pm.alloc_kernel_stack(0).unwrap();
        assert_eq!(pm.frames().page(kstack).state(), PageState::KernelStack);
    }

    #[test]
    fn slab_runs_get_head_and_tail_states() {
        let pm = setup(8);
        seed(&pm, 8);
        let pfn = pm.alloc_pages(PageState::SlabHead, AllocFlags::empty(), 1).unwrap();
        assert_eq!(pm.frames().page(pfn).state(), PageState::SlabHead);
        assert_eq!(pm.frames().page(pfn + 1).state(), PageState::SlabTail);
        // SAFETY: Single-threaded test owning the run.
        let PageInfo::SlabTail { head } = (unsafe { pm.frames().page(pfn + 1).info() }) else {
            panic!("slab tail payload missing");
        };
        assert_eq!(head, pfn);
    }

    #[test]
    fn zone_fallback_chain() {
        let buf = vec![0u8; 16 * PAGE_SIZE].leak();
        let mut pm = PhysicalMemory::new(16, buf.as_mut_ptr() as u64);
        let normal = pm.add_zone("normal", None);
        let dma = pm.add_zone("dma", Some(normal));
        pm.set_default_zone(dma);
        pm.add_section(dma, PhysAddr::zero(), 8).unwrap();
        pm.add_section(normal, PhysAddr::new(8 * 4096), 8).unwrap();
        // Only the fallback zone has free pages.
        pm.early_free_pages(8, 3);

        assert!(
            pm.alloc_pages_from_zone(dma, PageState::Used, AllocFlags::empty(), 0, false)
                .is_none()
        );
        let pfn = pm.alloc_pages(PageState::Used, AllocFlags::empty(), 0).unwrap();
        assert!(pfn >= 8);
    }

    #[test]
    fn allocation_skips_empty_sections() {
        let buf = vec![0u8; 16 * PAGE_SIZE].leak();
        let mut pm = PhysicalMemory::new(16, buf.as_mut_ptr() as u64);
        let zone = pm.add_zone("normal", None);
        pm.set_default_zone(zone);
        pm.add_section(zone, PhysAddr::zero(), 8).unwrap();
        pm.add_section(zone, PhysAddr::new(8 * 4096), 8).unwrap();
        pm.early_free_pages(12, 2);
        let pfn = pm.alloc_pages(PageState::Used, AllocFlags::empty(), 2).unwrap();
        assert_eq!(pfn, 12);
    }

    #[test]
    fn add_section_out_of_range_is_rejected() {
        let mut pm = PhysicalMemory::new(8, 0);
        let zone = pm.add_zone("normal", None);
        assert_eq!(
            pm.add_section(zone, PhysAddr::new(4 * 4096), 8),
            Err(MmError::RegionOutOfRange)
        );
    }

    #[test]
    fn usable_regions_are_trimmed_to_pages() {
        let mut pm = PhysicalMemory::new(64, 0);
        let zone = pm.add_zone("normal", None);
        pm.set_default_zone(zone);
        let regions = [
            PhysMemoryRegion {
                start: PhysAddr::new(0x800),
                size: 0x4800,
                usable: true,
            },
            PhysMemoryRegion {
                start: PhysAddr::new(0x10000),
                size: 0x2000,
                usable: false,
            },
        ];
        pm.add_usable_regions(zone, &regions).unwrap();
        // [0x800, 0x5000) trims to pages 1..5.
        assert_eq!(pm.section(0).base_pfn, 1);
        assert_eq!(pm.section(0).page_count, 4);
        assert_eq!(pm.zone(zone).sections().len(), 1);
    }

    #[test]
    #[should_panic(expected = "freeing boot-reserved page")]
    fn freeing_reserved_page_panics() {
        let pm = setup(4);
        pm.free_pages(0, 0);
    }

    #[test]
    #[should_panic(expected = "freeing page")]
    fn double_free_panics() {
        let pm = setup(4);
        seed(&pm, 4);
        let pfn = pm.alloc_pages(PageState::Used, AllocFlags::empty(), 0).unwrap();
        pm.free_pages(pfn, 0);
        pm.free_pages(pfn, 0);
    }

    #[test]
    fn free_page_range_handles_non_power_of_two() {
        let pm = setup(16);
        seed(&pm, 16);
        let pfn = pm.alloc_pages(PageState::Used, AllocFlags::empty(), 3).unwrap();
        // Retag happened for all eight pages; free only five of them.
        pm.free_page_range(pfn, 5);
        assert_eq!(pm.free_page_count(), 16 - 3);
        pm.free_page_range(pfn + 5, 3);
        assert_eq!(pm.free_page_count(), 16);
    }

    #[test]
    fn refcount_keeps_run_alive() {
        let pm = setup(8);
        seed(&pm, 8);
        let pfn = pm.alloc_pages(PageState::Used, AllocFlags::empty(), 1).unwrap();
        pm.page_ref_inc(pfn);
        assert!(!pm.page_ref_dec(pfn));
        assert_eq!(pm.free_page_count(), 6);
        assert!(pm.page_ref_dec(pfn));
        assert_eq!(pm.free_page_count(), 8);
    }

    #[test]
    fn poison_round_trip() {
        let pm = setup(4);
        pm.poison_range(1, 2);
        pm.check_poison(1, 2);
        let ptr = pm.pfn_to_virt(0).as_mut_ptr::<u8>();
        // Neighboring pages were not touched.
        assert_eq!(unsafe { ptr.read() }, 0);
    }

    #[test]
    #[should_panic(expected = "poison overwritten")]
    fn poison_check_catches_writes() {
        let pm = setup(2);
        pm.poison_range(0, 1);
        let ptr = pm.pfn_to_virt(0).as_mut_ptr::<u8>();
        unsafe { ptr.add(100).write(0x00) };
        pm.check_poison(0, 1);
    }

    const LARGE_PAGES: u64 = 1 << 9;

    #[test]
    fn large_page_is_naturally_aligned() {
        let pm = setup(4 * LARGE_PAGES);
        seed(&pm, 4 * LARGE_PAGES);
        // Fragment the low range a little first.
        let small = pm.alloc_pages(PageState::Used, AllocFlags::empty(), 0).unwrap();
        let pfn = pm.alloc_large_page(0, AllocFlags::empty()).unwrap();
        assert_eq!(pfn % LARGE_PAGES, 0);
        assert_eq!(pm.frames().page(pfn).state(), PageState::LargeHead);
        assert_eq!(pm.frames().page(pfn + 1).state(), PageState::LargeTail);
        assert_eq!(
            pm.free_page_count(),
            4 * LARGE_PAGES - LARGE_PAGES - 1
        );
        pm.free_pages(small, 0);
    }

    #[test]
    fn large_page_carve_returns_remainders() {
        let pm = setup(4 * LARGE_PAGES);
        // One big free run of order 11.
        pm.early_free_pages(0, 11);
        let pfn = pm.alloc_large_page(0, AllocFlags::empty()).unwrap();
        assert_eq!(pfn % LARGE_PAGES, 0);
        assert_eq!(pm.free_page_count(), 3 * LARGE_PAGES);
    }

    #[test]
    fn unsupported_large_tier_is_rejected() {
        let pm = setup(8);
        seed(&pm, 8);
        assert!(pm.alloc_large_page(7, AllocFlags::empty()).is_none());
    }

    #[test]
    fn free_large_page_returns_whole_run() {
        let pm = setup(2 * LARGE_PAGES);
        seed(&pm, 2 * LARGE_PAGES);
        let pfn = pm.alloc_large_page(0, AllocFlags::empty()).unwrap();
        assert_eq!(pm.free_page_count(), LARGE_PAGES);
        pm.free_large_page(pfn);
        assert_eq!(pm.free_page_count(), 2 * LARGE_PAGES);
    }

    #[test]
    fn partially_referenced_large_run_frees_around_straggler() {
        let pm = setup(2 * LARGE_PAGES);
        seed(&pm, 2 * LARGE_PAGES);
        let pfn = pm.alloc_large_page(0, AllocFlags::empty()).unwrap();
        // Keep one tail page alive across the teardown.
        pm.page_ref_inc(pfn + 5);
        pm.free_large_page(pfn);
        assert_eq!(pm.free_page_count(), 2 * LARGE_PAGES - 1);
        // Releasing the straggler frees the last page.
        assert!(pm.page_ref_dec(pfn + 5));
        assert_eq!(pm.free_page_count(), 2 * LARGE_PAGES);
    }
}
