//! Lock-striped sections of physical memory.
//!
//! A zone is carved into sections, each with its own spinlock and its own
//! per-order freelists. Allocation walks sections with `try_lock` so
//! contention on one section never stalls allocations that another section
//! could satisfy.
//!
//! Freelists are intrusive doubly-linked lists threaded through the frame
//! table: a free run of `2^order` pages is represented by its head page
//! ([`PageState::FreeListHead`] with order and list links) and, for runs
//! longer than one page, its last page ([`PageState::FreeListTail`] with a
//! back-pointer). Middle pages keep whatever stale state they had; the
//! allocator only ever probes run boundaries.

use tauon_core::addr::PhysAddr;
use tauon_core::sync::SpinLock;

use crate::page::{FrameTable, PageInfo, PageState};
use crate::{INVALID_PFN, MAX_ORDER};

/// One order's freelist: head of the intrusive list plus its length.
#[derive(Debug, Clone, Copy)]
pub struct FreeList {
    /// Head run's first page, or [`INVALID_PFN`] when empty.
    pub head: u64,
    /// Number of runs on the list.
    pub count: u64,
}

impl FreeList {
    const fn empty() -> Self {
        Self {
            head: INVALID_PFN,
            count: 0,
        }
    }

    /// Returns `true` if the list has no runs.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// The lock-guarded interior of a section.
pub struct SectionFreelists {
    lists: [FreeList; MAX_ORDER],
    /// Lowest order with a non-empty list; [`MAX_ORDER`] when all empty.
    min_order: usize,
    /// One past the highest non-empty order; 0 when all empty.
    max_order: usize,
    /// Total free pages across all lists.
    free_pages: u64,
}

impl SectionFreelists {
    const fn new() -> Self {
        Self {
            lists: [FreeList::empty(); MAX_ORDER],
            min_order: MAX_ORDER,
            max_order: 0,
            free_pages: 0,
        }
    }

    /// Lowest order with free runs, or [`MAX_ORDER`] if the section is empty.
    pub fn min_order(&self) -> usize {
        self.min_order
    }

    /// One past the highest order with free runs, or 0 if empty.
    pub fn max_order(&self) -> usize {
        self.max_order
    }

    /// Total free pages in this section.
    pub fn free_pages(&self) -> u64 {
        self.free_pages
    }

    /// Returns the freelist for `order`.
    pub fn list(&self, order: usize) -> &FreeList {
        &self.lists[order]
    }

    /// Pushes the run `pfn..pfn + 2^order` onto the freelist for `order`,
    /// tagging its boundary pages.
    ///
    /// The run must currently be owned by the caller (no page of it is on
    /// any freelist) and must be naturally aligned to its size.
    pub fn add_free_run(&mut self, table: &FrameTable, pfn: u64, order: usize) {
        debug_assert!(order < MAX_ORDER);
        debug_assert_eq!(pfn % (1 << order), 0, "free run must be naturally aligned");

        let old_head = self.lists[order].head;
        let head = table.page(pfn);
        head.set_state(PageState::FreeListHead);
        head.set_order(order);
        // SAFETY: Section lock held by the caller.
        unsafe {
            head.set_info(PageInfo::FreeHead {
                order: order as u8,
                prev: INVALID_PFN,
                next: old_head,
            });
        }
        if old_head != INVALID_PFN {
            // SAFETY: Section lock held; old head belongs to this section.
            unsafe {
                let PageInfo::FreeHead { order: o, next, .. } = table.page(old_head).info() else {
                    panic!("freelist head {old_head:#x} has no head payload");
                };
                table.page(old_head).set_info(PageInfo::FreeHead {
                    order: o,
                    prev: pfn,
                    next,
                });
            }
        }
        if order > 0 {
            let tail = table.page(pfn + (1 << order) - 1);
            tail.set_state(PageState::FreeListTail);
            tail.set_order(order);
            // SAFETY: Section lock held by the caller.
            unsafe { tail.set_info(PageInfo::FreeTail { head: pfn }) };
        }

        self.lists[order].head = pfn;
        self.lists[order].count += 1;
        self.free_pages += 1 << order;
        self.min_order = self.min_order.min(order);
        self.max_order = self.max_order.max(order + 1);
    }

    /// Unlinks the run headed at `pfn` from the freelist for `order`.
    ///
    /// Its boundary pages become [`PageState::InFreeList`] until the caller
    /// retags them.
    pub fn remove_free_run(&mut self, table: &FrameTable, pfn: u64, order: usize) {
        let head = table.page(pfn);
        debug_assert_eq!(head.state(), PageState::FreeListHead);
        // SAFETY: Section lock held by the caller.
        let PageInfo::FreeHead { prev, next, .. } = (unsafe { head.info() }) else {
            panic!("freelist head {pfn:#x} has no head payload");
        };

        if prev == INVALID_PFN {
            debug_assert_eq!(self.lists[order].head, pfn);
            self.lists[order].head = next;
        } else {
            // SAFETY: Section lock held.
            unsafe {
                let PageInfo::FreeHead { order: o, prev: p, .. } = table.page(prev).info() else {
                    panic!("freelist link {prev:#x} has no head payload");
                };
                table.page(prev).set_info(PageInfo::FreeHead {
                    order: o,
                    prev: p,
                    next,
                });
            }
        }
        if next != INVALID_PFN {
            // SAFETY: Section lock held.
            unsafe {
                let PageInfo::FreeHead { order: o, next: n, .. } = table.page(next).info() else {
                    panic!("freelist link {next:#x} has no head payload");
                };
                table.page(next).set_info(PageInfo::FreeHead {
                    order: o,
                    prev,
                    next: n,
                });
            }
        }

        head.set_state(PageState::InFreeList);
        // SAFETY: Section lock held by the caller.
        unsafe { head.set_info(PageInfo::None) };
        if order > 0 {
            let tail = table.page(pfn + (1 << order) - 1);
            tail.set_state(PageState::InFreeList);
            // SAFETY: Section lock held by the caller.
            unsafe { tail.set_info(PageInfo::None) };
        }

        self.lists[order].count -= 1;
        self.free_pages -= 1 << order;
        self.recompute_bounds_after_removal(order);
    }

    /// Pops the first run of the given order, if any.
    pub fn pop_free_run(&mut self, table: &FrameTable, order: usize) -> Option<u64> {
        let pfn = self.lists[order].head;
        if pfn == INVALID_PFN {
            return None;
        }
        self.remove_free_run(table, pfn, order);
        Some(pfn)
    }

    /// Finds a run at `order` whose head satisfies `pfn % align_pages == 0`.
    pub fn find_aligned_run(&self, table: &FrameTable, order: usize, align_pages: u64) -> Option<u64> {
        let mut pfn = self.lists[order].head;
        while pfn != INVALID_PFN {
            if pfn % align_pages == 0 {
                return Some(pfn);
            }
            // SAFETY: Section lock held by the caller.
            let PageInfo::FreeHead { next, .. } = (unsafe { table.page(pfn).info() }) else {
                panic!("freelist link {pfn:#x} has no head payload");
            };
            pfn = next;
        }
        None
    }

    /// Re-derives `min_order`/`max_order` after the list at `order`
    /// possibly went empty. Only the boundary that `order` sat on is
    /// rescanned; interior removals leave both cached bounds valid.
    fn recompute_bounds_after_removal(&mut self, order: usize) {
        if !self.lists[order].is_empty() {
            return;
        }
        if self.free_pages == 0 {
            self.min_order = MAX_ORDER;
            self.max_order = 0;
            return;
        }
        if order == self.min_order {
            self.min_order = (order + 1..MAX_ORDER)
                .find(|&o| !self.lists[o].is_empty())
                .unwrap_or(MAX_ORDER);
        }
        if order + 1 == self.max_order {
            self.max_order = (0..order)
                .rfind(|&o| !self.lists[o].is_empty())
                .map_or(0, |o| o + 1);
        }
    }
}

/// A contiguous, lock-striped slice of a zone's physical memory.
pub struct PageSection {
    /// Index of the owning zone.
    pub zone: usize,
    /// First byte of the section.
    pub base: PhysAddr,
    /// First frame of the section.
    pub base_pfn: u64,
    /// Frames covered.
    pub page_count: u64,
    inner: SpinLock<SectionFreelists>,
}

impl PageSection {
    /// Creates a section covering `page_count` frames starting at `base`.
    /// All of its pages stay boot-reserved until explicitly freed into it.
    pub fn new(zone: usize, base: PhysAddr, page_count: u64) -> Self {
        Self {
            zone,
            base,
            base_pfn: base.page_frame_number(),
            page_count,
            inner: SpinLock::new(SectionFreelists::new()),
        }
    }

    /// Returns `true` if frame `pfn` lies inside this section.
    pub fn contains(&self, pfn: u64) -> bool {
        pfn >= self.base_pfn && pfn < self.base_pfn + self.page_count
    }

    /// Acquires the section lock, spinning until it is free.
    pub fn lock(&self) -> tauon_core::sync::SpinLockGuard<'_, SectionFreelists> {
        self.inner.lock()
    }

    /// Attempts to acquire the section lock without spinning.
    pub fn try_lock(&self) -> Option<tauon_core::sync::SpinLockGuard<'_, SectionFreelists>> {
        self.inner.try_lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(pages: u64) -> (FrameTable, SectionFreelists) {
        (FrameTable::new(pages), SectionFreelists::new())
    }

    /// Recomputes the order bounds by brute force for comparison.
    fn exhaustive_bounds(lists: &SectionFreelists) -> (usize, usize) {
        let min = (0..MAX_ORDER)
            .find(|&o| !lists.list(o).is_empty())
            .unwrap_or(MAX_ORDER);
        let max = (0..MAX_ORDER)
            .rfind(|&o| !lists.list(o).is_empty())
            .map_or(0, |o| o + 1);
        (min, max)
    }

    #[test]
    fn empty_section_bounds() {
        let (_, lists) = setup(0);
        assert_eq!(lists.min_order(), MAX_ORDER);
        assert_eq!(lists.max_order(), 0);
        assert_eq!(lists.free_pages(), 0);
    }

    #[test]
    fn add_tags_boundary_pages() {
        let (table, mut lists) = setup(16);
        lists.add_free_run(&table, 8, 2);

        assert_eq!(table.page(8).state(), PageState::FreeListHead);
        assert_eq!(table.page(8).order(), 2);
        assert_eq!(table.page(11).state(), PageState::FreeListTail);
        // Middle pages untouched.
        assert_eq!(table.page(9).state(), PageState::SystemCrucial);
        assert_eq!(lists.free_pages(), 4);
        assert_eq!(lists.min_order(), 2);
        assert_eq!(lists.max_order(), 3);
    }

    #[test]
    fn order_zero_run_has_no_tail() {
        let (table, mut lists) = setup(4);
        lists.add_free_run(&table, 1, 0);
        assert_eq!(table.page(1).state(), PageState::FreeListHead);
        assert_eq!(table.page(2).state(), PageState::SystemCrucial);
    }

    #[test]
    fn push_pop_is_lifo() {
        let (table, mut lists) = setup(8);
        lists.add_free_run(&table, 0, 0);
        lists.add_free_run(&table, 1, 0);
        lists.add_free_run(&table, 2, 0);
        assert_eq!(lists.pop_free_run(&table, 0), Some(2));
        assert_eq!(lists.pop_free_run(&table, 0), Some(1));
        assert_eq!(lists.pop_free_run(&table, 0), Some(0));
        assert_eq!(lists.pop_free_run(&table, 0), None);
        assert_eq!(lists.free_pages(), 0);
    }

    #[test]
    fn remove_middle_of_list_relinks() {
        let (table, mut lists) = setup(8);
        lists.add_free_run(&table, 0, 0);
        lists.add_free_run(&table, 1, 0);
        lists.add_free_run(&table, 2, 0);
        // List is 2 -> 1 -> 0; remove 1.
        lists.remove_free_run(&table, 1, 0);
        assert_eq!(table.page(1).state(), PageState::InFreeList);
        assert_eq!(lists.pop_free_run(&table, 0), Some(2));
        assert_eq!(lists.pop_free_run(&table, 0), Some(0));
        assert_eq!(lists.pop_free_run(&table, 0), None);
    }

    #[test]
    fn bounds_track_adds_and_removes() {
        let (table, mut lists) = setup(1 << 6);
        let runs = [(0u64, 3usize), (8, 1), (16, 4), (40, 0)];
        for &(pfn, order) in &runs {
            lists.add_free_run(&table, pfn, order);
            assert_eq!(
                (lists.min_order(), lists.max_order()),
                exhaustive_bounds(&lists)
            );
        }
        // Remove in an order that exercises both boundary rescans.
        for &(pfn, order) in &[(40u64, 0usize), (16, 4), (0, 3), (8, 1)] {
            lists.remove_free_run(&table, pfn, order);
            assert_eq!(
                (lists.min_order(), lists.max_order()),
                exhaustive_bounds(&lists)
            );
        }
        assert_eq!(lists.min_order(), MAX_ORDER);
        assert_eq!(lists.max_order(), 0);
    }

    #[test]
    fn find_aligned_skips_misaligned_heads() {
        let (table, mut lists) = setup(32);
        lists.add_free_run(&table, 2, 1);
        lists.add_free_run(&table, 8, 1);
        lists.add_free_run(&table, 6, 1);
        // List order: 6 -> 8 -> 2; only 8 is 8-page aligned.
        assert_eq!(lists.find_aligned_run(&table, 1, 8), Some(8));
        assert_eq!(lists.find_aligned_run(&table, 1, 16), None);
    }

    #[test]
    fn section_contains() {
        let section = PageSection::new(0, PhysAddr::new(0x10000), 16);
        assert_eq!(section.base_pfn, 0x10);
        assert!(section.contains(0x10));
        assert!(section.contains(0x1F));
        assert!(!section.contains(0x20));
        assert!(!section.contains(0xF));
    }

    #[test]
    fn section_try_lock_excludes() {
        let section = PageSection::new(0, PhysAddr::zero(), 16);
        let guard = section.try_lock().unwrap();
        assert!(section.try_lock().is_none());
        drop(guard);
        assert!(section.try_lock().is_some());
    }
}
