//! Per-page-frame metadata.
//!
//! Every physical page frame has one [`PageFrame`] record in the
//! [`FrameTable`], found by arithmetic on the frame number rather than by
//! chasing pointers. A record is a few atomics (flags, state, cached run
//! order, owning section) plus a state-dependent [`PageInfo`] payload
//! guarded by the owning section's lock.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, AtomicU16, Ordering};

use alloc_crate::boxed::Box;
use alloc_crate::vec::Vec;

use tauon_core::addr::PhysAddr;

bitflags::bitflags! {
    /// Atomic per-page flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// The page has been written to since the flag was last cleared.
        const DIRTY = 1 << 0;
        /// Summary flag on a large-page head: some page of the run is
        /// dirty. Set instead of walking every tail of a huge mapping.
        const RUN_DIRTY = 1 << 1;
    }
}

/// The role a page frame currently plays.
///
/// Transitions are driven exclusively by the allocator; see the state
/// machine notes in [`crate::section`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Reserved at boot; must never be allocated or freed. Terminal.
    SystemCrucial = 0,
    /// Transient: pulled out of a freelist, new role not yet decided.
    InFreeList,
    /// Head of a free run of `2^order` pages.
    FreeListHead,
    /// Last page of a free run (back-pointer to the head).
    FreeListTail,
    /// Generic in-use allocation.
    Used,
    /// Backing a kernel stack.
    KernelStack,
    /// Backing a user stack.
    UserStack,
    /// Head of a slab allocator's page run.
    SlabHead,
    /// Non-first page of a slab run.
    SlabTail,
    /// Backing a page table.
    Table,
    /// Head of a hardware large-page run.
    LargeHead,
    /// Non-first page of a hardware large-page run.
    LargeTail,
}

impl PageState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::SystemCrucial,
            1 => Self::InFreeList,
            2 => Self::FreeListHead,
            3 => Self::FreeListTail,
            4 => Self::Used,
            5 => Self::KernelStack,
            6 => Self::UserStack,
            7 => Self::SlabHead,
            8 => Self::SlabTail,
            9 => Self::Table,
            10 => Self::LargeHead,
            11 => Self::LargeTail,
            _ => panic!("invalid page state {raw}"),
        }
    }

    /// States a freshly allocated run may be tagged with.
    pub(crate) fn is_allocation_target(self) -> bool {
        matches!(
            self,
            Self::Used
                | Self::KernelStack
                | Self::UserStack
                | Self::SlabHead
                | Self::Table
                | Self::LargeHead
        )
    }

    /// States describing an in-use (allocated, non-free) page.
    pub(crate) fn is_allocated(self) -> bool {
        matches!(
            self,
            Self::Used
                | Self::KernelStack
                | Self::UserStack
                | Self::SlabHead
                | Self::SlabTail
                | Self::Table
                | Self::LargeHead
                | Self::LargeTail
        )
    }
}

/// State-dependent payload of a page record.
///
/// Exactly one variant is valid at a time, determined solely by the page's
/// [`PageState`]. All links are page frame numbers ([`INVALID_PFN`] when
/// absent), never pointers: the frame table is a flat array and indices
/// stay valid across address-space changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageInfo {
    /// No payload (boot-reserved, transient, or a plain run member).
    None,
    /// Freelist head: run order and doubly-linked list neighbors.
    FreeHead {
        /// Log2 of the run's page count.
        order: u8,
        /// Previous freelist entry, or [`INVALID_PFN`].
        prev: u64,
        /// Next freelist entry, or [`INVALID_PFN`].
        next: u64,
    },
    /// Freelist tail: back-pointer to the run's head.
    FreeTail {
        /// Head of the run this page terminates.
        head: u64,
    },
    /// Slab head: free-object accounting for the slab layered above.
    SlabHead {
        /// Number of free objects in the slab's pages.
        free_objects: u32,
    },
    /// Slab tail: back-pointer to the slab head.
    SlabTail {
        /// Head of the slab run.
        head: u64,
    },
    /// Generic in-use page (also stacks and tables): reference count.
    Used {
        /// Outstanding references; freed when it reaches zero.
        refcount: u32,
    },
    /// Large-page head: its own reference count plus the tier level.
    LargeHead {
        /// References to the head page itself.
        refcount: u32,
        /// Large-page tier (index into the level table).
        level: u8,
    },
    /// Large-page tail: back-pointer and its own reference count.
    LargeTail {
        /// Head of the large run.
        head: u64,
        /// References to this page; sub-runs free individually.
        refcount: u32,
    },
}

/// Metadata record for one physical page frame.
///
/// `flags`, `state`, `order`, and `section` are relaxed atomics: they are
/// individually consistent, and any multi-field transition is ordered by
/// the owning section's lock. `info` may only be touched with that lock
/// held.
pub struct PageFrame {
    flags: AtomicU8,
    state: AtomicU8,
    /// Cached run order, mirrored from `info` for free-run heads and for
    /// every page of a large run (lets lock-free readers size the run).
    order: AtomicU8,
    /// 1-based owning section id; 0 = unset.
    section: AtomicU16,
    info: UnsafeCell<PageInfo>,
}

// SAFETY: The atomic fields synchronize themselves; `info` is only
// accessed under the owning section's lock (or single-threaded reads of
// stable allocated runs), which the unsafe accessors document.
unsafe impl Sync for PageFrame {}
unsafe impl Send for PageFrame {}

impl PageFrame {
    fn new() -> Self {
        Self {
            flags: AtomicU8::new(0),
            state: AtomicU8::new(PageState::SystemCrucial as u8),
            order: AtomicU8::new(0),
            section: AtomicU16::new(0),
            info: UnsafeCell::new(PageInfo::None),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> PageState {
        PageState::from_raw(self.state.load(Ordering::Relaxed))
    }

    /// Sets the state. No validation happens here; the allocator asserts
    /// transition legality at its call sites.
    pub fn set_state(&self, state: PageState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Returns `true` if all bits of `flag` are set.
    pub fn has_flag(&self, flag: PageFlags) -> bool {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed)).contains(flag)
    }

    /// Sets the given flag bits.
    pub fn set_flag(&self, flag: PageFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::Relaxed);
    }

    /// Clears the given flag bits.
    pub fn clear_flag(&self, flag: PageFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::Relaxed);
    }

    /// Returns the cached run order.
    pub fn order(&self) -> usize {
        self.order.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn set_order(&self, order: usize) {
        debug_assert!(order < crate::MAX_ORDER);
        self.order.store(order as u8, Ordering::Relaxed);
    }

    /// Returns the owning section id, or `None` if unset.
    pub fn section(&self) -> Option<usize> {
        match self.section.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id as usize - 1),
        }
    }

    pub(crate) fn set_section(&self, id: usize) {
        debug_assert!(id < u16::MAX as usize);
        self.section.store(id as u16 + 1, Ordering::Relaxed);
    }

    /// Reads the state-dependent payload.
    ///
    /// # Safety
    ///
    /// The caller must either hold the owning section's lock, or own the
    /// allocation this page belongs to (an allocated run's payload is
    /// stable until it is freed).
    pub unsafe fn info(&self) -> PageInfo {
        // SAFETY: Precondition above.
        unsafe { *self.info.get() }
    }

    /// Replaces the state-dependent payload.
    ///
    /// # Safety
    ///
    /// The caller must either hold the owning section's lock, or have
    /// exclusive ownership of the run this page belongs to (pages popped
    /// from a freelist are unreachable from any list until they are
    /// retagged, so the popping thread is the only writer).
    pub unsafe fn set_info(&self, info: PageInfo) {
        // SAFETY: Precondition above.
        unsafe { *self.info.get() = info };
    }
}

/// The global page-frame table: one [`PageFrame`] per physical page,
/// indexed by frame number.
///
/// Built once at boot over all of physical memory (every frame starts
/// [`PageState::SystemCrucial`]); records are recycled between states and
/// never destroyed.
pub struct FrameTable {
    frames: Box<[PageFrame]>,
}

impl FrameTable {
    /// Builds a table covering frames `0..page_count`.
    pub fn new(page_count: u64) -> Self {
        let mut frames = Vec::with_capacity(page_count as usize);
        frames.resize_with(page_count as usize, PageFrame::new);
        Self {
            frames: frames.into_boxed_slice(),
        }
    }

    /// Number of frames tracked.
    pub fn page_count(&self) -> u64 {
        self.frames.len() as u64
    }

    /// Returns the record for `pfn`.
    ///
    /// # Panics
    ///
    /// Panics if `pfn` is outside the table.
    pub fn page(&self, pfn: u64) -> &PageFrame {
        &self.frames[pfn as usize]
    }

    /// Returns the record for `pfn`, or `None` if out of range.
    pub fn get(&self, pfn: u64) -> Option<&PageFrame> {
        self.frames.get(pfn as usize)
    }

    /// Returns the physical base address of frame `pfn`.
    pub fn page_to_phys(&self, pfn: u64) -> PhysAddr {
        debug_assert!(pfn < self.page_count());
        PhysAddr::from_pfn(pfn)
    }

    /// Returns the frame number containing `phys`.
    pub fn phys_to_pfn(&self, phys: PhysAddr) -> u64 {
        phys.page_frame_number()
    }

    /// Marks `count` pages dirty, starting at `pfn`.
    ///
    /// Pages of a hardware large-page run are not walked individually:
    /// the head gets the [`PageFlags::RUN_DIRTY`] summary flag and the walk
    /// skips to the end of the run. A `count` that ends mid-run still sets
    /// the summary flag but never advances past `pfn + count`.
    ///
    /// The caller must own the mappings covering the range, so the pages'
    /// states are stable for the duration of the walk.
    pub fn mark_pages_dirty(&self, pfn: u64, count: u64) {
        let end = (pfn + count).min(self.page_count());
        let mut cur = pfn;
        while cur < end {
            let page = self.page(cur);
            match page.state() {
                PageState::LargeHead => {
                    page.set_flag(PageFlags::RUN_DIRTY);
                    cur += 1 << page.order();
                }
                PageState::LargeTail => {
                    // Resolve the naturally-aligned head, flag it, and
                    // skip the remainder of the run.
                    let run = 1u64 << page.order();
                    let head = cur & !(run - 1);
                    self.page(head).set_flag(PageFlags::RUN_DIRTY);
                    cur = head + run;
                }
                _ => {
                    page.set_flag(PageFlags::DIRTY);
                    cur += 1;
                }
            }
        }
    }
}
