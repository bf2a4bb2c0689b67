//! Memory management for the Tauon kernel.
//!
//! Two independent subsystems live here:
//!
//! - The **physical page allocator**: a lock-striped buddy allocator over
//!   per-page metadata ([`page`]), physically contiguous [`section`]s with
//!   per-order freelists, preference-ordered [`zone`]s with fallback
//!   chains, and the allocation/free/coalescing algorithms in [`alloc`].
//! - The **address-space manager**: an augmented AVL interval tree
//!   ([`avltree`]) and the [`addrspace`] layer that places virtual memory
//!   areas into free gaps in O(log n).
//!
//! Everything is host-testable: the crate is `no_std` outside of tests and
//! all physical memory access goes through an HHDM offset the tests point
//! at ordinary heap buffers.

#![cfg_attr(not(test), no_std)]

extern crate alloc as alloc_crate;

pub mod addrspace;
pub mod alloc;
pub mod avltree;
pub mod page;
pub mod section;
pub mod zone;

use core::fmt;

use tauon_core::addr::PhysAddr;

/// Standard 4 KiB page size.
pub const PAGE_SIZE: usize = 4096;

/// Page offset mask (lower 12 bits).
pub const PAGE_MASK: usize = 0xFFF;

/// One past the highest representable buddy order. Orders run 0..=30;
/// an order-30 run is 4 TiB of pages, far beyond any single section.
pub const MAX_ORDER: usize = 31;

/// Sentinel page frame number used for absent freelist links.
pub const INVALID_PFN: u64 = u64::MAX;

/// A physical memory region descriptor, independent of bootloader types.
#[derive(Debug, Clone, Copy)]
pub struct PhysMemoryRegion {
    /// Physical start address of the region.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// Whether this region is usable RAM.
    pub usable: bool,
}

/// Errors from boot-time construction of the physical memory registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// The section's page range lies outside the frame table.
    RegionOutOfRange,
    /// A zone's section list is at capacity.
    ZoneFull,
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmError::RegionOutOfRange => write!(f, "region outside the frame table"),
            MmError::ZoneFull => write!(f, "zone section list full"),
        }
    }
}
