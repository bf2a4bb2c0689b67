//! Page-size abstractions and the architecture paging capability.
//!
//! Provides the [`PageSize`] marker types, the [`PteOps`] trait through
//! which allocator code decodes page-table entries without knowing the
//! architecture, and the [`LargePageLevel`] table describing the hardware
//! large-page tiers the buddy allocator may carve.

use crate::addr::PhysAddr;

/// Trait for page sizes (4 KiB, 2 MiB, 1 GiB).
pub trait PageSize: Copy + Eq + PartialOrd + Ord {
    /// The size in bytes.
    const SIZE: u64;
    /// Human-readable size string for debug output.
    const SIZE_AS_DEBUG_STR: &'static str;
}

/// 4 KiB page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size4KiB;

impl PageSize for Size4KiB {
    const SIZE: u64 = 4096;
    const SIZE_AS_DEBUG_STR: &'static str = "4KiB";
}

/// 2 MiB page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size2MiB;

impl PageSize for Size2MiB {
    const SIZE: u64 = 0x20_0000;
    const SIZE_AS_DEBUG_STR: &'static str = "2MiB";
}

/// 1 GiB page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size1GiB;

impl PageSize for Size1GiB {
    const SIZE: u64 = 0x4000_0000;
    const SIZE_AS_DEBUG_STR: &'static str = "1GiB";
}

// ---------------------------------------------------------------------------
// Page-table-entry capability
// ---------------------------------------------------------------------------

/// Architecture capability for decoding page-table entries.
///
/// The memory manager consumes entries as opaque integers through this
/// trait; each target architecture provides one implementation (see
/// [`crate::arch`]).
pub trait PteOps: Copy {
    /// Returns `true` if the entry is present / valid.
    fn is_present(self) -> bool;
    /// Returns `true` if the entry maps a large page at its level.
    fn is_large(self) -> bool;
    /// Returns `true` if the hardware dirty bit is set.
    fn is_dirty(self) -> bool;
    /// Returns the physical address stored in the entry.
    fn to_phys(self) -> PhysAddr;
    /// Returns `true` if both entries carry the same protection flags.
    fn flags_equal(self, other: Self) -> bool;
}

// ---------------------------------------------------------------------------
// Large-page tiers
// ---------------------------------------------------------------------------

/// Description of one hardware large-page tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LargePageLevel {
    /// Page-table level at which a single entry maps the whole run
    /// (2 = PD / 2 MiB, 3 = PDPT / 1 GiB on x86_64).
    pub table_level: u8,
    /// Log2 of the run's page count (9 for 2 MiB, 18 for 1 GiB).
    pub order: u32,
    /// Natural size in bytes.
    pub size: u64,
    /// Whether the running hardware supports this tier.
    pub supported: bool,
}

/// Large-page tiers, indexed by tier number (0 = smallest).
///
/// 1 GiB support is CPUID-dependent; boot code may flip `supported` copies
/// of this table, the allocator only reads it through [`LargePageLevel::get`].
pub const LARGE_PAGE_LEVELS: [LargePageLevel; 2] = [
    LargePageLevel {
        table_level: 2,
        order: 9,
        size: Size2MiB::SIZE,
        supported: true,
    },
    LargePageLevel {
        table_level: 3,
        order: 18,
        size: Size1GiB::SIZE,
        supported: true,
    },
];

impl LargePageLevel {
    /// Returns the tier description for `level`, or `None` if the tier does
    /// not exist or is not supported by the hardware.
    pub fn get(level: usize) -> Option<&'static LargePageLevel> {
        LARGE_PAGE_LEVELS.get(level).filter(|l| l.supported)
    }

    /// Number of 4 KiB pages in one run of this tier.
    pub const fn page_count(&self) -> u64 {
        1 << self.order
    }
}
