//! x86_64 page-table entries.
//!
//! Implements [`PteOps`] over the raw 64-bit entry format used by all four
//! paging levels (PML4 -> PDPT -> PD -> PT).

use crate::addr::PhysAddr;
use crate::paging::PteOps;

/// Physical address mask: bits 12..51 of a page table entry.
pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags::bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Entry is present / valid.
        const PRESENT       = 1 << 0;
        /// Page is writable.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode (ring 3).
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Cache disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by hardware on any access.
        const ACCESSED      = 1 << 5;
        /// Set by hardware on write.
        const DIRTY         = 1 << 6;
        /// PS bit -- 2 MiB page in PD, 1 GiB page in PDPT.
        const HUGE_PAGE     = 1 << 7;
        /// Global page (not flushed on CR3 switch when CR4.PGE is set).
        const GLOBAL        = 1 << 8;
        /// No-execute bit (requires EFER.NXE).
        const NO_EXECUTE    = 1 << 63;
    }
}

/// A single x86_64 page table entry (64 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    /// An empty (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates an entry pointing to `phys` with the given `flags`.
    pub const fn new(phys: PhysAddr, flags: PteFlags) -> Self {
        Self((phys.as_u64() & ADDR_MASK) | flags.bits())
    }

    /// Returns the raw 64-bit value.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns the flags portion of this entry.
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }
}

impl PteOps for Pte {
    fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    fn is_large(self) -> bool {
        self.flags().contains(PteFlags::HUGE_PAGE)
    }

    fn is_dirty(self) -> bool {
        self.flags().contains(PteFlags::DIRTY)
    }

    fn to_phys(self) -> PhysAddr {
        // SAFETY: The masked value is guaranteed to fit in 52 bits.
        unsafe { PhysAddr::new_unchecked(self.0 & ADDR_MASK) }
    }

    fn flags_equal(self, other: Self) -> bool {
        // ACCESSED / DIRTY are hardware-managed and not protection bits.
        let ignore = PteFlags::ACCESSED | PteFlags::DIRTY;
        self.flags().difference(ignore) == other.flags().difference(ignore)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_entry_not_present() {
        let entry = Pte::empty();
        assert!(!entry.is_present());
        assert_eq!(entry.to_phys().as_u64(), 0);
    }

    #[test]
    fn entry_round_trips_address() {
        let entry = Pte::new(PhysAddr::new(0x1234_5000), PteFlags::PRESENT);
        assert!(entry.is_present());
        assert_eq!(entry.to_phys(), PhysAddr::new(0x1234_5000));
    }

    #[test]
    fn huge_and_dirty_bits_decode() {
        let entry = Pte::new(
            PhysAddr::new(0x20_0000),
            PteFlags::PRESENT | PteFlags::HUGE_PAGE | PteFlags::DIRTY,
        );
        assert!(entry.is_large());
        assert!(entry.is_dirty());
    }

    #[test]
    fn flags_equal_ignores_hardware_bits() {
        let a = Pte::new(PhysAddr::new(0x1000), PteFlags::PRESENT | PteFlags::WRITABLE);
        let b = Pte::new(
            PhysAddr::new(0x2000),
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::DIRTY | PteFlags::ACCESSED,
        );
        assert!(a.flags_equal(b));

        let c = Pte::new(PhysAddr::new(0x1000), PteFlags::PRESENT | PteFlags::NO_EXECUTE);
        assert!(!a.flags_equal(c));
    }
}
