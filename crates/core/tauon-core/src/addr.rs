//! Typed virtual and physical address wrappers.
//!
//! [`VirtAddr`] and [`PhysAddr`] are newtypes that keep virtual and physical
//! addresses apart at the type level. `PhysAddr` additionally carries the
//! page-frame-number conversions the frame table is indexed by.

use core::fmt;
use core::ops::{Add, Sub};

/// Physical address space mask: bits 0..51.
const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_FFFF;

/// Log2 of the base page size (4 KiB frames).
const PAGE_SHIFT: u64 = 12;

/// A canonical 64-bit virtual address.
///
/// With 4-level paging, bits 48..63 must be a sign-extension of bit 47.
/// The type enforces that invariant by sign-extending on construction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

/// A 64-bit physical address (masked to 52 bits).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl VirtAddr {
    /// Creates a new `VirtAddr`, asserting the address is already canonical.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        let canonical = Self::new_truncate(addr);
        assert!(
            canonical.0 == addr,
            "VirtAddr::new: address is not canonical"
        );
        canonical
    }

    /// Creates a new `VirtAddr`, truncating to canonical form by
    /// sign-extending from bit 47.
    #[inline]
    pub const fn new_truncate(addr: u64) -> Self {
        Self(((addr << 16) as i64 >> 16) as u64)
    }

    /// Returns the zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u64` value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Converts this address to a raw mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns `true` if the address is aligned to `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to `align` (a power of two).
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self::new_truncate(self.0 & !(align - 1))
    }

    /// Aligns the address up to `align` (a power of two).
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self::new_truncate((self.0 + align - 1) & !(align - 1))
    }
}

impl PhysAddr {
    /// Creates a new `PhysAddr`, asserting no bits above 51 are set.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        assert!(
            addr & !PHYS_ADDR_MASK == 0,
            "PhysAddr::new: address exceeds 52 bits"
        );
        Self(addr)
    }

    /// Creates a new `PhysAddr` without validation.
    ///
    /// # Safety
    ///
    /// The caller must ensure no bits above 51 are set.
    #[inline]
    pub const unsafe fn new_unchecked(addr: u64) -> Self {
        Self(addr)
    }

    /// Returns the zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u64` value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the page frame number containing this address.
    #[inline]
    pub const fn page_frame_number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Returns the base address of the given page frame number.
    #[inline]
    pub const fn from_pfn(pfn: u64) -> Self {
        Self::new(pfn << PAGE_SHIFT)
    }

    /// Returns `true` if the address is aligned to `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to `align` (a power of two).
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self(self.0 & !(align - 1))
    }

    /// Aligns the address up to `align` (a power of two).
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self((self.0 + align - 1) & !(align - 1))
    }
}

impl Add<u64> for VirtAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self {
        Self::new_truncate(self.0 + rhs)
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = u64;

    fn sub(self, rhs: VirtAddr) -> u64 {
        self.0 - rhs.0
    }
}

impl Add<u64> for PhysAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self {
        Self::new(self.0 + rhs)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = u64;

    fn sub(self, rhs: PhysAddr) -> u64 {
        self.0 - rhs.0
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
