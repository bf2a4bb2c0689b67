//! Memory zones.
//!
//! A zone groups sections that share allocation constraints (DMA-capable
//! memory, regular memory, and so on). Each zone keeps a lock-free count
//! of its free pages so the allocator can reject a zone without touching
//! any section lock, and an optional fallback zone to try when it runs
//! dry.

use core::sync::atomic::{AtomicU64, Ordering};

use planck_noalloc::vec::ArrayVec;

/// Maximum number of sections a zone can hold.
pub const MAX_SECTIONS_PER_ZONE: usize = 64;

/// A named group of sections with a shared fallback policy.
pub struct Zone {
    name: &'static str,
    /// Free pages across all sections, maintained outside any lock. The
    /// count may lag individual section states; it is only used as a
    /// fast reject, never as ground truth.
    free_pages: AtomicU64,
    fallback: Option<usize>,
    sections: ArrayVec<usize, MAX_SECTIONS_PER_ZONE>,
}

impl Zone {
    /// Creates an empty zone. `fallback` names the zone to try when this
    /// one cannot satisfy an allocation.
    pub fn new(name: &'static str, fallback: Option<usize>) -> Self {
        Self {
            name,
            free_pages: AtomicU64::new(0),
            fallback,
            sections: ArrayVec::new(),
        }
    }

    /// The zone's display name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Index of the fallback zone, if any.
    pub fn fallback(&self) -> Option<usize> {
        self.fallback
    }

    /// Indices of this zone's sections, in registration order.
    pub fn sections(&self) -> &[usize] {
        self.sections.as_slice()
    }

    /// Registers a section. Returns `false` if the zone is full.
    #[must_use]
    pub fn add_section(&mut self, section: usize) -> bool {
        self.sections.try_push(section).is_ok()
    }

    /// Approximate free pages in the zone.
    pub fn free_pages(&self) -> u64 {
        self.free_pages.load(Ordering::Relaxed)
    }

    pub(crate) fn add_free(&self, pages: u64) {
        self.free_pages.fetch_add(pages, Ordering::Relaxed);
    }

    pub(crate) fn sub_free(&self, pages: u64) {
        let prev = self.free_pages.fetch_sub(pages, Ordering::Relaxed);
        debug_assert!(prev >= pages, "zone free-page count underflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_page_accounting() {
        let zone = Zone::new("normal", None);
        assert_eq!(zone.free_pages(), 0);
        zone.add_free(128);
        zone.sub_free(32);
        assert_eq!(zone.free_pages(), 96);
    }

    #[test]
    fn section_registration_caps_out() {
        let mut zone = Zone::new("dma", Some(1));
        for i in 0..MAX_SECTIONS_PER_ZONE {
            assert!(zone.add_section(i));
        }
        assert!(!zone.add_section(MAX_SECTIONS_PER_ZONE));
        assert_eq!(zone.sections().len(), MAX_SECTIONS_PER_ZONE);
        assert_eq!(zone.fallback(), Some(1));
    }
}
