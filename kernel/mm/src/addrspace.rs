//! Virtual address-space layout management.
//!
//! [`AddrSpace`] tracks the non-overlapping `[front, front + size)`
//! ranges occupied in an address space (virtual memory areas, MMIO
//! windows) in an [`AvlTree`], and finds free gaps for new mappings in
//! O(log n). It carries no lock of its own; the owning structure (a
//! process's memory map) serializes mutations, since a gap search and
//! the insert that claims it must be atomic as a unit.

use tauon_core::addr::VirtAddr;

use crate::avltree::{AvlTree, NodeId, RangeOverlap};

/// The set of occupied ranges in one address space. `T` is the
/// per-mapping payload (a VM-area descriptor, an MMIO tag, ...).
pub struct AddrSpace<T> {
    tree: AvlTree<T>,
}

impl<T> Default for AddrSpace<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AddrSpace<T> {
    /// Creates an empty address space.
    pub const fn new() -> Self {
        Self {
            tree: AvlTree::new(),
        }
    }

    /// Number of mappings.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Returns `true` if no ranges are mapped.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Finds the lowest free `align`-aligned gap of `size` bytes within
    /// `[range_start, range_end)` and claims it for `value`. Returns the
    /// placed address and the node handle, or `None` when no gap fits.
    ///
    /// Zero-size requests are a caller bug, rejected by debug assertion.
    pub fn find_space_and_add_node(
        &mut self,
        range_start: VirtAddr,
        range_end: VirtAddr,
        size: u64,
        align: u64,
        value: T,
    ) -> Option<(VirtAddr, NodeId)> {
        debug_assert!(size > 0);
        let front = self
            .tree
            .find_space(range_start.as_u64(), range_end.as_u64(), size, align)?;
        // The gap was just found under the same borrow, so the insert
        // cannot overlap.
        let id = self.tree.insert(front, size, value).ok()?;
        Some((VirtAddr::new(front), id))
    }

    /// Claims an exact range decided by the caller (fixed mappings such
    /// as MMIO at hardware-dictated addresses).
    pub fn add_node(
        &mut self,
        front: VirtAddr,
        size: u64,
        value: T,
    ) -> Result<NodeId, RangeOverlap> {
        debug_assert!(size > 0);
        self.tree.insert(front.as_u64(), size, value)
    }

    /// Releases a mapping and returns its payload.
    pub fn remove_node(&mut self, id: NodeId) -> T {
        self.tree.remove(id)
    }

    /// Range covered by a mapping.
    pub fn node_range(&self, id: NodeId) -> (VirtAddr, u64) {
        let (front, size) = self.tree.range(id);
        (VirtAddr::new(front), size)
    }

    /// Payload of a mapping.
    pub fn node_value(&self, id: NodeId) -> &T {
        self.tree.value(id)
    }

    /// Mutable payload of a mapping.
    pub fn node_value_mut(&mut self, id: NodeId) -> &mut T {
        self.tree.value_mut(id)
    }

    /// Lowest mapping in the space.
    pub fn first(&self) -> Option<NodeId> {
        self.tree.first_id()
    }

    /// Highest mapping in the space.
    pub fn last(&self) -> Option<NodeId> {
        self.tree.last_id()
    }

    /// Mapping directly after `id` in address order.
    pub fn node_next(&self, id: NodeId) -> Option<NodeId> {
        self.tree.next_id(id)
    }

    /// Mapping directly before `id` in address order.
    pub fn node_prev(&self, id: NodeId) -> Option<NodeId> {
        self.tree.prev_id(id)
    }

    /// Iterates mappings in address order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            space: self,
            cur: self.first(),
        }
    }
}

/// Address-ordered iterator over an [`AddrSpace`].
pub struct Iter<'a, T> {
    space: &'a AddrSpace<T>,
    cur: Option<NodeId>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (VirtAddr, u64, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        self.cur = self.space.node_next(id);
        let (front, size) = self.space.node_range(id);
        Some((front, size, self.space.node_value(id)))
    }
}
