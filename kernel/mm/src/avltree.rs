//! Arena-backed augmented AVL tree over address ranges.
//!
//! Nodes are stored in a `Vec` and linked by `u32` indices, so rotations
//! are index reassignment instead of pointer surgery. Each node carries a
//! `[front, front + size)` range, the usual AVL height, threading into a
//! doubly-linked in-order list, and the augmentation `largest_gap`: the
//! biggest free gap anywhere in the node's subtree, where a node's own
//! gap is the space between its range start and the previous node's range
//! end in sorted order. The augmentation is recomputed bottom-up after
//! every structural change so free-space search can descend in O(log n)
//! trusting it at every level.

use core::fmt;

use alloc_crate::vec::Vec;

/// Absent-index sentinel.
const NIL: u32 = u32::MAX;

/// Error returned when an inserted range overlaps an existing node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeOverlap;

impl fmt::Display for RangeOverlap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "range overlaps an existing node")
    }
}

/// Stable handle to a node in an [`AvlTree`].
///
/// Valid until the node is removed; using a handle after removal panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

struct Node<T> {
    front: u64,
    size: u64,
    parent: u32,
    left: u32,
    right: u32,
    /// In-order list threading. For a free slot, `next` chains the free
    /// list instead.
    prev: u32,
    next: u32,
    height: i32,
    /// Largest gap in this subtree (see module docs).
    largest_gap: u64,
    /// `None` marks a free arena slot.
    value: Option<T>,
}

/// The tree itself. See the module documentation.
pub struct AvlTree<T> {
    nodes: Vec<Node<T>>,
    root: u32,
    first: u32,
    last: u32,
    free_head: u32,
    len: usize,
}

impl<T> Default for AvlTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AvlTree<T> {
    /// Creates an empty tree.
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: NIL,
            first: NIL,
            last: NIL,
            free_head: NIL,
            len: 0,
        }
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the tree holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, i: u32) -> &Node<T> {
        &self.nodes[i as usize]
    }

    fn node_mut(&mut self, i: u32) -> &mut Node<T> {
        &mut self.nodes[i as usize]
    }

    fn live(&self, id: NodeId) -> &Node<T> {
        let node = self.node(id.0);
        assert!(node.value.is_some(), "stale node id {id:?}");
        node
    }

    /// Range of the node behind `id`.
    pub fn range(&self, id: NodeId) -> (u64, u64) {
        let node = self.live(id);
        (node.front, node.size)
    }

    /// Payload of the node behind `id`.
    pub fn value(&self, id: NodeId) -> &T {
        match &self.live(id).value {
            Some(v) => v,
            // Unreachable after the liveness assert.
            None => unreachable!(),
        }
    }

    /// Mutable payload of the node behind `id`.
    pub fn value_mut(&mut self, id: NodeId) -> &mut T {
        self.live(id);
        match &mut self.node_mut(id.0).value {
            Some(v) => v,
            None => unreachable!(),
        }
    }

    /// Lowest-addressed node.
    pub fn first_id(&self) -> Option<NodeId> {
        (self.first != NIL).then(|| NodeId(self.first))
    }

    /// Highest-addressed node.
    pub fn last_id(&self) -> Option<NodeId> {
        (self.last != NIL).then(|| NodeId(self.last))
    }

    /// Next node in address order.
    pub fn next_id(&self, id: NodeId) -> Option<NodeId> {
        let next = self.live(id).next;
        (next != NIL).then(|| NodeId(next))
    }

    /// Previous node in address order.
    pub fn prev_id(&self, id: NodeId) -> Option<NodeId> {
        let prev = self.live(id).prev;
        (prev != NIL).then(|| NodeId(prev))
    }

    // -----------------------------------------------------------------
    // Augmentation
    // -----------------------------------------------------------------

    fn height(&self, i: u32) -> i32 {
        if i == NIL { 0 } else { self.node(i).height }
    }

    fn subtree_gap(&self, i: u32) -> u64 {
        if i == NIL { 0 } else { self.node(i).largest_gap }
    }

    /// End of the range preceding node `i` in address order (0 when `i`
    /// is the first node).
    fn prev_end(&self, i: u32) -> u64 {
        let prev = self.node(i).prev;
        if prev == NIL {
            0
        } else {
            self.node(prev).front + self.node(prev).size
        }
    }

    /// Recomputes height and `largest_gap` of `i` from its children.
    fn update(&mut self, i: u32) {
        let node = self.node(i);
        let (left, right) = (node.left, node.right);
        let own_gap = node.front - self.prev_end(i);
        let height = 1 + self.height(left).max(self.height(right));
        let gap = own_gap
            .max(self.subtree_gap(left))
            .max(self.subtree_gap(right));
        let node = self.node_mut(i);
        node.height = height;
        node.largest_gap = gap;
    }

    /// Refreshes augmentation from `i` up to the root without rotating.
    fn update_to_root(&mut self, mut i: u32) {
        while i != NIL {
            self.update(i);
            i = self.node(i).parent;
        }
    }

    // -----------------------------------------------------------------
    // Rotations and rebalancing
    // -----------------------------------------------------------------

    fn rotate_left(&mut self, x: u32) {
        let y = self.node(x).right;
        let t = self.node(y).left;
        self.node_mut(x).right = t;
        if t != NIL {
            self.node_mut(t).parent = x;
        }
        let p = self.node(x).parent;
        self.node_mut(y).parent = p;
        if p == NIL {
            self.root = y;
        } else if self.node(p).left == x {
            self.node_mut(p).left = y;
        } else {
            self.node_mut(p).right = y;
        }
        self.node_mut(y).left = x;
        self.node_mut(x).parent = y;
        // The moved nodes' augmentations must be valid before anything
        // above them is recomputed.
        self.update(x);
        self.update(y);
    }

    fn rotate_right(&mut self, x: u32) {
        let y = self.node(x).left;
        let t = self.node(y).right;
        self.node_mut(x).left = t;
        if t != NIL {
            self.node_mut(t).parent = x;
        }
        let p = self.node(x).parent;
        self.node_mut(y).parent = p;
        if p == NIL {
            self.root = y;
        } else if self.node(p).left == x {
            self.node_mut(p).left = y;
        } else {
            self.node_mut(p).right = y;
        }
        self.node_mut(y).right = x;
        self.node_mut(x).parent = y;
        self.update(x);
        self.update(y);
    }

    /// Walks from `i` to the root, refreshing augmentation and rotating
    /// wherever a subtree is out of balance.
    fn fixup(&mut self, mut i: u32) {
        while i != NIL {
            self.update(i);
            let node = self.node(i);
            let balance = self.height(node.left) - self.height(node.right);
            if balance > 1 {
                let left = self.node(i).left;
                if self.height(self.node(left).left) < self.height(self.node(left).right) {
                    self.rotate_left(left);
                }
                self.rotate_right(i);
                i = self.node(i).parent;
            } else if balance < -1 {
                let right = self.node(i).right;
                if self.height(self.node(right).right) < self.height(self.node(right).left) {
                    self.rotate_right(right);
                }
                self.rotate_left(i);
                i = self.node(i).parent;
            }
            i = self.node(i).parent;
        }
    }

    // -----------------------------------------------------------------
    // Arena slots
    // -----------------------------------------------------------------

    fn alloc_node(&mut self, front: u64, size: u64, value: T) -> u32 {
        let node = Node {
            front,
            size,
            parent: NIL,
            left: NIL,
            right: NIL,
            prev: NIL,
            next: NIL,
            height: 1,
            largest_gap: 0,
            value: Some(value),
        };
        if self.free_head == NIL {
            self.nodes.push(node);
            (self.nodes.len() - 1) as u32
        } else {
            let i = self.free_head;
            self.free_head = self.node(i).next;
            self.nodes[i as usize] = node;
            i
        }
    }

    fn free_node(&mut self, i: u32) -> T {
        let free_head = self.free_head;
        let node = self.node_mut(i);
        let value = match node.value.take() {
            Some(v) => v,
            None => panic!("freeing a stale node slot {i}"),
        };
        node.parent = NIL;
        node.left = NIL;
        node.right = NIL;
        node.prev = NIL;
        node.next = free_head;
        self.free_head = i;
        self.len -= 1;
        value
    }

    // -----------------------------------------------------------------
    // Insert / remove
    // -----------------------------------------------------------------

    /// Inserts `[front, front + size)` with its payload. Rejects any
    /// overlap with an existing range, as well as ranges whose end wraps
    /// past the top of the address space.
    pub fn insert(&mut self, front: u64, size: u64, value: T) -> Result<NodeId, RangeOverlap> {
        let end = match front.checked_add(size) {
            Some(end) => end,
            None => return Err(RangeOverlap),
        };
        let mut parent = NIL;
        let mut go_left = false;
        let mut cur = self.root;
        while cur != NIL {
            let node = self.node(cur);
            parent = cur;
            // Stored ends cannot wrap: insert checked them on the way in.
            if end <= node.front {
                go_left = true;
                cur = node.left;
            } else if node.front + node.size <= front {
                go_left = false;
                cur = node.right;
            } else {
                return Err(RangeOverlap);
            }
        }

        let id = self.alloc_node(front, size, value);
        self.len += 1;
        self.node_mut(id).parent = parent;
        if parent == NIL {
            self.root = id;
            self.first = id;
            self.last = id;
        } else if go_left {
            // A new left child is its parent's in-order predecessor.
            self.node_mut(parent).left = id;
            self.link_before(parent, id);
        } else {
            self.node_mut(parent).right = id;
            self.link_after(parent, id);
        }
        // The new leaf's in-order successor is an ancestor, so one walk
        // refreshes both the successor's changed gap and the heights.
        self.fixup(id);
        Ok(NodeId(id))
    }

    fn link_before(&mut self, at: u32, id: u32) {
        let prev = self.node(at).prev;
        self.node_mut(id).prev = prev;
        self.node_mut(id).next = at;
        self.node_mut(at).prev = id;
        if prev == NIL {
            self.first = id;
        } else {
            self.node_mut(prev).next = id;
        }
    }

    fn link_after(&mut self, at: u32, id: u32) {
        let next = self.node(at).next;
        self.node_mut(id).next = next;
        self.node_mut(id).prev = at;
        self.node_mut(at).next = id;
        if next == NIL {
            self.last = id;
        } else {
            self.node_mut(next).prev = id;
        }
    }

    fn unlink(&mut self, i: u32) {
        let (prev, next) = {
            let node = self.node(i);
            (node.prev, node.next)
        };
        if prev == NIL {
            self.first = next;
        } else {
            self.node_mut(prev).next = next;
        }
        if next == NIL {
            self.last = prev;
        } else {
            self.node_mut(next).prev = prev;
        }
    }

    fn replace_child(&mut self, old: u32, new: u32) {
        let p = self.node(old).parent;
        if new != NIL {
            self.node_mut(new).parent = p;
        }
        if p == NIL {
            self.root = new;
        } else if self.node(p).left == old {
            self.node_mut(p).left = new;
        } else {
            self.node_mut(p).right = new;
        }
    }

    /// Removes the node behind `id` and returns its payload.
    pub fn remove(&mut self, id: NodeId) -> T {
        self.live(id);
        let i = id.0;
        let successor = self.node(i).next;
        // Unlink from the list first so gap recomputation below sees the
        // node's neighbors already joined.
        self.unlink(i);

        let (left, right) = {
            let node = self.node(i);
            (node.left, node.right)
        };
        let fixup_from;
        if left == NIL || right == NIL {
            let child = if left == NIL { right } else { left };
            fixup_from = self.node(i).parent;
            self.replace_child(i, child);
        } else {
            // Two children: splice the in-order successor (the leftmost
            // node of the right subtree) into this position, taking over
            // the structural fields including height, then rebalance
            // starting from where the successor was detached.
            let s = successor;
            debug_assert!(s != NIL && self.node(s).left == NIL);
            if self.node(s).parent == i {
                fixup_from = s;
            } else {
                fixup_from = self.node(s).parent;
                let s_right = self.node(s).right;
                self.node_mut(fixup_from).left = s_right;
                if s_right != NIL {
                    self.node_mut(s_right).parent = fixup_from;
                }
                self.node_mut(s).right = right;
                self.node_mut(right).parent = s;
            }
            self.node_mut(s).left = left;
            self.node_mut(left).parent = s;
            self.replace_child(i, s);
            let height = self.node(i).height;
            self.node_mut(s).height = height;
        }
        self.fixup(fixup_from);
        // The removed node's successor gained a wider gap; it is not
        // always on the fixup path (for example when it was the spliced
        // single child), so refresh its path explicitly.
        if successor != NIL {
            self.update_to_root(successor);
        }
        self.free_node(i)
    }

    // -----------------------------------------------------------------
    // Free-space search
    // -----------------------------------------------------------------

    /// Finds the lowest `align`-aligned address in `[lo, hi)` where a
    /// `size`-byte range fits between existing nodes. The descent prefers
    /// left subtrees, so equal candidates resolve to the lowest address.
    pub fn find_space(&self, lo: u64, hi: u64, size: u64, align: u64) -> Option<u64> {
        debug_assert!(size > 0);
        debug_assert!(align.is_power_of_two());
        if let Some(addr) = self.find_in(self.root, lo, hi, size, align) {
            return Some(addr);
        }
        // The augmentation only covers gaps before nodes; the space after
        // the last node is checked separately.
        let tail_lo = if self.last == NIL {
            0
        } else {
            self.node(self.last).front + self.node(self.last).size
        };
        Self::fit(tail_lo.max(lo), hi, size, align)
    }

    fn find_in(&self, i: u32, lo: u64, hi: u64, size: u64, align: u64) -> Option<u64> {
        if i == NIL {
            return None;
        }
        let node = self.node(i);
        // An aggregate gap below `size` cannot fit the request even
        // before clamping to `[lo, hi)`, so the subtree is skipped.
        if self.subtree_gap(node.left) >= size {
            if let Some(addr) = self.find_in(node.left, lo, hi, size, align) {
                return Some(addr);
            }
        }
        let gap_lo = self.prev_end(i).max(lo);
        let gap_hi = node.front.min(hi);
        if let Some(addr) = Self::fit(gap_lo, gap_hi, size, align) {
            return Some(addr);
        }
        if self.subtree_gap(node.right) >= size {
            return self.find_in(node.right, lo, hi, size, align);
        }
        None
    }

    /// Places `size` bytes at the first `align`-aligned address in
    /// `[gap_lo, gap_hi)`, with checked arithmetic so an alignment
    /// round-up near the address-space top declines instead of wrapping.
    fn fit(gap_lo: u64, gap_hi: u64, size: u64, align: u64) -> Option<u64> {
        let start = gap_lo.checked_add(align - 1)? & !(align - 1);
        if start.checked_add(size)? <= gap_hi {
            Some(start)
        } else {
            None
        }
    }

    // -----------------------------------------------------------------
    // Test support
    // -----------------------------------------------------------------

    /// Checks every structural invariant by exhaustive recomputation.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let mut inorder = Vec::new();
        self.collect_inorder(self.root, &mut inorder);
        let mut listed = Vec::new();
        let mut i = self.first;
        while i != NIL {
            listed.push(i);
            i = self.node(i).next;
        }
        assert_eq!(inorder, listed, "list threading disagrees with in-order traversal");
        assert_eq!(self.len, listed.len());
        assert_eq!(self.last, listed.last().copied().unwrap_or(NIL));
        for pair in listed.windows(2) {
            let a = self.node(pair[0]);
            let b = self.node(pair[1]);
            assert!(
                a.front + a.size <= b.front,
                "ranges overlap or are out of order"
            );
        }
        if self.root != NIL {
            self.check_subtree(self.root, NIL);
        }
    }

    #[cfg(test)]
    fn collect_inorder(&self, i: u32, out: &mut Vec<u32>) {
        if i == NIL {
            return;
        }
        self.collect_inorder(self.node(i).left, out);
        out.push(i);
        self.collect_inorder(self.node(i).right, out);
    }

    #[cfg(test)]
    fn check_subtree(&self, i: u32, parent: u32) -> (i32, u64) {
        let node = self.node(i);
        assert_eq!(node.parent, parent, "bad parent link at {i}");
        assert!(node.value.is_some(), "free slot reachable from root");
        let (lh, lg) = if node.left != NIL {
            self.check_subtree(node.left, i)
        } else {
            (0, 0)
        };
        let (rh, rg) = if node.right != NIL {
            self.check_subtree(node.right, i)
        } else {
            (0, 0)
        };
        assert!((lh - rh).abs() <= 1, "unbalanced at {i}");
        assert_eq!(node.height, 1 + lh.max(rh), "stale height at {i}");
        let own = node.front - self.prev_end(i);
        assert_eq!(
            node.largest_gap,
            own.max(lg).max(rg),
            "stale gap augmentation at {i}"
        );
        (node.height, node.largest_gap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with(ranges: &[(u64, u64)]) -> (AvlTree<usize>, Vec<NodeId>) {
        let mut tree = AvlTree::new();
        let ids = ranges
            .iter()
            .enumerate()
            .map(|(tag, &(front, size))| tree.insert(front, size, tag).unwrap())
            .collect();
        tree.assert_invariants();
        (tree, ids)
    }

    #[test]
    fn ordered_iteration() {
        let (tree, _) = tree_with(&[(0x5000, 0x1000), (0x1000, 0x1000), (0x9000, 0x2000)]);
        let mut fronts = Vec::new();
        let mut cur = tree.first_id();
        while let Some(id) = cur {
            fronts.push(tree.range(id).0);
            cur = tree.next_id(id);
        }
        assert_eq!(fronts, [0x1000, 0x5000, 0x9000]);
        assert_eq!(tree.range(tree.last_id().unwrap()).0, 0x9000);
    }

    #[test]
    fn overlap_is_rejected() {
        let (mut tree, _) = tree_with(&[(0x1000, 0x2000)]);
        assert_eq!(tree.insert(0x2000, 0x1000, 9), Err(RangeOverlap));
        assert_eq!(tree.insert(0x0000, 0x1001, 9), Err(RangeOverlap));
        // Touching ranges are fine.
        assert!(tree.insert(0x3000, 0x1000, 9).is_ok());
        assert!(tree.insert(0x0000, 0x1000, 9).is_ok());
        tree.assert_invariants();
    }

    #[test]
    fn range_past_address_space_top_is_rejected() {
        let mut tree = AvlTree::new();
        assert_eq!(
            tree.insert(u64::MAX - 0xFFF, 0x2000, 0),
            Err(RangeOverlap)
        );
        // The highest representable range is still accepted.
        let id = tree.insert(u64::MAX - 0xFFF, 0xFFF, 0).unwrap();
        tree.assert_invariants();
        assert_eq!(tree.range(id), (u64::MAX - 0xFFF, 0xFFF));
    }

    #[test]
    fn sequential_inserts_stay_balanced() {
        let mut tree = AvlTree::new();
        for n in 0..128u64 {
            tree.insert(n * 0x2000, 0x1000, n).unwrap();
            tree.assert_invariants();
        }
        // Height must be logarithmic, not linear.
        assert!(tree.node(tree.root).height <= 8);
    }

    #[test]
    fn remove_leaf_single_child_and_two_children() {
        let (mut tree, ids) = tree_with(&[
            (0x4000, 0x1000),
            (0x2000, 0x1000),
            (0x6000, 0x1000),
            (0x1000, 0x800),
            (0x5000, 0x1000),
            (0x7000, 0x1000),
        ]);
        // Leaves.
        assert_eq!(tree.remove(ids[3]), 3);
        tree.assert_invariants();
        assert_eq!(tree.remove(ids[4]), 4);
        tree.assert_invariants();
        // Root with two children; its successor 0x6000 still has a right
        // child of its own.
        assert_eq!(tree.remove(ids[0]), 0);
        tree.assert_invariants();
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn freed_slots_are_chained_and_reused() {
        let (mut tree, ids) = tree_with(&[
            (0x1000, 0x1000),
            (0x3000, 0x1000),
            (0x5000, 0x1000),
            (0x7000, 0x1000),
        ]);
        // Free two slots so the free list holds a chain, not a single entry.
        assert_eq!(tree.remove(ids[1]), 1);
        assert_eq!(tree.remove(ids[2]), 2);
        let backing = tree.nodes.len();
        // Reinserting must pop both chained slots without growing the arena.
        let a = tree.insert(0x3000, 0x1000, 10).unwrap();
        let b = tree.insert(0x5000, 0x1000, 11).unwrap();
        assert_eq!(tree.nodes.len(), backing);
        assert_eq!(*tree.value(a), 10);
        assert_eq!(*tree.value(b), 11);
        tree.assert_invariants();
    }

    #[test]
    #[should_panic(expected = "stale node id")]
    fn stale_id_is_rejected() {
        let (mut tree, ids) = tree_with(&[(0x1000, 0x1000)]);
        tree.remove(ids[0]);
        tree.range(ids[0]);
    }

    #[test]
    fn slots_are_recycled() {
        let (mut tree, ids) = tree_with(&[(0x1000, 0x1000), (0x3000, 0x1000)]);
        tree.remove(ids[0]);
        let id = tree.insert(0x5000, 0x1000, 7).unwrap();
        // The freed slot was reused rather than growing the arena.
        assert_eq!(tree.nodes.len(), 2);
        assert_eq!(*tree.value(id), 7);
        tree.assert_invariants();
    }

    #[test]
    fn randomized_churn_preserves_invariants() {
        let mut tree = AvlTree::new();
        let mut live: Vec<NodeId> = Vec::new();
        let mut rng: u64 = 0x9E37_79B9_7F4A_7C15;
        for round in 0..500 {
            rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            if rng & 3 != 0 || live.is_empty() {
                let front = ((rng >> 16) % 4096) * 0x1000;
                if let Ok(id) = tree.insert(front, 0x1000, round) {
                    live.push(id);
                }
            } else {
                let id = live.swap_remove((rng >> 20) as usize % live.len());
                tree.remove(id);
            }
            tree.assert_invariants();
        }
        assert_eq!(tree.len(), live.len());
    }

    #[test]
    fn find_space_in_empty_tree() {
        let tree: AvlTree<()> = AvlTree::new();
        assert_eq!(tree.find_space(0x1000, 0x10_0000, 0x2000, 0x1000), Some(0x1000));
    }

    #[test]
    fn find_space_prefers_lowest_gap() {
        // Gaps: [0x0, 0x1000), [0x3000, 0x6000), [0x8000, ...).
        let (tree, _) = tree_with(&[(0x1000, 0x2000), (0x6000, 0x2000)]);
        assert_eq!(tree.find_space(0, 0x10000, 0x1000, 0x1000), Some(0));
        assert_eq!(tree.find_space(0, 0x10000, 0x2000, 0x1000), Some(0x3000));
        // Only the trailing space fits this one.
        assert_eq!(tree.find_space(0, 0x10000, 0x4000, 0x1000), Some(0x8000));
        assert_eq!(tree.find_space(0, 0x10000, 0x9000, 0x1000), None);
    }

    #[test]
    fn find_space_respects_range_and_alignment() {
        let (tree, _) = tree_with(&[(0x1000, 0x2000), (0x6000, 0x2000)]);
        // The low gap is outside the requested range.
        assert_eq!(
            tree.find_space(0x3000, 0x8000, 0x1000, 0x1000),
            Some(0x3000)
        );
        // Alignment pushes past the middle gap's start.
        assert_eq!(
            tree.find_space(0x3800, 0x10000, 0x2000, 0x4000),
            Some(0x4000)
        );
        // Aligned candidate no longer fits in the middle gap.
        assert_eq!(
            tree.find_space(0x3800, 0x10000, 0x2800, 0x4000),
            Some(0x8000)
        );
    }

    #[test]
    fn find_space_alignment_overflow_declines() {
        let tree: AvlTree<()> = AvlTree::new();
        assert_eq!(
            tree.find_space(u64::MAX - 0x10, u64::MAX, 0x1000, 0x1000),
            None
        );
    }

    #[test]
    fn deleting_middle_node_widens_gap() {
        let (mut tree, ids) = tree_with(&[
            (0x1000, 0x1000),
            (0x3000, 0x1000),
            (0x5000, 0x1000),
        ]);
        // No 0x3000-byte gap below 0x5000 yet.
        assert_eq!(tree.find_space(0x1000, 0x6000, 0x3000, 0x1000), None);
        tree.remove(ids[1]);
        tree.assert_invariants();
        // The two 0x1000 gaps and the removed range now form one gap.
        assert_eq!(
            tree.find_space(0x1000, 0x6000, 0x3000, 0x1000),
            Some(0x2000)
        );
    }
}
