//! Intrusive 2-3 trees of free blocks, used by [`crate::Heap3`].
//!
//! Every free block carries one [`TreeNode`] per tree inside its own
//! content, so the trees never allocate. The node embedded in a block is its
//! *slot*; it is not necessarily the node that holds the block's value. Slots
//! not used as tree nodes sit in a per-tree pool and are handed out whenever
//! a split needs a fresh node. When a block leaves the tree its slot must be
//! vacated: pooled slots are simply unlinked, active ones are moved to a node
//! taken from the pool.
//!
//! A tree with `n` values never has more than `n` nodes, so the pool can't
//! run dry. All restructuring is iterative and walks parent links, stack use
//! doesn't depend on the size of the tree.

use std::{cmp::Ordering, mem, ptr::NonNull};

use thiserror::Error;

use crate::{block::SizeWord, block::SIZE_WORD, Pointer};

/// Size of one tree node in bytes.
pub(crate) const TREE_NODE_SIZE: usize = mem::size_of::<TreeNode>();

/// Tree inconsistencies found while restructuring or by [`Tree::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TreeFault {
    #[error("node pool exhausted")]
    PoolExhausted,
    #[error("block {address:#x} is not in the tree")]
    Missing { address: usize },
    #[error("node {node:#x} is malformed")]
    Malformed { node: usize },
    #[error("leaves at different depths")]
    Unbalanced,
    #[error("tree holds {found} values but {expected} were inserted")]
    Count { found: usize, expected: usize },
}

/// Shape of a valid tree, see [`Tree::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeShape {
    /// Number of levels, 0 for an empty tree.
    pub height: usize,
    pub values: usize,
    pub nodes: usize,
}

/// A tree node. Values are block addresses. Pooled nodes have `count == 0`
/// and reuse `parent` and `children[0]` as pool links.
#[repr(C)]
pub(crate) struct TreeNode {
    parent: Pointer<TreeNode>,
    count: usize,
    values: [Pointer<u8>; 2],
    children: [Pointer<TreeNode>; 3],
}

/// Ordering of a tree. Keys are compared as `(usize, usize)` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Key {
    /// `(address, 0)`.
    Address,
    /// `(size, address)`, which makes the least key `>= (size, 0)` the best
    /// fit with ties going to the lowest address.
    Size,
}

impl Key {
    #[inline]
    unsafe fn of(self, block: NonNull<u8>) -> (usize, usize) {
        let address = block.as_ptr() as usize;
        match self {
            Key::Address => (address, 0),
            Key::Size => (SizeWord::read(block).size(), address),
        }
    }

    /// Offset of this tree's slot inside a free block.
    #[inline]
    const fn slot_offset(self) -> usize {
        match self {
            Key::Address => SIZE_WORD,
            Key::Size => SIZE_WORD + TREE_NODE_SIZE,
        }
    }
}

/// Deepest tree [`Tree::verify`] can walk. A 2-3 tree of height 64 holds
/// more values than there are addresses.
const MAX_HEIGHT: usize = 64;

/// See the module docs.
pub(crate) struct Tree {
    root: Pointer<TreeNode>,
    pool: Pointer<TreeNode>,
    len: usize,
    key: Key,
}

impl Tree {
    pub const fn new(key: Key) -> Self {
        Self {
            root: None,
            pool: None,
            len: 0,
            key,
        }
    }

    /// Slot of this tree inside `block`.
    #[inline]
    unsafe fn slot(&self, block: NonNull<u8>) -> NonNull<TreeNode> {
        NonNull::new_unchecked(block.as_ptr().add(self.key.slot_offset())).cast()
    }

    #[inline]
    unsafe fn cmp(&self, block: Pointer<u8>, probe: (usize, usize)) -> Ordering {
        match block {
            Some(block) => self.key.of(block).cmp(&probe),
            None => Ordering::Greater,
        }
    }

    // Pool.

    unsafe fn pool_push(&mut self, mut node: NonNull<TreeNode>) {
        let node_ref = node.as_mut();
        node_ref.count = 0;
        node_ref.parent = None;
        node_ref.children[0] = self.pool;

        if let Some(mut head) = self.pool {
            head.as_mut().parent = Some(node);
        }

        self.pool = Some(node);
    }

    unsafe fn pool_pop(&mut self) -> Result<NonNull<TreeNode>, TreeFault> {
        let head = self.pool.ok_or(TreeFault::PoolExhausted)?;
        let next = head.as_ref().children[0];

        if let Some(mut next) = next {
            next.as_mut().parent = None;
        }

        self.pool = next;
        Ok(head)
    }

    unsafe fn pool_unlink(&mut self, node: NonNull<TreeNode>) {
        let (prev, next) = (node.as_ref().parent, node.as_ref().children[0]);

        match prev {
            Some(mut prev) => prev.as_mut().children[0] = next,
            None => self.pool = next,
        }

        if let Some(mut next) = next {
            next.as_mut().parent = prev;
        }
    }

    /// Takes a node from the pool and initializes it.
    unsafe fn new_node(
        &mut self,
        parent: Pointer<TreeNode>,
        values: [Pointer<u8>; 2],
        children: [Pointer<TreeNode>; 3],
    ) -> Result<NonNull<TreeNode>, TreeFault> {
        let node = self.pool_pop()?;
        let count = values.iter().filter(|value| value.is_some()).count();

        node.as_ptr().write(TreeNode {
            parent,
            count,
            values,
            children,
        });

        for child in children.into_iter().flatten() {
            (*child.as_ptr()).parent = Some(node);
        }

        Ok(node)
    }

    // Searches.

    /// Least value whose key is `>= probe`.
    pub unsafe fn lower_bound(&self, probe: (usize, usize)) -> Pointer<u8> {
        let mut best = None;
        let mut node = self.root;

        while let Some(current) = node {
            let current = current.as_ref();
            let mut i = 0;
            while i < current.count && self.cmp(current.values[i], probe) == Ordering::Less {
                i += 1;
            }
            if i < current.count {
                best = current.values[i];
            }
            node = current.children[i];
        }

        best
    }

    /// Greatest value whose key is `< probe`.
    pub unsafe fn last_below(&self, probe: (usize, usize)) -> Pointer<u8> {
        let mut best = None;
        let mut node = self.root;

        while let Some(current) = node {
            let current = current.as_ref();
            let mut i = 0;
            while i < current.count && self.cmp(current.values[i], probe) == Ordering::Less {
                i += 1;
            }
            if i > 0 {
                best = current.values[i - 1];
            }
            node = current.children[i];
        }

        best
    }

    /// Whether `block` is a value of this tree.
    pub unsafe fn contains(&self, block: NonNull<u8>) -> bool {
        self.lower_bound(self.key.of(block)) == Some(block)
    }

    /// Value that follows `block` in key order.
    pub unsafe fn successor(&self, block: NonNull<u8>) -> Pointer<u8> {
        let (major, minor) = self.key.of(block);
        self.lower_bound((major, minor + 1))
    }

    /// Iterates over all values in key order. Values must not be inserted
    /// or removed while iterating.
    pub unsafe fn values(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        let mut next = self.lower_bound((0, 0));
        std::iter::from_fn(move || {
            let current = next?;
            next = self.successor(current);
            Some(current)
        })
    }

    /// Index of `child` in the children of `parent`.
    unsafe fn child_index(parent: NonNull<TreeNode>, child: NonNull<TreeNode>) -> Result<usize, TreeFault> {
        let parent = parent.as_ref();
        parent.children[..=parent.count]
            .iter()
            .position(|c| *c == Some(child))
            .ok_or(TreeFault::Malformed { node: child.as_ptr() as usize })
    }

    // Insertion.

    /// Adds `block`, whose header must already hold its final size.
    pub unsafe fn insert(&mut self, block: NonNull<u8>) -> Result<(), TreeFault> {
        self.pool_push(self.slot(block));

        let key = self.key.of(block);

        let Some(mut node) = self.root else {
            self.root = Some(self.new_node(None, [Some(block), None], [None; 3])?);
            self.len = 1;
            return Ok(());
        };

        // Down to the leaf where the value belongs.
        let mut index = loop {
            let current = node.as_ref();
            let mut i = 0;
            while i < current.count && self.cmp(current.values[i], key) == Ordering::Less {
                i += 1;
            }
            match current.children[i] {
                Some(child) => node = child,
                None => break i,
            }
        };

        let mut value = block;
        let mut right: Pointer<TreeNode> = None;

        // Put `value` at `index` and `right` at `index + 1`, splitting full
        // nodes on the way up.
        loop {
            let current = node.as_ptr();

            if (*current).count == 1 {
                let values = &mut (*current).values;
                let children = &mut (*current).children;
                if index == 0 {
                    values[1] = values[0];
                    children[2] = children[1];
                }
                values[index] = Some(value);
                children[index + 1] = right;
                (*current).count = 2;
                if let Some(mut right) = right {
                    right.as_mut().parent = Some(node);
                }
                break;
            }

            let mut values = [None; 3];
            let mut children = [None; 4];
            let (mut v, mut c) = (0, 0);
            for i in 0..3 {
                if i == index {
                    values[i] = Some(value);
                } else {
                    values[i] = (*current).values[v];
                    v += 1;
                }
            }
            for i in 0..4 {
                if i == index + 1 {
                    children[i] = right;
                } else {
                    children[i] = (*current).children[c];
                    c += 1;
                }
            }

            (*current).count = 1;
            (*current).values = [values[0], None];
            (*current).children = [children[0], children[1], None];
            for child in (*current).children.into_iter().flatten() {
                (*child.as_ptr()).parent = Some(node);
            }

            let parent = (*current).parent;
            let sibling = self.new_node(parent, [values[2], None], [children[2], children[3], None])?;
            let Some(middle) = values[1] else {
                return Err(TreeFault::Malformed { node: node.as_ptr() as usize });
            };

            match parent {
                None => {
                    self.root = Some(self.new_node(None, [Some(middle), None], [Some(node), Some(sibling), None])?);
                    break;
                }
                Some(parent) => {
                    index = Self::child_index(parent, node)?;
                    value = middle;
                    right = Some(sibling);
                    node = parent;
                }
            }
        }

        self.len += 1;
        Ok(())
    }

    // Removal.

    /// Node holding `block` and the index of the value in it.
    unsafe fn locate(&self, block: NonNull<u8>) -> Result<(NonNull<TreeNode>, usize), TreeFault> {
        let key = self.key.of(block);
        let mut node = self.root;

        while let Some(current) = node {
            let node_ref = current.as_ref();
            let mut i = 0;
            while i < node_ref.count && self.cmp(node_ref.values[i], key) == Ordering::Less {
                i += 1;
            }
            if i < node_ref.count && node_ref.values[i] == Some(block) {
                return Ok((current, i));
            }
            node = node_ref.children[i];
        }

        Err(TreeFault::Missing { address: block.as_ptr() as usize })
    }

    /// Removes `block` and vacates its slot.
    pub unsafe fn remove(&mut self, block: NonNull<u8>) -> Result<(), TreeFault> {
        let (mut node, mut index) = self.locate(block)?;

        // Internal values are swapped with their in-order predecessor, which
        // always lives in a leaf.
        if let Some(mut leaf) = node.as_ref().children[index] {
            while let Some(child) = leaf.as_ref().children[leaf.as_ref().count] {
                leaf = child;
            }
            let last = leaf.as_ref().count - 1;
            node.as_mut().values[index] = leaf.as_ref().values[last];
            node = leaf;
            index = last;
        }

        let current = node.as_ptr();
        if index == 0 {
            (*current).values[0] = (*current).values[1];
        }
        (*current).values[1] = None;
        (*current).count -= 1;

        self.rebalance(node)?;
        self.len -= 1;
        self.vacate(self.slot(block))
    }

    /// Fixes the underflow of `node` and its ancestors.
    unsafe fn rebalance(&mut self, mut node: NonNull<TreeNode>) -> Result<(), TreeFault> {
        while node.as_ref().count == 0 {
            let Some(parent) = node.as_ref().parent else {
                self.root = node.as_ref().children[0];
                if let Some(mut root) = self.root {
                    root.as_mut().parent = None;
                }
                self.pool_push(node);
                return Ok(());
            };

            let j = Self::child_index(parent, node)?;
            let p = parent.as_ptr();
            let n = node.as_ptr();
            let orphan = (*n).children[0];

            if j > 0 {
                let Some(left) = (*p).children[j - 1] else {
                    return Err(TreeFault::Malformed { node: parent.as_ptr() as usize });
                };
                let s = left.as_ptr();

                if (*s).count == 2 {
                    // Rotate right through the parent.
                    let moved = (*s).children[2];
                    (*n).values[0] = (*p).values[j - 1];
                    (*n).children = [moved, orphan, None];
                    (*n).count = 1;
                    (*p).values[j - 1] = (*s).values[1];
                    (*s).values[1] = None;
                    (*s).children[2] = None;
                    (*s).count = 1;
                    if let Some(moved) = moved {
                        (*moved.as_ptr()).parent = Some(node);
                    }
                    return Ok(());
                }

                // Merge into the left sibling.
                (*s).values[1] = (*p).values[j - 1];
                (*s).children[2] = orphan;
                (*s).count = 2;
                if let Some(orphan) = orphan {
                    (*orphan.as_ptr()).parent = Some(left);
                }
                Self::remove_from_parent(p, j - 1, j);
            } else {
                let Some(right) = (*p).children[1] else {
                    return Err(TreeFault::Malformed { node: parent.as_ptr() as usize });
                };
                let s = right.as_ptr();

                if (*s).count == 2 {
                    // Rotate left through the parent.
                    let moved = (*s).children[0];
                    (*n).values[0] = (*p).values[0];
                    (*n).children = [orphan, moved, None];
                    (*n).count = 1;
                    (*p).values[0] = (*s).values[0];
                    (*s).values = [(*s).values[1], None];
                    (*s).children = [(*s).children[1], (*s).children[2], None];
                    (*s).count = 1;
                    if let Some(moved) = moved {
                        (*moved.as_ptr()).parent = Some(node);
                    }
                    return Ok(());
                }

                // Merge into the right sibling.
                (*s).values = [(*p).values[0], (*s).values[0]];
                (*s).children = [orphan, (*s).children[0], (*s).children[1]];
                (*s).count = 2;
                if let Some(orphan) = orphan {
                    (*orphan.as_ptr()).parent = Some(right);
                }
                Self::remove_from_parent(p, 0, 0);
            }

            self.pool_push(node);
            node = parent;
        }

        Ok(())
    }

    /// Drops value `value` and child `child` from `parent`, shifting the rest
    /// to the left.
    unsafe fn remove_from_parent(parent: *mut TreeNode, value: usize, child: usize) {
        let count = (*parent).count;

        for i in value..count - 1 {
            (*parent).values[i] = (*parent).values[i + 1];
        }
        (*parent).values[count - 1] = None;

        for i in child..count {
            (*parent).children[i] = (*parent).children[i + 1];
        }
        (*parent).children[count] = None;

        (*parent).count = count - 1;
    }

    /// Takes `slot` out of service before its block stops being free.
    unsafe fn vacate(&mut self, slot: NonNull<TreeNode>) -> Result<(), TreeFault> {
        if slot.as_ref().count == 0 {
            self.pool_unlink(slot);
            return Ok(());
        }

        let node = self.pool_pop()?;
        node.as_ptr().write(slot.as_ptr().read());

        match node.as_ref().parent {
            None => self.root = Some(node),
            Some(mut parent) => {
                let j = Self::child_index(parent, slot)?;
                parent.as_mut().children[j] = Some(node);
            }
        }

        let count = node.as_ref().count;
        for child in node.as_ref().children[..=count].iter().flatten() {
            (*child.as_ptr()).parent = Some(node);
        }

        Ok(())
    }

    // Verification.

    /// Walks the whole tree checking the 2-3 invariants: every node holds
    /// one or two ordered values, internal nodes have exactly one child more
    /// than values, parent links match and all leaves share the same depth.
    pub unsafe fn verify(&self) -> Result<TreeShape, TreeFault> {
        let mut shape = TreeShape {
            height: 0,
            values: 0,
            nodes: 0,
        };

        let Some(root) = self.root else {
            return match self.len {
                0 => Ok(shape),
                expected => Err(TreeFault::Count { found: 0, expected }),
            };
        };

        if root.as_ref().parent.is_some() {
            return Err(TreeFault::Malformed { node: root.as_ptr() as usize });
        }

        // Depth first with an explicit stack. Each level pushes at most three
        // children, two of which wait while the third is explored.
        let mut stack: [(Pointer<TreeNode>, usize); 3 * MAX_HEIGHT] = [(None, 0); 3 * MAX_HEIGHT];
        let mut top = 1;
        stack[0] = (Some(root), 1);
        let mut leaf_depth = None;

        while top > 0 {
            top -= 1;
            let (Some(node), depth) = stack[top] else {
                continue;
            };
            let node_ref = node.as_ref();
            let malformed = TreeFault::Malformed { node: node.as_ptr() as usize };

            if !(1..=2).contains(&node_ref.count) || depth > MAX_HEIGHT {
                return Err(malformed);
            }

            let values = &node_ref.values[..node_ref.count];
            if values.iter().any(Option::is_none) || node_ref.values[node_ref.count..].iter().any(Option::is_some) {
                return Err(malformed);
            }
            if let [Some(a), Some(b)] = node_ref.values {
                if self.key.of(a) >= self.key.of(b) {
                    return Err(malformed);
                }
            }

            shape.values += node_ref.count;
            shape.nodes += 1;

            let children = &node_ref.children[..=node_ref.count];
            if children.iter().all(Option::is_none) {
                match leaf_depth {
                    None => leaf_depth = Some(depth),
                    Some(expected) if expected != depth => return Err(TreeFault::Unbalanced),
                    Some(_) => {}
                }
                continue;
            }

            if children.iter().any(Option::is_none) || node_ref.children[node_ref.count + 1..].iter().any(Option::is_some) {
                return Err(malformed);
            }

            for child in children.iter().flatten() {
                if child.as_ref().parent != Some(node) || top == stack.len() {
                    return Err(malformed);
                }
                stack[top] = (Some(*child), depth + 1);
                top += 1;
            }
        }

        // Global order: walking successors must visit every value once.
        let ordered = self.values().count();
        if shape.values != self.len || ordered != self.len {
            return Err(TreeFault::Count {
                found: shape.values.max(ordered),
                expected: self.len,
            });
        }

        shape.height = leaf_depth.unwrap_or(0);
        Ok(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{align::WORD, testing::Arena};
    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

    /// Block size used by these tests, big enough for both slots.
    const BLOCK: usize = SIZE_WORD + 2 * TREE_NODE_SIZE;

    fn blocks(arena: &mut Arena, count: usize) -> Vec<NonNull<u8>> {
        (0..count)
            .map(|i| {
                let block = arena.at(i * BLOCK);
                // Sizes repeat so that the size tree sees ties.
                unsafe { SizeWord::encode(((i % 7) + 1) * 4 * WORD, SizeWord::FREE).write(block) };
                block
            })
            .collect()
    }

    #[test]
    fn insert_and_search() {
        let mut arena = Arena::new(64 * BLOCK);
        let blocks = blocks(&mut arena, 64);
        let mut tree = Tree::new(Key::Address);

        unsafe {
            for block in blocks.iter().rev() {
                tree.insert(*block).unwrap();
                tree.verify().unwrap();
            }

            let shape = tree.verify().unwrap();
            assert_eq!(shape.values, 64);
            assert!(shape.height >= 4 && shape.height <= 6, "{shape:?}");

            assert!(blocks.iter().all(|block| tree.contains(*block)));
            assert_eq!(tree.values().collect::<Vec<_>>(), blocks);

            let middle = blocks[10].as_ptr() as usize;
            assert_eq!(tree.lower_bound((middle + 1, 0)), Some(blocks[11]));
            assert_eq!(tree.last_below((middle, 0)), Some(blocks[9]));
            assert_eq!(tree.last_below((blocks[0].as_ptr() as usize, 0)), None);
        }
    }

    #[test]
    fn size_order_breaks_ties_by_address() {
        let mut arena = Arena::new(32 * BLOCK);
        let blocks = blocks(&mut arena, 32);
        let mut tree = Tree::new(Key::Size);

        unsafe {
            for block in &blocks {
                tree.insert(*block).unwrap();
            }

            // Blocks 2, 9, 16, ... all have size 12 words.
            assert_eq!(tree.lower_bound((3 * 4 * WORD, 0)), Some(blocks[2]));
            assert_eq!(tree.lower_bound((3 * 4 * WORD - 1, 0)), Some(blocks[2]));
            assert_eq!(tree.lower_bound((7 * 4 * WORD + 1, 0)), None);

            let sizes: Vec<_> = tree.values().map(|block| Key::Size.of(block)).collect();
            assert!(sizes.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }

    #[test]
    fn random_inserts_and_removes_stay_balanced() {
        let mut arena = Arena::new(300 * BLOCK);
        let blocks = blocks(&mut arena, 300);
        let mut rng = StdRng::seed_from_u64(23);

        for key in [Key::Address, Key::Size] {
            let mut tree = Tree::new(key);
            let mut inside = Vec::new();
            let mut outside = blocks.clone();
            outside.shuffle(&mut rng);

            unsafe {
                for round in 0..2000 {
                    let insert = inside.is_empty() || (!outside.is_empty() && rng.random_bool(0.55));
                    if insert {
                        let block = outside.pop().unwrap();
                        tree.insert(block).unwrap();
                        inside.push(block);
                    } else {
                        let i = rng.random_range(0..inside.len());
                        let block = inside.swap_remove(i);
                        tree.remove(block).unwrap();
                        outside.push(block);
                        assert!(!tree.contains(block));
                    }

                    if round % 50 == 0 {
                        let shape = tree.verify().unwrap();
                        assert_eq!(shape.values, inside.len());
                    }
                }

                for block in inside.drain(..) {
                    tree.remove(block).unwrap();
                }
                assert_eq!(tree.verify().unwrap().height, 0);
                assert_eq!(tree.len, 0);
            }
        }
    }

    #[test]
    fn missing_values_are_reported() {
        let mut arena = Arena::new(4 * BLOCK);
        let blocks = blocks(&mut arena, 4);
        let mut tree = Tree::new(Key::Address);

        unsafe {
            tree.insert(blocks[0]).unwrap();
            assert_eq!(
                tree.remove(blocks[1]),
                Err(TreeFault::Missing { address: blocks[1].as_ptr() as usize })
            );
        }
    }
}
