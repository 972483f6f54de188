use std::ptr::NonNull;

use crate::{
    block::{block_from_user_pointer, user_pointer_from_block, SizeWord},
    list::{LinkedList, Node},
};

/// While a block is free its content is ours, so we store the list links
/// right after its [`SizeWord`]:
///
/// ```text
/// +----------------------------+
/// | size | flags               | <- SizeWord, the only thing a used block keeps.
/// +----------------------------+
/// | pointer to next free block | <--+
/// +----------------------------+    | Node<()>
/// | pointer to prev free block | <--+
/// +----------------------------+
/// |      whatever was here     |
/// |            ...             |
/// +----------------------------+
/// ```
///
/// There's no data attached to the node, everything else about the block is
/// in its header, so [`Node<()>`] is enough and we get to reuse
/// [`LinkedList<T>`]. The list points to block *content*, not to headers;
/// [`FreeList::block_of`] goes back to the header.
pub(crate) type FreeListNode = Node<()>;

/// See [`FreeListNode`].
pub(crate) type FreeList = LinkedList<()>;

impl FreeList {
    /// Header of the free block that contains `node`.
    #[inline]
    pub unsafe fn block_of(node: NonNull<FreeListNode>) -> NonNull<u8> {
        block_from_user_pointer(node.cast())
    }

    /// List node stored in the free block at `block`.
    #[inline]
    pub unsafe fn node_of(block: NonNull<u8>) -> NonNull<FreeListNode> {
        user_pointer_from_block(block).cast()
    }

    /// Pushes the free block at `block` in front of the list.
    pub unsafe fn push_block(&mut self, block: NonNull<u8>) {
        self.push_front((), user_pointer_from_block(block));
    }

    /// Links `block` right after the free block `anchor`.
    pub unsafe fn insert_block_after(&mut self, anchor: NonNull<u8>, block: NonNull<u8>) {
        self.insert_after(Self::node_of(anchor), (), user_pointer_from_block(block));
    }

    /// Removes the free block at `block`.
    pub unsafe fn remove_block(&mut self, block: NonNull<u8>) {
        self.remove(Self::node_of(block));
    }

    /// Header of the first free block.
    pub fn first_block(&self) -> Option<NonNull<u8>> {
        self.first().map(|node| unsafe { Self::block_of(node) })
    }

    /// Header of the last free block.
    pub fn last_block(&self) -> Option<NonNull<u8>> {
        self.last().map(|node| unsafe { Self::block_of(node) })
    }

    /// Free list nodes are a little bit harder to iterate because they don't
    /// point to block headers, so let's make it easier.
    pub unsafe fn iter_blocks(&self) -> impl Iterator<Item = NonNull<u8>> {
        self.iter().map(|node| Self::block_of(node))
    }

    /// Next free block after `block` in list order.
    pub unsafe fn next_block(block: NonNull<u8>) -> Option<NonNull<u8>> {
        Self::node_of(block).as_ref().next.map(|node| Self::block_of(node))
    }

    /// Previous free block before `block` in list order.
    pub unsafe fn prev_block(block: NonNull<u8>) -> Option<NonNull<u8>> {
        Self::node_of(block).as_ref().prev.map(|node| Self::block_of(node))
    }

    /// Size of the free block at `block`.
    #[inline]
    pub unsafe fn size_of(block: NonNull<u8>) -> usize {
        SizeWord::read(block).size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::WORD;

    #[test]
    fn blocks_round_trip() {
        let mut memory = [0usize; 12];
        let block = |memory: &mut [usize; 12], word: usize| unsafe {
            NonNull::new_unchecked(memory.as_mut_ptr().add(word).cast::<u8>())
        };

        let mut list = FreeList::new();

        unsafe {
            let a = block(&mut memory, 0);
            let b = block(&mut memory, 4);
            let c = block(&mut memory, 8);
            SizeWord::encode(4 * WORD, SizeWord::FREE).write(a);
            SizeWord::encode(4 * WORD, SizeWord::FREE).write(b);
            SizeWord::encode(4 * WORD, SizeWord::FREE).write(c);

            list.push_block(c);
            list.push_block(a);
            list.insert_block_after(a, b);

            let order: Vec<_> = list.iter_blocks().collect();
            assert_eq!(order, [a, b, c]);
            assert_eq!(FreeList::next_block(a), Some(b));
            assert_eq!(FreeList::prev_block(c), Some(b));
            assert_eq!(FreeList::size_of(b), 4 * WORD);

            list.remove_block(b);
            assert_eq!(list.first_block(), Some(a));
            assert_eq!(list.last_block(), Some(c));
            assert_eq!(FreeList::next_block(a), Some(c));
        }
    }
}
