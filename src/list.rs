use std::{marker::PhantomData, ptr::NonNull};

use crate::Pointer;

/// Linked list node. The node lives inside memory managed by some heap, the
/// list only stores pointers to it. See also [`crate::header::Header<T>`].
pub(crate) struct Node<T> {
    pub next: Pointer<Self>,
    pub prev: Pointer<Self>,
    pub data: T,
}

/// Intrusive doubly linked list. Every heap variant keeps some of its state
/// in lists like this one: Heap4 chains buckets, Heap6 chains live
/// allocations, Heap7 chains free blocks in bins, and so on. Nodes are
/// written into memory the caller already owns because, well, we are the
/// allocator and can't allocate nodes for ourselves.
pub(crate) struct LinkedList<T> {
    pub head: Pointer<Node<T>>,
    pub tail: Pointer<Node<T>>,
    pub len: usize,
    marker: PhantomData<T>,
}

impl<T> Clone for LinkedList<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for LinkedList<T> {}

impl<T> LinkedList<T> {
    /// Creates an empty linked list. No allocations happen.
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn first(&self) -> Pointer<Node<T>> {
        self.head
    }

    #[inline]
    pub fn last(&self) -> Pointer<Node<T>> {
        self.tail
    }

    /// Writes a new node holding `data` at `address` without linking it.
    ///
    /// # Safety
    ///
    /// `address` must be valid for writes and aligned for [`Node<T>`].
    #[inline]
    unsafe fn write_node(data: T, address: NonNull<u8>) -> NonNull<Node<T>> {
        let node = address.cast::<Node<T>>();
        node.as_ptr().write(Node {
            next: None,
            prev: None,
            data,
        });
        node
    }

    /// Appends a new node holding `data` at `address`.
    ///
    /// # Safety
    ///
    /// Caller must guarantee that `address` is valid and aligned.
    pub unsafe fn append(&mut self, data: T, address: NonNull<u8>) -> NonNull<Node<T>> {
        let node = Self::write_node(data, address);
        self.link_back(node);
        node
    }

    /// Same as [`Self::append`] but the new node becomes the head.
    pub unsafe fn push_front(&mut self, data: T, address: NonNull<u8>) -> NonNull<Node<T>> {
        let node = Self::write_node(data, address);
        self.link_front(node);
        node
    }

    /// Inserts a new node with the given `data` right after `anchor`.
    ///
    /// # Safety
    ///
    /// Caller must guarantee that both `address` and `anchor` are valid and
    /// that `anchor` belongs to this list.
    pub unsafe fn insert_after(
        &mut self,
        anchor: NonNull<Node<T>>,
        data: T,
        address: NonNull<u8>,
    ) -> NonNull<Node<T>> {
        let node = Self::write_node(data, address);
        self.link_after(anchor, node);
        node
    }

    /// Links an already written node at the end of the list.
    pub unsafe fn link_back(&mut self, mut node: NonNull<Node<T>>) {
        node.as_mut().prev = self.tail;
        node.as_mut().next = None;

        match self.tail {
            Some(mut tail) => tail.as_mut().next = Some(node),
            None => self.head = Some(node),
        }

        self.tail = Some(node);
        self.len += 1;
    }

    /// Links an already written node at the start of the list.
    pub unsafe fn link_front(&mut self, mut node: NonNull<Node<T>>) {
        node.as_mut().next = self.head;
        node.as_mut().prev = None;

        match self.head {
            Some(mut head) => head.as_mut().prev = Some(node),
            None => self.tail = Some(node),
        }

        self.head = Some(node);
        self.len += 1;
    }

    /// Links `node` right after `anchor`.
    pub unsafe fn link_after(&mut self, mut anchor: NonNull<Node<T>>, mut node: NonNull<Node<T>>) {
        let next = anchor.as_ref().next;
        node.as_mut().prev = Some(anchor);
        node.as_mut().next = next;
        anchor.as_mut().next = Some(node);

        match next {
            Some(mut next) => next.as_mut().prev = Some(node),
            None => self.tail = Some(node),
        }

        self.len += 1;
    }

    /// Unlinks `node` from the list. `node` must be valid and belong to this
    /// list. The node memory is left as it is.
    pub unsafe fn remove(&mut self, node: NonNull<Node<T>>) {
        let (prev, next) = (node.as_ref().prev, node.as_ref().next);

        match prev {
            Some(mut prev) => prev.as_mut().next = next,
            None => self.head = next,
        }

        match next {
            Some(mut next) => next.as_mut().prev = prev,
            None => self.tail = prev,
        }

        self.len -= 1;
    }

    /// Iterates over the nodes from head to tail. The successor is read
    /// before a node is yielded, so the yielded node may be unlinked.
    pub unsafe fn iter(&self) -> Iter<T> {
        Iter {
            current: self.head,
            marker: PhantomData,
        }
    }
}

pub(crate) struct Iter<T> {
    current: Pointer<Node<T>>,
    marker: PhantomData<T>,
}

impl<T> Iterator for Iter<T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.current.map(|node| unsafe {
            self.current = node.as_ref().next;
            node
        })
    }
}
