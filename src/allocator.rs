//! Block allocation with free-list reuse.
//!
//! Blocks are heap allocations with stable addresses, so concurrent descent
//! can hold references across another thread's create-on-demand. Released
//! blocks are either pushed onto an engine-wide stack for reuse or dropped,
//! depending on the reuse setting and the caller's destroy flag. A block on
//! a free-list is never reachable from the root.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::block::{InnerBlock, LeafBlock};
use crate::lock::{FreeListKind, LockPolicy};

/// Live and allocated node counts, in the three node categories: inner
/// parents, inner leaves (inner records without children), and depth-0
/// leaves. Transitions are single-writer under the active lock policy, so
/// relaxed ordering suffices.
#[derive(Debug, Default)]
pub(crate) struct NodeCounts {
    pub num_inner: AtomicUsize,
    pub num_inner_leaf: AtomicUsize,
    pub num_leaf: AtomicUsize,
    pub alloc_inner: AtomicUsize,
    pub alloc_inner_leaf: AtomicUsize,
    pub alloc_leaf: AtomicUsize,
}

impl NodeCounts {
    pub fn root_only() -> Self {
        let counts = Self::default();
        counts.num_inner_leaf.store(1, Ordering::Relaxed);
        counts.alloc_inner_leaf.store(1, Ordering::Relaxed);
        counts
    }

    #[inline]
    pub fn add(field: &AtomicUsize, n: usize) {
        field.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(field: &AtomicUsize, n: usize) {
        field.fetch_sub(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(field: &AtomicUsize) -> usize {
        field.load(Ordering::Relaxed)
    }
}

/// Allocates and releases the two block kinds, recycling through free-lists
/// when reuse is enabled.
pub(crate) struct BlockAllocator<T, L: LockPolicy> {
    reuse: bool,
    free_inner: UnsafeCell<Vec<NonNull<InnerBlock<T, L>>>>,
    free_leaf: UnsafeCell<Vec<NonNull<LeafBlock<T, L>>>>,
    pub counts: NodeCounts,
}

impl<T, L: LockPolicy> BlockAllocator<T, L> {
    pub fn new(reuse: bool) -> Self {
        Self {
            reuse,
            free_inner: UnsafeCell::new(Vec::new()),
            free_leaf: UnsafeCell::new(Vec::new()),
            counts: NodeCounts::root_only(),
        }
    }

    #[inline]
    pub fn reuses_blocks(&self) -> bool {
        self.reuse
    }

    /// A fresh or recycled inner block with all slots filled from `fill`.
    pub fn allocate_inner(&self, policy: &L, fill: impl Fn() -> T) -> NonNull<InnerBlock<T, L>> {
        if self.reuse {
            policy.lock_free_list(FreeListKind::Inner);
            // SAFETY: the free-list flag serializes access to the stack.
            let recycled = unsafe { (*self.free_inner.get()).pop() };
            policy.unlock_free_list(FreeListKind::Inner);
            if let Some(mut ptr) = recycled {
                // SAFETY: popped blocks are unreachable from the tree; we
                // are the only owner.
                unsafe { ptr.as_mut().reset(fill) };
                return ptr;
            }
        }
        NodeCounts::add(&self.counts.alloc_inner_leaf, 7);
        NodeCounts::add(&self.counts.alloc_inner, 1);
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(InnerBlock::new(fill)))) }
    }

    /// A fresh or recycled leaf block with all slots filled from `fill`.
    pub fn allocate_leaf(&self, policy: &L, fill: impl Fn() -> T) -> NonNull<LeafBlock<T, L>> {
        if self.reuse {
            policy.lock_free_list(FreeListKind::Leaf);
            // SAFETY: the free-list flag serializes access to the stack.
            let recycled = unsafe { (*self.free_leaf.get()).pop() };
            policy.unlock_free_list(FreeListKind::Leaf);
            if let Some(mut ptr) = recycled {
                // SAFETY: popped blocks are unreachable from the tree; we
                // are the only owner.
                unsafe { ptr.as_mut().reset(fill) };
                return ptr;
            }
        }
        NodeCounts::add(&self.counts.alloc_leaf, 8);
        NodeCounts::sub(&self.counts.alloc_inner_leaf, 1);
        NodeCounts::add(&self.counts.alloc_inner, 1);
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(LeafBlock::new(fill)))) }
    }

    /// Releases a detached, childless inner block. `destroy` forces
    /// deallocation even when reuse is enabled.
    pub fn release_inner(&self, policy: &L, ptr: NonNull<InnerBlock<T, L>>, destroy: bool) {
        if self.reuse && !destroy {
            policy.lock_free_list(FreeListKind::Inner);
            // SAFETY: the free-list flag serializes access to the stack.
            unsafe { (*self.free_inner.get()).push(ptr) };
            policy.unlock_free_list(FreeListKind::Inner);
        } else {
            // SAFETY: `ptr` came out of `allocate_inner` and is no longer
            // reachable from the tree.
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
            NodeCounts::sub(&self.counts.alloc_inner_leaf, 7);
            NodeCounts::sub(&self.counts.alloc_inner, 1);
        }
    }

    /// Releases a detached leaf block. `destroy` forces deallocation even
    /// when reuse is enabled.
    pub fn release_leaf(&self, policy: &L, ptr: NonNull<LeafBlock<T, L>>, destroy: bool) {
        if self.reuse && !destroy {
            policy.lock_free_list(FreeListKind::Leaf);
            // SAFETY: the free-list flag serializes access to the stack.
            unsafe { (*self.free_leaf.get()).push(ptr) };
            policy.unlock_free_list(FreeListKind::Leaf);
        } else {
            // SAFETY: `ptr` came out of `allocate_leaf` and is no longer
            // reachable from the tree.
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
            NodeCounts::sub(&self.counts.alloc_leaf, 8);
            NodeCounts::add(&self.counts.alloc_inner_leaf, 1);
            NodeCounts::sub(&self.counts.alloc_inner, 1);
        }
    }
}

impl<T, L: LockPolicy> Drop for BlockAllocator<T, L> {
    fn drop(&mut self) {
        for ptr in self.free_inner.get_mut().drain(..) {
            // SAFETY: free-listed blocks are exclusively owned by the
            // allocator.
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        }
        for ptr in self.free_leaf.get_mut().drain(..) {
            // SAFETY: as above.
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lock::NoLock;

    #[test]
    fn fresh_allocation_counts() {
        let alloc: BlockAllocator<u32, NoLock> = BlockAllocator::new(false);
        assert_eq!(NodeCounts::get(&alloc.counts.alloc_inner_leaf), 1);

        let inner = alloc.allocate_inner(&NoLock, || 0);
        assert_eq!(NodeCounts::get(&alloc.counts.alloc_inner), 1);
        assert_eq!(NodeCounts::get(&alloc.counts.alloc_inner_leaf), 8);

        alloc.release_inner(&NoLock, inner, false);
        assert_eq!(NodeCounts::get(&alloc.counts.alloc_inner), 0);
        assert_eq!(NodeCounts::get(&alloc.counts.alloc_inner_leaf), 1);
    }

    #[test]
    fn reuse_pops_released_blocks() {
        let alloc: BlockAllocator<u32, NoLock> = BlockAllocator::new(true);
        let a = alloc.allocate_leaf(&NoLock, || 1);
        let allocated = NodeCounts::get(&alloc.counts.alloc_leaf);
        alloc.release_leaf(&NoLock, a, false);
        // Free-listed, not deallocated.
        assert_eq!(NodeCounts::get(&alloc.counts.alloc_leaf), allocated);
        let b = alloc.allocate_leaf(&NoLock, || 2);
        assert_eq!(a, b);
        assert_eq!(NodeCounts::get(&alloc.counts.alloc_leaf), allocated);
        assert_eq!(unsafe { b.as_ref().payload() }, &[2; 8]);
        alloc.release_leaf(&NoLock, b, true);
    }
}
