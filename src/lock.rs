//! Lock policies for concurrent mutation.
//!
//! The policy is a type parameter of the tree, chosen at construction:
//!
//! - [`NoLock`]: single-threaded; creating children takes no locks and the
//!   tree is not [`Sync`].
//! - [`DepthLock`]: one spin flag per depth level plus two for the block
//!   free-lists; mutations that split a node at the same depth serialize.
//! - [`NodeLock`]: one spin flag per block; mutations on disjoint subtrees
//!   proceed independently at the cost of a flag per block.
//!
//! Creating children is double-checked: the leaf bit is re-read after the
//! flag is acquired, and the acquisition is abandoned if another thread got
//! there first.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::Depth;

/// Which engine-wide free-list a lock request refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FreeListKind {
    Inner,
    Leaf,
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::NoLock {}
    impl Sealed for super::DepthLock {}
    impl Sealed for super::NodeLock {}
}

/// A create-children locking discipline. See the module docs for the three
/// variants.
pub trait LockPolicy: sealed::Sealed + Default + Send + Sync + 'static {
    /// Per-block lock slot; zero-sized for every policy except [`NodeLock`].
    type BlockFlag: Default + Send + Sync;

    /// Acquires the create-children lock for a node at `depth`, bailing out
    /// if `is_leaf` turns false before or after acquisition. Returns whether
    /// the lock is held (and the leaf bit is still set).
    fn lock_if_leaf(&self, depth: Depth, flag: &Self::BlockFlag, is_leaf: impl Fn() -> bool)
        -> bool;

    fn unlock_children(&self, depth: Depth, flag: &Self::BlockFlag);

    fn lock_free_list(&self, kind: FreeListKind);

    fn unlock_free_list(&self, kind: FreeListKind);
}

/// Marker for policies that admit mutation through a shared reference.
/// [`NoLock`] deliberately does not implement it.
pub trait ConcurrentPolicy: LockPolicy {}

#[inline]
fn try_acquire(flag: &AtomicBool) -> bool {
    flag.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
}

#[inline]
fn spin_acquire_if(flag: &AtomicBool, still_wanted: impl Fn() -> bool) -> bool {
    loop {
        if !still_wanted() {
            return false;
        }
        if try_acquire(flag) {
            break;
        }
        std::hint::spin_loop();
    }
    if !still_wanted() {
        flag.store(false, Ordering::Release);
        return false;
    }
    true
}

/// Single-threaded policy: no flags at all.
#[derive(Debug, Default)]
pub struct NoLock;

impl LockPolicy for NoLock {
    type BlockFlag = ();

    #[inline]
    fn lock_if_leaf(&self, _depth: Depth, _flag: &(), is_leaf: impl Fn() -> bool) -> bool {
        is_leaf()
    }

    #[inline]
    fn unlock_children(&self, _depth: Depth, _flag: &()) {}

    #[inline]
    fn lock_free_list(&self, _kind: FreeListKind) {}

    #[inline]
    fn unlock_free_list(&self, _kind: FreeListKind) {}
}

/// One spin flag per depth level; all splits of same-depth nodes serialize.
#[derive(Debug)]
pub struct DepthLock {
    depths: [AtomicBool; crate::code::MAX_DEPTH as usize + 1],
    free_lists: [AtomicBool; 2],
}

impl Default for DepthLock {
    fn default() -> Self {
        Self {
            depths: std::array::from_fn(|_| AtomicBool::new(false)),
            free_lists: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }
}

impl LockPolicy for DepthLock {
    type BlockFlag = ();

    #[inline]
    fn lock_if_leaf(&self, depth: Depth, _flag: &(), is_leaf: impl Fn() -> bool) -> bool {
        spin_acquire_if(&self.depths[depth as usize], is_leaf)
    }

    #[inline]
    fn unlock_children(&self, depth: Depth, _flag: &()) {
        self.depths[depth as usize].store(false, Ordering::Release);
    }

    #[inline]
    fn lock_free_list(&self, kind: FreeListKind) {
        let flag = &self.free_lists[kind as usize];
        while !try_acquire(flag) {
            std::hint::spin_loop();
        }
    }

    #[inline]
    fn unlock_free_list(&self, kind: FreeListKind) {
        self.free_lists[kind as usize].store(false, Ordering::Release);
    }
}

impl ConcurrentPolicy for DepthLock {}

/// One spin flag per block; splits of disjoint subtrees are independent.
#[derive(Debug)]
pub struct NodeLock {
    free_lists: [AtomicBool; 2],
}

impl Default for NodeLock {
    fn default() -> Self {
        Self {
            free_lists: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }
}

impl LockPolicy for NodeLock {
    type BlockFlag = AtomicBool;

    #[inline]
    fn lock_if_leaf(&self, _depth: Depth, flag: &AtomicBool, is_leaf: impl Fn() -> bool) -> bool {
        spin_acquire_if(flag, is_leaf)
    }

    #[inline]
    fn unlock_children(&self, _depth: Depth, flag: &AtomicBool) {
        flag.store(false, Ordering::Release);
    }

    #[inline]
    fn lock_free_list(&self, kind: FreeListKind) {
        let flag = &self.free_lists[kind as usize];
        while !try_acquire(flag) {
            std::hint::spin_loop();
        }
    }

    #[inline]
    fn unlock_free_list(&self, kind: FreeListKind) {
        self.free_lists[kind as usize].store(false, Ordering::Release);
    }
}

impl ConcurrentPolicy for NodeLock {}
