//! The block-octree engine.
//!
//! A depth-balanced octree whose nodes are stored eight siblings to a block.
//! Depth 0 is the finest level; depth increases toward the root, which sits
//! at `depth_levels - 1`. Mutation descends from the root creating blocks on
//! demand, marks `modified` bits along the path, and a bottom-up propagation
//! pass aggregates children into parents, pruning sibling groups that every
//! attribute map reports collapsible.
//!
//! Structural mutation through a shared reference is available under the
//! [`DepthLock`](crate::lock::DepthLock) and
//! [`NodeLock`](crate::lock::NodeLock) policies via
//! [`Octree::apply_shared`]. Queries concurrent with mutation are the
//! caller's responsibility to serialize, as are propagation, pruning and
//! clearing, which take `&mut self`.

use std::marker::PhantomData;
use std::ptr::NonNull;

use glam::DVec3;
use smallvec::SmallVec;

use crate::allocator::{BlockAllocator, NodeCounts};
use crate::block::{InnerBlock, LeafBlock};
use crate::code::{Code, Key, MAX_DEPTH};
use crate::error::{Error, Result};
use crate::geometry::Aabb;
use crate::lock::{ConcurrentPolicy, LockPolicy, NoLock};
use crate::map::AttributeMap;
use crate::{ChildIndex, Depth};

/// Fewest depth levels a tree may have.
pub const MIN_DEPTH_LEVELS: Depth = 3;
/// Most depth levels a tree may have.
pub const MAX_DEPTH_LEVELS: Depth = 22;

/// Construction-time switches.
#[derive(Clone, Copy, Debug)]
pub struct OctreeOptions {
    /// Prune collapsible sibling groups during propagation.
    pub automatic_prune: bool,
    /// Recycle released blocks through free-lists instead of deallocating.
    pub reuse_blocks: bool,
}

impl Default for OctreeOptions {
    fn default() -> Self {
        Self {
            automatic_prune: true,
            reuse_blocks: false,
        }
    }
}

/// A resolved node handle: the block that holds the record, the code that
/// was asked for, and the depth the record actually lives at. `data_depth`
/// exceeds `code.depth()` when no finer block exists along the path.
///
/// Handles borrow the tree; operations that can release blocks take `&mut`
/// access and therefore invalidate them.
#[derive(Clone, Copy, Debug)]
pub struct Node<'t> {
    code: Code,
    data_depth: Depth,
    raw: *const u8,
    _tree: PhantomData<&'t ()>,
}

impl<'t> Node<'t> {
    #[inline]
    pub fn code(&self) -> Code {
        self.code
    }

    #[inline]
    pub fn depth(&self) -> Depth {
        self.code.depth()
    }

    /// Depth of the block actually holding the record.
    #[inline]
    pub fn data_depth(&self) -> Depth {
        self.data_depth
    }

    /// Whether the record sits at the finest level.
    #[inline]
    pub fn is_pure_leaf(&self) -> bool {
        self.data_depth == 0
    }

    #[inline]
    pub(crate) fn sibling_index(&self) -> usize {
        self.code.index(self.data_depth) as usize
    }
}

/// A [`Node`] carrying its bounding volume, computed on the way down so
/// spatial queries never recompute it.
#[derive(Clone, Copy, Debug)]
pub struct NodeBV<'t> {
    node: Node<'t>,
    aabb: Aabb,
}

impl<'t> NodeBV<'t> {
    #[inline]
    pub(crate) fn new(node: Node<'t>, aabb: Aabb) -> Self {
        Self { node, aabb }
    }

    #[inline]
    pub fn node(&self) -> Node<'t> {
        self.node
    }

    #[inline]
    pub fn aabb(&self) -> Aabb {
        self.aabb
    }

    #[inline]
    pub fn code(&self) -> Code {
        self.node.code()
    }

    #[inline]
    pub fn depth(&self) -> Depth {
        self.node.depth()
    }

    #[inline]
    pub fn data_depth(&self) -> Depth {
        self.node.data_depth()
    }

    #[inline]
    pub fn center(&self) -> DVec3 {
        self.aabb.center
    }

    #[inline]
    pub fn half_size(&self) -> f64 {
        self.aabb.half_size
    }
}

type Inner<M, L> = InnerBlock<<M as AttributeMap>::Node, L>;
type Leaf<M, L> = LeafBlock<<M as AttributeMap>::Node, L>;

/// A probabilistic map over a block-octree, composed with one attribute map
/// (possibly a tuple of maps) and a lock policy.
pub struct Octree<M: AttributeMap, L: LockPolicy = NoLock> {
    map: M,
    policy: L,
    alloc: BlockAllocator<M::Node, L>,
    /// Only slot 0 is meaningful; the root's effective sibling index is 0.
    root: Box<Inner<M, L>>,
    leaf_size: f64,
    leaf_size_inv: f64,
    depth_levels: Depth,
    max_value: i64,
    /// Edge length per depth, index 0 the leaf size.
    node_sizes: Vec<f64>,
    automatic_prune: bool,
}

// SAFETY: all interior pointers are owned by the tree; sending the tree
// moves the whole ownership graph with it.
unsafe impl<M, L> Send for Octree<M, L>
where
    M: AttributeMap + Send,
    L: LockPolicy,
{
}

// SAFETY: shared mutation is confined to `apply_shared`, which serializes
// structural changes through the depth flags and publishes child blocks
// with release stores before clearing leaf bits.
unsafe impl<M> Sync for Octree<M, crate::lock::DepthLock> where M: AttributeMap + Sync {}

// SAFETY: as above, with per-block flags.
unsafe impl<M> Sync for Octree<M, crate::lock::NodeLock> where M: AttributeMap + Sync {}

impl<M: AttributeMap> Octree<M, NoLock> {
    /// A single-threaded tree. `leaf_size` is the edge length of a depth-0
    /// node, `depth_levels` the number of levels including the root.
    pub fn new(map: M, leaf_size: f64, depth_levels: Depth) -> Result<Self> {
        Self::with_options(map, leaf_size, depth_levels, OctreeOptions::default())
    }
}

impl<M: AttributeMap, L: LockPolicy> Octree<M, L> {
    /// A tree with an explicit lock policy.
    pub fn with_policy(map: M, leaf_size: f64, depth_levels: Depth) -> Result<Self> {
        Self::with_options(map, leaf_size, depth_levels, OctreeOptions::default())
    }

    pub fn with_options(
        map: M,
        leaf_size: f64,
        depth_levels: Depth,
        options: OctreeOptions,
    ) -> Result<Self> {
        if !(MIN_DEPTH_LEVELS..=MAX_DEPTH_LEVELS).contains(&depth_levels) {
            return Err(Error::Config {
                min: MIN_DEPTH_LEVELS,
                max: MAX_DEPTH_LEVELS,
                got: depth_levels,
            });
        }
        let mut root = Box::new(InnerBlock::new(M::Node::default));
        // SAFETY: the root block is not shared yet.
        map.init_root(&mut unsafe { root.payload_mut() }[0]);
        Ok(Self {
            map,
            policy: L::default(),
            alloc: BlockAllocator::new(options.reuse_blocks),
            root,
            leaf_size,
            leaf_size_inv: 1.0 / leaf_size,
            depth_levels,
            max_value: 1i64 << (depth_levels - 2),
            node_sizes: (0..depth_levels)
                .map(|d| leaf_size * f64::powi(2.0, d as i32))
                .collect(),
            automatic_prune: options.automatic_prune,
        })
    }

    //
    // Configuration
    //

    #[inline]
    pub fn leaf_size(&self) -> f64 {
        self.leaf_size
    }

    #[inline]
    pub fn depth_levels(&self) -> Depth {
        self.depth_levels
    }

    #[inline]
    pub fn root_depth(&self) -> Depth {
        self.depth_levels - 1
    }

    #[inline]
    pub fn map(&self) -> &M {
        &self.map
    }

    #[inline]
    pub fn map_mut(&mut self) -> &mut M {
        &mut self.map
    }

    #[inline]
    pub fn automatic_prune(&self) -> bool {
        self.automatic_prune
    }

    pub fn set_automatic_prune(&mut self, enable: bool) {
        self.automatic_prune = enable;
    }

    /// Whether released blocks are recycled through the free-lists.
    #[inline]
    pub fn block_reuse(&self) -> bool {
        self.alloc.reuses_blocks()
    }

    /// Edge length of a node at `depth`.
    #[inline]
    pub fn node_size(&self, depth: Depth) -> f64 {
        self.node_sizes[depth as usize]
    }

    #[inline]
    pub fn node_half_size(&self, depth: Depth) -> f64 {
        self.node_size(depth) * 0.5
    }

    /// Smallest coordinate the tree can address, per axis.
    #[inline]
    pub fn min_coord(&self) -> DVec3 {
        DVec3::splat(-(self.max_value as f64) * self.leaf_size)
    }

    /// Largest coordinate the tree can address, per axis.
    #[inline]
    pub fn max_coord(&self) -> DVec3 {
        DVec3::splat(self.max_value as f64 * self.leaf_size)
    }

    #[inline]
    pub fn is_inside(&self, coord: DVec3) -> bool {
        let min = self.min_coord();
        let max = self.max_coord();
        min.x <= coord.x
            && coord.x <= max.x
            && min.y <= coord.y
            && coord.y <= max.y
            && min.z <= coord.z
            && coord.z <= max.z
    }

    //
    // Key and code conversions
    //

    /// Quantizes one coordinate component at `depth`. The coordinate must be
    /// inside the tree bounds; use [`Self::to_key_checked`] otherwise.
    #[inline]
    pub fn to_key_component(&self, coord: f64, depth: Depth) -> u32 {
        let val = (self.leaf_size_inv * coord).floor() as i64 + self.max_value;
        ((val >> depth) << depth) as u32
    }

    #[inline]
    pub fn to_key(&self, coord: DVec3, depth: Depth) -> Key {
        Key::new(
            self.to_key_component(coord.x, depth),
            self.to_key_component(coord.y, depth),
            self.to_key_component(coord.z, depth),
            depth,
        )
    }

    pub fn to_key_checked(&self, coord: DVec3, depth: Depth) -> Option<Key> {
        if depth > self.root_depth() || !self.is_inside(coord) {
            return None;
        }
        Some(self.to_key(coord, depth))
    }

    #[inline]
    pub fn to_code(&self, coord: DVec3, depth: Depth) -> Code {
        Code::from_key(self.to_key(coord, depth))
    }

    pub fn to_code_checked(&self, coord: DVec3, depth: Depth) -> Option<Code> {
        self.to_key_checked(coord, depth).map(Code::from_key)
    }

    /// Center coordinate of the node a key names.
    pub fn to_coord(&self, key: Key) -> DVec3 {
        DVec3::new(
            self.to_coord_component(key.x, key.depth),
            self.to_coord_component(key.y, key.depth),
            self.to_coord_component(key.z, key.depth),
        )
    }

    #[inline]
    pub fn to_coord_component(&self, key: u32, depth: Depth) -> f64 {
        if depth == self.depth_levels {
            return 0.0;
        }
        (((key as i64 - self.max_value) >> depth) as f64 + 0.5) * self.node_size(depth)
    }

    pub fn code_center(&self, code: Code) -> DVec3 {
        self.to_coord(code.to_key())
    }

    //
    // Resolution
    //

    /// Resolves `code` to the deepest record on its path: either the record
    /// at `code.depth()`, or the shallowest ancestor whose leaf bit is set.
    pub fn node(&self, code: Code) -> Node<'_> {
        let stop = code.depth().max(1);
        let mut block: &Inner<M, L> = &self.root;
        let mut depth = self.root_depth();
        loop {
            let i = code.index(depth) as usize;
            if block.is_leaf(i) {
                return self.make_node(code, depth, block as *const _ as *const u8);
            }
            if depth == stop {
                if code.depth() == 0 {
                    // depth == 1 and the child leaf block exists.
                    // SAFETY: leaf bit of `i` is clear at depth 1.
                    let leaf = unsafe { block.leaf_child(i) };
                    return self.make_node(code, 0, leaf as *const _ as *const u8);
                }
                return self.make_node(code, depth, block as *const _ as *const u8);
            }
            // SAFETY: leaf bit of `i` is clear and depth > 1, so the child
            // is an inner block.
            block = unsafe { block.inner_child(i) };
            depth -= 1;
        }
    }

    pub fn node_key(&self, key: Key) -> Node<'_> {
        self.node(Code::from_key(key))
    }

    pub fn node_at(&self, coord: DVec3, depth: Depth) -> Option<Node<'_>> {
        self.to_code_checked(coord, depth).map(|c| self.node(c))
    }

    /// A node exists iff its record is stored at exactly `code.depth()`.
    pub fn exists(&self, code: Code) -> bool {
        self.node(code).data_depth() == code.depth()
    }

    /// The payload of the record `code` resolves to.
    pub fn value(&self, code: Code) -> M::Node {
        self.payload_ref(self.node(code)).clone()
    }

    pub fn value_at(&self, coord: DVec3) -> Option<M::Node> {
        self.to_code_checked(coord, 0).map(|c| self.value(c))
    }

    /// The payload record behind a resolved handle.
    pub fn node_value(&self, node: Node<'_>) -> M::Node {
        self.payload_ref(node).clone()
    }

    #[inline]
    pub(crate) fn payload_ref<'t>(&'t self, node: Node<'t>) -> &'t M::Node {
        let i = node.sibling_index();
        // SAFETY: `node` borrows the tree; blocks handed out by resolution
        // stay valid while no exclusive operation runs.
        unsafe {
            if node.data_depth == 0 {
                &(*(node.raw as *const Leaf<M, L>)).payload()[i]
            } else {
                &(*(node.raw as *const Inner<M, L>)).payload()[i]
            }
        }
    }

    /// Raw payload slot pointer, for the deserializer's distribution pass.
    pub(crate) fn payload_ptr(&self, node: Node<'_>) -> *mut M::Node {
        let i = node.sibling_index();
        // SAFETY: only dereferenced by callers with exclusive tree access.
        unsafe {
            if node.data_depth == 0 {
                (*(node.raw as *const Leaf<M, L>)).payload_slot(i)
            } else {
                (*(node.raw as *const Inner<M, L>)).payload_slot(i)
            }
        }
    }

    #[inline]
    fn make_node(&self, code: Code, data_depth: Depth, raw: *const u8) -> Node<'_> {
        Node {
            code,
            data_depth,
            raw,
            _tree: PhantomData,
        }
    }

    pub fn root_node(&self) -> Node<'_> {
        self.make_node(
            Code::new(0, self.root_depth()),
            self.root_depth(),
            &*self.root as *const Inner<M, L> as *const u8,
        )
    }

    pub fn root_bv(&self) -> NodeBV<'_> {
        NodeBV::new(
            self.root_node(),
            Aabb::new(DVec3::ZERO, self.node_half_size(self.root_depth())),
        )
    }

    /// Bounding volume of a node, computed from its code.
    pub fn bounding_volume(&self, node: Node<'_>) -> Aabb {
        let depth = node.data_depth();
        Aabb::new(
            self.to_coord(node.code().to_depth(depth).to_key()),
            self.node_half_size(depth),
        )
    }

    //
    // Children access
    //

    /// Whether the record behind `node` has an allocated child block.
    pub fn has_children(&self, node: Node<'_>) -> bool {
        if node.data_depth == 0 || node.data_depth != node.code.depth() {
            return false;
        }
        let i = node.sibling_index();
        // SAFETY: data_depth > 0 means the record lives in an inner block.
        !unsafe { &*(node.raw as *const Inner<M, L>) }.is_leaf(i)
    }

    /// Child `j` of a node known to have children.
    pub(crate) fn child_node<'t>(&'t self, node: Node<'t>, j: ChildIndex) -> Node<'t> {
        let i = node.sibling_index();
        let child_code = node.code.to_depth(node.data_depth).child(j);
        // SAFETY: caller checked `has_children`, so data_depth >= 1 and the
        // child pointer of `i` is non-null.
        unsafe {
            let block = &*(node.raw as *const Inner<M, L>);
            if node.data_depth == 1 {
                let leaf = block.leaf_child(i);
                self.make_node(child_code, 0, leaf as *const _ as *const u8)
            } else {
                let inner = block.inner_child(i);
                self.make_node(child_code, node.data_depth - 1, inner as *const _ as *const u8)
            }
        }
    }

    pub(crate) fn child_bv<'t>(&'t self, parent: &NodeBV<'t>, j: ChildIndex) -> NodeBV<'t> {
        NodeBV::new(self.child_node(parent.node, j), parent.aabb.child(j))
    }

    /// Whether the record's modified flag is set in the block holding it.
    pub fn is_modified(&self, node: Node<'_>) -> bool {
        let i = node.sibling_index();
        // SAFETY: node handles point at live blocks.
        unsafe {
            if node.data_depth == 0 {
                (*(node.raw as *const Leaf<M, L>)).is_modified(i)
            } else {
                (*(node.raw as *const Inner<M, L>)).is_modified(i)
            }
        }
    }

    pub(crate) fn set_modified_flag(&self, node: Node<'_>) {
        let i = node.sibling_index();
        // SAFETY: node handles point at live blocks.
        unsafe {
            if node.data_depth == 0 {
                (*(node.raw as *const Leaf<M, L>)).set_modified_bit(i);
            } else {
                (*(node.raw as *const Inner<M, L>)).set_modified_bit(i);
            }
        }
    }

    /// Creates the child block of `node` if its leaf bit is still set.
    pub(crate) fn create_children_of(&self, node: Node<'_>) {
        debug_assert!(node.data_depth >= 1);
        debug_assert_eq!(node.data_depth, node.code.depth());
        // SAFETY: data_depth >= 1 means the record lives in an inner block.
        let block = unsafe { &*(node.raw as *const Inner<M, L>) };
        let i = node.sibling_index();
        if node.data_depth == 1 {
            self.create_leaf_children(block, i);
        } else {
            self.create_inner_children(block, node.data_depth, i);
        }
    }

    //
    // Mutation
    //

    /// Writes `value` into the depth-0 node containing `coord`.
    pub fn insert(&mut self, coord: DVec3, value: M::Node) -> Result<()> {
        let code = self
            .to_code_checked(coord, 0)
            .ok_or_else(|| Error::OutOfBounds(format!("coordinate {coord:?}")))?;
        self.insert_code(code, value)
    }

    pub fn insert_key(&mut self, key: Key, value: M::Node) -> Result<()> {
        self.insert_code(Code::from_key(key), value)
    }

    pub fn insert_code(&mut self, code: Code, value: M::Node) -> Result<()> {
        self.apply(
            code,
            |n| *n = value.clone(),
            |b| b.fill(value.clone()),
            false,
        )
    }

    /// Descends to `code`, creating blocks on demand, applies `f_leaf` to
    /// the target record (or `f_leaf`/`f_inner` across the subtree when the
    /// target already has finer structure), and marks the path modified.
    pub fn apply(
        &mut self,
        code: Code,
        mut f_leaf: impl FnMut(&mut M::Node),
        mut f_inner: impl FnMut(&mut [M::Node; 8]),
        propagate: bool,
    ) -> Result<()> {
        self.check_code(code)?;
        self.apply_recurs(&self.root, self.root_depth(), code, &mut f_leaf, &mut f_inner);
        if propagate {
            self.propagate_modified(false, MAX_DEPTH);
        }
        Ok(())
    }

    /// Like [`Self::apply`] but through a shared reference, for concurrent
    /// insertion under a locking policy. Does not propagate.
    pub fn apply_shared(
        &self,
        code: Code,
        mut f_leaf: impl FnMut(&mut M::Node),
        mut f_inner: impl FnMut(&mut [M::Node; 8]),
    ) -> Result<()>
    where
        L: ConcurrentPolicy,
    {
        self.check_code(code)?;
        self.apply_recurs(&self.root, self.root_depth(), code, &mut f_leaf, &mut f_inner);
        Ok(())
    }

    fn check_code(&self, code: Code) -> Result<()> {
        if code.depth() > self.root_depth() {
            return Err(Error::OutOfBounds(format!(
                "code depth {} exceeds root depth {}",
                code.depth(),
                self.root_depth()
            )));
        }
        Ok(())
    }

    fn apply_recurs(
        &self,
        block: &Inner<M, L>,
        depth: Depth,
        code: Code,
        f_leaf: &mut impl FnMut(&mut M::Node),
        f_inner: &mut impl FnMut(&mut [M::Node; 8]),
    ) {
        let i = code.index(depth) as usize;
        if code.depth() == depth {
            if block.is_leaf(i) {
                // SAFETY: payload writes on the descent path are serialized
                // by the caller per the lock policy contract; disjoint slots
                // never overlap.
                f_leaf(unsafe { &mut *block.payload_slot(i) });
            } else if depth == 1 {
                // SAFETY: leaf bit clear at depth 1.
                let leaf = unsafe { block.leaf_child(i) };
                // SAFETY: as above.
                f_inner(unsafe { leaf.payload_mut() });
                leaf.set_modified_all();
            } else {
                // SAFETY: leaf bit clear and depth > 1.
                let child = unsafe { block.inner_child(i) };
                self.apply_all(child, depth - 1, f_leaf, f_inner);
            }
        } else if depth == 1 {
            self.create_leaf_children(block, i);
            // SAFETY: the create call above guarantees the leaf block.
            let leaf = unsafe { block.leaf_child(i) };
            let j = code.index(0) as usize;
            // SAFETY: payload writes serialized by the caller.
            f_leaf(unsafe { &mut *leaf.payload_slot(j) });
            leaf.set_modified_bit(j);
        } else {
            self.create_inner_children(block, depth, i);
            // SAFETY: the create call above guarantees the inner block.
            let child = unsafe { block.inner_child(i) };
            self.apply_recurs(child, depth - 1, code, f_leaf, f_inner);
        }
        block.set_modified_bit(i);
    }

    /// Applies the closures across every record of a subtree: `f_inner` once
    /// per fully-leaf block, `f_leaf` per leaf sibling of mixed blocks.
    fn apply_all(
        &self,
        block: &Inner<M, L>,
        depth: Depth,
        f_leaf: &mut impl FnMut(&mut M::Node),
        f_inner: &mut impl FnMut(&mut [M::Node; 8]),
    ) {
        let leaf = block.leaf_field();
        if leaf.all() {
            // SAFETY: payload writes serialized by the caller.
            f_inner(unsafe { block.payload_mut() });
            block.set_modified_all();
            return;
        }
        for j in 0..8 {
            if leaf.get(j) {
                // SAFETY: as above.
                f_leaf(unsafe { &mut *block.payload_slot(j) });
            } else if depth == 1 {
                // SAFETY: leaf bit of `j` is clear at depth 1.
                let lb = unsafe { block.leaf_child(j) };
                // SAFETY: as above.
                f_inner(unsafe { lb.payload_mut() });
                lb.set_modified_all();
            } else {
                // SAFETY: leaf bit of `j` is clear and depth > 1.
                self.apply_all(unsafe { block.inner_child(j) }, depth - 1, f_leaf, f_inner);
            }
            block.set_modified_bit(j);
        }
    }

    //
    // Create children
    //

    fn create_inner_children(&self, block: &Inner<M, L>, depth: Depth, i: usize) {
        if !self
            .policy
            .lock_if_leaf(depth, &block.lock, || block.is_leaf(i))
        {
            return;
        }
        // SAFETY: we hold the create lock for this node; slot `i` is only
        // read for the broadcast value.
        let fill_src = unsafe { &block.payload()[i] };
        let child = self
            .alloc
            .allocate_inner(&self.policy, || self.map.fill(fill_src));
        block.set_child_ptr(i, child.as_ptr() as *mut u8);
        block.clear_leaf_bit(i);
        NodeCounts::add(&self.alloc.counts.num_inner_leaf, 7);
        NodeCounts::add(&self.alloc.counts.num_inner, 1);
        self.policy.unlock_children(depth, &block.lock);
    }

    fn create_leaf_children(&self, block: &Inner<M, L>, i: usize) {
        if !self
            .policy
            .lock_if_leaf(1, &block.lock, || block.is_leaf(i))
        {
            return;
        }
        // SAFETY: we hold the create lock for this node.
        let fill_src = unsafe { &block.payload()[i] };
        let child = self
            .alloc
            .allocate_leaf(&self.policy, || self.map.fill(fill_src));
        block.set_child_ptr(i, child.as_ptr() as *mut u8);
        block.clear_leaf_bit(i);
        NodeCounts::add(&self.alloc.counts.num_leaf, 8);
        NodeCounts::sub(&self.alloc.counts.num_inner_leaf, 1);
        NodeCounts::add(&self.alloc.counts.num_inner, 1);
        self.policy.unlock_children(1, &block.lock);
    }

    //
    // Propagation
    //

    /// Walks the modified frontier bottom-up, aggregating children into
    /// parents through every attribute map and pruning collapsible groups.
    /// Clears modified bits afterwards unless `keep_modified`; nodes above
    /// `max_depth` are left untouched.
    pub fn propagate_modified(&mut self, keep_modified: bool, max_depth: Depth) {
        self.propagate_recurs(&self.root, self.root_depth(), keep_modified, max_depth);
    }

    fn propagate_recurs(&self, block: &Inner<M, L>, depth: Depth, keep: bool, max_depth: Depth) {
        let modified = block.modified_field();
        for i in modified.iter_set() {
            if !block.is_leaf(i) {
                if depth == 1 {
                    // SAFETY: leaf bit clear at depth 1.
                    let lb = unsafe { block.leaf_child(i) };
                    if !keep {
                        lb.clear_modified_all();
                    }
                } else {
                    // SAFETY: leaf bit clear, depth > 1.
                    self.propagate_recurs(
                        unsafe { block.inner_child(i) },
                        depth - 1,
                        keep,
                        max_depth,
                    );
                }
                if depth <= max_depth {
                    self.update_and_prune(block, depth, i);
                }
            }
            if depth <= max_depth && !keep {
                block.clear_modified_bit(i);
            }
        }
    }

    /// Aggregates the children of sibling `i` into its slot, then prunes the
    /// child block when every map reports the group collapsible.
    fn update_and_prune(&self, block: &Inner<M, L>, depth: Depth, i: usize) {
        // SAFETY: propagation runs under exclusive tree access; parent and
        // child payloads live in distinct blocks.
        unsafe {
            let (children_are_leaves, collapsible) = if depth == 1 {
                let lb = block.leaf_child(i);
                let children = lb.payload();
                let refs: [&M::Node; 8] = std::array::from_fn(|k| &children[k]);
                let parent = &mut *block.payload_slot(i);
                self.map.update_node(parent, refs);
                (true, self.map.is_collapsible(parent, refs))
            } else {
                let cb = block.inner_child(i);
                let children = cb.payload();
                let refs: [&M::Node; 8] = std::array::from_fn(|k| &children[k]);
                let parent = &mut *block.payload_slot(i);
                self.map.update_node(parent, refs);
                (cb.leaf_field().all(), self.map.is_collapsible(parent, refs))
            };
            if children_are_leaves && collapsible && self.automatic_prune {
                self.delete_children_of(block, depth, i, false);
            }
        }
    }

    //
    // Delete children
    //

    /// Detaches and releases the subtree below sibling `i`. `destroy` forces
    /// deallocation instead of free-listing.
    fn delete_children_of(&self, block: &Inner<M, L>, depth: Depth, i: usize, destroy: bool) {
        if block.is_leaf(i) {
            return;
        }
        block.set_leaf_bit(i);
        if depth == 1 {
            let ptr = block.take_child_ptr(i) as *mut Leaf<M, L>;
            NodeCounts::sub(&self.alloc.counts.num_leaf, 8);
            NodeCounts::add(&self.alloc.counts.num_inner_leaf, 1);
            NodeCounts::sub(&self.alloc.counts.num_inner, 1);
            // SAFETY: the leaf bit was clear, so the pointer is non-null; it
            // is detached from the tree now.
            self.alloc
                .release_leaf(&self.policy, unsafe { NonNull::new_unchecked(ptr) }, destroy);
        } else {
            let ptr = block.take_child_ptr(i) as *mut Inner<M, L>;
            // SAFETY: the leaf bit was clear, so the pointer is non-null.
            let child = unsafe { &*ptr };
            for j in 0..8 {
                self.delete_children_of(child, depth - 1, j, destroy);
            }
            NodeCounts::sub(&self.alloc.counts.num_inner_leaf, 7);
            NodeCounts::sub(&self.alloc.counts.num_inner, 1);
            // SAFETY: detached and childless after the loop above.
            self.alloc
                .release_inner(&self.policy, unsafe { NonNull::new_unchecked(ptr) }, destroy);
        }
    }

    //
    // Modified marking
    //

    /// Marks every node at depth >= `min_depth` modified, so the next
    /// propagation or modified-frontier write covers the whole tree.
    pub fn set_modified(&mut self, min_depth: Depth) {
        self.set_modified_recurs(&self.root, self.root_depth(), min_depth);
    }

    fn set_modified_recurs(&self, block: &Inner<M, L>, depth: Depth, min_depth: Depth) {
        if depth < min_depth {
            return;
        }
        block.set_modified_all();
        if depth == min_depth {
            return;
        }
        let leaf = block.leaf_field();
        for i in 0..8 {
            if leaf.get(i) {
                continue;
            }
            if depth == 1 {
                if min_depth == 0 {
                    // SAFETY: leaf bit clear at depth 1.
                    unsafe { block.leaf_child(i) }.set_modified_all();
                }
            } else {
                // SAFETY: leaf bit clear, depth > 1.
                self.set_modified_recurs(unsafe { block.inner_child(i) }, depth - 1, min_depth);
            }
        }
    }

    /// Clears modified flags on every node at depth <= `max_depth` without
    /// propagating.
    pub fn clear_modified(&mut self, max_depth: Depth) {
        self.clear_modified_recurs(&self.root, self.root_depth(), max_depth);
    }

    fn clear_modified_recurs(&self, block: &Inner<M, L>, depth: Depth, max_depth: Depth) {
        let modified = block.modified_field();
        if modified.none() {
            return;
        }
        let leaf = block.leaf_field();
        for i in modified.iter_set() {
            if leaf.get(i) {
                continue;
            }
            if depth == 1 {
                // SAFETY: leaf bit clear at depth 1.
                unsafe { block.leaf_child(i) }.clear_modified_all();
            } else {
                // SAFETY: leaf bit clear, depth > 1.
                self.clear_modified_recurs(unsafe { block.inner_child(i) }, depth - 1, max_depth);
            }
        }
        if depth <= max_depth {
            block.clear_modified_all();
        }
    }

    //
    // Prune
    //

    /// Top-down sweep collapsing every subtree whose payloads all maps agree
    /// are uniform, regardless of modified flags.
    pub fn prune(&mut self) {
        self.prune_record(&self.root, self.root_depth(), 0);
    }

    /// Returns whether record `i` is (or became) a leaf.
    fn prune_record(&self, block: &Inner<M, L>, depth: Depth, i: usize) -> bool {
        if block.is_leaf(i) {
            return true;
        }
        let children_prunable = if depth == 1 {
            true
        } else {
            // SAFETY: leaf bit clear, depth > 1.
            let child = unsafe { block.inner_child(i) };
            (0..8).all(|j| self.prune_record(child, depth - 1, j))
        };
        if !children_prunable {
            return false;
        }
        // SAFETY: exclusive access (the public entry takes &mut self).
        let collapsible = unsafe {
            let refs: [&M::Node; 8] = if depth == 1 {
                let children = block.leaf_child(i).payload();
                std::array::from_fn(|k| &children[k])
            } else {
                let children = block.inner_child(i).payload();
                std::array::from_fn(|k| &children[k])
            };
            self.map.is_collapsible(&block.payload()[i], refs)
        };
        if collapsible {
            self.delete_children_of(block, depth, i, false);
        }
        collapsible
    }

    //
    // Clear
    //

    /// Erases everything, leaving just the root. `prune` deallocates blocks
    /// instead of free-listing them.
    pub fn clear(&mut self, prune: bool) {
        self.delete_children_of(&self.root, self.root_depth(), 0, prune);
        let root = &mut *self.root;
        root.reset(M::Node::default);
        // SAFETY: exclusive access.
        self.map.init_root(&mut unsafe { root.payload_mut() }[0]);
    }

    /// Erases the tree and changes its geometry.
    pub fn clear_and_resize(
        &mut self,
        leaf_size: f64,
        depth_levels: Depth,
        prune: bool,
    ) -> Result<()> {
        if !(MIN_DEPTH_LEVELS..=MAX_DEPTH_LEVELS).contains(&depth_levels) {
            return Err(Error::Config {
                min: MIN_DEPTH_LEVELS,
                max: MAX_DEPTH_LEVELS,
                got: depth_levels,
            });
        }
        self.clear(prune);
        self.leaf_size = leaf_size;
        self.leaf_size_inv = 1.0 / leaf_size;
        self.depth_levels = depth_levels;
        self.max_value = 1i64 << (depth_levels - 2);
        self.node_sizes = (0..depth_levels)
            .map(|d| leaf_size * f64::powi(2.0, d as i32))
            .collect();
        Ok(())
    }

    //
    // Traversal
    //

    /// Depth-first visit. Returning `true` from the visitor skips the
    /// subtree below that node.
    pub fn traverse(&self, mut f: impl FnMut(&NodeBV<'_>) -> bool) {
        let mut stack: SmallVec<[NodeBV<'_>; 32]> = SmallVec::new();
        stack.push(self.root_bv());
        while let Some(nv) = stack.pop() {
            let stop = f(&nv);
            if stop || !self.has_children(nv.node) {
                continue;
            }
            for j in 0..8 {
                stack.push(self.child_bv(&nv, j));
            }
        }
    }

    //
    // Counters and memory
    //

    /// Number of inner records (parents and inner leaves).
    pub fn num_inner_nodes(&self) -> usize {
        NodeCounts::get(&self.alloc.counts.num_inner)
            + NodeCounts::get(&self.alloc.counts.num_inner_leaf)
    }

    /// Number of depth-0 records.
    pub fn num_leaf_nodes(&self) -> usize {
        NodeCounts::get(&self.alloc.counts.num_leaf)
    }

    pub fn num_nodes(&self) -> usize {
        self.num_inner_nodes() + self.num_leaf_nodes()
    }

    pub fn num_allocated_inner_nodes(&self) -> usize {
        NodeCounts::get(&self.alloc.counts.alloc_inner)
            + NodeCounts::get(&self.alloc.counts.alloc_inner_leaf)
    }

    pub fn num_allocated_leaf_nodes(&self) -> usize {
        NodeCounts::get(&self.alloc.counts.alloc_leaf)
    }

    /// Lower-bound memory footprint of the allocated blocks.
    pub fn memory_usage(&self) -> usize {
        let inner_blocks =
            (self.num_allocated_inner_nodes() + 7) / 8 * std::mem::size_of::<Inner<M, L>>();
        let leaf_blocks = self.num_allocated_leaf_nodes() / 8 * std::mem::size_of::<Leaf<M, L>>();
        inner_blocks + leaf_blocks
    }

    #[cfg(test)]
    pub(crate) fn count_modified_nodes(&self) -> usize {
        fn walk<M: AttributeMap, L: LockPolicy>(block: &Inner<M, L>, depth: Depth) -> usize {
            let mut n = block.modified_field().count() as usize;
            let leaf = block.leaf_field();
            for i in 0..8 {
                if leaf.get(i) {
                    continue;
                }
                if depth == 1 {
                    // SAFETY: leaf bit clear at depth 1.
                    n += unsafe { block.leaf_child(i) }.modified_field().count() as usize;
                } else {
                    // SAFETY: leaf bit clear, depth > 1.
                    n += walk::<M, L>(unsafe { block.inner_child(i) }, depth - 1);
                }
            }
            n
        }
        walk::<M, L>(&self.root, self.root_depth())
    }
}

impl<M: AttributeMap, L: LockPolicy> Drop for Octree<M, L> {
    fn drop(&mut self) {
        self.delete_children_of(&self.root, self.root_depth(), 0, true);
    }
}
