//! Query predicates.
//!
//! A predicate answers two questions about a node: does the node itself
//! match (`value_check`), and could anything in its subtree match
//! (`inner_check`). Traversal descends where `inner_check` holds and emits
//! where `value_check` holds. Predicates compose with [`And`] and [`Or`].

use crate::geometry::Geometry;
use crate::lock::LockPolicy;
use crate::map::AttributeMap;
use crate::occupancy::{AsOccupancy, HasOccupancyMap};
use crate::tree::{NodeBV, Octree};
use crate::Depth;

pub trait Predicate<M: AttributeMap, L: LockPolicy> {
    /// Whether this node matches.
    fn value_check(&self, tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool;

    /// Whether descending into this node's subtree might match.
    fn inner_check(&self, tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool;
}

/// Matches everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct True;

impl<M: AttributeMap, L: LockPolicy> Predicate<M, L> for True {
    fn value_check(&self, _tree: &Octree<M, L>, _node: &NodeBV<'_>) -> bool {
        true
    }

    fn inner_check(&self, _tree: &Octree<M, L>, _node: &NodeBV<'_>) -> bool {
        true
    }
}

/// Both predicates must hold.
#[derive(Clone, Copy, Debug)]
pub struct And<P, Q>(pub P, pub Q);

impl<M: AttributeMap, L: LockPolicy, P, Q> Predicate<M, L> for And<P, Q>
where
    P: Predicate<M, L>,
    Q: Predicate<M, L>,
{
    fn value_check(&self, tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool {
        self.0.value_check(tree, node) && self.1.value_check(tree, node)
    }

    fn inner_check(&self, tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool {
        self.0.inner_check(tree, node) && self.1.inner_check(tree, node)
    }
}

/// Either predicate may hold.
#[derive(Clone, Copy, Debug)]
pub struct Or<P, Q>(pub P, pub Q);

impl<M: AttributeMap, L: LockPolicy, P, Q> Predicate<M, L> for Or<P, Q>
where
    P: Predicate<M, L>,
    Q: Predicate<M, L>,
{
    fn value_check(&self, tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool {
        self.0.value_check(tree, node) || self.1.value_check(tree, node)
    }

    fn inner_check(&self, tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool {
        self.0.inner_check(tree, node) || self.1.inner_check(tree, node)
    }
}

/// Matches leaves, treating nodes at `min_depth` as leaves. This is the
/// predicate the serializer conjoins to bound output resolution.
#[derive(Clone, Copy, Debug, Default)]
pub struct Leaf {
    pub min_depth: Depth,
}

impl Leaf {
    pub const fn at(min_depth: Depth) -> Self {
        Self { min_depth }
    }
}

impl<M: AttributeMap, L: LockPolicy> Predicate<M, L> for Leaf {
    fn value_check(&self, tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool {
        node.depth() == self.min_depth || !tree.has_children(node.node())
    }

    fn inner_check(&self, tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool {
        node.depth() > self.min_depth && tree.has_children(node.node())
    }
}

/// Matches nodes whose modified flag is set. Ancestor flags cover their
/// subtrees, so the same test gates descent.
#[derive(Clone, Copy, Debug, Default)]
pub struct Modified;

impl<M: AttributeMap, L: LockPolicy> Predicate<M, L> for Modified {
    fn value_check(&self, tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool {
        tree.is_modified(node.node())
    }

    fn inner_check(&self, tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool {
        tree.is_modified(node.node())
    }
}

/// Matches nodes whose bounding volume touches `G`.
#[derive(Clone, Copy, Debug)]
pub struct Intersects<G>(pub G);

impl<M: AttributeMap, L: LockPolicy, G: Geometry> Predicate<M, L> for Intersects<G> {
    fn value_check(&self, _tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool {
        self.0.intersects(&node.aabb())
    }

    fn inner_check(&self, _tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool {
        self.0.intersects(&node.aabb())
    }
}

/// Matches occupied nodes. With max propagation an unoccupied parent has no
/// occupied descendants, so the same test gates descent.
#[derive(Clone, Copy, Debug, Default)]
pub struct Occupied;

impl<M, L> Predicate<M, L> for Occupied
where
    M: HasOccupancyMap,
    M::Node: AsOccupancy,
    L: LockPolicy,
{
    fn value_check(&self, tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool {
        let occ = tree.payload_ref(node.node()).occupancy();
        tree.map().occupancy_map().is_occupied(occ)
    }

    fn inner_check(&self, tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool {
        self.value_check(tree, node)
    }
}

/// Matches free nodes. A mixed subtree can hide free space under an
/// occupied aggregate, so descent is never pruned.
#[derive(Clone, Copy, Debug, Default)]
pub struct Free;

impl<M, L> Predicate<M, L> for Free
where
    M: HasOccupancyMap,
    M::Node: AsOccupancy,
    L: LockPolicy,
{
    fn value_check(&self, tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool {
        let occ = tree.payload_ref(node.node()).occupancy();
        tree.map().occupancy_map().is_free(occ)
    }

    fn inner_check(&self, _tree: &Octree<M, L>, _node: &NodeBV<'_>) -> bool {
        true
    }
}

/// Matches unknown nodes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unknown;

impl<M, L> Predicate<M, L> for Unknown
where
    M: HasOccupancyMap,
    M::Node: AsOccupancy,
    L: LockPolicy,
{
    fn value_check(&self, tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool {
        let occ = tree.payload_ref(node.node()).occupancy();
        tree.map().occupancy_map().is_unknown(occ)
    }

    fn inner_check(&self, _tree: &Octree<M, L>, _node: &NodeBV<'_>) -> bool {
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::occupancy::OccupancyMap;
    use glam::DVec3;

    #[test]
    fn and_or_compose() {
        let mut t = crate::tree::Octree::new(OccupancyMap::default(), 0.1, 8).unwrap();
        t.set_occupancy_logit(DVec3::new(0.05, 0.05, 0.05), 0.85, true)
            .unwrap();
        let root = t.root_bv();
        assert!(And(True, Occupied).value_check(&t, &root));
        assert!(Or(Free, Occupied).value_check(&t, &root));
        assert!(!And(Free, Occupied).value_check(&t, &root));
    }

    #[test]
    fn leaf_predicate_bounds_depth() {
        let mut t = crate::tree::Octree::new(OccupancyMap::default(), 0.1, 8).unwrap();
        t.set_occupancy_logit(DVec3::new(0.05, 0.05, 0.05), 0.85, false)
            .unwrap();
        let root = t.root_bv();
        let leaf0 = Leaf::at(0);
        assert!(<Leaf as Predicate<_, _>>::inner_check(&leaf0, &t, &root));
        let leaf_root = Leaf::at(t.root_depth());
        assert!(<Leaf as Predicate<_, _>>::value_check(&leaf_root, &t, &root));
        assert!(!<Leaf as Predicate<_, _>>::inner_check(&leaf_root, &t, &root));
    }
}
