//! Query iterators over the tree.
//!
//! [`Query`] walks depth-first under a predicate, yielding every node whose
//! `value_check` passes and descending wherever `inner_check` passes.
//! [`NearestQuery`] expands nodes best-first by a lower bound on their
//! squared distance to a query geometry, yielding matches in (epsilon-
//! approximate) distance order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use smallvec::SmallVec;

use crate::geometry::Geometry;
use crate::lock::LockPolicy;
use crate::map::AttributeMap;
use crate::predicate::Predicate;
use crate::tree::{NodeBV, Octree};

/// Depth-first predicate query. Created by [`Octree::query`].
pub struct Query<'t, M: AttributeMap, L: LockPolicy, P> {
    tree: &'t Octree<M, L>,
    predicate: P,
    stack: SmallVec<[NodeBV<'t>; 32]>,
    early_stopping: bool,
    stopped: bool,
}

impl<'t, M: AttributeMap, L: LockPolicy, P: Predicate<M, L>> Query<'t, M, L, P> {
    pub(crate) fn new(tree: &'t Octree<M, L>, predicate: P) -> Self {
        let mut stack = SmallVec::new();
        stack.push(tree.root_bv());
        Self {
            tree,
            predicate,
            stack,
            early_stopping: false,
            stopped: false,
        }
    }

    /// When set, a failed `inner_check` ends the whole iteration instead of
    /// skipping one subtree.
    pub fn early_stopping(mut self, enable: bool) -> Self {
        self.early_stopping = enable;
        self
    }
}

impl<'t, M: AttributeMap, L: LockPolicy, P: Predicate<M, L>> Iterator for Query<'t, M, L, P> {
    type Item = NodeBV<'t>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped {
            return None;
        }
        while let Some(nv) = self.stack.pop() {
            if self.predicate.inner_check(self.tree, &nv) {
                if self.tree.has_children(nv.node()) {
                    for j in 0..8 {
                        self.stack.push(self.tree.child_bv(&nv, j));
                    }
                }
            } else if self.early_stopping {
                self.stopped = true;
                if self.predicate.value_check(self.tree, &nv) {
                    return Some(nv);
                }
                return None;
            }
            if self.predicate.value_check(self.tree, &nv) {
                return Some(nv);
            }
        }
        None
    }
}

struct Candidate<'t> {
    dist_sq: f64,
    node: NodeBV<'t>,
}

impl PartialEq for Candidate<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.dist_sq == other.dist_sq
    }
}

impl Eq for Candidate<'_> {}

// Reversed, so the BinaryHeap pops the smallest distance first.
impl Ord for Candidate<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.dist_sq.total_cmp(&self.dist_sq)
    }
}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Best-first nearest query. Created by [`Octree::query_nearest`]. Yields
/// `(node, squared_distance)` in ascending distance order; with a nonzero
/// epsilon, inner bounds are inflated by it, so any yielded node is within
/// epsilon (in squared distance) of the true next-nearest.
pub struct NearestQuery<'t, M: AttributeMap, L: LockPolicy, P, G> {
    tree: &'t Octree<M, L>,
    predicate: P,
    geometry: G,
    epsilon_sq: f64,
    inner: BinaryHeap<Candidate<'t>>,
    found: BinaryHeap<Candidate<'t>>,
}

impl<'t, M, L, P, G> NearestQuery<'t, M, L, P, G>
where
    M: AttributeMap,
    L: LockPolicy,
    P: Predicate<M, L>,
    G: Geometry,
{
    pub(crate) fn new(tree: &'t Octree<M, L>, geometry: G, predicate: P, epsilon: f64) -> Self {
        let mut query = Self {
            tree,
            predicate,
            geometry,
            epsilon_sq: epsilon * epsilon,
            inner: BinaryHeap::new(),
            found: BinaryHeap::new(),
        };
        let root = tree.root_bv();
        query.offer(root);
        query
    }

    fn offer(&mut self, nv: NodeBV<'t>) {
        let dist_sq = self.geometry.distance_sq(&nv.aabb());
        if self.predicate.value_check(self.tree, &nv) {
            self.found.push(Candidate { dist_sq, node: nv });
        }
        if self.predicate.inner_check(self.tree, &nv) && self.tree.has_children(nv.node()) {
            self.inner.push(Candidate {
                dist_sq: dist_sq + self.epsilon_sq,
                node: nv,
            });
        }
    }
}

impl<'t, M, L, P, G> Iterator for NearestQuery<'t, M, L, P, G>
where
    M: AttributeMap,
    L: LockPolicy,
    P: Predicate<M, L>,
    G: Geometry,
{
    type Item = (NodeBV<'t>, f64);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let found_dist = self.found.peek().map(|c| c.dist_sq);
            let inner_dist = self.inner.peek().map(|c| c.dist_sq);
            match (found_dist, inner_dist) {
                (Some(f), Some(i)) if f <= i => {
                    let c = self.found.pop().expect("peeked");
                    return Some((c.node, c.dist_sq));
                }
                (Some(_), None) => {
                    let c = self.found.pop().expect("peeked");
                    return Some((c.node, c.dist_sq));
                }
                (_, Some(_)) => {
                    let expand = self.inner.pop().expect("peeked");
                    for j in 0..8 {
                        let child = self.tree.child_bv(&expand.node, j);
                        self.offer(child);
                    }
                }
                (None, None) => return None,
            }
        }
    }
}

impl<M: AttributeMap, L: LockPolicy> Octree<M, L> {
    /// Iterates over nodes matching `predicate`, depth-first.
    pub fn query<P: Predicate<M, L>>(&self, predicate: P) -> Query<'_, M, L, P> {
        Query::new(self, predicate)
    }

    /// The first `k` matches, in traversal order.
    pub fn query_k<P: Predicate<M, L>>(&self, k: usize, predicate: P) -> Vec<NodeBV<'_>> {
        self.query(predicate).take(k).collect()
    }

    /// Matches ordered by distance to `geometry`; see [`NearestQuery`].
    pub fn query_nearest<G: Geometry, P: Predicate<M, L>>(
        &self,
        geometry: G,
        predicate: P,
        epsilon: f64,
    ) -> NearestQuery<'_, M, L, P, G> {
        NearestQuery::new(self, geometry, predicate, epsilon)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::code::MAX_DEPTH;
    use crate::geometry::Sphere;
    use crate::occupancy::OccupancyMap;
    use crate::predicate::{And, Intersects, Leaf, Occupied, True};
    use glam::DVec3;

    fn occupied_tree(points: &[DVec3]) -> Octree<OccupancyMap> {
        let mut t = Octree::new(OccupancyMap::default(), 0.1, 16).unwrap();
        for p in points {
            t.set_occupancy_logit(*p, 0.85, false).unwrap();
        }
        t.propagate_modified(false, MAX_DEPTH);
        t
    }

    #[test]
    fn query_finds_occupied_leaves() {
        let points = [
            DVec3::new(0.05, 0.05, 0.05),
            DVec3::new(1.05, 0.05, 0.05),
            DVec3::new(-2.05, 3.05, 0.05),
        ];
        let t = occupied_tree(&points);
        let found: Vec<_> = t.query(And(Leaf::at(0), Occupied)).collect();
        assert_eq!(found.len(), points.len());
        for nv in &found {
            assert_eq!(nv.data_depth(), 0);
        }
    }

    #[test]
    fn query_k_truncates() {
        let points = [
            DVec3::new(0.05, 0.05, 0.05),
            DVec3::new(1.05, 0.05, 0.05),
            DVec3::new(2.05, 0.05, 0.05),
        ];
        let t = occupied_tree(&points);
        assert_eq!(t.query_k(2, And(Leaf::at(0), Occupied)).len(), 2);
    }

    #[test]
    fn radius_query_restricts_spatially() {
        let near = DVec3::new(0.05, 0.05, 0.05);
        let far = DVec3::new(30.05, 0.05, 0.05);
        let t = occupied_tree(&[near, far]);
        let ball = Sphere::new(DVec3::ZERO, 1.0);
        let found: Vec<_> = t
            .query(And(Leaf::at(0), And(Occupied, Intersects(ball))))
            .collect();
        assert_eq!(found.len(), 1);
        assert!(found[0].aabb().contains(near));
    }

    #[test]
    fn nearest_orders_by_distance() {
        let points = [
            DVec3::new(5.05, 0.05, 0.05),
            DVec3::new(1.05, 1.05, 1.05),
            DVec3::new(-8.05, 0.05, 0.05),
        ];
        let t = occupied_tree(&points);
        let query_point = DVec3::new(1.0, 1.0, 1.0);
        let hits: Vec<_> = t
            .query_nearest(query_point, And(Leaf::at(0), Occupied), 0.0)
            .collect();
        assert_eq!(hits.len(), points.len());
        // Distances are non-decreasing and the first hit is the true
        // nearest.
        for w in hits.windows(2) {
            assert!(w[0].1 <= w[1].1);
        }
        assert!(hits[0].0.aabb().contains(points[1]));
    }

    #[test]
    fn nearest_with_epsilon_stays_within_bound() {
        let points = [DVec3::new(2.05, 0.05, 0.05), DVec3::new(2.35, 0.05, 0.05)];
        let t = occupied_tree(&points);
        let hits: Vec<_> = t
            .query_nearest(DVec3::new(1.0, 1.0, 1.0), And(Leaf::at(0), Occupied), 0.5)
            .collect();
        assert_eq!(hits.len(), 2);
        let exact: Vec<_> = t
            .query_nearest(DVec3::new(1.0, 1.0, 1.0), And(Leaf::at(0), Occupied), 0.0)
            .collect();
        // The approximate first hit is within the epsilon bound of the true
        // nearest distance.
        assert!(hits[0].1 <= exact[0].1 + 0.5 * 0.5 + 1e-9);
    }

    #[test]
    fn query_true_visits_every_node() {
        let t = occupied_tree(&[DVec3::new(0.05, 0.05, 0.05)]);
        let all: Vec<_> = t.query(True).collect();
        assert_eq!(all.len(), t.num_nodes());
    }

    /// Matches every node but refuses to descend below `floor`.
    struct Above {
        floor: u8,
    }

    impl<M: AttributeMap, L: LockPolicy> Predicate<M, L> for Above {
        fn value_check(&self, _tree: &Octree<M, L>, _node: &NodeBV<'_>) -> bool {
            true
        }

        fn inner_check(&self, _tree: &Octree<M, L>, node: &NodeBV<'_>) -> bool {
            node.depth() > self.floor
        }
    }

    #[test]
    fn early_stopping_ends_iteration() {
        let t = occupied_tree(&[DVec3::new(0.05, 0.05, 0.05)]);
        let floor = t.root_depth() - 2;
        let full = t.query(Above { floor }).count();
        let early = t.query(Above { floor }).early_stopping(true).count();
        // The plain query visits every subtree down to the floor; the
        // early-stopping one ends at the first node that fails the inner
        // check.
        assert!(early >= 1);
        assert!(early < full);
    }
}
