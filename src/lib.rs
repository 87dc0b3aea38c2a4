//! Probabilistic 3D occupancy maps on a block-octree.
//!
//! Space is represented explicitly as occupied, free, and unknown in a
//! depth-balanced octree whose nodes are grouped into sibling blocks of
//! eight. The engine ([`Octree`]) handles node addressing via Morton
//! [`Code`]s, block storage with free-list reuse, create-on-demand mutation
//! under a configurable [lock policy](crate::lock), bottom-up propagation
//! of aggregates with pruning of uniform subtrees, predicate-driven
//! traversal, and compact binary persistence with optional LZ4 compression.
//!
//! Payloads are pluggable [`AttributeMap`]s sharing the block layout:
//! clamped log-odds [occupancy](crate::occupancy), [color](crate::color),
//! [time step](crate::time), [semantic label sets](crate::semantics), and
//! [surfels](crate::surfel). Maps compose as tuples, dispatched in order on
//! every block lifecycle event.
//!
//! ```
//! use block_octree::{OccupancyTree, OccupancyMap};
//! use glam::DVec3;
//!
//! let mut map = OccupancyTree::new(OccupancyMap::default(), 0.1, 16)?;
//! map.set_occupancy_logit(DVec3::new(0.05, 0.05, 0.05), 0.85, true)?;
//! assert!(map.is_occupied(map.to_code(DVec3::new(0.05, 0.05, 0.05), 0)));
//! # Ok::<(), block_octree::Error>(())
//! ```
//!
//! # Design notes
//!
//! - Depth 0 is the finest level; depth increases toward the root.
//! - A sibling group collapses when every attribute map reports its eight
//!   children uniform with the parent, returning the block to the engine.
//! - Under the [`DepthLock`](lock::DepthLock) and
//!   [`NodeLock`](lock::NodeLock) policies the tree is `Sync` and
//!   [`Octree::apply_shared`] may run from several threads; queries
//!   concurrent with mutation are the caller's to serialize.

mod allocator;
mod block;
pub mod code;
pub mod color;
mod error;
pub mod geometry;
mod index_field;
pub mod io;
mod iter;
pub mod lock;
mod map;
pub mod occupancy;
pub mod predicate;
pub mod semantics;
pub mod surfel;
pub mod time;
mod tree;

pub use code::{Code, CodeMap, CodeSet, Key, MAX_DEPTH};
pub use color::{ColorMap, Rgb};
pub use error::{Error, Result};
pub use geometry::{Aabb, Geometry, Sphere};
pub use index_field::IndexField;
pub use io::FileHeader;
pub use iter::{NearestQuery, Query};
pub use lock::{DepthLock, LockPolicy, NoLock, NodeLock};
pub use map::AttributeMap;
pub use occupancy::{Occupancy, OccupancyMap, OccupancyState, PropagationCriteria};
pub use semantics::{SemanticLabel, SemanticMap, Semantics};
pub use surfel::{Surfel, SurfelMap};
pub use time::{TimeMap, TimeStep};
pub use tree::{
    Node, NodeBV, Octree, OctreeOptions, MAX_DEPTH_LEVELS, MIN_DEPTH_LEVELS,
};

/// Depth of a node; 0 is the finest level.
pub type Depth = u8;

/// A linear index of a node relative to its sibling block.
pub type ChildIndex = u8;

/// Occupancy-only map.
pub type OccupancyTree<L = NoLock> = Octree<OccupancyMap, L>;

/// Occupancy with per-node time steps.
pub type OccupancyTimeTree<L = NoLock> = Octree<(OccupancyMap, TimeMap), L>;

/// Occupancy with per-node color.
pub type OccupancyColorTree<L = NoLock> = Octree<(OccupancyMap, ColorMap), L>;

/// Occupancy with time steps and color.
pub type OccupancyTimeColorTree<L = NoLock> = Octree<(OccupancyMap, TimeMap, ColorMap), L>;

/// Occupancy with semantic label sets.
pub type OccupancySemanticTree<L = NoLock> = Octree<(OccupancyMap, SemanticMap), L>;

/// Surfel-only map.
pub type SurfelTree<L = NoLock> = Octree<SurfelMap, L>;

#[cfg(test)]
mod test {
    use super::*;
    use glam::DVec3;

    #[test]
    fn composed_tree_round_trips_all_members() {
        let map = (OccupancyMap::default(), TimeMap, ColorMap);
        let mut t = OccupancyTimeColorTree::new(map, 0.1, 12).unwrap();
        let p = DVec3::new(0.35, -0.15, 0.05);
        t.set_occupancy_logit(p, 1.2, false).unwrap();
        t.set_time_step(p, TimeStep(3), false).unwrap();
        t.set_color(p, Rgb::new(10, 200, 30), true).unwrap();

        assert!((t.occupancy_at(p).unwrap().logit() - 1.2).abs() < 1e-6);
        assert_eq!(t.time_step_at(p).unwrap(), TimeStep(3));
        assert_eq!(t.color_at(p).unwrap(), Rgb::new(10, 200, 30));

        let mut buf = Vec::new();
        t.write(&mut buf, true).unwrap();
        let map = (OccupancyMap::default(), TimeMap, ColorMap);
        let mut back = OccupancyTimeColorTree::new(map, 0.1, 12).unwrap();
        back.read(&mut buf.as_slice(), true).unwrap();
        assert_eq!(back.color_at(p).unwrap(), Rgb::new(10, 200, 30));
        assert_eq!(back.time_step_at(p).unwrap(), TimeStep(3));
    }

    #[test]
    fn surfel_tree_accumulates_points() {
        let mut t = SurfelTree::new(SurfelMap, 0.1, 12).unwrap();
        // Two points in the same leaf.
        t.insert_surfel_point(DVec3::new(0.051, 0.05, 0.05), false)
            .unwrap();
        t.insert_surfel_point(DVec3::new(0.059, 0.05, 0.05), true)
            .unwrap();
        let s = t.surfel_at(DVec3::new(0.055, 0.05, 0.05)).unwrap();
        assert_eq!(s.num_points(), 2);
        // The root aggregate merges them.
        let root = t.surfel(Code::new(0, t.root_depth()));
        assert_eq!(root.num_points(), 2);
    }

    #[test]
    fn code_map_and_set_are_usable_with_codes() {
        let mut set = CodeSet::default();
        let mut map = CodeMap::default();
        let code = Code::new(0b101_000, 1);
        set.insert(code);
        map.insert(code, 7u32);
        assert!(set.contains(&code));
        assert_eq!(map.get(&code), Some(&7));
    }
}
