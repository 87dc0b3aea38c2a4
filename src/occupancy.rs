//! Clamped log-odds occupancy.
//!
//! Every node stores a single occupancy value in log-odds form, clamped to
//! a configurable interval and classified against occupied/free thresholds
//! into UNKNOWN, FREE, or OCCUPIED. Aggregation toward the root uses a
//! configurable criterion, maximum by default, so a coarse node reports
//! occupied iff any descendant does.

use std::io::Write;

use glam::DVec3;

use crate::code::Code;
use crate::error::{Error, Result};
use crate::lock::LockPolicy;
use crate::map::AttributeMap;
use crate::tree::Octree;

/// Log-odds of a probability.
#[inline]
pub fn logit(probability: f32) -> f32 {
    (probability / (1.0 - probability)).ln()
}

/// Probability of a log-odds value.
#[inline]
pub fn probability(logit: f32) -> f32 {
    1.0 / (1.0 + (-logit).exp())
}

/// Classification of a node against the map's thresholds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OccupancyState {
    Unknown,
    Free,
    Occupied,
}

/// How children aggregate into their parent on propagation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PropagationCriteria {
    Min,
    #[default]
    Max,
    Mean,
}

/// Per-node occupancy payload: a clamped log-odds value. Zero means even
/// odds, i.e. unknown.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Occupancy(pub f32);

impl Occupancy {
    #[inline]
    pub fn logit(self) -> f32 {
        self.0
    }

    #[inline]
    pub fn probability(self) -> f32 {
        probability(self.0)
    }
}

/// The occupancy attribute map and its thresholds.
#[derive(Clone, Debug)]
pub struct OccupancyMap {
    clamp_min: f32,
    clamp_max: f32,
    occupied_thres: f32,
    free_thres: f32,
    criteria: PropagationCriteria,
}

impl Default for OccupancyMap {
    fn default() -> Self {
        Self::new(0.5, 0.5, 0.1192, 0.971)
    }
}

impl OccupancyMap {
    /// Thresholds are given as probabilities and stored as log-odds.
    pub fn new(occupied_thres: f32, free_thres: f32, clamp_min: f32, clamp_max: f32) -> Self {
        Self {
            clamp_min: logit(clamp_min),
            clamp_max: logit(clamp_max),
            occupied_thres: logit(occupied_thres),
            free_thres: logit(free_thres),
            criteria: PropagationCriteria::default(),
        }
    }

    pub fn with_criteria(mut self, criteria: PropagationCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    #[inline]
    pub fn clamp_min_logit(&self) -> f32 {
        self.clamp_min
    }

    #[inline]
    pub fn clamp_max_logit(&self) -> f32 {
        self.clamp_max
    }

    #[inline]
    pub fn occupied_thres_logit(&self) -> f32 {
        self.occupied_thres
    }

    #[inline]
    pub fn free_thres_logit(&self) -> f32 {
        self.free_thres
    }

    #[inline]
    pub fn clamp(&self, logit: f32) -> f32 {
        logit.clamp(self.clamp_min, self.clamp_max)
    }

    #[inline]
    pub fn state(&self, occupancy: Occupancy) -> OccupancyState {
        if occupancy.0 > self.occupied_thres {
            OccupancyState::Occupied
        } else if occupancy.0 < self.free_thres {
            OccupancyState::Free
        } else {
            OccupancyState::Unknown
        }
    }

    #[inline]
    pub fn is_occupied(&self, occupancy: Occupancy) -> bool {
        self.state(occupancy) == OccupancyState::Occupied
    }

    #[inline]
    pub fn is_free(&self, occupancy: Occupancy) -> bool {
        self.state(occupancy) == OccupancyState::Free
    }

    #[inline]
    pub fn is_unknown(&self, occupancy: Occupancy) -> bool {
        self.state(occupancy) == OccupancyState::Unknown
    }
}

impl AttributeMap for OccupancyMap {
    type Node = Occupancy;
    const MAP_TYPE: u16 = 1;

    fn update_node(&self, parent: &mut Occupancy, children: [&Occupancy; 8]) {
        let logits = children.map(|c| c.0);
        parent.0 = match self.criteria {
            PropagationCriteria::Max => logits.into_iter().fold(f32::NEG_INFINITY, f32::max),
            PropagationCriteria::Min => logits.into_iter().fold(f32::INFINITY, f32::min),
            PropagationCriteria::Mean => logits.into_iter().sum::<f32>() / 8.0,
        };
    }

    fn is_collapsible(&self, parent: &Occupancy, children: [&Occupancy; 8]) -> bool {
        children.into_iter().all(|c| c == parent)
    }

    fn serialized_size(&self) -> Option<usize> {
        Some(4)
    }

    fn write_streams<'a, W, I>(&self, out: &mut W, nodes: I, compress: bool) -> Result<()>
    where
        W: Write,
        I: Iterator<Item = &'a Occupancy> + Clone,
    {
        let mut payload = Vec::new();
        for n in nodes {
            payload.extend_from_slice(&n.0.to_le_bytes());
        }
        crate::io::write_frame(out, Self::MAP_TYPE, &payload, compress)
    }

    fn read_stream<'a, I>(&self, tag: u16, bytes: &[u8], nodes: I) -> Result<bool>
    where
        I: Iterator<Item = &'a mut Occupancy>,
    {
        if !Self::can_read(tag) {
            return Ok(false);
        }
        let mut chunks = bytes.chunks_exact(4);
        for node in nodes {
            let chunk = chunks
                .next()
                .ok_or_else(|| Error::Structure("occupancy stream too short".into()))?;
            node.0 = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        if !chunks.remainder().is_empty() || chunks.next().is_some() {
            return Err(Error::Structure("occupancy stream too long".into()));
        }
        Ok(true)
    }
}

/// Projects the occupancy component out of a (possibly composed) payload.
pub trait AsOccupancy {
    fn occupancy(&self) -> Occupancy;
    fn occupancy_mut(&mut self) -> &mut Occupancy;
}

impl AsOccupancy for Occupancy {
    #[inline]
    fn occupancy(&self) -> Occupancy {
        *self
    }

    #[inline]
    fn occupancy_mut(&mut self) -> &mut Occupancy {
        self
    }
}

impl<B> AsOccupancy for (Occupancy, B) {
    #[inline]
    fn occupancy(&self) -> Occupancy {
        self.0
    }

    #[inline]
    fn occupancy_mut(&mut self) -> &mut Occupancy {
        &mut self.0
    }
}

impl<B, C> AsOccupancy for (Occupancy, B, C) {
    #[inline]
    fn occupancy(&self) -> Occupancy {
        self.0
    }

    #[inline]
    fn occupancy_mut(&mut self) -> &mut Occupancy {
        &mut self.0
    }
}

/// Projects the occupancy map (and its thresholds) out of a composed map.
pub trait HasOccupancyMap: AttributeMap {
    fn occupancy_map(&self) -> &OccupancyMap;
}

impl HasOccupancyMap for OccupancyMap {
    #[inline]
    fn occupancy_map(&self) -> &OccupancyMap {
        self
    }
}

impl<B: AttributeMap> HasOccupancyMap for (OccupancyMap, B) {
    #[inline]
    fn occupancy_map(&self) -> &OccupancyMap {
        &self.0
    }
}

impl<B: AttributeMap, C: AttributeMap> HasOccupancyMap for (OccupancyMap, B, C) {
    #[inline]
    fn occupancy_map(&self) -> &OccupancyMap {
        &self.0
    }
}

impl<M, L> Octree<M, L>
where
    M: HasOccupancyMap,
    M::Node: AsOccupancy,
    L: LockPolicy,
{
    /// Log-odds occupancy of the node `code` resolves to.
    pub fn occupancy(&self, code: Code) -> Occupancy {
        self.value(code).occupancy()
    }

    pub fn occupancy_at(&self, coord: DVec3) -> Option<Occupancy> {
        self.value_at(coord).map(|n| n.occupancy())
    }

    pub fn occupancy_state(&self, code: Code) -> OccupancyState {
        self.map().occupancy_map().state(self.occupancy(code))
    }

    pub fn is_occupied(&self, code: Code) -> bool {
        self.map().occupancy_map().is_occupied(self.occupancy(code))
    }

    pub fn is_free(&self, code: Code) -> bool {
        self.map().occupancy_map().is_free(self.occupancy(code))
    }

    pub fn is_unknown(&self, code: Code) -> bool {
        self.map().occupancy_map().is_unknown(self.occupancy(code))
    }

    /// Overwrites the occupancy of the depth-0 node containing `coord` with
    /// a clamped log-odds value.
    pub fn set_occupancy_logit(&mut self, coord: DVec3, logit: f32, propagate: bool) -> Result<()> {
        let code = self
            .to_code_checked(coord, 0)
            .ok_or_else(|| Error::OutOfBounds(format!("coordinate {coord:?}")))?;
        self.set_occupancy_logit_code(code, logit, propagate)
    }

    pub fn set_occupancy_logit_code(
        &mut self,
        code: Code,
        logit: f32,
        propagate: bool,
    ) -> Result<()> {
        let clamped = self.map().occupancy_map().clamp(logit);
        self.apply(
            code,
            |n| n.occupancy_mut().0 = clamped,
            |b| b.iter_mut().for_each(|n| n.occupancy_mut().0 = clamped),
            propagate,
        )
    }

    /// Adds `delta` to the occupancy log-odds, clamped.
    pub fn increase_occupancy(&mut self, coord: DVec3, delta: f32, propagate: bool) -> Result<()> {
        let code = self
            .to_code_checked(coord, 0)
            .ok_or_else(|| Error::OutOfBounds(format!("coordinate {coord:?}")))?;
        let min = self.map().occupancy_map().clamp_min_logit();
        let max = self.map().occupancy_map().clamp_max_logit();
        self.apply(
            code,
            |n| {
                let o = n.occupancy_mut();
                o.0 = (o.0 + delta).clamp(min, max);
            },
            |b| {
                b.iter_mut().for_each(|n| {
                    let o = n.occupancy_mut();
                    o.0 = (o.0 + delta).clamp(min, max);
                })
            },
            propagate,
        )
    }

    /// Subtracts `delta` from the occupancy log-odds, clamped.
    pub fn decrease_occupancy(&mut self, coord: DVec3, delta: f32, propagate: bool) -> Result<()> {
        self.increase_occupancy(coord, -delta, propagate)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::code::MAX_DEPTH;

    #[test]
    fn logit_probability_round_trip() {
        for p in [0.1f32, 0.25, 0.5, 0.75, 0.9] {
            assert!((probability(logit(p)) - p).abs() < 1e-6);
        }
        assert_eq!(logit(0.5), 0.0);
    }

    #[test]
    fn state_thresholds() {
        let map = OccupancyMap::default();
        assert_eq!(map.state(Occupancy(0.0)), OccupancyState::Unknown);
        assert_eq!(map.state(Occupancy(0.85)), OccupancyState::Occupied);
        assert_eq!(map.state(Occupancy(-0.85)), OccupancyState::Free);
    }

    #[test]
    fn max_propagation() {
        let map = OccupancyMap::default();
        let children_vals: [Occupancy; 8] = std::array::from_fn(|i| Occupancy(i as f32 - 4.0));
        let children: [&Occupancy; 8] = std::array::from_fn(|i| &children_vals[i]);
        let mut parent = Occupancy::default();
        map.update_node(&mut parent, children);
        assert_eq!(parent.0, 3.0);

        let map = map.with_criteria(PropagationCriteria::Min);
        map.update_node(&mut parent, children);
        assert_eq!(parent.0, -4.0);

        let map = map.with_criteria(PropagationCriteria::Mean);
        map.update_node(&mut parent, children);
        assert_eq!(parent.0, -0.5);
    }

    #[test]
    fn set_and_query_occupancy() {
        let mut t = Octree::new(OccupancyMap::default(), 0.1, 16).unwrap();
        let p = DVec3::new(0.05, 0.05, 0.05);
        t.set_occupancy_logit(p, 0.85, false).unwrap();
        let occ = t.occupancy_at(p).unwrap();
        assert!((occ.logit() - 0.85).abs() < 1e-6);
        assert_eq!(t.count_modified_nodes(), 16);
        t.propagate_modified(false, MAX_DEPTH);
        assert_eq!(t.count_modified_nodes(), 0);
        // Max propagation carries the occupied value to the root.
        let root = Code::new(0, t.root_depth());
        assert!(t.is_occupied(root));
    }

    #[test]
    fn increase_clamps_at_bounds() {
        let mut t = Octree::new(OccupancyMap::default(), 0.1, 8).unwrap();
        let p = DVec3::new(0.05, 0.05, 0.05);
        for _ in 0..100 {
            t.increase_occupancy(p, 1.0, false).unwrap();
        }
        let max = t.map().occupancy_map().clamp_max_logit();
        assert_eq!(t.occupancy_at(p).unwrap().logit(), max);
        for _ in 0..100 {
            t.decrease_occupancy(p, 1.0, false).unwrap();
        }
        let min = t.map().occupancy_map().clamp_min_logit();
        assert_eq!(t.occupancy_at(p).unwrap().logit(), min);
    }
}
