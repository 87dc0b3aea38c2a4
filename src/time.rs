//! Per-node time step, tracking when a node was last touched by an
//! integration pass. Parents carry the newest step among their children.

use std::io::Write;

use glam::DVec3;

use crate::code::Code;
use crate::error::{Error, Result};
use crate::lock::LockPolicy;
use crate::map::AttributeMap;
use crate::tree::Octree;

/// Per-node time step payload.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct TimeStep(pub u32);

/// The time-step attribute map.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimeMap;

impl AttributeMap for TimeMap {
    type Node = TimeStep;
    const MAP_TYPE: u16 = 1 << 1;

    fn update_node(&self, parent: &mut TimeStep, children: [&TimeStep; 8]) {
        *parent = children.into_iter().copied().max().unwrap_or_default();
    }

    fn is_collapsible(&self, parent: &TimeStep, children: [&TimeStep; 8]) -> bool {
        children.into_iter().all(|c| c == parent)
    }

    fn serialized_size(&self) -> Option<usize> {
        Some(4)
    }

    fn write_streams<'a, W, I>(&self, out: &mut W, nodes: I, compress: bool) -> Result<()>
    where
        W: Write,
        I: Iterator<Item = &'a TimeStep> + Clone,
    {
        let mut payload = Vec::new();
        for n in nodes {
            payload.extend_from_slice(&n.0.to_le_bytes());
        }
        crate::io::write_frame(out, Self::MAP_TYPE, &payload, compress)
    }

    fn read_stream<'a, I>(&self, tag: u16, bytes: &[u8], nodes: I) -> Result<bool>
    where
        I: Iterator<Item = &'a mut TimeStep>,
    {
        if !Self::can_read(tag) {
            return Ok(false);
        }
        let mut chunks = bytes.chunks_exact(4);
        for node in nodes {
            let chunk = chunks
                .next()
                .ok_or_else(|| Error::Structure("time stream too short".into()))?;
            node.0 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        if !chunks.remainder().is_empty() || chunks.next().is_some() {
            return Err(Error::Structure("time stream too long".into()));
        }
        Ok(true)
    }
}

/// Projects the time-step component out of a (possibly composed) payload.
pub trait AsTimeStep {
    fn time_step(&self) -> TimeStep;
    fn time_step_mut(&mut self) -> &mut TimeStep;
}

impl AsTimeStep for TimeStep {
    #[inline]
    fn time_step(&self) -> TimeStep {
        *self
    }

    #[inline]
    fn time_step_mut(&mut self) -> &mut TimeStep {
        self
    }
}

impl<A> AsTimeStep for (A, TimeStep) {
    #[inline]
    fn time_step(&self) -> TimeStep {
        self.1
    }

    #[inline]
    fn time_step_mut(&mut self) -> &mut TimeStep {
        &mut self.1
    }
}

impl<A, C> AsTimeStep for (A, TimeStep, C) {
    #[inline]
    fn time_step(&self) -> TimeStep {
        self.1
    }

    #[inline]
    fn time_step_mut(&mut self) -> &mut TimeStep {
        &mut self.1
    }
}

/// Projects the time map out of a composed map.
pub trait HasTimeMap: AttributeMap {
    fn time_map(&self) -> &TimeMap;
}

impl HasTimeMap for TimeMap {
    #[inline]
    fn time_map(&self) -> &TimeMap {
        self
    }
}

impl<A: AttributeMap> HasTimeMap for (A, TimeMap) {
    #[inline]
    fn time_map(&self) -> &TimeMap {
        &self.1
    }
}

impl<A: AttributeMap, C: AttributeMap> HasTimeMap for (A, TimeMap, C) {
    #[inline]
    fn time_map(&self) -> &TimeMap {
        &self.1
    }
}

impl<M, L> Octree<M, L>
where
    M: HasTimeMap,
    M::Node: AsTimeStep,
    L: LockPolicy,
{
    pub fn time_step(&self, code: Code) -> TimeStep {
        self.value(code).time_step()
    }

    pub fn time_step_at(&self, coord: DVec3) -> Option<TimeStep> {
        self.value_at(coord).map(|n| n.time_step())
    }

    /// Stamps the depth-0 node containing `coord`.
    pub fn set_time_step(&mut self, coord: DVec3, step: TimeStep, propagate: bool) -> Result<()> {
        let code = self
            .to_code_checked(coord, 0)
            .ok_or_else(|| Error::OutOfBounds(format!("coordinate {coord:?}")))?;
        self.apply(
            code,
            |n| *n.time_step_mut() = step,
            |b| b.iter_mut().for_each(|n| *n.time_step_mut() = step),
            propagate,
        )
    }
}
