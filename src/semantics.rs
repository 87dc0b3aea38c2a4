//! Per-node semantic label sets.
//!
//! Each node holds a sorted set of `(label, value)` pairs, typically class
//! id and confidence. Merging is a union keeping the highest value per
//! label, both when inserting into a node and when aggregating children.

use std::io::Write;

use glam::DVec3;
use smallvec::SmallVec;

use crate::code::Code;
use crate::error::{Error, Result};
use crate::lock::LockPolicy;
use crate::map::AttributeMap;
use crate::tree::Octree;

/// One semantic annotation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SemanticLabel {
    pub label: u32,
    pub value: u8,
}

/// Per-node label set, sorted by label.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Semantics {
    labels: SmallVec<[SemanticLabel; 2]>,
}

impl Semantics {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &SemanticLabel> {
        self.labels.iter()
    }

    pub fn value_of(&self, label: u32) -> Option<u8> {
        self.labels
            .binary_search_by_key(&label, |l| l.label)
            .ok()
            .map(|i| self.labels[i].value)
    }

    /// Adds or strengthens a label; an existing entry keeps the larger
    /// value.
    pub fn insert(&mut self, label: u32, value: u8) {
        match self.labels.binary_search_by_key(&label, |l| l.label) {
            Ok(i) => self.labels[i].value = self.labels[i].value.max(value),
            Err(i) => self.labels.insert(i, SemanticLabel { label, value }),
        }
    }

    pub fn remove(&mut self, label: u32) -> bool {
        match self.labels.binary_search_by_key(&label, |l| l.label) {
            Ok(i) => {
                self.labels.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    /// Union with `other`, keeping the larger value per label.
    pub fn merge(&mut self, other: &Semantics) {
        for l in &other.labels {
            self.insert(l.label, l.value);
        }
    }

    pub fn clear(&mut self) {
        self.labels.clear();
    }
}

/// The semantic attribute map.
#[derive(Clone, Copy, Debug, Default)]
pub struct SemanticMap;

impl AttributeMap for SemanticMap {
    type Node = Semantics;
    const MAP_TYPE: u16 = 1 << 3;

    fn update_node(&self, parent: &mut Semantics, children: [&Semantics; 8]) {
        let mut merged = Semantics::default();
        for c in children {
            merged.merge(c);
        }
        *parent = merged;
    }

    fn is_collapsible(&self, parent: &Semantics, children: [&Semantics; 8]) -> bool {
        children.into_iter().all(|c| c == parent)
    }

    fn serialized_size(&self) -> Option<usize> {
        None
    }

    fn write_streams<'a, W, I>(&self, out: &mut W, nodes: I, compress: bool) -> Result<()>
    where
        W: Write,
        I: Iterator<Item = &'a Semantics> + Clone,
    {
        let mut payload = Vec::new();
        for n in nodes {
            payload.extend_from_slice(&(n.labels.len() as u32).to_le_bytes());
            for l in &n.labels {
                payload.extend_from_slice(&l.label.to_le_bytes());
                payload.push(l.value);
            }
        }
        crate::io::write_frame(out, Self::MAP_TYPE, &payload, compress)
    }

    fn read_stream<'a, I>(&self, tag: u16, bytes: &[u8], nodes: I) -> Result<bool>
    where
        I: Iterator<Item = &'a mut Semantics>,
    {
        if !Self::can_read(tag) {
            return Ok(false);
        }
        fn take<'b>(bytes: &'b [u8], at: &mut usize, n: usize) -> Result<&'b [u8]> {
            let end = *at + n;
            let slice = bytes
                .get(*at..end)
                .ok_or_else(|| Error::Structure("semantic stream too short".into()))?;
            *at = end;
            Ok(slice)
        }
        let mut at = 0usize;
        for node in nodes {
            let count = take(bytes, &mut at, 4)?;
            let count = u32::from_le_bytes([count[0], count[1], count[2], count[3]]);
            node.clear();
            for _ in 0..count {
                let entry = take(bytes, &mut at, 5)?;
                let label = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
                node.insert(label, entry[4]);
            }
        }
        if at != bytes.len() {
            return Err(Error::Structure("semantic stream too long".into()));
        }
        Ok(true)
    }
}

/// Projects the semantic component out of a (possibly composed) payload.
pub trait AsSemantics {
    fn semantics(&self) -> &Semantics;
    fn semantics_mut(&mut self) -> &mut Semantics;
}

impl AsSemantics for Semantics {
    #[inline]
    fn semantics(&self) -> &Semantics {
        self
    }

    #[inline]
    fn semantics_mut(&mut self) -> &mut Semantics {
        self
    }
}

impl<A> AsSemantics for (A, Semantics) {
    #[inline]
    fn semantics(&self) -> &Semantics {
        &self.1
    }

    #[inline]
    fn semantics_mut(&mut self) -> &mut Semantics {
        &mut self.1
    }
}

impl<A, B> AsSemantics for (A, B, Semantics) {
    #[inline]
    fn semantics(&self) -> &Semantics {
        &self.2
    }

    #[inline]
    fn semantics_mut(&mut self) -> &mut Semantics {
        &mut self.2
    }
}

/// Projects the semantic map out of a composed map.
pub trait HasSemanticMap: AttributeMap {
    fn semantic_map(&self) -> &SemanticMap;
}

impl HasSemanticMap for SemanticMap {
    #[inline]
    fn semantic_map(&self) -> &SemanticMap {
        self
    }
}

impl<A: AttributeMap> HasSemanticMap for (A, SemanticMap) {
    #[inline]
    fn semantic_map(&self) -> &SemanticMap {
        &self.1
    }
}

impl<A: AttributeMap, B: AttributeMap> HasSemanticMap for (A, B, SemanticMap) {
    #[inline]
    fn semantic_map(&self) -> &SemanticMap {
        &self.2
    }
}

impl<M, L> Octree<M, L>
where
    M: HasSemanticMap,
    M::Node: AsSemantics,
    L: LockPolicy,
{
    pub fn semantics(&self, code: Code) -> Semantics {
        self.value(code).semantics().clone()
    }

    pub fn semantics_at(&self, coord: DVec3) -> Option<Semantics> {
        self.value_at(coord).map(|n| n.semantics().clone())
    }

    /// Annotates the depth-0 node containing `coord`.
    pub fn insert_semantic_label(
        &mut self,
        coord: DVec3,
        label: u32,
        value: u8,
        propagate: bool,
    ) -> Result<()> {
        let code = self
            .to_code_checked(coord, 0)
            .ok_or_else(|| Error::OutOfBounds(format!("coordinate {coord:?}")))?;
        self.apply(
            code,
            |n| n.semantics_mut().insert(label, value),
            |b| b.iter_mut().for_each(|n| n.semantics_mut().insert(label, value)),
            propagate,
        )
    }
}
