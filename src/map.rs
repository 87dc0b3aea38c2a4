//! The attribute-map capability and map composition.
//!
//! An attribute map contributes one payload record per node slot and the
//! hooks the engine invokes over a block's eight siblings: broadcast on
//! split, aggregate on propagation, the collapse test for pruning, and
//! tagged serialization. Maps compose as tuples; hooks dispatch member by
//! member in tuple order and the hot path stays monomorphized.

use std::io::Write;

use crate::error::Result;

/// A payload module of the tree. Implemented by the concrete maps
/// (occupancy, color, time step, semantics, surfel) and by tuples of them.
pub trait AttributeMap: Send + Sync + 'static {
    /// Per-node payload record, stored eight to a block.
    type Node: Clone + Default + PartialEq + Send + Sync + 'static;

    /// Bit(s) tagging this map's payload stream(s) in serialized files.
    const MAP_TYPE: u16;

    /// Initializes the root's payload slot.
    fn init_root(&self, node: &mut Self::Node) {
        *node = Self::Node::default();
    }

    /// The value broadcast into all eight children when a node is split.
    fn fill(&self, parent: &Self::Node) -> Self::Node {
        parent.clone()
    }

    /// Resets a payload slot.
    fn clear_node(&self, node: &mut Self::Node) {
        *node = Self::Node::default();
    }

    /// Aggregates eight children into their parent's slot.
    fn update_node(&self, parent: &mut Self::Node, children: [&Self::Node; 8]);

    /// Whether a sibling group may be replaced by its (already aggregated)
    /// parent slot. The engine has already established that none of the
    /// children has children of its own.
    fn is_collapsible(&self, parent: &Self::Node, children: [&Self::Node; 8]) -> bool;

    /// Whether this map consumes payload streams tagged `tag`.
    fn can_read(tag: u16) -> bool {
        tag & Self::MAP_TYPE != 0
    }

    /// Fixed serialized width per node, or `None` when variable.
    fn serialized_size(&self) -> Option<usize>;

    /// Appends this map's tagged stream(s) covering `nodes` in document
    /// order. Composite maps emit one stream per member.
    fn write_streams<'a, W, I>(&self, out: &mut W, nodes: I, compress: bool) -> Result<()>
    where
        W: Write,
        I: Iterator<Item = &'a Self::Node> + Clone,
        Self::Node: 'a;

    /// Decodes one tagged stream into `nodes` in document order. Returns
    /// `Ok(false)` when the tag belongs to no member, leaving `nodes`
    /// untouched.
    fn read_stream<'a, I>(&self, tag: u16, bytes: &[u8], nodes: I) -> Result<bool>
    where
        I: Iterator<Item = &'a mut Self::Node>,
        Self::Node: 'a;
}

macro_rules! impl_attribute_map_tuple {
    ($(($t:ident, $idx:tt)),+) => {
        impl<$($t: AttributeMap),+> AttributeMap for ($($t,)+) {
            type Node = ($($t::Node,)+);

            const MAP_TYPE: u16 = $($t::MAP_TYPE)|+;

            fn init_root(&self, node: &mut Self::Node) {
                $(self.$idx.init_root(&mut node.$idx);)+
            }

            fn fill(&self, parent: &Self::Node) -> Self::Node {
                ($(self.$idx.fill(&parent.$idx),)+)
            }

            fn clear_node(&self, node: &mut Self::Node) {
                $(self.$idx.clear_node(&mut node.$idx);)+
            }

            fn update_node(&self, parent: &mut Self::Node, children: [&Self::Node; 8]) {
                $(self.$idx.update_node(&mut parent.$idx, children.map(|c| &c.$idx));)+
            }

            fn is_collapsible(&self, parent: &Self::Node, children: [&Self::Node; 8]) -> bool {
                $(self.$idx.is_collapsible(&parent.$idx, children.map(|c| &c.$idx)))&&+
            }

            fn serialized_size(&self) -> Option<usize> {
                let mut total = 0;
                $(total += self.$idx.serialized_size()?;)+
                Some(total)
            }

            fn write_streams<'a, W, I>(&self, out: &mut W, nodes: I, compress: bool) -> Result<()>
            where
                W: Write,
                I: Iterator<Item = &'a Self::Node> + Clone,
                Self::Node: 'a,
            {
                $(self.$idx.write_streams(out, nodes.clone().map(|n| &n.$idx), compress)?;)+
                Ok(())
            }

            fn read_stream<'a, I>(&self, tag: u16, bytes: &[u8], nodes: I) -> Result<bool>
            where
                I: Iterator<Item = &'a mut Self::Node>,
                Self::Node: 'a,
            {
                $(
                    if $t::can_read(tag) {
                        return self.$idx.read_stream(tag, bytes, nodes.map(|n| &mut n.$idx));
                    }
                )+
                let _ = (bytes, nodes);
                Ok(false)
            }
        }
    };
}

impl_attribute_map_tuple!((A, 0), (B, 1));
impl_attribute_map_tuple!((A, 0), (B, 1), (C, 2));

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct Max;

    impl AttributeMap for Max {
        type Node = u32;
        const MAP_TYPE: u16 = 1 << 14;

        fn update_node(&self, parent: &mut u32, children: [&u32; 8]) {
            *parent = children.into_iter().copied().max().unwrap_or(0);
        }

        fn is_collapsible(&self, parent: &u32, children: [&u32; 8]) -> bool {
            children.into_iter().all(|c| c == parent)
        }

        fn serialized_size(&self) -> Option<usize> {
            Some(4)
        }

        fn write_streams<'a, W, I>(&self, out: &mut W, nodes: I, compress: bool) -> Result<()>
        where
            W: Write,
            I: Iterator<Item = &'a u32> + Clone,
        {
            let mut payload = Vec::new();
            for n in nodes {
                payload.extend_from_slice(&n.to_le_bytes());
            }
            crate::io::write_frame(out, Self::MAP_TYPE, &payload, compress)
        }

        fn read_stream<'a, I>(&self, tag: u16, bytes: &[u8], nodes: I) -> Result<bool>
        where
            I: Iterator<Item = &'a mut u32>,
        {
            if !Self::can_read(tag) {
                return Ok(false);
            }
            for (chunk, node) in bytes.chunks_exact(4).zip(nodes) {
                *node = u32::from_le_bytes(chunk.try_into().unwrap());
            }
            Ok(true)
        }
    }

    #[derive(Default)]
    struct Min;

    impl AttributeMap for Min {
        type Node = u32;
        const MAP_TYPE: u16 = 1 << 15;

        fn update_node(&self, parent: &mut u32, children: [&u32; 8]) {
            *parent = children.into_iter().copied().min().unwrap_or(0);
        }

        fn is_collapsible(&self, parent: &u32, children: [&u32; 8]) -> bool {
            children.into_iter().all(|c| c == parent)
        }

        fn serialized_size(&self) -> Option<usize> {
            Some(4)
        }

        fn write_streams<'a, W, I>(&self, out: &mut W, nodes: I, compress: bool) -> Result<()>
        where
            W: Write,
            I: Iterator<Item = &'a u32> + Clone,
        {
            let mut payload = Vec::new();
            for n in nodes {
                payload.extend_from_slice(&n.to_le_bytes());
            }
            crate::io::write_frame(out, Self::MAP_TYPE, &payload, compress)
        }

        fn read_stream<'a, I>(&self, tag: u16, bytes: &[u8], nodes: I) -> Result<bool>
        where
            I: Iterator<Item = &'a mut u32>,
        {
            if !Self::can_read(tag) {
                return Ok(false);
            }
            for (chunk, node) in bytes.chunks_exact(4).zip(nodes) {
                *node = u32::from_le_bytes(chunk.try_into().unwrap());
            }
            Ok(true)
        }
    }

    #[test]
    fn tuple_dispatches_in_order() {
        let map = (Max, Min);
        let pairs: [(u32, u32); 8] = [3, 1, 4, 1, 5, 9, 2, 6].map(|v| (v, v));
        let child_refs: [&(u32, u32); 8] = std::array::from_fn(|i| &pairs[i]);

        let mut parent = (0u32, 0u32);
        map.update_node(&mut parent, child_refs);
        assert_eq!(parent, (9, 1));

        assert_eq!(<(Max, Min)>::MAP_TYPE, (1 << 14) | (1 << 15));
        assert!(<(Max, Min)>::can_read(1 << 14));
        assert!(<(Max, Min)>::can_read(1 << 15));
        assert!(!<(Max, Min)>::can_read(1));
    }

    #[test]
    fn tuple_collapse_requires_every_member() {
        let map = (Max, Min);
        let uniform: [(u32, u32); 8] = [(2, 7); 8];
        let refs: [&(u32, u32); 8] = std::array::from_fn(|i| &uniform[i]);
        assert!(map.is_collapsible(&(2, 7), refs));
        assert!(!map.is_collapsible(&(2, 8), refs));
    }
}
