//! Binary persistence.
//!
//! Little-endian format: a 16-byte magic and version, the tree geometry,
//! then a tree-structure segment of index-field mask pairs, the total
//! payload node count, and one tagged payload stream per attribute map.
//! Streams are optionally LZ4 block compressed with explicit length
//! framing, so a reader can skip any stream it does not understand.

use std::io::{Read, Write};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::lock::LockPolicy;
use crate::map::AttributeMap;
use crate::predicate::{And, Leaf, Modified, Predicate, True};
use crate::tree::{NodeBV, Octree};
use crate::Depth;

/// First bytes of every map file.
pub const MAGIC: [u8; 16] = *b"# block-octree\n\0";
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

/// The geometry and framing switches a file was written with.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileHeader {
    pub major: u8,
    pub minor: u8,
    pub leaf_size: f64,
    pub depth_levels: Depth,
    pub compressed: bool,
}

/// Reads and validates a file header, leaving the reader positioned at the
/// tree-structure segment.
pub fn read_header<R: Read>(input: &mut R) -> Result<FileHeader> {
    let mut magic = [0u8; 16];
    input.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(Error::Format("bad magic".into()));
    }
    let major = read_u8(input)?;
    let minor = read_u8(input)?;
    if major != VERSION_MAJOR {
        return Err(Error::Format(format!(
            "unsupported version {major}.{minor}"
        )));
    }
    let leaf_size = f64::from_le_bytes(read_array::<8, R>(input)?);
    let depth_levels = read_u8(input)?;
    let compressed = match read_u8(input)? {
        0 => false,
        u8::MAX => true,
        other => return Err(Error::Format(format!("bad compression flag {other}"))),
    };
    Ok(FileHeader {
        major,
        minor,
        leaf_size,
        depth_levels,
        compressed,
    })
}

fn write_header<W: Write>(out: &mut W, header: &FileHeader) -> Result<()> {
    out.write_all(&MAGIC)?;
    out.write_all(&[header.major, header.minor])?;
    out.write_all(&header.leaf_size.to_le_bytes())?;
    out.write_all(&[header.depth_levels, if header.compressed { u8::MAX } else { 0 }])?;
    Ok(())
}

/// Appends one tagged payload stream: tag, byte length, the uncompressed
/// length when compressed, then the bytes.
pub(crate) fn write_frame<W: Write>(
    out: &mut W,
    tag: u16,
    payload: &[u8],
    compress: bool,
) -> Result<()> {
    out.write_all(&tag.to_le_bytes())?;
    if compress {
        let compressed = lz4_flex::block::compress(payload);
        out.write_all(&(compressed.len() as u64).to_le_bytes())?;
        out.write_all(&(payload.len() as u64).to_le_bytes())?;
        out.write_all(&compressed)?;
    } else {
        out.write_all(&(payload.len() as u64).to_le_bytes())?;
        out.write_all(payload)?;
    }
    Ok(())
}

fn read_u8<R: Read>(input: &mut R) -> Result<u8> {
    Ok(read_array::<1, R>(input)?[0])
}

fn read_u64<R: Read>(input: &mut R) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array::<8, R>(input)?))
}

fn read_array<const N: usize, R: Read>(input: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    input.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_vec<R: Read>(input: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    Ok(buf)
}

/// Reads a stream tag, or `None` at a clean end of input.
fn try_read_tag<R: Read>(input: &mut R) -> Result<Option<u16>> {
    let mut buf = [0u8; 2];
    let mut filled = 0;
    while filled < 2 {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Format("truncated stream tag".into()));
        }
        filled += n;
    }
    Ok(Some(u16::from_le_bytes(buf)))
}

impl<M: AttributeMap, L: LockPolicy> Octree<M, L> {
    /// Serializes the whole tree.
    pub fn write<W: Write>(&self, out: &mut W, compress: bool) -> Result<()> {
        self.write_with(out, True, 0, compress)
    }

    /// Serializes the nodes selected by `predicate`, stopping recursion at
    /// `min_depth` and treating nodes there as leaves.
    pub fn write_with<W: Write, P: Predicate<M, L>>(
        &self,
        out: &mut W,
        predicate: P,
        min_depth: Depth,
        compress: bool,
    ) -> Result<()> {
        write_header(
            out,
            &FileHeader {
                major: VERSION_MAJOR,
                minor: VERSION_MINOR,
                leaf_size: self.leaf_size(),
                depth_levels: self.depth_levels(),
                compressed: compress,
            },
        )?;

        let pred = And(Leaf::at(min_depth), predicate);
        let mut fields = Vec::new();
        let mut nodes: Vec<*const M::Node> = Vec::new();
        let root = self.root_bv();
        let valid_return = pred.value_check(self, &root);
        let valid_inner = !valid_return && pred.inner_check(self, &root);
        fields.push(if valid_return { u8::MAX } else { 0 });
        fields.push(if valid_inner { u8::MAX } else { 0 });
        if valid_return {
            nodes.push(self.payload_ptr(root.node()) as *const M::Node);
        } else if valid_inner {
            self.collect_recurs(&pred, &mut fields, &mut nodes, &root);
            if nodes.is_empty() {
                fields.clear();
                fields.extend_from_slice(&[0, 0]);
            }
        }

        // Tree-structure segment.
        let mut segment = Vec::with_capacity(8 + fields.len());
        segment.extend_from_slice(&(fields.len() as u64).to_le_bytes());
        segment.extend_from_slice(&fields);
        if compress {
            let compressed = lz4_flex::block::compress(&segment);
            out.write_all(&(compressed.len() as u64).to_le_bytes())?;
            out.write_all(&(segment.len() as u64).to_le_bytes())?;
            out.write_all(&compressed)?;
        } else {
            out.write_all(&(segment.len() as u64).to_le_bytes())?;
            out.write_all(&segment)?;
        }

        out.write_all(&(nodes.len() as u64).to_le_bytes())?;

        // SAFETY: the collected pointers index live payload slots and the
        // tree is not mutated while writing.
        let node_iter = nodes.iter().map(|&p| unsafe { &*p });
        self.map().write_streams(out, node_iter, compress)?;
        Ok(())
    }

    fn collect_recurs<P: Predicate<M, L>>(
        &self,
        pred: &P,
        fields: &mut Vec<u8>,
        nodes: &mut Vec<*const M::Node>,
        parent: &NodeBV<'_>,
    ) {
        let fields_mark = fields.len();
        let nodes_mark = nodes.len();
        let child_depth = parent.data_depth() - 1;

        let children: [NodeBV<'_>; 8] = std::array::from_fn(|j| self.child_bv(parent, j as u8));
        let mut valid_return = 0u8;
        let mut valid_inner = 0u8;
        for (j, child) in children.iter().enumerate() {
            if pred.value_check(self, child) {
                valid_return |= 1 << j;
            } else if child_depth > 0 && pred.inner_check(self, child) {
                valid_inner |= 1 << j;
            }
        }

        fields.push(valid_return);
        if child_depth > 0 {
            fields.push(valid_inner);
        }

        for (j, child) in children.iter().enumerate() {
            if valid_return & (1 << j) != 0 {
                nodes.push(self.payload_ptr(child.node()) as *const M::Node);
            } else if valid_inner & (1 << j) != 0 {
                self.collect_recurs(pred, fields, nodes, child);
            }
        }

        // Drop groups that contributed nothing, keeping the grammar intact.
        if nodes.len() == nodes_mark {
            fields.truncate(fields_mark);
            fields.push(0);
            if child_depth > 0 {
                fields.push(0);
            }
        }
    }

    /// Serializes exactly the modified frontier, then propagates and clears
    /// the modified flags.
    pub fn write_modified_and_reset<W: Write>(&mut self, out: &mut W, compress: bool) -> Result<()> {
        self.write_with(out, Modified, 0, compress)?;
        self.propagate_modified(false, crate::code::MAX_DEPTH);
        Ok(())
    }

    /// Serializes exactly the modified frontier, then propagates while
    /// keeping the modified flags set.
    pub fn write_modified_and_propagate<W: Write>(
        &mut self,
        out: &mut W,
        compress: bool,
    ) -> Result<()> {
        self.write_with(out, Modified, 0, compress)?;
        self.propagate_modified(true, crate::code::MAX_DEPTH);
        Ok(())
    }

    /// Whether a file with `header` can be read into this tree without
    /// erasing it.
    pub fn can_merge(&self, header: &FileHeader) -> bool {
        header.leaf_size == self.leaf_size() && header.depth_levels == self.depth_levels()
    }

    /// Deserializes a map written by [`Self::write`], merging into the
    /// current tree. A geometry mismatch clears the tree first. Created
    /// paths are marked modified; with `propagate` the aggregates are
    /// repaired before returning.
    pub fn read<R: Read>(&mut self, input: &mut R, propagate: bool) -> Result<()> {
        let header = read_header(input)?;
        if !self.can_merge(&header) {
            debug!(
                "map geometry changed: leaf_size {} -> {}, depth_levels {} -> {}",
                self.leaf_size(),
                header.leaf_size,
                self.depth_levels(),
                header.depth_levels
            );
            self.clear_and_resize(header.leaf_size, header.depth_levels, true)?;
        }

        // Tree-structure segment.
        let segment = if header.compressed {
            let byte_len = read_u64(input)? as usize;
            let uncompressed_len = read_u64(input)? as usize;
            let compressed = read_vec(input, byte_len)?;
            lz4_flex::block::decompress(&compressed, uncompressed_len)
                .map_err(|e| Error::Compression(format!("tree structure: {e}")))?
        } else {
            let byte_len = read_u64(input)? as usize;
            read_vec(input, byte_len)?
        };
        if segment.len() < 8 {
            return Err(Error::Format("short tree-structure segment".into()));
        }
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&segment[0..8]);
        let num_fields = u64::from_le_bytes(count_bytes) as usize;
        let fields = &segment[8..];
        if fields.len() != num_fields {
            return Err(Error::Structure(format!(
                "tree-structure length {} does not match recorded count {num_fields}",
                fields.len()
            )));
        }

        let node_count = read_u64(input)? as usize;
        debug!("reading {node_count} nodes from {num_fields} index fields");

        let mut nodes: Vec<*mut M::Node> = Vec::with_capacity(node_count);
        if num_fields >= 2 {
            let root = self.root_node();
            if fields[0] != 0 {
                nodes.push(self.payload_ptr(root));
                self.set_modified_flag(root);
            } else if fields[1] != 0 {
                let mut at = 2usize;
                self.reconstruct_recurs(fields, &mut at, &mut nodes, root)?;
            }
        }
        if nodes.len() != node_count {
            return Err(Error::Structure(format!(
                "tree structure yields {} nodes, file recorded {node_count}",
                nodes.len()
            )));
        }

        // Payload streams; unknown tags are skipped by length.
        let mut compression_failures = 0usize;
        while let Some(tag) = try_read_tag(input)? {
            let byte_len = read_u64(input)? as usize;
            let bytes = if header.compressed {
                let uncompressed_len = read_u64(input)? as usize;
                let compressed = read_vec(input, byte_len)?;
                match lz4_flex::block::decompress(&compressed, uncompressed_len) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("payload stream {tag:#06x} failed to decompress: {e}");
                        compression_failures += 1;
                        continue;
                    }
                }
            } else {
                read_vec(input, byte_len)?
            };
            // SAFETY: the slots are distinct and we have exclusive access.
            let node_iter = nodes.iter().map(|&p| unsafe { &mut *p });
            if !self.map().read_stream(tag, &bytes, node_iter)? {
                debug!("skipping unknown payload stream tag {tag:#06x}");
            }
        }

        if propagate {
            self.propagate_modified(false, crate::code::MAX_DEPTH);
        }
        if compression_failures > 0 {
            return Err(Error::Compression(format!(
                "{compression_failures} payload stream(s) failed to decompress"
            )));
        }
        Ok(())
    }

    fn reconstruct_recurs(
        &self,
        fields: &[u8],
        at: &mut usize,
        nodes: &mut Vec<*mut M::Node>,
        node: crate::tree::Node<'_>,
    ) -> Result<()> {
        let child_depth = node.data_depth() - 1;
        let short = || Error::Structure("tree-structure stream ended early".into());
        let valid_return = *fields.get(*at).ok_or_else(short)?;
        *at += 1;
        let valid_inner = if child_depth > 0 {
            let v = *fields.get(*at).ok_or_else(short)?;
            *at += 1;
            v
        } else {
            0
        };
        if valid_return == 0 && valid_inner == 0 {
            return Ok(());
        }

        self.set_modified_flag(node);
        self.create_children_of(node);

        for j in 0..8 {
            if valid_return & (1 << j) != 0 {
                let child = self.child_node(node, j);
                nodes.push(self.payload_ptr(child));
                self.set_modified_flag(child);
            } else if valid_inner & (1 << j) != 0 {
                let child = self.child_node(node, j);
                self.reconstruct_recurs(fields, at, nodes, child)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::code::MAX_DEPTH;
    use crate::occupancy::{OccupancyMap, PropagationCriteria};
    use crate::time::{TimeMap, TimeStep};
    use glam::DVec3;

    type OccTimeTree = Octree<(OccupancyMap, TimeMap)>;

    fn sample_points() -> Vec<DVec3> {
        vec![
            DVec3::new(0.05, 0.05, 0.05),
            DVec3::new(1.05, -0.35, 0.25),
            DVec3::new(-3.05, 2.05, 0.05),
            DVec3::new(0.45, 0.45, 0.45),
        ]
    }

    fn sample_tree() -> OccTimeTree {
        let map = (OccupancyMap::default(), TimeMap);
        let mut t = OccTimeTree::new(map, 0.1, 16).unwrap();
        for (k, p) in sample_points().iter().enumerate() {
            t.insert(*p, (crate::occupancy::Occupancy(0.85), TimeStep(k as u32)))
                .unwrap();
        }
        t.propagate_modified(false, MAX_DEPTH);
        t
    }

    fn assert_same_content(a: &OccTimeTree, b: &OccTimeTree) {
        assert_eq!(a.num_nodes(), b.num_nodes());
        for p in sample_points() {
            assert_eq!(a.value_at(p), b.value_at(p));
        }
    }

    #[test]
    fn header_round_trip() {
        let t = sample_tree();
        let mut buf = Vec::new();
        t.write(&mut buf, true).unwrap();
        let header = read_header(&mut buf.as_slice()).unwrap();
        assert_eq!(header.leaf_size, 0.1);
        assert_eq!(header.depth_levels, 16);
        assert!(header.compressed);
        assert!(t.can_merge(&header));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = vec![0u8; 64];
        buf[0] = b'x';
        assert!(matches!(
            read_header(&mut buf.as_slice()),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn round_trip_uncompressed() {
        let t = sample_tree();
        let mut buf = Vec::new();
        t.write(&mut buf, false).unwrap();
        let map = (OccupancyMap::default(), TimeMap);
        let mut back = OccTimeTree::new(map, 0.1, 16).unwrap();
        back.read(&mut buf.as_slice(), true).unwrap();
        assert_same_content(&t, &back);
    }

    #[test]
    fn round_trip_compressed() {
        let t = sample_tree();
        let mut buf = Vec::new();
        t.write(&mut buf, true).unwrap();
        let map = (OccupancyMap::default(), TimeMap);
        let mut back = OccTimeTree::new(map, 0.1, 16).unwrap();
        back.read(&mut buf.as_slice(), true).unwrap();
        assert_same_content(&t, &back);
    }

    #[test]
    fn read_resizes_on_geometry_mismatch() {
        let t = sample_tree();
        let mut buf = Vec::new();
        t.write(&mut buf, false).unwrap();
        let map = (OccupancyMap::default(), TimeMap);
        let mut back = OccTimeTree::new(map, 0.25, 10).unwrap();
        back.read(&mut buf.as_slice(), true).unwrap();
        assert_eq!(back.leaf_size(), 0.1);
        assert_eq!(back.depth_levels(), 16);
        assert_same_content(&t, &back);
    }

    #[test]
    fn unknown_stream_tag_is_skipped() {
        let t = sample_tree();
        let mut buf = Vec::new();
        t.write(&mut buf, false).unwrap();
        // Append a stream with a tag no map claims.
        write_frame(&mut buf, 1 << 12, &[1, 2, 3, 4], false).unwrap();
        let map = (OccupancyMap::default(), TimeMap);
        let mut back = OccTimeTree::new(map, 0.1, 16).unwrap();
        back.read(&mut buf.as_slice(), true).unwrap();
        assert_same_content(&t, &back);
    }

    #[test]
    fn truncated_payload_stream_errors() {
        let t = sample_tree();
        let mut buf = Vec::new();
        t.write(&mut buf, false).unwrap();
        buf.truncate(buf.len() - 3);
        let map = (OccupancyMap::default(), TimeMap);
        let mut back = OccTimeTree::new(map, 0.1, 16).unwrap();
        assert!(back.read(&mut buf.as_slice(), true).is_err());
    }

    #[test]
    fn write_with_min_depth_coarsens() {
        let t = sample_tree();
        let mut full = Vec::new();
        t.write(&mut full, false).unwrap();
        let mut coarse = Vec::new();
        t.write_with(&mut coarse, True, 4, false).unwrap();
        assert!(coarse.len() < full.len());
        let map = (OccupancyMap::default(), TimeMap);
        let mut back = OccTimeTree::new(map, 0.1, 16).unwrap();
        back.read(&mut coarse.as_slice(), true).unwrap();
        // Nothing in the coarse file reaches depth 0.
        for p in sample_points() {
            let code = back.to_code(p, 0);
            assert!(back.node(code).data_depth() >= 4);
        }
    }

    #[test]
    fn modified_frontier_write_covers_new_changes_only() {
        let mut t = sample_tree();
        // Everything is propagated, nothing is modified: the write is empty
        // of payload nodes but still well formed.
        let mut empty = Vec::new();
        t.write_modified_and_reset(&mut empty, false).unwrap();
        let map = (OccupancyMap::default(), TimeMap);
        let mut back = OccTimeTree::new(map, 0.1, 16).unwrap();
        back.read(&mut empty.as_slice(), true).unwrap();
        assert_eq!(back.num_nodes(), 1);

        // A fresh change makes the next frontier write non-empty.
        let p = DVec3::new(7.05, 7.05, 7.05);
        t.insert(p, (crate::occupancy::Occupancy(0.6), TimeStep(9)))
            .unwrap();
        let mut delta = Vec::new();
        t.write_modified_and_reset(&mut delta, false).unwrap();
        assert_eq!(t.count_modified_nodes(), 0);
        let map = (OccupancyMap::default(), TimeMap);
        let mut back = OccTimeTree::new(map, 0.1, 16).unwrap();
        back.read(&mut delta.as_slice(), true).unwrap();
        assert_eq!(
            back.value_at(p),
            Some((crate::occupancy::Occupancy(0.6), TimeStep(9)))
        );
    }

    #[test]
    fn occupancy_survives_round_trip_exactly() {
        let map = OccupancyMap::default().with_criteria(PropagationCriteria::Max);
        let mut t = Octree::new(map, 0.05, 14).unwrap();
        let p = DVec3::new(0.025, 0.025, 0.025);
        t.set_occupancy_logit(p, 0.42, true).unwrap();
        let mut buf = Vec::new();
        t.write(&mut buf, true).unwrap();
        let mut back = Octree::new(OccupancyMap::default(), 0.05, 14).unwrap();
        back.read(&mut buf.as_slice(), true).unwrap();
        assert_eq!(back.occupancy_at(p).unwrap().logit(), 0.42);
    }
}
