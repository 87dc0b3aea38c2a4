//! Per-node RGB color, averaged over colored children on propagation.

use std::io::Write;

use glam::DVec3;

use crate::code::Code;
use crate::error::{Error, Result};
use crate::lock::LockPolicy;
use crate::map::AttributeMap;
use crate::tree::Octree;

/// Per-node color payload. All-zero means "not colored"; such children are
/// ignored when averaging.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    #[inline]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    #[inline]
    pub fn is_set(self) -> bool {
        self != Self::default()
    }

    /// Component-wise mean of the colored inputs.
    pub fn average(colors: impl IntoIterator<Item = Rgb>) -> Rgb {
        let (mut r, mut g, mut b, mut n) = (0u32, 0u32, 0u32, 0u32);
        for c in colors {
            if c.is_set() {
                r += c.r as u32;
                g += c.g as u32;
                b += c.b as u32;
                n += 1;
            }
        }
        if n == 0 {
            return Rgb::default();
        }
        Rgb::new((r / n) as u8, (g / n) as u8, (b / n) as u8)
    }
}

/// The color attribute map.
#[derive(Clone, Copy, Debug, Default)]
pub struct ColorMap;

impl AttributeMap for ColorMap {
    type Node = Rgb;
    const MAP_TYPE: u16 = 1 << 2;

    fn update_node(&self, parent: &mut Rgb, children: [&Rgb; 8]) {
        *parent = Rgb::average(children.into_iter().copied());
    }

    fn is_collapsible(&self, parent: &Rgb, children: [&Rgb; 8]) -> bool {
        children.into_iter().all(|c| c == parent)
    }

    fn serialized_size(&self) -> Option<usize> {
        Some(3)
    }

    fn write_streams<'a, W, I>(&self, out: &mut W, nodes: I, compress: bool) -> Result<()>
    where
        W: Write,
        I: Iterator<Item = &'a Rgb> + Clone,
    {
        let mut payload = Vec::new();
        for n in nodes {
            payload.extend_from_slice(&[n.r, n.g, n.b]);
        }
        crate::io::write_frame(out, Self::MAP_TYPE, &payload, compress)
    }

    fn read_stream<'a, I>(&self, tag: u16, bytes: &[u8], nodes: I) -> Result<bool>
    where
        I: Iterator<Item = &'a mut Rgb>,
    {
        if !Self::can_read(tag) {
            return Ok(false);
        }
        let mut chunks = bytes.chunks_exact(3);
        for node in nodes {
            let chunk = chunks
                .next()
                .ok_or_else(|| Error::Structure("color stream too short".into()))?;
            *node = Rgb::new(chunk[0], chunk[1], chunk[2]);
        }
        if !chunks.remainder().is_empty() || chunks.next().is_some() {
            return Err(Error::Structure("color stream too long".into()));
        }
        Ok(true)
    }
}

/// Projects the color component out of a (possibly composed) payload.
pub trait AsColor {
    fn color(&self) -> Rgb;
    fn color_mut(&mut self) -> &mut Rgb;
}

impl AsColor for Rgb {
    #[inline]
    fn color(&self) -> Rgb {
        *self
    }

    #[inline]
    fn color_mut(&mut self) -> &mut Rgb {
        self
    }
}

impl<A> AsColor for (A, Rgb) {
    #[inline]
    fn color(&self) -> Rgb {
        self.1
    }

    #[inline]
    fn color_mut(&mut self) -> &mut Rgb {
        &mut self.1
    }
}

impl<A, B> AsColor for (A, B, Rgb) {
    #[inline]
    fn color(&self) -> Rgb {
        self.2
    }

    #[inline]
    fn color_mut(&mut self) -> &mut Rgb {
        &mut self.2
    }
}

/// Projects the color map out of a composed map.
pub trait HasColorMap: AttributeMap {
    fn color_map(&self) -> &ColorMap;
}

impl HasColorMap for ColorMap {
    #[inline]
    fn color_map(&self) -> &ColorMap {
        self
    }
}

impl<A: AttributeMap> HasColorMap for (A, ColorMap) {
    #[inline]
    fn color_map(&self) -> &ColorMap {
        &self.1
    }
}

impl<A: AttributeMap, B: AttributeMap> HasColorMap for (A, B, ColorMap) {
    #[inline]
    fn color_map(&self) -> &ColorMap {
        &self.2
    }
}

impl<M, L> Octree<M, L>
where
    M: HasColorMap,
    M::Node: AsColor,
    L: LockPolicy,
{
    pub fn color(&self, code: Code) -> Rgb {
        self.value(code).color()
    }

    pub fn color_at(&self, coord: DVec3) -> Option<Rgb> {
        self.value_at(coord).map(|n| n.color())
    }

    /// Colors the depth-0 node containing `coord`.
    pub fn set_color(&mut self, coord: DVec3, color: Rgb, propagate: bool) -> Result<()> {
        let code = self
            .to_code_checked(coord, 0)
            .ok_or_else(|| Error::OutOfBounds(format!("coordinate {coord:?}")))?;
        self.apply(
            code,
            |n| *n.color_mut() = color,
            |b| b.iter_mut().for_each(|n| *n.color_mut() = color),
            propagate,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn average_ignores_unset() {
        let colors = [
            Rgb::new(100, 0, 0),
            Rgb::new(200, 0, 0),
            Rgb::default(),
            Rgb::default(),
        ];
        assert_eq!(Rgb::average(colors), Rgb::new(150, 0, 0));
        assert_eq!(Rgb::average([Rgb::default(); 8]), Rgb::default());
    }

    #[test]
    fn update_node_averages_children() {
        let map = ColorMap;
        let children_vals: [Rgb; 8] = [
            Rgb::new(10, 20, 30),
            Rgb::new(30, 40, 50),
            Rgb::default(),
            Rgb::default(),
            Rgb::default(),
            Rgb::default(),
            Rgb::default(),
            Rgb::default(),
        ];
        let children: [&Rgb; 8] = std::array::from_fn(|i| &children_vals[i]);
        let mut parent = Rgb::default();
        map.update_node(&mut parent, children);
        assert_eq!(parent, Rgb::new(20, 30, 40));
    }
}
