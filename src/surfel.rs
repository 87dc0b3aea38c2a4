//! Surface elements: per-node planar patch estimates.
//!
//! A surfel accumulates the first and second moments of the points that hit
//! a node, which makes merging two surfels a sum and removing a point a
//! subtraction. Mean, normal, and planarity come out of the accumulated
//! covariance; the normal is the eigenvector of its smallest eigenvalue.

use std::io::Write;

use glam::{DVec3, Vec3};

use crate::code::Code;
use crate::error::{Error, Result};
use crate::lock::LockPolicy;
use crate::map::AttributeMap;
use crate::tree::Octree;

/// Per-node surfel payload: point sum, second moments, and a point count.
/// The second moments are stored as `[xx, xy, xz, yy, yz, zz]`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Surfel {
    sum: Vec3,
    sum_squares: [f32; 6],
    num_points: u32,
}

impl Surfel {
    pub fn from_point(point: Vec3) -> Self {
        let mut s = Self::default();
        s.add_point(point);
        s
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_points == 0
    }

    #[inline]
    pub fn num_points(&self) -> u32 {
        self.num_points
    }

    #[inline]
    pub fn sum(&self) -> Vec3 {
        self.sum
    }

    #[inline]
    pub fn sum_squares(&self) -> [f32; 6] {
        self.sum_squares
    }

    pub fn add_point(&mut self, p: Vec3) {
        self.sum += p;
        self.sum_squares[0] += p.x * p.x;
        self.sum_squares[1] += p.x * p.y;
        self.sum_squares[2] += p.x * p.z;
        self.sum_squares[3] += p.y * p.y;
        self.sum_squares[4] += p.y * p.z;
        self.sum_squares[5] += p.z * p.z;
        self.num_points += 1;
    }

    /// Removes a previously added point. Removing beyond empty resets the
    /// accumulators.
    pub fn remove_point(&mut self, p: Vec3) {
        if self.num_points <= 1 {
            self.clear();
            return;
        }
        self.sum -= p;
        self.sum_squares[0] -= p.x * p.x;
        self.sum_squares[1] -= p.x * p.y;
        self.sum_squares[2] -= p.x * p.z;
        self.sum_squares[3] -= p.y * p.y;
        self.sum_squares[4] -= p.y * p.z;
        self.sum_squares[5] -= p.z * p.z;
        self.num_points -= 1;
    }

    /// Merges another surfel's accumulators into this one.
    pub fn add_surfel(&mut self, other: &Surfel) {
        self.sum += other.sum;
        for (a, b) in self.sum_squares.iter_mut().zip(other.sum_squares) {
            *a += b;
        }
        self.num_points += other.num_points;
    }

    /// Removes another surfel's contribution.
    pub fn remove_surfel(&mut self, other: &Surfel) {
        if other.num_points >= self.num_points {
            self.clear();
            return;
        }
        self.sum -= other.sum;
        for (a, b) in self.sum_squares.iter_mut().zip(other.sum_squares) {
            *a -= b;
        }
        self.num_points -= other.num_points;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn mean(&self) -> Option<Vec3> {
        (self.num_points > 0).then(|| self.sum / self.num_points as f32)
    }

    /// Population covariance, upper triangle `[xx, xy, xz, yy, yz, zz]`.
    pub fn covariance(&self) -> Option<[f32; 6]> {
        let mean = self.mean()?;
        let n = self.num_points as f32;
        Some([
            self.sum_squares[0] / n - mean.x * mean.x,
            self.sum_squares[1] / n - mean.x * mean.y,
            self.sum_squares[2] / n - mean.x * mean.z,
            self.sum_squares[3] / n - mean.y * mean.y,
            self.sum_squares[4] / n - mean.y * mean.z,
            self.sum_squares[5] / n - mean.z * mean.z,
        ])
    }

    /// Covariance eigenvalues, ascending. Needs at least three points for a
    /// meaningful estimate but is defined for any non-empty surfel.
    pub fn eigenvalues(&self) -> Option<[f32; 3]> {
        self.covariance().map(|c| sym_eigenvalues(c))
    }

    /// Unit normal of the fitted plane.
    pub fn normal(&self) -> Option<Vec3> {
        let cov = self.covariance()?;
        let eig = sym_eigenvalues(cov);
        sym_eigenvector(cov, eig[0])
    }

    /// How planar the accumulated points are, in `[0, 1]`.
    pub fn planarity(&self) -> Option<f32> {
        let eig = self.eigenvalues()?;
        let total = eig[0] + eig[1] + eig[2];
        if total <= f32::EPSILON {
            return Some(0.0);
        }
        Some(2.0 * (eig[1] - eig[0]) / total)
    }
}

/// Eigenvalues of the symmetric matrix `[[a,b,c],[b,d,e],[c,e,f]]`,
/// ascending, by the trigonometric closed form.
fn sym_eigenvalues(m: [f32; 6]) -> [f32; 3] {
    let [a, b, c, d, e, f] = m;
    let p1 = b * b + c * c + e * e;
    if p1 <= f32::EPSILON {
        let mut eig = [a, d, f];
        eig.sort_by(f32::total_cmp);
        return eig;
    }
    let q = (a + d + f) / 3.0;
    let p2 = (a - q) * (a - q) + (d - q) * (d - q) + (f - q) * (f - q) + 2.0 * p1;
    let p = (p2 / 6.0).sqrt();
    // B = (A - q I) / p
    let (ba, bd, bf) = ((a - q) / p, (d - q) / p, (f - q) / p);
    let (bb, bc, be) = (b / p, c / p, e / p);
    let det_b = ba * (bd * bf - be * be) - bb * (bb * bf - be * bc) + bc * (bb * be - bd * bc);
    let r = (det_b / 2.0).clamp(-1.0, 1.0);
    let phi = r.acos() / 3.0;
    let eig_hi = q + 2.0 * p * phi.cos();
    let eig_lo = q + 2.0 * p * (phi + 2.0 * std::f32::consts::FRAC_PI_3).cos();
    let eig_mid = 3.0 * q - eig_hi - eig_lo;
    [eig_lo, eig_mid, eig_hi]
}

/// Unit eigenvector of the symmetric matrix for eigenvalue `lambda`, via
/// the cross product of two rows of `A - lambda I`.
fn sym_eigenvector(m: [f32; 6], lambda: f32) -> Option<Vec3> {
    let [a, b, c, d, e, f] = m;
    let r0 = Vec3::new(a - lambda, b, c);
    let r1 = Vec3::new(b, d - lambda, e);
    let r2 = Vec3::new(c, e, f - lambda);
    for v in [r0.cross(r1), r0.cross(r2), r1.cross(r2)] {
        let len_sq = v.length_squared();
        if len_sq > f32::EPSILON {
            return Some(v / len_sq.sqrt());
        }
    }
    None
}

/// The surfel attribute map.
#[derive(Clone, Copy, Debug, Default)]
pub struct SurfelMap;

impl AttributeMap for SurfelMap {
    type Node = Surfel;
    const MAP_TYPE: u16 = 1 << 4;

    fn update_node(&self, parent: &mut Surfel, children: [&Surfel; 8]) {
        let mut merged = Surfel::default();
        for c in children {
            merged.add_surfel(c);
        }
        *parent = merged;
    }

    fn is_collapsible(&self, _parent: &Surfel, children: [&Surfel; 8]) -> bool {
        // Merging populated surfels into one node discards recoverable
        // per-leaf detail, so only empty groups collapse.
        children.into_iter().all(|c| c.is_empty())
    }

    fn serialized_size(&self) -> Option<usize> {
        Some(40)
    }

    fn write_streams<'a, W, I>(&self, out: &mut W, nodes: I, compress: bool) -> Result<()>
    where
        W: Write,
        I: Iterator<Item = &'a Surfel> + Clone,
    {
        let mut payload = Vec::new();
        for n in nodes {
            for v in [n.sum.x, n.sum.y, n.sum.z] {
                payload.extend_from_slice(&v.to_le_bytes());
            }
            for v in n.sum_squares {
                payload.extend_from_slice(&v.to_le_bytes());
            }
            payload.extend_from_slice(&n.num_points.to_le_bytes());
        }
        crate::io::write_frame(out, Self::MAP_TYPE, &payload, compress)
    }

    fn read_stream<'a, I>(&self, tag: u16, bytes: &[u8], nodes: I) -> Result<bool>
    where
        I: Iterator<Item = &'a mut Surfel>,
    {
        if !Self::can_read(tag) {
            return Ok(false);
        }
        let mut chunks = bytes.chunks_exact(40);
        for node in nodes {
            let chunk = chunks
                .next()
                .ok_or_else(|| Error::Structure("surfel stream too short".into()))?;
            let f = |i: usize| {
                f32::from_le_bytes([chunk[4 * i], chunk[4 * i + 1], chunk[4 * i + 2], chunk[4 * i + 3]])
            };
            node.sum = Vec3::new(f(0), f(1), f(2));
            node.sum_squares = [f(3), f(4), f(5), f(6), f(7), f(8)];
            node.num_points = u32::from_le_bytes([chunk[36], chunk[37], chunk[38], chunk[39]]);
        }
        if !chunks.remainder().is_empty() || chunks.next().is_some() {
            return Err(Error::Structure("surfel stream too long".into()));
        }
        Ok(true)
    }
}

/// Projects the surfel component out of a payload.
pub trait AsSurfel {
    fn surfel(&self) -> &Surfel;
    fn surfel_mut(&mut self) -> &mut Surfel;
}

impl AsSurfel for Surfel {
    #[inline]
    fn surfel(&self) -> &Surfel {
        self
    }

    #[inline]
    fn surfel_mut(&mut self) -> &mut Surfel {
        self
    }
}

/// Projects the surfel map out of a composed map.
pub trait HasSurfelMap: AttributeMap {
    fn surfel_map(&self) -> &SurfelMap;
}

impl HasSurfelMap for SurfelMap {
    #[inline]
    fn surfel_map(&self) -> &SurfelMap {
        self
    }
}

impl<M, L> Octree<M, L>
where
    M: HasSurfelMap,
    M::Node: AsSurfel,
    L: LockPolicy,
{
    pub fn surfel(&self, code: Code) -> Surfel {
        *self.value(code).surfel()
    }

    pub fn surfel_at(&self, coord: DVec3) -> Option<Surfel> {
        self.value_at(coord).map(|n| *n.surfel())
    }

    /// Accumulates `coord` into the surfel of its depth-0 node.
    pub fn insert_surfel_point(&mut self, coord: DVec3, propagate: bool) -> Result<()> {
        let code = self
            .to_code_checked(coord, 0)
            .ok_or_else(|| Error::OutOfBounds(format!("coordinate {coord:?}")))?;
        let p = coord.as_vec3();
        self.apply(
            code,
            |n| n.surfel_mut().add_point(p),
            |b| b.iter_mut().for_each(|n| n.surfel_mut().add_point(p)),
            propagate,
        )
    }

    /// Removes a previously accumulated point.
    pub fn erase_surfel_point(&mut self, coord: DVec3, propagate: bool) -> Result<()> {
        let code = self
            .to_code_checked(coord, 0)
            .ok_or_else(|| Error::OutOfBounds(format!("coordinate {coord:?}")))?;
        let p = coord.as_vec3();
        self.apply(
            code,
            |n| n.surfel_mut().remove_point(p),
            |b| b.iter_mut().for_each(|n| n.surfel_mut().remove_point(p)),
            propagate,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn merge_equals_bulk_accumulation() {
        let points = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.1, 0.0),
            Vec3::new(0.0, 1.0, 0.1),
            Vec3::new(1.0, 1.0, 0.0),
        ];
        let mut bulk = Surfel::default();
        for p in points {
            bulk.add_point(p);
        }
        let mut merged = Surfel::default();
        for p in points {
            merged.add_surfel(&Surfel::from_point(p));
        }
        assert_eq!(bulk, merged);
        assert_eq!(bulk.num_points(), 4);
    }

    #[test]
    fn remove_point_restores_accumulators() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(-1.0, 0.5, 2.0);
        let mut s = Surfel::from_point(a);
        let before = s;
        s.add_point(b);
        s.remove_point(b);
        assert_eq!(s.num_points(), before.num_points());
        assert!(close(s.sum().x, before.sum().x));
        assert!(close(s.sum_squares()[3], before.sum_squares()[3]));
    }

    #[test]
    fn planar_points_have_plane_normal() {
        // Points in the z = 2 plane.
        let mut s = Surfel::default();
        for i in 0..4 {
            for j in 0..4 {
                s.add_point(Vec3::new(i as f32, j as f32, 2.0));
            }
        }
        let n = s.normal().unwrap();
        assert!(close(n.x.abs(), 0.0));
        assert!(close(n.y.abs(), 0.0));
        assert!(close(n.z.abs(), 1.0));
        assert!(s.planarity().unwrap() > 0.9);
        let mean = s.mean().unwrap();
        assert!(close(mean.z, 2.0));
    }

    #[test]
    fn eigenvalues_of_axis_aligned_spread() {
        // Variance 0 in z, larger in x than y.
        let mut s = Surfel::default();
        for i in 0..8 {
            s.add_point(Vec3::new(i as f32, (i % 2) as f32, 1.0));
        }
        let eig = s.eigenvalues().unwrap();
        assert!(eig[0] <= eig[1] && eig[1] <= eig[2]);
        assert!(close(eig[0], 0.0));
    }

    #[test]
    fn only_empty_groups_collapse() {
        let map = SurfelMap;
        let empty = Surfel::default();
        let empties: [&Surfel; 8] = [&empty; 8];
        assert!(map.is_collapsible(&empty, empties));
        let full = Surfel::from_point(Vec3::ONE);
        let mixed: [&Surfel; 8] = [&full, &empty, &empty, &empty, &empty, &empty, &empty, &empty];
        assert!(!map.is_collapsible(&empty, mixed));
    }
}
