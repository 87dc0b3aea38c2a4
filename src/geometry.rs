//! Axis-aligned boxes and the distance predicates used by nearest queries.

use glam::DVec3;
use ndshape::{ConstPow2Shape3u32, ConstShape};

use crate::ChildIndex;

/// The 2x2x2 arrangement of a block's siblings.
type ChildShape = ConstPow2Shape3u32<1, 1, 1>;

/// An axis-aligned box stored as center plus half edge length (cubes only,
/// which is all the tree produces).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub center: DVec3,
    pub half_size: f64,
}

impl Aabb {
    #[inline]
    pub const fn new(center: DVec3, half_size: f64) -> Self {
        Self { center, half_size }
    }

    #[inline]
    pub fn min(&self) -> DVec3 {
        self.center - DVec3::splat(self.half_size)
    }

    #[inline]
    pub fn max(&self) -> DVec3 {
        self.center + DVec3::splat(self.half_size)
    }

    #[inline]
    pub fn size(&self) -> f64 {
        2.0 * self.half_size
    }

    #[inline]
    pub fn contains(&self, point: DVec3) -> bool {
        let min = self.min();
        let max = self.max();
        min.x <= point.x
            && point.x <= max.x
            && min.y <= point.y
            && point.y <= max.y
            && min.z <= point.z
            && point.z <= max.z
    }

    #[inline]
    pub fn intersects(&self, other: &Aabb) -> bool {
        let d = (self.center - other.center).abs();
        let r = self.half_size + other.half_size;
        d.x <= r && d.y <= r && d.z <= r
    }

    /// Squared distance from `point` to the closest point of the box. Zero
    /// inside.
    #[inline]
    pub fn distance_sq_to_point(&self, point: DVec3) -> f64 {
        let gap = ((point - self.center).abs() - DVec3::splat(self.half_size)).max(DVec3::ZERO);
        gap.length_squared()
    }

    /// Squared distance between the closest points of two boxes. Zero when
    /// they overlap.
    #[inline]
    pub fn distance_sq_to_aabb(&self, other: &Aabb) -> f64 {
        let gap = ((self.center - other.center).abs()
            - DVec3::splat(self.half_size + other.half_size))
        .max(DVec3::ZERO);
        gap.length_squared()
    }

    /// The box of child `index`, half the size, offset toward that octant.
    #[inline]
    pub fn child(&self, index: ChildIndex) -> Aabb {
        let h = self.half_size * 0.5;
        let [x, y, z] = ChildShape::delinearize(index as u32);
        let offset = DVec3::new(
            if x != 0 { h } else { -h },
            if y != 0 { h } else { -h },
            if z != 0 { h } else { -h },
        );
        Aabb::new(self.center + offset, h)
    }
}

/// A sphere, for radius queries.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Sphere {
    pub center: DVec3,
    pub radius: f64,
}

impl Sphere {
    #[inline]
    pub const fn new(center: DVec3, radius: f64) -> Self {
        Self { center, radius }
    }
}

/// Opaque distance predicate driving nearest-first traversal: a lower bound
/// on the squared distance from the query geometry to a node's box.
pub trait Geometry {
    fn distance_sq(&self, aabb: &Aabb) -> f64;

    /// Whether the geometry touches the box at all.
    #[inline]
    fn intersects(&self, aabb: &Aabb) -> bool {
        self.distance_sq(aabb) == 0.0
    }
}

impl Geometry for DVec3 {
    #[inline]
    fn distance_sq(&self, aabb: &Aabb) -> f64 {
        aabb.distance_sq_to_point(*self)
    }
}

impl Geometry for Aabb {
    #[inline]
    fn distance_sq(&self, aabb: &Aabb) -> f64 {
        aabb.distance_sq_to_aabb(self)
    }
}

impl Geometry for Sphere {
    #[inline]
    fn distance_sq(&self, aabb: &Aabb) -> f64 {
        let d = aabb.distance_sq_to_point(self.center).sqrt() - self.radius;
        if d <= 0.0 {
            0.0
        } else {
            d * d
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn point_distance() {
        let b = Aabb::new(DVec3::ZERO, 1.0);
        assert_eq!(b.distance_sq_to_point(DVec3::new(0.5, -0.5, 0.0)), 0.0);
        assert_eq!(b.distance_sq_to_point(DVec3::new(3.0, 0.0, 0.0)), 4.0);
        assert_eq!(b.distance_sq_to_point(DVec3::new(2.0, 2.0, 0.0)), 2.0);
    }

    #[test]
    fn aabb_distance() {
        let a = Aabb::new(DVec3::ZERO, 1.0);
        let b = Aabb::new(DVec3::new(4.0, 0.0, 0.0), 1.0);
        assert_eq!(a.distance_sq_to_aabb(&b), 4.0);
        assert!(a.intersects(&Aabb::new(DVec3::new(1.5, 0.0, 0.0), 1.0)));
    }

    #[test]
    fn sphere_distance() {
        let b = Aabb::new(DVec3::ZERO, 1.0);
        let s = Sphere::new(DVec3::new(5.0, 0.0, 0.0), 2.0);
        assert_eq!(s.distance_sq(&b), 4.0);
        assert!(Sphere::new(DVec3::new(2.0, 0.0, 0.0), 1.5).intersects(&b));
    }

    #[test]
    fn children_tile_the_parent() {
        let b = Aabb::new(DVec3::new(1.0, 1.0, 1.0), 2.0);
        // Child 0 is the low corner, child 7 the high corner.
        assert_eq!(b.child(0).center, DVec3::new(0.0, 0.0, 0.0));
        assert_eq!(b.child(7).center, DVec3::new(2.0, 2.0, 2.0));
        assert_eq!(b.child(1).center, DVec3::new(2.0, 0.0, 0.0));
        assert_eq!(b.child(2).center, DVec3::new(0.0, 2.0, 0.0));
        assert_eq!(b.child(4).center, DVec3::new(0.0, 0.0, 2.0));
        for i in 0..8 {
            assert_eq!(b.child(i).half_size, 1.0);
        }
    }
}
