//! Integer layout helpers and bounding boxes.

use glam::{Affine3A, Vec3};

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` of 0 or 1 leaves the value unchanged.
#[inline]
pub fn align_offset(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Integer division rounding towards positive infinity.
#[inline]
pub fn divide_round_up(value: u32, divisor: u32) -> u32 {
    value.div_ceil(divisor)
}

/// Axis-aligned bounding box in world or object space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// True when nothing has been grown into the box.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Grow to include a point.
    #[inline]
    pub fn grow_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Grow to include another AABB.
    #[inline]
    pub fn grow(&mut self, other: &Aabb) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Surface area (for SAH cost).
    #[inline]
    pub fn area(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let d = self.max - self.min;
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    #[inline]
    pub fn centroid(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Bounds of this box after an affine transform (all 8 corners).
    pub fn transformed(&self, xform: &Affine3A) -> Aabb {
        if self.is_empty() {
            return *self;
        }
        let mut out = Aabb::EMPTY;
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            out.grow_point(xform.transform_point3(corner));
        }
        out
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_offset() {
        assert_eq!(align_offset(0, 256), 0);
        assert_eq!(align_offset(1, 256), 256);
        assert_eq!(align_offset(256, 256), 256);
        assert_eq!(align_offset(257, 64), 320);
        assert_eq!(align_offset(13, 1), 13);
    }

    #[test]
    fn test_divide_round_up() {
        assert_eq!(divide_round_up(64, 8), 8);
        assert_eq!(divide_round_up(65, 8), 9);
        assert_eq!(divide_round_up(1, 8), 1);
    }

    #[test]
    fn test_transformed_aabb() {
        let b = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let moved = b.transformed(&Affine3A::from_translation(Vec3::new(2.0, 0.0, 0.0)));
        assert_eq!(moved.min, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(moved.max, Vec3::new(3.0, 1.0, 1.0));
        assert!(Aabb::EMPTY.transformed(&Affine3A::IDENTITY).is_empty());
    }
}
