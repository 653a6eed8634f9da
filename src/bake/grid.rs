//! Probe grid over a scene's default environment bounds.

use glam::Vec3;

use crate::util::Aabb;

/// Probe counts along x, y and z used when no other grid is configured.
pub const DEFAULT_PROBE_GRID: [u32; 3] = [3, 3, 3];

/// Regular 3D grid of probe positions spanning `bounds`, boundary planes
/// included. Linear index is `x + y * dx + z * dx * dy`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeGrid {
    pub dims: [u32; 3],
    pub bounds: Aabb,
}

impl ProbeGrid {
    pub fn new(dims: [u32; 3], bounds: Aabb) -> Self {
        Self { dims, bounds }
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.dims.iter().product()
    }

    /// Dimensions as stored in the probe file header.
    pub fn header_dims(&self) -> [i32; 3] {
        self.dims.map(|d| d as i32)
    }

    pub fn coords(&self, idx: u32) -> [u32; 3] {
        let [dx, dy, _] = self.dims;
        [idx % dx, (idx / dx) % dy, idx / (dx * dy)]
    }

    pub fn index(&self, [x, y, z]: [u32; 3]) -> u32 {
        let [dx, dy, _] = self.dims;
        x + y * dx + z * dx * dy
    }

    /// World position of probe `idx`. The first and last probe on an axis
    /// sit exactly on the box faces; a single probe sits on the min face.
    pub fn position(&self, idx: u32) -> Vec3 {
        let coords = self.coords(idx);
        let min = self.bounds.min.to_array();
        let max = self.bounds.max.to_array();
        let mut out = [0.0f32; 3];
        for axis in 0..3 {
            let (d, c) = (self.dims[axis], coords[axis]);
            out[axis] = if d <= 1 || c == 0 {
                min[axis]
            } else if c == d - 1 {
                max[axis]
            } else {
                let step = (max[axis] - min[axis]) / (d - 1) as f32;
                min[axis] + step * c as f32
            };
        }
        Vec3::from_array(out)
    }

    /// Positions of probes `first..count`, in bake order.
    pub fn positions_from(&self, first: u32) -> Vec<Vec3> {
        (first..self.count()).map(|idx| self.position(idx)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> ProbeGrid {
        ProbeGrid::new([3, 3, 3], Aabb::new(Vec3::ZERO, Vec3::splat(2.0)))
    }

    #[test]
    fn test_center_probe() {
        let g = grid();
        assert_eq!(g.count(), 27);
        assert_eq!(g.coords(13), [1, 1, 1]);
        assert_eq!(g.position(13), Vec3::ONE);
        assert_eq!(g.index([1, 1, 1]), 13);
    }

    #[test]
    fn test_boundaries_exact() {
        let g = ProbeGrid::new(
            [4, 7, 3],
            Aabb::new(Vec3::new(-1.3, 0.1, 5.0), Vec3::new(2.9, 0.7, 11.1)),
        );
        assert_eq!(g.position(0), g.bounds.min);
        assert_eq!(g.position(g.count() - 1), g.bounds.max);
        let last_x = g.position(g.index([3, 0, 0]));
        assert_eq!(last_x.x, 2.9);
        assert_eq!(last_x.y, 0.1);
    }

    #[test]
    fn test_single_probe_axis() {
        let g = ProbeGrid::new([1, 2, 1], Aabb::new(Vec3::ZERO, Vec3::ONE));
        assert_eq!(g.position(1), Vec3::new(0.0, 1.0, 0.0));
        assert_eq!(g.positions_from(1).len(), 1);
    }
}
