//! Host/GPU shared structs.
//!
//! Every struct here is `#[repr(C)]` + `Pod` and mirrors a kernel-side
//! declaration byte for byte, so field order and padding are load-bearing.

use bytemuck::{Pod, Zeroable};
use glam::{Affine3A, Quat, Vec3};

/// Per-instance object-to-world transform and its inverse (96 bytes).
///
/// Stored as four column vectors of a 3x4 affine matrix.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceTransform {
    pub mat: [[f32; 3]; 4],
    pub inv: [[f32; 3]; 4],
}

impl InstanceTransform {
    pub fn from_affine(xform: &Affine3A) -> Self {
        Self {
            mat: xform.to_cols_array_2d(),
            inv: xform.inverse().to_cols_array_2d(),
        }
    }

    pub fn affine(&self) -> Affine3A {
        Affine3A::from_cols_array_2d(&self.mat)
    }
}

impl Default for InstanceTransform {
    fn default() -> Self {
        Self::from_affine(&Affine3A::IDENTITY)
    }
}

/// Per-instance ray flags.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct InstanceFlags(pub u32);

impl InstanceFlags {
    pub const NONE: Self = Self(0);
    /// Instance needs alpha testing; rays must not treat it as opaque.
    pub const TRANSPARENT: Self = Self(1);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for InstanceFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Which scene object an instance draws, and with which material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInstance {
    pub object_idx: u32,
    pub material_idx: u32,
}

pub const LIGHT_TYPE_POINT: u32 = 0;

/// One light record (64 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PackedLight {
    pub position: [f32; 3],
    pub light_type: u32,
    pub color: [f32; 3],
    pub _pad: u32,
    pub _reserved: [[f32; 4]; 2],
}

impl PackedLight {
    pub fn point(position: Vec3, color: Vec3) -> Self {
        Self {
            position: position.to_array(),
            light_type: LIGHT_TYPE_POINT,
            color: color.to_array(),
            _pad: 0,
            _reserved: [[0.0; 4]; 2],
        }
    }
}

/// Camera as a rotation plus position and tan(fov/2) (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct PackedCamera {
    /// Quaternion (x, y, z, w) taking camera space to world space.
    pub rotation: [f32; 4],
    /// xyz = position, w = tan(fov/2).
    pub pos_and_tan_fov: [f32; 4],
}

impl PackedCamera {
    pub fn rotation(&self) -> Quat {
        Quat::from_array(self.rotation)
    }
}

/// Per-environment record consumed by the path tracer (128 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct PackedEnv {
    pub cam: PackedCamera,
    pub prev_cam: PackedCamera,
    /// x = scene id, y = first instance/material slot, z = first light, w = light count.
    pub data: [u32; 4],
    pub tlas_addr: u64,
    pub reservoir_grid_addr: u64,
    pub env_map_rotation: [f32; 4],
    /// xyz = light color filter, w = env map index (as float).
    pub light_filter_and_env_idx: [f32; 4],
}

/// One unit of adaptive work: a tile of one batch image at a sample offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct InputTile {
    pub batch_idx: u32,
    pub x_offset: u32,
    pub y_offset: u32,
    pub sample_offset: u32,
}

/// Running per-tile statistics written by the path tracer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct AdaptiveTile {
    pub tile_mean: f32,
    pub tile_variance_m2: f32,
    pub num_samples: u32,
    pub spin_lock: u32,
}

/// Size of one reservoir record. Kernels own its layout.
pub const RESERVOIR_BYTES: u64 = 32;

/// Push constants shared by the path-tracing and bake pipelines (64 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct RtPushConstant {
    pub frame_counter: u32,
    pub probe_idx: u32,
    pub _pad: [u32; 2],
    pub probe_dim: [u32; 4],
    pub probe_bbox_min: [f32; 4],
    pub probe_bbox_max: [f32; 4],
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<InstanceTransform>(), 96);
        assert_eq!(size_of::<PackedLight>(), 64);
        assert_eq!(size_of::<PackedCamera>(), 32);
        assert_eq!(size_of::<PackedEnv>(), 128);
        assert_eq!(size_of::<InputTile>(), 16);
        assert_eq!(size_of::<AdaptiveTile>(), 16);
        assert_eq!(size_of::<RtPushConstant>(), 64);
    }

    #[test]
    fn test_transform_inverse() {
        let xform = Affine3A::from_scale_rotation_translation(
            Vec3::splat(2.0),
            Quat::from_rotation_y(0.5),
            Vec3::new(1.0, 2.0, 3.0),
        );
        let packed = InstanceTransform::from_affine(&xform);
        let inv = Affine3A::from_cols_array_2d(&packed.inv);
        let p = Vec3::new(0.3, -1.0, 4.0);
        let back = inv.transform_point3(packed.affine().transform_point3(p));
        assert!((back - p).length() < 1e-5);
    }

    #[test]
    fn test_instance_flags() {
        let f = InstanceFlags::NONE | InstanceFlags::TRANSPARENT;
        assert!(f.contains(InstanceFlags::TRANSPARENT));
        assert!(!InstanceFlags::NONE.contains(InstanceFlags::TRANSPARENT));
    }
}
