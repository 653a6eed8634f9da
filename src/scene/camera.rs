//! Pinhole camera.

use glam::{Mat3, Quat, Vec3};

use crate::layout::PackedCamera;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    /// Unit forward vector.
    pub view: Vec3,
    /// Unit up vector, orthogonal to `view`.
    pub up: Vec3,
    /// Unit right vector, `view x up`.
    pub right: Vec3,
    /// tan(vertical fov / 2).
    pub tan_fov: f32,
    pub aspect_ratio: f32,
}

impl Camera {
    /// Camera at `position` looking along `forward`; `up` is re-orthogonalized.
    pub fn new(
        position: Vec3,
        forward: Vec3,
        up: Vec3,
        fov_degrees: f32,
        aspect_ratio: f32,
    ) -> Self {
        let tan_fov = (fov_degrees.to_radians() * 0.5).tan();
        Self::with_tan_fov(position, forward, up, tan_fov, aspect_ratio)
    }

    pub fn with_tan_fov(
        position: Vec3,
        forward: Vec3,
        up: Vec3,
        tan_fov: f32,
        aspect_ratio: f32,
    ) -> Self {
        let view = forward.normalize();
        let right = view.cross(up).normalize();
        let up = right.cross(view);
        Self {
            position,
            view,
            up,
            right,
            tan_fov,
            aspect_ratio,
        }
    }

    /// Rotation from camera space (x right, y down, z forward) to world.
    pub fn rotation(&self) -> Quat {
        Quat::from_mat3(&Mat3::from_cols(self.right, -self.up, self.view)).normalize()
    }

    pub fn pack(&self) -> PackedCamera {
        PackedCamera {
            rotation: self.rotation().to_array(),
            pos_and_tan_fov: self.position.extend(self.tan_fov).to_array(),
        }
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y, 90.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basis_is_orthonormal() {
        let cam = Camera::new(Vec3::ONE, Vec3::new(1.0, -0.2, 1.0), Vec3::Y, 60.0, 1.5);
        assert!((cam.view.length() - 1.0).abs() < 1e-5);
        assert!(cam.view.dot(cam.up).abs() < 1e-5);
        assert!(cam.right.dot(cam.up).abs() < 1e-5);
        assert!((cam.tan_fov - 30f32.to_radians().tan()).abs() < 1e-6);
    }

    #[test]
    fn test_pack_rotation_maps_axes() {
        let cam = Camera::new(Vec3::new(1.0, 2.0, 3.0), Vec3::NEG_Z, Vec3::Y, 90.0, 1.0);
        let packed = cam.pack();
        let q = packed.rotation();
        assert!((q * Vec3::Z - Vec3::NEG_Z).length() < 1e-5);
        assert!((q * Vec3::X - Vec3::X).length() < 1e-5);
        assert!((q * Vec3::Y - Vec3::NEG_Y).length() < 1e-5);
        assert_eq!(packed.pos_and_tan_fov[..3], [1.0, 2.0, 3.0]);
        assert!((packed.pos_and_tan_fov[3] - 1.0).abs() < 1e-5);
    }
}
