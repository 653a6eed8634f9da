//! Per-environment render state.

use std::f32::consts::TAU;
use std::sync::Arc;

use glam::{Affine3A, Quat, Vec3};
use rand::Rng;

use super::{Camera, Scene};
use crate::accel::{Tlas, TlasInput};
use crate::gpu::{CommandList, GpuDevice};
use crate::layout::{InstanceFlags, InstanceTransform, ObjectInstance, PackedLight};
use crate::util::{Error, Result};

/// Random perturbation applied to one environment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainRandomization {
    pub env_rotation: Quat,
    pub light_filter: Vec3,
    pub env_map_idx: u32,
}

impl DomainRandomization {
    /// No perturbation: unrotated first env map, white light filter.
    pub const IDENTITY: Self = Self {
        env_rotation: Quat::IDENTITY,
        light_filter: Vec3::ONE,
        env_map_idx: 0,
    };

    /// Random rotation about +Y, per-channel filter in [0.5, 1], random map.
    pub fn sample(rng: &mut impl Rng, num_env_maps: u32) -> Self {
        Self {
            env_rotation: Quat::from_rotation_y(rng.gen_range(0.0..TAU)),
            light_filter: Vec3::new(
                rng.gen_range(0.5..=1.0),
                rng.gen_range(0.5..=1.0),
                rng.gen_range(0.5..=1.0),
            ),
            env_map_idx: rng.gen_range(0..num_env_maps.max(1)),
        }
    }
}

impl Default for DomainRandomization {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// One instantiation of a scene.
///
/// Owned by the caller. Instance edits mark the environment dirty; the next
/// render rebuilds its TLAS and clears the flag.
pub struct Environment<D: GpuDevice> {
    scene: Arc<Scene>,
    camera: Camera,
    prev_camera: Camera,
    instances: Vec<ObjectInstance>,
    transforms: Vec<InstanceTransform>,
    flags: Vec<InstanceFlags>,
    lights: Vec<PackedLight>,
    dirty: bool,
    tlas: Tlas<D>,
    randomization: DomainRandomization,
}

impl<D: GpuDevice> Environment<D> {
    pub(crate) fn new(
        device: Arc<D>,
        scene: Arc<Scene>,
        camera: Camera,
        randomization: DomainRandomization,
    ) -> Self {
        let defaults = scene.default_instances();
        let instances = defaults.iter().map(|d| d.instance).collect();
        let transforms = defaults.iter().map(|d| d.transform).collect();
        let flags = defaults.iter().map(|d| d.flags).collect();
        let lights = scene.default_lights().to_vec();

        Self {
            scene,
            camera,
            prev_camera: camera,
            instances,
            transforms,
            flags,
            lights,
            dirty: true,
            tlas: Tlas::new(device),
            randomization,
        }
    }

    pub fn scene(&self) -> &Arc<Scene> {
        &self.scene
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
    }

    /// Camera used by the previous rendered frame.
    pub fn prev_camera(&self) -> &Camera {
        &self.prev_camera
    }

    pub fn add_instance(
        &mut self,
        object_idx: u32,
        material_idx: u32,
        transform: &Affine3A,
    ) -> u32 {
        self.instances.push(ObjectInstance { object_idx, material_idx });
        self.transforms.push(InstanceTransform::from_affine(transform));
        self.flags.push(InstanceFlags::NONE);
        self.dirty = true;
        (self.instances.len() - 1) as u32
    }

    /// Remove by swapping the last instance into `idx`.
    pub fn remove_instance(&mut self, idx: u32) -> Result<()> {
        self.check_instance(idx)?;
        let idx = idx as usize;
        self.instances.swap_remove(idx);
        self.transforms.swap_remove(idx);
        self.flags.swap_remove(idx);
        self.dirty = true;
        Ok(())
    }

    pub fn update_transform(&mut self, idx: u32, transform: &Affine3A) -> Result<()> {
        self.check_instance(idx)?;
        self.transforms[idx as usize] = InstanceTransform::from_affine(transform);
        self.dirty = true;
        Ok(())
    }

    pub fn set_instance_flags(&mut self, idx: u32, flags: InstanceFlags) -> Result<()> {
        self.check_instance(idx)?;
        self.flags[idx as usize] = flags;
        self.dirty = true;
        Ok(())
    }

    fn check_instance(&self, idx: u32) -> Result<()> {
        if (idx as usize) < self.instances.len() {
            Ok(())
        } else {
            Err(Error::other(format!(
                "instance {idx} out of range ({} instances)",
                self.instances.len()
            )))
        }
    }

    pub fn instances(&self) -> &[ObjectInstance] {
        &self.instances
    }

    pub fn transforms(&self) -> &[InstanceTransform] {
        &self.transforms
    }

    pub fn instance_flags(&self) -> &[InstanceFlags] {
        &self.flags
    }

    /// Material index of every instance, in instance order.
    pub fn instance_materials(&self) -> Vec<u32> {
        self.instances.iter().map(|i| i.material_idx).collect()
    }

    pub fn add_light(&mut self, position: Vec3, color: Vec3) -> u32 {
        self.lights.push(PackedLight::point(position, color));
        (self.lights.len() - 1) as u32
    }

    /// Remove by swapping the last light into `idx`.
    pub fn remove_light(&mut self, idx: u32) -> Result<()> {
        if idx as usize >= self.lights.len() {
            return Err(Error::other(format!(
                "light {idx} out of range ({} lights)",
                self.lights.len()
            )));
        }
        self.lights.swap_remove(idx as usize);
        Ok(())
    }

    pub fn lights(&self) -> &[PackedLight] {
        &self.lights
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Force a TLAS rebuild on the next render (e.g. after BLAS updates).
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn randomization(&self) -> &DomainRandomization {
        &self.randomization
    }

    pub fn tlas(&self) -> &Tlas<D> {
        &self.tlas
    }

    /// Record a TLAS rebuild if dirty, then clear the flag. Returns whether a
    /// build was recorded. The renderer re-marks the environment if the
    /// frame holding the build fails before submission.
    pub(crate) fn rebuild_tlas(&mut self, cmd: &mut CommandList) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let input = TlasInput {
            instances: &self.instances,
            transforms: &self.transforms,
            flags: &self.flags,
            objects: self.scene.objects(),
            blases: self.scene.blases(),
        };
        self.tlas.build(&input, cmd)?;
        self.dirty = false;
        Ok(true)
    }

    /// Remember the camera just rendered for temporal reuse next frame.
    pub(crate) fn advance_camera(&mut self) {
        self.prev_camera = self.camera;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::Blas;
    use crate::gpu::HeadlessDevice;
    use crate::scene::{ObjectInfo, SceneDesc, SharedSceneState, SceneAddresses};
    use crate::gpu::{BindGroupHandle, BufferDesc, GpuBuffer};
    use crate::util::Aabb;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn make_env() -> Environment<HeadlessDevice> {
        let dev = Arc::new(HeadlessDevice::default());
        let table = GpuBuffer::new(&dev, &BufferDesc::staging("scene table", 64)).unwrap();
        let shared = SharedSceneState::new(dev.clone(), table, BindGroupHandle(0), 2);
        let id = shared.register(&SceneAddresses::default()).unwrap();
        let desc = SceneDesc {
            objects: vec![ObjectInfo { mesh_offset: 0, num_meshes: 1 }],
            blases: vec![Blas { address: 1, bounds: Aabb::new(Vec3::ZERO, Vec3::ONE) }],
            ..Default::default()
        };
        let scene = Arc::new(Scene::new(id, desc));
        Environment::new(dev, scene, Camera::default(), DomainRandomization::IDENTITY)
    }

    #[test]
    fn test_lights_swap_remove() {
        let mut env = make_env();
        let a = env.add_light(Vec3::X, Vec3::ONE);
        let _b = env.add_light(Vec3::Y, Vec3::ONE);
        let c = env.add_light(Vec3::Z, Vec3::ONE);
        assert_eq!((a, c), (0, 2));
        env.remove_light(a).unwrap();
        assert_eq!(env.lights().len(), 2);
        assert_eq!(env.lights()[0].position, [0.0, 0.0, 1.0]);
        assert!(env.remove_light(5).is_err());
    }

    #[test]
    fn test_dirty_tracking() {
        let mut env = make_env();
        assert!(env.is_dirty());
        let mut cmd = CommandList::new();
        assert!(env.rebuild_tlas(&mut cmd).unwrap());
        assert!(!env.is_dirty());
        assert!(!env.rebuild_tlas(&mut cmd).unwrap());
        assert_eq!(cmd.len(), 1);

        let idx = env.add_instance(0, 3, &Affine3A::IDENTITY);
        assert!(env.is_dirty());
        assert!(env.rebuild_tlas(&mut cmd).unwrap());
        assert_eq!(env.tlas().num_instances(), 1);
        assert_eq!(env.instance_materials(), vec![3]);

        env.update_transform(idx, &Affine3A::from_translation(Vec3::X)).unwrap();
        assert!(env.is_dirty());
        assert!(env.update_transform(9, &Affine3A::IDENTITY).is_err());
    }

    #[test]
    fn test_seeded_randomization_is_deterministic() {
        let a = DomainRandomization::sample(&mut StdRng::seed_from_u64(11), 4);
        let b = DomainRandomization::sample(&mut StdRng::seed_from_u64(11), 4);
        assert_eq!(a, b);
        assert!(a.env_map_idx < 4);
        assert!(a.light_filter.min_element() >= 0.5 && a.light_filter.max_element() <= 1.0);
    }
}
