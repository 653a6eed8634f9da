//! Scene-side collaborators of the render engine.
//!
//! Asset loading and BLAS construction happen elsewhere; a loader hands
//! the renderer a [`SceneDesc`] and gets back a shared [`Scene`]. Each
//! [`Environment`] instantiates a scene with its own camera, instances and
//! lights.

mod camera;
mod environment;
mod envmap;
mod registry;

pub use camera::*;
pub use environment::*;
pub use envmap::*;
pub use registry::*;

use bytemuck::{Pod, Zeroable};

use crate::accel::Blas;
use crate::layout::{InstanceFlags, InstanceTransform, ObjectInstance, PackedLight};
use crate::util::Aabb;

/// Static per-object metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectInfo {
    /// Index of the object's first mesh.
    pub mesh_offset: u32,
    pub num_meshes: u32,
}

/// Device addresses of a scene's geometry and material data, as stored in
/// the shared scene table (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct SceneAddresses {
    pub vertex_addr: u64,
    pub index_addr: u64,
    pub material_addr: u64,
    pub mesh_info_addr: u64,
}

/// Instance placed in every new environment of a scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DefaultInstance {
    pub instance: ObjectInstance,
    pub transform: InstanceTransform,
    pub flags: InstanceFlags,
}

/// Loader output used to register a scene.
#[derive(Debug, Clone, Default)]
pub struct SceneDesc {
    pub objects: Vec<ObjectInfo>,
    /// One prebuilt BLAS per object.
    pub blases: Vec<Blas>,
    pub addresses: SceneAddresses,
    pub default_instances: Vec<DefaultInstance>,
    pub default_lights: Vec<PackedLight>,
    /// Bounds of the default environment; probe grids span this box.
    pub env_bounds: Aabb,
}

/// Registered scene. Its ID slot is released when the last `Arc` drops.
#[derive(Debug)]
pub struct Scene {
    id: SceneId,
    desc: SceneDesc,
}

impl Scene {
    pub(crate) fn new(id: SceneId, desc: SceneDesc) -> Self {
        Self { id, desc }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id.get()
    }

    pub fn objects(&self) -> &[ObjectInfo] {
        &self.desc.objects
    }

    pub fn blases(&self) -> &[Blas] {
        &self.desc.blases
    }

    pub fn addresses(&self) -> &SceneAddresses {
        &self.desc.addresses
    }

    pub fn default_instances(&self) -> &[DefaultInstance] {
        &self.desc.default_instances
    }

    pub fn default_lights(&self) -> &[PackedLight] {
        &self.desc.default_lights
    }

    pub fn env_bounds(&self) -> Aabb {
        self.desc.env_bounds
    }
}
