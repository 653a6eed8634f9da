//! Top-level acceleration structure.
//!
//! Instance records are prepared on the host in the hardware instance
//! layout, together with a BVH over their world bounds, and written to a
//! staging buffer. The build command recorded into the caller's command
//! list turns that into the device-resident structure.
//!
//! Storage layout: `[TlasHeader][BvhNode; nodes][u32; instances][TlasInstance; instances]`.

use std::mem::size_of;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

use super::bvh::{build_bvh, BvhNode};
use crate::gpu::{BufferDesc, BufferUsage, CommandList, DeviceAddress, GpuBuffer, GpuDevice};
use crate::layout::{InstanceFlags, InstanceTransform, ObjectInstance};
use crate::scene::ObjectInfo;
use crate::util::{align_offset, Aabb, Error, Result};

/// Hardware instance flag: treat geometry as opaque.
pub const INSTANCE_FORCE_OPAQUE: u32 = 0x4;
/// Hardware instance flag: run any-hit for alpha testing.
pub const INSTANCE_FORCE_NO_OPAQUE: u32 = 0x8;

/// Smallest storage allocation.
const MIN_TLAS_BYTES: u64 = 4096;

/// Prebuilt bottom-level structure of one scene object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blas {
    pub address: DeviceAddress,
    /// Object-space bounds.
    pub bounds: Aabb,
}

/// One instance in the hardware layout (64 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TlasInstance {
    /// Row-major 3x4 object-to-world matrix.
    pub transform: [[f32; 4]; 3],
    /// Low 24 bits: custom index (first mesh of the object). High 8: mask.
    pub custom_index_and_mask: u32,
    /// Low 24 bits: hit group offset. High 8: instance flags.
    pub sbt_offset_and_flags: u32,
    pub blas_address: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TlasHeader {
    pub node_count: u32,
    pub instance_count: u32,
    pub nodes_offset: u32,
    pub indices_offset: u32,
    pub instances_offset: u32,
    pub _pad: [u32; 3],
}

/// Everything a rebuild reads.
#[derive(Debug, Clone, Copy)]
pub struct TlasInput<'a> {
    pub instances: &'a [ObjectInstance],
    pub transforms: &'a [InstanceTransform],
    pub flags: &'a [InstanceFlags],
    pub objects: &'a [ObjectInfo],
    pub blases: &'a [Blas],
}

fn instance_record(
    instance: &ObjectInstance,
    transform: &InstanceTransform,
    flags: InstanceFlags,
    objects: &[ObjectInfo],
    blases: &[Blas],
) -> Result<(TlasInstance, Aabb)> {
    let object_idx = instance.object_idx as usize;
    let object = objects
        .get(object_idx)
        .ok_or_else(|| Error::other(format!("instance references missing object {object_idx}")))?;
    let blas = blases
        .get(object_idx)
        .ok_or_else(|| Error::other(format!("object {object_idx} has no BLAS")))?;

    let affine = transform.affine();
    let m = glam::Mat4::from(affine).transpose();
    let rows = m.to_cols_array_2d();

    let hw_flags = if flags.contains(InstanceFlags::TRANSPARENT) {
        INSTANCE_FORCE_NO_OPAQUE
    } else {
        INSTANCE_FORCE_OPAQUE
    };

    let record = TlasInstance {
        transform: [rows[0], rows[1], rows[2]],
        custom_index_and_mask: (object.mesh_offset & 0x00ff_ffff) | (0xff << 24),
        sbt_offset_and_flags: hw_flags << 24,
        blas_address: blas.address,
    };
    Ok((record, blas.bounds.transformed(&affine)))
}

/// TLAS of one environment. Device memory is released on drop.
pub struct Tlas<D: GpuDevice> {
    device: Arc<D>,
    staging: Option<GpuBuffer<D>>,
    storage: Option<GpuBuffer<D>>,
    num_instances: u32,
    built_bytes: u64,
    address: DeviceAddress,
    bounds: Aabb,
}

impl<D: GpuDevice> Tlas<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            staging: None,
            storage: None,
            num_instances: 0,
            built_bytes: 0,
            address: 0,
            bounds: Aabb::EMPTY,
        }
    }

    /// Device address of the built structure (0 before the first build).
    #[inline]
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    #[inline]
    pub fn num_instances(&self) -> u32 {
        self.num_instances
    }

    /// World bounds of all instances at the last build.
    #[inline]
    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    /// Bytes currently reserved for the structure.
    pub fn capacity(&self) -> u64 {
        self.storage.as_ref().map_or(0, GpuBuffer::size)
    }

    /// Size of the last build.
    pub fn built_bytes(&self) -> u64 {
        self.built_bytes
    }

    /// Rebuild from the current instances, recording the build into `cmd`.
    ///
    /// Grows the backing memory when the instance count outgrew it. Failing
    /// to allocate is fatal to the session.
    #[tracing::instrument(skip_all, fields(instances = input.instances.len()))]
    pub fn build(&mut self, input: &TlasInput<'_>, cmd: &mut CommandList) -> Result<()> {
        let n = input.instances.len();
        if input.transforms.len() != n || input.flags.len() != n {
            return Err(Error::other(format!(
                "instance arrays disagree: {} instances, {} transforms, {} flags",
                n,
                input.transforms.len(),
                input.flags.len()
            )));
        }

        let prepared: Vec<(TlasInstance, Aabb)> = input
            .instances
            .par_iter()
            .zip(input.transforms.par_iter())
            .zip(input.flags.par_iter())
            .map(|((inst, xform), flags)| {
                instance_record(inst, xform, *flags, input.objects, input.blases)
            })
            .collect::<Result<_>>()?;

        let (records, world_bounds): (Vec<TlasInstance>, Vec<Aabb>) = prepared.into_iter().unzip();
        let bvh = build_bvh(&world_bounds);

        let mut bounds = Aabb::EMPTY;
        for b in &world_bounds {
            bounds.grow(b);
        }

        let bytes = serialize(&bvh.nodes, &bvh.prim_indices, &records);
        self.ensure_capacity(bytes.len() as u64)?;

        let (Some(staging), Some(storage)) = (&self.staging, &self.storage) else {
            return Err(Error::other("TLAS buffers missing after allocation"));
        };
        staging.write(0, &bytes)?;
        cmd.build_acceleration_structure(
            staging.handle(),
            storage.handle(),
            bytes.len() as u64,
            n as u32,
        );

        self.address = storage.address()?;
        self.num_instances = n as u32;
        self.built_bytes = bytes.len() as u64;
        self.bounds = bounds;
        tracing::trace!(bytes = bytes.len(), nodes = bvh.nodes.len(), "recorded TLAS build");
        Ok(())
    }

    fn ensure_capacity(&mut self, bytes: u64) -> Result<()> {
        if self.capacity() >= bytes {
            return Ok(());
        }
        let size = bytes.next_power_of_two().max(MIN_TLAS_BYTES);
        tracing::debug!(old = self.capacity(), new = size, "growing TLAS storage");

        self.staging = None;
        self.storage = None;
        let staging = GpuBuffer::new(&self.device, &BufferDesc::staging("tlas build", size))?;
        self.staging = Some(staging);
        let mut desc = BufferDesc::storage("tlas", size);
        desc.usage = desc.usage | BufferUsage::ACCELERATION_STRUCTURE;
        self.storage = Some(GpuBuffer::new(&self.device, &desc)?);
        Ok(())
    }
}

fn serialize(nodes: &[BvhNode], indices: &[u32], records: &[TlasInstance]) -> Vec<u8> {
    let header_bytes = size_of::<TlasHeader>() as u64;
    let nodes_offset = header_bytes;
    let indices_offset = nodes_offset + (nodes.len() * size_of::<BvhNode>()) as u64;
    let instances_offset = align_offset(indices_offset + (indices.len() * 4) as u64, 16);
    let total = instances_offset + (records.len() * size_of::<TlasInstance>()) as u64;

    let header = TlasHeader {
        node_count: nodes.len() as u32,
        instance_count: records.len() as u32,
        nodes_offset: nodes_offset as u32,
        indices_offset: indices_offset as u32,
        instances_offset: instances_offset as u32,
        _pad: [0; 3],
    };

    let mut out = Vec::with_capacity(total as usize);
    out.extend_from_slice(bytemuck::bytes_of(&header));
    out.extend_from_slice(bytemuck::cast_slice(nodes));
    out.extend_from_slice(bytemuck::cast_slice(indices));
    out.resize(instances_offset as usize, 0);
    out.extend_from_slice(bytemuck::cast_slice(records));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{Command, HeadlessDevice, QueueId};
    use glam::{Affine3A, Vec3};

    fn scene_objects() -> (Vec<ObjectInfo>, Vec<Blas>) {
        let objects = vec![
            ObjectInfo { mesh_offset: 0, num_meshes: 1 },
            ObjectInfo { mesh_offset: 1, num_meshes: 2 },
        ];
        let blases = vec![
            Blas { address: 0xa000, bounds: Aabb::new(Vec3::ZERO, Vec3::ONE) },
            Blas { address: 0xb000, bounds: Aabb::new(Vec3::splat(-1.0), Vec3::ONE) },
        ];
        (objects, blases)
    }

    fn instances(n: usize) -> (Vec<ObjectInstance>, Vec<InstanceTransform>, Vec<InstanceFlags>) {
        let inst = (0..n)
            .map(|i| ObjectInstance { object_idx: (i % 2) as u32, material_idx: 0 })
            .collect();
        let xforms = (0..n)
            .map(|i| {
                let offset = Vec3::new(i as f32 * 4.0, 0.0, 0.0);
                InstanceTransform::from_affine(&Affine3A::from_translation(offset))
            })
            .collect();
        let flags = (0..n)
            .map(|i| if i == 1 { InstanceFlags::TRANSPARENT } else { InstanceFlags::NONE })
            .collect();
        (inst, xforms, flags)
    }

    #[test]
    fn test_build_records_and_header() {
        let dev = Arc::new(HeadlessDevice::default());
        let (objects, blases) = scene_objects();
        let (inst, xforms, flags) = instances(3);
        let mut tlas = Tlas::new(dev.clone());
        let mut cmd = CommandList::new();
        tlas.build(
            &TlasInput {
                instances: &inst,
                transforms: &xforms,
                flags: &flags,
                objects: &objects,
                blases: &blases,
            },
            &mut cmd,
        )
        .unwrap();

        assert_ne!(tlas.address(), 0);
        assert_eq!(tlas.num_instances(), 3);
        assert_eq!(tlas.bounds().max.x, 9.0);
        assert!(matches!(
            cmd.commands()[0],
            Command::BuildAccelerationStructure { instance_count: 3, .. }
        ));

        dev.submit(QueueId::compute(0), cmd, None, &[]).unwrap();
        let storage = tlas.storage.as_ref().unwrap().handle();
        let bytes = dev.buffer_contents(storage).unwrap();
        let header: TlasHeader = bytemuck::pod_read_unaligned(&bytes[..size_of::<TlasHeader>()]);
        assert_eq!(header.instance_count, 3);

        let off = header.instances_offset as usize;
        let second: TlasInstance = bytemuck::pod_read_unaligned(&bytes[off + 64..off + 128]);
        assert_eq!(second.blas_address, 0xb000);
        assert_eq!(second.custom_index_and_mask & 0x00ff_ffff, 1);
        assert_eq!(second.sbt_offset_and_flags >> 24, INSTANCE_FORCE_NO_OPAQUE);
        // Row-major translation lands in the last column.
        assert_eq!(second.transform[0][3], 4.0);
    }

    #[test]
    fn test_grows_only_when_needed() {
        let dev = Arc::new(HeadlessDevice::default());
        let (objects, blases) = scene_objects();
        let mut tlas = Tlas::new(dev.clone());

        let (inst, xforms, flags) = instances(2);
        let input = TlasInput {
            instances: &inst,
            transforms: &xforms,
            flags: &flags,
            objects: &objects,
            blases: &blases,
        };
        tlas.build(&input, &mut CommandList::new()).unwrap();
        let small = tlas.capacity();
        tlas.build(&input, &mut CommandList::new()).unwrap();
        assert_eq!(tlas.capacity(), small);

        let (inst, xforms, flags) = instances(200);
        let input = TlasInput {
            instances: &inst,
            transforms: &xforms,
            flags: &flags,
            objects: &objects,
            blases: &blases,
        };
        tlas.build(&input, &mut CommandList::new()).unwrap();
        assert!(tlas.capacity() > small);
        assert!(tlas.capacity() >= tlas.built_bytes());
        // Old staging + storage were released.
        assert_eq!(dev.live_buffers(), 2);
    }

    #[test]
    fn test_allocation_failure_is_fatal() {
        let dev = Arc::new(HeadlessDevice::default().with_memory_budget(1024));
        let (objects, blases) = scene_objects();
        let (inst, xforms, flags) = instances(4);
        let mut tlas = Tlas::new(dev);
        let err = tlas
            .build(
                &TlasInput {
                    instances: &inst,
                    transforms: &xforms,
                    flags: &flags,
                    objects: &objects,
                    blases: &blases,
                },
                &mut CommandList::new(),
            )
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_object_rejected() {
        let dev = Arc::new(HeadlessDevice::default());
        let (objects, blases) = scene_objects();
        let inst = vec![ObjectInstance { object_idx: 7, material_idx: 0 }];
        let xforms = vec![InstanceTransform::default()];
        let flags = vec![InstanceFlags::NONE];
        let mut tlas = Tlas::new(dev);
        assert!(tlas
            .build(
                &TlasInput {
                    instances: &inst,
                    transforms: &xforms,
                    flags: &flags,
                    objects: &objects,
                    blases: &blases,
                },
                &mut CommandList::new(),
            )
            .is_err());
    }
}
