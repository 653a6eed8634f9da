//! Backend-neutral command recording.
//!
//! A [`CommandList`] is plain data. Backends translate it at submit time;
//! tests inspect it directly to check ordering and barrier placement.

use smallvec::SmallVec;

use super::{BindGroupHandle, BufferHandle, PipelineHandle, TextureHandle};

/// Pipeline stage on one side of a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    TopOfPipe,
    Host,
    Transfer,
    AccelerationStructureBuild,
    ComputeShader,
}

/// Memory access mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Access(pub u32);

impl Access {
    pub const NONE: Self = Self(0);
    pub const HOST_WRITE: Self = Self(1);
    pub const TRANSFER_READ: Self = Self(1 << 1);
    pub const TRANSFER_WRITE: Self = Self(1 << 2);
    pub const SHADER_READ: Self = Self(1 << 3);
    pub const SHADER_WRITE: Self = Self(1 << 4);
    pub const ACCELERATION_STRUCTURE_READ: Self = Self(1 << 5);
    pub const ACCELERATION_STRUCTURE_WRITE: Self = Self(1 << 6);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Access {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// What a barrier covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierScope {
    /// All memory.
    Global,
    Buffer { buffer: BufferHandle, offset: u64, size: u64 },
    Texture(TextureHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    pub src_stage: Stage,
    pub dst_stage: Stage,
    pub src_access: Access,
    pub dst_access: Access,
    pub scope: BarrierScope,
}

impl Barrier {
    pub fn memory(
        src_stage: Stage,
        dst_stage: Stage,
        src_access: Access,
        dst_access: Access,
    ) -> Self {
        Self {
            src_stage,
            dst_stage,
            src_access,
            dst_access,
            scope: BarrierScope::Global,
        }
    }

    pub fn buffer(
        buffer: BufferHandle,
        offset: u64,
        size: u64,
        src: (Stage, Access),
        dst: (Stage, Access),
    ) -> Self {
        Self {
            src_stage: src.0,
            dst_stage: dst.0,
            src_access: src.1,
            dst_access: dst.1,
            scope: BarrierScope::Buffer { buffer, offset, size },
        }
    }

    /// Compute writes made visible to later compute reads.
    pub fn compute_to_compute() -> Self {
        Self::memory(
            Stage::ComputeShader,
            Stage::ComputeShader,
            Access::SHADER_WRITE,
            Access::SHADER_READ | Access::SHADER_WRITE,
        )
    }

    /// Transfer writes made visible to compute shaders.
    pub fn transfer_to_compute() -> Self {
        Self::memory(
            Stage::Transfer,
            Stage::ComputeShader,
            Access::TRANSFER_WRITE,
            Access::SHADER_READ | Access::SHADER_WRITE,
        )
    }

    /// Compute writes made visible to transfer reads.
    pub fn compute_to_transfer() -> Self {
        Self::memory(
            Stage::ComputeShader,
            Stage::Transfer,
            Access::SHADER_WRITE,
            Access::TRANSFER_READ,
        )
    }
}

/// Buffer-to-buffer copy region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BindPipeline(PipelineHandle),
    PushConstants(SmallVec<[u8; 64]>),
    BindGroup { set: u32, group: BindGroupHandle },
    Dispatch { x: u32, y: u32, z: u32 },
    Barrier(Barrier),
    FillBuffer { buffer: BufferHandle, offset: u64, size: u64, value: u32 },
    CopyBuffer { src: BufferHandle, dst: BufferHandle, regions: SmallVec<[CopyRegion; 4]> },
    /// Build a top-level acceleration structure from instance records
    /// prepared in `src` into `dst`.
    BuildAccelerationStructure {
        src: BufferHandle,
        dst: BufferHandle,
        bytes: u64,
        instance_count: u32,
    },
    CopyBufferToTexture { src: BufferHandle, offset: u64, dst: TextureHandle },
    CopyTextureToBuffer { src: TextureHandle, dst: BufferHandle, offset: u64 },
}

/// Ordered list of recorded commands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.commands.push(Command::BindPipeline(pipeline));
    }

    pub fn push_constants(&mut self, data: &[u8]) {
        self.commands.push(Command::PushConstants(SmallVec::from_slice(data)));
    }

    pub fn bind_group(&mut self, set: u32, group: BindGroupHandle) {
        self.commands.push(Command::BindGroup { set, group });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(Command::Dispatch { x, y, z });
    }

    pub fn barrier(&mut self, barrier: Barrier) {
        self.commands.push(Command::Barrier(barrier));
    }

    /// Fill `size` bytes with a repeated 32-bit value.
    pub fn fill_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64, value: u32) {
        self.commands.push(Command::FillBuffer { buffer, offset, size, value });
    }

    pub fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, regions: &[CopyRegion]) {
        self.commands.push(Command::CopyBuffer {
            src,
            dst,
            regions: SmallVec::from_slice(regions),
        });
    }

    pub fn build_acceleration_structure(
        &mut self,
        src: BufferHandle,
        dst: BufferHandle,
        bytes: u64,
        instance_count: u32,
    ) {
        self.commands.push(Command::BuildAccelerationStructure { src, dst, bytes, instance_count });
    }

    pub fn copy_buffer_to_texture(&mut self, src: BufferHandle, offset: u64, dst: TextureHandle) {
        self.commands.push(Command::CopyBufferToTexture { src, offset, dst });
    }

    pub fn copy_texture_to_buffer(&mut self, src: TextureHandle, dst: BufferHandle, offset: u64) {
        self.commands.push(Command::CopyTextureToBuffer { src, dst, offset });
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Number of recorded dispatches.
    pub fn dispatch_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::Dispatch { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_order() {
        let mut cmd = CommandList::new();
        cmd.bind_pipeline(PipelineHandle(1));
        cmd.push_constants(&[1, 2, 3, 4]);
        cmd.barrier(Barrier::transfer_to_compute());
        cmd.dispatch(2, 2, 1);
        cmd.dispatch(1, 1, 1);

        assert_eq!(cmd.len(), 5);
        assert_eq!(cmd.dispatch_count(), 2);
        assert!(matches!(cmd.commands()[0], Command::BindPipeline(PipelineHandle(1))));
        match &cmd.commands()[1] {
            Command::PushConstants(bytes) => assert_eq!(bytes.as_slice(), &[1, 2, 3, 4]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_access_masks() {
        let b = Barrier::transfer_to_compute();
        assert!(b.dst_access.contains(Access::SHADER_READ));
        assert!(!b.src_access.contains(Access::SHADER_WRITE));
        assert_eq!(b.scope, BarrierScope::Global);
    }
}
