//! Device service: the narrow interface the engine uses to allocate GPU
//! resources, record work and synchronize with the GPU.
//!
//! The engine is generic over one [`GpuDevice`] implementation, chosen when
//! the renderer is constructed:
//!
//! - [`HeadlessDevice`]: in-memory device that executes copies and fills on
//!   the CPU and runs registered kernels in place of compute shaders
//! - `WgpuDevice` (feature `wgpu`): real GPU through wgpu

mod commands;
mod headless;
mod queue;
mod resource;
#[cfg(feature = "wgpu")]
mod wgpu_device;

pub use commands::*;
pub use headless::*;
pub use queue::*;
pub use resource::*;
#[cfg(feature = "wgpu")]
pub use wgpu_device::*;

use crate::util::Result;

/// GPU virtual address of a buffer, as seen by kernels.
pub type DeviceAddress = u64;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);
    };
}

handle!(
    /// Device buffer.
    BufferHandle
);
handle!(
    /// 2D device texture.
    TextureHandle
);
handle!(
    /// Compute pipeline.
    PipelineHandle
);
handle!(
    /// Bound set of resources ("descriptor set").
    BindGroupHandle
);
handle!(
    /// CPU-waitable completion signal.
    FenceHandle
);
handle!(
    /// GPU-GPU binary signal.
    SemaphoreHandle
);

/// Execution queue family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Compute,
    Transfer,
}

/// One hardware queue, addressed by family and index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId {
    pub kind: QueueKind,
    pub index: u32,
}

impl QueueId {
    pub const fn compute(index: u32) -> Self {
        Self { kind: QueueKind::Compute, index }
    }

    pub const fn transfer(index: u32) -> Self {
        Self { kind: QueueKind::Transfer, index }
    }
}

/// Static device properties the layouts depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Minimum offset alignment for storage-buffer bindings.
    pub storage_alignment: u64,
    pub compute_queues: u32,
    pub transfer_queues: u32,
    pub max_push_constant_bytes: u32,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            storage_alignment: 256,
            compute_queues: 4,
            transfer_queues: 2,
            max_push_constant_bytes: 128,
        }
    }
}

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// GPU-only memory.
    DeviceLocal,
    /// CPU-writable staging memory.
    HostVisible,
    /// CPU-readable memory for GPU-to-CPU copies.
    Readback,
}

/// Buffer usage bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferUsage(pub u32);

impl BufferUsage {
    pub const STORAGE: Self = Self(1);
    pub const COPY_SRC: Self = Self(1 << 1);
    pub const COPY_DST: Self = Self(1 << 2);
    pub const ACCELERATION_STRUCTURE: Self = Self(1 << 3);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
    /// Memory may be shared with an external API (denoiser, training code).
    pub exportable: bool,
}

impl<'a> BufferDesc<'a> {
    /// Device-local storage buffer that can be copied to and from.
    pub fn storage(label: &'a str, size: u64) -> Self {
        Self {
            label,
            size,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
            location: MemoryLocation::DeviceLocal,
            exportable: false,
        }
    }

    /// Host-visible upload buffer.
    pub fn staging(label: &'a str, size: u64) -> Self {
        Self {
            label,
            size,
            usage: BufferUsage::COPY_SRC | BufferUsage::STORAGE,
            location: MemoryLocation::HostVisible,
            exportable: false,
        }
    }

    /// Host-readable download buffer.
    pub fn readback(label: &'a str, size: u64) -> Self {
        Self {
            label,
            size,
            usage: BufferUsage::COPY_DST,
            location: MemoryLocation::Readback,
            exportable: false,
        }
    }

    pub fn exported(mut self) -> Self {
        self.exportable = true;
        self
    }
}

/// Texel formats used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba32Float,
    Rgba16Float,
    R32Float,
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::Rgba32Float => 16,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::R32Float => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextureDesc<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl TextureDesc<'_> {
    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.format.bytes_per_texel() as u64
    }
}

/// Kind of resource a layout slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    StorageBuffer { read_only: bool },
    SampledTexture,
    /// Array of sampled textures, up to `count` entries.
    TextureArray { count: u32 },
    /// Sampler owned by the pipeline layout; never supplied in bind groups.
    Sampler { clamp: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutEntry {
    pub binding: u32,
    pub kind: BindingKind,
}

/// Layout of one bind set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindSetLayout {
    pub entries: Vec<LayoutEntry>,
}

impl BindSetLayout {
    pub fn entry(&self, binding: u32) -> Option<&LayoutEntry> {
        self.entries.iter().find(|e| e.binding == binding)
    }
}

/// Which engine kernel a pipeline runs. Headless kernels key on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    PathTrace,
    ProbeBake,
    Exposure,
    Tonemap,
}

#[derive(Debug, Clone)]
pub struct ComputePipelineDesc<'a> {
    pub label: &'a str,
    pub kind: PipelineKind,
    /// Kernel source; opaque to the engine.
    pub source: &'a str,
    /// Generated constant declarations prepended to the source.
    pub prelude: String,
    /// Layouts of sets 0..n.
    pub sets: Vec<BindSetLayout>,
    pub push_constant_bytes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingResource {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    },
    Texture(TextureHandle),
    TextureArray(Vec<TextureHandle>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingEntry {
    pub binding: u32,
    pub resource: BindingResource,
}

impl BindingEntry {
    pub fn buffer(binding: u32, buffer: BufferHandle, offset: u64, size: u64) -> Self {
        Self {
            binding,
            resource: BindingResource::Buffer { buffer, offset, size },
        }
    }

    pub fn texture(binding: u32, texture: TextureHandle) -> Self {
        Self {
            binding,
            resource: BindingResource::Texture(texture),
        }
    }

    pub fn texture_array(binding: u32, textures: Vec<TextureHandle>) -> Self {
        Self {
            binding,
            resource: BindingResource::TextureArray(textures),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BindGroupDesc<'a> {
    pub label: &'a str,
    pub pipeline: PipelineHandle,
    pub set: u32,
    pub entries: &'a [BindingEntry],
}

/// Resource and submission service.
///
/// Every method takes `&self`; loader threads and the render thread share
/// one device behind an `Arc`.
pub trait GpuDevice: Send + Sync + 'static {
    fn properties(&self) -> DeviceProperties;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<BufferHandle>;
    fn destroy_buffer(&self, buffer: BufferHandle);
    fn buffer_address(&self, buffer: BufferHandle) -> Result<DeviceAddress>;
    /// Write host-visible memory and flush it.
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;
    /// Read host-visible or readback memory after a fence wait.
    fn read_buffer(&self, buffer: BufferHandle, offset: u64, out: &mut [u8]) -> Result<()>;

    fn create_texture(&self, desc: &TextureDesc<'_>) -> Result<TextureHandle>;
    fn destroy_texture(&self, texture: TextureHandle);
    /// Upload tightly packed texels, blocking until visible to the GPU.
    fn write_texture(&self, texture: TextureHandle, data: &[u8]) -> Result<()>;

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<'_>) -> Result<PipelineHandle>;
    fn destroy_pipeline(&self, pipeline: PipelineHandle);
    fn create_bind_group(&self, desc: &BindGroupDesc<'_>) -> Result<BindGroupHandle>;
    fn destroy_bind_group(&self, group: BindGroupHandle);

    fn create_fence(&self) -> Result<FenceHandle>;
    /// Block until the fence signals. There is no timeout.
    fn wait_fence(&self, fence: FenceHandle) -> Result<()>;
    fn reset_fence(&self, fence: FenceHandle) -> Result<()>;
    fn destroy_fence(&self, fence: FenceHandle);
    fn create_semaphore(&self) -> Result<SemaphoreHandle>;
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    /// Submit recorded work. `fence` signals when it completes.
    fn submit(
        &self,
        queue: QueueId,
        commands: CommandList,
        fence: Option<FenceHandle>,
        signal: &[SemaphoreHandle],
    ) -> Result<()>;
}
