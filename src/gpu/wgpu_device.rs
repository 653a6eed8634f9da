//! wgpu backend.
//!
//! wgpu exposes a single queue, so every [`QueueId`] maps onto it and
//! semaphores only carry ordering that the queue already guarantees.
//! Barriers are implied by wgpu's own usage tracking. Buffer device
//! addresses are synthetic: unique per buffer and stable for its lifetime.
//! Acceleration-structure builds copy the prepared instance records into
//! the TLAS buffer, which the kernels traverse directly.

use std::collections::{HashMap, HashSet};
use std::num::{NonZeroU32, NonZeroU64};
use std::sync::Arc;

use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use super::{
    BindGroupDesc, BindGroupHandle, BindingKind, BindingResource, BindSetLayout, BufferDesc,
    BufferHandle, BufferUsage, Command, CommandList, ComputePipelineDesc, DeviceAddress,
    DeviceProperties, FenceHandle, GpuDevice, MemoryLocation, PipelineHandle, QueueId,
    SemaphoreHandle, TextureDesc, TextureFormat, TextureHandle,
};
use crate::util::{align_offset, Error, Result};

/// Required alignment of `bytes_per_row` in buffer/texture copies.
const COPY_ROW_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

struct BufferEntry {
    buffer: wgpu::Buffer,
    size: u64,
    location: MemoryLocation,
    address: DeviceAddress,
}

struct TextureEntry {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    format: TextureFormat,
}

struct PipelineEntry {
    pipeline: wgpu::ComputePipeline,
    layouts: Vec<wgpu::BindGroupLayout>,
    sets: Vec<BindSetLayout>,
}

#[derive(Default)]
struct FenceEntry {
    pending: bool,
    signaled: bool,
}

#[derive(Default)]
struct WgpuState {
    next_id: u32,
    next_address: DeviceAddress,
    buffers: HashMap<BufferHandle, BufferEntry>,
    textures: HashMap<TextureHandle, TextureEntry>,
    pipelines: HashMap<PipelineHandle, PipelineEntry>,
    groups: HashMap<BindGroupHandle, wgpu::BindGroup>,
    fences: HashMap<FenceHandle, FenceEntry>,
    semaphores: HashSet<SemaphoreHandle>,
}

impl WgpuState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&BufferEntry> {
        self.buffers.get(&handle).ok_or(Error::InvalidHandle("buffer"))
    }

    fn texture(&self, handle: TextureHandle) -> Result<&TextureEntry> {
        self.textures.get(&handle).ok_or(Error::InvalidHandle("texture"))
    }
}

/// [`GpuDevice`] on a real adapter.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    props: DeviceProperties,
    repeat_sampler: wgpu::Sampler,
    clamp_sampler: wgpu::Sampler,
    state: Mutex<WgpuState>,
}

impl WgpuDevice {
    /// Open adapter `gpu_id` (enumeration order of the primary backends).
    #[tracing::instrument]
    pub fn new(gpu_id: usize) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .enumerate_adapters(wgpu::Backends::PRIMARY)
            .into_iter()
            .nth(gpu_id)
            .ok_or_else(|| Error::device(format!("no GPU with index {gpu_id}")))?;
        let info = adapter.get_info();
        tracing::info!(name = %info.name, backend = ?info.backend, "selected adapter");

        let wanted = wgpu::Features::PUSH_CONSTANTS
            | wgpu::Features::TEXTURE_BINDING_ARRAY
            | wgpu::Features::PARTIALLY_BOUND_BINDING_ARRAY
            | wgpu::Features::SAMPLED_TEXTURE_AND_STORAGE_BUFFER_ARRAY_NON_UNIFORM_INDEXING;
        let available = adapter.features();
        if !available.contains(wgpu::Features::PUSH_CONSTANTS) {
            return Err(Error::device(format!("{} does not support push constants", info.name)));
        }
        let adapter_limits = adapter.limits();

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("pbrbatch device"),
            required_features: wanted & available,
            required_limits: wgpu::Limits {
                max_push_constant_size: 128,
                max_bind_groups: 4,
                max_storage_buffers_per_shader_stage: adapter_limits
                    .max_storage_buffers_per_shader_stage,
                max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
                max_buffer_size: adapter_limits.max_buffer_size,
                max_sampled_textures_per_shader_stage: adapter_limits
                    .max_sampled_textures_per_shader_stage,
                max_binding_array_elements_per_shader_stage: adapter_limits
                    .max_binding_array_elements_per_shader_stage,
                ..wgpu::Limits::default()
            },
            ..Default::default()
        }))
        .map_err(|e| Error::device(e.to_string()))?;

        let props = DeviceProperties {
            storage_alignment: device.limits().min_storage_buffer_offset_alignment as u64,
            compute_queues: 1,
            transfer_queues: 1,
            max_push_constant_bytes: device.limits().max_push_constant_size,
        };

        let sampler = |label, mode| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(label),
                address_mode_u: mode,
                address_mode_v: mode,
                address_mode_w: mode,
                mag_filter: wgpu::FilterMode::Nearest,
                min_filter: wgpu::FilterMode::Nearest,
                ..Default::default()
            })
        };
        let repeat_sampler = sampler("repeat sampler", wgpu::AddressMode::Repeat);
        let clamp_sampler = sampler("clamp sampler", wgpu::AddressMode::ClampToEdge);

        Ok(Self {
            device,
            queue,
            props,
            repeat_sampler,
            clamp_sampler,
            state: Mutex::new(WgpuState {
                next_address: 0x1000_0000,
                ..Default::default()
            }),
        })
    }

    pub fn raw_device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn raw_queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Run `create` inside an out-of-memory error scope.
    fn checked_alloc<T>(&self, label: &str, bytes: u64, create: impl FnOnce() -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let value = create();
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(Error::OutOfDeviceMemory {
                label: label.to_string(),
                bytes,
            });
        }
        Ok(value)
    }

    fn wait_idle(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map(|_| ())
            .map_err(|e| Error::device(e.to_string()))
    }

    /// Map `buffer` for reading and copy `out.len()` bytes at `offset`.
    fn map_read(&self, buffer: &wgpu::Buffer, offset: u64, out: &mut [u8]) -> Result<()> {
        // Map ranges must start on MAP_ALIGNMENT and span whole words.
        let start = offset - offset % wgpu::MAP_ALIGNMENT;
        let end = align_offset(offset + out.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT)
            .min(buffer.size());
        let slice = buffer.slice(start..end);
        let status = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&status);
        slice.map_async(wgpu::MapMode::Read, move |r| *sink.lock() = Some(r));
        self.wait_idle()?;
        match status.lock().take() {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(Error::device(e.to_string())),
            None => return Err(Error::device("buffer map did not complete")),
        }
        {
            let mapped = slice.get_mapped_range();
            let skip = (offset - start) as usize;
            out.copy_from_slice(&mapped[skip..skip + out.len()]);
        }
        buffer.unmap();
        Ok(())
    }

    fn layout_entry(entry: &super::LayoutEntry) -> wgpu::BindGroupLayoutEntry {
        let ty = match entry.kind {
            BindingKind::StorageBuffer { read_only } => wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            BindingKind::SampledTexture | BindingKind::TextureArray { .. } => {
                wgpu::BindingType::Texture {
                    multisampled: false,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                }
            }
            BindingKind::Sampler { .. } => {
                wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering)
            }
        };
        let count = match entry.kind {
            BindingKind::TextureArray { count } => NonZeroU32::new(count),
            _ => None,
        };
        wgpu::BindGroupLayoutEntry {
            binding: entry.binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty,
            count,
        }
    }

    fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
        }
    }

    fn copy_layout(
        texture: &TextureEntry,
        offset: u64,
    ) -> Result<(wgpu::TexelCopyBufferLayout, wgpu::Extent3d)> {
        let bytes_per_row = texture.width * texture.format.bytes_per_texel();
        if bytes_per_row % COPY_ROW_ALIGNMENT != 0 {
            return Err(Error::device(format!(
                "texture rows of {bytes_per_row} bytes are not {COPY_ROW_ALIGNMENT}-byte aligned"
            )));
        }
        Ok((
            wgpu::TexelCopyBufferLayout {
                offset,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(texture.height),
            },
            wgpu::Extent3d {
                width: texture.width,
                height: texture.height,
                depth_or_array_layers: 1,
            },
        ))
    }

    /// Translate `commands` into one command buffer.
    fn encode(&self, state: &WgpuState, commands: &CommandList) -> Result<wgpu::CommandBuffer> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("pbrbatch") });

        let mut pipeline: Option<&PipelineEntry> = None;
        let mut push: &[u8] = &[];
        let mut groups: HashMap<u32, &wgpu::BindGroup> = HashMap::new();

        for command in commands.commands() {
            match command {
                Command::BindPipeline(handle) => {
                    let found =
                        state.pipelines.get(handle).ok_or(Error::InvalidHandle("pipeline"))?;
                    pipeline = Some(found);
                    groups.clear();
                }
                Command::PushConstants(bytes) => push = bytes.as_slice(),
                Command::BindGroup { set, group } => {
                    let found = state.groups.get(group).ok_or(Error::InvalidHandle("bind group"))?;
                    groups.insert(*set, found);
                }
                Command::Dispatch { x, y, z } => {
                    let entry =
                        pipeline.ok_or_else(|| Error::device("dispatch without a bound pipeline"))?;
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("pbrbatch dispatch"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(&entry.pipeline);
                    if !push.is_empty() {
                        pass.set_push_constants(0, push);
                    }
                    for (set, group) in &groups {
                        pass.set_bind_group(*set, Some(*group), &[]);
                    }
                    pass.dispatch_workgroups(*x, *y, *z);
                }
                // Ordering is enforced by wgpu's resource tracking.
                Command::Barrier(_) => {}
                Command::FillBuffer { buffer, offset, size, value } => {
                    let target = &state.buffer(*buffer)?.buffer;
                    if *value == 0 {
                        encoder.clear_buffer(target, *offset, Some(*size));
                    } else {
                        let pattern: Vec<u32> = vec![*value; (*size / 4) as usize];
                        let src = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                            label: Some("fill pattern"),
                            contents: bytemuck::cast_slice(&pattern),
                            usage: wgpu::BufferUsages::COPY_SRC,
                        });
                        encoder.copy_buffer_to_buffer(&src, 0, target, *offset, *size);
                    }
                }
                Command::CopyBuffer { src, dst, regions } => {
                    let (src, dst) = (&state.buffer(*src)?.buffer, &state.buffer(*dst)?.buffer);
                    for region in regions {
                        encoder.copy_buffer_to_buffer(
                            src,
                            region.src_offset,
                            dst,
                            region.dst_offset,
                            region.size,
                        );
                    }
                }
                Command::BuildAccelerationStructure { src, dst, bytes, .. } => {
                    let (src, dst) = (&state.buffer(*src)?.buffer, &state.buffer(*dst)?.buffer);
                    encoder.copy_buffer_to_buffer(src, 0, dst, 0, *bytes);
                }
                Command::CopyBufferToTexture { src, offset, dst } => {
                    let texture = state.texture(*dst)?;
                    let (layout, extent) = Self::copy_layout(texture, *offset)?;
                    encoder.copy_buffer_to_texture(
                        wgpu::TexelCopyBufferInfo {
                            buffer: &state.buffer(*src)?.buffer,
                            layout,
                        },
                        texture.texture.as_image_copy(),
                        extent,
                    );
                }
                Command::CopyTextureToBuffer { src, dst, offset } => {
                    let texture = state.texture(*src)?;
                    let (layout, extent) = Self::copy_layout(texture, *offset)?;
                    encoder.copy_texture_to_buffer(
                        texture.texture.as_image_copy(),
                        wgpu::TexelCopyBufferInfo {
                            buffer: &state.buffer(*dst)?.buffer,
                            layout,
                        },
                        extent,
                    );
                }
            }
        }
        Ok(encoder.finish())
    }
}

impl GpuDevice for WgpuDevice {
    fn properties(&self) -> DeviceProperties {
        self.props
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<BufferHandle> {
        let mut usage = match desc.location {
            // Mappable buffers may not carry other usages.
            MemoryLocation::Readback => wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            MemoryLocation::HostVisible => {
                wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC
            }
            MemoryLocation::DeviceLocal => wgpu::BufferUsages::empty(),
        };
        if desc.location != MemoryLocation::Readback {
            if desc.usage.contains(BufferUsage::STORAGE)
                || desc.usage.contains(BufferUsage::ACCELERATION_STRUCTURE)
            {
                usage |= wgpu::BufferUsages::STORAGE;
            }
            if desc.usage.contains(BufferUsage::COPY_SRC) {
                usage |= wgpu::BufferUsages::COPY_SRC;
            }
            if desc.usage.contains(BufferUsage::COPY_DST) {
                usage |= wgpu::BufferUsages::COPY_DST;
            }
        }
        let size = align_offset(desc.size.max(4), wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self.checked_alloc(desc.label, size, || {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(desc.label),
                size,
                usage,
                mapped_at_creation: false,
            })
        })?;

        let mut state = self.state.lock();
        let handle = BufferHandle(state.next_id());
        let address = state.next_address;
        state.next_address += align_offset(size, 256);
        state.buffers.insert(
            handle,
            BufferEntry {
                buffer,
                size: desc.size,
                location: desc.location,
                address,
            },
        );
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        if let Some(entry) = self.state.lock().buffers.remove(&buffer) {
            entry.buffer.destroy();
        }
    }

    fn buffer_address(&self, buffer: BufferHandle) -> Result<DeviceAddress> {
        self.state.lock().buffer(buffer).map(|b| b.address)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let state = self.state.lock();
        let entry = state.buffer(buffer)?;
        if entry.location != MemoryLocation::HostVisible {
            return Err(Error::device("host write to a buffer that is not host visible"));
        }
        if offset + data.len() as u64 > entry.size {
            return Err(Error::device(format!(
                "write of {} bytes at {offset} outside {}-byte buffer",
                data.len(),
                entry.size
            )));
        }
        self.queue.write_buffer(&entry.buffer, offset, data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, out: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let entry = state.buffer(buffer)?;
        match entry.location {
            MemoryLocation::DeviceLocal => Err(Error::device("host read from device-local memory")),
            MemoryLocation::Readback => self.map_read(&entry.buffer, offset, out),
            MemoryLocation::HostVisible => {
                // Upload buffers are not mappable; go through a readback copy.
                let size = align_offset(out.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT);
                let temp = self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("host read"),
                    size,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                let mut encoder = self
                    .device
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                        label: Some("host read"),
                    });
                encoder.copy_buffer_to_buffer(&entry.buffer, offset, &temp, 0, size);
                self.queue.submit(Some(encoder.finish()));
                self.map_read(&temp, 0, out)
            }
        }
    }

    fn create_texture(&self, desc: &TextureDesc<'_>) -> Result<TextureHandle> {
        let texture = self.checked_alloc(desc.label, desc.byte_size(), || {
            self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(desc.label),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: Self::wgpu_format(desc.format),
                usage: wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_DST
                    | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            })
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut state = self.state.lock();
        let handle = TextureHandle(state.next_id());
        state.textures.insert(
            handle,
            TextureEntry {
                texture,
                view,
                width: desc.width,
                height: desc.height,
                format: desc.format,
            },
        );
        Ok(handle)
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        if let Some(entry) = self.state.lock().textures.remove(&texture) {
            entry.texture.destroy();
        }
    }

    fn write_texture(&self, texture: TextureHandle, data: &[u8]) -> Result<()> {
        {
            let state = self.state.lock();
            let entry = state.texture(texture)?;
            let bytes_per_row = entry.width * entry.format.bytes_per_texel();
            if data.len() as u64 != bytes_per_row as u64 * entry.height as u64 {
                return Err(Error::device(format!(
                    "texture upload of {} bytes into {}x{} texture",
                    data.len(),
                    entry.width,
                    entry.height
                )));
            }
            self.queue.write_texture(
                entry.texture.as_image_copy(),
                data,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(entry.height),
                },
                entry.texture.size(),
            );
        }
        self.queue.submit(std::iter::empty());
        self.wait_idle()
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<'_>) -> Result<PipelineHandle> {
        if desc.push_constant_bytes > self.props.max_push_constant_bytes {
            return Err(Error::device(format!(
                "{}: {} push constant bytes exceed limit {}",
                desc.label, desc.push_constant_bytes, self.props.max_push_constant_bytes
            )));
        }
        let source = format!("{}\n{}", desc.prelude, desc.source);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(desc.label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let layouts: Vec<wgpu::BindGroupLayout> = desc
            .sets
            .iter()
            .map(|set| {
                let entries: Vec<_> = set.entries.iter().map(Self::layout_entry).collect();
                self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(desc.label),
                    entries: &entries,
                })
            })
            .collect();
        let layout_refs: Vec<&wgpu::BindGroupLayout> = layouts.iter().collect();
        let push_ranges = [wgpu::PushConstantRange {
            stages: wgpu::ShaderStages::COMPUTE,
            range: 0..desc.push_constant_bytes,
        }];
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(desc.label),
            bind_group_layouts: &layout_refs,
            push_constant_ranges: if desc.push_constant_bytes > 0 { &push_ranges } else { &[] },
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(desc.label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });
        tracing::debug!(label = desc.label, sets = layouts.len(), "created compute pipeline");

        let mut state = self.state.lock();
        let handle = PipelineHandle(state.next_id());
        state.pipelines.insert(
            handle,
            PipelineEntry {
                pipeline,
                layouts,
                sets: desc.sets.clone(),
            },
        );
        Ok(handle)
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        self.state.lock().pipelines.remove(&pipeline);
    }

    fn create_bind_group(&self, desc: &BindGroupDesc<'_>) -> Result<BindGroupHandle> {
        let mut state = self.state.lock();
        let group = {
            let pipeline = state
                .pipelines
                .get(&desc.pipeline)
                .ok_or(Error::InvalidHandle("pipeline"))?;
            let (layout, set) = pipeline
                .layouts
                .get(desc.set as usize)
                .zip(pipeline.sets.get(desc.set as usize))
                .ok_or_else(|| {
                    Error::device(format!("{}: pipeline has no set {}", desc.label, desc.set))
                })?;

            let arrays: Vec<Vec<&wgpu::TextureView>> = desc
                .entries
                .iter()
                .filter_map(|e| match &e.resource {
                    BindingResource::TextureArray(textures) => Some(textures),
                    _ => None,
                })
                .map(|textures| {
                    textures
                        .iter()
                        .map(|t| state.texture(*t).map(|t| &t.view))
                        .collect::<Result<Vec<_>>>()
                })
                .collect::<Result<_>>()?;

            let mut arrays_iter = arrays.iter();
            let mut entries = Vec::with_capacity(desc.entries.len() + 2);
            for entry in desc.entries {
                let resource = match &entry.resource {
                    BindingResource::Buffer { buffer, offset, size } => {
                        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: &state.buffer(*buffer)?.buffer,
                            offset: *offset,
                            size: NonZeroU64::new(*size),
                        })
                    }
                    BindingResource::Texture(texture) => {
                        wgpu::BindingResource::TextureView(&state.texture(*texture)?.view)
                    }
                    BindingResource::TextureArray(_) => {
                        let views = arrays_iter
                            .next()
                            .ok_or_else(|| Error::device("texture array bookkeeping"))?;
                        wgpu::BindingResource::TextureViewArray(views)
                    }
                };
                entries.push(wgpu::BindGroupEntry {
                    binding: entry.binding,
                    resource,
                });
            }
            // Samplers belong to the pipeline layout and are filled in here.
            for slot in &set.entries {
                if let BindingKind::Sampler { clamp } = slot.kind {
                    let sampler = if clamp { &self.clamp_sampler } else { &self.repeat_sampler };
                    entries.push(wgpu::BindGroupEntry {
                        binding: slot.binding,
                        resource: wgpu::BindingResource::Sampler(sampler),
                    });
                }
            }

            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(desc.label),
                layout,
                entries: &entries,
            })
        };
        let handle = BindGroupHandle(state.next_id());
        state.groups.insert(handle, group);
        Ok(handle)
    }

    fn destroy_bind_group(&self, group: BindGroupHandle) {
        self.state.lock().groups.remove(&group);
    }

    fn create_fence(&self) -> Result<FenceHandle> {
        let mut state = self.state.lock();
        let handle = FenceHandle(state.next_id());
        state.fences.insert(handle, FenceEntry::default());
        Ok(handle)
    }

    fn wait_fence(&self, fence: FenceHandle) -> Result<()> {
        {
            let state = self.state.lock();
            let entry = state.fences.get(&fence).ok_or(Error::InvalidHandle("fence"))?;
            if entry.signaled {
                return Ok(());
            }
            if !entry.pending {
                return Err(Error::device("wait on a fence with no pending submission"));
            }
        }
        self.wait_idle()?;
        if let Some(entry) = self.state.lock().fences.get_mut(&fence) {
            entry.pending = false;
            entry.signaled = true;
        }
        Ok(())
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.fences.get_mut(&fence).ok_or(Error::InvalidHandle("fence"))?;
        *entry = FenceEntry::default();
        Ok(())
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.state.lock().fences.remove(&fence);
    }

    fn create_semaphore(&self) -> Result<SemaphoreHandle> {
        let mut state = self.state.lock();
        let handle = SemaphoreHandle(state.next_id());
        state.semaphores.insert(handle);
        Ok(handle)
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.state.lock().semaphores.remove(&semaphore);
    }

    #[tracing::instrument(skip_all, fields(queue = ?queue, commands = commands.len()))]
    fn submit(
        &self,
        queue: QueueId,
        commands: CommandList,
        fence: Option<FenceHandle>,
        signal: &[SemaphoreHandle],
    ) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(fence) = fence {
            let entry = state.fences.get(&fence).ok_or(Error::InvalidHandle("fence"))?;
            if entry.signaled || entry.pending {
                return Err(Error::device("submit with a fence that was not reset"));
            }
        }
        if signal.iter().any(|s| !state.semaphores.contains(s)) {
            return Err(Error::InvalidHandle("semaphore"));
        }

        let buffer = self.encode(&state, &commands)?;
        self.queue.submit(Some(buffer));

        if let Some(entry) = fence.and_then(|f| state.fences.get_mut(&f)) {
            entry.pending = true;
        }
        Ok(())
    }
}
