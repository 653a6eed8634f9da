//! In-memory device.
//!
//! Buffers and textures are plain byte vectors. Submissions execute
//! synchronously on the calling thread: copies and fills are applied
//! directly, and each dispatch calls the kernel registered for the bound
//! pipeline's [`PipelineKind`] (dispatches without a kernel do nothing).
//! Every submission is logged for inspection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;

use bytemuck::Pod;
use parking_lot::Mutex;

use super::{
    BindGroupDesc, BindGroupHandle, BindingEntry, BindingKind, BindingResource, BindSetLayout,
    BufferDesc, BufferHandle, Command, CommandList, ComputePipelineDesc, DeviceAddress,
    DeviceProperties, FenceHandle, GpuDevice, MemoryLocation, PipelineHandle, PipelineKind,
    QueueId, SemaphoreHandle, TextureDesc, TextureFormat, TextureHandle,
};
use crate::util::{align_offset, Error, Result};

/// CPU stand-in for a compute kernel.
///
/// Kernels run while the device is locked and must not call back into it.
pub type Kernel = Box<dyn FnMut(&mut DispatchContext<'_>) + Send>;

/// One logged call to [`GpuDevice::submit`].
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub queue: QueueId,
    pub commands: CommandList,
    pub fence: Option<FenceHandle>,
    pub signal: Vec<SemaphoreHandle>,
}

struct BufferSlot {
    data: Vec<u8>,
    location: MemoryLocation,
    address: DeviceAddress,
}

struct TextureSlot {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: TextureFormat,
}

struct PipelineSlot {
    kind: PipelineKind,
    sets: Vec<BindSetLayout>,
    prelude: String,
}

struct GroupSlot {
    entries: Vec<BindingEntry>,
}

#[derive(Default)]
struct HeadlessState {
    next_id: u32,
    next_address: DeviceAddress,
    buffers: HashMap<BufferHandle, BufferSlot>,
    textures: HashMap<TextureHandle, TextureSlot>,
    pipelines: HashMap<PipelineHandle, PipelineSlot>,
    groups: HashMap<BindGroupHandle, GroupSlot>,
    fences: HashMap<FenceHandle, bool>,
    semaphores: HashSet<SemaphoreHandle>,
    submissions: Vec<SubmissionRecord>,
    allocated_bytes: u64,
}

impl HeadlessState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn reserve(&mut self, budget: Option<u64>, label: &str, bytes: u64) -> Result<()> {
        if let Some(budget) = budget {
            if self.allocated_bytes + bytes > budget {
                return Err(Error::OutOfDeviceMemory {
                    label: label.to_string(),
                    bytes,
                });
            }
        }
        self.allocated_bytes += bytes;
        Ok(())
    }
}

/// View of device memory handed to a kernel.
pub struct DispatchContext<'a> {
    pub kind: PipelineKind,
    pub workgroups: [u32; 3],
    push_constants: &'a [u8],
    bound: BTreeMap<u32, Vec<BindingEntry>>,
    buffers: &'a mut HashMap<BufferHandle, BufferSlot>,
    textures: &'a mut HashMap<TextureHandle, TextureSlot>,
}

impl DispatchContext<'_> {
    fn buffer_range(&self, set: u32, binding: u32) -> Option<(BufferHandle, Range<usize>)> {
        let entry = self.bound.get(&set)?.iter().find(|e| e.binding == binding)?;
        match entry.resource {
            BindingResource::Buffer { buffer, offset, size } => {
                Some((buffer, offset as usize..(offset + size) as usize))
            }
            _ => None,
        }
    }

    /// Push constants decoded as `T`.
    pub fn push_constants<T: Pod>(&self) -> Option<T> {
        bytemuck::try_pod_read_unaligned(self.push_constants.get(..std::mem::size_of::<T>())?).ok()
    }

    /// Bytes of the buffer range bound at (`set`, `binding`).
    pub fn binding(&self, set: u32, binding: u32) -> Option<&[u8]> {
        let (buffer, range) = self.buffer_range(set, binding)?;
        self.buffers.get(&buffer)?.data.get(range)
    }

    pub fn binding_mut(&mut self, set: u32, binding: u32) -> Option<&mut [u8]> {
        let (buffer, range) = self.buffer_range(set, binding)?;
        self.buffers.get_mut(&buffer)?.data.get_mut(range)
    }

    /// Copy a bound buffer range out as a vector of `T`.
    pub fn read<T: Pod>(&self, set: u32, binding: u32) -> Vec<T> {
        self.binding(set, binding)
            .map(|bytes| {
                let whole = bytes.len() / std::mem::size_of::<T>() * std::mem::size_of::<T>();
                bytemuck::pod_collect_to_vec(&bytes[..whole])
            })
            .unwrap_or_default()
    }

    /// Overwrite the start of a bound buffer range. Returns false if unbound.
    pub fn write<T: Pod>(&mut self, set: u32, binding: u32, data: &[T]) -> bool {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        match self.binding_mut(set, binding) {
            Some(dst) if dst.len() >= bytes.len() => {
                dst[..bytes.len()].copy_from_slice(bytes);
                true
            }
            _ => false,
        }
    }

    /// Texels of the `index`-th texture in a bound texture array.
    pub fn array_texture(&self, set: u32, binding: u32, index: usize) -> Option<&[u8]> {
        let entry = self.bound.get(&set)?.iter().find(|e| e.binding == binding)?;
        match &entry.resource {
            BindingResource::TextureArray(textures) => {
                Some(self.textures.get(textures.get(index)?)?.data.as_slice())
            }
            BindingResource::Texture(texture) if index == 0 => {
                Some(self.textures.get(texture)?.data.as_slice())
            }
            _ => None,
        }
    }
}

fn checked_range(len: usize, offset: u64, size: u64) -> Result<Range<usize>> {
    let end = offset
        .checked_add(size)
        .filter(|&end| end <= len as u64)
        .ok_or_else(|| {
            Error::device(format!("range {offset}+{size} outside {len}-byte resource"))
        })?;
    Ok(offset as usize..end as usize)
}

/// In-memory [`GpuDevice`].
pub struct HeadlessDevice {
    props: DeviceProperties,
    memory_budget: Option<u64>,
    state: Mutex<HeadlessState>,
    kernels: Mutex<HashMap<PipelineKind, Kernel>>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(DeviceProperties::default())
    }
}

impl HeadlessDevice {
    pub fn new(props: DeviceProperties) -> Self {
        Self {
            props,
            memory_budget: None,
            state: Mutex::new(HeadlessState {
                next_address: 0x1000_0000,
                ..Default::default()
            }),
            kernels: Mutex::new(HashMap::new()),
        }
    }

    /// Fail allocations once `bytes` of buffers and textures are live.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Run `kernel` for every dispatch of pipelines of `kind`.
    pub fn register_kernel(
        &self,
        kind: PipelineKind,
        kernel: impl FnMut(&mut DispatchContext<'_>) + Send + 'static,
    ) {
        self.kernels.lock().insert(kind, Box::new(kernel));
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().submissions.clone()
    }

    pub fn clear_submissions(&self) {
        self.state.lock().submissions.clear();
    }

    /// Buffer bytes regardless of memory location.
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).map(|b| b.data.clone())
    }

    pub fn texture_contents(&self, texture: TextureHandle) -> Option<Vec<u8>> {
        self.state.lock().textures.get(&texture).map(|t| t.data.clone())
    }

    pub fn texture_extent(&self, texture: TextureHandle) -> Option<(u32, u32, TextureFormat)> {
        self.state
            .lock()
            .textures
            .get(&texture)
            .map(|t| (t.width, t.height, t.format))
    }

    /// Generated prelude of the first pipeline of `kind`.
    pub fn pipeline_prelude(&self, kind: PipelineKind) -> Option<String> {
        let state = self.state.lock();
        let mut pipelines: Vec<_> =
            state.pipelines.iter().filter(|(_, p)| p.kind == kind).collect();
        pipelines.sort_by_key(|(h, _)| **h);
        pipelines.first().map(|(_, p)| p.prelude.clone())
    }

    pub fn bind_group_entries(&self, group: BindGroupHandle) -> Option<Vec<BindingEntry>> {
        self.state.lock().groups.get(&group).map(|g| g.entries.clone())
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.state.lock().textures.len()
    }

    pub fn live_bind_groups(&self) -> usize {
        self.state.lock().groups.len()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().allocated_bytes
    }

    fn validate_group(state: &HeadlessState, desc: &BindGroupDesc<'_>) -> Result<()> {
        let pipeline = state
            .pipelines
            .get(&desc.pipeline)
            .ok_or(Error::InvalidHandle("pipeline"))?;
        let layout = pipeline.sets.get(desc.set as usize).ok_or_else(|| {
            Error::device(format!("{}: pipeline has no set {}", desc.label, desc.set))
        })?;

        for entry in desc.entries {
            let slot = layout.entry(entry.binding).ok_or_else(|| {
                Error::device(format!("{}: binding {} not in layout", desc.label, entry.binding))
            })?;
            let compatible = match (&entry.resource, slot.kind) {
                (
                    BindingResource::Buffer { buffer, offset, size },
                    BindingKind::StorageBuffer { .. },
                ) => {
                    let data = &state
                        .buffers
                        .get(buffer)
                        .ok_or(Error::InvalidHandle("buffer"))?
                        .data;
                    checked_range(data.len(), *offset, *size)?;
                    true
                }
                (BindingResource::Texture(texture), BindingKind::SampledTexture) => {
                    state.textures.contains_key(texture)
                }
                (BindingResource::TextureArray(textures), BindingKind::TextureArray { count }) => {
                    textures.len() as u32 <= count
                        && textures.iter().all(|t| state.textures.contains_key(t))
                }
                _ => false,
            };
            if !compatible {
                return Err(Error::device(format!(
                    "{}: resource at binding {} does not match {:?}",
                    desc.label, entry.binding, slot.kind
                )));
            }
        }
        Ok(())
    }

    fn execute(
        state: &mut HeadlessState,
        kernels: &mut HashMap<PipelineKind, Kernel>,
        commands: &CommandList,
    ) -> Result<()> {
        let mut pipeline: Option<PipelineHandle> = None;
        let mut push: Vec<u8> = Vec::new();
        let mut bound: BTreeMap<u32, BindGroupHandle> = BTreeMap::new();

        for command in commands.commands() {
            match command {
                Command::BindPipeline(p) => {
                    if !state.pipelines.contains_key(p) {
                        return Err(Error::InvalidHandle("pipeline"));
                    }
                    pipeline = Some(*p);
                }
                Command::PushConstants(bytes) => push = bytes.to_vec(),
                Command::BindGroup { set, group } => {
                    if !state.groups.contains_key(group) {
                        return Err(Error::InvalidHandle("bind group"));
                    }
                    bound.insert(*set, *group);
                }
                Command::Dispatch { x, y, z } => {
                    let p = pipeline.ok_or_else(|| Error::device("dispatch without a pipeline"))?;
                    let kind = state.pipelines[&p].kind;
                    if let Some(kernel) = kernels.get_mut(&kind) {
                        let resolved = bound
                            .iter()
                            .filter_map(|(set, g)| {
                                state.groups.get(g).map(|g| (*set, g.entries.clone()))
                            })
                            .collect();
                        let mut ctx = DispatchContext {
                            kind,
                            workgroups: [*x, *y, *z],
                            push_constants: &push,
                            bound: resolved,
                            buffers: &mut state.buffers,
                            textures: &mut state.textures,
                        };
                        kernel(&mut ctx);
                    }
                }
                Command::Barrier(_) => {}
                Command::FillBuffer { buffer, offset, size, value } => {
                    let slot = state.buffers.get_mut(buffer).ok_or(Error::InvalidHandle("buffer"))?;
                    let range = checked_range(slot.data.len(), *offset, *size)?;
                    let pattern = value.to_le_bytes();
                    for (i, byte) in slot.data[range].iter_mut().enumerate() {
                        *byte = pattern[i % 4];
                    }
                }
                Command::CopyBuffer { src, dst, regions } => {
                    for region in regions {
                        Self::copy_bytes(
                            state,
                            *src,
                            region.src_offset,
                            *dst,
                            region.dst_offset,
                            region.size,
                        )?;
                    }
                }
                Command::BuildAccelerationStructure { src, dst, bytes, .. } => {
                    Self::copy_bytes(state, *src, 0, *dst, 0, *bytes)?;
                }
                Command::CopyBufferToTexture { src, offset, dst } => {
                    let texture = state.textures.get(dst).ok_or(Error::InvalidHandle("texture"))?;
                    let len = texture.data.len() as u64;
                    let slot = state.buffers.get(src).ok_or(Error::InvalidHandle("buffer"))?;
                    let range = checked_range(slot.data.len(), *offset, len)?;
                    let bytes = slot.data[range].to_vec();
                    if let Some(texture) = state.textures.get_mut(dst) {
                        texture.data.copy_from_slice(&bytes);
                    }
                }
                Command::CopyTextureToBuffer { src, dst, offset } => {
                    let texture = state.textures.get(src).ok_or(Error::InvalidHandle("texture"))?;
                    let bytes = texture.data.clone();
                    let slot = state.buffers.get_mut(dst).ok_or(Error::InvalidHandle("buffer"))?;
                    let range = checked_range(slot.data.len(), *offset, bytes.len() as u64)?;
                    slot.data[range].copy_from_slice(&bytes);
                }
            }
        }
        Ok(())
    }

    fn copy_bytes(
        state: &mut HeadlessState,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let source = state.buffers.get(&src).ok_or(Error::InvalidHandle("buffer"))?;
        let range = checked_range(source.data.len(), src_offset, size)?;
        let bytes = source.data[range].to_vec();
        let target = state.buffers.get_mut(&dst).ok_or(Error::InvalidHandle("buffer"))?;
        let range = checked_range(target.data.len(), dst_offset, size)?;
        target.data[range].copy_from_slice(&bytes);
        Ok(())
    }
}

impl GpuDevice for HeadlessDevice {
    fn properties(&self) -> DeviceProperties {
        self.props
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<BufferHandle> {
        let mut state = self.state.lock();
        state.reserve(self.memory_budget, desc.label, desc.size)?;
        let handle = BufferHandle(state.next_id());
        let address = state.next_address;
        state.next_address += align_offset(desc.size.max(1), 256);
        state.buffers.insert(
            handle,
            BufferSlot {
                data: vec![0; desc.size as usize],
                location: desc.location,
                address,
            },
        );
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        if let Some(slot) = state.buffers.remove(&buffer) {
            state.allocated_bytes -= slot.data.len() as u64;
        }
    }

    fn buffer_address(&self, buffer: BufferHandle) -> Result<DeviceAddress> {
        self.state
            .lock()
            .buffers
            .get(&buffer)
            .map(|b| b.address)
            .ok_or(Error::InvalidHandle("buffer"))
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.buffers.get_mut(&buffer).ok_or(Error::InvalidHandle("buffer"))?;
        if slot.location != MemoryLocation::HostVisible {
            return Err(Error::device("host write to a buffer that is not host visible"));
        }
        let range = checked_range(slot.data.len(), offset, data.len() as u64)?;
        slot.data[range].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, out: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let slot = state.buffers.get(&buffer).ok_or(Error::InvalidHandle("buffer"))?;
        if slot.location == MemoryLocation::DeviceLocal {
            return Err(Error::device("host read from device-local memory"));
        }
        let range = checked_range(slot.data.len(), offset, out.len() as u64)?;
        out.copy_from_slice(&slot.data[range]);
        Ok(())
    }

    fn create_texture(&self, desc: &TextureDesc<'_>) -> Result<TextureHandle> {
        let mut state = self.state.lock();
        state.reserve(self.memory_budget, desc.label, desc.byte_size())?;
        let handle = TextureHandle(state.next_id());
        state.textures.insert(
            handle,
            TextureSlot {
                data: vec![0; desc.byte_size() as usize],
                width: desc.width,
                height: desc.height,
                format: desc.format,
            },
        );
        Ok(handle)
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        let mut state = self.state.lock();
        if let Some(slot) = state.textures.remove(&texture) {
            state.allocated_bytes -= slot.data.len() as u64;
        }
    }

    fn write_texture(&self, texture: TextureHandle, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.textures.get_mut(&texture).ok_or(Error::InvalidHandle("texture"))?;
        if slot.data.len() != data.len() {
            return Err(Error::device(format!(
                "texture upload of {} bytes into {}-byte texture",
                data.len(),
                slot.data.len()
            )));
        }
        slot.data.copy_from_slice(data);
        Ok(())
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<'_>) -> Result<PipelineHandle> {
        if desc.push_constant_bytes > self.props.max_push_constant_bytes {
            return Err(Error::device(format!(
                "{}: {} push constant bytes exceed limit {}",
                desc.label, desc.push_constant_bytes, self.props.max_push_constant_bytes
            )));
        }
        let mut state = self.state.lock();
        let handle = PipelineHandle(state.next_id());
        state.pipelines.insert(
            handle,
            PipelineSlot {
                kind: desc.kind,
                sets: desc.sets.clone(),
                prelude: desc.prelude.clone(),
            },
        );
        Ok(handle)
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        self.state.lock().pipelines.remove(&pipeline);
    }

    fn create_bind_group(&self, desc: &BindGroupDesc<'_>) -> Result<BindGroupHandle> {
        let mut state = self.state.lock();
        Self::validate_group(&state, desc)?;
        let handle = BindGroupHandle(state.next_id());
        state.groups.insert(
            handle,
            GroupSlot {
                entries: desc.entries.to_vec(),
            },
        );
        Ok(handle)
    }

    fn destroy_bind_group(&self, group: BindGroupHandle) {
        self.state.lock().groups.remove(&group);
    }

    fn create_fence(&self) -> Result<FenceHandle> {
        let mut state = self.state.lock();
        let handle = FenceHandle(state.next_id());
        state.fences.insert(handle, false);
        Ok(handle)
    }

    fn wait_fence(&self, fence: FenceHandle) -> Result<()> {
        match self.state.lock().fences.get(&fence) {
            Some(true) => Ok(()),
            Some(false) => Err(Error::device("wait on a fence with no pending submission")),
            None => Err(Error::InvalidHandle("fence")),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<()> {
        let mut state = self.state.lock();
        let signaled = state.fences.get_mut(&fence).ok_or(Error::InvalidHandle("fence"))?;
        *signaled = false;
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

    fn submit(
        &self,
        queue: QueueId,
        commands: CommandList,
        fence: Option<FenceHandle>,
        signal: &[SemaphoreHandle],
    ) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(fence) = fence {
            match state.fences.get(&fence) {
                None => return Err(Error::InvalidHandle("fence")),
                Some(true) => {
                    return Err(Error::device("submit with a fence that is still signaled"));
                }
                Some(false) => {}
            }
        }

        {
            let mut kernels = self.kernels.lock();
            Self::execute(&mut state, &mut kernels, &commands)?;
        }

        if let Some(fence) = fence {
            state.fences.insert(fence, true);
        }
        state.submissions.push(SubmissionRecord {
            queue,
            commands,
            fence,
            signal: signal.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BufferDesc, CopyRegion, LayoutEntry};

    fn layout() -> Vec<BindSetLayout> {
        vec![BindSetLayout {
            entries: vec![LayoutEntry {
                binding: 0,
                kind: BindingKind::StorageBuffer { read_only: false },
            }],
        }]
    }

    #[test]
    fn test_host_write_copy_read() {
        let dev = HeadlessDevice::default();
        let staging = dev.create_buffer(&BufferDesc::staging("staging", 16)).unwrap();
        let local = dev.create_buffer(&BufferDesc::storage("local", 16)).unwrap();
        let readback = dev.create_buffer(&BufferDesc::readback("readback", 16)).unwrap();

        dev.write_buffer(staging, 4, &[1, 2, 3, 4]).unwrap();
        assert!(dev.write_buffer(local, 0, &[0]).is_err());

        let mut cmd = CommandList::new();
        let all = [CopyRegion { src_offset: 0, dst_offset: 0, size: 16 }];
        cmd.copy_buffer(staging, local, &all);
        cmd.copy_buffer(local, readback, &all);
        let fence = dev.create_fence().unwrap();
        dev.submit(QueueId::compute(0), cmd, Some(fence), &[]).unwrap();
        dev.wait_fence(fence).unwrap();

        let mut out = [0u8; 4];
        dev.read_buffer(readback, 4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(dev.read_buffer(local, 0, &mut out).is_err());
    }

    #[test]
    fn test_fill_pattern() {
        let dev = HeadlessDevice::default();
        let buf = dev.create_buffer(&BufferDesc::readback("fill", 8)).unwrap();
        let mut cmd = CommandList::new();
        cmd.fill_buffer(buf, 0, 8, 0x0403_0201);
        dev.submit(QueueId::compute(0), cmd, None, &[]).unwrap();
        assert_eq!(dev.buffer_contents(buf).unwrap(), vec![1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn test_fence_lifecycle() {
        let dev = HeadlessDevice::default();
        let fence = dev.create_fence().unwrap();
        assert!(dev.wait_fence(fence).is_err());
        dev.submit(QueueId::compute(1), CommandList::new(), Some(fence), &[]).unwrap();
        dev.wait_fence(fence).unwrap();
        // Resubmitting before reset is a usage error.
        assert!(dev.submit(QueueId::compute(1), CommandList::new(), Some(fence), &[]).is_err());
        dev.reset_fence(fence).unwrap();
        assert!(dev.wait_fence(fence).is_err());
    }

    #[test]
    fn test_memory_budget() {
        let dev = HeadlessDevice::default().with_memory_budget(100);
        let a = dev.create_buffer(&BufferDesc::storage("a", 60)).unwrap();
        let err = dev.create_buffer(&BufferDesc::storage("b", 60)).unwrap_err();
        assert!(err.is_fatal());
        dev.destroy_buffer(a);
        dev.create_buffer(&BufferDesc::storage("b", 60)).unwrap();
    }

    #[test]
    fn test_bind_group_validation() {
        let dev = HeadlessDevice::default();
        let pipeline = dev
            .create_compute_pipeline(&ComputePipelineDesc {
                label: "test",
                kind: PipelineKind::Exposure,
                source: "",
                prelude: String::new(),
                sets: layout(),
                push_constant_bytes: 0,
            })
            .unwrap();
        let buf = dev.create_buffer(&BufferDesc::storage("buf", 64)).unwrap();

        let ok = [BindingEntry::buffer(0, buf, 0, 64)];
        dev.create_bind_group(&BindGroupDesc { label: "ok", pipeline, set: 0, entries: &ok })
            .unwrap();

        let oob = [BindingEntry::buffer(0, buf, 32, 64)];
        assert!(dev
            .create_bind_group(&BindGroupDesc { label: "oob", pipeline, set: 0, entries: &oob })
            .is_err());

        let unknown = [BindingEntry::buffer(3, buf, 0, 64)];
        assert!(dev
            .create_bind_group(&BindGroupDesc {
                label: "unknown",
                pipeline,
                set: 0,
                entries: &unknown,
            })
            .is_err());
    }

    #[test]
    fn test_kernel_sees_bindings() {
        let dev = HeadlessDevice::default();
        let pipeline = dev
            .create_compute_pipeline(&ComputePipelineDesc {
                label: "k",
                kind: PipelineKind::Tonemap,
                source: "",
                prelude: String::new(),
                sets: layout(),
                push_constant_bytes: 4,
            })
            .unwrap();
        let buf = dev.create_buffer(&BufferDesc::readback("out", 8)).unwrap();
        let group = dev
            .create_bind_group(&BindGroupDesc {
                label: "g",
                pipeline,
                set: 0,
                entries: &[BindingEntry::buffer(0, buf, 0, 8)],
            })
            .unwrap();

        dev.register_kernel(PipelineKind::Tonemap, |ctx| {
            let scale: u32 = ctx.push_constants().unwrap();
            let data = [ctx.workgroups[0] * scale, ctx.workgroups[1]];
            assert!(ctx.write(0, 0, &data));
        });

        let mut cmd = CommandList::new();
        cmd.bind_pipeline(pipeline);
        cmd.push_constants(&10u32.to_le_bytes());
        cmd.bind_group(0, group);
        cmd.dispatch(3, 7, 1);
        dev.submit(QueueId::compute(0), cmd, None, &[]).unwrap();

        let words: Vec<u32> = bytemuck::pod_collect_to_vec(&dev.buffer_contents(buf).unwrap());
        assert_eq!(words, vec![30, 7]);
        assert_eq!(dev.submissions().len(), 1);
    }
}
