//! Owned device resources, released on drop.

use std::sync::Arc;

use super::{
    BufferDesc, BufferHandle, DeviceAddress, GpuDevice, TextureDesc, TextureFormat, TextureHandle,
};
use crate::util::Result;

/// Device buffer owned by the engine.
pub struct GpuBuffer<D: GpuDevice> {
    device: Arc<D>,
    handle: BufferHandle,
    size: u64,
}

impl<D: GpuDevice> GpuBuffer<D> {
    pub fn new(device: &Arc<D>, desc: &BufferDesc<'_>) -> Result<Self> {
        let handle = device.create_buffer(desc)?;
        Ok(Self {
            device: Arc::clone(device),
            handle,
            size: desc.size,
        })
    }

    #[inline]
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn address(&self) -> Result<DeviceAddress> {
        self.device.buffer_address(self.handle)
    }

    /// Host write + flush. Buffer must be host-visible.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.device.write_buffer(self.handle, offset, data)
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.device.read_buffer(self.handle, offset, out)
    }
}

impl<D: GpuDevice> Drop for GpuBuffer<D> {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.handle);
    }
}

impl<D: GpuDevice> std::fmt::Debug for GpuBuffer<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish()
    }
}

/// 2D device texture owned by the engine.
pub struct GpuTexture<D: GpuDevice> {
    device: Arc<D>,
    handle: TextureHandle,
    width: u32,
    height: u32,
    format: TextureFormat,
}

impl<D: GpuDevice> GpuTexture<D> {
    pub fn new(device: &Arc<D>, desc: &TextureDesc<'_>) -> Result<Self> {
        let handle = device.create_texture(desc)?;
        Ok(Self {
            device: Arc::clone(device),
            handle,
            width: desc.width,
            height: desc.height,
            format: desc.format,
        })
    }

    #[inline]
    pub fn handle(&self) -> TextureHandle {
        self.handle
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Tightly packed texel bytes.
    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.format.bytes_per_texel() as u64
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.device.write_texture(self.handle, data)
    }
}

impl<D: GpuDevice> Drop for GpuTexture<D> {
    fn drop(&mut self) {
        self.device.destroy_texture(self.handle);
    }
}

impl<D: GpuDevice> std::fmt::Debug for GpuTexture<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuTexture")
            .field("handle", &self.handle)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}
