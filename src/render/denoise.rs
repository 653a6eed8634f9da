//! External collaborators invoked mid-frame: the denoiser and the
//! swapchain presenter.

use crate::gpu::{BufferHandle, GpuDevice, QueueState, SemaphoreHandle};
use crate::layout::FramebufferConfig;
use crate::util::Result;

/// Planes handed to a [`Denoiser`]. The HDR plane is denoised in place.
#[derive(Debug, Clone, Copy)]
pub struct DenoisePlanes<'a> {
    pub hdr: BufferHandle,
    pub albedo: BufferHandle,
    pub normal: BufferHandle,
    pub batch_size: u32,
    pub framebuffer: &'a FramebufferConfig,
}

/// Denoiser run between path tracing and tonemapping.
///
/// Called after the path-tracing work has completed on the device.
pub trait Denoiser<D: GpuDevice>: Send {
    fn denoise(&mut self, device: &D, queue: &QueueState, planes: &DenoisePlanes<'_>) -> Result<()>;
}

/// Swapchain the tonemapped output is shown on.
pub trait Presenter<D: GpuDevice>: Send {
    /// Acquire the next image; `ready` is signaled once it may be written.
    fn acquire_next(&mut self, device: &D, ready: SemaphoreHandle) -> Result<u32>;

    /// Present `image` after every semaphore in `wait` has signaled.
    fn present(
        &mut self,
        device: &D,
        queue: &QueueState,
        image: u32,
        wait: &[SemaphoreHandle],
    ) -> Result<()>;
}
