//! Batch handle: the environments of one batch and their device state.

use std::sync::Arc;

use crate::gpu::{BufferHandle, DeviceAddress, GpuBuffer, GpuDevice};
use crate::scene::{EnvMapGroup, Environment};
use crate::util::Result;

use super::framebuffer::FramebufferState;
use super::state::PerBatchState;

/// Exported output plane, for consumers reading device memory in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputPlane {
    pub buffer: BufferHandle,
    pub address: DeviceAddress,
    pub bytes: u64,
}

impl OutputPlane {
    pub(crate) fn of<D: GpuDevice>(buffer: &GpuBuffer<D>) -> Result<Self> {
        Ok(Self {
            buffer: buffer.handle(),
            address: buffer.address()?,
            bytes: buffer.size(),
        })
    }
}

/// One batch of environments rendered together.
///
/// Made by [`Renderer::make_render_batch`](super::Renderer::make_render_batch).
/// Consecutive renders alternate between two bind groups so reservoirs
/// written by one frame feed the next.
pub struct RenderBatch<D: GpuDevice> {
    pub(crate) envs: Vec<Environment<D>>,
    pub(crate) fb: FramebufferState<D>,
    pub(crate) state: PerBatchState<D>,
    pub(crate) cur_buffer: usize,
    /// Env maps bound by the submitted frame, kept alive until it completes.
    pub(crate) in_flight_env_maps: Option<Arc<EnvMapGroup<D>>>,
    pub(crate) in_flight: bool,
}

impl<D: GpuDevice> RenderBatch<D> {
    pub(crate) fn new(
        envs: Vec<Environment<D>>,
        fb: FramebufferState<D>,
        state: PerBatchState<D>,
    ) -> Self {
        Self {
            envs,
            fb,
            state,
            cur_buffer: 0,
            in_flight_env_maps: None,
            in_flight: false,
        }
    }

    pub fn environments(&self) -> &[Environment<D>] {
        &self.envs
    }

    pub fn environments_mut(&mut self) -> &mut [Environment<D>] {
        &mut self.envs
    }

    /// Ping-pong slot the next render binds.
    #[inline]
    pub fn cur_buffer(&self) -> usize {
        self.cur_buffer
    }

    /// Submitted and not yet waited on.
    #[inline]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn state(&self) -> &PerBatchState<D> {
        &self.state
    }

    pub fn framebuffer(&self) -> &FramebufferState<D> {
        &self.fb
    }
}
