//! Single-view render used to bake one irradiance probe.

use glam::Vec3;

use crate::config::{LOCAL_WORKGROUP_X, LOCAL_WORKGROUP_Y};
use crate::gpu::{Barrier, CommandList, GpuDevice, GpuTexture, TextureDesc, TextureFormat};
use crate::layout::FramebufferConfig;
use crate::scene::{Camera, Environment};
use crate::util::{divide_round_up, Aabb, Result};

use super::engine::{dirty_flags, restore_dirty, Renderer};
use super::framebuffer::FramebufferState;
use super::shader::{PROBE_HEIGHT, PROBE_WIDTH};
use super::state::PerBatchState;

/// Direction every probe camera looks along.
pub const PROBE_VIEW: Vec3 = Vec3::new(1.0, -0.2, 1.0);

/// Probe-resolution framebuffer plus a batch state bound to the bake
/// pipeline. Reused for every probe of a bake session.
pub struct ProbeRenderState<D: GpuDevice> {
    pub(crate) fb_cfg: FramebufferConfig,
    pub(crate) fb: FramebufferState<D>,
    pub(crate) state: PerBatchState<D>,
}

impl<D: GpuDevice> ProbeRenderState<D> {
    pub fn framebuffer_config(&self) -> &FramebufferConfig {
        &self.fb_cfg
    }
}

/// Camera placed at a probe position.
pub fn probe_camera(position: Vec3) -> Camera {
    Camera::with_tan_fov(position, PROBE_VIEW, Vec3::Y, 1.0, 1.0)
}

impl<D: GpuDevice> Renderer<D> {
    pub fn make_probe_render_state(&self) -> Result<ProbeRenderState<D>> {
        let fb_cfg = FramebufferConfig::for_probe(PROBE_WIDTH, PROBE_HEIGHT);
        let fb = FramebufferState::new(self.device(), &self.config().flags, &fb_cfg)?;
        let state = self.make_batch_state(&fb_cfg, &fb, self.pipelines().probe_bake)?;
        Ok(ProbeRenderState { fb_cfg, fb, state })
    }

    /// Render one probe at `position` and return its HDR image as an
    /// `Rgba32Float` texture.
    ///
    /// Samples are taken in bursts of `burst` with one blocking submission
    /// per burst. Every environment's camera is overridden by the probe
    /// camera for this frame.
    #[tracing::instrument(skip_all, fields(position = ?position))]
    pub fn render_probe(
        &mut self,
        probe: &ProbeRenderState<D>,
        envs: &mut [Environment<D>],
        position: Vec3,
        burst: u32,
    ) -> Result<GpuTexture<D>> {
        let dirty = dirty_flags(envs);
        let result = self.trace_probe(probe, envs, position, burst);
        if result.is_err() {
            restore_dirty(envs, &dirty);
        }
        result
    }

    fn trace_probe(
        &mut self,
        probe: &ProbeRenderState<D>,
        envs: &mut [Environment<D>],
        position: Vec3,
        burst: u32,
    ) -> Result<GpuTexture<D>> {
        let env_maps = self.active_environment_maps();
        let state = &probe.state;
        let bounds = envs.first().map_or(Aabb::EMPTY, |env| env.scene().env_bounds());

        let mut cmd = self.begin_bake_pass(state, &env_maps);
        Self::record_tlas_builds(envs, &mut cmd)?;
        self.pack_params(envs, state, Some(&probe_camera(position)))?;
        self.record_param_upload(&mut cmd, state);

        cmd.fill_buffer(probe.fb.output.handle(), 0, probe.fb_cfg.output_bytes, 0);
        cmd.fill_buffer(probe.fb.hdr.handle(), 0, probe.fb_cfg.hdr_bytes, 0);
        cmd.barrier(Barrier::transfer_to_compute());

        let (x, y) = (
            divide_round_up(probe.fb_cfg.img_width, LOCAL_WORKGROUP_X),
            divide_round_up(probe.fb_cfg.img_height, LOCAL_WORKGROUP_Y),
        );
        for sample_offset in (0..self.config().spp).step_by(burst.max(1) as usize) {
            let push = self.push_constants(sample_offset, bounds);
            cmd.push_constants(bytemuck::bytes_of(&push));
            cmd.dispatch(x, y, 1);
            self.submit_and_wait(cmd, state.fence)?;
            cmd = self.begin_bake_pass(state, &env_maps);
        }
        self.bump_frame_counter();
        self.submit_and_wait(cmd, state.fence)?;

        let texture = GpuTexture::new(
            self.device(),
            &TextureDesc {
                label: "probe",
                width: PROBE_WIDTH,
                height: PROBE_HEIGHT,
                format: TextureFormat::Rgba32Float,
            },
        )?;
        let mut copy = CommandList::new();
        copy.copy_buffer_to_texture(probe.fb.hdr.handle(), 0, texture.handle());
        self.run_blocking(copy)?;
        Ok(texture)
    }
}
