//! Per-batch bind groups, parameter buffers and sync objects.

use std::sync::Arc;

use crate::config::{RenderConfig, ADAPTIVE_SAMPLES_PER_THREAD};
use crate::gpu::{
    BindGroupDesc, BindGroupHandle, BindingEntry, BufferDesc, FenceHandle, GpuBuffer, GpuDevice,
    PipelineHandle, SemaphoreHandle,
};
use crate::layout::{FramebufferConfig, InputTile, ParamBufferConfig};
use crate::util::{divide_round_up, Result};

use super::bsdf::BsdfLuts;
use super::framebuffer::FramebufferState;
use super::pipelines::{post_binding, rt_binding, rt_set, RenderPipelines};

fn whole<D: GpuDevice>(binding: u32, buffer: &GpuBuffer<D>) -> BindingEntry {
    BindingEntry::buffer(binding, buffer.handle(), 0, buffer.size())
}

/// Everything one batch handle owns besides its framebuffer.
///
/// The two path-tracing groups differ only in the reservoir wiring: group
/// `i` writes reservoir buffer `i` and reads buffer `1 - i`, so alternating
/// groups frame to frame reuses last frame's reservoirs without copies.
pub struct PerBatchState<D: GpuDevice> {
    device: Arc<D>,
    rt_groups: [BindGroupHandle; 2],
    exposure_group: Option<BindGroupHandle>,
    tonemap_group: Option<BindGroupHandle>,
    pub fence: FenceHandle,
    pub render_signal: Option<SemaphoreHandle>,
    pub swapchain_ready: Option<SemaphoreHandle>,
    /// Host-visible copy of the parameter blob, written each frame.
    pub param_staging: GpuBuffer<D>,
    pub param_device: GpuBuffer<D>,
    /// Adaptive work list, written by the host before each refinement pass.
    pub tile_input: Option<GpuBuffer<D>>,
}

/// Number of [`InputTile`] slots a batch may queue at once.
pub fn tile_input_capacity(cfg: &RenderConfig, fb_cfg: &FramebufferConfig) -> u64 {
    fb_cfg.batch_size() as u64
        * fb_cfg.tiles_per_image() as u64
        * divide_round_up(cfg.spp, ADAPTIVE_SAMPLES_PER_THREAD) as u64
}

impl<D: GpuDevice> PerBatchState<D> {
    /// Allocate parameter buffers and bind everything against `target`,
    /// which is either the path-tracing or the probe-bake pipeline.
    /// Post-processing groups exist only for the path tracer with tonemapping.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip_all, fields(param_bytes = param_cfg.total_param_bytes))]
    pub fn new(
        device: &Arc<D>,
        cfg: &RenderConfig,
        param_cfg: &ParamBufferConfig,
        fb_cfg: &FramebufferConfig,
        fb: &FramebufferState<D>,
        bsdf: &BsdfLuts<D>,
        pipelines: &RenderPipelines<D>,
        target: PipelineHandle,
    ) -> Result<Self> {
        let param_bytes = param_cfg.total_param_bytes;
        let param_staging =
            GpuBuffer::new(device, &BufferDesc::staging("params staging", param_bytes))?;
        let param_device = GpuBuffer::new(device, &BufferDesc::storage("params", param_bytes))?;

        let tile_input = if cfg.flags.adaptive_sample {
            let bytes = tile_input_capacity(cfg, fb_cfg) * std::mem::size_of::<InputTile>() as u64;
            Some(GpuBuffer::new(device, &BufferDesc::staging("tile input", bytes))?)
        } else {
            None
        };

        let mut shared = Vec::new();
        let params = [
            rt_binding::TRANSFORMS,
            rt_binding::MATERIAL_INDICES,
            rt_binding::LIGHTS,
            rt_binding::ENVS,
        ];
        for (binding, (offset, size)) in params.into_iter().zip(param_cfg.regions()) {
            shared.push(BindingEntry::buffer(binding, param_device.handle(), offset, size));
        }
        for (i, texture) in bsdf.handles().into_iter().enumerate() {
            shared.push(BindingEntry::texture(rt_binding::DIFFUSE_AVG_ALBEDO + i as u32, texture));
        }
        shared.push(whole(rt_binding::HDR, &fb.hdr));
        if let (Some(normal), Some(albedo)) = (&fb.normal, &fb.albedo) {
            shared.push(whole(rt_binding::NORMAL, normal));
            shared.push(whole(rt_binding::ALBEDO, albedo));
        }
        if let Some(illuminance) = &fb.illuminance {
            shared.push(whole(rt_binding::ILLUMINANCE, illuminance));
        }
        if let (Some(tiles), Some(adaptive)) = (&tile_input, &fb.adaptive) {
            shared.push(whole(rt_binding::TILE_INPUT, tiles));
            shared.push(whole(rt_binding::ADAPTIVE, adaptive));
        }
        if !cfg.flags.tonemap {
            shared.push(whole(rt_binding::OUTPUT, &fb.output));
        }

        let mut rt_groups = [BindGroupHandle(0); 2];
        for (i, group) in rt_groups.iter_mut().enumerate() {
            let mut entries = shared.clone();
            entries.push(whole(rt_binding::CUR_RESERVOIRS, &fb.reservoirs[i]));
            entries.push(whole(rt_binding::PREV_RESERVOIRS, &fb.reservoirs[1 - i]));
            *group = device.create_bind_group(&BindGroupDesc {
                label: "batch",
                pipeline: target,
                set: rt_set::BATCH,
                entries: &entries,
            })?;
        }

        let (exposure_group, tonemap_group) = match &fb.illuminance {
            Some(illuminance) if cfg.flags.tonemap && target == pipelines.path_trace => {
                let exposure = device.create_bind_group(&BindGroupDesc {
                    label: "exposure",
                    pipeline: pipelines.exposure,
                    set: 0,
                    entries: &[
                        whole(post_binding::ILLUMINANCE, illuminance),
                        whole(post_binding::HDR, &fb.hdr),
                    ],
                })?;
                let tonemap = device.create_bind_group(&BindGroupDesc {
                    label: "tonemap",
                    pipeline: pipelines.tonemap,
                    set: 0,
                    entries: &[
                        whole(post_binding::ILLUMINANCE, illuminance),
                        whole(post_binding::HDR, &fb.hdr),
                        whole(post_binding::OUTPUT, &fb.output),
                    ],
                })?;
                (Some(exposure), Some(tonemap))
            }
            _ => (None, None),
        };

        let fence = device.create_fence()?;
        let (render_signal, swapchain_ready) = if cfg.presentation_enabled() {
            (Some(device.create_semaphore()?), Some(device.create_semaphore()?))
        } else {
            (None, None)
        };

        Ok(Self {
            device: Arc::clone(device),
            rt_groups,
            exposure_group,
            tonemap_group,
            fence,
            render_signal,
            swapchain_ready,
            param_staging,
            param_device,
            tile_input,
        })
    }

    /// Path-tracing group for ping-pong slot `cur_buffer`.
    #[inline]
    pub fn rt_group(&self, cur_buffer: usize) -> BindGroupHandle {
        self.rt_groups[cur_buffer & 1]
    }

    #[inline]
    pub fn exposure_group(&self) -> Option<BindGroupHandle> {
        self.exposure_group
    }

    #[inline]
    pub fn tonemap_group(&self) -> Option<BindGroupHandle> {
        self.tonemap_group
    }
}

impl<D: GpuDevice> Drop for PerBatchState<D> {
    fn drop(&mut self) {
        let groups = self
            .rt_groups
            .into_iter()
            .chain(self.exposure_group)
            .chain(self.tonemap_group);
        for group in groups {
            self.device.destroy_bind_group(group);
        }
        self.device.destroy_fence(self.fence);
        for sema in self.render_signal.into_iter().chain(self.swapchain_ready) {
            self.device.destroy_semaphore(sema);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BindingResource, HeadlessDevice};
    use crate::render::{BsdfTables, ShaderSources};

    fn resource(dev: &HeadlessDevice, group: BindGroupHandle, binding: u32) -> BindingResource {
        dev.bind_group_entries(group)
            .unwrap()
            .into_iter()
            .find(|e| e.binding == binding)
            .unwrap()
            .resource
    }

    #[test]
    fn test_reservoirs_cross_bound() {
        let dev = Arc::new(HeadlessDevice::default());
        let cfg = RenderConfig {
            batch_size: 2,
            spp: 8,
            flags: crate::config::RenderFlags {
                adaptive_sample: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let fb_cfg = FramebufferConfig::from_config(&cfg);
        let param_cfg = ParamBufferConfig::from_config(&cfg, 256);
        let pipelines = RenderPipelines::new(&dev, &cfg, &ShaderSources::default()).unwrap();
        let bsdf = BsdfLuts::upload(&dev, &BsdfTables::uniform(1.0)).unwrap();
        let fb = FramebufferState::new(&dev, &cfg.flags, &fb_cfg).unwrap();
        let state = PerBatchState::new(
            &dev,
            &cfg,
            &param_cfg,
            &fb_cfg,
            &fb,
            &bsdf,
            &pipelines,
            pipelines.path_trace,
        )
        .unwrap();

        let (a, b) = (state.rt_group(0), state.rt_group(1));
        assert_eq!(
            resource(&dev, a, rt_binding::CUR_RESERVOIRS),
            resource(&dev, b, rt_binding::PREV_RESERVOIRS)
        );
        assert_eq!(
            resource(&dev, a, rt_binding::PREV_RESERVOIRS),
            resource(&dev, b, rt_binding::CUR_RESERVOIRS)
        );
        assert_ne!(
            resource(&dev, a, rt_binding::CUR_RESERVOIRS),
            resource(&dev, b, rt_binding::CUR_RESERVOIRS)
        );
        assert_eq!(
            resource(&dev, a, rt_binding::HDR),
            resource(&dev, b, rt_binding::HDR)
        );
        assert!(state.exposure_group().is_some());
        // 2 images x 64 tiles x 1 unit each.
        assert_eq!(state.tile_input.as_ref().unwrap().size(), 128 * 16);

        let groups_before = dev.live_bind_groups();
        drop(state);
        assert_eq!(dev.live_bind_groups(), groups_before - 4);
    }
}
