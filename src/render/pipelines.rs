//! Compute pipelines and their bind-set layouts.

use std::mem::size_of;
use std::sync::Arc;

use crate::config::{RenderConfig, RenderMode};
use crate::gpu::{
    BindSetLayout, BindingKind, ComputePipelineDesc, GpuDevice, LayoutEntry, PipelineHandle,
    PipelineKind,
};
use crate::layout::RtPushConstant;
use crate::util::Result;

use super::shader::{bake_defines, exposure_defines, rt_defines, tonemap_defines};

/// Binding slots of the path-tracing set 0.
pub mod rt_binding {
    pub const TRANSFORMS: u32 = 0;
    pub const MATERIAL_INDICES: u32 = 1;
    pub const LIGHTS: u32 = 2;
    pub const ENVS: u32 = 3;
    pub const REPEAT_SAMPLER: u32 = 4;
    pub const CLAMP_SAMPLER: u32 = 5;
    pub const DIFFUSE_AVG_ALBEDO: u32 = 6;
    pub const DIFFUSE_DIR_ALBEDO: u32 = 7;
    pub const GGX_AVG_ALBEDO: u32 = 8;
    pub const GGX_DIR_ALBEDO: u32 = 9;
    pub const GGX_INVERSE: u32 = 10;
    /// Reservoirs written this frame.
    pub const CUR_RESERVOIRS: u32 = 11;
    /// Reservoirs written last frame.
    pub const PREV_RESERVOIRS: u32 = 12;
    pub const HDR: u32 = 13;
    pub const NORMAL: u32 = 14;
    pub const ALBEDO: u32 = 15;
    pub const ILLUMINANCE: u32 = 16;
    pub const TILE_INPUT: u32 = 17;
    pub const ADAPTIVE: u32 = 18;
    /// Direct output when no tonemap pass writes it.
    pub const OUTPUT: u32 = 19;
}

/// Bind set indices of the path-tracing and bake pipelines.
pub mod rt_set {
    pub const BATCH: u32 = 0;
    pub const SCENES: u32 = 1;
    pub const ENV_MAPS: u32 = 2;
    pub const PROBES: u32 = 3;
}

/// Binding slots shared by the exposure and tonemap sets.
pub mod post_binding {
    pub const ILLUMINANCE: u32 = 0;
    pub const HDR: u32 = 1;
    pub const OUTPUT: u32 = 2;
}

/// Size of the probe texture array in the probe set.
pub const MAX_PROBES: u32 = 256;

/// Opaque kernel sources. The engine never looks inside them.
#[derive(Debug, Clone, Default)]
pub struct ShaderSources {
    pub path_trace: String,
    pub probe_bake: String,
    pub exposure: String,
    pub tonemap: String,
}

fn storage(binding: u32, read_only: bool) -> LayoutEntry {
    LayoutEntry {
        binding,
        kind: BindingKind::StorageBuffer { read_only },
    }
}

fn texture(binding: u32) -> LayoutEntry {
    LayoutEntry {
        binding,
        kind: BindingKind::SampledTexture,
    }
}

/// Set 0 of the path tracer. Optional planes only appear when the flags
/// that allocate them are on.
pub fn batch_set_layout(cfg: &RenderConfig) -> BindSetLayout {
    use rt_binding::*;

    let mut entries = vec![
        storage(TRANSFORMS, true),
        storage(MATERIAL_INDICES, true),
        storage(LIGHTS, true),
        storage(ENVS, true),
        LayoutEntry {
            binding: REPEAT_SAMPLER,
            kind: BindingKind::Sampler { clamp: false },
        },
        LayoutEntry {
            binding: CLAMP_SAMPLER,
            kind: BindingKind::Sampler { clamp: true },
        },
        texture(DIFFUSE_AVG_ALBEDO),
        texture(DIFFUSE_DIR_ALBEDO),
        texture(GGX_AVG_ALBEDO),
        texture(GGX_DIR_ALBEDO),
        texture(GGX_INVERSE),
        storage(CUR_RESERVOIRS, false),
        storage(PREV_RESERVOIRS, false),
        storage(HDR, false),
    ];
    if cfg.flags.auxiliary_outputs {
        entries.push(storage(NORMAL, false));
        entries.push(storage(ALBEDO, false));
    }
    if cfg.flags.tonemap || cfg.flags.adaptive_sample {
        entries.push(storage(ILLUMINANCE, false));
    }
    if cfg.flags.adaptive_sample {
        entries.push(storage(TILE_INPUT, true));
        entries.push(storage(ADAPTIVE, false));
    }
    if !cfg.flags.tonemap {
        entries.push(storage(OUTPUT, false));
    }
    BindSetLayout { entries }
}

fn rt_sets(cfg: &RenderConfig, with_probes: bool) -> Vec<BindSetLayout> {
    let mut sets = vec![
        batch_set_layout(cfg),
        BindSetLayout {
            entries: vec![storage(0, true)],
        },
        BindSetLayout {
            entries: vec![LayoutEntry {
                binding: 0,
                kind: BindingKind::TextureArray {
                    count: cfg.max_env_maps * 2,
                },
            }],
        },
    ];
    if with_probes {
        sets.push(BindSetLayout {
            entries: vec![LayoutEntry {
                binding: 0,
                kind: BindingKind::TextureArray { count: MAX_PROBES },
            }],
        });
    }
    sets
}

fn exposure_sets() -> Vec<BindSetLayout> {
    vec![BindSetLayout {
        entries: vec![
            storage(post_binding::ILLUMINANCE, false),
            storage(post_binding::HDR, true),
        ],
    }]
}

fn tonemap_sets() -> Vec<BindSetLayout> {
    vec![BindSetLayout {
        entries: vec![
            storage(post_binding::ILLUMINANCE, true),
            storage(post_binding::HDR, true),
            storage(post_binding::OUTPUT, false),
        ],
    }]
}

/// The four engine pipelines.
pub struct RenderPipelines<D: GpuDevice> {
    device: Arc<D>,
    pub path_trace: PipelineHandle,
    pub probe_bake: PipelineHandle,
    pub exposure: PipelineHandle,
    pub tonemap: PipelineHandle,
    has_probe_set: bool,
}

impl<D: GpuDevice> RenderPipelines<D> {
    #[tracing::instrument(skip_all, fields(mode = ?cfg.mode))]
    pub fn new(device: &Arc<D>, cfg: &RenderConfig, sources: &ShaderSources) -> Result<Self> {
        let push_constant_bytes = size_of::<RtPushConstant>() as u32;
        let has_probe_set = cfg.mode == RenderMode::Biased;

        let path_trace = device.create_compute_pipeline(&ComputePipelineDesc {
            label: "path trace",
            kind: PipelineKind::PathTrace,
            source: &sources.path_trace,
            prelude: rt_defines(cfg)?.prelude(),
            sets: rt_sets(cfg, has_probe_set),
            push_constant_bytes,
        })?;
        let probe_bake = device.create_compute_pipeline(&ComputePipelineDesc {
            label: "probe bake",
            kind: PipelineKind::ProbeBake,
            source: &sources.probe_bake,
            prelude: bake_defines(cfg)?.prelude(),
            sets: rt_sets(cfg, false),
            push_constant_bytes,
        })?;
        let exposure = device.create_compute_pipeline(&ComputePipelineDesc {
            label: "exposure",
            kind: PipelineKind::Exposure,
            source: &sources.exposure,
            prelude: exposure_defines(cfg).prelude(),
            sets: exposure_sets(),
            push_constant_bytes: 0,
        })?;
        let tonemap = device.create_compute_pipeline(&ComputePipelineDesc {
            label: "tonemap",
            kind: PipelineKind::Tonemap,
            source: &sources.tonemap,
            prelude: tonemap_defines(cfg).prelude(),
            sets: tonemap_sets(),
            push_constant_bytes: 0,
        })?;
        tracing::debug!("created render pipelines");

        Ok(Self {
            device: Arc::clone(device),
            path_trace,
            probe_bake,
            exposure,
            tonemap,
            has_probe_set,
        })
    }

    /// Whether the path tracer samples baked probes through set 3.
    #[inline]
    pub fn has_probe_set(&self) -> bool {
        self.has_probe_set
    }
}

impl<D: GpuDevice> Drop for RenderPipelines<D> {
    fn drop(&mut self) {
        for p in [self.path_trace, self.probe_bake, self.exposure, self.tonemap] {
            self.device.destroy_pipeline(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;

    #[test]
    fn test_batch_layout_follows_flags() {
        let mut cfg = RenderConfig::default();
        let layout = batch_set_layout(&cfg);
        assert!(layout.entry(rt_binding::ILLUMINANCE).is_some());
        assert!(layout.entry(rt_binding::NORMAL).is_none());
        assert!(layout.entry(rt_binding::OUTPUT).is_none());

        cfg.flags.tonemap = false;
        cfg.flags.auxiliary_outputs = true;
        let layout = batch_set_layout(&cfg);
        assert!(layout.entry(rt_binding::OUTPUT).is_some());
        assert!(layout.entry(rt_binding::ALBEDO).is_some());
        assert!(layout.entry(rt_binding::ILLUMINANCE).is_none());
    }

    #[test]
    fn test_probe_set_only_in_biased_mode() {
        let dev = Arc::new(HeadlessDevice::default());
        let cfg = RenderConfig::default();
        let p = RenderPipelines::new(&dev, &cfg, &ShaderSources::default()).unwrap();
        assert!(!p.has_probe_set());

        let biased = RenderConfig {
            mode: RenderMode::Biased,
            ..Default::default()
        };
        let p = RenderPipelines::new(&dev, &biased, &ShaderSources::default()).unwrap();
        assert!(p.has_probe_set());
        let prelude = dev.pipeline_prelude(PipelineKind::ProbeBake).unwrap();
        assert!(prelude.contains("const RES_X: u32 = 32u;"));
    }
}
