//! Session configuration.
//!
//! [`RenderConfig`] is created once when a renderer starts and is read-only
//! afterwards. It round-trips through JSON so render farms can keep one file
//! per job.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::util::{Error, Result};

/// Compute workgroup size along x (must match the kernels).
pub const LOCAL_WORKGROUP_X: u32 = 8;
/// Compute workgroup size along y.
pub const LOCAL_WORKGROUP_Y: u32 = 8;
/// Compute workgroup size along z (batch axis).
pub const LOCAL_WORKGROUP_Z: u32 = 1;

/// Samples taken by one adaptive work unit.
pub const ADAPTIVE_SAMPLES_PER_THREAD: u32 = 8;

/// Target number of mini-batches per physical framebuffer.
pub const MINIBATCH_DIVISOR: u32 = 2;

/// Env var forcing presentation on, even without a real swapchain.
pub const FAKE_PRESENT_ENV: &str = "PBRBATCH_FAKE_PRESENT";

/// Which kernel family renders the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RenderMode {
    /// Unbiased path tracing.
    #[default]
    PathTracer,
    /// Probe-lit approximation that samples baked irradiance probes.
    Biased,
}

/// Feature switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderFlags {
    /// Emit normal and albedo planes next to color.
    pub auxiliary_outputs: bool,
    /// Run exposure histogram + tonemap passes.
    pub tonemap: bool,
    /// Tile-based adaptive sampling.
    pub adaptive_sample: bool,
    /// Run the external denoiser on the HDR plane.
    pub denoise: bool,
    /// Domain randomization of env maps and light colors.
    pub randomize: bool,
    /// Always use uniform sampling, even when z-Sobol fits.
    pub force_uniform: bool,
}

impl Default for RenderFlags {
    fn default() -> Self {
        Self {
            auxiliary_outputs: false,
            tonemap: true,
            adaptive_sample: false,
            denoise: false,
            randomize: false,
            force_uniform: false,
        }
    }
}

/// Convergence control for the adaptive refinement loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveSettings {
    /// Hard cap on refinement iterations per frame.
    pub max_iterations: u32,
    /// Tiles above this normalized variance are sampled again.
    pub variance_threshold: f32,
    /// Tiles without a variance estimate keep sampling until
    /// `spp * min_sample_multiplier` samples.
    pub min_sample_multiplier: u32,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10_000,
            variance_threshold: 5e-4,
            min_sample_multiplier: 10,
        }
    }
}

/// Immutable per-session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub gpu_id: i32,
    pub num_loaders: u32,
    pub batch_size: u32,
    pub img_width: u32,
    pub img_height: u32,
    pub spp: u32,
    pub max_depth: u32,
    /// Texture resolution cap for loaders; 0 = unlimited.
    pub max_texture_resolution: u32,
    pub flags: RenderFlags,
    pub mode: RenderMode,
    /// Indirect radiance clamp.
    pub clamp_threshold: f32,
    pub max_instances: u32,
    pub max_lights: u32,
    pub max_scenes: u32,
    pub max_env_maps: u32,
    pub adaptive: AdaptiveSettings,
    /// Seed for domain randomization; `None` draws one from the OS.
    pub seed: Option<u64>,
    /// Present each frame through a [`Presenter`](crate::render::Presenter).
    pub present: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            gpu_id: 0,
            num_loaders: 1,
            batch_size: 1,
            img_width: 64,
            img_height: 64,
            spp: 1,
            max_depth: 2,
            max_texture_resolution: 0,
            flags: RenderFlags::default(),
            mode: RenderMode::default(),
            clamp_threshold: 0.0,
            max_instances: 1 << 16,
            max_lights: 1 << 12,
            max_scenes: 16,
            max_env_maps: 16,
            adaptive: AdaptiveSettings::default(),
            seed: None,
            present: false,
        }
    }
}

impl RenderConfig {
    /// Load a config from a JSON file. Missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Save as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject configurations the engine cannot lay out.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        if self.img_width == 0 || self.img_height == 0 {
            return Err(Error::config("image dimensions must be non-zero"));
        }
        if self.spp == 0 {
            return Err(Error::config("spp must be at least 1"));
        }
        if self.flags.denoise && !self.flags.auxiliary_outputs {
            return Err(Error::config("denoise requires auxiliary outputs"));
        }
        if self.max_instances == 0 || self.max_lights == 0 {
            return Err(Error::config("instance and light capacity must be non-zero"));
        }
        if self.max_scenes == 0 || self.max_env_maps == 0 {
            return Err(Error::config("scene and env map capacity must be non-zero"));
        }
        Ok(())
    }

    /// Presentation requested by config or forced through the environment.
    pub fn presentation_enabled(&self) -> bool {
        self.present || std::env::var(FAKE_PRESENT_ENV).ok().as_deref() == Some("1")
    }

    /// Denoising runs only in path-tracer mode.
    pub fn denoise_active(&self) -> bool {
        self.flags.denoise && self.mode == RenderMode::PathTracer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        RenderConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_denoise_without_aux() {
        let mut cfg = RenderConfig::default();
        cfg.flags.denoise = true;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
        cfg.flags.auxiliary_outputs = true;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: RenderConfig =
            serde_json::from_str(r#"{"batch_size": 6, "flags": {"adaptive_sample": true}}"#)
                .unwrap();
        assert_eq!(cfg.batch_size, 6);
        assert!(cfg.flags.adaptive_sample);
        assert!(cfg.flags.tonemap);
        assert_eq!(cfg.adaptive.max_iterations, 10_000);
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.json");
        let cfg = RenderConfig {
            batch_size: 4,
            spp: 64,
            seed: Some(7),
            ..Default::default()
        };
        cfg.save(&path).unwrap();
        assert_eq!(RenderConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn test_load_missing_file() {
        let err = RenderConfig::load("/nonexistent/render.json").unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }
}
