//! Pipeline specialisation constants.
//!
//! Kernels are opaque; the engine only decides the constants they are
//! compiled with and prepends them as a WGSL `const` prelude.

use crate::config::{
    RenderConfig, ADAPTIVE_SAMPLES_PER_THREAD, LOCAL_WORKGROUP_X, LOCAL_WORKGROUP_Y,
};
use crate::util::{divide_round_up, Error, Result};

/// Exposure histogram bins.
pub const NUM_EXPOSURE_BINS: u32 = 128;
/// Lower end of the exposure histogram, in stops.
pub const MIN_LOG_LUMINANCE: f32 = -30.0;
/// Upper end of the exposure histogram, in stops.
pub const MAX_LOG_LUMINANCE: f32 = 34.0;

/// Probe resolution, fixed for all bake sessions.
pub const PROBE_WIDTH: u32 = 32;
pub const PROBE_HEIGHT: u32 = 32;

/// Per-pixel sample index scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// Morton-ordered Sobol; needs the full sample index to fit in 32 bits.
    ZSobol,
    Uniform,
}

/// Value of one constant.
#[derive(Debug, Clone, PartialEq)]
pub enum DefineValue {
    Flag,
    U32(u32),
    F32(f32),
}

/// Ordered list of named constants.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShaderDefines {
    entries: Vec<(String, DefineValue)>,
}

impl ShaderDefines {
    pub fn flag(&mut self, name: &str) {
        self.entries.push((name.to_string(), DefineValue::Flag));
    }

    /// Set (or replace) a `u32` constant.
    pub fn set_u32(&mut self, name: &str, value: u32) {
        self.set(name, DefineValue::U32(value));
    }

    pub fn set_f32(&mut self, name: &str, value: f32) {
        self.set(name, DefineValue::F32(value));
    }

    fn set(&mut self, name: &str, value: DefineValue) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&DefineValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// WGSL declarations, one per line. Flags become `bool` constants.
    pub fn prelude(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.entries {
            let line = match value {
                DefineValue::Flag => format!("const {name}: bool = true;\n"),
                DefineValue::U32(v) => format!("const {name}: u32 = {v}u;\n"),
                DefineValue::F32(v) => format!("const {name}: f32 = {v:.9};\n"),
            };
            out.push_str(&line);
        }
        out
    }
}

fn log2_int(v: u32) -> u32 {
    31 - v.max(1).leading_zeros()
}

/// Derived sampler parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerSettings {
    pub mode: SamplingMode,
    pub log2_spp: u32,
    pub odd_power: bool,
    pub index_shift: u32,
    pub num_base4_digits: u32,
}

impl SamplerSettings {
    /// Pick the sampling scheme. Too few index bits for z-Sobol degrades to
    /// uniform sampling with a warning.
    pub fn new(cfg: &RenderConfig) -> Self {
        let log2_spp = log2_int(cfg.spp);
        let odd_power = log2_spp & 1 == 1;
        let index_shift = if odd_power { log2_spp + 1 } else { log2_spp };
        let max_dim = cfg.img_width.max(cfg.img_height);
        let num_base4_digits = log2_int(max_dim.saturating_sub(1).max(1)) + 1 + (log2_spp + 1) / 2;

        let mut mode = SamplingMode::ZSobol;
        if num_base4_digits * 2 > 32 {
            tracing::warn!(
                num_base4_digits,
                "not enough bits for z-Sobol morton code, falling back to uniform sampling"
            );
            mode = SamplingMode::Uniform;
        }
        if cfg.flags.force_uniform {
            mode = SamplingMode::Uniform;
        }

        Self {
            mode,
            log2_spp,
            odd_power,
            index_shift,
            num_base4_digits,
        }
    }
}

/// Constants for the path-tracing kernel.
///
/// Adaptive sampling with fewer samples than one work unit takes is fatal.
pub fn rt_defines(cfg: &RenderConfig) -> Result<ShaderDefines> {
    if cfg.flags.adaptive_sample && cfg.spp < ADAPTIVE_SAMPLES_PER_THREAD {
        return Err(Error::SamplesTooLow {
            spp: cfg.spp,
            minimum: ADAPTIVE_SAMPLES_PER_THREAD,
        });
    }

    let sampler = SamplerSettings::new(cfg);
    let mut d = ShaderDefines::default();
    d.set_u32("SPP", cfg.spp);
    d.set_f32("INV_SQRT_SPP", 1.0 / (cfg.spp as f32).sqrt());
    d.set_u32("MAX_DEPTH", cfg.max_depth);
    d.set_u32("RES_X", cfg.img_width);
    d.set_u32("RES_Y", cfg.img_height);
    d.set_u32("NUM_WORKGROUPS_X", divide_round_up(cfg.img_width, LOCAL_WORKGROUP_X));
    d.set_u32("NUM_WORKGROUPS_Y", divide_round_up(cfg.img_height, LOCAL_WORKGROUP_Y));
    d.set_u32("BATCH_SIZE", cfg.batch_size);
    match sampler.mode {
        SamplingMode::ZSobol => d.flag("ZSOBOL_SAMPLING"),
        SamplingMode::Uniform => d.flag("UNIFORM_SAMPLING"),
    }
    d.set_u32("ZSOBOL_NUM_BASE4", sampler.num_base4_digits);
    d.set_u32("ZSOBOL_INDEX_SHIFT", sampler.index_shift);
    if sampler.odd_power {
        d.flag("ZSOBOL_ODD_POWER");
    }
    if cfg.spp == 1 {
        d.flag("ONE_SAMPLE");
    }
    if cfg.max_depth == 1 {
        d.flag("PRIMARY_ONLY");
    }
    if cfg.flags.auxiliary_outputs {
        d.flag("AUXILIARY_OUTPUTS");
    }
    if cfg.flags.tonemap {
        d.flag("TONEMAP");
    }
    if cfg.flags.adaptive_sample {
        d.flag("ADAPTIVE_SAMPLING");
        d.set_u32("ADAPTIVE_SAMPLES_PER_THREAD", ADAPTIVE_SAMPLES_PER_THREAD);
    }
    if cfg.flags.tonemap || cfg.flags.adaptive_sample {
        d.flag("NEED_SHARED_MEM");
    }
    if cfg.clamp_threshold > 0.0 {
        d.set_f32("INDIRECT_CLAMP", cfg.clamp_threshold);
    }
    Ok(d)
}

/// Path-tracing constants re-targeted at the probe resolution.
pub fn bake_defines(cfg: &RenderConfig) -> Result<ShaderDefines> {
    let mut d = rt_defines(cfg)?;
    d.set_u32("RES_X", PROBE_WIDTH);
    d.set_u32("RES_Y", PROBE_HEIGHT);
    Ok(d)
}

/// Constants for the exposure histogram kernel.
pub fn exposure_defines(cfg: &RenderConfig) -> ShaderDefines {
    let range = MAX_LOG_LUMINANCE - MIN_LOG_LUMINANCE;
    let mut d = ShaderDefines::default();
    d.set_u32("NUM_BINS", NUM_EXPOSURE_BINS);
    d.set_f32("LOG_LUMINANCE_RANGE", range);
    d.set_f32("INV_LOG_LUMINANCE_RANGE", 1.0 / range);
    d.set_f32("MIN_LOG_LUMINANCE", MIN_LOG_LUMINANCE);
    d.set_f32("MAX_LOG_LUMINANCE", MAX_LOG_LUMINANCE);
    d.set_f32("EXPOSURE_BIAS", 0.0);
    d.set_f32("MIN_LUMINANCE", MIN_LOG_LUMINANCE.exp2());
    d.set_u32("RES_X", cfg.img_width);
    d.set_u32("RES_Y", cfg.img_height);
    d.set_u32("EXPOSURE_THREAD_ELEMS_X", divide_round_up(cfg.img_width, LOCAL_WORKGROUP_X));
    d.set_u32("EXPOSURE_THREAD_ELEMS_Y", divide_round_up(cfg.img_height, LOCAL_WORKGROUP_Y));
    d
}

pub fn tonemap_defines(cfg: &RenderConfig) -> ShaderDefines {
    let mut d = ShaderDefines::default();
    d.set_u32("RES_X", cfg.img_width);
    d.set_u32("RES_Y", cfg.img_height);
    d
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(width: u32, spp: u32) -> RenderConfig {
        RenderConfig {
            img_width: width,
            img_height: width,
            spp,
            ..Default::default()
        }
    }

    #[test]
    fn test_zsobol_when_bits_fit() {
        let s = SamplerSettings::new(&cfg(256, 64));
        assert_eq!(s.mode, SamplingMode::ZSobol);
        assert_eq!(s.log2_spp, 6);
        assert!(!s.odd_power);
        assert_eq!(s.num_base4_digits, 8 + 3);
    }

    #[test]
    fn test_uniform_fallback() {
        // 2^16 pixels wide and 2^16 spp need 17 + 8 base-4 digits.
        let s = SamplerSettings::new(&cfg(1 << 16, 1 << 16));
        assert_eq!(s.mode, SamplingMode::Uniform);

        let mut forced = cfg(64, 4);
        forced.flags.force_uniform = true;
        assert_eq!(SamplerSettings::new(&forced).mode, SamplingMode::Uniform);
    }

    #[test]
    fn test_odd_power_shift() {
        let s = SamplerSettings::new(&cfg(64, 8));
        assert!(s.odd_power);
        assert_eq!(s.index_shift, 4);
        assert!(rt_defines(&cfg(64, 8)).unwrap().has("ZSOBOL_ODD_POWER"));
    }

    #[test]
    fn test_adaptive_needs_enough_samples() {
        let mut c = cfg(64, ADAPTIVE_SAMPLES_PER_THREAD - 1);
        c.flags.adaptive_sample = true;
        let err = rt_defines(&c).unwrap_err();
        assert!(err.is_fatal());
        c.spp = ADAPTIVE_SAMPLES_PER_THREAD;
        assert!(rt_defines(&c).unwrap().has("ADAPTIVE_SAMPLING"));
    }

    #[test]
    fn test_bake_defines_use_probe_resolution() {
        let d = bake_defines(&cfg(640, 16)).unwrap();
        assert_eq!(d.get("RES_X"), Some(&DefineValue::U32(PROBE_WIDTH)));
        assert_eq!(d.get("RES_Y"), Some(&DefineValue::U32(PROBE_HEIGHT)));
        assert_eq!(d.get("SPP"), Some(&DefineValue::U32(16)));
    }

    #[test]
    fn test_prelude_format() {
        let mut d = ShaderDefines::default();
        d.set_u32("SPP", 4);
        d.set_f32("INV_SQRT_SPP", 0.5);
        d.flag("TONEMAP");
        assert_eq!(
            d.prelude(),
            concat!(
                "const SPP: u32 = 4u;\n",
                "const INV_SQRT_SPP: f32 = 0.500000000;\n",
                "const TONEMAP: bool = true;\n",
            )
        );
        let e = exposure_defines(&cfg(64, 1));
        assert_eq!(e.get("NUM_BINS"), Some(&DefineValue::U32(128)));
    }
}
