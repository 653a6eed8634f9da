//! # pbrbatch
//!
//! Batched GPU path-tracer engine for generating training images.
//!
//! A [`render::Renderer`] owns the device-side session state: pipelines,
//! queues, BSDF lookup tables, the shared scene table and the active
//! environment maps. Environments (camera, instances, lights) are grouped into
//! a [`render::RenderBatch`] and rendered in one submission, with optional
//! tile-based adaptive sampling, exposure + tonemap and an external denoiser.
//! [`bake::ProbeBaker`] renders irradiance probes over a scene grid into a
//! resumable probe file.
//!
//! ## Modules
//!
//! - [`util`] - Errors and small math helpers
//! - [`config`] - `RenderConfig` and engine constants
//! - [`layout`] - Framebuffer tiling, parameter buffer layout, packed GPU structs
//! - [`gpu`] - Device service trait, command lists, queues, headless backend
//! - [`accel`] - BLAS bounds and per-environment TLAS
//! - [`scene`] - Scenes, environments, cameras, environment maps
//! - [`render`] - The batch render engine
//! - [`bake`] - Probe grid, probe file and the bake driver
//!
//! ## Example
//!
//! ```ignore
//! use pbrbatch::prelude::*;
//!
//! let device = Arc::new(HeadlessDevice::default());
//! let mut renderer = Renderer::new(device, RenderConfig::default(), &shaders, &tables)?;
//! let scene = renderer.register_scene(desc)?;
//! let env = renderer.make_environment(&scene, camera);
//! let mut batch = renderer.make_render_batch(vec![env])?;
//! renderer.render(&mut batch)?;
//! let pixels = renderer.read_output(&mut batch)?;
//! ```

pub mod accel;
pub mod bake;
pub mod config;
pub mod gpu;
pub mod layout;
pub mod render;
pub mod scene;
pub mod util;

pub use util::{Error, Result};

/// Build date stamped by the build script.
pub const BUILD_DATE: &str = env!("PBRBATCH_BUILD_DATE");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bake::{ProbeBakeConfig, ProbeBaker, ProbeFileReader, ProbeGrid, ProbeSet};
    pub use crate::config::{RenderConfig, RenderFlags, RenderMode};
    pub use crate::gpu::{GpuDevice, HeadlessDevice};
    pub use crate::render::{BsdfTables, RenderBatch, Renderer, ShaderSources};
    pub use crate::scene::{Camera, Environment, Scene, SceneDesc};
    pub use crate::util::{Error, Result};
    pub use std::sync::Arc;
}
