//! Batch render engine.
//!
//! - [`Renderer`]: session state and the per-frame protocol
//! - [`RenderBatch`]: environments plus their framebuffer and bind groups
//! - [`TileQueue`]: host side of adaptive sampling
//! - [`ShaderDefines`]: specialisation constants for the opaque kernels

mod adaptive;
mod batch;
mod bsdf;
mod denoise;
mod engine;
mod framebuffer;
mod pipelines;
mod probe_pass;
mod shader;
mod state;

pub use adaptive::*;
pub use batch::*;
pub use bsdf::*;
pub use denoise::*;
pub use engine::*;
pub use framebuffer::*;
pub use pipelines::*;
pub use probe_pass::*;
pub use shader::*;
pub use state::*;
