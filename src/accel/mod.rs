//! Acceleration structures.
//!
//! Bottom-level structures arrive prebuilt with each scene; this module
//! rebuilds the per-environment top-level structure whenever instances move.

mod bvh;
mod tlas;

pub use bvh::*;
pub use tlas::*;
