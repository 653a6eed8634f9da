//! Utility types shared by every module.
//!
//! - [`Error`] and [`Result`] for fallible operations
//! - Alignment/rounding helpers used by the buffer layouts
//! - [`Aabb`] bounds shared by the scene, the TLAS builder and the probe grid

mod error;
mod math;

pub use error::*;
pub use math::*;
