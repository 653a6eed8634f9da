//! Irradiance probe baking.
//!
//! - [`ProbeGrid`]: grid-point positions over a scene's bounds
//! - [`ProbeFileReader`] / [`ProbeFileWriter`]: the resumable probe file
//! - [`ProbeBaker`]: renders missing probes and builds the [`ProbeSet`]

mod baker;
mod file;
mod grid;
mod probe;

pub use baker::*;
pub use file::*;
pub use grid::*;
pub use probe::*;
