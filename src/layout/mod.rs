//! GPU memory layouts.
//!
//! Pure functions of the configuration: nothing here touches a device.

mod framebuffer;
mod packed;
mod param;

pub use framebuffer::*;
pub use packed::*;
pub use param::*;
