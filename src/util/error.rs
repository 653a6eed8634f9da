//! Error types for the batch renderer.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for renderer and probe-bake operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A fixed-size device allocation could not be satisfied
    #[error("Out of device memory allocating {label} ({bytes} bytes)")]
    OutOfDeviceMemory { label: String, bytes: u64 },

    /// Sample count cannot be split into adaptive sampling units
    #[error("Adaptive sampling needs at least {minimum} samples per pixel, got {spp}")]
    SamplesTooLow { spp: u32, minimum: u32 },

    /// Probe file was baked with a different grid
    #[error("Probe grid mismatch: expected {expected:?}, file has {found:?}")]
    ProbeGridMismatch { expected: [i32; 3], found: [i32; 3] },

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A fixed-capacity table overflowed
    #[error("{what} capacity exceeded: requested {requested}, capacity {capacity}")]
    CapacityExceeded {
        what: &'static str,
        requested: usize,
        capacity: usize,
    },

    /// Handle does not refer to a live device object
    #[error("Invalid {0} handle")]
    InvalidHandle(&'static str),

    /// Backend-reported device failure
    #[error("Device error: {0}")]
    Device(String),

    /// Probe file is truncated inside its header
    #[error("Unexpected end of file at position {0}")]
    UnexpectedEof(u64),

    /// Probe record does not hold one full probe image
    #[error("Probe record {index} has {size} bytes, expected {expected}")]
    InvalidProbeRecord { index: usize, size: u64, expected: u64 },

    /// File does not exist or cannot be accessed
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// Memory mapping failed
    #[error("Memory mapping failed: {0}")]
    MmapFailed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image decode/encode error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create an invalid configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a device error.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Errors that end the session: capacity planning or configuration
    /// mistakes with no safe runtime recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::OutOfDeviceMemory { .. }
                | Error::SamplesTooLow { .. }
                | Error::ProbeGridMismatch { .. }
        )
    }
}

/// Result type alias for renderer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::ProbeGridMismatch {
            expected: [3, 3, 3],
            found: [2, 3, 3],
        };
        assert!(e.to_string().contains("[3, 3, 3]"));
        assert!(e.to_string().contains("[2, 3, 3]"));

        let e = Error::SamplesTooLow { spp: 4, minimum: 8 };
        assert!(e.to_string().contains("8"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::OutOfDeviceMemory { label: "tlas".into(), bytes: 64 }.is_fatal());
        assert!(Error::SamplesTooLow { spp: 1, minimum: 8 }.is_fatal());
        assert!(!Error::config("bad").is_fatal());
        assert!(!Error::UnexpectedEof(3).is_fatal());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
