//! Physical framebuffer tiling.
//!
//! A batch of `batch_size` logical images is packed into one near-square
//! grid of images, then split into mini-batches that share a region of the
//! physical framebuffer.

use std::mem::size_of;

use half::f16;

use super::packed::{AdaptiveTile, RESERVOIR_BYTES};
use crate::config::{RenderConfig, LOCAL_WORKGROUP_X, LOCAL_WORKGROUP_Y, MINIBATCH_DIVISOR};
use crate::util::divide_round_up;

/// Tiling geometry and plane sizes of one batch framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferConfig {
    pub img_width: u32,
    pub img_height: u32,

    pub minibatch_size: u32,
    pub minibatch_images_wide: u32,
    pub minibatch_images_tall: u32,

    pub batch_images_wide: u32,
    pub batch_images_tall: u32,

    pub frame_width: u32,
    pub frame_height: u32,

    pub num_tiles_wide: u32,
    pub num_tiles_tall: u32,

    pub output_bytes: u64,
    pub hdr_bytes: u64,
    pub normal_bytes: u64,
    pub albedo_bytes: u64,
    pub reservoir_bytes: u64,
    pub illuminance_bytes: u64,
    pub adaptive_bytes: u64,
}

/// Smallest width >= ceil(sqrt(batch_size)) that divides the batch.
///
/// Terminates at `batch_size` itself, which turns prime batches into a strip.
pub fn batch_grid(batch_size: u32) -> (u32, u32) {
    let mut wide = (batch_size as f64).sqrt().ceil() as u32;
    wide = wide.max(1);
    while batch_size % wide != 0 {
        wide += 1;
    }
    (wide, batch_size / wide)
}

/// Shape of a mini-batch of `size` images inside a grid `batch_wide` across.
fn minibatch_fit(size: u32, batch_wide: u32) -> Option<(u32, u32)> {
    if batch_wide >= size {
        (batch_wide % size == 0).then_some((size, 1))
    } else {
        (size % batch_wide == 0).then(|| (batch_wide, size / batch_wide))
    }
}

/// Pick (minibatch_size, wide, tall). Falls back to one mini-batch spanning
/// the whole batch when the divided size does not tile the grid.
fn minibatch_shape(batch_size: u32, batch_wide: u32) -> (u32, u32, u32) {
    let divided = batch_size / MINIBATCH_DIVISOR;
    if divided > 0 && batch_size % MINIBATCH_DIVISOR == 0 {
        if let Some((wide, tall)) = minibatch_fit(divided, batch_wide) {
            return (divided, wide, tall);
        }
    }
    match minibatch_fit(batch_size, batch_wide) {
        Some((wide, tall)) => (batch_size, wide, tall),
        None => (batch_size, batch_wide, batch_size / batch_wide),
    }
}

fn plane_bytes(pixels: u64, channels: u64, channel_bytes: usize) -> u64 {
    pixels * channels * channel_bytes as u64
}

impl FramebufferConfig {
    /// Layout for a batch of `batch_size` images of `img_width` x `img_height`.
    pub fn new(img_width: u32, img_height: u32, batch_size: u32) -> Self {
        let (batch_images_wide, batch_images_tall) = batch_grid(batch_size);
        let (minibatch_size, minibatch_images_wide, minibatch_images_tall) =
            minibatch_shape(batch_size, batch_images_wide);

        let frame_width = img_width * batch_images_wide;
        let frame_height = img_height * batch_images_tall;
        let num_tiles_wide = divide_round_up(img_width, LOCAL_WORKGROUP_X);
        let num_tiles_tall = divide_round_up(img_height, LOCAL_WORKGROUP_Y);

        let pixels = frame_width as u64 * frame_height as u64;
        let tiles = num_tiles_wide as u64 * num_tiles_tall as u64 * batch_size as u64;

        Self {
            img_width,
            img_height,
            minibatch_size,
            minibatch_images_wide,
            minibatch_images_tall,
            batch_images_wide,
            batch_images_tall,
            frame_width,
            frame_height,
            num_tiles_wide,
            num_tiles_tall,
            output_bytes: plane_bytes(pixels, 4, size_of::<f16>()),
            hdr_bytes: plane_bytes(pixels, 4, size_of::<f32>()),
            normal_bytes: plane_bytes(pixels, 3, size_of::<f16>()),
            albedo_bytes: plane_bytes(pixels, 3, size_of::<f16>()),
            reservoir_bytes: RESERVOIR_BYTES * pixels,
            illuminance_bytes: size_of::<f32>() as u64 * tiles,
            adaptive_bytes: size_of::<AdaptiveTile>() as u64 * tiles,
        }
    }

    pub fn from_config(cfg: &RenderConfig) -> Self {
        Self::new(cfg.img_width, cfg.img_height, cfg.batch_size)
    }

    /// Single-image, single-tile layout used while baking probes.
    pub fn for_probe(width: u32, height: u32) -> Self {
        let pixels = width as u64 * height as u64;
        Self {
            img_width: width,
            img_height: height,
            minibatch_size: 1,
            minibatch_images_wide: 1,
            minibatch_images_tall: 1,
            batch_images_wide: 1,
            batch_images_tall: 1,
            frame_width: width,
            frame_height: height,
            num_tiles_wide: 1,
            num_tiles_tall: 1,
            output_bytes: plane_bytes(pixels, 4, size_of::<f16>()),
            hdr_bytes: plane_bytes(pixels, 4, size_of::<f32>()),
            normal_bytes: plane_bytes(pixels, 3, size_of::<f16>()),
            albedo_bytes: plane_bytes(pixels, 3, size_of::<f16>()),
            reservoir_bytes: RESERVOIR_BYTES * pixels,
            illuminance_bytes: size_of::<f32>() as u64,
            adaptive_bytes: size_of::<AdaptiveTile>() as u64,
        }
    }

    /// Tiles per logical image.
    #[inline]
    pub fn tiles_per_image(&self) -> u32 {
        self.num_tiles_wide * self.num_tiles_tall
    }

    /// Number of images in the batch grid.
    #[inline]
    pub fn batch_size(&self) -> u32 {
        self.batch_images_wide * self.batch_images_tall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_product_all_batches() {
        for batch in 1..=512u32 {
            let fb = FramebufferConfig::new(16, 16, batch);
            assert_eq!(fb.batch_images_wide * fb.batch_images_tall, batch, "batch {batch}");
            assert_eq!(
                fb.minibatch_images_wide * fb.minibatch_images_tall,
                fb.minibatch_size,
                "batch {batch}"
            );
            assert_eq!(batch % fb.minibatch_size, 0, "batch {batch}");
            assert_eq!(fb.batch_images_wide % fb.minibatch_images_wide, 0, "batch {batch}");
            assert_eq!(fb.batch_images_tall % fb.minibatch_images_tall, 0, "batch {batch}");
        }
    }

    #[test]
    fn test_batch_four() {
        let fb = FramebufferConfig::new(64, 64, 4);
        assert_eq!((fb.batch_images_wide, fb.batch_images_tall), (2, 2));
        assert_eq!((fb.frame_width, fb.frame_height), (128, 128));
        assert_eq!(fb.minibatch_size, 2);
    }

    #[test]
    fn test_batch_six() {
        let fb = FramebufferConfig::new(64, 64, 6);
        assert_eq!((fb.batch_images_wide, fb.batch_images_tall), (3, 2));
        assert_eq!((fb.frame_width, fb.frame_height), (192, 128));
        assert_eq!((fb.minibatch_images_wide, fb.minibatch_images_tall), (3, 1));
    }

    #[test]
    fn test_prime_batch_is_strip() {
        let fb = FramebufferConfig::new(8, 8, 7);
        assert_eq!((fb.batch_images_wide, fb.batch_images_tall), (7, 1));
        assert_eq!(fb.minibatch_size, 7);
    }

    #[test]
    fn test_plane_sizes() {
        let fb = FramebufferConfig::new(16, 8, 2);
        let pixels = 32 * 8;
        assert_eq!(fb.output_bytes, pixels * 8);
        assert_eq!(fb.hdr_bytes, pixels * 16);
        assert_eq!(fb.normal_bytes, pixels * 6);
        assert_eq!(fb.reservoir_bytes, pixels * RESERVOIR_BYTES);
        // 2x1 tiles per image, two images
        assert_eq!(fb.illuminance_bytes, 4 * 4);
        assert_eq!(fb.adaptive_bytes, 16 * 4);
    }

    #[test]
    fn test_probe_layout() {
        let fb = FramebufferConfig::for_probe(32, 32);
        assert_eq!(fb.batch_size(), 1);
        assert_eq!(fb.tiles_per_image(), 1);
        assert_eq!(fb.hdr_bytes, 32 * 32 * 16);
    }
}
