//! Host side of tile-based adaptive sampling.
//!
//! Every tile of every image is split into work units of
//! [`ADAPTIVE_SAMPLES_PER_THREAD`] samples. After each pass the engine
//! reads back per-tile statistics and queues another full round of units
//! for the tiles that have not converged.

use crate::config::{AdaptiveSettings, ADAPTIVE_SAMPLES_PER_THREAD};
use crate::layout::{AdaptiveTile, FramebufferConfig, InputTile};

/// Tile mean relative to tile illuminance. Zero when the tile has no
/// illuminance.
pub fn normalized_variance(tile: &AdaptiveTile, illuminance: f32) -> f32 {
    if illuminance == 0.0 {
        return 0.0;
    }
    tile.tile_mean / illuminance
}

/// Whether a tile gets another round of samples.
///
/// Noisy tiles always do. Tiles without a variance estimate keep sampling
/// until they reach `spp * min_sample_multiplier` samples.
pub fn needs_more_samples(
    tile: &AdaptiveTile,
    illuminance: f32,
    spp: u32,
    settings: &AdaptiveSettings,
) -> bool {
    let norm_variance = normalized_variance(tile, illuminance);
    let floor = spp.saturating_mul(settings.min_sample_multiplier);
    (norm_variance == 0.0 && tile.num_samples < floor)
        || norm_variance > settings.variance_threshold
}

/// Work list written to the tile input buffer before each pass.
#[derive(Debug, Clone)]
pub struct TileQueue {
    units: Vec<InputTile>,
    batch_size: u32,
    tiles_wide: u32,
    tiles_tall: u32,
    spp: u32,
}

impl TileQueue {
    pub fn new(fb_cfg: &FramebufferConfig, batch_size: u32, spp: u32) -> Self {
        Self {
            units: Vec::new(),
            batch_size,
            tiles_wide: fb_cfg.num_tiles_wide,
            tiles_tall: fb_cfg.num_tiles_tall,
            spp,
        }
    }

    /// Queue every tile of every image, images then rows then columns.
    pub fn fill_initial(&mut self) {
        self.units.clear();
        for batch_idx in 0..self.batch_size {
            for tile_y in 0..self.tiles_tall {
                for tile_x in 0..self.tiles_wide {
                    self.push_tile(batch_idx, tile_x, tile_y);
                }
            }
        }
    }

    /// Queue one unit per sample offset of one tile.
    pub fn push_tile(&mut self, batch_idx: u32, tile_x: u32, tile_y: u32) {
        for sample_offset in (0..self.spp).step_by(ADAPTIVE_SAMPLES_PER_THREAD as usize) {
            self.units.push(InputTile {
                batch_idx,
                x_offset: tile_x,
                y_offset: tile_y,
                sample_offset,
            });
        }
    }

    /// Rebuild the queue from read-back statistics. `stats` and
    /// `illuminance` are indexed by linear tile index. Returns the number
    /// of queued units.
    pub fn refine(
        &mut self,
        stats: &[AdaptiveTile],
        illuminance: &[f32],
        settings: &AdaptiveSettings,
    ) -> usize {
        self.units.clear();
        let per_image = self.tiles_wide * self.tiles_tall;
        for batch_idx in 0..self.batch_size {
            for tile_y in 0..self.tiles_tall {
                for tile_x in 0..self.tiles_wide {
                    let linear =
                        (batch_idx * per_image + tile_y * self.tiles_wide + tile_x) as usize;
                    let (Some(tile), Some(&illum)) = (stats.get(linear), illuminance.get(linear))
                    else {
                        continue;
                    };
                    if needs_more_samples(tile, illum, self.spp, settings) {
                        self.push_tile(batch_idx, tile_x, tile_y);
                    }
                }
            }
        }
        self.units.len()
    }

    pub fn units(&self) -> &[InputTile] {
        &self.units
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> TileQueue {
        // 16x8 image: 2x1 tiles, two images, 16 spp -> 2 units per tile.
        TileQueue::new(&FramebufferConfig::new(16, 8, 2), 2, 16)
    }

    fn tile(mean: f32, samples: u32) -> AdaptiveTile {
        AdaptiveTile {
            tile_mean: mean,
            tile_variance_m2: 0.0,
            num_samples: samples,
            spin_lock: 0,
        }
    }

    #[test]
    fn test_initial_order() {
        let mut q = queue();
        q.fill_initial();
        assert_eq!(q.len(), 8);
        let first = q.units()[0];
        assert_eq!(
            (first.batch_idx, first.x_offset, first.y_offset, first.sample_offset),
            (0, 0, 0, 0)
        );
        assert_eq!(q.units()[1].sample_offset, 8);
        assert_eq!(q.units()[2].x_offset, 1);
        assert_eq!(q.units()[4].batch_idx, 1);
    }

    #[test]
    fn test_converged_tiles_drop_out() {
        let settings = AdaptiveSettings::default();
        let mut q = queue();
        let quiet = vec![tile(1e-4, 64); 4];
        assert_eq!(q.refine(&quiet, &[1.0; 4], &settings), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_noisy_tile_requeued() {
        let settings = AdaptiveSettings::default();
        let mut q = queue();
        let mut stats = vec![tile(1e-4, 64); 4];
        // Mean over illuminance: 0.1 / 2.0 is well above the threshold.
        stats[3] = tile(0.1, 64);
        assert_eq!(q.refine(&stats, &[1.0, 1.0, 1.0, 2.0], &settings), 2);
        assert!(q.units().iter().all(|u| u.batch_idx == 1 && u.x_offset == 1));
    }

    #[test]
    fn test_unmeasured_tiles_sample_up_to_floor() {
        let settings = AdaptiveSettings::default();
        // Zero illuminance gives no estimate, whatever the mean.
        assert!(needs_more_samples(&tile(3.0, 16), 0.0, 16, &settings));
        assert!(!needs_more_samples(&tile(3.0, 160), 0.0, 16, &settings));
        assert_eq!(normalized_variance(&tile(3.0, 16), 0.0), 0.0);
        assert_eq!(normalized_variance(&tile(0.5, 4), 2.0), 0.25);
    }
}
