//! Probe bake driver.
//!
//! Walks a [`ProbeGrid`] over the scene bounds, rendering one probe per grid
//! point and appending it to the probe file. An existing file is loaded first
//! so an interrupted bake resumes where it stopped.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::file::{ProbeFileReader, ProbeFileWriter};
use super::grid::{ProbeGrid, DEFAULT_PROBE_GRID};
use super::probe::{Probe, ProbeSet};
use crate::gpu::GpuDevice;
use crate::render::{ProbeRenderState, RenderBatch, Renderer, PROBE_HEIGHT, PROBE_WIDTH};
use crate::util::{Aabb, Error, Result};

/// Samples per submission while baking.
pub const DEFAULT_BURST: u32 = 64;

/// Bake session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeBakeConfig {
    pub grid: [u32; 3],
    pub width: u32,
    pub height: u32,
    pub burst: u32,
    pub path: PathBuf,
}

impl Default for ProbeBakeConfig {
    fn default() -> Self {
        Self {
            grid: DEFAULT_PROBE_GRID,
            width: PROBE_WIDTH,
            height: PROBE_HEIGHT,
            burst: DEFAULT_BURST,
            path: PathBuf::from("probes.bin"),
        }
    }
}

impl ProbeBakeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.grid.contains(&0) {
            return Err(Error::config("probe grid dimensions must be non-zero"));
        }
        // Probe images are stored and sampled at a fixed resolution.
        if self.width != PROBE_WIDTH || self.height != PROBE_HEIGHT {
            return Err(Error::config(format!(
                "probe resolution must be {PROBE_WIDTH}x{PROBE_HEIGHT}, got {}x{}",
                self.width, self.height
            )));
        }
        if self.burst == 0 {
            return Err(Error::config("probe burst must be at least 1"));
        }
        Ok(())
    }
}

/// Where the bake state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BakeStage {
    CheckExistingFile,
    LoadProbe,
    ComputeRemainingPositions,
    BakeOneProbe,
    SerializeProbe,
    BuildDescriptorSet,
    Done,
}

/// One bake session. Holds all progress explicitly, so independent bakers
/// can run side by side.
pub struct ProbeBaker<D: GpuDevice> {
    cfg: ProbeBakeConfig,
    stage: BakeStage,
    probe_idx: u32,
    probe_state: Option<ProbeRenderState<D>>,
    probes: Vec<Probe<D>>,
}

impl<D: GpuDevice> ProbeBaker<D> {
    pub fn new(cfg: ProbeBakeConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            stage: BakeStage::CheckExistingFile,
            probe_idx: 0,
            probe_state: None,
            probes: Vec::new(),
        })
    }

    pub fn config(&self) -> &ProbeBakeConfig {
        &self.cfg
    }

    pub fn stage(&self) -> BakeStage {
        self.stage
    }

    /// Index of the next probe to bake.
    pub fn probe_idx(&self) -> u32 {
        self.probe_idx
    }

    /// Bake every missing probe of the grid spanning the batch's first
    /// scene, then install the result on `renderer`.
    ///
    /// A grid mismatch with an existing file is fatal.
    #[tracing::instrument(skip_all, fields(path = %self.cfg.path.display()))]
    pub fn bake(
        &mut self,
        renderer: &mut Renderer<D>,
        batch: &mut RenderBatch<D>,
    ) -> Result<Arc<ProbeSet<D>>> {
        renderer.wait_for_batch(batch)?;
        let bounds = batch
            .environments()
            .first()
            .map_or(Aabb::EMPTY, |env| env.scene().env_bounds());
        let grid = ProbeGrid::new(self.cfg.grid, bounds);
        let device = Arc::clone(renderer.device());

        self.stage = BakeStage::CheckExistingFile;
        self.probes.clear();
        self.probe_idx = 0;

        let reader = match ProbeFileReader::open(&self.cfg.path) {
            Ok(reader) => Some(reader),
            Err(Error::FileNotFound(_)) => None,
            Err(e) => return Err(e),
        };

        // An empty file carries no header yet and is treated as new.
        let existing = reader.and_then(|r| {
            let dims = r.dims()?;
            Some((r, dims))
        });
        let mut writer = match existing {
            Some((reader, found)) => {
                if found != grid.header_dims() {
                    return Err(Error::ProbeGridMismatch {
                        expected: grid.header_dims(),
                        found,
                    });
                }
                self.stage = BakeStage::LoadProbe;
                for (index, texels) in reader.records().take(grid.count() as usize).enumerate() {
                    let position = grid.position(index as u32);
                    self.probes.push(Probe::from_texels(&device, index, texels, position)?);
                }
                self.probe_idx = self.probes.len() as u32;
                tracing::info!(loaded = self.probe_idx, "resuming probe bake");
                let valid_len = reader.valid_len();
                // The mapping must be gone before the file is resized.
                drop(reader);
                ProbeFileWriter::append(&self.cfg.path, valid_len)?
            }
            None => ProbeFileWriter::create(&self.cfg.path, grid.header_dims())?,
        };

        self.stage = BakeStage::ComputeRemainingPositions;
        let remaining = grid.positions_from(self.probe_idx);
        let total = grid.count();

        if !remaining.is_empty() && self.probe_state.is_none() {
            self.probe_state = Some(renderer.make_probe_render_state()?);
        }

        for position in remaining {
            let Some(state) = self.probe_state.as_ref() else {
                break;
            };
            self.stage = BakeStage::BakeOneProbe;
            let envs = batch.environments_mut();
            let texture = renderer.render_probe(state, envs, position, self.cfg.burst)?;

            self.stage = BakeStage::SerializeProbe;
            let texels = renderer.read_texture_blocking(&texture)?;
            writer.write_record(&texels)?;
            self.probes.push(Probe { texture, position });
            self.probe_idx += 1;
            tracing::info!("finished {} / {} probes at {}", self.probe_idx, total, position);
        }
        drop(writer);

        self.stage = BakeStage::BuildDescriptorSet;
        let pipeline = renderer
            .pipelines()
            .has_probe_set()
            .then_some(renderer.pipelines().path_trace);
        let probes = std::mem::take(&mut self.probes);
        let set = Arc::new(ProbeSet::new(&device, probes, grid, pipeline)?);
        renderer.set_probe_set(Arc::clone(&set));

        self.stage = BakeStage::Done;
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ProbeBakeConfig::default();
        assert_eq!(cfg.grid, [3, 3, 3]);
        assert_eq!(cfg.burst, 64);
        assert_eq!(cfg.path, PathBuf::from("probes.bin"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_resolution_is_fixed() {
        let cfg = ProbeBakeConfig {
            width: 64,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        let cfg: ProbeBakeConfig = serde_json::from_str(r#"{"grid":[2,1,1]}"#).unwrap();
        assert_eq!(cfg.grid, [2, 1, 1]);
        assert_eq!(cfg.width, PROBE_WIDTH);
    }
}
