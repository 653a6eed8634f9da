//! Baked probes resident on the device.

use std::sync::Arc;

use glam::Vec3;

use super::grid::ProbeGrid;
use crate::gpu::{
    BindGroupDesc, BindGroupHandle, BindingEntry, GpuDevice, GpuTexture, PipelineHandle,
    TextureDesc, TextureFormat,
};
use crate::render::{rt_set, MAX_PROBES, PROBE_HEIGHT, PROBE_WIDTH};
use crate::util::{Error, Result};

/// Bytes of one probe image (RGBA32F at probe resolution).
pub const PROBE_BYTES: u64 = PROBE_WIDTH as u64 * PROBE_HEIGHT as u64 * 16;

/// One baked probe.
pub struct Probe<D: GpuDevice> {
    pub texture: GpuTexture<D>,
    pub position: Vec3,
}

impl<D: GpuDevice> Probe<D> {
    /// Upload a probe image read back from a probe file.
    pub fn from_texels(
        device: &Arc<D>,
        index: usize,
        texels: &[u8],
        position: Vec3,
    ) -> Result<Self> {
        if texels.len() as u64 != PROBE_BYTES {
            return Err(Error::InvalidProbeRecord {
                index,
                size: texels.len() as u64,
                expected: PROBE_BYTES,
            });
        }
        let texture = GpuTexture::new(
            device,
            &TextureDesc {
                label: "probe",
                width: PROBE_WIDTH,
                height: PROBE_HEIGHT,
                format: TextureFormat::Rgba32Float,
            },
        )?;
        texture.write(texels)?;
        Ok(Self { texture, position })
    }

    #[inline]
    pub fn byte_size(&self) -> u64 {
        self.texture.byte_size()
    }
}

/// All probes of a grid plus the bind group the biased path tracer
/// samples them through.
pub struct ProbeSet<D: GpuDevice> {
    device: Arc<D>,
    probes: Vec<Probe<D>>,
    bind_group: Option<BindGroupHandle>,
    grid: ProbeGrid,
}

impl<D: GpuDevice> ProbeSet<D> {
    /// Wrap baked probes. With `pipeline`, also bind them as a texture
    /// array at the probe set of that pipeline.
    pub fn new(
        device: &Arc<D>,
        probes: Vec<Probe<D>>,
        grid: ProbeGrid,
        pipeline: Option<PipelineHandle>,
    ) -> Result<Self> {
        let bind_group = match pipeline {
            Some(pipeline) => {
                if probes.len() > MAX_PROBES as usize {
                    return Err(Error::CapacityExceeded {
                        what: "probe",
                        requested: probes.len(),
                        capacity: MAX_PROBES as usize,
                    });
                }
                let textures = probes.iter().map(|p| p.texture.handle()).collect();
                Some(device.create_bind_group(&BindGroupDesc {
                    label: "probes",
                    pipeline,
                    set: rt_set::PROBES,
                    entries: &[BindingEntry::texture_array(0, textures)],
                })?)
            }
            None => None,
        };
        Ok(Self {
            device: Arc::clone(device),
            probes,
            bind_group,
            grid,
        })
    }

    pub fn probes(&self) -> &[Probe<D>] {
        &self.probes
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn grid(&self) -> &ProbeGrid {
        &self.grid
    }

    #[inline]
    pub fn bind_group(&self) -> Option<BindGroupHandle> {
        self.bind_group
    }
}

impl<D: GpuDevice> Drop for ProbeSet<D> {
    fn drop(&mut self) {
        if let Some(group) = self.bind_group {
            self.device.destroy_bind_group(group);
        }
    }
}
