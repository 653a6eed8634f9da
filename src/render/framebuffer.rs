//! Device-resident output planes of one batch.

use std::sync::Arc;

use crate::config::RenderFlags;
use crate::gpu::{BufferDesc, GpuBuffer, GpuDevice};
use crate::layout::FramebufferConfig;
use crate::util::Result;

/// Output, HDR, auxiliary, statistics and reservoir buffers laid out per a
/// [`FramebufferConfig`].
///
/// Color and auxiliary planes are exportable so external consumers can
/// read them in place.
pub struct FramebufferState<D: GpuDevice> {
    pub output: GpuBuffer<D>,
    pub hdr: GpuBuffer<D>,
    pub normal: Option<GpuBuffer<D>>,
    pub albedo: Option<GpuBuffer<D>>,
    /// Per-tile illuminance; written when tonemapping or adaptive sampling.
    pub illuminance: Option<GpuBuffer<D>>,
    pub adaptive: Option<GpuBuffer<D>>,
    pub adaptive_readback: Option<GpuBuffer<D>>,
    pub illuminance_readback: Option<GpuBuffer<D>>,
    /// Ping-pong reservoir pair.
    pub reservoirs: [GpuBuffer<D>; 2],
}

impl<D: GpuDevice> FramebufferState<D> {
    pub fn new(device: &Arc<D>, flags: &RenderFlags, fb: &FramebufferConfig) -> Result<Self> {
        let output =
            GpuBuffer::new(device, &BufferDesc::storage("output", fb.output_bytes).exported())?;
        let hdr = GpuBuffer::new(device, &BufferDesc::storage("hdr", fb.hdr_bytes))?;

        let (normal, albedo) = if flags.auxiliary_outputs {
            (
                Some(GpuBuffer::new(
                    device,
                    &BufferDesc::storage("normal", fb.normal_bytes).exported(),
                )?),
                Some(GpuBuffer::new(
                    device,
                    &BufferDesc::storage("albedo", fb.albedo_bytes).exported(),
                )?),
            )
        } else {
            (None, None)
        };

        let illuminance = if flags.tonemap || flags.adaptive_sample {
            Some(GpuBuffer::new(device, &BufferDesc::storage("illuminance", fb.illuminance_bytes))?)
        } else {
            None
        };

        let (adaptive, adaptive_readback, illuminance_readback) = if flags.adaptive_sample {
            (
                Some(GpuBuffer::new(
                    device,
                    &BufferDesc::storage("adaptive tiles", fb.adaptive_bytes),
                )?),
                Some(GpuBuffer::new(
                    device,
                    &BufferDesc::readback("adaptive readback", fb.adaptive_bytes),
                )?),
                Some(GpuBuffer::new(
                    device,
                    &BufferDesc::readback("illuminance readback", fb.illuminance_bytes),
                )?),
            )
        } else {
            (None, None, None)
        };

        let reservoirs = [
            GpuBuffer::new(device, &BufferDesc::storage("reservoirs 0", fb.reservoir_bytes))?,
            GpuBuffer::new(device, &BufferDesc::storage("reservoirs 1", fb.reservoir_bytes))?,
        ];

        Ok(Self {
            output,
            hdr,
            normal,
            albedo,
            illuminance,
            adaptive,
            adaptive_readback,
            illuminance_readback,
            reservoirs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;

    #[test]
    fn test_planes_follow_flags() {
        let dev = Arc::new(HeadlessDevice::default());
        let fb_cfg = FramebufferConfig::new(16, 16, 2);

        let fb = FramebufferState::new(&dev, &RenderFlags::default(), &fb_cfg).unwrap();
        assert!(fb.normal.is_none());
        assert!(fb.adaptive.is_none());
        assert_eq!(fb.illuminance.as_ref().unwrap().size(), fb_cfg.illuminance_bytes);
        assert_eq!(fb.output.size(), fb_cfg.output_bytes);
        assert_eq!(dev.live_buffers(), 5);

        let flags = RenderFlags {
            auxiliary_outputs: true,
            tonemap: false,
            adaptive_sample: true,
            ..Default::default()
        };
        let fb = FramebufferState::new(&dev, &flags, &fb_cfg).unwrap();
        assert!(fb.albedo.is_some());
        assert!(fb.illuminance_readback.is_some());
        assert_eq!(fb.adaptive.as_ref().unwrap().size(), fb_cfg.adaptive_bytes);
    }
}
