//! Environment maps and the active env-map group.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::gpu::{
    BindGroupDesc, BindGroupHandle, BindingEntry, GpuDevice, GpuTexture, PipelineHandle,
    TextureDesc, TextureFormat,
};
use crate::util::{Error, Result};

/// Decoded equirectangular radiance map.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvMapData {
    pub width: u32,
    pub height: u32,
    /// Row-major RGBA texels.
    pub texels: Vec<[f32; 4]>,
}

impl EnvMapData {
    /// Load an `.hdr` or `.exr` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        let img = image::open(path)?.into_rgba32f();
        let (width, height) = img.dimensions();
        let texels = img.pixels().map(|p| p.0).collect();
        Ok(Self { width, height, texels })
    }

    pub fn solid(width: u32, height: u32, color: [f32; 4]) -> Self {
        Self {
            width,
            height,
            texels: vec![color; (width * height) as usize],
        }
    }

    /// Rec. 709 luminance per texel, used for importance sampling.
    pub fn luminance(&self) -> Vec<f32> {
        self.texels
            .iter()
            .map(|t| 0.2126 * t[0] + 0.7152 * t[1] + 0.0722 * t[2])
            .collect()
    }
}

/// Textures of a set of env maps plus the bind group exposing them.
///
/// Each map contributes two textures: radiance and luminance.
pub struct EnvMapGroup<D: GpuDevice> {
    device: Arc<D>,
    textures: Vec<GpuTexture<D>>,
    bind_group: BindGroupHandle,
}

impl<D: GpuDevice> EnvMapGroup<D> {
    /// Upload `maps` and bind them at `set` of `pipeline`.
    pub fn new(
        device: &Arc<D>,
        maps: &[EnvMapData],
        pipeline: PipelineHandle,
        set: u32,
        max_env_maps: u32,
    ) -> Result<Self> {
        if maps.is_empty() || maps.len() > max_env_maps as usize {
            return Err(Error::CapacityExceeded {
                what: "environment map",
                requested: maps.len(),
                capacity: max_env_maps as usize,
            });
        }

        let mut textures = Vec::with_capacity(maps.len() * 2);
        for map in maps {
            if map.texels.len() != (map.width * map.height) as usize {
                return Err(Error::other(format!(
                    "env map has {} texels for {}x{}",
                    map.texels.len(),
                    map.width,
                    map.height
                )));
            }
            let radiance = GpuTexture::new(
                device,
                &TextureDesc {
                    label: "env map",
                    width: map.width,
                    height: map.height,
                    format: TextureFormat::Rgba32Float,
                },
            )?;
            radiance.write(bytemuck::cast_slice(&map.texels))?;

            let luminance = GpuTexture::new(
                device,
                &TextureDesc {
                    label: "env map luminance",
                    width: map.width,
                    height: map.height,
                    format: TextureFormat::R32Float,
                },
            )?;
            luminance.write(bytemuck::cast_slice(&map.luminance()))?;

            textures.push(radiance);
            textures.push(luminance);
        }

        let entries = [BindingEntry::texture_array(
            0,
            textures.iter().map(GpuTexture::handle).collect(),
        )];
        let bind_group = device.create_bind_group(&BindGroupDesc {
            label: "env maps",
            pipeline,
            set,
            entries: &entries,
        })?;

        Ok(Self {
            device: Arc::clone(device),
            textures,
            bind_group,
        })
    }

    pub fn num_maps(&self) -> u32 {
        (self.textures.len() / 2) as u32
    }

    #[inline]
    pub fn bind_group(&self) -> BindGroupHandle {
        self.bind_group
    }
}

impl<D: GpuDevice> Drop for EnvMapGroup<D> {
    fn drop(&mut self) {
        self.device.destroy_bind_group(self.bind_group);
    }
}

/// The env-map group new batches bind. Replaced wholesale; batches in
/// flight keep their own `Arc` to the group they bound.
pub struct SharedEnvMapState<D: GpuDevice> {
    active: Mutex<Arc<EnvMapGroup<D>>>,
}

impl<D: GpuDevice> SharedEnvMapState<D> {
    pub fn new(initial: Arc<EnvMapGroup<D>>) -> Self {
        Self {
            active: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> Arc<EnvMapGroup<D>> {
        Arc::clone(&self.active.lock())
    }

    /// Swap in a new group, returning the previous one.
    pub fn replace(&self, group: Arc<EnvMapGroup<D>>) -> Arc<EnvMapGroup<D>> {
        std::mem::replace(&mut *self.active.lock(), group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luminance() {
        let map = EnvMapData::solid(2, 1, [1.0, 1.0, 1.0, 1.0]);
        let lum = map.luminance();
        assert_eq!(lum.len(), 2);
        assert!((lum[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing() {
        assert!(matches!(EnvMapData::load("/no/such/map.hdr"), Err(Error::FileNotFound(_))));
    }

    #[test]
    fn test_load_exr_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sky.exr");
        let img = image::Rgba32FImage::from_raw(2, 2, vec![0.5; 16]).unwrap();
        img.save(&path).unwrap();

        let map = EnvMapData::load(&path).unwrap();
        assert_eq!((map.width, map.height), (2, 2));
        assert_eq!(map.texels[3], [0.5; 4]);
    }
}
