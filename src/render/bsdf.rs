//! Precomputed multiple-scattering BSDF lookup tables.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::gpu::{GpuDevice, GpuTexture, TextureDesc, TextureFormat, TextureHandle};
use crate::util::{Error, Result};

/// File name and logical dimensions of each table, in binding order.
pub const BSDF_TABLES: [(&str, &[u32]); 5] = [
    ("diffuse_avg_albedo.bin", &[16, 16]),
    ("diffuse_dir_albedo.bin", &[16, 16, 16]),
    ("ggx_avg_albedo.bin", &[32]),
    ("ggx_dir_albedo.bin", &[32, 32]),
    ("ggx_dir_inv.bin", &[128, 32]),
];

/// 2D extent a table is stored with: 1D tables become one row, 3D tables
/// stack their slices vertically.
pub fn table_extent(dims: &[u32]) -> (u32, u32) {
    match dims {
        [w] => (*w, 1),
        [w, rest @ ..] => (*w, rest.iter().product()),
        [] => (0, 0),
    }
}

/// Single-channel float tables.
#[derive(Debug, Clone, PartialEq)]
pub struct BsdfTables {
    pub tables: [Vec<f32>; 5],
}

impl BsdfTables {
    /// Read the five little-endian `f32` tables from `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut tables: [Vec<f32>; 5] = Default::default();
        for (slot, (name, dims)) in tables.iter_mut().zip(BSDF_TABLES) {
            let path = dir.join(name);
            if !path.exists() {
                return Err(Error::FileNotFound(path));
            }
            let bytes = std::fs::read(&path)?;
            let count = dims.iter().product::<u32>() as usize;
            if bytes.len() != count * 4 {
                return Err(Error::other(format!(
                    "{}: {} bytes, expected {}",
                    path.display(),
                    bytes.len(),
                    count * 4
                )));
            }
            let mut values = vec![0f32; count];
            Cursor::new(bytes).read_f32_into::<LittleEndian>(&mut values)?;
            *slot = values;
        }
        Ok(Self { tables })
    }

    /// Tables filled with one value. Useful when kernels are stubs.
    pub fn uniform(value: f32) -> Self {
        let tables =
            BSDF_TABLES.map(|(_, dims)| vec![value; dims.iter().product::<u32>() as usize]);
        Self { tables }
    }
}

/// Tables uploaded as `R32Float` textures.
pub struct BsdfLuts<D: GpuDevice> {
    textures: Vec<GpuTexture<D>>,
}

impl<D: GpuDevice> BsdfLuts<D> {
    /// Upload all tables. Running out of device memory here is fatal.
    pub fn upload(device: &Arc<D>, tables: &BsdfTables) -> Result<Self> {
        let mut textures = Vec::with_capacity(BSDF_TABLES.len());
        for ((name, dims), data) in BSDF_TABLES.iter().zip(&tables.tables) {
            let (width, height) = table_extent(dims);
            let tex = GpuTexture::new(
                device,
                &TextureDesc {
                    label: name,
                    width,
                    height,
                    format: TextureFormat::R32Float,
                },
            )?;
            tex.write(bytemuck::cast_slice(data))?;
            textures.push(tex);
        }
        tracing::debug!(count = textures.len(), "uploaded BSDF lookup tables");
        Ok(Self { textures })
    }

    /// Texture handles in binding order.
    pub fn handles(&self) -> Vec<TextureHandle> {
        self.textures.iter().map(GpuTexture::handle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;
    use byteorder::WriteBytesExt;

    #[test]
    fn test_extents() {
        assert_eq!(table_extent(&[32]), (32, 1));
        assert_eq!(table_extent(&[128, 32]), (128, 32));
        assert_eq!(table_extent(&[16, 16, 16]), (16, 256));
    }

    #[test]
    fn test_load_tables() {
        let dir = tempfile::tempdir().unwrap();
        for (i, (name, dims)) in BSDF_TABLES.iter().enumerate() {
            let mut bytes = Vec::new();
            for _ in 0..dims.iter().product::<u32>() {
                bytes.write_f32::<LittleEndian>(i as f32).unwrap();
            }
            std::fs::write(dir.path().join(name), bytes).unwrap();
        }
        let tables = BsdfTables::load(dir.path()).unwrap();
        assert_eq!(tables.tables[2], vec![2.0; 32]);
        assert_eq!(tables.tables[1].len(), 4096);
    }

    #[test]
    fn test_load_rejects_short_table() {
        let dir = tempfile::tempdir().unwrap();
        for (name, _) in BSDF_TABLES {
            std::fs::write(dir.path().join(name), [0u8; 4]).unwrap();
        }
        assert!(BsdfTables::load(dir.path()).is_err());
        assert!(matches!(BsdfTables::load("/no/such/dir"), Err(Error::FileNotFound(_))));
    }

    #[test]
    fn test_upload_oom_is_fatal() {
        let dev = Arc::new(HeadlessDevice::default().with_memory_budget(1024));
        let err = BsdfLuts::upload(&dev, &BsdfTables::uniform(0.5)).err().unwrap();
        assert!(err.is_fatal());

        let dev = Arc::new(HeadlessDevice::default());
        let luts = BsdfLuts::upload(&dev, &BsdfTables::uniform(0.5)).unwrap();
        assert_eq!(luts.handles().len(), 5);
        let (w, h, _) = dev.texture_extent(luts.handles()[1]).unwrap();
        assert_eq!((w, h), (16, 256));
    }
}
