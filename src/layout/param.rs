//! Flat per-batch parameter blob layout.

use std::mem::size_of;

use super::packed::{InstanceTransform, PackedEnv, PackedLight};
use crate::config::RenderConfig;
use crate::util::align_offset;

/// Byte layout of the parameter buffer: transforms, material indices,
/// lights and per-environment records, each section starting on the
/// device storage alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamBufferConfig {
    pub total_transform_bytes: u64,
    pub material_indices_offset: u64,
    pub total_material_index_bytes: u64,
    pub lights_offset: u64,
    pub total_light_param_bytes: u64,
    pub env_offset: u64,
    pub total_env_param_bytes: u64,
    pub total_param_bytes: u64,
}

impl ParamBufferConfig {
    /// Layout for `batch_size` environments sharing `max_instances`
    /// instance slots and `max_lights` light slots.
    pub fn new(
        max_instances: u32,
        max_lights: u32,
        batch_size: u32,
        storage_alignment: u64,
    ) -> Self {
        let total_transform_bytes = size_of::<InstanceTransform>() as u64 * max_instances as u64;

        let material_indices_offset = align_offset(total_transform_bytes, storage_alignment);
        let total_material_index_bytes = size_of::<u32>() as u64 * max_instances as u64;

        let lights_offset =
            align_offset(material_indices_offset + total_material_index_bytes, storage_alignment);
        let total_light_param_bytes = size_of::<PackedLight>() as u64 * max_lights as u64;

        let env_offset = align_offset(lights_offset + total_light_param_bytes, storage_alignment);
        let total_env_param_bytes = size_of::<PackedEnv>() as u64 * batch_size as u64;

        let total_param_bytes = align_offset(env_offset + total_env_param_bytes, storage_alignment);

        Self {
            total_transform_bytes,
            material_indices_offset,
            total_material_index_bytes,
            lights_offset,
            total_light_param_bytes,
            env_offset,
            total_env_param_bytes,
            total_param_bytes,
        }
    }

    pub fn from_config(cfg: &RenderConfig, storage_alignment: u64) -> Self {
        Self::new(cfg.max_instances, cfg.max_lights, cfg.batch_size, storage_alignment)
    }

    /// (offset, size) of each section in binding order.
    pub fn regions(&self) -> [(u64, u64); 4] {
        [
            (0, self.total_transform_bytes),
            (self.material_indices_offset, self.total_material_index_bytes),
            (self.lights_offset, self.total_light_param_bytes),
            (self.env_offset, self.total_env_param_bytes),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_aligned_and_ordered() {
        for &align in &[1u64, 4, 16, 64, 256] {
            let cases = [
                (1u32, 1u32, 1u32),
                (7, 3, 5),
                (1000, 129, 33),
                (65536, 4096, 256),
            ];
            for &(inst, lights, batch) in &cases {
                let cfg = ParamBufferConfig::new(inst, lights, batch, align);
                let regions = cfg.regions();
                let mut prev_end = 0;
                for (offset, size) in regions {
                    assert_eq!(offset % align, 0);
                    assert!(offset >= prev_end);
                    prev_end = offset + size;
                }
                assert_eq!(cfg.total_param_bytes % align, 0);
                let sum: u64 = regions.iter().map(|r| r.1).sum();
                assert!(cfg.total_param_bytes >= sum);
                assert!(cfg.total_param_bytes >= prev_end);
            }
        }
    }

    #[test]
    fn test_section_sizes() {
        let cfg = ParamBufferConfig::new(10, 2, 3, 256);
        assert_eq!(cfg.total_transform_bytes, 960);
        assert_eq!(cfg.material_indices_offset, 1024);
        assert_eq!(cfg.total_material_index_bytes, 40);
        assert_eq!(cfg.lights_offset, 1280);
        assert_eq!(cfg.total_light_param_bytes, 128);
        assert_eq!(cfg.env_offset, 1536);
        assert_eq!(cfg.total_env_param_bytes, 384);
        assert_eq!(cfg.total_param_bytes, 2048);
    }
}
