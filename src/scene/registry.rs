//! Scene-ID slots and the shared scene address table.
//!
//! Loader threads register scenes while render batches bind the shared
//! scene set, so the table, its bind group and the ID free list sit behind
//! one mutex.

use std::sync::Arc;

use parking_lot::Mutex;

use super::SceneAddresses;
use crate::gpu::{BindGroupHandle, CommandList, GpuBuffer, GpuDevice};
use crate::util::{Error, Result};

#[derive(Debug)]
struct SceneTable {
    free_ids: Vec<u32>,
    num_ids: u32,
    max_ids: u32,
}

/// Slot in the scene address table. Returned to the free list on drop.
#[derive(Debug)]
pub struct SceneId {
    table: Arc<Mutex<SceneTable>>,
    id: u32,
}

impl SceneId {
    #[inline]
    pub fn get(&self) -> u32 {
        self.id
    }
}

impl Drop for SceneId {
    fn drop(&mut self) {
        self.table.lock().free_ids.push(self.id);
    }
}

/// Scene address table and the bind group exposing it.
pub struct SharedSceneState<D: GpuDevice> {
    table: Arc<Mutex<SceneTable>>,
    addresses: GpuBuffer<D>,
    bind_group: BindGroupHandle,
    device: Arc<D>,
}

impl<D: GpuDevice> SharedSceneState<D> {
    /// `addresses` must be host-visible and hold `max_scenes` records.
    pub fn new(
        device: Arc<D>,
        addresses: GpuBuffer<D>,
        bind_group: BindGroupHandle,
        max_scenes: u32,
    ) -> Self {
        Self {
            table: Arc::new(Mutex::new(SceneTable {
                free_ids: Vec::new(),
                num_ids: 0,
                max_ids: max_scenes,
            })),
            addresses,
            bind_group,
            device,
        }
    }

    /// Take a free slot and publish the scene's addresses in it.
    pub fn register(&self, addresses: &SceneAddresses) -> Result<SceneId> {
        let mut table = self.table.lock();
        let id = match table.free_ids.pop() {
            Some(id) => id,
            None if table.num_ids < table.max_ids => {
                table.num_ids += 1;
                table.num_ids - 1
            }
            None => {
                return Err(Error::CapacityExceeded {
                    what: "scene",
                    requested: table.num_ids as usize + 1,
                    capacity: table.max_ids as usize,
                })
            }
        };

        let offset = id as u64 * std::mem::size_of::<SceneAddresses>() as u64;
        if let Err(e) = self.addresses.write(offset, bytemuck::bytes_of(addresses)) {
            table.free_ids.push(id);
            return Err(e);
        }
        tracing::debug!(scene_id = id, "registered scene");

        Ok(SceneId {
            table: Arc::clone(&self.table),
            id,
        })
    }

    /// Record the scene-set bind while holding the table lock.
    pub fn bind(&self, cmd: &mut CommandList, set: u32) {
        let _table = self.table.lock();
        cmd.bind_group(set, self.bind_group);
    }

    /// Number of IDs currently handed out.
    pub fn live_ids(&self) -> u32 {
        let table = self.table.lock();
        table.num_ids - table.free_ids.len() as u32
    }
}

impl<D: GpuDevice> Drop for SharedSceneState<D> {
    fn drop(&mut self) {
        self.device.destroy_bind_group(self.bind_group);
    }
}
