//! Queue pool.
//!
//! Compute queues 0 and 1 belong to the render thread, which alternates
//! between them. The remaining compute queues and all transfer queues go
//! to loader threads. A queue used by more than one thread is marked
//! shared and serializes its submissions.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use super::{CommandList, DeviceProperties, FenceHandle, GpuDevice, QueueId, SemaphoreHandle};
use crate::util::{Error, Result};

/// Compute queues reserved for rendering.
pub const RENDER_QUEUES: u32 = 2;

/// One execution queue and its sharing state.
#[derive(Debug)]
pub struct QueueState {
    id: QueueId,
    shared: bool,
    lock: Mutex<()>,
}

impl QueueState {
    fn new(id: QueueId, shared: bool) -> Self {
        Self {
            id,
            shared,
            lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn id(&self) -> QueueId {
        self.id
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Submit, holding the queue lock when other threads use this queue too.
    pub fn submit<D: GpuDevice>(
        &self,
        device: &D,
        commands: CommandList,
        fence: Option<FenceHandle>,
        signal: &[SemaphoreHandle],
    ) -> Result<()> {
        if self.shared {
            let _guard = self.lock.lock();
            device.submit(self.id, commands, fence, signal)
        } else {
            device.submit(self.id, commands, fence, signal)
        }
    }
}

/// Queues handed to one loader thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderQueues {
    pub loader_idx: u32,
    pub transfer: QueueId,
    pub compute: QueueId,
}

/// All queues of one renderer.
#[derive(Debug)]
pub struct QueuePool {
    compute: Vec<QueueState>,
    transfer: Vec<QueueState>,
    num_loaders: u32,
    next_loader: AtomicU32,
}

impl QueuePool {
    pub fn new(props: &DeviceProperties, num_loaders: u32) -> Result<Self> {
        if props.compute_queues == 0 || props.transfer_queues == 0 {
            return Err(Error::device("device exposes no compute or transfer queue"));
        }

        let num_compute = props.compute_queues.min(RENDER_QUEUES + num_loaders);
        let loader_compute = num_compute.saturating_sub(RENDER_QUEUES);
        let loaders_share_compute = num_loaders > loader_compute;
        let compute = (0..num_compute)
            .map(|i| {
                let shared = loader_compute == 0 || (i >= RENDER_QUEUES && loaders_share_compute);
                QueueState::new(QueueId::compute(i), shared)
            })
            .collect();

        let num_transfer = props.transfer_queues.min(num_loaders.max(1));
        let transfer_shared = num_loaders > num_transfer;
        let transfer = (0..num_transfer)
            .map(|i| QueueState::new(QueueId::transfer(i), transfer_shared))
            .collect();

        Ok(Self {
            compute,
            transfer,
            num_loaders,
            next_loader: AtomicU32::new(0),
        })
    }

    pub fn compute_queue(&self, index: u32) -> &QueueState {
        &self.compute[index as usize % self.compute.len()]
    }

    pub fn transfer_queue(&self, index: u32) -> &QueueState {
        &self.transfer[index as usize % self.transfer.len()]
    }

    pub fn num_compute(&self) -> u32 {
        self.compute.len() as u32
    }

    pub fn num_transfer(&self) -> u32 {
        self.transfer.len() as u32
    }

    /// Render queue used after `current`.
    #[inline]
    pub fn next_render_queue(&self, current: u32) -> u32 {
        if self.compute.len() >= RENDER_QUEUES as usize {
            (current + 1) & 1
        } else {
            0
        }
    }

    /// Assign queues to the next loader thread.
    pub fn reserve_loader(&self) -> Result<LoaderQueues> {
        let loader_idx = self.next_loader.fetch_add(1, Ordering::Relaxed);
        if loader_idx >= self.num_loaders {
            self.next_loader.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::config(format!(
                "all {} loader slots are in use",
                self.num_loaders
            )));
        }

        let loader_compute = self.num_compute().saturating_sub(RENDER_QUEUES);
        let compute = if loader_compute == 0 {
            0
        } else {
            loader_idx % loader_compute + RENDER_QUEUES
        };

        Ok(LoaderQueues {
            loader_idx,
            transfer: QueueId::transfer(loader_idx % self.num_transfer()),
            compute: QueueId::compute(compute),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(compute: u32, transfer: u32) -> DeviceProperties {
        DeviceProperties {
            compute_queues: compute,
            transfer_queues: transfer,
            ..Default::default()
        }
    }

    #[test]
    fn test_dedicated_loader_queues() {
        let pool = QueuePool::new(&props(8, 2), 2).unwrap();
        assert_eq!(pool.num_compute(), 4);
        assert!(!pool.compute_queue(0).is_shared());
        assert!(!pool.compute_queue(3).is_shared());
        assert!(!pool.transfer_queue(1).is_shared());

        let a = pool.reserve_loader().unwrap();
        let b = pool.reserve_loader().unwrap();
        assert_eq!(a.compute, QueueId::compute(2));
        assert_eq!(b.compute, QueueId::compute(3));
        assert_eq!(b.transfer, QueueId::transfer(1));
        assert!(pool.reserve_loader().is_err());
    }

    #[test]
    fn test_oversubscribed_loaders_share() {
        let pool = QueuePool::new(&props(3, 1), 4).unwrap();
        assert!(!pool.compute_queue(0).is_shared());
        assert!(!pool.compute_queue(1).is_shared());
        assert!(pool.compute_queue(2).is_shared());
        assert!(pool.transfer_queue(0).is_shared());
        for _ in 0..4 {
            assert_eq!(pool.reserve_loader().unwrap().compute, QueueId::compute(2));
        }
    }

    #[test]
    fn test_no_loader_compute_queues() {
        let pool = QueuePool::new(&props(2, 1), 1).unwrap();
        assert!(pool.compute_queue(0).is_shared());
        assert!(pool.compute_queue(1).is_shared());
        assert_eq!(pool.reserve_loader().unwrap().compute, QueueId::compute(0));
    }

    #[test]
    fn test_render_round_robin() {
        let pool = QueuePool::new(&props(4, 1), 1).unwrap();
        assert_eq!(pool.next_render_queue(0), 1);
        assert_eq!(pool.next_render_queue(1), 0);

        let single = QueuePool::new(&props(1, 1), 1).unwrap();
        assert_eq!(single.next_render_queue(0), 0);
    }
}
