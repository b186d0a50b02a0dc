// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Per-channel pools of hardware frame buffers.
//!
//! A pool is one contiguous allocation from a [`DeviceAllocator`], cut into
//! `frame_count` slots of equal size. Slot `i` always starts at
//! `base + i * frame_size`, in both the physical and the virtual address
//! space. Free slots wait in a FIFO queue; [`PoolManager::acquire_frame`]
//! takes the oldest one and [`Frame`] handles put it back once their last
//! reference is gone.

pub mod allocator;
pub mod format;
pub mod frame;

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    DeviceAllocator, Error, FrameInfo, PoolFormat, Result,
    pool::{allocator::DmaRegion, frame::Frame, frame::FrameSlot},
    wait::{WaitMode, recv_with},
};

/// Name of the pool (and of its DMA allocation) serving `channel`.
pub fn pool_name(channel: usize) -> String {
    format!("vbm_chn{channel}")
}

/// Hooks a producer can attach to a pool.
///
/// A frame-source stage typically queues a slot back to the capture driver in
/// [`PoolHooks::on_release`].
pub trait PoolHooks: Send + Sync {
    /// Runs after a slot is taken from the free queue, before the caller sees it.
    /// Failure returns the slot and fails the acquisition.
    fn on_acquire(&self, _frame: &FrameInfo) -> Result<()> {
        Ok(())
    }

    /// Runs when the last reference to a slot is dropped.
    fn on_release(&self, _frame: &FrameInfo) -> Result<()> {
        Ok(())
    }
}

/// Summary of a live pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    pub channel: usize,
    pub name: String,
    pub format: PoolFormat,
    pub frame_size: usize,
    pub total_size: usize,
    pub phys_base: u64,
    pub virt_base: usize,
}

pub(crate) struct BufferPool {
    channel: usize,
    name: String,
    format: PoolFormat,
    frame_size: usize,
    allocator: Arc<dyn DeviceAllocator>,
    region: Option<DmaRegion>,
    slots: Vec<FrameSlot>,
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,
    hooks: Option<Arc<dyn PoolHooks>>,
}

impl BufferPool {
    fn new(
        channel: usize,
        format: &PoolFormat,
        allocator: Arc<dyn DeviceAllocator>,
        hooks: Option<Arc<dyn PoolHooks>>,
    ) -> Result<Self> {
        if format.frame_count == 0 {
            return Err(Error::InvalidArg("pool needs at least one frame".to_string()));
        }
        let frame_size = format.frame_size()?;
        if frame_size == 0 {
            return Err(Error::InvalidArg(format!(
                "{}x{} frames are empty",
                format.width, format.height
            )));
        }
        let total_size = frame_size
            .checked_mul(format.frame_count)
            .ok_or_else(|| Error::InvalidArg("pool size overflows".to_string()))?;

        let (free_tx, free_rx) = crossbeam_channel::bounded(format.frame_count);
        for index in 0..format.frame_count {
            free_tx
                .try_send(index)
                .map_err(|_| Error::Other("Free queue overflow.".to_string()))?;
        }

        let name = pool_name(channel);
        let region = allocator.alloc(&name, total_size, &name).map_err(|e| match e {
            Error::Allocation(_) => e,
            other => Error::Allocation(format!("{name}: {other}")),
        })?;

        let slots = (0..format.frame_count)
            .map(|index| {
                FrameSlot::new(FrameInfo {
                    index,
                    channel,
                    width: format.width,
                    height: format.height,
                    pixel_format: format.pixel_format,
                    size: frame_size,
                    phys_addr: region.phys_addr + (index * frame_size) as u64,
                    virt_addr: region.virt_addr + index * frame_size,
                    timestamp_us: 0,
                })
            })
            .collect();

        Ok(Self {
            channel,
            name,
            format: *format,
            frame_size,
            allocator,
            region: Some(region),
            slots,
            free_tx,
            free_rx,
            hooks,
        })
    }

    pub(crate) fn channel(&self) -> usize {
        self.channel
    }

    pub(crate) fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    fn info(&self) -> PoolInfo {
        let (phys_base, virt_base) = self
            .region
            .as_ref()
            .map_or((0, 0), |r| (r.phys_addr, r.virt_addr));
        PoolInfo {
            channel: self.channel,
            name: self.name.clone(),
            format: self.format,
            frame_size: self.frame_size,
            total_size: self.frame_size * self.slots.len(),
            phys_base,
            virt_base,
        }
    }

    fn requeue(&self, index: usize) -> Result<()> {
        self.free_tx
            .try_send(index)
            .map_err(|_| Error::Other(format!("{}: slot {index} queued twice", self.name)))
    }

    fn acquire(self: &Arc<Self>, wait: WaitMode) -> Result<Frame> {
        let index = recv_with(&self.free_rx, wait)?;
        let slot = &self.slots[index];
        let generation = slot.claim();
        if let Some(hooks) = &self.hooks
            && let Err(e) = hooks.on_acquire(&slot.info())
        {
            slot.unclaim();
            self.requeue(index)?;
            return Err(Error::handler("on_acquire", e));
        }
        debug!(pool = %self.name, index, "Frame acquired.");
        Ok(Frame::new(self.clone(), index, generation))
    }

    pub(crate) fn release_slot(&self, index: usize, generation: u64) -> Result<()> {
        let slot = &self.slots[index];
        if !slot.release(generation) {
            return Ok(());
        }
        let hooked = match &self.hooks {
            Some(hooks) => hooks
                .on_release(&slot.info())
                .map_err(|e| Error::handler("on_release", e)),
            None => Ok(()),
        };
        self.requeue(index)?;
        debug!(pool = %self.name, index, "Frame returned.");
        hooked
    }

    fn flush(&self) -> Result<usize> {
        let mut reclaimed = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.reclaim() {
                self.requeue(index)?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    fn destroy(mut self) -> Result<()> {
        self.destroy_inner()
    }

    fn destroy_inner(&mut self) -> Result<()> {
        match self.region.take() {
            Some(region) => self.allocator.free(&region),
            None => Ok(()),
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_inner() {
            error!(pool = %self.name, error = %e, "Failed to free pool memory.");
        }
    }
}

/// Table of buffer pools, one slot per channel.
pub struct PoolManager {
    allocator: Arc<dyn DeviceAllocator>,
    pools: Mutex<Vec<Option<Arc<BufferPool>>>>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pools = self.pools.lock();
        f.debug_struct("PoolManager")
            .field("slots", &pools.len())
            .field("live", &pools.iter().flatten().count())
            .finish()
    }
}

impl PoolManager {
    /// Creates a manager with `max_pools` channel slots.
    pub fn new(allocator: Arc<dyn DeviceAllocator>, max_pools: usize) -> Self {
        Self {
            allocator,
            pools: Mutex::new(vec![None; max_pools]),
        }
    }

    pub fn allocator(&self) -> &Arc<dyn DeviceAllocator> {
        &self.allocator
    }

    fn pool(&self, channel: usize) -> Result<Arc<BufferPool>> {
        self.pools
            .lock()
            .get(channel)
            .ok_or_else(|| Error::InvalidAddress(format!("pool channel {channel}")))?
            .clone()
            .ok_or_else(|| Error::NotFound(format!("pool for channel {channel}")))
    }

    /// Allocates a pool for `channel` sized from `format`.
    ///
    /// On failure nothing is left allocated and the slot stays empty.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if `channel` has no slot
    /// - [`Error::AlreadyExists`] if the channel already has a pool
    /// - [`Error::InvalidArg`] if `format.frame_count` is zero
    /// - [`Error::UnsupportedFormat`] if the pixel format has no sizing rule
    /// - [`Error::Allocation`] if the allocator refuses the request
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use imp::{HeapAllocator, PixelFormat, PoolFormat, PoolManager};
    ///
    /// # fn main() -> Result<(), imp::Error> {
    /// let pools = PoolManager::new(Arc::new(HeapAllocator::new(8)), 6);
    /// let info = pools.create_pool(0, &PoolFormat::new(640, 360, PixelFormat::NV12, 3), None)?;
    /// assert_eq!(info.name, "vbm_chn0");
    /// assert_eq!(info.total_size, 3 * info.frame_size);
    /// pools.destroy_pool(0)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn create_pool(
        &self,
        channel: usize,
        format: &PoolFormat,
        hooks: Option<Arc<dyn PoolHooks>>,
    ) -> Result<PoolInfo> {
        let mut pools = self.pools.lock();
        let slot = pools
            .get_mut(channel)
            .ok_or_else(|| Error::InvalidAddress(format!("pool channel {channel}")))?;
        if slot.is_some() {
            return Err(Error::AlreadyExists(pool_name(channel)));
        }
        let pool = BufferPool::new(channel, format, self.allocator.clone(), hooks)?;
        let info = pool.info();
        *slot = Some(Arc::new(pool));
        info!(
            channel,
            format = %format.pixel_format,
            width = format.width,
            height = format.height,
            frames = format.frame_count,
            frame_size = info.frame_size,
            "Pool created."
        );
        Ok(info)
    }

    /// Removes the pool for `channel` and frees its memory.
    ///
    /// If frames from the pool are still referenced, the memory is freed when
    /// the last of them is dropped instead.
    pub fn destroy_pool(&self, channel: usize) -> Result<()> {
        let pool = self
            .pools
            .lock()
            .get_mut(channel)
            .ok_or_else(|| Error::InvalidAddress(format!("pool channel {channel}")))?
            .take()
            .ok_or_else(|| Error::NotFound(format!("pool for channel {channel}")))?;
        info!(channel, "Pool destroyed.");
        Self::dispose(pool)
    }

    fn dispose(pool: Arc<BufferPool>) -> Result<()> {
        match Arc::into_inner(pool) {
            Some(pool) => pool.destroy(),
            None => {
                warn!("Frames still referenced; pool memory released with the last one.");
                Ok(())
            }
        }
    }

    /// Destroys every pool, returning the first failure.
    pub(crate) fn destroy_all(&self) -> Result<()> {
        let pools: Vec<_> = self.pools.lock().iter_mut().filter_map(Option::take).collect();
        pools
            .into_iter()
            .map(Self::dispose)
            .fold(Ok(()), |first, next| first.and(next))
    }

    /// Takes the oldest free frame of `channel`'s pool.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no frame became free within `wait`
    /// - [`Error::NotFound`] if the channel has no pool
    /// - [`Error::HandlerFailure`] if the pool's acquire hook failed
    pub fn acquire_frame(&self, channel: usize, wait: WaitMode) -> Result<Frame> {
        self.pool(channel)?.acquire(wait)
    }

    /// Releases `frame`, which must come from `channel`'s pool.
    pub fn release_frame(&self, channel: usize, frame: Frame) -> Result<()> {
        let pool = self.pool(channel)?;
        if frame.channel() != pool.channel() {
            return Err(Error::InvalidArg(format!(
                "frame from channel {} released to channel {channel}",
                frame.channel()
            )));
        }
        frame.release()
    }

    /// Forces every slot of `channel`'s pool back onto the free queue.
    ///
    /// Handles that were outstanding become inert: dropping them has no effect.
    /// Returns the number of slots reclaimed.
    pub fn flush(&self, channel: usize) -> Result<usize> {
        let reclaimed = self.pool(channel)?.flush()?;
        if reclaimed > 0 {
            info!(channel, reclaimed, "Pool flushed.");
        }
        Ok(reclaimed)
    }

    pub fn pool_info(&self, channel: usize) -> Result<PoolInfo> {
        Ok(self.pool(channel)?.info())
    }

    /// Frames currently waiting in `channel`'s free queue.
    pub fn free_frames(&self, channel: usize) -> Result<usize> {
        Ok(self.pool(channel)?.free_rx.len())
    }
}
