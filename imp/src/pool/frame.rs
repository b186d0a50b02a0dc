// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Frame slots and the handles that reference them.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use super::BufferPool;
use crate::{PixelFormat, Result};

/// Snapshot of one frame buffer, as delivered to observers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Slot index inside the pool.
    pub index: usize,
    pub channel: usize,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Bytes available in this slot.
    pub size: usize,
    pub phys_addr: u64,
    pub virt_addr: usize,
    /// Microseconds on the system clock when the producer stamped the frame.
    pub timestamp_us: u64,
}

struct SlotState {
    refcount: u32,
    /// Bumped when a flush reclaims the slot, invalidating older handles.
    generation: u64,
    timestamp_us: u64,
}

/// Bookkeeping for one buffer. The per-slot lock guards its reference count.
pub(crate) struct FrameSlot {
    template: FrameInfo,
    state: Mutex<SlotState>,
}

impl FrameSlot {
    pub(crate) fn new(template: FrameInfo) -> Self {
        Self {
            template,
            state: Mutex::new(SlotState {
                refcount: 0,
                generation: 0,
                timestamp_us: 0,
            }),
        }
    }

    pub(crate) fn info(&self) -> FrameInfo {
        FrameInfo {
            timestamp_us: self.state.lock().timestamp_us,
            ..self.template
        }
    }

    /// Marks a free slot as taken and returns its generation.
    pub(crate) fn claim(&self) -> u64 {
        let mut state = self.state.lock();
        debug_assert_eq!(state.refcount, 0, "free slot still referenced");
        state.refcount = 1;
        state.generation
    }

    /// Undoes a [`Self::claim`] that never produced a handle.
    pub(crate) fn unclaim(&self) {
        self.state.lock().refcount = 0;
    }

    fn retain(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation && state.refcount > 0 {
            state.refcount += 1;
        }
    }

    /// Drops one reference. Returns `true` when the slot became free.
    pub(crate) fn release(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || state.refcount == 0 {
            return false;
        }
        state.refcount -= 1;
        state.refcount == 0
    }

    /// Forcibly frees a referenced slot. Returns `true` if it was referenced.
    pub(crate) fn reclaim(&self) -> bool {
        let mut state = self.state.lock();
        if state.refcount == 0 {
            return false;
        }
        state.refcount = 0;
        state.generation += 1;
        true
    }

    fn refcount(&self, generation: u64) -> u32 {
        let state = self.state.lock();
        if state.generation == generation {
            state.refcount
        } else {
            0
        }
    }

    fn stamp(&self, generation: u64, timestamp_us: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.timestamp_us = timestamp_us;
        }
    }
}

/// A reference to one acquired frame buffer.
///
/// Cloning adds a reference to the slot; dropping removes one. The slot goes
/// back to its pool's free queue when the last reference is gone. Use
/// [`crate::PoolManager::release_frame`] or [`Frame::release`] to observe
/// release failures, which `Drop` can only log.
pub struct Frame {
    pool: Option<Arc<BufferPool>>,
    index: usize,
    generation: u64,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("channel", &self.channel())
            .field("index", &self.index)
            .field("refcount", &self.ref_count())
            .finish()
    }
}

impl Frame {
    pub(crate) fn new(pool: Arc<BufferPool>, index: usize, generation: u64) -> Self {
        Self {
            pool: Some(pool),
            index,
            generation,
        }
    }

    fn slot(&self) -> Option<&FrameSlot> {
        self.pool.as_ref().map(|pool| pool.slot(self.index))
    }

    /// Current metadata of the slot.
    pub fn info(&self) -> FrameInfo {
        self.slot().map(FrameSlot::info).unwrap_or_default()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn channel(&self) -> usize {
        self.pool.as_ref().map_or(0, |pool| pool.channel())
    }

    pub fn phys_addr(&self) -> u64 {
        self.info().phys_addr
    }

    pub fn virt_addr(&self) -> usize {
        self.info().virt_addr
    }

    pub fn size(&self) -> usize {
        self.info().size
    }

    pub fn timestamp_us(&self) -> u64 {
        self.info().timestamp_us
    }

    /// Records when the frame was captured.
    pub fn set_timestamp(&self, timestamp_us: u64) {
        if let Some(slot) = self.slot() {
            slot.stamp(self.generation, timestamp_us);
        }
    }

    /// References currently held on the slot, or `0` if the pool reclaimed it.
    pub fn ref_count(&self) -> u32 {
        self.slot().map_or(0, |slot| slot.refcount(self.generation))
    }

    /// Drops this reference now, reporting a failing release hook.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        match self.pool.take() {
            Some(pool) => pool.release_slot(self.index, self.generation),
            None => Ok(()),
        }
    }
}

impl Clone for Frame {
    fn clone(&self) -> Self {
        if let Some(slot) = self.slot() {
            slot.retain(self.generation);
        }
        Self {
            pool: self.pool.clone(),
            index: self.index,
            generation: self.generation,
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            error!(index = self.index, error = %e, "Failed to release frame.");
        }
    }
}
