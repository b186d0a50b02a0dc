// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Physically addressable memory for buffer pools.

use std::{alloc::Layout, collections::HashMap, ptr::NonNull};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{Error, Result};

/// One contiguous allocation handed out by a [`DeviceAllocator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaRegion {
    pub name: String,
    pub tag: String,
    /// Address the hardware uses.
    pub phys_addr: u64,
    /// Address the CPU uses.
    pub virt_addr: usize,
    pub size: usize,
}

/// Source of physically addressable memory.
///
/// Implementations talk to the platform memory driver; [`HeapAllocator`] is
/// the host-memory fallback used when no driver is available.
pub trait DeviceAllocator: Send + Sync {
    /// Allocates `size` bytes labelled with `name` and `tag`.
    fn alloc(&self, name: &str, size: usize, tag: &str) -> Result<DmaRegion>;

    /// Returns a region obtained from [`Self::alloc`].
    fn free(&self, region: &DmaRegion) -> Result<()>;

    /// Makes CPU writes to `region` visible to the hardware.
    fn flush_cache(&self, region: &DmaRegion) -> Result<()>;
}

struct HeapBlock {
    ptr: NonNull<u8>,
    layout: Layout,
    info: imp_sys::DmaBufferInfo,
}

// Safety: the block is only a record of an allocation owned by the allocator;
// the pointer is never dereferenced through this struct.
unsafe impl Send for HeapBlock {}

/// Page-aligned, zeroed host memory whose physical address equals its
/// virtual address.
pub struct HeapAllocator {
    blocks: Mutex<HashMap<u64, HeapBlock>>,
    max_buffers: usize,
}

impl HeapAllocator {
    /// Creates an allocator that tracks at most `max_buffers` live regions.
    pub fn new(max_buffers: usize) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            max_buffers,
        }
    }

    /// Number of regions currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Descriptor of the region whose physical address is `phys_addr`.
    ///
    /// Descriptor addresses are 32 bits wide, as on the SoC; on wider hosts
    /// only the low word is recorded.
    pub fn info(&self, phys_addr: u64) -> Option<imp_sys::DmaBufferInfo> {
        self.blocks.lock().get(&phys_addr).map(|block| block.info)
    }
}

impl DeviceAllocator for HeapAllocator {
    fn alloc(&self, name: &str, size: usize, tag: &str) -> Result<DmaRegion> {
        if size == 0 {
            return Err(Error::InvalidArg("zero-sized DMA allocation".to_string()));
        }
        let mut blocks = self.blocks.lock();
        if blocks.len() >= self.max_buffers {
            return Err(Error::Allocation(format!(
                "{name}: all {} buffer descriptors in use",
                self.max_buffers
            )));
        }
        let request = imp_sys::MemAllocRequest {
            size: u32::try_from(size)
                .map_err(|_| Error::Allocation(format!("{name}: {size} bytes exceeds 4 GiB")))?,
            align: imp_sys::DMA_PAGE_ALIGN,
            ..Default::default()
        };
        let layout = Layout::from_size_align(request.size as usize, request.align as usize)
            .map_err(|e| Error::InvalidArg(format!("{name}: {e}")))?;
        // Safety: `layout` has a non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or_else(|| Error::Allocation(format!("{name}: {size} bytes")))?;

        let addr = ptr.as_ptr() as usize;
        let mut info = imp_sys::DmaBufferInfo::default();
        imp_sys::write_c_str(&mut info.name, name);
        imp_sys::write_c_str(&mut info.tag, tag);
        info.virt_addr = addr as u32;
        info.phys_addr = addr as u32;
        info.size = request.size;
        info.flags = request.flags;

        blocks.insert(addr as u64, HeapBlock { ptr, layout, info });
        debug!(name, tag, size, addr, "DMA buffer allocated.");
        Ok(DmaRegion {
            name: name.to_string(),
            tag: tag.to_string(),
            phys_addr: addr as u64,
            virt_addr: addr,
            size,
        })
    }

    fn free(&self, region: &DmaRegion) -> Result<()> {
        let block = self
            .blocks
            .lock()
            .remove(&region.phys_addr)
            .ok_or_else(|| Error::NotFound(format!("DMA buffer {}", region.name)))?;
        // Safety: `block` was produced by `alloc_zeroed` with this layout and
        // has just been removed from the table, so it is freed exactly once.
        unsafe { std::alloc::dealloc(block.ptr.as_ptr(), block.layout) };
        debug!(name = %region.name, "DMA buffer freed.");
        Ok(())
    }

    fn flush_cache(&self, region: &DmaRegion) -> Result<()> {
        // Host memory is coherent; only check that the region is ours.
        if self.blocks.lock().contains_key(&region.phys_addr) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("DMA buffer {}", region.name)))
        }
    }
}

impl Drop for HeapAllocator {
    fn drop(&mut self) {
        let blocks = std::mem::take(self.blocks.get_mut());
        if !blocks.is_empty() {
            warn!(count = blocks.len(), "Releasing DMA buffers still allocated.");
        }
        for block in blocks.into_values() {
            // Safety: see `free`.
            unsafe { std::alloc::dealloc(block.ptr.as_ptr(), block.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_page_aligned_and_described() {
        let allocator = HeapAllocator::new(4);
        let region = allocator.alloc("vbm_chn0", 10_000, "vbm_chn0").unwrap();
        assert_eq!(region.phys_addr % 4096, 0);
        assert_eq!(region.phys_addr, region.virt_addr as u64);

        let info = allocator.info(region.phys_addr).unwrap();
        assert_eq!(info.name(), "vbm_chn0");
        assert_eq!(info.size, 10_000);

        allocator.flush_cache(&region).unwrap();
        allocator.free(&region).unwrap();
        assert!(matches!(allocator.free(&region), Err(Error::NotFound(_))));
        assert_eq!(allocator.live_buffers(), 0);
    }

    #[test]
    fn descriptor_table_is_bounded() {
        let allocator = HeapAllocator::new(2);
        let _a = allocator.alloc("a", 16, "t").unwrap();
        let _b = allocator.alloc("b", 16, "t").unwrap();
        assert!(matches!(
            allocator.alloc("c", 16, "t"),
            Err(Error::Allocation(_))
        ));
    }

    #[test]
    fn zero_size_is_rejected() {
        let allocator = HeapAllocator::new(2);
        assert!(matches!(allocator.alloc("z", 0, "t"), Err(Error::InvalidArg(_))));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn oversized_request_is_an_allocation_failure() {
        let allocator = HeapAllocator::new(2);
        assert!(matches!(
            allocator.alloc("big", u32::MAX as usize + 1, "t"),
            Err(Error::Allocation(_))
        ));
        assert_eq!(allocator.live_buffers(), 0);
    }
}
