// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! # imp-sys: Kernel and hardware ABI structures for the IMP runtime
//!
//! This crate holds the fixed-layout structures exchanged with the frame-channel
//! driver and the physical memory allocator, together with the numeric codes
//! (device kinds, pixel-format fourccs) that travel across that boundary.
//!
//! ## Usage
//!
//! **Most users should NOT use this crate directly.** Use the safe [`imp`]
//! runtime crate instead, which provides:
//! - Typed pixel formats and frame geometry
//! - Module registry, binding and buffer pools
//! - Rust-idiomatic error handling with `Result`
//!
//! This crate is only needed for:
//! - Implementing a [`imp`] device backend that talks to a real driver
//! - Inspecting raw descriptors returned by an allocator
//!
//! ## Layout
//!
//! Every structure is `#[repr(C)]`, derives [`bytemuck::Pod`] so it can be
//! passed to a driver as a byte buffer, and has its size and field offsets
//! pinned by compile-time assertions at the bottom of this file.
//!
//! [`imp`]: https://docs.rs/imp

#![allow(clippy::missing_safety_doc)]

use core::mem::{offset_of, size_of};

use bytemuck::{Pod, Zeroable};

/// Version string reported by the runtime (without the `IMP-` prefix).
pub const IMP_VERSION: &str = "1.1.6";

/// Number of device-kind rows in the module address space.
pub const MAX_DEVICES: usize = 6;
/// Number of group columns in the module address space.
pub const MAX_GROUPS: usize = 6;

/// Frame source (ISP output channels).
pub const DEV_ID_FS: i32 = 0;
/// Hardware encoder.
pub const DEV_ID_ENC: i32 = 1;
/// Intelligent video analysis (motion detection).
pub const DEV_ID_IVS: i32 = 3;
/// On-screen-display compositor.
pub const DEV_ID_OSD: i32 = 4;

/// Path prefix of the frame-channel character devices (`/dev/framechanN`).
pub const FRAMECHAN_DEVICE_PREFIX: &str = "/dev/framechan";

/// Buffer type requested when negotiating the buffer count.
pub const FS_BUF_TYPE_CAPTURE: i32 = 1;
/// Buffer mode requested when negotiating the buffer count.
pub const FS_BUF_MODE_MMAP: i32 = 2;

/// Alignment of physical allocations.
pub const DMA_PAGE_ALIGN: u32 = 4096;

/// Number of regions of interest in a motion-detection request.
pub const MOVE_MAX_ROI_CNT: usize = 52;

// Pixel formats as understood by the frame-channel driver.
pub const PIX_FMT_ARGB8888: u32 = 0x23;
pub const PIX_FMT_RGBA8888: u32 = 0x0f;
pub const PIX_FMT_NV12: u32 = 0x3231_564e;
pub const PIX_FMT_YU12: u32 = 0x3231_5559;
pub const PIX_FMT_BG12: u32 = 0x3231_4742;
pub const PIX_FMT_AB12: u32 = 0x3231_4142;
pub const PIX_FMT_GB12: u32 = 0x3231_4247;
pub const PIX_FMT_RG12: u32 = 0x3231_4752;
pub const PIX_FMT_RGBP: u32 = 0x5042_4752;
pub const PIX_FMT_YUYV: u32 = 0x5659_5559;
pub const PIX_FMT_UYVY: u32 = 0x5956_5955;
pub const PIX_FMT_BGR3: u32 = 0x3352_4742;
pub const PIX_FMT_BGR4: u32 = 0x3452_4742;

/// Address of one output port, as passed by C callers of the bind API.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Cell {
    pub device_id: i32,
    pub group_id: i32,
    pub output_id: i32,
}

/// Format negotiated with a frame channel (`VIDIOC_GET_FMT` / `VIDIOC_SET_FMT`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FsFormat {
    pub enable: i32,
    pub width: i32,
    pub height: i32,
    pub pixfmt: u32,
}

/// Buffer-count request. The driver writes the granted count back into `count`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FsBufCount {
    pub count: i32,
    pub buf_type: i32,
    pub mode: i32,
}

impl FsBufCount {
    /// Builds the request the runtime sends for `count` capture buffers.
    pub fn capture(count: i32) -> Self {
        Self {
            count,
            buf_type: FS_BUF_TYPE_CAPTURE,
            mode: FS_BUF_MODE_MMAP,
        }
    }
}

/// Physical memory request exchanged with the memory driver.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MemAllocRequest {
    pub size: u32,
    pub align: u32,
    pub phys_addr: u32,
    pub flags: u32,
}

/// Descriptor of one allocated DMA buffer (0x94 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DmaBufferInfo {
    pub name: [u8; 96],
    pub tag: [u8; 32],
    pub virt_addr: u32,
    pub phys_addr: u32,
    pub size: u32,
    pub flags: u32,
    pub pool_id: u32,
}

impl Default for DmaBufferInfo {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl DmaBufferInfo {
    /// Returns the buffer name up to the first NUL byte.
    pub fn name(&self) -> &str {
        c_str(&self.name)
    }

    /// Returns the buffer tag up to the first NUL byte.
    pub fn tag(&self) -> &str {
        c_str(&self.tag)
    }
}

/// Version string buffer (`IMP-x.y.z`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Version {
    pub version: [u8; 64],
}

impl Version {
    pub fn as_str(&self) -> &str {
        c_str(&self.version)
    }
}

/// Copies `value` into a fixed C string buffer, truncating so that the last
/// byte is always NUL. Returns the number of bytes copied.
pub fn write_c_str(buffer: &mut [u8], value: &str) -> usize {
    buffer.fill(0);
    let Some(room) = buffer.len().checked_sub(1) else {
        return 0;
    };
    let mut len = value.len().min(room);
    while !value.is_char_boundary(len) {
        len -= 1;
    }
    buffer[..len].copy_from_slice(&value.as_bytes()[..len]);
    len
}

/// Reads a NUL-terminated string out of a fixed buffer. Invalid UTF-8 yields
/// the longest valid prefix.
pub fn c_str(buffer: &[u8]) -> &str {
    let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    match core::str::from_utf8(&buffer[..end]) {
        Ok(s) => s,
        Err(e) => {
            // SAFETY: `valid_up_to` marks the end of a valid UTF-8 prefix.
            unsafe { core::str::from_utf8_unchecked(&buffer[..e.valid_up_to()]) }
        }
    }
}

const _: () = assert!(size_of::<Cell>() == 12);
const _: () = assert!(offset_of!(Cell, output_id) == 0x08);

const _: () = assert!(size_of::<FsFormat>() == 0x10);
const _: () = assert!(offset_of!(FsFormat, width) == 0x04);
const _: () = assert!(offset_of!(FsFormat, height) == 0x08);
const _: () = assert!(offset_of!(FsFormat, pixfmt) == 0x0c);

const _: () = assert!(size_of::<FsBufCount>() == 12);

const _: () = assert!(size_of::<MemAllocRequest>() == 0x10);
const _: () = assert!(offset_of!(MemAllocRequest, phys_addr) == 0x08);

const _: () = assert!(size_of::<DmaBufferInfo>() == 0x94);
const _: () = assert!(offset_of!(DmaBufferInfo, tag) == 0x60);
const _: () = assert!(offset_of!(DmaBufferInfo, virt_addr) == 0x80);
const _: () = assert!(offset_of!(DmaBufferInfo, phys_addr) == 0x84);
const _: () = assert!(offset_of!(DmaBufferInfo, size) == 0x88);
const _: () = assert!(offset_of!(DmaBufferInfo, pool_id) == 0x90);

const _: () = assert!(size_of::<Version>() == 64);
