// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Pixel formats and frame sizing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A driver pixel-format code (a fourcc for most formats).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PixelFormat(pub u32);

impl PixelFormat {
    pub const ARGB8888: PixelFormat = PixelFormat(imp_sys::PIX_FMT_ARGB8888);
    pub const RGBA8888: PixelFormat = PixelFormat(imp_sys::PIX_FMT_RGBA8888);
    pub const NV12: PixelFormat = PixelFormat(imp_sys::PIX_FMT_NV12);
    pub const YU12: PixelFormat = PixelFormat(imp_sys::PIX_FMT_YU12);
    pub const BG12: PixelFormat = PixelFormat(imp_sys::PIX_FMT_BG12);
    pub const AB12: PixelFormat = PixelFormat(imp_sys::PIX_FMT_AB12);
    pub const GB12: PixelFormat = PixelFormat(imp_sys::PIX_FMT_GB12);
    pub const RG12: PixelFormat = PixelFormat(imp_sys::PIX_FMT_RG12);
    pub const RGBP: PixelFormat = PixelFormat(imp_sys::PIX_FMT_RGBP);
    pub const YUYV: PixelFormat = PixelFormat(imp_sys::PIX_FMT_YUYV);
    pub const UYVY: PixelFormat = PixelFormat(imp_sys::PIX_FMT_UYVY);
    pub const BGR3: PixelFormat = PixelFormat(imp_sys::PIX_FMT_BGR3);
    pub const BGR4: PixelFormat = PixelFormat(imp_sys::PIX_FMT_BGR4);

    pub fn code(self) -> u32 {
        self.0
    }

    /// Bytes needed for one `width` x `height` frame in this format.
    ///
    /// The rules match the strides the hardware consumers expect:
    ///
    /// | formats | size |
    /// |---|---|
    /// | ARGB8888, RGBA8888 | `align16(w) * h * 4` |
    /// | NV12, YU12 | `align16(h) * 12 / 8 * align16(w)` |
    /// | BG12, AB12, GB12, RG12, RGBP, YUYV, UYVY | `w * h * 16 / 8` |
    /// | BGR3 | `w * h * 24 / 8` |
    /// | BGR4 | `w * h * 32 / 8` |
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedFormat`] for any other code
    /// - [`Error::InvalidArg`] if the size does not fit in `usize`
    ///
    /// # Examples
    ///
    /// ```
    /// use imp::PixelFormat;
    ///
    /// # fn main() -> Result<(), imp::Error> {
    /// assert_eq!(PixelFormat::NV12.frame_size(1920, 1080)?, 3_133_440);
    /// assert_eq!(PixelFormat::YUYV.frame_size(640, 480)?, 614_400);
    /// # Ok(())
    /// # }
    /// ```
    pub fn frame_size(self, width: u32, height: u32) -> Result<usize> {
        let w = width as u64;
        let h = height as u64;
        let size = match self {
            Self::ARGB8888 | Self::RGBA8888 => {
                align16(w).checked_mul(h).and_then(|v| v.checked_mul(4))
            }
            Self::NV12 | Self::YU12 => (align16(h) * 12 / 8).checked_mul(align16(w)),
            Self::BG12
            | Self::AB12
            | Self::GB12
            | Self::RG12
            | Self::RGBP
            | Self::YUYV
            | Self::UYVY => w.checked_mul(h).and_then(|v| v.checked_mul(16)).map(|v| v / 8),
            Self::BGR3 => w.checked_mul(h).and_then(|v| v.checked_mul(24)).map(|v| v / 8),
            Self::BGR4 => w.checked_mul(h).and_then(|v| v.checked_mul(32)).map(|v| v / 8),
            Self(code) => return Err(Error::UnsupportedFormat(code)),
        };
        size.and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| Error::InvalidArg(format!("{width}x{height} {self} frame is too large")))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();
        if bytes.iter().all(u8::is_ascii_alphanumeric) {
            bytes.iter().try_for_each(|&b| write!(f, "{}", b as char))
        } else {
            write!(f, "0x{:x}", self.0)
        }
    }
}

fn align16(value: u64) -> u64 {
    (value + 15) & !15
}

/// Geometry and count of the frames a pool should hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub frame_count: usize,
    /// Lower bound on the per-frame size; `0` means "whatever the format needs".
    #[serde(default)]
    pub min_frame_size: usize,
}

impl PoolFormat {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat, frame_count: usize) -> Self {
        Self {
            width,
            height,
            pixel_format,
            frame_count,
            min_frame_size: 0,
        }
    }

    /// Per-frame size: the larger of the format's requirement and
    /// [`Self::min_frame_size`].
    pub fn frame_size(&self) -> Result<usize> {
        Ok(self
            .pixel_format
            .frame_size(self.width, self.height)?
            .max(self.min_frame_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_32bit_aligns_width_only() {
        assert_eq!(PixelFormat::ARGB8888.frame_size(100, 10).unwrap(), 112 * 10 * 4);
        assert_eq!(PixelFormat::RGBA8888.frame_size(16, 3).unwrap(), 16 * 3 * 4);
    }

    #[test]
    fn planar_420_aligns_both_dimensions() {
        assert_eq!(PixelFormat::YU12.frame_size(640, 360).unwrap(), 368 * 12 / 8 * 640);
        assert_eq!(PixelFormat::NV12.frame_size(1, 1).unwrap(), 16 * 12 / 8 * 16);
    }

    #[test]
    fn packed_formats_do_not_align() {
        assert_eq!(PixelFormat::BG12.frame_size(101, 7).unwrap(), 101 * 7 * 2);
        assert_eq!(PixelFormat::UYVY.frame_size(101, 7).unwrap(), 101 * 7 * 2);
        assert_eq!(PixelFormat::BGR3.frame_size(101, 7).unwrap(), 101 * 7 * 3);
        assert_eq!(PixelFormat::BGR4.frame_size(101, 7).unwrap(), 101 * 7 * 4);
    }

    #[test]
    fn unknown_code_is_unsupported() {
        assert!(matches!(
            PixelFormat(0xdead_beef).frame_size(64, 64),
            Err(Error::UnsupportedFormat(0xdead_beef))
        ));
    }

    #[test]
    fn requested_size_wins_when_larger() {
        let mut format = PoolFormat::new(64, 64, PixelFormat::YUYV, 2);
        assert_eq!(format.frame_size().unwrap(), 8192);
        format.min_frame_size = 10_000;
        assert_eq!(format.frame_size().unwrap(), 10_000);
    }

    #[test]
    fn fourcc_display() {
        assert_eq!(PixelFormat::NV12.to_string(), "NV12");
        assert_eq!(PixelFormat::ARGB8888.to_string(), "0x23");
    }
}
