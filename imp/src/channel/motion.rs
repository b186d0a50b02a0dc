// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Default motion-detection channel handler.
//!
//! [`MotionHandler`] provides the channel plumbing of a motion detector:
//! parameter validation, per-region result flags and flush semantics. It
//! reports no motion in any region; a real detector replaces `process`.

use imp_sys::MOVE_MAX_ROI_CNT;
use tracing::debug;

use crate::{ChannelHandler, Error, FrameInfo, Result};

/// Sensitivity accepted per region, from least to most sensitive.
pub const MOTION_SENSE_RANGE: std::ops::RangeInclusive<i32> = 0..=4;

/// Inclusive rectangle in frame coordinates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

/// Configuration of a motion channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionParams {
    /// Sensitivity of each region.
    pub sense: [i32; MOVE_MAX_ROI_CNT],
    /// Frames to skip between two detections; skipped frames keep the
    /// previous result.
    pub skip_frame_count: u32,
    /// Expected frame width.
    pub width: u32,
    /// Expected frame height.
    pub height: u32,
    /// Regions of interest, at most [`MOVE_MAX_ROI_CNT`].
    pub rois: Vec<Rect>,
}

impl MotionParams {
    /// One region covering the whole `width` x `height` frame.
    pub fn full_frame(width: u32, height: u32) -> Self {
        Self {
            sense: [2; MOVE_MAX_ROI_CNT],
            skip_frame_count: 0,
            width,
            height,
            rois: vec![Rect {
                x0: 0,
                y0: 0,
                x1: width.saturating_sub(1) as i32,
                y1: height.saturating_sub(1) as i32,
            }],
        }
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidArg("motion frame size is zero".to_string()));
        }
        if self.rois.len() > MOVE_MAX_ROI_CNT {
            return Err(Error::InvalidArg(format!(
                "{} regions (at most {MOVE_MAX_ROI_CNT})",
                self.rois.len()
            )));
        }
        if let Some(sense) = self.sense.iter().find(|&&s| !MOTION_SENSE_RANGE.contains(&s)) {
            return Err(Error::InvalidArg(format!("sensitivity {sense}")));
        }
        let (w, h) = (self.width as i32, self.height as i32);
        for roi in &self.rois {
            let inside = roi.x0 >= 0 && roi.y0 >= 0 && roi.x1 < w && roi.y1 < h;
            if !inside || roi.x0 > roi.x1 || roi.y0 > roi.y1 {
                return Err(Error::InvalidArg(format!("region {roi:?} outside {w}x{h}")));
            }
        }
        Ok(())
    }
}

/// Result of one motion detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionOutput {
    /// Non-zero where motion was detected, per region.
    pub roi_flags: [i32; MOVE_MAX_ROI_CNT],
    /// Timestamp of the analyzed frame.
    pub timestamp_us: u64,
}

impl Default for MotionOutput {
    fn default() -> Self {
        Self {
            roi_flags: [0; MOVE_MAX_ROI_CNT],
            timestamp_us: 0,
        }
    }
}

impl MotionOutput {
    pub fn any_motion(&self) -> bool {
        self.roi_flags.iter().any(|&flag| flag != 0)
    }
}

/// Motion-detection handler reporting a still scene.
#[derive(Debug)]
pub struct MotionHandler {
    params: MotionParams,
    output: MotionOutput,
    frames: u64,
}

impl MotionHandler {
    pub fn new(params: MotionParams) -> Self {
        Self {
            params,
            output: MotionOutput::default(),
            frames: 0,
        }
    }

    pub fn params(&self) -> &MotionParams {
        &self.params
    }

    /// Frames processed since creation or the last flush.
    pub fn frames_processed(&self) -> u64 {
        self.frames
    }
}

impl ChannelHandler for MotionHandler {
    type Output = MotionOutput;

    fn init(&mut self) -> Result<()> {
        self.params.validate()
    }

    fn process(&mut self, frame: &FrameInfo) -> Result<()> {
        if frame.width != self.params.width || frame.height != self.params.height {
            return Err(Error::InvalidArg(format!(
                "frame is {}x{}, detector expects {}x{}",
                frame.width, frame.height, self.params.width, self.params.height
            )));
        }
        if self.frames % (u64::from(self.params.skip_frame_count) + 1) == 0 {
            self.output.roi_flags = [0; MOVE_MAX_ROI_CNT];
            self.output.timestamp_us = frame.timestamp_us;
        }
        self.frames += 1;
        Ok(())
    }

    fn get_result(&mut self) -> Result<MotionOutput> {
        Ok(self.output.clone())
    }

    fn flush(&mut self) -> Result<()> {
        self.output = MotionOutput::default();
        self.frames = 0;
        Ok(())
    }

    fn exit(&mut self) {
        debug!(frames = self.frames, "Motion handler released.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PixelFormat;

    fn frame(width: u32, height: u32) -> FrameInfo {
        FrameInfo {
            width,
            height,
            pixel_format: PixelFormat::NV12,
            timestamp_us: 42,
            ..FrameInfo::default()
        }
    }

    #[test]
    fn process_reports_no_motion() {
        let mut handler = MotionHandler::new(MotionParams::full_frame(640, 360));
        handler.init().unwrap();
        handler.output.roi_flags[3] = 1;
        handler.process(&frame(640, 360)).unwrap();
        let output = handler.get_result().unwrap();
        assert!(!output.any_motion());
        assert_eq!(output.timestamp_us, 42);
        assert_eq!(handler.frames_processed(), 1);
    }

    #[test]
    fn skipped_frames_keep_previous_result() {
        let mut params = MotionParams::full_frame(64, 64);
        params.skip_frame_count = 1;
        let mut handler = MotionHandler::new(params);
        handler.process(&frame(64, 64)).unwrap();
        let mut later = frame(64, 64);
        later.timestamp_us = 99;
        handler.process(&later).unwrap();
        assert_eq!(handler.get_result().unwrap().timestamp_us, 42);
        handler.process(&later).unwrap();
        assert_eq!(handler.get_result().unwrap().timestamp_us, 99);
    }

    #[test]
    fn geometry_mismatch_fails() {
        let mut handler = MotionHandler::new(MotionParams::full_frame(640, 360));
        assert!(handler.process(&frame(320, 180)).is_err());
    }

    #[test]
    fn invalid_params_fail_init() {
        let mut params = MotionParams::full_frame(640, 360);
        params.rois = vec![Rect::default(); MOVE_MAX_ROI_CNT + 1];
        assert!(MotionHandler::new(params).init().is_err());

        let mut params = MotionParams::full_frame(640, 360);
        params.rois[0].x1 = 640;
        assert!(MotionHandler::new(params).init().is_err());

        let mut params = MotionParams::full_frame(640, 360);
        params.sense[0] = 9;
        assert!(MotionHandler::new(params).init().is_err());
    }
}
