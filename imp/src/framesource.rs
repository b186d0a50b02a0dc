// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Frame source: the producer stage that feeds capture buffers into the
//! module graph.
//!
//! Each frame-source channel owns one frame-channel device and one pool. Once
//! enabled, the channel's module sits at `(FrameSource, chn)` in the registry
//! and every [`FrameSource::deliver`] call pushes one frame to the observers
//! bound to it.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    DeviceKind, Error, ImpSystem, Module, PixelFormat, PoolFormat, Result, WaitMode,
    device::{DeviceOpener, FrameChannelDevice, open_with_retry},
};

/// Number of frame-source channels.
pub const FS_MAX_CHANNELS: usize = 5;

/// Module name used for frame-source channels.
const MODULE_NAME: &str = "framesource";

/// Capture attributes of a frame-source channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsChannelAttr {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Buffers requested from the driver. The driver may grant fewer.
    pub frame_count: usize,
    /// Frames the driver may queue ahead of the consumer; `0` leaves the
    /// driver default.
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub min_frame_size: usize,
}

impl FsChannelAttr {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat, frame_count: usize) -> Self {
        Self {
            width,
            height,
            pixel_format,
            frame_count,
            depth: 0,
            min_frame_size: 0,
        }
    }

    /// Checks the attributes before they reach a driver.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArg`] for zero or oversized geometry, or no frames
    /// - [`Error::UnsupportedFormat`] if no frame size is known for the format
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidArg(format!(
                "frame size {}x{}",
                self.width, self.height
            )));
        }
        if i32::try_from(self.width).is_err()
            || i32::try_from(self.height).is_err()
            || i32::try_from(self.depth).is_err()
        {
            return Err(Error::InvalidArg(format!(
                "frame size {}x{} depth {}",
                self.width, self.height, self.depth
            )));
        }
        if self.frame_count == 0 || i32::try_from(self.frame_count).is_err() {
            return Err(Error::InvalidArg(format!(
                "frame count {}",
                self.frame_count
            )));
        }
        self.pool_format(self.frame_count).frame_size()?;
        Ok(())
    }

    fn pool_format(&self, frame_count: usize) -> PoolFormat {
        PoolFormat {
            min_frame_size: self.min_frame_size,
            ..PoolFormat::new(self.width, self.height, self.pixel_format, frame_count)
        }
    }

    // Fields fit in i32 once validated.
    fn device_format(&self) -> imp_sys::FsFormat {
        imp_sys::FsFormat {
            enable: 1,
            width: self.width as i32,
            height: self.height as i32,
            pixfmt: self.pixel_format.code(),
        }
    }
}

struct Streaming {
    device: Box<dyn FrameChannelDevice>,
    module: Arc<Module>,
}

struct FsChannel {
    attr: FsChannelAttr,
    /// Set while an `enable` call negotiates with the device unlocked.
    enabling: bool,
    streaming: Option<Streaming>,
}

/// The frame-source stage.
///
/// # Examples
///
/// ```no_run
/// use imp::{DeviceOpener, FrameSource, FsChannelAttr, ImpSystem, PixelFormat, WaitMode};
///
/// fn capture(system: &ImpSystem, opener: &dyn DeviceOpener) -> Result<(), imp::Error> {
///     let source = FrameSource::new(system);
///     source.create_channel(0, FsChannelAttr::new(1920, 1080, PixelFormat::NV12, 4))?;
///     source.enable(0, opener)?;
///     let consumers = source.deliver(0, WaitMode::Forever)?;
///     println!("frame delivered to {consumers} modules");
///     source.disable(0)
/// }
/// ```
pub struct FrameSource {
    system: ImpSystem,
    channels: Mutex<Vec<Option<FsChannel>>>,
}

impl std::fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.channels.lock();
        let created: Vec<usize> = (0..channels.len())
            .filter(|&chn| channels[chn].is_some())
            .collect();
        f.debug_struct("FrameSource")
            .field("channels", &created)
            .finish()
    }
}

impl FrameSource {
    pub fn new(system: &ImpSystem) -> Self {
        Self {
            system: system.clone(),
            channels: Mutex::new((0..FS_MAX_CHANNELS).map(|_| None).collect()),
        }
    }

    /// Declares channel `chn` with its capture attributes.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if `chn` is out of range
    /// - [`Error::AlreadyExists`] if the channel was already created
    /// - any error from [`FsChannelAttr::validate`]
    pub fn create_channel(&self, chn: usize, attr: FsChannelAttr) -> Result<()> {
        attr.validate()?;
        let mut channels = self.channels.lock();
        let slot = channels
            .get_mut(chn)
            .ok_or_else(|| Error::InvalidAddress(format!("framesource channel {chn}")))?;
        if slot.is_some() {
            return Err(Error::AlreadyExists(format!("framesource channel {chn}")));
        }
        *slot = Some(FsChannel {
            attr,
            enabling: false,
            streaming: None,
        });
        info!(
            channel = chn,
            width = attr.width,
            height = attr.height,
            format = %attr.pixel_format,
            "Frame source channel created."
        );
        Ok(())
    }

    /// Disables channel `chn` if needed and forgets it.
    ///
    /// The channel's module stays registered so existing bindings survive a
    /// re-create.
    pub fn destroy_channel(&self, chn: usize) -> Result<()> {
        let mut channels = self.channels.lock();
        let slot = channels
            .get_mut(chn)
            .ok_or_else(|| Error::InvalidAddress(format!("framesource channel {chn}")))?;
        if slot.as_ref().is_some_and(|channel| channel.enabling) {
            return Err(Error::InvalidArg(format!(
                "framesource channel {chn} is being enabled"
            )));
        }
        let mut channel = slot
            .take()
            .ok_or_else(|| Error::NotFound(format!("framesource channel {chn}")))?;
        drop(channels);
        let result = match channel.streaming.take() {
            Some(streaming) => self.stop_streaming(chn, streaming),
            None => Ok(()),
        };
        info!(channel = chn, "Frame source channel destroyed.");
        result
    }

    /// Replaces the attributes of a created, disabled channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArg`] while the channel is enabled.
    pub fn set_attr(&self, chn: usize, attr: FsChannelAttr) -> Result<()> {
        attr.validate()?;
        self.with_channel(chn, |channel| {
            if channel.streaming.is_some() || channel.enabling {
                return Err(Error::InvalidArg(format!(
                    "framesource channel {chn} is enabled"
                )));
            }
            channel.attr = attr;
            Ok(())
        })
    }

    pub fn attr(&self, chn: usize) -> Result<FsChannelAttr> {
        self.with_channel(chn, |channel| Ok(channel.attr))
    }

    pub fn is_enabled(&self, chn: usize) -> Result<bool> {
        self.with_channel(chn, |channel| Ok(channel.streaming.is_some()))
    }

    /// Opens the channel's device, sizes its pool from the buffers the driver
    /// grants and starts streaming. Enabling an enabled channel does nothing.
    ///
    /// On success the channel's module is registered at `(FrameSource, chn)`,
    /// or adopted if one is already there. The device is opened and
    /// negotiated without holding the channel table, so other channels stay
    /// usable while a slow device node comes up.
    ///
    /// # Errors
    ///
    /// - [`Error::Device`] if the device cannot be opened or a driver request fails
    /// - [`Error::InvalidArg`] if another enable of `chn` is in progress
    /// - any pool creation error
    ///
    /// A failed enable leaves no pool behind.
    pub fn enable(&self, chn: usize, opener: &dyn DeviceOpener) -> Result<()> {
        let attr = self.with_channel(chn, |channel| {
            if channel.streaming.is_some() {
                return Ok(None);
            }
            if channel.enabling {
                return Err(Error::InvalidArg(format!(
                    "framesource channel {chn} is being enabled"
                )));
            }
            channel.enabling = true;
            Ok(Some(channel.attr))
        })?;
        let Some(attr) = attr else {
            return Ok(());
        };

        let started = self.start_streaming(chn, &attr, opener);
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get_mut(chn).and_then(Option::as_mut) {
            channel.enabling = false;
            channel.streaming = Some(started?);
            return Ok(());
        }
        drop(channels);
        if let Ok(streaming) = started
            && let Err(e) = self.stop_streaming(chn, streaming)
        {
            warn!(channel = chn, error = %e, "Failed to stop orphaned stream.");
        }
        Err(Error::NotFound(format!("framesource channel {chn}")))
    }

    fn start_streaming(
        &self,
        chn: usize,
        attr: &FsChannelAttr,
        opener: &dyn DeviceOpener,
    ) -> Result<Streaming> {
        let mut device = open_with_retry(opener, chn, self.system.config())?;
        let current = device.get_format()?;
        debug!(
            channel = chn,
            width = current.width,
            height = current.height,
            "Current device format."
        );
        device.set_format(&attr.device_format())?;

        let request = imp_sys::FsBufCount::capture(attr.frame_count as i32);
        let granted = device.set_buffer_count(request)?;
        let granted = usize::try_from(granted)
            .ok()
            .filter(|&count| count > 0)
            .ok_or_else(|| {
                Error::Other(format!("Driver granted {granted} buffers on channel {chn}."))
            })?;
        if granted != attr.frame_count {
            info!(
                channel = chn,
                requested = attr.frame_count,
                granted,
                "Driver adjusted buffer count."
            );
        }
        if attr.depth > 0 {
            device.set_depth(attr.depth as i32)?;
        }

        let pools = self.system.pools();
        pools.create_pool(chn, &attr.pool_format(granted), None)?;
        let module = device.stream_on().and_then(|()| {
            self.system
                .registry()
                .ensure(DeviceKind::FRAME_SOURCE, chn, MODULE_NAME, None)
                .inspect_err(|_| {
                    if let Err(e) = device.stream_off() {
                        warn!(channel = chn, error = %e, "Stream off failed during rollback.");
                    }
                })
        });
        let module = match module {
            Ok(module) => module,
            Err(e) => {
                if let Err(e) = pools.destroy_pool(chn) {
                    warn!(channel = chn, error = %e, "Pool cleanup failed during rollback.");
                }
                return Err(e);
            }
        };
        info!(channel = chn, frames = granted, "Frame source channel enabled.");
        Ok(Streaming { device, module })
    }

    /// Stops streaming, reclaims every frame and frees the channel's pool.
    /// Disabling a disabled channel does nothing.
    pub fn disable(&self, chn: usize) -> Result<()> {
        let streaming = self.with_channel(chn, |channel| Ok(channel.streaming.take()))?;
        match streaming {
            Some(streaming) => self.stop_streaming(chn, streaming),
            None => Ok(()),
        }
    }

    /// Pushes one frame from channel `chn` to every bound consumer.
    ///
    /// Takes the oldest free frame, stamps it with the system clock, notifies
    /// the channel's observers on the calling thread and releases it. Returns
    /// the number of consumers that took the frame.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArg`] if the channel is not enabled
    /// - [`Error::Timeout`] if no frame became free within `wait`
    pub fn deliver(&self, chn: usize, wait: impl Into<WaitMode>) -> Result<usize> {
        let module = self.with_channel(chn, |channel| {
            channel
                .streaming
                .as_ref()
                .map(|streaming| streaming.module.clone())
                .ok_or_else(|| {
                    Error::InvalidArg(format!("framesource channel {chn} is not enabled"))
                })
        })?;
        let frame = self.system.pools().acquire_frame(chn, wait.into())?;
        frame.set_timestamp(self.system.timestamp_us());
        let delivered = module.notify(&frame.info());
        debug!(channel = chn, index = frame.index(), delivered, "Frame delivered.");
        frame.release()?;
        Ok(delivered)
    }

    fn with_channel<T>(
        &self,
        chn: usize,
        f: impl FnOnce(&mut FsChannel) -> Result<T>,
    ) -> Result<T> {
        let mut channels = self.channels.lock();
        let channel = channels
            .get_mut(chn)
            .ok_or_else(|| Error::InvalidAddress(format!("framesource channel {chn}")))?
            .as_mut()
            .ok_or_else(|| Error::NotFound(format!("framesource channel {chn}")))?;
        f(channel)
    }

    fn stop_streaming(&self, chn: usize, mut streaming: Streaming) -> Result<()> {
        let stream_off = streaming.device.stream_off();
        let pools = self.system.pools();
        let flushed = pools.flush(chn).map(|_| ());
        let destroyed = pools.destroy_pool(chn);
        info!(channel = chn, "Frame source channel disabled.");
        stream_off.and(flushed).and(destroyed)
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        let streaming: Vec<(usize, Streaming)> = self
            .channels
            .get_mut()
            .iter_mut()
            .enumerate()
            .filter_map(|(chn, slot)| Some((chn, slot.as_mut()?.streaming.take()?)))
            .collect();
        for (chn, streaming) in streaming {
            if let Err(e) = self.stop_streaming(chn, streaming) {
                error!(channel = chn, error = %e, "Failed to disable frame source channel.");
            }
        }
    }
}
