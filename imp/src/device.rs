// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Frame-channel device contract.
//!
//! The runtime never issues driver requests itself. A board support layer
//! implements [`FrameChannelDevice`] on top of its driver and hands the
//! runtime a [`DeviceOpener`]; tests and demos use in-memory devices.

use std::{
    io,
    path::{Path, PathBuf},
    thread,
};

use tracing::{debug, warn};

use crate::{Error, Result, config::RuntimeConfig};

/// One opened frame-channel device node.
pub trait FrameChannelDevice: Send {
    /// Reads the format currently configured in the driver.
    fn get_format(&mut self) -> Result<imp_sys::FsFormat>;

    fn set_format(&mut self, format: &imp_sys::FsFormat) -> Result<()>;

    /// Requests buffers and returns how many the driver granted.
    fn set_buffer_count(&mut self, request: imp_sys::FsBufCount) -> Result<i32>;

    /// Sets how many frames the driver may queue ahead of the consumer.
    fn set_depth(&mut self, depth: i32) -> Result<()>;

    fn stream_on(&mut self) -> Result<()>;

    fn stream_off(&mut self) -> Result<()>;
}

/// Opens frame-channel device nodes.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn FrameChannelDevice>>;
}

impl<F> DeviceOpener for F
where
    F: Fn(&Path) -> io::Result<Box<dyn FrameChannelDevice>> + Send + Sync,
{
    fn open(&self, path: &Path) -> io::Result<Box<dyn FrameChannelDevice>> {
        self(path)
    }
}

/// Device node of frame channel `channel`.
pub fn framechan_path(channel: usize) -> PathBuf {
    PathBuf::from(format!("{}{channel}", imp_sys::FRAMECHAN_DEVICE_PREFIX))
}

/// Opens frame channel `channel`, retrying while the driver is not ready.
///
/// Makes up to `config.device_open_attempts` attempts spaced by
/// `config.device_open_interval_ms`.
///
/// # Errors
///
/// Returns [`Error::Device`] with the last failure once every attempt failed.
pub fn open_with_retry(
    opener: &dyn DeviceOpener,
    channel: usize,
    config: &RuntimeConfig,
) -> Result<Box<dyn FrameChannelDevice>> {
    let path = framechan_path(channel);
    let attempts = config.device_open_attempts.max(1);
    let mut attempt = 1;
    loop {
        match opener.open(&path) {
            Ok(device) => {
                debug!(path = %path.display(), attempt, "Device opened.");
                return Ok(device);
            }
            Err(e) if attempt >= attempts => {
                warn!(path = %path.display(), attempts, error = %e, "Giving up opening device.");
                return Err(Error::Device(e));
            }
            Err(e) => {
                debug!(path = %path.display(), attempt, error = %e, "Device not ready.");
                attempt += 1;
                thread::sleep(config.device_open_interval());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct NullDevice;

    impl FrameChannelDevice for NullDevice {
        fn get_format(&mut self) -> Result<imp_sys::FsFormat> {
            Ok(imp_sys::FsFormat::default())
        }
        fn set_format(&mut self, _format: &imp_sys::FsFormat) -> Result<()> {
            Ok(())
        }
        fn set_buffer_count(&mut self, request: imp_sys::FsBufCount) -> Result<i32> {
            Ok(request.count)
        }
        fn set_depth(&mut self, _depth: i32) -> Result<()> {
            Ok(())
        }
        fn stream_on(&mut self) -> Result<()> {
            Ok(())
        }
        fn stream_off(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn fast_config(attempts: u32) -> RuntimeConfig {
        RuntimeConfig {
            device_open_attempts: attempts,
            device_open_interval_ms: 1,
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn node_names() {
        assert_eq!(framechan_path(2), PathBuf::from("/dev/framechan2"));
    }

    #[test]
    fn succeeds_once_driver_is_ready() {
        let calls = AtomicU32::new(0);
        let opener = |path: &Path| -> io::Result<Box<dyn FrameChannelDevice>> {
            assert_eq!(path, Path::new("/dev/framechan1"));
            if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(io::Error::from(io::ErrorKind::NotFound))
            } else {
                Ok(Box::new(NullDevice))
            }
        };
        open_with_retry(&opener, 1, &fast_config(10)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn gives_up_after_configured_attempts() {
        let calls = AtomicU32::new(0);
        let opener = |_: &Path| -> io::Result<Box<dyn FrameChannelDevice>> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::from_raw_os_error(19))
        };
        let err = open_with_retry(&opener, 0, &fast_config(5)).err().unwrap();
        assert!(matches!(err, Error::Device(ref io) if io.raw_os_error() == Some(19)));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
