// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Frame source to motion channel, on heap memory and a simulated capture
//! device.
//!
//! ```text
//! cargo run --example motion_pipeline -- --frames 50 --fps 30
//! ```

mod common;

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use clap::Parser;
use imp::{
    ChannelTable, DeviceOpener, Error, FrameChannelDevice, FrameSource, FsChannelAttr, ImpSystem,
    MotionHandler, MotionOutput, MotionParams, PixelFormat, WaitMode,
};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(version, about = "Feeds simulated capture frames to a motion channel", long_about = None)]
struct Args {
    /// Frame width in pixels
    #[arg(long, default_value_t = 1920)]
    width: u32,

    /// Frame height in pixels
    #[arg(long, default_value_t = 1080)]
    height: u32,

    /// Capture buffers to request from the device
    #[arg(short, long, default_value_t = 4)]
    buffers: usize,

    /// Frames to deliver before shutting down
    #[arg(short, long, default_value_t = 100)]
    frames: usize,

    /// Delivery rate
    #[arg(long, default_value_t = 25, value_parser = clap::value_parser!(u32).range(1..=120))]
    fps: u32,

    /// Frames the motion detector skips between analyses
    #[arg(long, default_value_t = 0)]
    skip: u32,

    /// SoC id reported in the startup banner
    #[arg(long, default_value_t = 6)]
    cpu_id: u32,

    /// Runtime configuration file (JSON); falls back to `IMP_CONFIG`
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

/// Capture device that accepts any format and grants what is asked for.
#[derive(Default)]
struct SimulatedDevice {
    format: imp_sys::FsFormat,
}

impl FrameChannelDevice for SimulatedDevice {
    fn get_format(&mut self) -> imp::Result<imp_sys::FsFormat> {
        Ok(self.format)
    }

    fn set_format(&mut self, format: &imp_sys::FsFormat) -> imp::Result<()> {
        self.format = *format;
        Ok(())
    }

    fn set_buffer_count(&mut self, request: imp_sys::FsBufCount) -> imp::Result<i32> {
        Ok(request.count)
    }

    fn set_depth(&mut self, depth: i32) -> imp::Result<()> {
        debug!(depth, "Simulated depth set.");
        Ok(())
    }

    fn stream_on(&mut self) -> imp::Result<()> {
        info!(width = self.format.width, height = self.format.height, "Simulated stream on.");
        Ok(())
    }

    fn stream_off(&mut self) -> imp::Result<()> {
        info!("Simulated stream off.");
        Ok(())
    }
}

struct SimulatedOpener;

impl DeviceOpener for SimulatedOpener {
    fn open(&self, path: &Path) -> io::Result<Box<dyn FrameChannelDevice>> {
        info!(path = %path.display(), "Opening simulated device.");
        Ok(Box::new(SimulatedDevice::default()))
    }
}

fn consume(channels: &ChannelTable<MotionOutput>, expected: usize) -> imp::Result<usize> {
    let mut results = 0;
    while results < expected {
        match channels.poll_result(0, 1000) {
            Ok(()) => {}
            Err(e) if e.is_timeout() => break,
            Err(e) => return Err(e),
        }
        let result = channels.get_result(0)?;
        debug!(
            timestamp_us = result.timestamp_us,
            motion = result.any_motion(),
            "Motion result."
        );
        channels.release_result(0, result)?;
        results += 1;
    }
    Ok(results)
}

fn main() -> Result<(), Error> {
    common::setup_logging();
    let args = Args::parse();

    let config = common::load_config(args.config.as_deref())?;
    let system = ImpSystem::with_heap_allocator(config)?;
    info!(
        version = %ImpSystem::version(),
        soc = ImpSystem::cpu_info(args.cpu_id),
        "Runtime up."
    );

    let channels = Arc::new(ChannelTable::<MotionOutput>::new(&system));
    let params = MotionParams {
        skip_frame_count: args.skip,
        ..MotionParams::full_frame(args.width, args.height)
    };
    channels.create(0, MotionHandler::new(params))?;
    channels.register(0, 0)?;
    channels.start(0)?;

    let source = FrameSource::new(&system);
    source.create_channel(
        0,
        FsChannelAttr::new(args.width, args.height, PixelFormat::NV12, args.buffers),
    )?;
    source.enable(0, &SimulatedOpener)?;
    info!(pool = ?system.pools().pool_info(0)?, "Capture pool ready.");

    let consumer = {
        let channels = channels.clone();
        let expected = args.frames;
        thread::spawn(move || consume(&channels, expected))
    };

    let interval = Duration::from_secs(1) / args.fps;
    for _ in 0..args.frames {
        source.deliver(0, WaitMode::Forever)?;
        thread::sleep(interval);
    }

    let results = consumer
        .join()
        .map_err(|_| Error::Other("Consumer thread panicked.".to_string()))??;
    info!(delivered = args.frames, results, "Pipeline finished.");

    source.disable(0)?;
    source.destroy_channel(0)?;
    channels.destroy(0)?;
    drop(source);
    drop(channels);
    system.destroy()
}
