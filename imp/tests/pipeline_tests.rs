// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Pipeline integration tests for the IMP runtime.
//!
//! These tests drive the public API the way an application does: modules are
//! registered and bound through the registry, frames come from heap-backed
//! pools, and analysis channels are polled for results. Every test builds its
//! own [`ImpSystem`], so tests are isolated from each other.
//!
//! # Test Coverage
//!
//! - Registry placement and binding validation
//! - Pool geometry and FIFO frame acquisition
//! - Channel result polling and lifecycle under load
//! - Frame source to motion channel, end to end, on a scripted device

use std::{
    io,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use imp::{
    Cell, ChannelTable, DeviceKind, DeviceOpener, Error, FrameChannelDevice, FrameInfo,
    FrameSource, FsChannelAttr, HeapAllocator, ImpSystem, Module, ModuleOps, ModuleRegistry,
    MotionHandler, MotionOutput, MotionParams, PixelFormat, PoolFormat, PoolManager, WaitMode,
    config::RuntimeConfig,
};
use proptest::prelude::*;
use tracing::info;

/// Ensures logging is initialized only once across all tests.
static LOG_ONCE: std::sync::Once = std::sync::Once::new();

/// Initializes logging (respects `RUST_LOG`) and builds a fresh runtime.
fn setup_test() -> ImpSystem {
    LOG_ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .init();
    });

    ImpSystem::with_heap_allocator(RuntimeConfig::default()).unwrap()
}

fn heap_pools() -> PoolManager {
    PoolManager::new(Arc::new(HeapAllocator::new(16)), 6)
}

/// A frame of the geometry the motion handlers in these tests expect.
fn vga_frame(index: usize) -> FrameInfo {
    FrameInfo {
        index,
        width: 640,
        height: 360,
        pixel_format: PixelFormat::NV12,
        ..FrameInfo::default()
    }
}

/// Frame-channel device that accepts every request and tracks streaming.
struct LoopbackDevice {
    streaming: Arc<AtomicBool>,
}

impl FrameChannelDevice for LoopbackDevice {
    fn get_format(&mut self) -> imp::Result<imp_sys::FsFormat> {
        Ok(imp_sys::FsFormat::default())
    }

    fn set_format(&mut self, _format: &imp_sys::FsFormat) -> imp::Result<()> {
        Ok(())
    }

    fn set_buffer_count(&mut self, request: imp_sys::FsBufCount) -> imp::Result<i32> {
        Ok(request.count)
    }

    fn set_depth(&mut self, _depth: i32) -> imp::Result<()> {
        Ok(())
    }

    fn stream_on(&mut self) -> imp::Result<()> {
        self.streaming.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stream_off(&mut self) -> imp::Result<()> {
        self.streaming.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn loopback_opener(streaming: Arc<AtomicBool>) -> impl DeviceOpener {
    move |_: &Path| -> io::Result<Box<dyn FrameChannelDevice>> {
        Ok(Box::new(LoopbackDevice {
            streaming: streaming.clone(),
        }))
    }
}

proptest! {
    /// Whatever is registered at a slot is what lookup returns, and
    /// unregistering empties the slot again.
    #[test]
    fn registry_round_trip(device in 0usize..6, group in 0usize..6) {
        let registry = ModuleRegistry::new(16);
        let kind = DeviceKind::new(device).unwrap();
        let module = registry.allocate("stage", None);
        registry.register(kind, group, &module).unwrap();

        let found = registry.lookup(kind, group).unwrap();
        prop_assert!(Arc::ptr_eq(&found, &module));
        prop_assert_eq!(module.device(), Some(kind));
        prop_assert_eq!(module.group(), Some(group));
        prop_assert_eq!(module.output_count(), 1);

        let removed = registry.unregister(kind, group).unwrap();
        prop_assert!(Arc::ptr_eq(&removed, &module));
        prop_assert!(registry.lookup(kind, group).is_none());
    }

    /// Binding from an output the source does not have fails and leaves no edge.
    #[test]
    fn bind_rejects_missing_outputs(outputs in 1usize..4, extra in 0usize..8) {
        let registry = ModuleRegistry::new(16);
        let src = registry
            .ensure(DeviceKind::FRAME_SOURCE, 0, "framesource", None)
            .unwrap();
        let dst = registry.ensure(DeviceKind::ENCODER, 0, "encoder", None).unwrap();
        src.set_output_count(outputs);

        let result = registry.bind(
            Cell::new(DeviceKind::FRAME_SOURCE, 0, outputs + extra),
            Cell::new(DeviceKind::ENCODER, 0, 0),
        );
        let rejected = matches!(result, Err(Error::InvalidOutput { .. }));
        prop_assert!(rejected);
        prop_assert_eq!(src.observer_count(), 0);
        prop_assert!(!src.is_bound_to(&dst));
    }

    /// Frame `i` starts exactly `i` frame sizes past the pool base.
    #[test]
    fn frames_are_evenly_strided(
        width in 1u32..512,
        height in 1u32..512,
        frame_count in 1usize..6,
    ) {
        let pools = heap_pools();
        let format = PoolFormat::new(width, height, PixelFormat::NV12, frame_count);
        let info = pools.create_pool(2, &format, None).unwrap();
        prop_assert_eq!(info.total_size, frame_count * info.frame_size);

        let frames: Vec<_> = (0..frame_count)
            .map(|_| pools.acquire_frame(2, WaitMode::NoWait).unwrap())
            .collect();
        for (i, frame) in frames.iter().enumerate() {
            prop_assert_eq!(frame.index(), i);
            prop_assert_eq!(frame.phys_addr(), info.phys_base + (i * info.frame_size) as u64);
            prop_assert_eq!(frame.virt_addr(), info.virt_base + i * info.frame_size);
            prop_assert_eq!(frame.size(), info.frame_size);
        }
        drop(frames);
        pools.destroy_pool(2).unwrap();
    }
}

/// Counts the frames an overlay stage receives.
#[derive(Default)]
struct Overlay {
    updates: AtomicUsize,
}

impl ModuleOps for Overlay {
    fn update(&self, _module: &Arc<Module>, _frame: &FrameInfo) -> imp::Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Binding, notifying and unbinding two stages through the system object.
#[test]
fn bind_notify_unbind() {
    let system = setup_test();
    let registry = system.registry();
    let overlay = Arc::new(Overlay::default());
    let src = registry
        .ensure(DeviceKind::FRAME_SOURCE, 1, "framesource", None)
        .unwrap();
    let dst = registry
        .ensure(DeviceKind::OSD, 1, "osd", Some(overlay.clone()))
        .unwrap();
    let src_cell = Cell::new(DeviceKind::FRAME_SOURCE, 1, 0);
    let dst_cell = Cell::new(DeviceKind::OSD, 1, 0);

    system.bind(src_cell, dst_cell).unwrap();
    assert!(src.is_bound_to(&dst));

    assert_eq!(src.notify(&vga_frame(3)), 1);
    assert_eq!(overlay.updates.load(Ordering::SeqCst), 1);
    assert_eq!(src.last_delivered(&dst).map(|frame| frame.index), Some(3));

    system.unbind(src_cell, dst_cell).unwrap();
    assert!(!src.is_bound_to(&dst));
    assert_eq!(src.notify(&vga_frame(4)), 0);
    assert_eq!(overlay.updates.load(Ordering::SeqCst), 1);
    assert!(matches!(
        system.unbind(src_cell, dst_cell),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        system.bind(src_cell, Cell::new(DeviceKind::ENCODER, 1, 0)),
        Err(Error::NotFound(_))
    ));
}

/// 1920x1080 NV12 with four frames: rows and columns round up to 16.
#[test]
fn nv12_1080p_pool_geometry() {
    let system = setup_test();
    let format = PoolFormat::new(1920, 1080, PixelFormat::NV12, 4);
    let info = system.pools().create_pool(0, &format, None).unwrap();
    info!(?info, "1080p pool.");
    assert_eq!(info.name, "vbm_chn0");
    assert_eq!(info.frame_size, 3_133_440);
    assert_eq!(info.total_size, 12_533_760);
    assert_eq!(system.pools().free_frames(0).unwrap(), 4);
}

/// Frames come back out of the pool in the order they were released.
#[test]
fn acquire_is_fifo() {
    let pools = heap_pools();
    pools
        .create_pool(1, &PoolFormat::new(320, 240, PixelFormat::YUYV, 3), None)
        .unwrap();

    let a = pools.acquire_frame(1, WaitMode::NoWait).unwrap();
    let b = pools.acquire_frame(1, WaitMode::NoWait).unwrap();
    let c = pools.acquire_frame(1, WaitMode::NoWait).unwrap();
    assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
    assert!(matches!(
        pools.acquire_frame(1, WaitMode::NoWait),
        Err(Error::Timeout)
    ));
    assert!(matches!(
        pools.acquire_frame(1, WaitMode::Timeout(Duration::from_millis(20))),
        Err(Error::Timeout)
    ));

    pools.release_frame(1, b).unwrap();
    pools.release_frame(1, a).unwrap();
    assert_eq!(pools.acquire_frame(1, WaitMode::NoWait).unwrap().index(), 1);
    // The handle above was dropped, so slot 1 is queued behind slot 0.
    assert_eq!(pools.acquire_frame(1, WaitMode::NoWait).unwrap().index(), 0);
    drop(c);
}

/// A blocked acquire wakes up when another thread releases a frame.
#[test]
fn forever_acquire_wakes_on_release() {
    let pools = Arc::new(heap_pools());
    pools
        .create_pool(0, &PoolFormat::new(64, 64, PixelFormat::NV12, 1), None)
        .unwrap();
    let held = pools.acquire_frame(0, WaitMode::NoWait).unwrap();

    let waiter = {
        let pools = pools.clone();
        thread::spawn(move || pools.acquire_frame(0, WaitMode::Forever).map(|frame| frame.index()))
    };
    thread::sleep(Duration::from_millis(20));
    held.release().unwrap();
    assert_eq!(waiter.join().unwrap().unwrap(), 0);
}

/// Polling reports a timeout until a frame has actually been processed.
#[test]
fn poll_times_out_until_a_frame_is_processed() {
    let system = setup_test();
    let channels: ChannelTable<MotionOutput> = ChannelTable::new(&system);
    channels
        .create(0, MotionHandler::new(MotionParams::full_frame(640, 360)))
        .unwrap();
    channels.register(0, 0).unwrap();
    channels.start(0).unwrap();

    assert!(matches!(channels.poll_result(0, 0), Err(Error::Timeout)));
    assert!(matches!(
        channels.poll_result(0, Duration::from_millis(20)),
        Err(Error::Timeout)
    ));

    let producer = system
        .registry()
        .lookup(DeviceKind::FRAME_SOURCE, 0)
        .unwrap();
    let frame = FrameInfo {
        timestamp_us: 7_000,
        ..vga_frame(0)
    };
    assert_eq!(producer.notify(&frame), 1);

    channels.poll_result(0, 0).unwrap();
    let result = channels.get_result(0).unwrap();
    assert_eq!(result.timestamp_us, 7_000);
    assert!(!result.any_motion());
    channels.release_result(0, result).unwrap();
    assert!(matches!(channels.poll_result(0, 0), Err(Error::Timeout)));
}

/// Frames reaching a stopped channel are ignored.
#[test]
fn stopped_channels_do_not_produce_results() {
    let system = setup_test();
    let channels: ChannelTable<MotionOutput> = ChannelTable::new(&system);
    channels
        .create(4, MotionHandler::new(MotionParams::full_frame(640, 360)))
        .unwrap();
    channels.register(1, 4).unwrap();

    let producer = system
        .registry()
        .lookup(DeviceKind::FRAME_SOURCE, 1)
        .unwrap();
    producer.notify(&vga_frame(0));
    assert_eq!(channels.pending_results(4).unwrap(), 0);

    channels.start(4).unwrap();
    producer.notify(&vga_frame(1));
    channels.stop(4).unwrap();
    producer.notify(&vga_frame(2));
    assert_eq!(channels.pending_results(4).unwrap(), 1);
}

/// Registering creates the group and its producer binding exactly once.
#[test]
fn register_auto_creates_group() {
    let system = setup_test();
    let channels: ChannelTable<MotionOutput> = ChannelTable::new(&system);
    for channel in [3, 5] {
        channels
            .create(channel, MotionHandler::new(MotionParams::full_frame(640, 360)))
            .unwrap();
    }
    assert!(channels.group_module(1).is_none());

    channels.register(1, 3).unwrap();
    channels.register(1, 5).unwrap();
    channels.register(1, 3).unwrap();

    let group = channels.group_module(1).unwrap();
    let registered = system.registry().lookup(DeviceKind::IVS, 1).unwrap();
    assert!(Arc::ptr_eq(&group, &registered));
    let producer = system
        .registry()
        .lookup(DeviceKind::FRAME_SOURCE, 1)
        .unwrap();
    assert!(producer.is_bound_to(&group));
    assert_eq!(producer.observer_count(), 1);

    assert!(matches!(
        channels.register(0, 3),
        Err(Error::AlreadyExists(_))
    ));
    assert_eq!(channels.group_of(3).unwrap(), Some(1));

    channels.unregister(3).unwrap();
    assert!(matches!(channels.unregister(3), Err(Error::NotFound(_))));
    channels.register(0, 3).unwrap();
    assert_eq!(channels.group_of(3).unwrap(), Some(0));
}

/// Channels can come and go while a producer keeps delivering frames.
#[test]
fn create_destroy_cycles_under_load() {
    let system = setup_test();
    let channels: ChannelTable<MotionOutput> = ChannelTable::new(&system);
    channels.create_group(0).unwrap();
    let producer = system
        .registry()
        .ensure(DeviceKind::FRAME_SOURCE, 0, "framesource", None)
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let feeder = {
        let stop = stop.clone();
        thread::spawn(move || {
            let mut index = 0;
            while !stop.load(Ordering::Relaxed) {
                producer.notify(&vga_frame(index % 4));
                index += 1;
                thread::sleep(Duration::from_micros(200));
            }
            index
        })
    };

    for round in 0..20 {
        channels
            .create(1, MotionHandler::new(MotionParams::full_frame(640, 360)))
            .unwrap();
        channels.register(0, 1).unwrap();
        channels.start(1).unwrap();
        thread::sleep(Duration::from_millis(2));
        channels.destroy(1).unwrap();
        assert!(
            matches!(channels.poll_result(1, 0), Err(Error::NotFound(_))),
            "round {round}"
        );
    }

    stop.store(true, Ordering::Relaxed);
    let delivered = feeder.join().unwrap();
    info!(delivered, "Frames delivered during create/destroy cycles.");
}

/// A frame source feeds a motion channel through the bound analysis group.
#[test]
fn frame_source_to_motion_channel() {
    let system = setup_test();
    let channels: ChannelTable<MotionOutput> = ChannelTable::new(&system);
    channels
        .create(0, MotionHandler::new(MotionParams::full_frame(640, 360)))
        .unwrap();
    channels.register(0, 0).unwrap();
    channels.start(0).unwrap();

    let streaming = Arc::new(AtomicBool::new(false));
    let source = FrameSource::new(&system);
    source
        .create_channel(0, FsChannelAttr::new(640, 360, PixelFormat::NV12, 3))
        .unwrap();
    source
        .enable(0, &loopback_opener(streaming.clone()))
        .unwrap();
    assert!(streaming.load(Ordering::SeqCst));

    system.rebase_timestamp(1_000_000);
    for _ in 0..5 {
        assert_eq!(source.deliver(0, WaitMode::Forever).unwrap(), 1);
    }
    assert_eq!(channels.pending_results(0).unwrap(), 5);
    for _ in 0..5 {
        channels.poll_result(0, 100).unwrap();
    }
    let result = channels.get_result(0).unwrap();
    assert!(result.timestamp_us >= 1_000_000);
    channels.release_result(0, result).unwrap();
    assert_eq!(system.pools().free_frames(0).unwrap(), 3);

    source.disable(0).unwrap();
    assert!(!streaming.load(Ordering::SeqCst));
    source.destroy_channel(0).unwrap();
    channels.destroy(0).unwrap();

    drop(source);
    drop(channels);
    system.destroy().unwrap();
}
