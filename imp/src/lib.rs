// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! # IMP - Ingenic Media Platform runtime
//!
//! A user-space media-pipeline runtime for camera SoCs: pipeline stages are
//! modules placed in a fixed grid, producers push frames from hardware buffer
//! pools to the modules bound to them, and analysis channels turn frames into
//! results a consumer can poll for.
//!
//! The kernel/hardware ABI lives in [`imp_sys`]. This crate builds the safe
//! runtime on top of it with RAII handles and explicit error returns.
//!
//! ### Key Concepts
//!
//! - **Module**: an addressable pipeline stage ([`Module`]) registered at a
//!   `(device, group)` slot of the [`ModuleRegistry`]
//! - **Cell**: an address `(device, group, output)` naming one output port ([`Cell`])
//! - **Binding**: an edge from a producer's output to a consumer, created with
//!   [`ModuleRegistry::bind`] and torn down with [`ModuleRegistry::unbind`]
//! - **Pool**: a fixed set of equally strided frame buffers per channel ([`PoolManager`])
//! - **Channel**: an analysis unit with its own run state and result queue ([`ChannelTable`])
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐
//! │ ImpSystem │  (registry + pools + clock)
//! └─────┬─────┘
//!       │
//!       ├─► FrameSource[chn] ──► PoolManager (vbm_chn{chn})
//!       │          │
//!       │          └─bind─► IVS[g] ──► ChannelTable ──► poll / get / release
//!       │
//!       └─► ModuleRegistry (6 device kinds × 6 groups)
//! ```
//!
//! ## Examples
//!
//! ### Binding two stages and delivering a frame
//!
//! ```
//! use imp::{Cell, DeviceKind, FrameInfo, ImpSystem, config::RuntimeConfig};
//!
//! # fn main() -> Result<(), imp::Error> {
//! let system = ImpSystem::with_heap_allocator(RuntimeConfig::default())?;
//! let registry = system.registry();
//! let source = registry.ensure(DeviceKind::FRAME_SOURCE, 0, "framesource", None)?;
//! let encoder = registry.ensure(DeviceKind::ENCODER, 0, "encoder", None)?;
//!
//! system.bind(
//!     Cell::new(DeviceKind::FRAME_SOURCE, 0, 0),
//!     Cell::new(DeviceKind::ENCODER, 0, 0),
//! )?;
//! assert!(source.is_bound_to(&encoder));
//!
//! source.notify(&FrameInfo::default());
//! assert!(source.last_delivered(&encoder).is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ### Polling an analysis channel
//!
//! ```
//! use imp::{ChannelTable, ImpSystem, MotionHandler, MotionParams, WaitMode};
//! use imp::config::RuntimeConfig;
//!
//! # fn main() -> Result<(), imp::Error> {
//! let system = ImpSystem::with_heap_allocator(RuntimeConfig::default())?;
//! let channels = ChannelTable::new(&system);
//! channels.create(0, MotionHandler::new(MotionParams::full_frame(640, 360)))?;
//! channels.register(0, 0)?;
//! channels.start(0)?;
//!
//! // Nothing has been processed yet.
//! assert!(channels.poll_result(0, WaitMode::NoWait).unwrap_err().is_timeout());
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - [`ImpSystem`], [`ModuleRegistry`], [`PoolManager`], [`FrameSource`] and
//!   [`ChannelTable`] are `Send + Sync`
//! - Observer callbacks and channel processing run on the producer's thread
//! - [`Frame`] handles may move between threads and release their slot on drop
//!
//! ## Configuration
//!
//! Runtime limits come from [`config::RuntimeConfig`], which can be loaded
//! from JSON (see [`config::CONFIG_ENV_VAR`]).

mod channel;
mod device;
mod error;
mod framesource;
mod pool;
mod registry;
mod system;
mod wait;

pub mod config;
pub mod module;

pub use channel::{
    ChannelTable,
    handler::ChannelHandler,
    motion::{MotionHandler, MotionOutput, MotionParams, Rect},
};
pub use device::{DeviceOpener, FrameChannelDevice, framechan_path, open_with_retry};
pub use error::{Error, Result};
pub use framesource::{FS_MAX_CHANNELS, FrameSource, FsChannelAttr};
pub use module::{Cell, DeviceKind, Module, ModuleId, ModuleOps, OutputContext};
pub use pool::{
    PoolHooks, PoolInfo, PoolManager,
    allocator::{DeviceAllocator, DmaRegion, HeapAllocator},
    format::{PixelFormat, PoolFormat},
    frame::{Frame, FrameInfo},
    pool_name,
};
pub use registry::ModuleRegistry;
pub use system::ImpSystem;
pub use wait::WaitMode;
