// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! The runtime object that owns the registry and the pools.
//!
//! [`ImpSystem`] replaces process-wide initialization: every stage is built
//! from a system handle and keeps it alive, and the system can be torn down
//! explicitly once they are gone.

use std::{sync::Arc, time::Instant};

use parking_lot::Mutex;
use tracing::info;

use crate::{
    Cell, DeviceAllocator, Error, HeapAllocator, ModuleRegistry, PoolManager, Result,
    config::RuntimeConfig,
};

/// Monotonic microsecond clock with an adjustable origin.
pub(crate) struct Clock {
    /// Instant at which the clock read `.1` microseconds.
    base: Mutex<(Instant, u64)>,
}

impl Clock {
    fn new() -> Self {
        Self {
            base: Mutex::new((Instant::now(), 0)),
        }
    }

    pub(crate) fn now_us(&self) -> u64 {
        let (at, value) = *self.base.lock();
        let elapsed = u64::try_from(at.elapsed().as_micros()).unwrap_or(u64::MAX);
        value.saturating_add(elapsed)
    }

    fn rebase(&self, timestamp_us: u64) {
        *self.base.lock() = (Instant::now(), timestamp_us);
    }
}

/// State shared by every handle derived from one [`ImpSystem`].
pub(crate) struct SystemContext {
    pub(crate) config: RuntimeConfig,
    pub(crate) registry: ModuleRegistry,
    pub(crate) pools: PoolManager,
    pub(crate) clock: Clock,
}

impl SystemContext {
    fn destroy(self) -> Result<()> {
        self.pools.destroy_all()?;
        self.registry.clear();
        info!("IMP system destroyed.");
        Ok(())
    }
}

/// Handle to an initialized runtime.
///
/// The handle is cheap to clone and `Send + Sync`. Stages such as
/// [`crate::FrameSource`] and [`crate::ChannelTable`] hold a clone for as long
/// as they exist.
///
/// # Examples
///
/// ```
/// use imp::{ImpSystem, config::RuntimeConfig};
///
/// # fn main() -> Result<(), imp::Error> {
/// let system = ImpSystem::with_heap_allocator(RuntimeConfig::default())?;
/// assert_eq!(ImpSystem::version(), "IMP-1.1.6");
/// system.rebase_timestamp(1_000_000);
/// assert!(system.timestamp_us() >= 1_000_000);
/// system.destroy()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ImpSystem {
    context: Arc<SystemContext>,
}

impl std::fmt::Debug for ImpSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImpSystem")
            .field("registry", &self.context.registry)
            .field("pools", &self.context.pools)
            .finish()
    }
}

impl ImpSystem {
    /// Initializes a runtime drawing pool memory from `allocator`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArg`] if `config` fails validation.
    pub fn new(config: RuntimeConfig, allocator: Arc<dyn DeviceAllocator>) -> Result<Self> {
        config.validate()?;
        let context = SystemContext {
            registry: ModuleRegistry::new(config.in_flight_frames),
            pools: PoolManager::new(allocator, config.max_pools),
            clock: Clock::new(),
            config,
        };
        info!(version = %Self::version(), "IMP system initialized.");
        Ok(Self {
            context: Arc::new(context),
        })
    }

    /// Initializes a runtime backed by a [`HeapAllocator`].
    pub fn with_heap_allocator(config: RuntimeConfig) -> Result<Self> {
        let allocator = Arc::new(HeapAllocator::new(config.max_dma_buffers));
        Self::new(config, allocator)
    }

    pub(crate) fn context(&self) -> &Arc<SystemContext> {
        &self.context
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.context.config
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.context.registry
    }

    pub fn pools(&self) -> &PoolManager {
        &self.context.pools
    }

    /// Runtime version string, `IMP-x.y.z`.
    pub fn version() -> String {
        format!("IMP-{}", imp_sys::IMP_VERSION)
    }

    /// Name of the SoC with the given id.
    pub fn cpu_info(cpu_id: u32) -> &'static str {
        match cpu_id {
            0 => "T10",
            1 | 2 => "T20",
            3 => "T21",
            4 => "T23",
            5 => "T30",
            6 => "T31",
            7 => "T40",
            8 => "T41",
            9 => "C100",
            10 => "T15",
            11 => "T20L",
            12 => "T20X",
            13 => "T21L",
            14 => "T21N",
            15 => "T21Z",
            16 => "T30A",
            17 => "T30L",
            18 => "T30N",
            19 => "T30X",
            20 => "T31A",
            21 => "T31L",
            22 => "T31N",
            23 => "T31X",
            _ => "Unknown",
        }
    }

    /// Microseconds since initialization or the last rebase.
    pub fn timestamp_us(&self) -> u64 {
        self.context.clock.now_us()
    }

    /// Makes the current instant read as `timestamp_us`.
    pub fn rebase_timestamp(&self, timestamp_us: u64) {
        self.context.clock.rebase(timestamp_us);
        info!(timestamp_us, "Timestamp rebased.");
    }

    /// See [`ModuleRegistry::bind`].
    pub fn bind(&self, src: Cell, dst: Cell) -> Result<()> {
        self.context.registry.bind(src, dst)
    }

    /// See [`ModuleRegistry::unbind`].
    pub fn unbind(&self, src: Cell, dst: Cell) -> Result<()> {
        self.context.registry.unbind(src, dst)
    }

    /// Tears the runtime down, freeing every pool and registered module.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Other`] if another clone of this handle, or a stage
    /// built from it, is still alive.
    pub fn destroy(self) -> Result<()> {
        Arc::into_inner(self.context)
            .ok_or_else(|| Error::Other("IMP system still in use.".to_string()))?
            .destroy()
    }
}
