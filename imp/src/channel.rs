// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Analysis channels and their result state machine.
//!
//! A [`ChannelTable`] owns a set of channels that consume frames from
//! analysis groups. Each group is an IVS module bound to the frame-source
//! module with the same index; every frame the source delivers is processed by
//! the running channels registered to that group, on the producer's thread.
//!
//! ```text
//! FrameSource[g] ──bind──► IVS[g] ──► channel a (running)  ──► poll/get/release
//!                                 └─► channel b (stopped)
//! ```
//!
//! A channel moves through these states:
//!
//! ```text
//! create ──► Created ──start──► Running ──stop──► Stopped ──► destroy
//!               │  ▲                                  │
//!      register │  │ unregister          (start again)┘
//!               ▼  │
//!            Registered
//! ```

pub mod handler;
pub mod motion;
pub(crate) mod worker;

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    Cell, ChannelHandler, DeviceKind, Error, FrameInfo, ImpSystem, Module, ModuleOps, Result,
    system::SystemContext,
    wait::{Semaphore, WaitMode},
};
use worker::Worker;

type BoxedHandler<R> = Box<dyn ChannelHandler<Output = R>>;

struct Channel<R: Send + 'static> {
    id: usize,
    group: Mutex<Option<usize>>,
    running: AtomicBool,
    /// Mutual exclusion for every handler call.
    handler: Mutex<BoxedHandler<R>>,
    /// Result-ready count.
    results: Semaphore,
    worker: Mutex<Option<Worker>>,
}

impl<R: Send + 'static> Channel<R> {
    /// Runs `process` if the channel is running; returns whether it did.
    fn process(&self, frame: &FrameInfo) -> Result<bool> {
        let mut handler = self.handler.lock();
        if !self.running.load(Ordering::Acquire) {
            return Ok(false);
        }
        handler
            .process(frame)
            .map_err(|e| Error::handler("process", e))?;
        self.results.post();
        Ok(true)
    }

    fn shut_down(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        self.results.close();
        *self.group.lock() = None;
        let stopped = match self.worker.lock().take() {
            Some(worker) => worker.stop(),
            None => Ok(()),
        };
        self.handler.lock().exit();
        stopped
    }
}

struct TableInner<R: Send + 'static> {
    system: Arc<SystemContext>,
    groups: Mutex<Vec<Option<Arc<Module>>>>,
    channels: Mutex<Vec<Option<Arc<Channel<R>>>>>,
}

impl<R: Send + 'static> TableInner<R> {
    fn dispatch(&self, group: usize, frame: &FrameInfo) -> Result<()> {
        let targets: Vec<_> = self
            .channels
            .lock()
            .iter()
            .flatten()
            .filter(|chn| *chn.group.lock() == Some(group))
            .cloned()
            .collect();

        let mut first_error = None;
        for chn in targets {
            match chn.process(frame) {
                Ok(true) => debug!(channel = chn.id, frame = frame.index, "Result ready."),
                Ok(false) => {}
                Err(e) => {
                    warn!(channel = chn.id, error = %e, "Channel failed to process frame.");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Update hook of a group module: fans frames out to the group's channels.
struct GroupDispatch<R: Send + 'static> {
    table: Weak<TableInner<R>>,
    group: usize,
}

impl<R: Send + 'static> ModuleOps for GroupDispatch<R> {
    fn update(&self, _module: &Arc<Module>, frame: &FrameInfo) -> Result<()> {
        match self.table.upgrade() {
            Some(table) => table.dispatch(self.group, frame),
            None => Ok(()),
        }
    }
}

/// Table of analysis channels producing results of type `R`.
///
/// # Examples
///
/// ```no_run
/// use imp::{ChannelTable, ImpSystem, MotionHandler, MotionParams, config::RuntimeConfig};
///
/// # fn main() -> Result<(), imp::Error> {
/// let system = ImpSystem::with_heap_allocator(RuntimeConfig::default())?;
/// let channels = ChannelTable::new(&system);
/// channels.create(0, MotionHandler::new(MotionParams::full_frame(640, 360)))?;
/// channels.register(0, 0)?;
/// channels.start(0)?;
///
/// // ... frames delivered by the frame source on group 0 ...
///
/// channels.poll_result(0, 1000)?;
/// let result = channels.get_result(0)?;
/// println!("motion: {}", result.any_motion());
/// channels.release_result(0, result)?;
/// channels.destroy(0)?;
/// # Ok(())
/// # }
/// ```
pub struct ChannelTable<R: Send + 'static> {
    inner: Arc<TableInner<R>>,
}

impl<R: Send + 'static> ChannelTable<R> {
    pub fn new(system: &ImpSystem) -> Self {
        let context = system.context().clone();
        let inner = TableInner {
            groups: Mutex::new(vec![None; context.config.max_channel_groups]),
            channels: Mutex::new((0..context.config.max_channels).map(|_| None).collect()),
            system: context,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    fn channel(&self, channel: usize) -> Result<Arc<Channel<R>>> {
        self.inner
            .channels
            .lock()
            .get(channel)
            .ok_or_else(|| Error::InvalidAddress(format!("channel {channel}")))?
            .clone()
            .ok_or_else(|| Error::NotFound(format!("channel {channel}")))
    }

    fn check_group(&self, group: usize) -> Result<()> {
        if group < self.inner.groups.lock().len() {
            Ok(())
        } else {
            Err(Error::InvalidAddress(format!("group {group}")))
        }
    }

    /// Returns the group's module, creating and registering it if needed.
    /// `exclusive` turns an existing group into [`Error::AlreadyExists`].
    fn ensure_group(&self, group: usize, exclusive: bool) -> Result<Arc<Module>> {
        let mut groups = self.inner.groups.lock();
        let slot = groups
            .get_mut(group)
            .ok_or_else(|| Error::InvalidAddress(format!("group {group}")))?;
        if let Some(module) = slot.as_ref() {
            return if exclusive {
                Err(Error::AlreadyExists(format!("group {group}")))
            } else {
                Ok(module.clone())
            };
        }
        let ops: Arc<dyn ModuleOps> = Arc::new(GroupDispatch {
            table: Arc::downgrade(&self.inner),
            group,
        });
        let registry = &self.inner.system.registry;
        let module = registry.allocate("ivs", Some(ops));
        registry.register(DeviceKind::IVS, group, &module)?;
        *slot = Some(module.clone());
        info!(group, "Group created.");
        Ok(module)
    }

    /// Creates analysis group `group`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if `group` is out of range
    /// - [`Error::AlreadyExists`] if the group exists, or another module
    ///   occupies its registry slot
    pub fn create_group(&self, group: usize) -> Result<()> {
        self.ensure_group(group, true).map(|_| ())
    }

    /// Destroys analysis group `group`, unbinding it from its producer.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the group does not exist
    /// - [`Error::InvalidArg`] if channels are still registered to it
    pub fn destroy_group(&self, group: usize) -> Result<()> {
        let mut groups = self.inner.groups.lock();
        let slot = groups
            .get_mut(group)
            .ok_or_else(|| Error::InvalidAddress(format!("group {group}")))?;
        if slot.is_none() {
            return Err(Error::NotFound(format!("group {group}")));
        }
        let registered = self
            .inner
            .channels
            .lock()
            .iter()
            .flatten()
            .filter(|chn| *chn.group.lock() == Some(group))
            .count();
        if registered > 0 {
            return Err(Error::InvalidArg(format!(
                "group {group} still has {registered} registered channel(s)"
            )));
        }
        let Some(module) = slot.take() else {
            return Err(Error::NotFound(format!("group {group}")));
        };
        drop(groups);

        let registry = &self.inner.system.registry;
        if let Some(producer) = registry.lookup(DeviceKind::FRAME_SOURCE, group) {
            while producer.is_bound_to(&module) {
                producer.detach_observer(&module)?;
            }
        }
        if registry
            .lookup(DeviceKind::IVS, group)
            .is_some_and(|current| Arc::ptr_eq(&current, &module))
        {
            registry.unregister(DeviceKind::IVS, group)?;
        }
        info!(group, "Group destroyed.");
        Ok(())
    }

    /// Module of group `group`, if it exists.
    pub fn group_module(&self, group: usize) -> Option<Arc<Module>> {
        self.inner.groups.lock().get(group).cloned().flatten()
    }

    /// Creates channel `channel` around `handler`.
    ///
    /// The handler's `init` runs first, then the worker starts. If either
    /// fails, everything acquired so far is released and the channel does not
    /// exist.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if `channel` is out of range
    /// - [`Error::AlreadyExists`] if the channel exists
    /// - [`Error::HandlerFailure`] if `init` fails
    /// - [`Error::Other`] if the worker thread cannot be started
    pub fn create<H>(&self, channel: usize, handler: H) -> Result<()>
    where
        H: ChannelHandler<Output = R> + 'static,
    {
        self.create_boxed(channel, Box::new(handler))
    }

    /// Like [`Self::create`] for an already boxed handler.
    pub fn create_boxed(&self, channel: usize, mut handler: BoxedHandler<R>) -> Result<()> {
        let mut channels = self.inner.channels.lock();
        let slot = channels
            .get_mut(channel)
            .ok_or_else(|| Error::InvalidAddress(format!("channel {channel}")))?;
        if slot.is_some() {
            return Err(Error::AlreadyExists(format!("channel {channel}")));
        }

        handler.init().map_err(|e| Error::handler("init", e))?;
        let idle = self.inner.system.config.worker_idle_interval();
        let worker = match Worker::spawn(channel, idle) {
            Ok(worker) => worker,
            Err(e) => {
                handler.exit();
                return Err(e);
            }
        };

        *slot = Some(Arc::new(Channel {
            id: channel,
            group: Mutex::new(None),
            running: AtomicBool::new(false),
            handler: Mutex::new(handler),
            results: Semaphore::new(0),
            worker: Mutex::new(Some(worker)),
        }));
        info!(channel, "Channel created.");
        Ok(())
    }

    /// Destroys channel `channel`.
    ///
    /// The channel is stopped and unregistered, its worker is cancelled and
    /// joined, and only then does the handler's `exit` run. A frame being
    /// processed when this is called finishes first.
    pub fn destroy(&self, channel: usize) -> Result<()> {
        let chn = self
            .inner
            .channels
            .lock()
            .get_mut(channel)
            .ok_or_else(|| Error::InvalidAddress(format!("channel {channel}")))?
            .take()
            .ok_or_else(|| Error::NotFound(format!("channel {channel}")))?;
        chn.shut_down()?;
        info!(channel, "Channel destroyed.");
        Ok(())
    }

    /// Registers `channel` to `group`, creating the group and its producer
    /// module if they do not exist yet and binding the producer to the group.
    ///
    /// Registering to the group the channel is already in is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if `group` or `channel` is out of range
    /// - [`Error::NotFound`] if the channel does not exist
    /// - [`Error::AlreadyExists`] if the channel is registered to another group
    /// - any error from binding the producer to the group
    pub fn register(&self, group: usize, channel: usize) -> Result<()> {
        self.check_group(group)?;
        let chn = self.channel(channel)?;
        let already = |current: Option<usize>| match current {
            Some(g) if g == group => Ok(true),
            Some(g) => Err(Error::AlreadyExists(format!(
                "channel {channel} is registered to group {g}"
            ))),
            None => Ok(false),
        };
        if already(*chn.group.lock())? {
            return Ok(());
        }

        self.ensure_group(group, false)?;
        let registry = &self.inner.system.registry;
        registry.ensure(DeviceKind::FRAME_SOURCE, group, "framesource", None)?;
        registry.bind_if_needed(
            Cell::new(DeviceKind::FRAME_SOURCE, group, 0),
            Cell::new(DeviceKind::IVS, group, 0),
        )?;

        let groups = self.inner.groups.lock();
        if groups.get(group).is_none_or(Option::is_none) {
            return Err(Error::NotFound(format!("group {group}")));
        }
        let mut current = chn.group.lock();
        if already(*current)? {
            return Ok(());
        }
        *current = Some(group);
        info!(group, channel, "Channel registered.");
        Ok(())
    }

    /// Detaches `channel` from its group. The worker keeps running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the channel does not exist or is not
    /// registered.
    pub fn unregister(&self, channel: usize) -> Result<()> {
        let chn = self.channel(channel)?;
        let group = chn
            .group
            .lock()
            .take()
            .ok_or_else(|| Error::NotFound(format!("channel {channel} is not registered")))?;
        info!(group, channel, "Channel unregistered.");
        Ok(())
    }

    /// Group `channel` is registered to, if any.
    pub fn group_of(&self, channel: usize) -> Result<Option<usize>> {
        Ok(*self.channel(channel)?.group.lock())
    }

    /// Starts processing delivered frames.
    pub fn start(&self, channel: usize) -> Result<()> {
        let chn = self.channel(channel)?;
        if !chn.running.swap(true, Ordering::AcqRel) {
            info!(channel, "Channel started.");
        }
        Ok(())
    }

    /// Stops processing and discards buffered partial results.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandlerFailure`] if the handler's flush fails; the
    /// channel is stopped regardless.
    pub fn stop(&self, channel: usize) -> Result<()> {
        let chn = self.channel(channel)?;
        chn.running.store(false, Ordering::Release);
        chn.handler
            .lock()
            .flush()
            .map_err(|e| Error::handler("flush", e))?;
        info!(channel, "Channel stopped.");
        Ok(())
    }

    pub fn is_running(&self, channel: usize) -> Result<bool> {
        Ok(self.channel(channel)?.running.load(Ordering::Acquire))
    }

    /// Waits for a processed frame.
    ///
    /// `wait` accepts a [`WaitMode`] or the millisecond convention of
    /// [`WaitMode::from_millis`]: `0` checks once, negative blocks
    /// indefinitely, positive blocks at most that long. Each success consumes
    /// one processed frame.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no result became ready in time
    /// - [`Error::NotFound`] if the channel does not exist or is destroyed
    ///   while waiting
    pub fn poll_result(&self, channel: usize, wait: impl Into<WaitMode>) -> Result<()> {
        let chn = self.channel(channel)?;
        chn.results.wait(wait.into()).map_err(|e| match e {
            Error::Timeout => e,
            _ => Error::NotFound(format!("channel {channel}")),
        })
    }

    /// Results processed but not yet polled.
    pub fn pending_results(&self, channel: usize) -> Result<usize> {
        Ok(self.channel(channel)?.results.available())
    }

    /// Fetches the latest result. Call after a successful [`Self::poll_result`].
    pub fn get_result(&self, channel: usize) -> Result<R> {
        let chn = self.channel(channel)?;
        let mut handler = chn.handler.lock();
        handler
            .get_result()
            .map_err(|e| Error::handler("get_result", e))
    }

    /// Hands a result from [`Self::get_result`] back to the handler.
    pub fn release_result(&self, channel: usize, result: R) -> Result<()> {
        let chn = self.channel(channel)?;
        let mut handler = chn.handler.lock();
        handler
            .release_result(result)
            .map_err(|e| Error::handler("release_result", e))
    }
}

impl<R: Send + 'static> Drop for ChannelTable<R> {
    fn drop(&mut self) {
        let channels: Vec<_> = self
            .inner
            .channels
            .lock()
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        for chn in channels {
            if let Err(e) = chn.shut_down() {
                error!(channel = chn.id, error = %e, "Failed to destroy channel.");
            }
        }
        let groups: Vec<_> = self
            .inner
            .groups
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(group, module)| module.as_ref().map(|_| group))
            .collect();
        for group in groups {
            if let Err(e) = self.destroy_group(group) {
                error!(group, error = %e, "Failed to destroy group.");
            }
        }
    }
}
