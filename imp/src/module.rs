// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Pipeline-stage modules and their addresses.
//!
//! A [`Module`] is the addressable unit the registry stores for every stage
//! instance. It owns the ordered observer list that forms its outgoing edges
//! in the dataflow graph and an optional [`ModuleOps`] implementation that
//! overrides the generic bind, unbind and update behaviour.

pub(crate) mod observer;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    Error, FrameInfo, Result,
    wait::{Semaphore, WaitMode},
};
use observer::Observer;

/// Longest name a module keeps; longer names are truncated.
pub const MODULE_NAME_MAX: usize = 15;

/// Row of the registry address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKind(usize);

impl DeviceKind {
    pub const FRAME_SOURCE: DeviceKind = DeviceKind(imp_sys::DEV_ID_FS as usize);
    pub const ENCODER: DeviceKind = DeviceKind(imp_sys::DEV_ID_ENC as usize);
    pub const IVS: DeviceKind = DeviceKind(imp_sys::DEV_ID_IVS as usize);
    pub const OSD: DeviceKind = DeviceKind(imp_sys::DEV_ID_OSD as usize);

    /// Builds a device kind from a raw row index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if `index >= imp_sys::MAX_DEVICES`.
    pub fn new(index: usize) -> Result<Self> {
        if index < imp_sys::MAX_DEVICES {
            Ok(Self(index))
        } else {
            Err(Error::InvalidAddress(format!("device kind {index}")))
        }
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DeviceKind::FRAME_SOURCE => f.write_str("framesource"),
            DeviceKind::ENCODER => f.write_str("encoder"),
            DeviceKind::IVS => f.write_str("ivs"),
            DeviceKind::OSD => f.write_str("osd"),
            DeviceKind(other) => write!(f, "device{other}"),
        }
    }
}

/// Address of one numbered output port of one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cell {
    pub device: DeviceKind,
    pub group: usize,
    pub output: usize,
}

impl Cell {
    pub fn new(device: DeviceKind, group: usize, output: usize) -> Self {
        Self {
            device,
            group,
            output,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{},{}]", self.device, self.group, self.output)
    }
}

impl TryFrom<imp_sys::Cell> for Cell {
    type Error = Error;

    fn try_from(cell: imp_sys::Cell) -> Result<Self> {
        let index = |value: i32, what: &str| {
            usize::try_from(value).map_err(|_| Error::InvalidAddress(format!("{what} {value}")))
        };
        Ok(Self {
            device: DeviceKind::new(index(cell.device_id, "device kind")?)?,
            group: index(cell.group_id, "group")?,
            output: index(cell.output_id, "output")?,
        })
    }
}

/// Identity assigned to every module at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(Uuid);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Output-specific context handed to bind and unbind handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputContext {
    /// Index of the source output being wired.
    pub index: usize,
}

/// Stage-supplied overrides for binding and frame delivery.
///
/// Every method has a default that performs the generic behaviour, so an
/// implementation only overrides what its stage needs. A module without any
/// `ModuleOps` behaves exactly like one using all defaults.
pub trait ModuleOps: Send + Sync {
    /// Wires `src`'s output to `dst`. The default appends an observer.
    fn bind(&self, src: &Arc<Module>, dst: &Arc<Module>, output: OutputContext) -> Result<()> {
        src.attach_observer(dst, output.index);
        Ok(())
    }

    /// Removes an edge. The default removes the first observer targeting `dst`.
    fn unbind(&self, src: &Arc<Module>, dst: &Arc<Module>, _output: OutputContext) -> Result<()> {
        src.detach_observer(dst)
    }

    /// Called on the destination module when a bound producer delivers a frame.
    fn update(&self, _module: &Arc<Module>, _frame: &FrameInfo) -> Result<()> {
        Ok(())
    }
}

/// Where a module currently sits in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placement {
    pub(crate) device: DeviceKind,
    pub(crate) group: usize,
}

/// One pipeline-stage instance.
///
/// Modules are created through [`crate::ModuleRegistry::allocate`] and shared
/// as `Arc<Module>`; the registry slot and the owning stage each hold a
/// reference. Observers only hold weak references to their destination, so
/// the graph never keeps a torn-down stage alive.
pub struct Module {
    id: ModuleId,
    name: String,
    placement: Mutex<Option<Placement>>,
    output_count: AtomicUsize,
    ops: Option<Arc<dyn ModuleOps>>,
    /// Binding lock: bind, unbind and notify contend here, never on the registry.
    observers: Mutex<Vec<Observer>>,
    in_flight: Semaphore,
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("placement", &*self.placement.lock())
            .field("output_count", &self.output_count())
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl Module {
    pub(crate) fn new(name: &str, ops: Option<Arc<dyn ModuleOps>>, in_flight: usize) -> Self {
        let mut name = name.to_string();
        if name.len() > MODULE_NAME_MAX {
            let mut end = MODULE_NAME_MAX;
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            warn!(name = %name, "Module name truncated to {MODULE_NAME_MAX} bytes.");
            name.truncate(end);
        }
        Self {
            id: ModuleId(Uuid::new_v4()),
            name,
            placement: Mutex::new(None),
            output_count: AtomicUsize::new(0),
            ops,
            observers: Mutex::new(Vec::new()),
            in_flight: Semaphore::new(in_flight),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device kind of the registry slot holding this module, if registered.
    pub fn device(&self) -> Option<DeviceKind> {
        self.placement.lock().map(|p| p.device)
    }

    /// Group index of the registry slot holding this module, if registered.
    pub fn group(&self) -> Option<usize> {
        self.placement.lock().map(|p| p.group)
    }

    pub(crate) fn set_placement(&self, placement: Option<Placement>) {
        *self.placement.lock() = placement;
    }

    pub fn output_count(&self) -> usize {
        self.output_count.load(Ordering::Acquire)
    }

    /// Sets the number of outputs this module exposes.
    ///
    /// A module registered with zero outputs is given one.
    pub fn set_output_count(&self, count: usize) {
        self.output_count.store(count, Ordering::Release);
    }

    /// Bumps a zero output count to one; returns the resulting count.
    pub(crate) fn default_output_count(&self) -> usize {
        match self
            .output_count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => 1,
            Err(current) => current,
        }
    }

    pub(crate) fn ops(&self) -> Option<&Arc<dyn ModuleOps>> {
        self.ops.as_ref()
    }

    /// Number of outgoing edges, counting duplicates.
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Returns `true` if at least one edge from this module targets `dst`.
    pub fn is_bound_to(&self, dst: &Module) -> bool {
        self.observers.lock().iter().any(|o| o.targets(dst))
    }

    /// Most recent frame delivered over the first edge targeting `dst`.
    pub fn last_delivered(&self, dst: &Module) -> Option<FrameInfo> {
        self.observers
            .lock()
            .iter()
            .find(|o| o.targets(dst))
            .and_then(|o| o.last_frame())
    }

    /// Appends an edge to `dst` on `output`. Duplicate edges are kept.
    pub fn attach_observer(&self, dst: &Arc<Module>, output: usize) {
        let mut observers = self.observers.lock();
        observers.push(Observer::new(dst, output));
        debug!(
            src = %self.name,
            dst = %dst.name,
            output,
            edges = observers.len(),
            "Observer attached."
        );
    }

    /// Removes the first edge targeting `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no edge targets `dst`.
    pub fn detach_observer(&self, dst: &Module) -> Result<()> {
        let mut observers = self.observers.lock();
        let position = observers
            .iter()
            .position(|o| o.targets(dst))
            .ok_or_else(|| Error::NotFound(format!("edge {} -> {}", self.name, dst.name)))?;
        observers.remove(position);
        debug!(src = %self.name, dst = %dst.name, "Observer detached.");
        Ok(())
    }

    /// Delivers `frame` to every observer in insertion order.
    ///
    /// Each observer records the frame, then the destination's
    /// [`ModuleOps::update`] runs on the calling thread. A failing update is
    /// logged and delivery moves on to the next observer. A destination
    /// already holding its full in-flight allowance of frames makes the caller
    /// wait until one of them completes.
    ///
    /// Returns the number of update callbacks that ran successfully.
    pub fn notify(&self, frame: &FrameInfo) -> usize {
        // Updates run outside the binding lock so a callback may itself bind.
        let targets: Vec<_> = {
            let mut observers = self.observers.lock();
            observers
                .iter_mut()
                .filter_map(|observer| {
                    observer.record(frame);
                    observer.destination().map(|dst| (dst, observer.output()))
                })
                .collect()
        };

        let mut delivered = 0;
        for (dst, output) in targets {
            let Some(ops) = dst.ops.clone() else {
                continue;
            };
            debug!(
                src = %self.name,
                dst = %dst.name,
                output,
                frame = frame.index,
                "Delivering frame."
            );
            if let Err(e) = dst.in_flight.wait(WaitMode::Forever) {
                warn!(
                    src = %self.name,
                    dst = %dst.name,
                    frame = frame.index,
                    error = %e,
                    "No in-flight permit for destination."
                );
                continue;
            }
            match ops.update(&dst, frame) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    src = %self.name,
                    dst = %dst.name,
                    error = %e,
                    "Observer update failed."
                ),
            }
            dst.in_flight.post();
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    struct Counting {
        calls: AtomicU32,
        fail: bool,
    }

    impl ModuleOps for Counting {
        fn update(&self, _module: &Arc<Module>, _frame: &FrameInfo) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::Other("rejected".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn counting(fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicU32::new(0),
            fail,
        })
    }

    #[test]
    fn long_names_are_truncated() {
        let module = Module::new("a_very_long_module_name", None, 1);
        assert_eq!(module.name(), "a_very_long_mod");
    }

    #[test]
    fn failing_update_does_not_block_siblings() {
        let src = Module::new("src", None, 1);
        let bad = counting(true);
        let good = counting(false);
        let dst_bad = Arc::new(Module::new("bad", Some(bad.clone()), 4));
        let dst_good = Arc::new(Module::new("good", Some(good.clone()), 4));
        src.attach_observer(&dst_bad, 0);
        src.attach_observer(&dst_good, 0);

        let frame = FrameInfo::default();
        assert_eq!(src.notify(&frame), 1);
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);
        assert_eq!(src.last_delivered(&dst_good), Some(frame));
    }

    #[test]
    fn saturated_destination_delays_instead_of_dropping() {
        struct Slow(AtomicU32);

        impl ModuleOps for Slow {
            fn update(&self, _module: &Arc<Module>, _frame: &FrameInfo) -> Result<()> {
                std::thread::sleep(std::time::Duration::from_millis(50));
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let ops = Arc::new(Slow(AtomicU32::new(0)));
        let dst = Arc::new(Module::new("dst", Some(ops.clone()), 1));
        let src = Arc::new(Module::new("src", None, 1));
        src.attach_observer(&dst, 0);

        let producers: Vec<_> = (0..2)
            .map(|index| {
                let src = src.clone();
                std::thread::spawn(move || {
                    src.notify(&FrameInfo {
                        index,
                        ..FrameInfo::default()
                    })
                })
            })
            .collect();
        let delivered: usize = producers.into_iter().map(|p| p.join().unwrap()).sum();
        assert_eq!(delivered, 2);
        assert_eq!(ops.0.load(Ordering::SeqCst), 2);
        assert_eq!(dst.in_flight.available(), 1);
    }

    #[test]
    fn dropped_destination_is_skipped() {
        let src = Module::new("src", None, 1);
        let ops = counting(false);
        let dst = Arc::new(Module::new("dst", Some(ops.clone()), 4));
        src.attach_observer(&dst, 0);
        drop(dst);
        assert_eq!(src.notify(&FrameInfo::default()), 0);
        assert_eq!(ops.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn detach_removes_only_first_duplicate() {
        let src = Module::new("src", None, 1);
        let dst = Arc::new(Module::new("dst", None, 1));
        src.attach_observer(&dst, 0);
        src.attach_observer(&dst, 0);
        src.detach_observer(&dst).unwrap();
        assert!(src.is_bound_to(&dst));
        src.detach_observer(&dst).unwrap();
        assert!(matches!(src.detach_observer(&dst), Err(Error::NotFound(_))));
    }

    #[test]
    fn raw_cell_with_negative_index_is_invalid() {
        let raw = imp_sys::Cell {
            device_id: imp_sys::DEV_ID_IVS,
            group_id: -1,
            output_id: 0,
        };
        assert!(matches!(Cell::try_from(raw), Err(Error::InvalidAddress(_))));

        let raw = imp_sys::Cell {
            device_id: imp_sys::DEV_ID_FS,
            group_id: 1,
            output_id: 0,
        };
        assert_eq!(
            Cell::try_from(raw).unwrap(),
            Cell::new(DeviceKind::FRAME_SOURCE, 1, 0)
        );
    }
}
