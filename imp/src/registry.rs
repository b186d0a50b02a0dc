// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Module address space and the binding protocol.
//!
//! The registry is a fixed `MAX_DEVICES x MAX_GROUPS` matrix of module slots.
//! All slot mutations and lookups are serialized by one lock; bind and unbind
//! only hold it long enough to resolve both endpoints and then work on the
//! source module's own binding lock.

use std::sync::Arc;

use imp_sys::{MAX_DEVICES, MAX_GROUPS};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    Cell, DeviceKind, Error, Module, ModuleOps, Result,
    module::{OutputContext, Placement},
};

type Slots = [[Option<Arc<Module>>; MAX_GROUPS]; MAX_DEVICES];

/// Owner of every registered module.
///
/// # Examples
///
/// ```
/// use imp::{Cell, DeviceKind, ModuleRegistry};
///
/// # fn main() -> Result<(), imp::Error> {
/// let registry = ModuleRegistry::new(16);
/// let fs = registry.allocate("framesource", None);
/// let ivs = registry.allocate("ivs", None);
/// registry.register(DeviceKind::FRAME_SOURCE, 0, &fs)?;
/// registry.register(DeviceKind::IVS, 0, &ivs)?;
///
/// registry.bind(
///     Cell::new(DeviceKind::FRAME_SOURCE, 0, 0),
///     Cell::new(DeviceKind::IVS, 0, 0),
/// )?;
/// assert!(fs.is_bound_to(&ivs));
/// # Ok(())
/// # }
/// ```
pub struct ModuleRegistry {
    slots: Mutex<Slots>,
    in_flight_frames: usize,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered = self.slots.lock().iter().flatten().flatten().count();
        f.debug_struct("ModuleRegistry")
            .field("registered", &registered)
            .finish()
    }
}

fn slot_index(device: DeviceKind, group: usize) -> Result<(usize, usize)> {
    let device = device.index();
    if device >= MAX_DEVICES || group >= MAX_GROUPS {
        return Err(Error::InvalidAddress(format!(
            "module slot ({device}, {group})"
        )));
    }
    Ok((device, group))
}

impl ModuleRegistry {
    /// Creates an empty registry whose modules admit `in_flight_frames`
    /// concurrent deliveries each.
    pub fn new(in_flight_frames: usize) -> Self {
        Self {
            slots: Mutex::new(std::array::from_fn(|_| std::array::from_fn(|_| None))),
            in_flight_frames,
        }
    }

    /// Creates a module that is not yet placed in any slot.
    ///
    /// Names longer than [`crate::module::MODULE_NAME_MAX`] bytes are truncated.
    pub fn allocate(&self, name: &str, ops: Option<Arc<dyn ModuleOps>>) -> Arc<Module> {
        let module = Arc::new(Module::new(name, ops, self.in_flight_frames));
        debug!(name = module.name(), id = %module.id(), "Module allocated.");
        module
    }

    /// Places `module` at `(device, group)`.
    ///
    /// A module registered with an output count of zero is given one output.
    /// Registering the module already stored in the slot is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if the slot is outside the address space
    /// - [`Error::AlreadyExists`] if another module occupies the slot
    pub fn register(&self, device: DeviceKind, group: usize, module: &Arc<Module>) -> Result<()> {
        let (row, column) = slot_index(device, group)?;
        let mut slots = self.slots.lock();
        Self::place(&mut slots[row][column], device, group, module)
    }

    fn place(
        slot: &mut Option<Arc<Module>>,
        device: DeviceKind,
        group: usize,
        module: &Arc<Module>,
    ) -> Result<()> {
        if let Some(existing) = slot.as_ref() {
            if Arc::ptr_eq(existing, module) {
                return Ok(());
            }
            return Err(Error::AlreadyExists(format!(
                "slot ({device}, {group}) holds {}",
                existing.name()
            )));
        }
        let outputs = module.default_output_count();
        module.set_placement(Some(Placement { device, group }));
        *slot = Some(module.clone());
        info!(
            %device,
            group,
            name = module.name(),
            outputs,
            "Module registered."
        );
        Ok(())
    }

    /// Returns the module stored at `(device, group)`, if any.
    pub fn lookup(&self, device: DeviceKind, group: usize) -> Option<Arc<Module>> {
        let (row, column) = slot_index(device, group).ok()?;
        self.slots.lock()[row][column].clone()
    }

    fn resolve(&self, device: DeviceKind, group: usize) -> Result<Arc<Module>> {
        slot_index(device, group)?;
        self.lookup(device, group)
            .ok_or_else(|| Error::NotFound(format!("module ({device}, {group})")))
    }

    /// Empties the slot at `(device, group)` and returns the module it held.
    ///
    /// Edges to and from the module are left in place; the module itself is
    /// dropped once the caller releases the returned handle.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if the slot is outside the address space
    /// - [`Error::NotFound`] if the slot is empty
    pub fn unregister(&self, device: DeviceKind, group: usize) -> Result<Arc<Module>> {
        let (row, column) = slot_index(device, group)?;
        let module = self.slots.lock()[row][column]
            .take()
            .ok_or_else(|| Error::NotFound(format!("module ({device}, {group})")))?;
        module.set_placement(None);
        info!(%device, group, name = module.name(), "Module unregistered.");
        Ok(module)
    }

    /// Returns the module at `(device, group)`, allocating and registering one
    /// named `name` with `ops` if the slot is empty. Both steps happen under
    /// the registry lock.
    pub fn ensure(
        &self,
        device: DeviceKind,
        group: usize,
        name: &str,
        ops: Option<Arc<dyn ModuleOps>>,
    ) -> Result<Arc<Module>> {
        let (row, column) = slot_index(device, group)?;
        let mut slots = self.slots.lock();
        let slot = &mut slots[row][column];
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }
        let module = self.allocate(name, ops);
        Self::place(slot, device, group, &module)?;
        Ok(module)
    }

    /// Drops every registered module.
    pub(crate) fn clear(&self) {
        let mut slots = self.slots.lock();
        for module in slots.iter_mut().flatten().filter_map(Option::take) {
            module.set_placement(None);
        }
    }

    fn endpoints(&self, src: Cell, dst: Cell) -> Result<(Arc<Module>, Arc<Module>)> {
        Ok((
            self.resolve(src.device, src.group)?,
            self.resolve(dst.device, dst.group)?,
        ))
    }

    /// Wires output `src.output` of the module at `src` to the module at `dst`.
    ///
    /// If the source module carries [`ModuleOps`], its `bind` decides what
    /// happens; otherwise an observer is appended. Repeated binds of the same
    /// pair add repeated edges; see [`Self::bind_if_needed`] for the
    /// idempotent form.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if either cell is outside the address space
    /// - [`Error::NotFound`] if either module is not registered
    /// - [`Error::InvalidOutput`] if `src.output` is not below the source's
    ///   output count
    /// - whatever a custom bind handler returns
    pub fn bind(&self, src: Cell, dst: Cell) -> Result<()> {
        let (src_module, dst_module) = self.endpoints(src, dst)?;
        let count = src_module.output_count();
        if src.output >= count {
            return Err(Error::InvalidOutput {
                output: src.output,
                count,
            });
        }
        let output = OutputContext { index: src.output };
        match src_module.ops() {
            Some(ops) => ops.bind(&src_module, &dst_module, output)?,
            None => src_module.attach_observer(&dst_module, output.index),
        }
        info!(%src, %dst, "Bound.");
        Ok(())
    }

    /// Like [`Self::bind`], but does nothing if `src` already has an edge to
    /// `dst`. Returns whether a new edge was created.
    pub fn bind_if_needed(&self, src: Cell, dst: Cell) -> Result<bool> {
        let (src_module, dst_module) = self.endpoints(src, dst)?;
        if src_module.is_bound_to(&dst_module) {
            debug!(%src, %dst, "Already bound.");
            return Ok(false);
        }
        self.bind(src, dst)?;
        Ok(true)
    }

    /// Removes an edge created by [`Self::bind`].
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if either module is not registered, or if no
    ///   edge from `src` to `dst` exists
    /// - whatever a custom unbind handler returns
    pub fn unbind(&self, src: Cell, dst: Cell) -> Result<()> {
        let (src_module, dst_module) = self.endpoints(src, dst)?;
        let output = OutputContext { index: src.output };
        match src_module.ops() {
            Some(ops) => ops.unbind(&src_module, &dst_module, output)?,
            None => src_module.detach_observer(&dst_module)?,
        }
        info!(%src, %dst, "Unbound.");
        Ok(())
    }
}
