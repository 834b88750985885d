//! In-memory hot-plug bus
//!
//! Stands in for real hardware: units are plugged and unplugged by calling
//! [`SimulatedBus::plug`] and [`SimulatedBus::unplug`], and their registers
//! are whatever the caller supplied. Arrival and removal callbacks run
//! synchronously on the thread that plugged or unplugged the unit, after the
//! bus lock has been released.

use aja_pnp_core::device::{REG_BOARD_ID, REG_SERIAL_HI, REG_SERIAL_LO};
use aja_pnp_core::{
    ArrivalCallback, ClassWatch, DriverConnection, HotplugBackend, RemovalCallback, UnitHandle,
    WatchError, WatchToken,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, trace};

#[derive(Default)]
struct BusState {
    units: HashMap<UnitHandle, HashMap<u32, u32>>,
    class_watchers: HashMap<u64, (String, ArrivalCallback)>,
    removal_watchers: HashMap<u64, (UnitHandle, RemovalCallback)>,
    failing_classes: HashSet<String>,
    fail_next_open: usize,
    next_watch: u64,
    next_slot: u64,
}

#[derive(Default)]
struct BusInner {
    state: Mutex<BusState>,
    open_connections: AtomicUsize,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle to one simulated bus
#[derive(Clone, Default)]
pub struct SimulatedBus {
    inner: Arc<BusInner>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an NTV2-style unit answering the board ID and serial registers.
    pub fn plug(&self, class_name: &str, board_id: u32, serial: u64) -> UnitHandle {
        let registers = HashMap::from([
            (REG_BOARD_ID, board_id),
            (REG_SERIAL_LO, serial as u32),
            (REG_SERIAL_HI, (serial >> 32) as u32),
        ]);
        self.plug_with_registers(class_name, registers)
    }

    /// Attach a unit with an arbitrary register file.
    pub fn plug_with_registers(&self, class_name: &str, registers: HashMap<u32, u32>) -> UnitHandle {
        let (unit, callbacks) = {
            let mut state = self.inner.lock();
            let unit = UnitHandle::new(class_name, format!("sim:{}", state.next_slot));
            state.next_slot += 1;
            state.units.insert(unit.clone(), registers);
            let callbacks: Vec<ArrivalCallback> = state
                .class_watchers
                .values()
                .filter(|(class, _)| class == class_name)
                .map(|(_, cb)| cb.clone())
                .collect();
            (unit, callbacks)
        };
        debug!(unit = %unit, watchers = callbacks.len(), "Unit plugged");
        for callback in callbacks {
            callback(vec![unit.clone()]);
        }
        unit
    }

    /// Detach a unit. Returns `false` if it was not attached.
    pub fn unplug(&self, unit: &UnitHandle) -> bool {
        let callbacks = {
            let mut state = self.inner.lock();
            if state.units.remove(unit).is_none() {
                return false;
            }
            let ids: Vec<u64> = state
                .removal_watchers
                .iter()
                .filter(|(_, (watched, _))| watched == unit)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.removal_watchers.remove(&id))
                .map(|(_, cb)| cb)
                .collect::<Vec<_>>()
        };
        debug!(unit = %unit, watchers = callbacks.len(), "Unit unplugged");
        for callback in callbacks {
            callback();
        }
        true
    }

    /// Make arming `class_name` fail from now on.
    pub fn fail_arming(&self, class_name: &str) {
        self.inner.lock().failing_classes.insert(class_name.to_string());
    }

    /// Make the next `open` fail.
    pub fn fail_open_next(&self) {
        self.inner.lock().fail_next_open += 1;
    }

    pub fn attached(&self) -> Vec<UnitHandle> {
        self.inner.lock().units.keys().cloned().collect()
    }

    /// Driver connections opened and not yet dropped
    pub fn open_connections(&self) -> usize {
        self.inner.open_connections.load(Ordering::SeqCst)
    }

    /// Armed class and removal watches
    pub fn active_watches(&self) -> usize {
        let state = self.inner.lock();
        state.class_watchers.len() + state.removal_watchers.len()
    }
}

impl HotplugBackend for SimulatedBus {
    fn name(&self) -> &str {
        "simulated"
    }

    fn watch_class(
        &self,
        class_name: &str,
        on_arrival: ArrivalCallback,
    ) -> Result<ClassWatch, WatchError> {
        let mut state = self.inner.lock();
        if state.failing_classes.contains(class_name) {
            return Err(WatchError::Arm {
                class: class_name.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        let id = state.next_watch;
        state.next_watch += 1;
        state
            .class_watchers
            .insert(id, (class_name.to_string(), on_arrival));
        let present = state
            .units
            .keys()
            .filter(|u| u.class_name() == class_name)
            .cloned()
            .collect();

        let weak = Arc::downgrade(&self.inner);
        Ok(ClassWatch {
            token: WatchToken::new(move || cancel(&weak, |s| s.class_watchers.remove(&id).is_some())),
            present,
        })
    }

    fn watch_removal(
        &self,
        unit: &UnitHandle,
        on_removal: RemovalCallback,
    ) -> Result<WatchToken, WatchError> {
        let mut state = self.inner.lock();
        if !state.units.contains_key(unit) {
            drop(state);
            trace!(unit = %unit, "Unit already gone");
            on_removal();
            return Ok(WatchToken::inert());
        }
        let id = state.next_watch;
        state.next_watch += 1;
        state.removal_watchers.insert(id, (unit.clone(), on_removal));

        let weak = Arc::downgrade(&self.inner);
        Ok(WatchToken::new(move || {
            cancel(&weak, |s| s.removal_watchers.remove(&id).is_some())
        }))
    }

    fn open(&self, unit: &UnitHandle) -> Result<Box<dyn DriverConnection>, WatchError> {
        let mut state = self.inner.lock();
        if !state.units.contains_key(unit) {
            return Err(WatchError::Detached(unit.to_string()));
        }
        if state.fail_next_open > 0 {
            state.fail_next_open -= 1;
            return Err(WatchError::Open {
                unit: unit.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.inner.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimConnection {
            bus: Arc::downgrade(&self.inner),
            unit: unit.clone(),
        }))
    }
}

fn cancel(bus: &Weak<BusInner>, remove: impl FnOnce(&mut BusState) -> bool) {
    if let Some(bus) = bus.upgrade() {
        let removed = remove(&mut bus.lock());
        trace!(removed, "Watch cancelled");
    }
}

struct SimConnection {
    bus: Weak<BusInner>,
    unit: UnitHandle,
}

impl DriverConnection for SimConnection {
    fn read_register(&self, register: u32) -> Result<u32, WatchError> {
        let bus = self
            .bus
            .upgrade()
            .ok_or_else(|| WatchError::Detached(self.unit.to_string()))?;
        let state = bus.lock();
        let registers = state
            .units
            .get(&self.unit)
            .ok_or_else(|| WatchError::Detached(self.unit.to_string()))?;
        registers
            .get(&register)
            .copied()
            .ok_or(WatchError::RegisterRead { register })
    }
}

impl Drop for SimConnection {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
