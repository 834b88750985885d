//! Per-driver-class hot-plug listener

use aja_pnp_core::{Device, DeviceHandle, HotplugBackend, UnitHandle, WatchToken};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::registry::DeviceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Unarmed,
    Armed,
    Failed,
}

/// Watches one driver class for arrivals.
///
/// Arming registers the arrival callback with the backend and then attaches
/// every unit that already matched. Each attached device gets its own removal
/// watch, which terminates and unregisters it when the unit goes away.
pub struct ClassListener {
    class_name: String,
    state: ListenerState,
    _watch: Option<WatchToken>,
}

impl ClassListener {
    pub(crate) fn arm(
        class_name: &str,
        backend: &Arc<dyn HotplugBackend>,
        registry: &Arc<DeviceRegistry>,
    ) -> Self {
        let mut listener = Self {
            class_name: class_name.to_string(),
            state: ListenerState::Unarmed,
            _watch: None,
        };
        if class_name.is_empty() {
            warn!("Refusing to arm listener with an empty class name");
            listener.state = ListenerState::Failed;
            return listener;
        }

        let weak_backend = Arc::downgrade(backend);
        let weak_registry = Arc::downgrade(registry);
        let on_arrival = Arc::new(move |units: Vec<UnitHandle>| {
            if let (Some(backend), Some(registry)) = (weak_backend.upgrade(), weak_registry.upgrade())
            {
                attach_units(&backend, &registry, units);
            }
        });

        match backend.watch_class(class_name, on_arrival) {
            Ok(watch) => {
                listener._watch = Some(watch.token);
                attach_units(backend, registry, watch.present);
                listener.state = ListenerState::Armed;
                debug!(listener = %listener, backend = backend.name(), "Listener armed");
            }
            Err(e) => {
                warn!(class = class_name, error = %e, "Failed to arm listener");
                listener.state = ListenerState::Failed;
            }
        }
        listener
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ListenerState::Armed
    }
}

impl fmt::Display for ClassListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ready = if self.is_ready() { "Ready" } else { "Not Ready" };
        write!(f, "'{}' {}", self.class_name, ready)
    }
}

impl Drop for ClassListener {
    fn drop(&mut self) {
        debug!(class = %self.class_name, "Listener disarmed");
    }
}

/// Open, register, and watch each unit. A unit that cannot be opened or
/// duplicates a registered identity is skipped.
fn attach_units(
    backend: &Arc<dyn HotplugBackend>,
    registry: &Arc<DeviceRegistry>,
    units: Vec<UnitHandle>,
) {
    for unit in units {
        let device = match Device::open(&unit, backend.as_ref()) {
            Ok(device) => device,
            Err(e) => {
                warn!(unit = %unit, error = %e, "Failed to create device");
                continue;
            }
        };
        if !registry.add(device.clone()) {
            debug!(unit = %unit, device = %device, "Device not registered, closing");
            device.terminate();
            continue;
        }
        info!(device = %device, "Device connected");
        watch_removal(backend, registry, &unit, &device);
    }
}

fn watch_removal(
    backend: &Arc<dyn HotplugBackend>,
    registry: &Arc<DeviceRegistry>,
    unit: &UnitHandle,
    device: &DeviceHandle,
) {
    let weak_device: Weak<Device> = Arc::downgrade(device);
    let weak_registry = Arc::downgrade(registry);
    let on_removal = Box::new(move || {
        let Some(device) = weak_device.upgrade() else {
            return;
        };
        info!(device = %device, "Device disconnected");
        device.terminate();
        if let Some(registry) = weak_registry.upgrade() {
            registry.remove(&device);
        }
    });

    match backend.watch_removal(unit, on_removal) {
        Ok(token) => device.set_removal_watch(token),
        Err(e) => warn!(device = %device, error = %e, "Failed to watch for removal"),
    }
}
