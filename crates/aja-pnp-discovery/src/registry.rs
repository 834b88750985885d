//! Set of attached devices
//!
//! Devices are keyed by their [`DeviceId`] slot, with a secondary index on
//! identity so at most one device per identity is ever registered. Every
//! successful add and remove is handed to the dispatcher after the table lock
//! is released.

use aja_pnp_core::{Device, DeviceEvent, DeviceHandle, DeviceId, DeviceIdentity};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::ScannerConfig;
use crate::dispatch::{DeviceNotice, Dispatcher};
use crate::notify::NotificationRegistry;

#[derive(Default)]
struct Entries {
    by_id: HashMap<DeviceId, DeviceHandle>,
    by_identity: HashMap<DeviceIdentity, DeviceId>,
    closed: bool,
}

pub(crate) struct DeviceRegistry {
    entries: RwLock<Entries>,
    dispatcher: Dispatcher,
}

impl DeviceRegistry {
    pub(crate) fn new(config: &ScannerConfig, notifications: Arc<NotificationRegistry>) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            dispatcher: Dispatcher::new(
                config.dispatch.mode,
                config.dispatch.queue_capacity,
                notifications,
                config.event_channel_capacity,
            ),
        }
    }

    /// Register a device and announce it.
    ///
    /// Fails if the device, or another device with the same identity, is
    /// already present, or once the registry has been cleared for shutdown.
    pub(crate) fn add(&self, device: DeviceHandle) -> bool {
        {
            let mut entries = self.write();
            if entries.closed {
                debug!(device = %device, "Registry closed, not adding");
                return false;
            }
            if entries.by_id.contains_key(&device.id())
                || entries.by_identity.contains_key(device.identifier())
            {
                debug!(device = %device, "Device already registered");
                return false;
            }
            if entries.by_id.try_reserve(1).is_err() || entries.by_identity.try_reserve(1).is_err() {
                warn!(device = %device, "Out of memory registering device");
                return false;
            }
            entries.by_id.insert(device.id(), device.clone());
            entries
                .by_identity
                .insert(device.identifier().clone(), device.id());
        }
        info!(device = %device, id = %device.id(), "Device registered");
        self.dispatcher.dispatch(DeviceEvent::Added, &device);
        true
    }

    /// Unregister a device and announce it.
    ///
    /// Removing a device that is not registered is a bookkeeping error; it
    /// is logged and reported as `false`.
    pub(crate) fn remove(&self, device: &Device) -> bool {
        let (removed, closed) = {
            let mut entries = self.write();
            let removed = entries.by_id.remove(&device.id());
            if removed.is_some() && entries.by_identity.get(device.identifier()) == Some(&device.id()) {
                entries.by_identity.remove(device.identifier());
            }
            (removed, entries.closed)
        };
        match removed {
            Some(handle) => {
                info!(device = %handle, id = %handle.id(), "Device unregistered");
                self.dispatcher.dispatch(DeviceEvent::Removed, &handle);
                true
            }
            None if closed => {
                debug!(device = %device, "Registry closed, ignoring removal");
                false
            }
            None => {
                error!(device = %device, id = %device.id(), "Device being removed is not registered");
                false
            }
        }
    }

    pub(crate) fn find_by_id(&self, id: DeviceId) -> Option<DeviceHandle> {
        self.read().by_id.get(&id).cloned()
    }

    /// Exact identity lookup
    pub(crate) fn find_by_identity(&self, identity: &str) -> Option<DeviceHandle> {
        let entries = self.read();
        let id = entries.by_identity.get(identity)?;
        entries.by_id.get(id).cloned()
    }

    /// Handles for every device matching `predicate`, oldest first
    pub(crate) fn snapshot<F>(&self, predicate: F) -> Vec<DeviceHandle>
    where
        F: Fn(&Device) -> bool,
    {
        let mut devices: Vec<DeviceHandle> = self
            .read()
            .by_id
            .values()
            .filter(|d| predicate(d))
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.id());
        devices
    }

    pub(crate) fn len(&self) -> usize {
        self.read().by_id.len()
    }

    /// Drop every device without announcing it and refuse further adds.
    /// Returns the number of devices released.
    pub(crate) fn clear(&self) -> usize {
        let drained = {
            let mut entries = self.write();
            entries.closed = true;
            entries.by_identity.clear();
            std::mem::take(&mut entries.by_id)
        };
        let count = drained.len();
        if count > 0 {
            info!(count, "Device registry cleared");
        }
        count
    }

    pub(crate) fn events(&self) -> broadcast::Receiver<DeviceNotice> {
        self.dispatcher.subscribe()
    }

    pub(crate) fn flush(&self) {
        self.dispatcher.flush();
    }

    pub(crate) fn close_dispatch(&self) {
        self.dispatcher.close();
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}
