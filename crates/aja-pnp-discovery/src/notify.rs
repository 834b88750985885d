//! Observer registry for device notifications
//!
//! Two ways to subscribe share one table:
//! - typed observers ([`DeviceObserver`]), keyed by their `Arc` identity and
//!   addressed afterwards by the returned [`SubscriptionId`];
//! - plain function callbacks ([`NotificationCallback`]), keyed by the pair
//!   (function, user data) the way C-style clients expect.
//!
//! Delivery walks a snapshot taken under the read lock and invokes observers
//! with no lock held, so an observer may subscribe or unsubscribe (itself or
//! others) from inside its own notification.
//!
//! A subscriber that wants the attached devices replayed is inserted with its
//! live delivery held back; [`NotificationRegistry::replay`] then hands it the
//! replay followed by whatever arrived meanwhile, so it never hears about a
//! removal before the matching add.

use aja_pnp_core::{DeviceEvent, DeviceHandle, DeviceId};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

/// Receives device notifications
pub trait DeviceObserver: Send + Sync {
    fn on_device_event(&self, event: DeviceEvent, device: &DeviceHandle);
}

/// Function-pointer notification callback.
///
/// The `usize` is opaque user data handed back on every call.
pub type NotificationCallback = fn(DeviceEvent, usize, &DeviceHandle);

/// Handle returned by a successful subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriberKey {
    Observer(usize),
    Callback { callback: usize, user_data: usize },
}

impl SubscriberKey {
    fn observer(observer: &Arc<dyn DeviceObserver>) -> Self {
        Self::Observer(Arc::as_ptr(observer) as *const () as usize)
    }

    fn callback(callback: NotificationCallback, user_data: usize) -> Self {
        Self::Callback {
            callback: callback as usize,
            user_data,
        }
    }
}

struct CallbackObserver {
    callback: NotificationCallback,
    user_data: usize,
}

impl DeviceObserver for CallbackObserver {
    fn on_device_event(&self, event: DeviceEvent, device: &DeviceHandle) {
        (self.callback)(event, self.user_data, device);
    }
}

/// Notices held for a subscriber whose replay is still running
type Backlog = Arc<Mutex<Option<Vec<(DeviceEvent, DeviceHandle)>>>>;

struct Subscriber {
    key: SubscriberKey,
    observer: Arc<dyn DeviceObserver>,
    backlog: Backlog,
}

/// Set of subscribers, delivered to in subscription order
#[derive(Default)]
pub struct NotificationRegistry {
    subscribers: RwLock<BTreeMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a typed observer. `None` if this exact observer is already subscribed.
    pub fn subscribe(&self, observer: Arc<dyn DeviceObserver>) -> Option<SubscriptionId> {
        self.insert(SubscriberKey::observer(&observer), observer, false)
    }

    /// Add a (callback, user data) pair. `None` if the pair is already installed.
    pub fn add_callback(
        &self,
        callback: NotificationCallback,
        user_data: usize,
    ) -> Option<SubscriptionId> {
        self.add_callback_with(callback, user_data, false)
    }

    /// Like [`subscribe`](Self::subscribe), but notices are held until
    /// [`replay`](Self::replay) runs for the returned id.
    pub(crate) fn subscribe_held(&self, observer: Arc<dyn DeviceObserver>) -> Option<SubscriptionId> {
        self.insert(SubscriberKey::observer(&observer), observer, true)
    }

    pub(crate) fn add_callback_held(
        &self,
        callback: NotificationCallback,
        user_data: usize,
    ) -> Option<SubscriptionId> {
        self.add_callback_with(callback, user_data, true)
    }

    fn add_callback_with(
        &self,
        callback: NotificationCallback,
        user_data: usize,
        held: bool,
    ) -> Option<SubscriptionId> {
        let observer: Arc<dyn DeviceObserver> = Arc::new(CallbackObserver {
            callback,
            user_data,
        });
        self.insert(SubscriberKey::callback(callback, user_data), observer, held)
    }

    fn insert(
        &self,
        key: SubscriberKey,
        observer: Arc<dyn DeviceObserver>,
        held: bool,
    ) -> Option<SubscriptionId> {
        let mut subscribers = self.write();
        if subscribers.values().any(|s| s.key == key) {
            debug!(?key, "Subscriber already installed");
            return None;
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let backlog = Arc::new(Mutex::new(held.then(Vec::new)));
        subscribers.insert(
            id,
            Subscriber {
                key,
                observer,
                backlog,
            },
        );
        debug!(subscription = %id, held, "Subscriber installed");
        Some(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.write().remove(&id);
        if removed.is_some() {
            debug!(subscription = %id, "Subscriber removed");
        }
        removed.is_some()
    }

    /// Remove the (callback, user data) pair. `false` if it was not installed.
    pub fn remove_callback(&self, callback: NotificationCallback, user_data: usize) -> bool {
        match self.find(SubscriberKey::callback(callback, user_data)) {
            Some(id) => self.unsubscribe(id),
            None => false,
        }
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn has_callback(&self, callback: NotificationCallback, user_data: usize) -> bool {
        self.find(SubscriberKey::callback(callback, user_data)).is_some()
    }

    pub fn has_observer(&self, observer: &Arc<dyn DeviceObserver>) -> bool {
        self.find(SubscriberKey::observer(observer)).is_some()
    }

    fn find(&self, key: SubscriberKey) -> Option<SubscriptionId> {
        self.read()
            .iter()
            .find(|(_, s)| s.key == key)
            .map(|(id, _)| *id)
    }

    /// Replay `attached` to a subscriber inserted with held delivery, then
    /// release what was held for it and resume live delivery.
    ///
    /// Devices already terminated are skipped. Held notices are filtered so
    /// each device is added at most once and only removed after an add.
    /// Returns the number of devices replayed.
    pub(crate) fn replay(&self, id: SubscriptionId, attached: &[DeviceHandle]) -> usize {
        let Some((observer, backlog)) = self
            .read()
            .get(&id)
            .map(|s| (s.observer.clone(), s.backlog.clone()))
        else {
            return 0;
        };

        let mut announced: HashSet<DeviceId> = HashSet::new();
        for device in attached.iter().filter(|d| d.is_open()) {
            if announced.insert(device.id()) {
                observer.on_device_event(DeviceEvent::Added, device);
            }
        }
        let replayed = announced.len();

        loop {
            let held = {
                let mut backlog = lock(&backlog);
                let held = backlog.as_mut().map(std::mem::take).unwrap_or_default();
                if held.is_empty() || !self.is_subscribed(id) {
                    *backlog = None;
                    break;
                }
                held
            };
            for (event, device) in held {
                let fresh = match event {
                    DeviceEvent::Added => announced.insert(device.id()),
                    DeviceEvent::Removed => announced.remove(&device.id()),
                    _ => true,
                };
                if fresh {
                    observer.on_device_event(event, &device);
                } else {
                    trace!(subscription = %id, %event, device = %device, "Dropping notice covered by replay");
                }
            }
        }
        replayed
    }

    /// Deliver `event` to every current subscriber.
    ///
    /// Subscribers added during delivery are not called for this event;
    /// subscribers removed during delivery may still be. Subscribers still
    /// being replayed get the notice after their replay.
    pub fn notify_all(&self, event: DeviceEvent, device: &DeviceHandle) {
        let targets: Vec<(Arc<dyn DeviceObserver>, Backlog)> = self
            .read()
            .values()
            .map(|s| (s.observer.clone(), s.backlog.clone()))
            .collect();
        trace!(%event, device = %device, observers = targets.len(), "Notifying");
        for (observer, backlog) in targets {
            if let Some(held) = lock(&backlog).as_mut() {
                held.push((event, device.clone()));
                continue;
            }
            observer.on_device_event(event, device);
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop every subscriber
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.write());
        if !removed.is_empty() {
            debug!(count = removed.len(), "Notification subscribers cleared");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<SubscriptionId, Subscriber>> {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<SubscriptionId, Subscriber>> {
        self.subscribers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
