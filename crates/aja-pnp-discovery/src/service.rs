//! Device discovery service
//!
//! [`DeviceDiscoveryService`] owns the device registry, the notification
//! registry, and a lazily started [`Scanner`]. The scanner starts on the first
//! query or subscription (or an explicit [`start`](DeviceDiscoveryService::start))
//! and runs until [`shutdown`](DeviceDiscoveryService::shutdown) or drop.
//!
//! Every method may block: starting the scanner opens every attached unit,
//! and subscribing waits for queued notifications to drain. From async code,
//! call through `tokio::task::spawn_blocking`.

use aja_pnp_core::identity::{encode_board_id, encode_serial};
use aja_pnp_core::{DeviceHandle, DeviceId, HotplugBackend, InterfaceName};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::dispatch::DeviceNotice;
use crate::notify::{DeviceObserver, NotificationCallback, NotificationRegistry, SubscriptionId};
use crate::registry::DeviceRegistry;
use crate::scanner::Scanner;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("device scanner unavailable: {0}")]
    Unavailable(String),
    #[error("device discovery has been shut down")]
    ShutDown,
}

const IDLE: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const UNAVAILABLE: u8 = 3;
const SHUT_DOWN: u8 = 4;

/// Discovery entry point: queries, subscriptions, and lifecycle
pub struct DeviceDiscoveryService {
    config: ScannerConfig,
    backend: Arc<dyn HotplugBackend>,
    registry: Arc<DeviceRegistry>,
    notifications: Arc<NotificationRegistry>,
    status: AtomicU8,
    /// Thread building the scanner while status is `STARTING`
    starter: Mutex<Option<ThreadId>>,
    start_done: Condvar,
    scanner: Mutex<Option<Scanner>>,
}

impl DeviceDiscoveryService {
    pub fn new(backend: Arc<dyn HotplugBackend>, config: ScannerConfig) -> Self {
        let notifications = Arc::new(NotificationRegistry::new());
        let registry = Arc::new(DeviceRegistry::new(&config, notifications.clone()));
        debug!(backend = backend.name(), classes = ?config.driver_classes, "Device discovery created");
        Self {
            config,
            backend,
            registry,
            notifications,
            status: AtomicU8::new(IDLE),
            starter: Mutex::new(None),
            start_done: Condvar::new(),
            scanner: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Start the scanner now instead of on first use.
    pub fn start(&self) -> Result<(), ServiceError> {
        if self.ensure_started() {
            return Ok(());
        }
        match self.status.load(Ordering::Acquire) {
            SHUT_DOWN => Err(ServiceError::ShutDown),
            _ => Err(ServiceError::Unavailable(
                "device scanner failed to start".to_string(),
            )),
        }
    }

    /// True once the scanner is running (or being started by another thread)
    pub fn is_running(&self) -> bool {
        matches!(self.status.load(Ordering::Acquire), STARTING | RUNNING)
    }

    /// Start the scanner if nobody has. Returns whether it is alive.
    ///
    /// Only the thread that wins the transition out of `IDLE` builds the
    /// scanner, and it does so without holding any lock, so listeners and
    /// observers triggered during start may call back into the service.
    /// Every other caller waits until the start has finished.
    fn ensure_started(&self) -> bool {
        match self
            .status
            .compare_exchange(IDLE, STARTING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return self.run_start(),
            Err(STARTING) => {}
            Err(RUNNING) => return true,
            Err(_) => return false,
        }

        let mut starter = self.lock_starter();
        if *starter == Some(thread::current().id()) {
            return true;
        }
        while self.status.load(Ordering::Acquire) == STARTING {
            starter = self
                .start_done
                .wait(starter)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(starter);
        self.status.load(Ordering::Acquire) == RUNNING
    }

    fn run_start(&self) -> bool {
        *self.lock_starter() = Some(thread::current().id());
        let running = self.build_scanner();
        // Status has already left STARTING; waiters re-check it under this lock
        *self.lock_starter() = None;
        self.start_done.notify_all();
        running
    }

    fn build_scanner(&self) -> bool {
        match Scanner::start(&self.config.driver_classes, &self.backend, &self.registry) {
            Ok(scanner) => {
                *self.lock_scanner() = Some(scanner);
                if self
                    .status
                    .compare_exchange(STARTING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Shut down while starting
                    let scanner = self.lock_scanner().take();
                    drop(scanner);
                    return false;
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "Device scanner unavailable");
                let _ = self.status.compare_exchange(
                    STARTING,
                    UNAVAILABLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                false
            }
        }
    }

    /// Stop listening, deliver pending notifications, then drop subscribers
    /// and devices. Idempotent; later calls and queries are no-ops.
    pub fn shutdown(&self) {
        if self.status.swap(SHUT_DOWN, Ordering::AcqRel) == SHUT_DOWN {
            return;
        }
        info!("Shutting down device discovery");
        {
            let _starter = self.lock_starter();
            self.start_done.notify_all();
        }
        let scanner = self.lock_scanner().take();
        drop(scanner);
        // Changes made before shutdown still reach their observers
        self.registry.flush();
        self.notifications.clear();
        self.registry.clear();
        self.registry.close_dispatch();
    }

    /// Driver classes with an armed listener
    pub fn armed_classes(&self) -> Vec<String> {
        self.ensure_started();
        self.lock_scanner()
            .as_ref()
            .map(Scanner::armed_classes)
            .unwrap_or_default()
    }

    /// Every attached device, oldest first
    pub fn devices(&self) -> Vec<DeviceHandle> {
        if !self.ensure_started() {
            return Vec::new();
        }
        self.registry.snapshot(|_| true)
    }

    pub fn devices_with_interface(&self, interface: InterfaceName) -> Vec<DeviceHandle> {
        if !self.ensure_started() {
            return Vec::new();
        }
        self.registry.snapshot(|d| d.interface() == interface)
    }

    pub fn ntv2_devices(&self) -> Vec<DeviceHandle> {
        self.devices_with_interface(InterfaceName::Ntv2)
    }

    pub fn ntv4_devices(&self) -> Vec<DeviceHandle> {
        self.devices_with_interface(InterfaceName::Ntv4)
    }

    /// Every device whose identity carries `board_id`
    pub fn find_by_board_id(&self, board_id: u32) -> Vec<DeviceHandle> {
        if !self.ensure_started() {
            return Vec::new();
        }
        let needle = format!("0x{}/", encode_board_id(board_id));
        self.registry
            .snapshot(|d| d.identifier().as_str().contains(&needle))
    }

    /// First device (oldest) whose identity carries `serial`
    pub fn find_by_serial(&self, serial: u64) -> Option<DeviceHandle> {
        if !self.ensure_started() {
            return None;
        }
        let needle = format!("/{}", encode_serial(serial));
        self.registry
            .snapshot(|d| d.identifier().as_str().contains(&needle))
            .into_iter()
            .next()
    }

    /// Exact identity match
    pub fn find_by_identity(&self, identity: &str) -> Option<DeviceHandle> {
        if !self.ensure_started() {
            return None;
        }
        self.registry.find_by_identity(identity)
    }

    pub fn find_by_id(&self, id: DeviceId) -> Option<DeviceHandle> {
        if !self.ensure_started() {
            return None;
        }
        self.registry.find_by_id(id)
    }

    /// Subscribe a typed observer.
    ///
    /// With `replay_attached`, the observer first receives a synthetic
    /// `Added` for every device already attached, on the calling thread and
    /// before this returns. Changes that race with the replay are delivered
    /// after it, without repeating a replayed add. Returns `None` if the
    /// observer is already subscribed or the service has shut down.
    pub fn subscribe(
        &self,
        observer: Arc<dyn DeviceObserver>,
        replay_attached: bool,
    ) -> Option<SubscriptionId> {
        self.install(replay_attached, |held| {
            if held {
                self.notifications.subscribe_held(observer)
            } else {
                self.notifications.subscribe(observer)
            }
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.notifications.unsubscribe(id)
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.notifications.is_subscribed(id)
    }

    /// Install a (callback, user data) pair. `false` if the pair is already
    /// installed or the service has shut down.
    pub fn add_notification_callback(
        &self,
        callback: NotificationCallback,
        user_data: usize,
        replay_attached: bool,
    ) -> bool {
        self.install(replay_attached, |held| {
            if held {
                self.notifications.add_callback_held(callback, user_data)
            } else {
                self.notifications.add_callback(callback, user_data)
            }
        })
        .is_some()
    }

    pub fn remove_notification_callback(&self, callback: NotificationCallback, user_data: usize) -> bool {
        self.notifications.remove_callback(callback, user_data)
    }

    pub fn has_installed_notification_callback(
        &self,
        callback: NotificationCallback,
        user_data: usize,
    ) -> bool {
        self.notifications.has_callback(callback, user_data)
    }

    fn install<F>(&self, replay_attached: bool, insert: F) -> Option<SubscriptionId>
    where
        F: FnOnce(bool) -> Option<SubscriptionId>,
    {
        if self.status.load(Ordering::Acquire) == SHUT_DOWN {
            return None;
        }
        // Devices found at start are announced before the new subscriber exists
        let running = self.ensure_started();
        self.registry.flush();

        let replay = replay_attached && running;
        let id = insert(replay)?;
        if replay {
            let attached = self.registry.snapshot(|_| true);
            let replayed = self.notifications.replay(id, &attached);
            debug!(subscription = %id, devices = replayed, "Replayed attached devices");
        }
        Some(id)
    }

    /// Live stream of registry changes.
    ///
    /// A receiver that falls more than `event_channel_capacity` notices
    /// behind gets `RecvError::Lagged`.
    pub fn events(&self) -> broadcast::Receiver<DeviceNotice> {
        self.registry.events()
    }

    /// Wait until every notification queued so far has been delivered.
    pub fn flush(&self) {
        self.registry.flush();
    }

    fn lock_starter(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.starter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_scanner(&self) -> MutexGuard<'_, Option<Scanner>> {
        self.scanner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DeviceDiscoveryService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
