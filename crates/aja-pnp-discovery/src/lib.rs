//! AJA PnP Discovery - Hot-plug tracking for AJA video I/O devices
//!
//! This crate keeps a live registry of attached devices and tells interested
//! parties when devices come and go:
//! - One class listener per driver class, fed by a platform hot-plug backend
//! - A registry of attached devices keyed by stable identity
//! - Typed observers and C-style (callback, user data) pairs, delivered
//!   inline or through a bounded queue and dispatch thread
//! - A broadcast stream of registry changes for async consumers

pub mod backends;
pub mod config;
pub mod dispatch;
pub mod listener;
pub mod notify;
mod registry;
pub mod scanner;
pub mod service;

pub use config::{DevfsConfig, DispatchConfig, DispatchMode, ScannerConfig, DEFAULT_DRIVER_CLASSES};
pub use dispatch::DeviceNotice;
pub use listener::{ClassListener, ListenerState};
pub use notify::{DeviceObserver, NotificationCallback, NotificationRegistry, SubscriptionId};
pub use scanner::Scanner;
pub use service::{DeviceDiscoveryService, ServiceError};
