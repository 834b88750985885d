//! Platform hot-plug backend contract
//!
//! Everything platform specific about discovery sits behind [`HotplugBackend`]:
//! matching units of a driver class, learning when a unit goes away, and opening
//! a driver connection that can read identification registers. The registry and
//! notification logic never see more than an opaque [`UnitHandle`].

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("failed to arm matching for class '{class}': {reason}")]
    Arm { class: String, reason: String },
    #[error("failed to open unit {unit}: {reason}")]
    Open { unit: String, reason: String },
    #[error("register {register} read failed")]
    RegisterRead { register: u32 },
    #[error("unit {0} is no longer attached")]
    Detached(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque reference to one hardware unit as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitHandle {
    class_name: String,
    location: String,
}

impl UnitHandle {
    pub fn new(class_name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            location: location.into(),
        }
    }

    /// Driver class name the platform reports for this unit
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Backend-specific location (device node path, registry path, bus slot)
    pub fn location(&self) -> &str {
        &self.location
    }
}

impl fmt::Display for UnitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.class_name, self.location)
    }
}

/// Open connection to a unit's driver.
pub trait DriverConnection: Send {
    /// Read one 32-bit register.
    fn read_register(&self, register: u32) -> Result<u32, WatchError>;

    /// Release the underlying handle. Called at most once.
    fn close(&mut self) {}
}

/// Called with every batch of newly matched units.
pub type ArrivalCallback = Arc<dyn Fn(Vec<UnitHandle>) + Send + Sync>;

/// Called once when a watched unit disappears.
pub type RemovalCallback = Box<dyn FnOnce() + Send>;

/// Keeps a platform notification armed. Dropping it disarms.
#[must_use = "dropping a WatchToken disarms the notification"]
pub struct WatchToken {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchToken {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A token with nothing to release
    pub fn inert() -> Self {
        Self { cancel: None }
    }
}

impl Drop for WatchToken {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for WatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchToken")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// A class-matching registration plus the units that already matched.
pub struct ClassWatch {
    pub token: WatchToken,
    pub present: Vec<UnitHandle>,
}

/// Platform hot-plug mechanism.
///
/// Callbacks may run on any thread, including threads the backend owns.
/// Backends must not hold internal locks while invoking them: a callback
/// is free to call back into [`open`](Self::open) and
/// [`watch_removal`](Self::watch_removal).
pub trait HotplugBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Arm first-match notifications for `class_name`.
    ///
    /// Units already attached are returned in [`ClassWatch::present`] rather
    /// than delivered through `on_arrival`; later matches go to `on_arrival`.
    fn watch_class(
        &self,
        class_name: &str,
        on_arrival: ArrivalCallback,
    ) -> Result<ClassWatch, WatchError>;

    /// Arm a one-shot notification for `unit` going away. If the unit is
    /// already gone, `on_removal` fires before this returns.
    fn watch_removal(
        &self,
        unit: &UnitHandle,
        on_removal: RemovalCallback,
    ) -> Result<WatchToken, WatchError>;

    /// Open a driver connection to `unit`. May block.
    fn open(&self, unit: &UnitHandle) -> Result<Box<dyn DriverConnection>, WatchError>;
}
