//! Device handles for attached AJA hardware

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{DriverConnection, HotplugBackend, UnitHandle, WatchError, WatchToken};
use crate::identity::DeviceIdentity;

/// Board ID register
pub const REG_BOARD_ID: u32 = 50;
/// Serial number, low 32 bits
pub const REG_SERIAL_LO: u32 = 54;
/// Serial number, high 32 bits
pub const REG_SERIAL_HI: u32 = 55;

/// Shared handle to an attached device. The last holder drops the device.
pub type DeviceHandle = Arc<Device>;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique slot number assigned to every device at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl DeviceId {
    fn next() -> Self {
        Self(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Driver interface family a device speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InterfaceName {
    Ntv2,
    Ntv4,
}

impl InterfaceName {
    /// Infer the interface from a driver class name, or `None` if the
    /// class is not an AJA driver.
    pub fn for_class(class_name: &str) -> Option<Self> {
        let lower = class_name.to_ascii_lowercase();
        if lower.contains("ntv4") {
            Some(Self::Ntv4)
        } else if lower.contains("ntv2") || lower.starts_with("com_aja_iokit_") {
            Some(Self::Ntv2)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ntv2 => "NTV2",
            Self::Ntv4 => "NTV4",
        }
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification messages delivered to observers.
///
/// Only `Added` and `Removed` are emitted today; the rest are reserved
/// for power-state reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEvent {
    /// The device was connected
    Added,
    /// The device was disconnected
    Removed,
    /// Reserved: the device became available for use
    Online,
    /// Reserved: the device became unavailable for use
    Offline,
    /// Reserved: the device entered a low-power state
    GoingToSleep,
    /// Reserved: the device left its low-power state
    WakingUp,
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Added => "device added",
            Self::Removed => "device removed",
            Self::Online => "device online",
            Self::Offline => "device offline",
            Self::GoingToSleep => "device going to sleep",
            Self::WakingUp => "device waking up",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum OpenError {
    #[error("unrecognized device class '{0}'")]
    UnknownClass(String),
    #[error("failed to open driver connection: {0}")]
    Connection(#[source] WatchError),
    #[error("failed to read identification registers: {0}")]
    Identification(#[source] WatchError),
}

/// One attached unit.
///
/// A device is created by a class listener when the platform reports a new
/// unit and is terminated when the platform reports it gone. Termination closes
/// the driver connection and releases the removal watch; it is idempotent and
/// cannot be undone. Clients may keep a handle past termination, in which case
/// [`is_open`](Self::is_open) reports `false`.
pub struct Device {
    id: DeviceId,
    class_name: String,
    interface: InterfaceName,
    identity: DeviceIdentity,
    attached_at: DateTime<Utc>,
    connection: Mutex<Option<Box<dyn DriverConnection>>>,
    removal_watch: Mutex<Option<WatchToken>>,
}

impl Device {
    /// Open the unit and read its identity.
    ///
    /// The connection is closed again if the unit cannot be identified, so a
    /// failed open never leaves a half-built device behind.
    pub fn open(unit: &UnitHandle, backend: &dyn HotplugBackend) -> Result<DeviceHandle, OpenError> {
        let class_name = unit.class_name();
        let interface = InterfaceName::for_class(class_name)
            .ok_or_else(|| OpenError::UnknownClass(class_name.to_string()))?;

        let mut connection = backend.open(unit).map_err(OpenError::Connection)?;

        let identity = match interface {
            InterfaceName::Ntv2 => match read_ntv2_identity(connection.as_ref()) {
                Ok(identity) => identity,
                Err(e) => {
                    connection.close();
                    return Err(OpenError::Identification(e));
                }
            },
            InterfaceName::Ntv4 => {
                warn!(unit = %unit, "NTV4 identification is not supported, registering without identity");
                DeviceIdentity::unknown()
            }
        };

        Ok(Arc::new(Self::from_parts(class_name, interface, identity, connection)))
    }

    /// Assemble a device around an already-open connection.
    pub fn from_parts(
        class_name: impl Into<String>,
        interface: InterfaceName,
        identity: DeviceIdentity,
        connection: Box<dyn DriverConnection>,
    ) -> Self {
        Self {
            id: DeviceId::next(),
            class_name: class_name.into(),
            interface,
            identity,
            attached_at: Utc::now(),
            connection: Mutex::new(Some(connection)),
            removal_watch: Mutex::new(None),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn interface(&self) -> InterfaceName {
        self.interface
    }

    pub fn has_ntv2_interface(&self) -> bool {
        self.interface == InterfaceName::Ntv2
    }

    pub fn has_ntv4_interface(&self) -> bool {
        self.interface == InterfaceName::Ntv4
    }

    /// Stable for the device's lifetime
    pub fn identifier(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn attached_at(&self) -> DateTime<Utc> {
        self.attached_at
    }

    /// True while the driver connection is live
    pub fn is_open(&self) -> bool {
        lock(&self.connection).is_some()
    }

    /// Read a register through the device's driver connection.
    pub fn read_register(&self, register: u32) -> Result<u32, WatchError> {
        match lock(&self.connection).as_ref() {
            Some(conn) => conn.read_register(register),
            None => Err(WatchError::Detached(self.to_string())),
        }
    }

    /// Attach the platform's removal notification. A device that was already
    /// terminated releases the token immediately.
    pub fn set_removal_watch(&self, token: WatchToken) {
        // Lock order matches terminate(): watch, then connection
        let rejected = {
            let mut watch = lock(&self.removal_watch);
            if lock(&self.connection).is_some() {
                *watch = Some(token);
                None
            } else {
                Some(token)
            }
        };
        drop(rejected);
    }

    /// Close the driver connection and release the removal watch.
    ///
    /// Safe to call from any thread and any number of times.
    pub fn terminate(&self) {
        let (watch, connection) = {
            let mut watch = lock(&self.removal_watch);
            (watch.take(), lock(&self.connection).take())
        };
        drop(watch);

        if let Some(mut conn) = connection {
            conn.close();
            info!(device = %self, "Device closed");
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.terminate();
        debug!(id = %self.id, identity = %self.identity, "Device released");
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.interface, self.class_name, self.identity)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("class_name", &self.class_name)
            .field("interface", &self.interface)
            .field("identity", &self.identity)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Human-readable listing: a count line followed by one indexed line per device
pub struct DeviceList<'a>(pub &'a [DeviceHandle]);

impl fmt::Display for DeviceList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} device(s)", self.0.len())?;
        for (ndx, device) in self.0.iter().enumerate() {
            writeln!(f, "{ndx}:  {device}")?;
        }
        Ok(())
    }
}

/// Board ID must be readable; an unreadable serial number encodes as zero.
fn read_ntv2_identity(conn: &dyn DriverConnection) -> Result<DeviceIdentity, WatchError> {
    let board_id = conn.read_register(REG_BOARD_ID)?;
    let serial = match (
        conn.read_register(REG_SERIAL_LO),
        conn.read_register(REG_SERIAL_HI),
    ) {
        (Ok(lo), Ok(hi)) => (u64::from(hi) << 32) | u64::from(lo),
        _ => {
            debug!(board_id = format_args!("{board_id:#010x}"), "Serial number registers unreadable");
            0
        }
    };
    Ok(DeviceIdentity::new(board_id, serial))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ArrivalCallback, ClassWatch, RemovalCallback};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    struct FakeConnection {
        registers: HashMap<u32, u32>,
        closes: Arc<AtomicUsize>,
    }

    impl DriverConnection for FakeConnection {
        fn read_register(&self, register: u32) -> Result<u32, WatchError> {
            self.registers
                .get(&register)
                .copied()
                .ok_or(WatchError::RegisterRead { register })
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeBackend {
        registers: HashMap<u32, u32>,
        closes: Arc<AtomicUsize>,
    }

    impl FakeBackend {
        fn new(registers: &[(u32, u32)]) -> Self {
            Self {
                registers: registers.iter().copied().collect(),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl HotplugBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        fn watch_class(&self, _: &str, _: ArrivalCallback) -> Result<ClassWatch, WatchError> {
            Ok(ClassWatch {
                token: WatchToken::inert(),
                present: Vec::new(),
            })
        }

        fn watch_removal(&self, _: &UnitHandle, _: RemovalCallback) -> Result<WatchToken, WatchError> {
            Ok(WatchToken::inert())
        }

        fn open(&self, _: &UnitHandle) -> Result<Box<dyn DriverConnection>, WatchError> {
            Ok(Box::new(FakeConnection {
                registers: self.registers.clone(),
                closes: self.closes.clone(),
            }))
        }
    }

    #[test]
    fn test_interface_for_class() {
        assert_eq!(InterfaceName::for_class("com_aja_iokit_ntv2"), Some(InterfaceName::Ntv2));
        assert_eq!(InterfaceName::for_class("com_aja_iokit_kona"), Some(InterfaceName::Ntv2));
        assert_eq!(InterfaceName::for_class("ajantv2"), Some(InterfaceName::Ntv2));
        assert_eq!(InterfaceName::for_class("com_aja_ntv4_pci"), Some(InterfaceName::Ntv4));
        assert_eq!(InterfaceName::for_class("IOPCIDevice"), None);
    }

    #[test]
    fn test_open_reads_identity_registers() {
        let backend = FakeBackend::new(&[
            (REG_BOARD_ID, 0x10538200),
            (REG_SERIAL_LO, 0x00a1b2c3),
            (REG_SERIAL_HI, 0x1),
        ]);
        let unit = UnitHandle::new("ajantv2", "/dev/ajantv20");
        let device = Device::open(&unit, &backend).unwrap();

        assert!(device.is_open());
        assert!(device.has_ntv2_interface());
        assert_eq!(device.identifier().as_str(), "0x10538200/0000000100a1b2c3");
        assert_eq!(device.to_string(), "NTV2://ajantv2/0x10538200/0000000100a1b2c3");
    }

    #[test]
    fn test_open_without_serial_uses_zero() {
        let backend = FakeBackend::new(&[(REG_BOARD_ID, 0x1234)]);
        let unit = UnitHandle::new("ajantv2", "/dev/ajantv20");
        let device = Device::open(&unit, &backend).unwrap();
        assert_eq!(device.identifier().serial(), Some(0));
    }

    #[test]
    fn test_open_rolls_back_without_board_id() {
        let backend = FakeBackend::new(&[]);
        let unit = UnitHandle::new("ajantv2", "/dev/ajantv20");
        let result = Device::open(&unit, &backend);
        assert!(matches!(result, Err(OpenError::Identification(_))));
        assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_rejects_unknown_class() {
        let backend = FakeBackend::new(&[(REG_BOARD_ID, 0x1234)]);
        let unit = UnitHandle::new("IOPCIDevice", "pci0");
        assert!(matches!(
            Device::open(&unit, &backend),
            Err(OpenError::UnknownClass(_))
        ));
    }

    #[test]
    fn test_ntv4_has_unknown_identity() {
        let backend = FakeBackend::new(&[]);
        let unit = UnitHandle::new("com_aja_ntv4_pci", "pci1");
        let device = Device::open(&unit, &backend).unwrap();
        assert!(device.has_ntv4_interface());
        assert!(device.identifier().is_unknown());
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let backend = FakeBackend::new(&[(REG_BOARD_ID, 0x1234)]);
        let unit = UnitHandle::new("ajantv2", "/dev/ajantv20");
        let device = Device::open(&unit, &backend).unwrap();

        device.terminate();
        device.terminate();
        assert!(!device.is_open());
        assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
        assert!(matches!(device.read_register(REG_BOARD_ID), Err(WatchError::Detached(_))));

        drop(device);
        assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removal_watch_released_on_terminate() {
        let backend = FakeBackend::new(&[(REG_BOARD_ID, 0x1234)]);
        let unit = UnitHandle::new("ajantv2", "/dev/ajantv20");
        let device = Device::open(&unit, &backend).unwrap();

        let released = Arc::new(AtomicUsize::new(0));
        let r = released.clone();
        device.set_removal_watch(WatchToken::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        device.terminate();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removal_watch_set_after_terminate_is_released() {
        let backend = FakeBackend::new(&[(REG_BOARD_ID, 0x1234)]);
        let unit = UnitHandle::new("ajantv2", "/dev/ajantv20");
        let device = Device::open(&unit, &backend).unwrap();
        device.terminate();

        let released = Arc::new(AtomicUsize::new(0));
        let r = released.clone();
        device.set_removal_watch(WatchToken::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removal_watch_racing_terminate_is_never_kept() {
        let backend = FakeBackend::new(&[(REG_BOARD_ID, 0x1234)]);
        let unit = UnitHandle::new("ajantv2", "/dev/ajantv20");
        let released = Arc::new(AtomicUsize::new(0));
        let mut devices = Vec::new();

        for _ in 0..200 {
            let device = Device::open(&unit, &backend).unwrap();
            let terminator = {
                let device = device.clone();
                std::thread::spawn(move || device.terminate())
            };
            let r = released.clone();
            device.set_removal_watch(WatchToken::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }));
            terminator.join().unwrap();
            // Handles stay alive, so only terminate() or the rejection can release
            devices.push(device);
        }
        assert_eq!(released.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn test_device_ids_are_unique() {
        let backend = FakeBackend::new(&[(REG_BOARD_ID, 0x1234)]);
        let unit = UnitHandle::new("ajantv2", "/dev/ajantv20");
        let a = Device::open(&unit, &backend).unwrap();
        let b = Device::open(&unit, &backend).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_device_list_display() {
        let backend = FakeBackend::new(&[(REG_BOARD_ID, 0x1234)]);
        let unit = UnitHandle::new("ajantv2", "/dev/ajantv20");
        let devices = vec![Device::open(&unit, &backend).unwrap()];
        let text = DeviceList(&devices).to_string();
        assert!(text.starts_with("1 device(s)\n0:  NTV2://ajantv2/0x00001234/"));
    }
}
