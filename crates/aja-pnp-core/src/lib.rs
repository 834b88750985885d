//! AJA PnP Core - Device identities, device handles, and the backend contract
//!
//! This crate provides the foundational types for AJA device discovery:
//! - Device identity encoding/decoding (`0x<board id>/<serial>`)
//! - Reference-counted device handles with idempotent termination
//! - The hot-plug backend contract platform listeners implement

pub mod backend;
pub mod device;
pub mod identity;

pub use backend::{
    ArrivalCallback, ClassWatch, DriverConnection, HotplugBackend, RemovalCallback, UnitHandle,
    WatchError, WatchToken,
};
pub use device::{
    Device, DeviceEvent, DeviceHandle, DeviceId, DeviceList, InterfaceName, OpenError,
};
pub use identity::{DeviceIdentity, IdentityError};
