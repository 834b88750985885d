//! Printable device and event records

use aja_pnp_core::{Device, DeviceEvent, DeviceId, DeviceIdentity, DeviceList, InterfaceName};
use aja_pnp_discovery::DeviceNotice;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub interface: InterfaceName,
    pub class_name: String,
    pub identity: DeviceIdentity,
    pub board_id: Option<u32>,
    pub serial: Option<u64>,
    pub attached_at: DateTime<Utc>,
    pub open: bool,
}

impl From<&Device> for DeviceSummary {
    fn from(device: &Device) -> Self {
        let identity = device.identifier().clone();
        Self {
            id: device.id(),
            interface: device.interface(),
            class_name: device.class_name().to_string(),
            board_id: identity.board_id(),
            serial: identity.serial(),
            identity,
            attached_at: device.attached_at(),
            open: device.is_open(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub event: DeviceEvent,
    pub at: DateTime<Utc>,
    pub device: DeviceSummary,
}

impl From<&DeviceNotice> for EventRecord {
    fn from(notice: &DeviceNotice) -> Self {
        Self {
            event: notice.event,
            at: Utc::now(),
            device: DeviceSummary::from(notice.device.as_ref()),
        }
    }
}

/// Device listing as text (`N device(s)` plus one line each) or a JSON array
pub fn format_devices(devices: &[aja_pnp_core::DeviceHandle], json: bool) -> Result<String> {
    if json {
        let summaries: Vec<DeviceSummary> =
            devices.iter().map(|d| DeviceSummary::from(d.as_ref())).collect();
        Ok(serde_json::to_string_pretty(&summaries)?)
    } else {
        Ok(DeviceList(devices).to_string())
    }
}

/// One line per notice
pub fn format_notice(notice: &DeviceNotice, json: bool) -> Result<String> {
    if json {
        Ok(serde_json::to_string(&EventRecord::from(notice))?)
    } else {
        Ok(format!("{}: {}", notice.event, notice.device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aja_pnp_core::{DriverConnection, WatchError};
    use std::sync::Arc;

    struct NullConnection;

    impl DriverConnection for NullConnection {
        fn read_register(&self, register: u32) -> Result<u32, WatchError> {
            Err(WatchError::RegisterRead { register })
        }
    }

    fn device() -> aja_pnp_core::DeviceHandle {
        Arc::new(Device::from_parts(
            "ajantv2",
            InterfaceName::Ntv2,
            DeviceIdentity::new(0x10538200, 0xa1b2c3),
            Box::new(NullConnection),
        ))
    }

    #[test]
    fn test_device_summary_json() {
        let text = format_devices(&[device()], true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let first = &value[0];
        assert_eq!(first["interface"], "NTV2");
        assert_eq!(first["identity"], "0x10538200/0000000000a1b2c3");
        assert_eq!(first["board_id"], 0x10538200u32);
        assert_eq!(first["open"], true);
    }

    #[test]
    fn test_notice_text() {
        let notice = DeviceNotice {
            event: DeviceEvent::Removed,
            device: device(),
        };
        assert_eq!(
            format_notice(&notice, false).unwrap(),
            "device removed: NTV2://ajantv2/0x10538200/0000000000a1b2c3"
        );
        let json: serde_json::Value =
            serde_json::from_str(&format_notice(&notice, true).unwrap()).unwrap();
        assert_eq!(json["event"], "removed");
    }

    #[test]
    fn test_empty_listing() {
        assert_eq!(format_devices(&[], false).unwrap(), "0 device(s)\n");
    }
}
