//! Discovery over a scratch device directory
#![cfg(unix)]

use aja_pnp_core::device::{REG_BOARD_ID, REG_SERIAL_HI, REG_SERIAL_LO};
use aja_pnp_core::DeviceEvent;
use aja_pnp_discovery::backends::DevfsBackend;
use aja_pnp_discovery::{DeviceDiscoveryService, DispatchMode, ScannerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn write_node(dir: &Path, name: &str, board_id: u32, serial: u64) -> PathBuf {
    let mut image = vec![0u8; 4 * 64];
    for (reg, value) in [
        (REG_BOARD_ID, board_id),
        (REG_SERIAL_LO, serial as u32),
        (REG_SERIAL_HI, (serial >> 32) as u32),
    ] {
        let at = reg as usize * 4;
        image[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
    let path = dir.join(name);
    std::fs::write(&path, image).unwrap();
    path
}

fn service(dir: &TempDir) -> (Arc<DevfsBackend>, DeviceDiscoveryService) {
    let backend = Arc::new(DevfsBackend::new(dir.path(), None));
    let mut config = ScannerConfig::default();
    config.dispatch.mode = DispatchMode::Queued;
    config.devfs.root = dir.path().to_path_buf();
    let service = DeviceDiscoveryService::new(backend.clone(), config);
    (backend, service)
}

#[test]
fn test_nodes_present_at_start_are_listed() {
    let dir = TempDir::new().unwrap();
    write_node(dir.path(), "ajantv20", 0x10538200, 0xa1b2c3);
    write_node(dir.path(), "ajantv21", 0x10538200, 0xa1b2c4);
    std::fs::write(dir.path().join("ttyS0"), b"").unwrap();

    let (_backend, service) = service(&dir);
    let devices = service.devices();
    assert_eq!(devices.len(), 2);
    assert!(service
        .find_by_identity("0x10538200/0000000000a1b2c3")
        .is_some());
    assert_eq!(service.find_by_board_id(0x10538200).len(), 2);
}

#[test]
fn test_rescan_tracks_hotplug() {
    let dir = TempDir::new().unwrap();
    let (backend, service) = service(&dir);
    let mut events = service.events();
    assert!(service.devices().is_empty());

    let path = write_node(dir.path(), "ajantv20", 0x1234, 1);
    backend.rescan();
    assert_eq!(service.devices().len(), 1);
    let device = service.find_by_serial(1).unwrap();
    assert!(device.is_open());

    std::fs::remove_file(&path).unwrap();
    backend.rescan();
    service.flush();
    assert!(service.devices().is_empty());
    assert!(!device.is_open());

    assert_eq!(events.try_recv().unwrap().event, DeviceEvent::Added);
    assert_eq!(events.try_recv().unwrap().event, DeviceEvent::Removed);
}

#[test]
fn test_missing_directory_means_no_devices() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(DevfsBackend::new(dir.path().join("absent"), None));
    let service = DeviceDiscoveryService::new(backend, ScannerConfig::default());

    assert!(service.start().is_ok());
    assert!(service.armed_classes().is_empty());
    assert!(service.devices().is_empty());
}
