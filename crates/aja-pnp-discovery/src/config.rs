//! Scanner configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Driver classes listened for when none are configured
pub const DEFAULT_DRIVER_CLASSES: &[&str] = &["com_aja_iokit_ntv2", "com_aja_ntv4_pci", "ajantv2"];

/// Scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Driver class names to arm one listener each for
    #[serde(default = "default_driver_classes")]
    pub driver_classes: Vec<String>,
    /// Capacity of the broadcast channel behind `events()`
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
    /// How notifications reach observers
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Device-node backend settings (unix only)
    #[serde(default)]
    pub devfs: DevfsConfig,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            driver_classes: default_driver_classes(),
            event_channel_capacity: default_event_capacity(),
            dispatch: DispatchConfig::default(),
            devfs: DevfsConfig::default(),
        }
    }
}

fn default_driver_classes() -> Vec<String> {
    DEFAULT_DRIVER_CLASSES.iter().map(|s| s.to_string()).collect()
}

fn default_event_capacity() -> usize {
    100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Observers run on the thread that changed the registry
    Inline,
    /// Observers run on a dedicated dispatch thread fed by a bounded queue
    Queued,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_mode")]
    pub mode: DispatchMode,
    /// Bounded queue length for `queued` mode
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: default_dispatch_mode(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_dispatch_mode() -> DispatchMode {
    DispatchMode::Queued
}

fn default_queue_capacity() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevfsConfig {
    /// Directory holding the driver's device nodes
    #[serde(default = "default_devfs_root")]
    pub root: PathBuf,
    /// Rescan interval in milliseconds (0 disables background polling)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for DevfsConfig {
    fn default() -> Self {
        Self {
            root: default_devfs_root(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl DevfsConfig {
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }
}

fn default_devfs_root() -> PathBuf {
    PathBuf::from("/dev")
}

fn default_poll_interval() -> u64 {
    500
}
