//! Configuration loading and validation

use aja_pnp_discovery::ScannerConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub discovery: ScannerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Hot-plug backend to run against
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Print events as JSON lines instead of text
    #[serde(default)]
    pub json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Driver device nodes under `discovery.devfs.root`
    Devfs,
    /// In-memory bus with no hardware behind it
    Simulated,
}

fn default_backend() -> BackendKind {
    if cfg!(unix) {
        BackendKind::Devfs
    } else {
        BackendKind::Simulated
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aja_pnp_discovery::{DispatchMode, DEFAULT_DRIVER_CLASSES};
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("aja-pnp.toml")).unwrap();
        assert_eq!(config.discovery.driver_classes, DEFAULT_DRIVER_CLASSES);
        assert!(!config.daemon.json);
    }

    #[test]
    fn test_saved_defaults_load_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aja-pnp.toml");
        save_default_config(&path).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.daemon.backend, default_backend());
        assert_eq!(config.discovery.dispatch.mode, DispatchMode::Queued);
        assert_eq!(config.discovery.event_channel_capacity, 100);
    }

    #[test]
    fn test_load_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aja-pnp.toml");
        std::fs::write(
            &path,
            r#"
            [daemon]
            backend = "simulated"
            json = true

            [discovery]
            driver_classes = ["ajantv2"]

            [discovery.devfs]
            root = "/tmp/aja"
            "#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.daemon.backend, BackendKind::Simulated);
        assert!(config.daemon.json);
        assert_eq!(config.discovery.driver_classes, vec!["ajantv2".to_string()]);
        assert_eq!(config.discovery.devfs.root, std::path::PathBuf::from("/tmp/aja"));
        assert_eq!(config.discovery.devfs.poll_interval_ms, 500);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aja-pnp.toml");
        std::fs::write(&path, "[daemon\nbackend = ").unwrap();
        assert!(load_config(&path).is_err());
    }
}
