//! Set of armed class listeners

use aja_pnp_core::HotplugBackend;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::listener::ClassListener;
use crate::registry::DeviceRegistry;
use crate::service::ServiceError;

/// One listener per configured driver class that armed successfully.
///
/// Listeners that fail to arm are discarded at start. Dropping the scanner
/// disarms every listener; devices already registered stay registered.
pub struct Scanner {
    listeners: Vec<ClassListener>,
}

impl Scanner {
    pub(crate) fn start(
        classes: &[String],
        backend: &Arc<dyn HotplugBackend>,
        registry: &Arc<DeviceRegistry>,
    ) -> Result<Self, ServiceError> {
        if classes.is_empty() {
            return Err(ServiceError::Unavailable(
                "no driver classes configured".to_string(),
            ));
        }

        let mut listeners = Vec::new();
        listeners
            .try_reserve(classes.len())
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        for class in classes {
            let listener = ClassListener::arm(class, backend, registry);
            if listener.is_ready() {
                listeners.push(listener);
            } else {
                warn!(listener = %listener, "Discarding listener");
            }
        }

        info!(
            backend = backend.name(),
            armed = listeners.len(),
            configured = classes.len(),
            devices = registry.len(),
            "Device scanner started"
        );
        Ok(Self { listeners })
    }

    /// Class names with an armed listener, in configuration order
    pub fn armed_classes(&self) -> Vec<String> {
        self.listeners
            .iter()
            .map(|l| l.class_name().to_string())
            .collect()
    }

    pub fn listeners(&self) -> &[ClassListener] {
        &self.listeners
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        debug!(listeners = self.listeners.len(), "Device scanner stopping");
    }
}
