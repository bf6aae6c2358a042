//! Storage Backend Adapters
//!
//! Adapters are created by [`BackendFactory`] from configuration and held in
//! a [`BackendRegistry`] keyed by backend name. The registry is resolved
//! once at startup; pools refer to their backend by that name.

pub mod simulated;

pub use simulated::*;

use crate::domain::ports::StorageAdapterRef;
use crate::error::{Error, Result};
use backoff::ExponentialBackoffBuilder;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One configured backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Registry name pools refer to
    pub name: String,
    /// Adapter implementation
    #[serde(rename = "type")]
    pub backend_type: String,
    /// Adapter-specific settings
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

/// Factory for creating storage backend adapters
pub struct BackendFactory;

impl BackendFactory {
    /// Create an adapter for a configured backend
    pub fn create(config: &BackendConfig) -> Result<StorageAdapterRef> {
        match config.backend_type.to_lowercase().as_str() {
            SIMULATED_BACKEND | "memory" => {
                let mut array_config = SimulatedArrayConfig::default();
                array_config.apply_settings(&config.settings)?;
                Ok(Arc::new(SimulatedArray::new(array_config)))
            }
            other => Err(Error::Configuration(format!(
                "backend {} has unknown type {}",
                config.name, other
            ))),
        }
    }
}

/// Backend name to adapter lookup
#[derive(Default)]
pub struct BackendRegistry {
    adapters: RwLock<BTreeMap<String, StorageAdapterRef>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configuration
    pub fn from_configs(configs: &[BackendConfig]) -> Result<Self> {
        let registry = Self::new();
        for config in configs {
            registry.register(&config.name, BackendFactory::create(config)?)?;
        }
        Ok(registry)
    }

    pub fn register(&self, name: &str, adapter: StorageAdapterRef) -> Result<()> {
        let mut adapters = self.adapters.write();
        if adapters.contains_key(name) {
            return Err(Error::Configuration(format!("backend {} registered twice", name)));
        }
        info!(backend = name, backend_type = adapter.backend_type(), "Registered storage backend");
        adapters.insert(name.to_string(), adapter);
        Ok(())
    }

    /// Resolve an adapter by name
    pub fn get(&self, name: &str) -> Result<StorageAdapterRef> {
        self.adapters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "storage_backend".to_string(),
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.read().keys().cloned().collect()
    }

    /// Validate every adapter
    ///
    /// Transient failures are retried with exponential backoff for at most
    /// `max_elapsed`; anything else fails immediately.
    pub async fn initialize(&self, max_elapsed: Duration) -> Result<()> {
        let adapters: Vec<(String, StorageAdapterRef)> = self
            .adapters
            .read()
            .iter()
            .map(|(name, adapter)| (name.clone(), adapter.clone()))
            .collect();

        for (name, adapter) in adapters {
            let policy = ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(200))
                .with_max_elapsed_time(Some(max_elapsed))
                .build();

            backoff::future::retry(policy, || async {
                adapter.validate().await.map_err(|e| {
                    if e.is_transient() {
                        warn!(backend = %name, error = %e, "Backend validation failed, retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            })
            .await?;

            info!(backend = %name, "Backend validated");
        }
        Ok(())
    }
}
