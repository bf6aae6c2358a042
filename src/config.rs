//! Control Plane Configuration
//!
//! YAML file describing backends, pools, hosts, tenant limits and engine
//! timeouts. Every section has defaults, so an empty file is valid.

use crate::controlplane::backends::BackendConfig;
use crate::controlplane::orchestrator::OrchestratorConfig;
use crate::controlplane::reconcile::DEFAULT_AGENT_PORT;
use crate::domain::inventory::{DiskOffering, Host, StoragePool};
use crate::error::{Error, Result};
use crate::store::ResourceType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    /// Deployment tag folded into backend object names
    pub environment: Option<String>,
    pub backends: Vec<BackendConfig>,
    pub pools: Vec<StoragePool>,
    pub hosts: Vec<Host>,
    pub offerings: Vec<DiskOffering>,
    pub limits: LimitsConfig,
    pub engine: EngineConfig,
    pub agent: AgentConfig,
}

/// Tenant resource limits; absent entries are unlimited
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LimitsConfig {
    pub defaults: BTreeMap<ResourceType, u64>,
    /// Per-account overrides
    pub accounts: BTreeMap<String, BTreeMap<ResourceType, u64>>,
}

/// Orchestration timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub adapter_timeout_secs: u64,
    pub read_back_timeout_secs: u64,
    /// Retry window for backend validation at startup
    pub backend_init_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            adapter_timeout_secs: 120,
            read_back_timeout_secs: 30,
            backend_init_timeout_secs: 60,
        }
    }
}

/// How discovery reaches host agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Http,
    /// In-process inventory, for standalone runs
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub mode: AgentMode,
    pub port: u16,
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mode: AgentMode::Http,
            port: DEFAULT_AGENT_PORT,
            timeout_secs: 60,
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ControlPlaneConfig {
    /// Read and validate a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-check references between sections
    pub fn validate(&self) -> Result<()> {
        let mut backends = HashSet::new();
        for backend in &self.backends {
            if !backends.insert(backend.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "backend {} is declared twice",
                    backend.name
                )));
            }
        }

        let mut pools = HashSet::new();
        for pool in &self.pools {
            if !pools.insert(pool.id.as_str()) {
                return Err(Error::Configuration(format!("pool {} is declared twice", pool.id)));
            }
            if !backends.contains(pool.backend.as_str()) {
                return Err(Error::Configuration(format!(
                    "pool {} refers to unknown backend {}",
                    pool.id, pool.backend
                )));
            }
        }

        if self.engine.adapter_timeout_secs == 0 || self.engine.read_back_timeout_secs == 0 {
            return Err(Error::Configuration(
                "engine timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            adapter_timeout: Duration::from_secs(self.engine.adapter_timeout_secs),
            read_back_timeout: Duration::from_secs(self.engine.read_back_timeout_secs),
            environment: self.environment.clone(),
        }
    }

    pub fn backend_init_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.backend_init_timeout_secs)
    }
}
