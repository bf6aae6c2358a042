//! Infrastructure Inventory Types
//!
//! Storage pools, compute hosts and disk offerings as seen by the lifecycle
//! engine. These records are owned by other parts of the control plane; the
//! engine only reads them.

use serde::{Deserialize, Serialize};

/// Reach of a storage pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum PoolScope {
    /// Host-local storage
    Host(String),
    /// Shared within a cluster
    Cluster(String),
    /// Shared across a zone
    Zone(String),
}

impl PoolScope {
    /// Whether volumes on this pool are visible to more than one host
    pub fn is_shared(&self) -> bool {
        !matches!(self, PoolScope::Host(_))
    }
}

impl std::fmt::Display for PoolScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolScope::Host(id) => write!(f, "host:{}", id),
            PoolScope::Cluster(id) => write!(f, "cluster:{}", id),
            PoolScope::Zone(id) => write!(f, "zone:{}", id),
        }
    }
}

/// A primary storage pool backed by one storage adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePool {
    pub id: String,
    pub name: String,
    /// Registry name of the backend serving this pool
    pub backend: String,
    pub scope: PoolScope,
    pub zone_id: String,
    /// Mount point or pool path on the hosts
    pub path: String,
}

impl StoragePool {
    pub fn is_shared(&self) -> bool {
        self.scope.is_shared()
    }
}

/// Host availability as reported by the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Up,
    Down,
    Maintenance,
}

/// A compute host that can run storage discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: String,
    pub name: String,
    /// Agent address (hostname or IP)
    pub address: String,
    pub cluster_id: String,
    pub zone_id: String,
    pub status: HostStatus,
}

impl Host {
    pub fn is_up(&self) -> bool {
        self.status == HostStatus::Up
    }
}

/// Disk offering a volume is provisioned against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskOffering {
    pub id: String,
    pub name: String,
    /// Shared (true) or host-local (false) placement
    pub shared: bool,
    /// Size is chosen per volume
    pub custom_size: bool,
    /// Fixed size when not custom
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl DiskOffering {
    /// Whether a volume of `size_bytes` on a pool with the given placement
    /// may use this offering
    pub fn accepts(&self, shared: bool, size_bytes: u64) -> bool {
        if self.shared != shared {
            return false;
        }
        self.custom_size || self.size_bytes == Some(size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_scope_sharing() {
        assert!(!PoolScope::Host("h1".into()).is_shared());
        assert!(PoolScope::Cluster("c1".into()).is_shared());
        assert!(PoolScope::Zone("z1".into()).is_shared());
        assert_eq!(PoolScope::Cluster("c1".into()).to_string(), "cluster:c1");
    }

    #[test]
    fn test_offering_accepts() {
        let fixed = DiskOffering {
            id: "do-1".into(),
            name: "Small".into(),
            shared: true,
            custom_size: false,
            size_bytes: Some(5 << 30),
            tags: vec![],
        };
        assert!(fixed.accepts(true, 5 << 30));
        assert!(!fixed.accepts(true, 6 << 30));
        assert!(!fixed.accepts(false, 5 << 30));
    }
}
