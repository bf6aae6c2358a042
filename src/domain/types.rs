//! Adapter Boundary Types
//!
//! Translation records passed to and returned from storage adapters. They
//! are built fresh for every call and never persisted; adapters never see
//! the persisted entity types.

use super::entity::Owner;
use super::snapshot::Snapshot;
use super::volume::Volume;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Request Side
// =============================================================================

/// Tenant context for one adapter call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAdapterContext {
    pub zone_id: String,
    pub domain_id: String,
    pub domain_uuid: String,
    pub domain_name: String,
    pub account_id: String,
    pub account_uuid: String,
    pub account_name: String,
    /// Optional deployment tag folded into backend names
    pub environment: Option<String>,
}

impl ProviderAdapterContext {
    pub fn from_owner(owner: &Owner, environment: Option<&str>) -> Self {
        Self {
            zone_id: owner.zone_id.clone(),
            domain_id: owner.domain_id.clone(),
            domain_uuid: owner.domain_uuid.clone(),
            domain_name: owner.domain_name.clone(),
            account_id: owner.account_id.clone(),
            account_uuid: owner.account_uuid.clone(),
            account_name: owner.account_name.clone(),
            environment: environment.map(str::to_string),
        }
    }
}

/// Class of object crossing the adapter boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderObjectType {
    Volume,
    Snapshot,
    Template,
    Archive,
}

impl std::fmt::Display for ProviderObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderObjectType::Volume => write!(f, "volume"),
            ProviderObjectType::Snapshot => write!(f, "snapshot"),
            ProviderObjectType::Template => write!(f, "template"),
            ProviderObjectType::Archive => write!(f, "archive"),
        }
    }
}

/// Identity of an internal object as handed to an adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAdapterDataObject {
    pub id: String,
    pub uuid: String,
    pub name: String,
    pub object_type: ProviderObjectType,
    pub storage_pool_id: String,
    pub external_name: Option<String>,
    pub external_uuid: Option<String>,
    pub external_connection_id: Option<String>,
}

impl ProviderAdapterDataObject {
    pub fn for_volume(volume: &Volume, pool_id: &str) -> Self {
        Self {
            id: volume.id.clone(),
            uuid: volume.uuid.clone(),
            name: volume.name.clone(),
            object_type: ProviderObjectType::Volume,
            storage_pool_id: pool_id.to_string(),
            external_name: volume.external_name.clone(),
            external_uuid: volume.external_uuid.clone(),
            external_connection_id: volume.connection_id.clone(),
        }
    }

    pub fn for_snapshot(snapshot: &Snapshot, pool_id: &str) -> Self {
        Self {
            id: snapshot.id.clone(),
            uuid: snapshot.uuid.clone(),
            name: snapshot.name.clone(),
            object_type: ProviderObjectType::Snapshot,
            storage_pool_id: pool_id.to_string(),
            external_name: snapshot.external_name.clone(),
            external_uuid: snapshot.external_uuid.clone(),
            external_connection_id: None,
        }
    }

    /// Set the backend name this object is known by
    pub fn with_external_name(mut self, name: impl Into<String>) -> Self {
        self.external_name = Some(name.into());
        self
    }
}

/// Provisioning profile derived from a disk offering
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAdapterDiskProfile {
    pub offering_id: Option<String>,
    pub min_iops: Option<u64>,
    pub max_iops: Option<u64>,
    pub thin_provisioned: bool,
    pub tags: Vec<String>,
}

/// How a volume is addressed on the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    /// Fibre channel / iSCSI WWN
    Wwn,
    /// NVMe namespace GUID
    NvmeGuid,
    /// Filesystem path
    Path,
}

// =============================================================================
// Response Side
// =============================================================================

/// What the backend believes about a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderVolume {
    pub name: String,
    pub external_uuid: String,
    pub address_type: AddressType,
    pub address: String,
    pub allocated_bytes: u64,
    pub used_bytes: u64,
    /// Backend-native state string
    pub state: String,
    pub storage_pool_id: String,
}

/// What the backend believes about a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSnapshot {
    pub name: String,
    pub external_uuid: String,
    pub source_volume: String,
    pub allocated_bytes: u64,
    pub state: String,
}

/// Pool capacity as reported by the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStats {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

impl ProviderStats {
    pub fn available_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }
}

// =============================================================================
// Discovery
// =============================================================================

/// Enumeration request sent to a host agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRequest {
    pub pool_id: String,
    /// Pool path on the host
    pub path: String,
    /// Restrict to one object
    pub object_path: Option<String>,
}

/// Raw description of a physical object found on a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalObjectDescriptor {
    pub name: String,
    pub path: String,
    pub format: String,
    pub virtual_size: u64,
    pub physical_size: u64,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub encrypted: bool,
    /// External backing file, if the object is part of a chain
    #[serde(default)]
    pub backing_file: Option<String>,
    /// Format-specific extras reported by the agent
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

/// Parsed host agent answer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResponse {
    pub objects: Vec<PhysicalObjectDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_flags_default_off() {
        let json = r#"{
            "name": "disk-1",
            "path": "/pool/disk-1",
            "format": "qcow2",
            "virtualSize": 1073741824,
            "physicalSize": 196608
        }"#;
        let desc: PhysicalObjectDescriptor = serde_json::from_str(json).unwrap();
        assert!(!desc.locked);
        assert!(!desc.encrypted);
        assert!(desc.backing_file.is_none());
    }

    #[test]
    fn test_context_from_owner() {
        let owner = Owner::new("acct-1", "dom-1", "zone-1");
        let ctx = ProviderAdapterContext::from_owner(&owner, Some("prod"));
        assert_eq!(ctx.account_uuid, owner.account_uuid);
        assert_eq!(ctx.environment.as_deref(), Some("prod"));
    }
}
