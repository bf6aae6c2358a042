//! Domain Ports - Core trait definitions for the lifecycle engine
//!
//! These traits define the boundaries between lifecycle orchestration and
//! external systems. Storage backends implement [`StorageAdapter`]; the host
//! layer implements [`HostAgent`]; inventory owners implement the
//! directories.

use super::inventory::{Host, StoragePool};
use super::types::{
    AddressType, DiscoveryRequest, DiscoveryResponse, ProviderAdapterContext,
    ProviderAdapterDataObject, ProviderAdapterDiskProfile, ProviderSnapshot, ProviderStats,
    ProviderVolume,
};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Storage Adapter Port
// =============================================================================

/// Contract every storage backend implements
///
/// Mutating calls either fully succeed or return an error. Read-back calls
/// return `Ok(None)` when the object does not exist and `Err` when the
/// backend could not be asked; callers rely on the two never being mixed.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Backend type name this adapter is registered under
    fn backend_type(&self) -> &str;

    // -------------------------------------------------------------------------
    // Connectivity
    // -------------------------------------------------------------------------

    /// Verify configuration and reachability
    async fn validate(&self) -> Result<()>;

    /// Apply new connection settings
    async fn refresh(&self, settings: &BTreeMap<String, String>) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    // -------------------------------------------------------------------------
    // Physical Operations
    // -------------------------------------------------------------------------

    /// Provision a volume
    ///
    /// Idempotent by the object's deterministic name: a retried create for
    /// the same object returns the existing volume.
    async fn create(
        &self,
        ctx: &ProviderAdapterContext,
        object: &ProviderAdapterDataObject,
        profile: &ProviderAdapterDiskProfile,
        size_bytes: u64,
    ) -> Result<ProviderVolume>;

    /// Expose a volume to a host, returning its addressing token
    async fn attach(
        &self,
        ctx: &ProviderAdapterContext,
        object: &ProviderAdapterDataObject,
        hostname: &str,
    ) -> Result<String>;

    async fn detach(
        &self,
        ctx: &ProviderAdapterContext,
        object: &ProviderAdapterDataObject,
        hostname: &str,
    ) -> Result<()>;

    async fn delete(&self, ctx: &ProviderAdapterContext, object: &ProviderAdapterDataObject) -> Result<()>;

    /// Copy `source` into a new volume described by `destination`
    async fn copy(
        &self,
        ctx: &ProviderAdapterContext,
        source: &ProviderAdapterDataObject,
        destination: &ProviderAdapterDataObject,
    ) -> Result<ProviderVolume>;

    async fn snapshot(
        &self,
        ctx: &ProviderAdapterContext,
        volume: &ProviderAdapterDataObject,
        snapshot: &ProviderAdapterDataObject,
    ) -> Result<ProviderSnapshot>;

    /// Roll a volume back to a snapshot
    async fn revert(
        &self,
        ctx: &ProviderAdapterContext,
        snapshot: &ProviderAdapterDataObject,
        volume: &ProviderAdapterDataObject,
    ) -> Result<ProviderVolume>;

    async fn resize(
        &self,
        ctx: &ProviderAdapterContext,
        object: &ProviderAdapterDataObject,
        new_size_bytes: u64,
    ) -> Result<()>;

    // -------------------------------------------------------------------------
    // Read-back
    // -------------------------------------------------------------------------

    async fn get_volume(
        &self,
        ctx: &ProviderAdapterContext,
        object: &ProviderAdapterDataObject,
    ) -> Result<Option<ProviderVolume>>;

    async fn get_snapshot(
        &self,
        ctx: &ProviderAdapterContext,
        object: &ProviderAdapterDataObject,
    ) -> Result<Option<ProviderSnapshot>>;

    async fn get_volume_by_address(
        &self,
        ctx: &ProviderAdapterContext,
        address_type: AddressType,
        address: &str,
    ) -> Result<Option<ProviderVolume>>;

    /// Pool capacity and usage
    async fn stats(&self) -> Result<ProviderStats>;

    // -------------------------------------------------------------------------
    // Capabilities
    // -------------------------------------------------------------------------

    /// Whether `hostname` is allowed to attach volumes from this backend
    async fn can_access_host(&self, hostname: &str) -> Result<bool>;

    fn can_direct_attach_snapshot(&self) -> bool;

    /// Host name to addressing token for every current attachment of `object`
    async fn connection_id_map(
        &self,
        object: &ProviderAdapterDataObject,
    ) -> Result<BTreeMap<String, String>>;
}

// =============================================================================
// Host Agent Port
// =============================================================================

/// Remote enumeration of physical objects, executed on a compute host
#[async_trait]
pub trait HostAgent: Send + Sync {
    async fn discover(&self, host: &Host, request: &DiscoveryRequest) -> Result<DiscoveryResponse>;
}

// =============================================================================
// Inventory Directory Ports
// =============================================================================

/// Read access to compute hosts
#[async_trait]
pub trait HostDirectory: Send + Sync {
    async fn get_host(&self, id: &str) -> Result<Option<Host>>;

    async fn list_hosts(&self) -> Result<Vec<Host>>;
}

/// Read access to primary storage pools
#[async_trait]
pub trait PoolDirectory: Send + Sync {
    async fn get_pool(&self, id: &str) -> Result<Option<StoragePool>>;

    async fn list_pools(&self) -> Result<Vec<StoragePool>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type StorageAdapterRef = Arc<dyn StorageAdapter>;
pub type HostAgentRef = Arc<dyn HostAgent>;
pub type HostDirectoryRef = Arc<dyn HostDirectory>;
pub type PoolDirectoryRef = Arc<dyn PoolDirectory>;
