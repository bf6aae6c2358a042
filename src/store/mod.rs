//! Persistence Collaborators
//!
//! Ports for the row store the engine writes through, the tenant accounting
//! ledger, and the disk-offering catalog. Real deployments back these with a
//! database; [`MemoryDatabase`] is the in-process implementation used in
//! standalone mode and tests.

mod memory;

pub use memory::MemoryDatabase;

use crate::domain::entity::LifecycleEntity;
use crate::domain::inventory::DiskOffering;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Resource Accounting Types
// =============================================================================

/// Tenant resource counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Number of volumes
    Volume,
    /// Primary storage capacity in bytes
    PrimaryStorage,
    /// Number of snapshots
    Snapshot,
    /// Secondary storage capacity in bytes
    SecondaryStorage,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Volume => write!(f, "volume"),
            ResourceType::PrimaryStorage => write!(f, "primary_storage"),
            ResourceType::Snapshot => write!(f, "snapshot"),
            ResourceType::SecondaryStorage => write!(f, "secondary_storage"),
        }
    }
}

/// A counter adjustment committed together with a row mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDelta {
    pub account_id: String,
    pub resource: ResourceType,
    pub amount: i64,
}

impl UsageDelta {
    pub fn increment(account_id: impl Into<String>, resource: ResourceType, amount: u64) -> Self {
        Self {
            account_id: account_id.into(),
            resource,
            amount: amount as i64,
        }
    }

    pub fn decrement(account_id: impl Into<String>, resource: ResourceType, amount: u64) -> Self {
        Self {
            account_id: account_id.into(),
            resource,
            amount: -(amount as i64),
        }
    }
}

// =============================================================================
// Entity Store Port
// =============================================================================

/// Row store for one entity kind
///
/// Every mutating call commits its `deltas` in the same transaction as the
/// row change, or not at all.
#[async_trait]
pub trait EntityStore<E: LifecycleEntity>: Send + Sync {
    /// Load a row by id
    async fn get(&self, id: &str) -> Result<Option<E>>;

    /// List all rows
    async fn list(&self) -> Result<Vec<E>>;

    /// Insert a new row; fails with `ResourceExists` on a duplicate id and
    /// `ResourceLimitExceeded` when an increment would pass a tenant limit
    async fn insert(&self, entity: E, deltas: &[UsageDelta]) -> Result<()>;

    /// Conditional lifecycle write
    ///
    /// Sets `state = to` and increments the update sequence only if the
    /// persisted sequence equals `expected_sequence`. Returns `false` when
    /// zero rows were affected.
    async fn compare_and_set(
        &self,
        id: &str,
        expected_sequence: u64,
        to: E::State,
        at: DateTime<Utc>,
        deltas: &[UsageDelta],
    ) -> Result<bool>;

    /// Conditional attribute write
    ///
    /// Replaces the non-lifecycle columns and increments the update sequence
    /// only if the persisted sequence equals the entity's. The state is left
    /// as persisted. Returns `false` when zero rows were affected.
    async fn save_attributes(&self, entity: &E, at: DateTime<Utc>) -> Result<bool>;

    /// Remove a row if its sequence still matches
    async fn remove_if(&self, id: &str, expected_sequence: u64, deltas: &[UsageDelta]) -> Result<bool>;
}

// =============================================================================
// Resource Accounting Port
// =============================================================================

/// Tenant accounting collaborator
#[async_trait]
pub trait ResourceAccounting: Send + Sync {
    /// Fail with `ResourceLimitExceeded` if `additional` would pass the limit
    async fn check(&self, account_id: &str, resource: ResourceType, additional: u64) -> Result<()>;

    /// Current usage
    async fn usage(&self, account_id: &str, resource: ResourceType) -> Result<u64>;

    /// Set an account-specific limit, overriding the default
    async fn set_limit(&self, account_id: &str, resource: ResourceType, limit: u64) -> Result<()>;
}

// =============================================================================
// Disk Offering Catalog Port
// =============================================================================

/// Catalog of disk offerings
#[async_trait]
pub trait DiskOfferingCatalog: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<DiskOffering>>;

    /// Resolve the custom-size offering used for imported volumes, creating
    /// it on first use
    async fn find_or_create_for_import(&self, shared: bool) -> Result<DiskOffering>;
}

pub type ResourceAccountingRef = Arc<dyn ResourceAccounting>;
pub type DiskOfferingCatalogRef = Arc<dyn DiskOfferingCatalog>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_delta_sign() {
        let up = UsageDelta::increment("acct-1", ResourceType::PrimaryStorage, 1024);
        let down = UsageDelta::decrement("acct-1", ResourceType::PrimaryStorage, 1024);
        assert_eq!(up.amount, 1024);
        assert_eq!(down.amount, -1024);
    }

    #[test]
    fn test_resource_type_display() {
        assert_eq!(ResourceType::Volume.to_string(), "volume");
        assert_eq!(ResourceType::PrimaryStorage.to_string(), "primary_storage");
    }
}
