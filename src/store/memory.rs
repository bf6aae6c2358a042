//! In-Memory Database
//!
//! Row tables on DashMap plus a mutex-guarded tenant ledger. A mutation that
//! carries usage deltas takes the ledger lock first and holds it across the
//! row change, which makes row and counters one transaction.

use super::{DiskOfferingCatalog, EntityStore, ResourceAccounting, ResourceType, UsageDelta};
use crate::domain::entity::LifecycleEntity;
use crate::domain::file_share::FileShare;
use crate::domain::inventory::DiskOffering;
use crate::domain::snapshot::Snapshot;
use crate::domain::volume::Volume;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;

// =============================================================================
// Tenant Ledger
// =============================================================================

#[derive(Debug, Default)]
struct TenantLedger {
    usage: HashMap<(String, ResourceType), u64>,
    limits: HashMap<(String, ResourceType), u64>,
    default_limits: HashMap<ResourceType, u64>,
}

impl TenantLedger {
    fn usage(&self, account_id: &str, resource: ResourceType) -> u64 {
        self.usage
            .get(&(account_id.to_string(), resource))
            .copied()
            .unwrap_or(0)
    }

    fn limit(&self, account_id: &str, resource: ResourceType) -> Option<u64> {
        self.limits
            .get(&(account_id.to_string(), resource))
            .or_else(|| self.default_limits.get(&resource))
            .copied()
    }

    fn check(&self, account_id: &str, resource: ResourceType, additional: u64) -> Result<()> {
        let Some(limit) = self.limit(account_id, resource) else {
            return Ok(());
        };
        let requested = self.usage(account_id, resource).saturating_add(additional);
        if requested > limit {
            return Err(Error::ResourceLimitExceeded {
                account_id: account_id.to_string(),
                resource: resource.to_string(),
                limit,
                requested,
            });
        }
        Ok(())
    }

    /// Check the summed increments of a delta set
    fn check_all(&self, deltas: &[UsageDelta]) -> Result<()> {
        let mut increments: HashMap<(&str, ResourceType), u64> = HashMap::new();
        for delta in deltas.iter().filter(|d| d.amount > 0) {
            *increments
                .entry((delta.account_id.as_str(), delta.resource))
                .or_default() += delta.amount as u64;
        }
        for ((account_id, resource), additional) in increments {
            self.check(account_id, resource, additional)?;
        }
        Ok(())
    }

    fn apply(&mut self, deltas: &[UsageDelta]) {
        for delta in deltas {
            let counter = self
                .usage
                .entry((delta.account_id.clone(), delta.resource))
                .or_default();
            *counter = if delta.amount >= 0 {
                counter.saturating_add(delta.amount as u64)
            } else {
                counter.saturating_sub(delta.amount.unsigned_abs())
            };
        }
    }
}

// =============================================================================
// Memory Database
// =============================================================================

/// In-process implementation of every persistence collaborator
#[derive(Default)]
pub struct MemoryDatabase {
    volumes: DashMap<String, Volume>,
    snapshots: DashMap<String, Snapshot>,
    file_shares: DashMap<String, FileShare>,
    offerings: DashMap<String, DiskOffering>,
    ledger: Mutex<TenantLedger>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit applied to accounts without an explicit one
    pub fn set_default_limit(&self, resource: ResourceType, limit: u64) {
        self.ledger.lock().default_limits.insert(resource, limit);
    }

    /// Register a disk offering
    pub fn add_offering(&self, offering: DiskOffering) {
        self.offerings.insert(offering.id.clone(), offering);
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    fn insert_row<E: LifecycleEntity>(
        &self,
        rows: &DashMap<String, E>,
        entity: E,
        deltas: &[UsageDelta],
    ) -> Result<()> {
        let mut ledger = self.ledger.lock();
        ledger.check_all(deltas)?;

        match rows.entry(entity.id().to_string()) {
            Entry::Occupied(slot) => {
                return Err(Error::ResourceExists {
                    kind: E::KIND.to_string(),
                    name: slot.key().clone(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(entity);
            }
        }

        ledger.apply(deltas);
        Ok(())
    }

    fn compare_and_set_row<E: LifecycleEntity>(
        &self,
        rows: &DashMap<String, E>,
        id: &str,
        expected_sequence: u64,
        to: E::State,
        at: DateTime<Utc>,
        deltas: &[UsageDelta],
    ) -> Result<bool> {
        // Ledger before row, never the other way round
        let mut ledger = (!deltas.is_empty()).then(|| self.ledger.lock());

        let Some(mut row) = rows.get_mut(id) else {
            return Ok(false);
        };
        if row.update_sequence() != expected_sequence {
            return Ok(false);
        }
        // Increments are rechecked here; an earlier check may be stale
        if let Some(ledger) = ledger.as_ref() {
            ledger.check_all(deltas)?;
        }
        row.stamp_mut().advance(to, at);

        if let Some(ledger) = ledger.as_mut() {
            ledger.apply(deltas);
        }
        Ok(true)
    }

    fn save_attributes_row<E: LifecycleEntity>(
        &self,
        rows: &DashMap<String, E>,
        entity: &E,
        at: DateTime<Utc>,
    ) -> bool {
        let Some(mut row) = rows.get_mut(entity.id()) else {
            return false;
        };
        if row.update_sequence() != entity.update_sequence() {
            return false;
        }
        let mut stamp = row.stamp().clone();
        stamp.touch(at);
        *row = entity.clone();
        *row.stamp_mut() = stamp;
        true
    }

    fn remove_row<E: LifecycleEntity>(
        &self,
        rows: &DashMap<String, E>,
        id: &str,
        expected_sequence: u64,
        deltas: &[UsageDelta],
    ) -> bool {
        let mut ledger = self.ledger.lock();
        let removed = rows
            .remove_if(id, |_, row| row.update_sequence() == expected_sequence)
            .is_some();
        if removed {
            ledger.apply(deltas);
        }
        removed
    }
}

macro_rules! impl_entity_store {
    ($entity:ty, $table:ident) => {
        #[async_trait]
        impl EntityStore<$entity> for MemoryDatabase {
            async fn get(&self, id: &str) -> Result<Option<$entity>> {
                Ok(self.$table.get(id).map(|row| row.value().clone()))
            }

            async fn list(&self) -> Result<Vec<$entity>> {
                Ok(self.$table.iter().map(|row| row.value().clone()).collect())
            }

            async fn insert(&self, entity: $entity, deltas: &[UsageDelta]) -> Result<()> {
                self.insert_row(&self.$table, entity, deltas)
            }

            async fn compare_and_set(
                &self,
                id: &str,
                expected_sequence: u64,
                to: <$entity as LifecycleEntity>::State,
                at: DateTime<Utc>,
                deltas: &[UsageDelta],
            ) -> Result<bool> {
                self.compare_and_set_row(&self.$table, id, expected_sequence, to, at, deltas)
            }

            async fn save_attributes(&self, entity: &$entity, at: DateTime<Utc>) -> Result<bool> {
                Ok(self.save_attributes_row(&self.$table, entity, at))
            }

            async fn remove_if(
                &self,
                id: &str,
                expected_sequence: u64,
                deltas: &[UsageDelta],
            ) -> Result<bool> {
                Ok(self.remove_row(&self.$table, id, expected_sequence, deltas))
            }
        }
    };
}

impl_entity_store!(Volume, volumes);
impl_entity_store!(Snapshot, snapshots);
impl_entity_store!(FileShare, file_shares);

#[async_trait]
impl ResourceAccounting for MemoryDatabase {
    async fn check(&self, account_id: &str, resource: ResourceType, additional: u64) -> Result<()> {
        self.ledger.lock().check(account_id, resource, additional)
    }

    async fn usage(&self, account_id: &str, resource: ResourceType) -> Result<u64> {
        Ok(self.ledger.lock().usage(account_id, resource))
    }

    async fn set_limit(&self, account_id: &str, resource: ResourceType, limit: u64) -> Result<()> {
        self.ledger
            .lock()
            .limits
            .insert((account_id.to_string(), resource), limit);
        Ok(())
    }
}

#[async_trait]
impl DiskOfferingCatalog for MemoryDatabase {
    async fn get(&self, id: &str) -> Result<Option<DiskOffering>> {
        Ok(self.offerings.get(id).map(|o| o.value().clone()))
    }

    async fn find_or_create_for_import(&self, shared: bool) -> Result<DiskOffering> {
        if let Some(existing) = self.offerings.iter().find(|o| {
            o.custom_size && o.shared == shared && o.tags.iter().any(|t| t == "imported")
        }) {
            return Ok(existing.value().clone());
        }

        let placement = if shared { "shared" } else { "local" };
        let id = format!("do-import-{}", placement);
        let offering = self
            .offerings
            .entry(id.clone())
            .or_insert_with(|| DiskOffering {
                id,
                name: format!("Imported volume ({})", placement),
                shared,
                custom_size: true,
                size_bytes: None,
                tags: vec!["imported".to_string()],
            })
            .value()
            .clone();
        Ok(offering)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entity::Owner;
    use crate::domain::volume::VolumeState;
    use assert_matches::assert_matches;

    fn volume(id: &str) -> Volume {
        Volume::new("data", Owner::new("acct-1", "dom-1", "zone-1"), 1 << 30).with_id(id)
    }

    fn count_and_capacity(size: u64) -> Vec<UsageDelta> {
        vec![
            UsageDelta::increment("acct-1", ResourceType::Volume, 1),
            UsageDelta::increment("acct-1", ResourceType::PrimaryStorage, size),
        ]
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_id() {
        let db = MemoryDatabase::new();
        db.insert(volume("vol-1"), &[]).await.unwrap();
        let err = db.insert(volume("vol-1"), &[]).await.unwrap_err();
        assert_matches!(err, Error::ResourceExists { .. });
    }

    #[tokio::test]
    async fn test_compare_and_set_checks_sequence() {
        let db = MemoryDatabase::new();
        db.insert(volume("vol-1"), &[]).await.unwrap();

        let now = Utc::now();
        assert!(EntityStore::<Volume>::compare_and_set(&db, "vol-1", 0, VolumeState::Creating, now, &[])
            .await
            .unwrap());
        assert!(!EntityStore::<Volume>::compare_and_set(&db, "vol-1", 0, VolumeState::Ready, now, &[])
            .await
            .unwrap());

        let row = EntityStore::<Volume>::get(&db, "vol-1").await.unwrap().unwrap();
        assert_eq!(row.state(), VolumeState::Creating);
        assert_eq!(row.update_sequence(), 1);
    }

    #[tokio::test]
    async fn test_limit_exceeded_inserts_nothing() {
        let db = MemoryDatabase::new();
        db.set_limit("acct-1", ResourceType::Volume, 1).await.unwrap();
        db.insert(volume("vol-1"), &count_and_capacity(1 << 30)).await.unwrap();

        let err = db
            .insert(volume("vol-2"), &count_and_capacity(1 << 30))
            .await
            .unwrap_err();
        assert_matches!(err, Error::ResourceLimitExceeded { limit: 1, requested: 2, .. });
        assert_eq!(db.volume_count(), 1);
        assert_eq!(db.usage("acct-1", ResourceType::PrimaryStorage).await.unwrap(), 1 << 30);
    }

    #[tokio::test]
    async fn test_remove_if_applies_deltas_once() {
        let db = MemoryDatabase::new();
        db.insert(volume("vol-1"), &count_and_capacity(1 << 30)).await.unwrap();

        let release = vec![
            UsageDelta::decrement("acct-1", ResourceType::Volume, 1),
            UsageDelta::decrement("acct-1", ResourceType::PrimaryStorage, 1 << 30),
        ];
        assert!(EntityStore::<Volume>::remove_if(&db, "vol-1", 0, &release).await.unwrap());
        assert!(!EntityStore::<Volume>::remove_if(&db, "vol-1", 0, &release).await.unwrap());

        assert_eq!(db.usage("acct-1", ResourceType::Volume).await.unwrap(), 0);
        assert_eq!(db.usage("acct-1", ResourceType::PrimaryStorage).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_save_attributes_keeps_state_and_bumps_sequence() {
        let db = MemoryDatabase::new();
        let mut vol = volume("vol-1");
        db.insert(vol.clone(), &[]).await.unwrap();
        let stale = vol.clone();

        vol.path = Some("/pool/vol-1".into());
        assert!(EntityStore::<Volume>::save_attributes(&db, &vol, Utc::now()).await.unwrap());

        let row = EntityStore::<Volume>::get(&db, "vol-1").await.unwrap().unwrap();
        assert_eq!(row.path.as_deref(), Some("/pool/vol-1"));
        assert_eq!(row.state(), VolumeState::Allocated);
        assert_eq!(row.update_sequence(), 1);

        // A copy read before the attribute write no longer passes the guard
        assert!(!EntityStore::<Volume>::save_attributes(&db, &stale, Utc::now()).await.unwrap());
        assert!(!EntityStore::<Volume>::compare_and_set(&db, "vol-1", 0, VolumeState::Creating, Utc::now(), &[])
            .await
            .unwrap());
        assert!(!EntityStore::<Volume>::remove_if(&db, "vol-1", 0, &[]).await.unwrap());

        let row = EntityStore::<Volume>::get(&db, "vol-1").await.unwrap().unwrap();
        assert_eq!(row.path.as_deref(), Some("/pool/vol-1"));
        assert_eq!(row.state(), VolumeState::Allocated);
    }

    #[tokio::test]
    async fn test_compare_and_set_rechecks_increments() {
        let db = MemoryDatabase::new();
        db.set_limit("acct-1", ResourceType::PrimaryStorage, 3 << 30).await.unwrap();
        db.insert(volume("vol-1"), &count_and_capacity(1 << 30)).await.unwrap();

        // Growth that fit when it was checked, then another volume took the room
        let growth = [UsageDelta::increment("acct-1", ResourceType::PrimaryStorage, 2 << 30)];
        db.check("acct-1", ResourceType::PrimaryStorage, 2 << 30).await.unwrap();
        db.insert(volume("vol-2"), &count_and_capacity(1 << 30)).await.unwrap();

        let err = EntityStore::<Volume>::compare_and_set(&db, "vol-1", 0, VolumeState::Creating, Utc::now(), &growth)
            .await
            .unwrap_err();
        assert_matches!(err, Error::ResourceLimitExceeded { .. });

        let row = EntityStore::<Volume>::get(&db, "vol-1").await.unwrap().unwrap();
        assert_eq!(row.state(), VolumeState::Allocated);
        assert_eq!(row.update_sequence(), 0);
        assert_eq!(db.usage("acct-1", ResourceType::PrimaryStorage).await.unwrap(), 2 << 30);

        // Decrements are never refused
        let release = [UsageDelta::decrement("acct-1", ResourceType::PrimaryStorage, 1 << 30)];
        assert!(EntityStore::<Volume>::compare_and_set(&db, "vol-1", 0, VolumeState::Creating, Utc::now(), &release)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_import_offering_is_reused() {
        let db = MemoryDatabase::new();
        let first = db.find_or_create_for_import(true).await.unwrap();
        let second = db.find_or_create_for_import(true).await.unwrap();
        let local = db.find_or_create_for_import(false).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_ne!(first.id, local.id);
        assert!(first.custom_size);
        assert!(!local.shared);
    }
}
