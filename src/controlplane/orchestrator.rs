//! Volume Orchestrator
//!
//! Drives volume, snapshot and file share operations by sequencing engine
//! transitions around storage adapter calls:
//!
//! 1. the start event moves the entity into its in-progress state, and a
//!    rejection here happens before any physical side effect;
//! 2. the adapter call runs under a bounded timeout;
//! 3. the success or failure event moves the entity out again.
//!
//! When an adapter call times out the orchestrator reads the object back by
//! its deterministic name before deciding which exit to take.

use crate::controlplane::backends::BackendRegistry;
use crate::controlplane::naming;
use crate::domain::entity::{LifecycleEntity, Owner};
use crate::domain::file_share::{FileShare, FileShareEvent};
use crate::domain::inventory::StoragePool;
use crate::domain::ports::{PoolDirectoryRef, StorageAdapterRef};
use crate::domain::snapshot::{Snapshot, SnapshotEvent, SnapshotState};
use crate::domain::types::{
    ProviderAdapterContext, ProviderAdapterDataObject, ProviderAdapterDiskProfile,
    ProviderObjectType, ProviderVolume,
};
use crate::domain::volume::{Volume, VolumeEvent, VolumeState};
use crate::error::{Error, Result};
use crate::fsm::{LifecycleEngines, StateMachine};
use crate::store::{DiskOfferingCatalogRef, ResourceAccountingRef, ResourceType, UsageDelta};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on any single adapter call
    pub adapter_timeout: Duration,
    /// Upper bound on the read-back after a timed-out call
    pub read_back_timeout: Duration,
    /// Deployment tag folded into backend names
    pub environment: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            adapter_timeout: Duration::from_secs(120),
            read_back_timeout: Duration::from_secs(30),
            environment: None,
        }
    }
}

// =============================================================================
// Requests / Reports
// =============================================================================

/// Request to allocate a volume record
#[derive(Debug, Clone)]
pub struct AllocateVolumeRequest {
    pub name: String,
    pub owner: Owner,
    pub size_bytes: u64,
    pub disk_offering_id: Option<String>,
}

/// One disagreement between the database and the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Drift {
    /// The database expects a physical object the backend does not have
    MissingOnBackend,
    SizeMismatch { recorded: u64, actual: u64 },
    AddressMismatch { recorded: Option<String>, actual: String },
}

/// Result of comparing one volume with its backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub volume_id: String,
    pub state: VolumeState,
    pub external_name: Option<String>,
    pub drift: Vec<Drift>,
}

impl DriftReport {
    pub fn is_consistent(&self) -> bool {
        self.drift.is_empty()
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Lifecycle driver for volumes and their snapshots
pub struct VolumeOrchestrator {
    config: OrchestratorConfig,
    engines: LifecycleEngines,
    backends: Arc<BackendRegistry>,
    pools: PoolDirectoryRef,
    accounting: ResourceAccountingRef,
    offerings: DiskOfferingCatalogRef,
}

impl VolumeOrchestrator {
    /// Create a new orchestrator
    pub fn new(
        config: OrchestratorConfig,
        engines: LifecycleEngines,
        backends: Arc<BackendRegistry>,
        pools: PoolDirectoryRef,
        accounting: ResourceAccountingRef,
        offerings: DiskOfferingCatalogRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            engines,
            backends,
            pools,
            accounting,
            offerings,
        })
    }

    pub fn engines(&self) -> &LifecycleEngines {
        &self.engines
    }

    pub async fn volume(&self, volume_id: &str) -> Result<Volume> {
        self.engines.volumes.load(volume_id).await
    }

    pub async fn snapshot_record(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.engines.snapshots.load(snapshot_id).await
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Create the database record of a volume, charging the tenant
    #[instrument(skip(self, request), fields(name = %request.name, account = %request.owner.account_id))]
    pub async fn allocate(&self, request: AllocateVolumeRequest) -> Result<Volume> {
        if request.size_bytes == 0 {
            return Err(Error::InvalidRequest("volume size must be positive".to_string()));
        }

        let mut volume = Volume::new(request.name, request.owner, request.size_bytes);
        if let Some(offering_id) = request.disk_offering_id {
            let offering = self.offerings.get(&offering_id).await?.ok_or_else(|| {
                Error::ResourceNotFound {
                    kind: "disk_offering".to_string(),
                    name: offering_id.clone(),
                }
            })?;
            if !offering.custom_size && offering.size_bytes != Some(request.size_bytes) {
                return Err(Error::InvalidRequest(format!(
                    "disk offering {} has a fixed size",
                    offering.id
                )));
            }
            volume = volume.with_disk_offering(offering_id);
        }

        let account = volume.owner.account_id.clone();
        self.accounting.check(&account, ResourceType::Volume, 1).await?;
        self.accounting
            .check(&account, ResourceType::PrimaryStorage, volume.size_bytes)
            .await?;

        let deltas = [
            UsageDelta::increment(&account, ResourceType::Volume, 1),
            UsageDelta::increment(&account, ResourceType::PrimaryStorage, volume.size_bytes),
        ];
        let volume = self
            .engines
            .volumes
            .create(volume, VolumeEvent::AllocationRequested, &deltas)
            .await?;

        info!(volume_id = %volume.id, size_bytes = volume.size_bytes, "Volume allocated");
        Ok(volume)
    }

    /// Provision the physical volume on a pool
    #[instrument(skip(self))]
    pub async fn create(&self, volume_id: &str, pool_id: &str) -> Result<Volume> {
        let engine = &self.engines.volumes;
        let mut volume = engine.load(volume_id).await?;
        let (pool, adapter) = self.pool_adapter(pool_id).await?;
        let profile = self.disk_profile(&volume).await?;
        let ctx = self.context(&volume.owner);

        engine.transition(&mut volume, VolumeEvent::CreateRequested).await?;

        let object = self.placed_object(&ctx, &volume, &pool);
        volume.storage_pool_id = Some(pool.id.clone());
        volume.external_name = object.external_name.clone();
        if let Err(e) = engine.save_attributes(&mut volume).await {
            return Err(fail(engine, &mut volume, VolumeEvent::OperationFailed, &[], e).await);
        }

        let outcome = match self
            .bounded(&pool.backend, "create", adapter.create(&ctx, &object, &profile, volume.size_bytes))
            .await
        {
            Ok(created) => Ok(Some(created)),
            Err(e) => {
                self.read_back(&pool.backend, &object, e, adapter.get_volume(&ctx, &object), Option::is_some)
                    .await
            }
        };

        match outcome {
            Ok(created) => {
                engine.transition(&mut volume, VolumeEvent::OperationSucceeded).await?;
                if let Some(created) = created {
                    apply_provider_volume(&mut volume, &created);
                }
                engine.save_attributes(&mut volume).await?;
                info!(volume_id = %volume.id, pool_id = %pool.id, "Volume created");
                Ok(volume)
            }
            Err(e) => Err(fail(engine, &mut volume, VolumeEvent::OperationFailed, &[], e).await),
        }
    }

    /// Grow a volume
    #[instrument(skip(self))]
    pub async fn resize(&self, volume_id: &str, new_size_bytes: u64) -> Result<Volume> {
        let engine = &self.engines.volumes;
        let mut volume = engine.load(volume_id).await?;
        if new_size_bytes <= volume.size_bytes {
            return Err(Error::InvalidRequest(format!(
                "volume {} can only grow beyond {} bytes",
                volume.id, volume.size_bytes
            )));
        }
        let (pool, adapter, object) = self.physical(&volume).await?;
        let growth = new_size_bytes - volume.size_bytes;
        let account = volume.owner.account_id.clone();
        self.accounting
            .check(&account, ResourceType::PrimaryStorage, growth)
            .await?;

        engine.transition(&mut volume, VolumeEvent::ResizeRequested).await?;

        let ctx = self.context(&volume.owner);
        let outcome = match self
            .bounded(&pool.backend, "resize", adapter.resize(&ctx, &object, new_size_bytes))
            .await
        {
            Ok(()) => Ok(None),
            Err(e) => {
                self.read_back(&pool.backend, &object, e, adapter.get_volume(&ctx, &object), |found| {
                    found
                        .as_ref()
                        .map(|v| v.allocated_bytes >= new_size_bytes)
                        .unwrap_or(false)
                })
                .await
            }
        };

        match outcome {
            Ok(_) => {
                let deltas = [UsageDelta::increment(&account, ResourceType::PrimaryStorage, growth)];
                if let Err(e) = engine
                    .transition_accounted(&mut volume, VolumeEvent::OperationSucceeded, &deltas)
                    .await
                {
                    return Err(refused_commit(engine, &mut volume, VolumeEvent::OperationFailed, &[], e).await);
                }
                volume.size_bytes = new_size_bytes;
                engine.save_attributes(&mut volume).await?;
                info!(volume_id = %volume.id, new_size_bytes, "Volume resized");
                Ok(volume)
            }
            Err(e) => Err(fail(engine, &mut volume, VolumeEvent::OperationFailed, &[], e).await),
        }
    }

    /// Move a volume to another pool on the same backend
    #[instrument(skip(self))]
    pub async fn migrate(&self, volume_id: &str, destination_pool_id: &str) -> Result<Volume> {
        let engine = &self.engines.volumes;
        let mut volume = engine.load(volume_id).await?;
        if let Some(host) = &volume.attached_host {
            return Err(Error::ResourceInUse {
                kind: "volume".to_string(),
                name: volume.id.clone(),
                reason: format!("attached to host {}", host),
            });
        }
        let (source_pool, adapter, source) = self.physical(&volume).await?;
        let destination_pool = self.pool(destination_pool_id).await?;
        if destination_pool.id == source_pool.id {
            return Err(Error::InvalidRequest(format!(
                "volume {} is already on pool {}",
                volume.id, source_pool.id
            )));
        }
        if destination_pool.backend != source_pool.backend {
            return Err(Error::InvalidRequest(format!(
                "cannot migrate from backend {} to {}",
                source_pool.backend, destination_pool.backend
            )));
        }

        engine.transition(&mut volume, VolumeEvent::MigrationRequested).await?;

        let ctx = self.context(&volume.owner);
        let destination = self.placed_object(&ctx, &volume, &destination_pool);
        let outcome = match self
            .bounded(&source_pool.backend, "copy", adapter.copy(&ctx, &source, &destination))
            .await
        {
            Ok(copied) => Ok(Some(copied)),
            Err(e) => {
                self.read_back(
                    &source_pool.backend,
                    &destination,
                    e,
                    adapter.get_volume(&ctx, &destination),
                    Option::is_some,
                )
                .await
            }
        };

        match outcome {
            Ok(copied) => {
                if let Err(e) = self
                    .bounded(&source_pool.backend, "delete", adapter.delete(&ctx, &source))
                    .await
                {
                    warn!(
                        volume_id = %volume.id,
                        object = ?source.external_name,
                        error = %e,
                        "Source object left behind after migration"
                    );
                }

                engine.transition(&mut volume, VolumeEvent::OperationSucceeded).await?;
                volume.storage_pool_id = Some(destination_pool.id.clone());
                volume.external_name = destination.external_name.clone();
                if let Some(copied) = copied {
                    apply_provider_volume(&mut volume, &copied);
                }
                engine.save_attributes(&mut volume).await?;
                info!(volume_id = %volume.id, pool_id = %destination_pool.id, "Volume migrated");
                Ok(volume)
            }
            Err(e) => Err(fail(engine, &mut volume, VolumeEvent::OperationFailed, &[], e).await),
        }
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Snapshot a volume; `backup` decides whether a secondary copy follows
    #[instrument(skip(self))]
    pub async fn snapshot(&self, volume_id: &str, name: &str, backup: bool) -> Result<Snapshot> {
        let volumes = &self.engines.volumes;
        let snapshots = &self.engines.snapshots;
        let mut volume = volumes.load(volume_id).await?;
        let (pool, adapter, volume_object) = self.physical(&volume).await?;
        let account = volume.owner.account_id.clone();
        self.accounting.check(&account, ResourceType::Snapshot, 1).await?;

        volumes.transition(&mut volume, VolumeEvent::SnapshotRequested).await?;

        let ctx = self.context(&volume.owner);
        let mut snapshot = Snapshot::new(name, volume.id.clone(), volume.owner.clone(), volume.size_bytes);
        snapshot.storage_pool_id = Some(pool.id.clone());
        let snapshot_object = {
            let mut object = ProviderAdapterDataObject::for_snapshot(&snapshot, &pool.id);
            object.external_name = Some(naming::external_name(&ctx, &object));
            object
        };
        snapshot.external_name = snapshot_object.external_name.clone();

        let counted = [UsageDelta::increment(&account, ResourceType::Snapshot, 1)];
        let mut snapshot = match snapshots
            .create(snapshot, SnapshotEvent::CreateRequested, &counted)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(fail(volumes, &mut volume, VolumeEvent::OperationFailed, &[], e).await),
        };

        let outcome = match self
            .bounded(&pool.backend, "snapshot", adapter.snapshot(&ctx, &volume_object, &snapshot_object))
            .await
        {
            Ok(taken) => Ok(Some(taken)),
            Err(e) => {
                self.read_back(
                    &pool.backend,
                    &snapshot_object,
                    e,
                    adapter.get_snapshot(&ctx, &snapshot_object),
                    Option::is_some,
                )
                .await
            }
        };

        match outcome {
            Ok(taken) => {
                let event = if backup {
                    SnapshotEvent::OperationSucceeded
                } else {
                    SnapshotEvent::BackupSkipped
                };
                if let Some(taken) = taken {
                    snapshot.external_uuid = Some(taken.external_uuid);
                }
                let snapshot_done = snapshots.transition(&mut snapshot, event).await;
                let volume_done = volumes.transition(&mut volume, VolumeEvent::OperationSucceeded).await;
                snapshot_done?;
                volume_done?;
                snapshots.save_attributes(&mut snapshot).await?;
                info!(snapshot_id = %snapshot.id, volume_id = %volume.id, "Snapshot taken");
                Ok(snapshot)
            }
            Err(e) => {
                let released = [UsageDelta::decrement(&account, ResourceType::Snapshot, 1)];
                let e = fail(snapshots, &mut snapshot, SnapshotEvent::OperationFailed, &released, e).await;
                Err(fail(volumes, &mut volume, VolumeEvent::OperationFailed, &[], e).await)
            }
        }
    }

    /// Copy a primary snapshot out to secondary storage
    #[instrument(skip(self))]
    pub async fn backup_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        let engine = &self.engines.snapshots;
        let mut snapshot = engine.load(snapshot_id).await?;
        let pool_id = snapshot.storage_pool_id.clone().ok_or_else(|| {
            Error::InvalidRequest(format!("snapshot {} has no pool", snapshot.id))
        })?;
        let (pool, adapter) = self.pool_adapter(&pool_id).await?;
        let account = snapshot.owner.account_id.clone();
        self.accounting
            .check(&account, ResourceType::SecondaryStorage, snapshot.size_bytes)
            .await?;

        engine.transition(&mut snapshot, SnapshotEvent::BackupRequested).await?;

        let ctx = self.context(&snapshot.owner);
        let source = ProviderAdapterDataObject::for_snapshot(&snapshot, &pool.id);
        let archive = ProviderAdapterDataObject {
            object_type: ProviderObjectType::Archive,
            external_name: None,
            external_uuid: None,
            ..source.clone()
        };

        match self
            .bounded(&pool.backend, "copy", adapter.copy(&ctx, &source, &archive))
            .await
        {
            Ok(copied) => {
                let deltas = [UsageDelta::increment(
                    &account,
                    ResourceType::SecondaryStorage,
                    snapshot.size_bytes,
                )];
                if let Err(e) = engine
                    .transition_accounted(&mut snapshot, SnapshotEvent::OperationSucceeded, &deltas)
                    .await
                {
                    if matches!(e, Error::ResourceLimitExceeded { .. }) {
                        let archive = archive.with_external_name(copied.address);
                        if let Err(delete_error) = self
                            .bounded(&pool.backend, "delete", adapter.delete(&ctx, &archive))
                            .await
                        {
                            warn!(snapshot_id = %snapshot.id, error = %delete_error, "Secondary copy left behind");
                        }
                    }
                    let released = [UsageDelta::decrement(&account, ResourceType::Snapshot, 1)];
                    return Err(refused_commit(engine, &mut snapshot, SnapshotEvent::OperationFailed, &released, e).await);
                }
                snapshot.backup_path = Some(copied.address);
                engine.save_attributes(&mut snapshot).await?;
                Ok(snapshot)
            }
            Err(e) => {
                let released = [UsageDelta::decrement(&account, ResourceType::Snapshot, 1)];
                Err(fail(engine, &mut snapshot, SnapshotEvent::OperationFailed, &released, e).await)
            }
        }
    }

    /// Delete a snapshot and its secondary copy
    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        let engine = &self.engines.snapshots;
        let mut snapshot = engine.load(snapshot_id).await?;
        let pool_id = snapshot.storage_pool_id.clone().ok_or_else(|| {
            Error::InvalidRequest(format!("snapshot {} has no pool", snapshot.id))
        })?;
        let (pool, adapter) = self.pool_adapter(&pool_id).await?;

        engine.transition(&mut snapshot, SnapshotEvent::DestroyRequested).await?;

        let ctx = self.context(&snapshot.owner);
        let object = ProviderAdapterDataObject::for_snapshot(&snapshot, &pool.id);
        let outcome = match self
            .bounded(&pool.backend, "delete", adapter.delete(&ctx, &object))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => self
                .read_back(&pool.backend, &object, e, adapter.get_snapshot(&ctx, &object), Option::is_none)
                .await
                .map(|_| ()),
        };

        match outcome {
            Ok(()) => {
                let account = snapshot.owner.account_id.clone();
                let mut deltas = vec![UsageDelta::decrement(&account, ResourceType::Snapshot, 1)];
                if let Some(backup_path) = snapshot.backup_path.clone() {
                    let archive = ProviderAdapterDataObject {
                        object_type: ProviderObjectType::Archive,
                        ..object.clone()
                    }
                    .with_external_name(backup_path);
                    if let Err(e) = self
                        .bounded(&pool.backend, "delete", adapter.delete(&ctx, &archive))
                        .await
                    {
                        warn!(snapshot_id = %snapshot.id, error = %e, "Secondary copy left behind");
                    }
                    deltas.push(UsageDelta::decrement(
                        &account,
                        ResourceType::SecondaryStorage,
                        snapshot.size_bytes,
                    ));
                }
                engine
                    .transition_accounted(&mut snapshot, SnapshotEvent::OperationSucceeded, &deltas)
                    .await?;
                Ok(snapshot)
            }
            Err(e) => Err(fail(engine, &mut snapshot, SnapshotEvent::OperationFailed, &[], e).await),
        }
    }

    /// Roll a volume back to one of its snapshots
    #[instrument(skip(self))]
    pub async fn revert_to_snapshot(&self, volume_id: &str, snapshot_id: &str) -> Result<Volume> {
        let engine = &self.engines.volumes;
        let mut volume = engine.load(volume_id).await?;
        let snapshot = self.engines.snapshots.load(snapshot_id).await?;
        if snapshot.volume_id != volume.id {
            return Err(Error::InvalidRequest(format!(
                "snapshot {} belongs to volume {}",
                snapshot.id, snapshot.volume_id
            )));
        }
        if !matches!(
            snapshot.state(),
            SnapshotState::CreatedOnPrimary | SnapshotState::BackedUp
        ) {
            return Err(Error::InvalidRequest(format!(
                "snapshot {} is {}",
                snapshot.id,
                snapshot.state()
            )));
        }
        let (pool, adapter, volume_object) = self.physical(&volume).await?;

        engine.transition(&mut volume, VolumeEvent::RevertRequested).await?;

        let ctx = self.context(&volume.owner);
        let snapshot_object = ProviderAdapterDataObject::for_snapshot(&snapshot, &pool.id);
        match self
            .bounded(&pool.backend, "revert", adapter.revert(&ctx, &snapshot_object, &volume_object))
            .await
        {
            Ok(reverted) => {
                let deltas = size_change(&volume.owner.account_id, volume.size_bytes, reverted.allocated_bytes);
                if let Err(e) = engine
                    .transition_accounted(&mut volume, VolumeEvent::OperationSucceeded, &deltas)
                    .await
                {
                    return Err(refused_commit(engine, &mut volume, VolumeEvent::OperationFailed, &[], e).await);
                }
                volume.size_bytes = reverted.allocated_bytes;
                engine.save_attributes(&mut volume).await?;
                Ok(volume)
            }
            Err(e) => Err(fail(engine, &mut volume, VolumeEvent::OperationFailed, &[], e).await),
        }
    }

    // =========================================================================
    // Secondary Staging
    // =========================================================================

    /// Mark a volume as being uploaded to secondary storage
    #[instrument(skip(self))]
    pub async fn begin_upload(&self, volume_id: &str, staging_path: &str) -> Result<Volume> {
        let engine = &self.engines.volumes;
        let mut volume = engine.load(volume_id).await?;
        engine.transition(&mut volume, VolumeEvent::UploadRequested).await?;
        volume.staging_path = Some(staging_path.to_string());
        if let Err(e) = engine.save_attributes(&mut volume).await {
            return Err(fail(engine, &mut volume, VolumeEvent::OperationFailed, &[], e).await);
        }
        Ok(volume)
    }

    /// Record the outcome of an upload
    #[instrument(skip(self))]
    pub async fn complete_upload(&self, volume_id: &str, succeeded: bool) -> Result<Volume> {
        let engine = &self.engines.volumes;
        let mut volume = engine.load(volume_id).await?;
        let event = if succeeded {
            VolumeEvent::OperationSucceeded
        } else {
            VolumeEvent::OperationFailed
        };
        engine.transition(&mut volume, event).await?;
        if !succeeded {
            volume.staging_path = None;
            engine.save_attributes(&mut volume).await?;
        }
        Ok(volume)
    }

    /// Copy an uploaded image onto a primary pool
    #[instrument(skip(self))]
    pub async fn copy_from_staging(&self, volume_id: &str, pool_id: &str) -> Result<Volume> {
        let engine = &self.engines.volumes;
        let mut volume = engine.load(volume_id).await?;
        let staging_path = volume.staging_path.clone().ok_or_else(|| {
            Error::InvalidRequest(format!("volume {} has no staged image", volume.id))
        })?;
        let (pool, adapter) = self.pool_adapter(pool_id).await?;
        let ctx = self.context(&volume.owner);

        engine.transition(&mut volume, VolumeEvent::CopyRequested).await?;

        let destination = self.placed_object(&ctx, &volume, &pool);
        let source = ProviderAdapterDataObject {
            object_type: ProviderObjectType::Template,
            ..destination.clone()
        }
        .with_external_name(staging_path);
        volume.storage_pool_id = Some(pool.id.clone());
        volume.external_name = destination.external_name.clone();
        if let Err(e) = engine.save_attributes(&mut volume).await {
            return Err(fail(engine, &mut volume, VolumeEvent::CopyFailed, &[], e).await);
        }

        let outcome = match self
            .bounded(&pool.backend, "copy", adapter.copy(&ctx, &source, &destination))
            .await
        {
            Ok(copied) => Ok(Some(copied)),
            Err(e) => {
                self.read_back(&pool.backend, &destination, e, adapter.get_volume(&ctx, &destination), Option::is_some)
                    .await
            }
        };

        match outcome {
            Ok(copied) => {
                engine.transition(&mut volume, VolumeEvent::CopySucceeded).await?;
                if let Some(copied) = copied {
                    apply_provider_volume(&mut volume, &copied);
                }
                engine.save_attributes(&mut volume).await?;
                info!(volume_id = %volume.id, pool_id = %pool.id, "Staged image copied to primary");
                Ok(volume)
            }
            Err(e) => Err(fail(engine, &mut volume, VolumeEvent::CopyFailed, &[], e).await),
        }
    }

    // =========================================================================
    // Attachment
    // =========================================================================

    /// Expose a Ready volume to a host
    #[instrument(skip(self))]
    pub async fn attach(&self, volume_id: &str, hostname: &str) -> Result<Volume> {
        let engine = &self.engines.volumes;
        let mut volume = engine.load(volume_id).await?;
        if volume.state() != VolumeState::Ready {
            return Err(Error::InvalidRequest(format!(
                "volume {} is {}, not Ready",
                volume.id,
                volume.state()
            )));
        }
        match volume.attached_host.as_deref() {
            Some(current) if current == hostname => return Ok(volume),
            Some(current) => {
                return Err(Error::ResourceInUse {
                    kind: "volume".to_string(),
                    name: volume.id.clone(),
                    reason: format!("attached to host {}", current),
                })
            }
            None => {}
        }

        let (pool, adapter, object) = self.physical(&volume).await?;
        if !adapter.can_access_host(hostname).await? {
            return Err(Error::InvalidRequest(format!(
                "host {} cannot reach backend {}",
                hostname, pool.backend
            )));
        }

        let ctx = self.context(&volume.owner);
        let connection_id = self
            .bounded(&pool.backend, "attach", adapter.attach(&ctx, &object, hostname))
            .await?;

        volume.connection_id = Some(connection_id);
        volume.attached_host = Some(hostname.to_string());
        if let Err(e) = engine.save_attributes(&mut volume).await {
            // Lost to a concurrent writer; withdraw the export we just made
            if let Err(detach_error) = self
                .bounded(&pool.backend, "detach", adapter.detach(&ctx, &object, hostname))
                .await
            {
                warn!(
                    volume_id = %volume.id,
                    host = hostname,
                    error = %detach_error,
                    "Export left behind after a lost attach"
                );
            }
            return Err(e);
        }
        Ok(volume)
    }

    /// Hide a volume from its host
    #[instrument(skip(self))]
    pub async fn detach(&self, volume_id: &str) -> Result<Volume> {
        let engine = &self.engines.volumes;
        let mut volume = engine.load(volume_id).await?;
        let Some(hostname) = volume.attached_host.clone() else {
            return Ok(volume);
        };

        let (pool, adapter, object) = self.physical(&volume).await?;
        let ctx = self.context(&volume.owner);
        self.bounded(&pool.backend, "detach", adapter.detach(&ctx, &object, &hostname))
            .await?;

        volume.connection_id = None;
        volume.attached_host = None;
        engine.save_attributes(&mut volume).await?;
        Ok(volume)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Soft-delete a volume; the physical object stays until expunge
    #[instrument(skip(self))]
    pub async fn destroy(&self, volume_id: &str) -> Result<Volume> {
        let engine = &self.engines.volumes;
        let mut volume = engine.load(volume_id).await?;
        if let Some(host) = &volume.attached_host {
            return Err(Error::ResourceInUse {
                kind: "volume".to_string(),
                name: volume.id.clone(),
                reason: format!("attached to host {}", host),
            });
        }
        engine.transition(&mut volume, VolumeEvent::DestroyRequested).await?;
        Ok(volume)
    }

    /// Undo a destroy
    #[instrument(skip(self))]
    pub async fn recover(&self, volume_id: &str) -> Result<Volume> {
        let engine = &self.engines.volumes;
        let mut volume = engine.load(volume_id).await?;
        if volume.state() == VolumeState::Destroy && !volume.has_physical_object() {
            return Err(Error::InvalidRequest(format!(
                "volume {} was never provisioned",
                volume.id
            )));
        }
        engine.transition(&mut volume, VolumeEvent::RecoverRequested).await?;
        Ok(volume)
    }

    /// Delete the physical object of a destroyed volume and release quota
    #[instrument(skip(self))]
    pub async fn expunge(&self, volume_id: &str) -> Result<Volume> {
        let engine = &self.engines.volumes;
        let mut volume = engine.load(volume_id).await?;
        let physical = if volume.has_physical_object() {
            Some(self.physical(&volume).await?)
        } else {
            None
        };

        engine.transition(&mut volume, VolumeEvent::ExpungingRequested).await?;

        let outcome = match &physical {
            None => Ok(()),
            Some((pool, adapter, object)) => {
                let ctx = self.context(&volume.owner);
                match self.bounded(&pool.backend, "delete", adapter.delete(&ctx, object)).await {
                    Ok(()) => Ok(()),
                    Err(e) => self
                        .read_back(&pool.backend, object, e, adapter.get_volume(&ctx, object), Option::is_none)
                        .await
                        .map(|_| ()),
                }
            }
        };

        match outcome {
            Ok(()) => {
                let account = volume.owner.account_id.clone();
                let deltas = [
                    UsageDelta::decrement(&account, ResourceType::Volume, 1),
                    UsageDelta::decrement(&account, ResourceType::PrimaryStorage, volume.size_bytes),
                ];
                engine
                    .transition_accounted(&mut volume, VolumeEvent::OperationSucceeded, &deltas)
                    .await?;
                info!(volume_id = %volume.id, "Volume expunged");
                Ok(volume)
            }
            Err(e) => Err(fail(engine, &mut volume, VolumeEvent::OperationFailed, &[], e).await),
        }
    }

    // =========================================================================
    // Drift / Recovery Support
    // =========================================================================

    /// Compare a volume's record with what its backend reports
    ///
    /// The address is only compared when it was reported by the backend in
    /// the first place.
    #[instrument(skip(self))]
    pub async fn check_drift(&self, volume_id: &str) -> Result<DriftReport> {
        let volume = self.engines.volumes.load(volume_id).await?;
        let mut report = DriftReport {
            volume_id: volume.id.clone(),
            state: volume.state(),
            external_name: volume.external_name.clone(),
            drift: Vec::new(),
        };
        if !volume.has_physical_object() {
            return Ok(report);
        }

        let (pool, adapter, object) = self.physical(&volume).await?;
        let ctx = self.context(&volume.owner);
        let found = self
            .bounded(&pool.backend, "get_volume", adapter.get_volume(&ctx, &object))
            .await?;

        match found {
            None => report.drift.push(Drift::MissingOnBackend),
            Some(actual) => {
                if actual.allocated_bytes != volume.size_bytes {
                    report.drift.push(Drift::SizeMismatch {
                        recorded: volume.size_bytes,
                        actual: actual.allocated_bytes,
                    });
                }
                if volume.external_uuid.is_some() && volume.path.as_deref() != Some(actual.address.as_str()) {
                    report.drift.push(Drift::AddressMismatch {
                        recorded: volume.path.clone(),
                        actual: actual.address,
                    });
                }
            }
        }

        if !report.is_consistent() {
            warn!(volume_id = %volume.id, drift = ?report.drift, "Volume drifted from backend");
        }
        Ok(report)
    }

    /// Volumes sitting in an in-progress state, for an external recovery sweep
    pub async fn in_progress_volumes(&self) -> Result<Vec<Volume>> {
        Ok(self
            .engines
            .volumes
            .store()
            .list()
            .await?
            .into_iter()
            .filter(|v| v.state().is_in_progress())
            .collect())
    }

    // =========================================================================
    // Direct Transitions
    // =========================================================================

    pub async fn request_volume_transition(&self, volume_id: &str, event: VolumeEvent) -> Result<Volume> {
        self.engines.volumes.request_transition(volume_id, event).await
    }

    pub async fn request_snapshot_transition(&self, snapshot_id: &str, event: SnapshotEvent) -> Result<Snapshot> {
        self.engines.snapshots.request_transition(snapshot_id, event).await
    }

    pub async fn request_file_share_transition(
        &self,
        share_id: &str,
        event: FileShareEvent,
    ) -> Result<FileShare> {
        self.engines.file_shares.request_transition(share_id, event).await
    }

    /// Register a new file share record
    pub async fn allocate_file_share(&self, share: FileShare) -> Result<FileShare> {
        self.engines
            .file_shares
            .create(share, FileShareEvent::CreateRequested, &[])
            .await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn context(&self, owner: &Owner) -> ProviderAdapterContext {
        ProviderAdapterContext::from_owner(owner, self.config.environment.as_deref())
    }

    async fn pool(&self, pool_id: &str) -> Result<StoragePool> {
        self.pools
            .get_pool(pool_id)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "storage_pool".to_string(),
                name: pool_id.to_string(),
            })
    }

    async fn pool_adapter(&self, pool_id: &str) -> Result<(StoragePool, StorageAdapterRef)> {
        let pool = self.pool(pool_id).await?;
        let adapter = self.backends.get(&pool.backend)?;
        Ok((pool, adapter))
    }

    /// Pool, adapter and boundary object of a provisioned volume
    async fn physical(
        &self,
        volume: &Volume,
    ) -> Result<(StoragePool, StorageAdapterRef, ProviderAdapterDataObject)> {
        let pool_id = match (&volume.storage_pool_id, &volume.external_name) {
            (Some(pool_id), Some(_)) => pool_id.clone(),
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "volume {} has no physical object",
                    volume.id
                )))
            }
        };
        let (pool, adapter) = self.pool_adapter(&pool_id).await?;
        let object = ProviderAdapterDataObject::for_volume(volume, &pool.id);
        Ok((pool, adapter, object))
    }

    /// Boundary object for `volume` placed on `pool`, named deterministically
    fn placed_object(
        &self,
        ctx: &ProviderAdapterContext,
        volume: &Volume,
        pool: &StoragePool,
    ) -> ProviderAdapterDataObject {
        let mut object = ProviderAdapterDataObject::for_volume(volume, &pool.id);
        object.external_name = None;
        object.external_uuid = None;
        object.external_connection_id = None;
        let name = naming::external_name(ctx, &object);
        object.with_external_name(name)
    }

    async fn disk_profile(&self, volume: &Volume) -> Result<ProviderAdapterDiskProfile> {
        let Some(offering_id) = &volume.disk_offering_id else {
            return Ok(ProviderAdapterDiskProfile {
                thin_provisioned: true,
                ..Default::default()
            });
        };
        let offering = self
            .offerings
            .get(offering_id)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "disk_offering".to_string(),
                name: offering_id.clone(),
            })?;
        Ok(ProviderAdapterDiskProfile {
            offering_id: Some(offering.id),
            thin_provisioned: true,
            tags: offering.tags,
            ..Default::default()
        })
    }

    /// Run an adapter call under the configured timeout
    async fn bounded<T>(
        &self,
        backend: &str,
        operation: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timeout = self.config.adapter_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::BackendTimeout {
                backend: backend.to_string(),
                operation: operation.to_string(),
                timeout,
            }),
        }
    }

    /// Decide a timed-out call by reading the object back
    ///
    /// Errors other than a timeout are returned as they are. After a
    /// timeout, `confirms` judges the read-back: a confirmation yields the
    /// read-back value, a denial returns the timeout, and a failed read-back
    /// becomes `AmbiguousPhysicalState`.
    async fn read_back<T>(
        &self,
        backend: &str,
        object: &ProviderAdapterDataObject,
        cause: Error,
        lookup: impl Future<Output = Result<Option<T>>>,
        confirms: impl Fn(&Option<T>) -> bool,
    ) -> Result<Option<T>> {
        if !matches!(cause, Error::BackendTimeout { .. }) {
            return Err(cause);
        }

        let name = object
            .external_name
            .clone()
            .unwrap_or_else(|| object.id.clone());
        match tokio::time::timeout(self.config.read_back_timeout, lookup).await {
            Ok(Ok(found)) if confirms(&found) => {
                info!(backend, object = %name, "Read-back confirmed timed-out operation");
                Ok(found)
            }
            Ok(Ok(_)) => {
                warn!(backend, object = %name, "Read-back shows timed-out operation did not apply");
                Err(cause)
            }
            Ok(Err(e)) => Err(Error::AmbiguousPhysicalState {
                backend: backend.to_string(),
                object: name,
                reason: format!("{}; read-back failed: {}", cause, e),
            }),
            Err(_) => Err(Error::AmbiguousPhysicalState {
                backend: backend.to_string(),
                object: name,
                reason: format!("{}; read-back timed out", cause),
            }),
        }
    }
}

/// Take a failure exit and hand back the error that caused it
async fn fail<E: LifecycleEntity>(
    engine: &Arc<StateMachine<E>>,
    entity: &mut E,
    event: E::Event,
    deltas: &[UsageDelta],
    cause: Error,
) -> Error {
    if let Err(e) = engine.transition_accounted(entity, event, deltas).await {
        error!(
            kind = %E::KIND,
            entity_id = entity.id(),
            event = %event,
            cause = %cause,
            error = %e,
            "Failure exit not applied"
        );
    }
    cause
}

/// Handle a success exit the store refused after the backend applied the change
///
/// A limit rechecked at commit time can refuse increments that passed the
/// earlier check. The entity then takes its failure exit, leaving the backend
/// ahead of the record, which `check_drift` reports. Other errors are
/// returned unchanged.
async fn refused_commit<E: LifecycleEntity>(
    engine: &Arc<StateMachine<E>>,
    entity: &mut E,
    event: E::Event,
    deltas: &[UsageDelta],
    cause: Error,
) -> Error {
    if !matches!(cause, Error::ResourceLimitExceeded { .. }) {
        return cause;
    }
    warn!(
        kind = %E::KIND,
        entity_id = entity.id(),
        error = %cause,
        "Backend change applied but refused by tenant limits"
    );
    fail(engine, entity, event, deltas, cause).await
}

fn apply_provider_volume(volume: &mut Volume, provider: &ProviderVolume) {
    volume.external_uuid = Some(provider.external_uuid.clone());
    volume.path = Some(provider.address.clone());
}

fn size_change(account_id: &str, from: u64, to: u64) -> Vec<UsageDelta> {
    match to.cmp(&from) {
        std::cmp::Ordering::Greater => vec![UsageDelta::increment(account_id, ResourceType::PrimaryStorage, to - from)],
        std::cmp::Ordering::Less => vec![UsageDelta::decrement(account_id, ResourceType::PrimaryStorage, from - to)],
        std::cmp::Ordering::Equal => Vec::new(),
    }
}
