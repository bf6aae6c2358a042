//! Reconciliation Manager
//!
//! Discovers storage objects that exist on a pool without a database record,
//! imports them into managed state, and releases managed volumes back to
//! unmanaged state. Neither import nor unmanage touches the physical object.

use super::eligibility::{self, Eligibility};
use super::host_selector::HostSelector;
use crate::domain::entity::{LifecycleEntity, Owner};
use crate::domain::inventory::StoragePool;
use crate::domain::ports::{HostAgentRef, HostDirectoryRef, PoolDirectoryRef};
use crate::domain::types::{DiscoveryRequest, PhysicalObjectDescriptor};
use crate::domain::volume::{Volume, VolumeEvent, VolumeState};
use crate::error::{Error, Result};
use crate::fsm::StateMachine;
use crate::store::{DiskOfferingCatalogRef, ResourceAccountingRef, ResourceType, UsageDelta};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// A discovered object with no database record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmanagedVolume {
    pub pool_id: String,
    pub descriptor: PhysicalObjectDescriptor,
    pub eligibility: Eligibility,
}

/// Request to take over a discovered object
#[derive(Debug, Clone)]
pub struct ImportVolumeRequest {
    pub pool_id: String,
    /// Path reported by discovery
    pub path: String,
    /// Display name; defaults to the object's name
    pub name: Option<String>,
    pub owner: Owner,
    pub disk_offering_id: Option<String>,
}

pub struct ReconciliationManager {
    volumes: Arc<StateMachine<Volume>>,
    pools: PoolDirectoryRef,
    selector: HostSelector,
    agent: HostAgentRef,
    accounting: ResourceAccountingRef,
    offerings: DiskOfferingCatalogRef,
    agent_timeout: Duration,
}

impl ReconciliationManager {
    pub fn new(
        volumes: Arc<StateMachine<Volume>>,
        pools: PoolDirectoryRef,
        hosts: HostDirectoryRef,
        agent: HostAgentRef,
        accounting: ResourceAccountingRef,
        offerings: DiskOfferingCatalogRef,
        agent_timeout: Duration,
    ) -> Self {
        Self {
            volumes,
            pools,
            selector: HostSelector::new(hosts),
            agent,
            accounting,
            offerings,
            agent_timeout,
        }
    }

    /// Objects on `pool_id` that the database does not know about
    #[instrument(skip(self))]
    pub async fn list_unmanaged(&self, pool_id: &str) -> Result<Vec<UnmanagedVolume>> {
        let pool = self.pool(pool_id).await?;
        let managed = self.managed_identities(&pool.id).await?;
        let objects = self.discover(&pool, None).await?;

        let unmanaged: Vec<UnmanagedVolume> = objects
            .into_iter()
            .filter(|o| !managed.contains(&o.path) && !managed.contains(&o.name))
            .map(|descriptor| UnmanagedVolume {
                pool_id: pool.id.clone(),
                eligibility: eligibility::assess(&descriptor),
                descriptor,
            })
            .collect();

        info!(pool_id = %pool.id, count = unmanaged.len(), "Listed unmanaged volumes");
        Ok(unmanaged)
    }

    /// Adopt a discovered object as a Ready volume
    #[instrument(skip(self, request), fields(pool_id = %request.pool_id, path = %request.path))]
    pub async fn import_volume(&self, request: ImportVolumeRequest) -> Result<Volume> {
        let pool = self.pool(&request.pool_id).await?;
        let descriptor = self
            .discover(&pool, Some(request.path.clone()))
            .await?
            .into_iter()
            .find(|o| o.path == request.path)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "physical_object".to_string(),
                name: request.path.clone(),
            })?;

        eligibility::check(&descriptor)?;

        let managed = self.managed_identities(&pool.id).await?;
        if managed.contains(&descriptor.path) || managed.contains(&descriptor.name) {
            return Err(Error::ResourceExists {
                kind: "volume".to_string(),
                name: descriptor.path.clone(),
            });
        }

        let shared = pool.scope.is_shared();
        let offering = match &request.disk_offering_id {
            Some(id) => {
                let offering = self.offerings.get(id).await?.ok_or_else(|| Error::ResourceNotFound {
                    kind: "disk_offering".to_string(),
                    name: id.clone(),
                })?;
                if !offering.accepts(shared, descriptor.virtual_size) {
                    return Err(Error::InvalidRequest(format!(
                        "disk offering {} does not fit a {} byte {} volume",
                        offering.id,
                        descriptor.virtual_size,
                        if shared { "shared" } else { "local" }
                    )));
                }
                offering
            }
            None => self.offerings.find_or_create_for_import(shared).await?,
        };

        let account = request.owner.account_id.clone();
        self.accounting.check(&account, ResourceType::Volume, 1).await?;
        self.accounting
            .check(&account, ResourceType::PrimaryStorage, descriptor.virtual_size)
            .await?;

        let name = request.name.unwrap_or_else(|| descriptor.name.clone());
        let mut volume = Volume::new(name, request.owner, descriptor.virtual_size)
            .with_pool(pool.id.clone())
            .with_disk_offering(offering.id);
        volume.external_name = Some(descriptor.name.clone());
        volume.path = Some(descriptor.path.clone());
        volume.format = descriptor.format.to_lowercase();

        let deltas = [
            UsageDelta::increment(&account, ResourceType::Volume, 1),
            UsageDelta::increment(&account, ResourceType::PrimaryStorage, volume.size_bytes),
        ];
        let volume = self.volumes.adopt(volume, VolumeState::Ready, &deltas).await?;

        info!(volume_id = %volume.id, path = %descriptor.path, "Volume imported");
        Ok(volume)
    }

    /// Release a Ready volume from management, leaving its object in place
    #[instrument(skip(self))]
    pub async fn unmanage_volume(&self, volume_id: &str) -> Result<Volume> {
        let mut volume = self.volumes.load(volume_id).await?;
        if let Some(host) = &volume.attached_host {
            return Err(Error::ResourceInUse {
                kind: "volume".to_string(),
                name: volume.id.clone(),
                reason: format!("attached to host {}", host),
            });
        }
        if volume.encrypted {
            return Err(Error::IneligibleForReconciliation {
                path: volume.path.clone().unwrap_or_else(|| volume.id.clone()),
                reason: "encrypted volumes cannot be unmanaged".to_string(),
            });
        }

        let account = volume.owner.account_id.clone();
        let deltas = [
            UsageDelta::decrement(&account, ResourceType::Volume, 1),
            UsageDelta::decrement(&account, ResourceType::PrimaryStorage, volume.size_bytes),
        ];
        self.volumes
            .retire(&mut volume, VolumeEvent::UnmanageRequested, &deltas)
            .await?;

        info!(volume_id = %volume.id, path = ?volume.path, "Volume unmanaged");
        Ok(volume)
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

    async fn discover(
        &self,
        pool: &StoragePool,
        object_path: Option<String>,
    ) -> Result<Vec<PhysicalObjectDescriptor>> {
        let host = self.selector.select(pool).await?;
        let request = DiscoveryRequest {
            pool_id: pool.id.clone(),
            path: pool.path.clone(),
            object_path,
        };

        match tokio::time::timeout(self.agent_timeout, self.agent.discover(&host, &request)).await {
            Ok(response) => Ok(response?.objects),
            Err(_) => Err(Error::HostAgent {
                host: host.name,
                reason: format!("discovery timed out after {:?}", self.agent_timeout),
            }),
        }
    }

    /// Paths and backend names of live volumes on a pool
    async fn managed_identities(&self, pool_id: &str) -> Result<HashSet<String>> {
        let mut identities = HashSet::new();
        for volume in self.volumes.store().list().await? {
            if volume.storage_pool_id.as_deref() != Some(pool_id)
                || volume.state() == VolumeState::Expunged
            {
                continue;
            }
            identities.extend(volume.path.clone());
            identities.extend(volume.external_name.clone());
        }
        Ok(identities)
    }
}
