//! Static Inventory
//!
//! Pool and host directories loaded from configuration.

use crate::domain::inventory::{Host, HostStatus, StoragePool};
use crate::domain::ports::{HostDirectory, PoolDirectory};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// In-memory pool and host directory
#[derive(Default)]
pub struct StaticInventory {
    pools: RwLock<BTreeMap<String, StoragePool>>,
    hosts: RwLock<BTreeMap<String, Host>>,
}

impl StaticInventory {
    pub fn new(pools: Vec<StoragePool>, hosts: Vec<Host>) -> Self {
        Self {
            pools: RwLock::new(pools.into_iter().map(|p| (p.id.clone(), p)).collect()),
            hosts: RwLock::new(hosts.into_iter().map(|h| (h.id.clone(), h)).collect()),
        }
    }

    pub fn add_pool(&self, pool: StoragePool) {
        self.pools.write().insert(pool.id.clone(), pool);
    }

    pub fn add_host(&self, host: Host) {
        self.hosts.write().insert(host.id.clone(), host);
    }

    /// Record a host status change; returns false for an unknown host
    pub fn set_host_status(&self, id: &str, status: HostStatus) -> bool {
        match self.hosts.write().get_mut(id) {
            Some(host) => {
                host.status = status;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PoolDirectory for StaticInventory {
    async fn get_pool(&self, id: &str) -> Result<Option<StoragePool>> {
        Ok(self.pools.read().get(id).cloned())
    }

    async fn list_pools(&self) -> Result<Vec<StoragePool>> {
        Ok(self.pools.read().values().cloned().collect())
    }
}

#[async_trait]
impl HostDirectory for StaticInventory {
    async fn get_host(&self, id: &str) -> Result<Option<Host>> {
        Ok(self.hosts.read().get(id).cloned())
    }

    async fn list_hosts(&self) -> Result<Vec<Host>> {
        Ok(self.hosts.read().values().cloned().collect())
    }
}
