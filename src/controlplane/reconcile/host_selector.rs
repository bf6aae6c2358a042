//! Host Selection
//!
//! Picks the compute host that runs discovery for a pool. The choice is
//! deterministic: among eligible Up hosts, the lowest id wins.

use crate::domain::inventory::{Host, PoolScope, StoragePool};
use crate::domain::ports::HostDirectoryRef;
use crate::error::{Error, Result};
use tracing::debug;

/// Choose a host able to see `pool`
pub fn select_host(pool: &StoragePool, hosts: &[Host]) -> Result<Host> {
    let in_scope = |host: &&Host| match &pool.scope {
        PoolScope::Host(id) => &host.id == id,
        PoolScope::Cluster(id) => &host.cluster_id == id,
        PoolScope::Zone(id) => &host.zone_id == id,
    };

    hosts
        .iter()
        .filter(in_scope)
        .filter(|host| host.is_up())
        .min_by(|a, b| a.id.cmp(&b.id))
        .cloned()
        .ok_or_else(|| Error::NoReachableHost {
            pool_id: pool.id.clone(),
            reason: match &pool.scope {
                PoolScope::Host(id) => format!("host {} is not up", id),
                PoolScope::Cluster(id) => format!("no up host in cluster {}", id),
                PoolScope::Zone(id) => format!("no up host in zone {}", id),
            },
        })
}

/// Host selection backed by a host directory
pub struct HostSelector {
    hosts: HostDirectoryRef,
}

impl HostSelector {
    pub fn new(hosts: HostDirectoryRef) -> Self {
        Self { hosts }
    }

    pub async fn select(&self, pool: &StoragePool) -> Result<Host> {
        let hosts = self.hosts.list_hosts().await?;
        let host = select_host(pool, &hosts)?;
        debug!(pool_id = %pool.id, host = %host.name, "Selected discovery host");
        Ok(host)
    }
}
