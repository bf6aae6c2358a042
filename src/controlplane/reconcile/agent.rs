//! Host Agent Clients
//!
//! [`HttpHostAgent`] talks to the discovery endpoint of the agent running on
//! each compute host. [`StaticHostAgent`] serves a fixed inventory for tests
//! and standalone mode.

use crate::domain::inventory::Host;
use crate::domain::ports::HostAgent;
use crate::domain::types::{DiscoveryRequest, DiscoveryResponse, PhysicalObjectDescriptor};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, warn};

/// Default agent listen port
pub const DEFAULT_AGENT_PORT: u16 = 8250;

// =============================================================================
// HTTP Agent
// =============================================================================

/// JSON-over-HTTP host agent client
pub struct HttpHostAgent {
    http_client: reqwest::Client,
    port: u16,
}

impl HttpHostAgent {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http_client, port })
    }

    fn discover_url(&self, host: &Host, request: &DiscoveryRequest) -> String {
        format!(
            "http://{}:{}/v1/storage/discover?pool={}",
            host.address,
            self.port,
            urlencoding::encode(&request.pool_id)
        )
    }
}

#[async_trait]
impl HostAgent for HttpHostAgent {
    async fn discover(&self, host: &Host, request: &DiscoveryRequest) -> Result<DiscoveryResponse> {
        let url = self.discover_url(host, request);
        debug!(host = %host.name, url = %url, "Sending discovery request");

        let response = self
            .http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                warn!(host = %host.name, error = %e, "Failed to reach host agent");
                Error::HostAgent {
                    host: host.name.clone(),
                    reason: e.to_string(),
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HostAgent {
                host: host.name.clone(),
                reason: format!("discovery failed: {} - {}", status, body),
            });
        }

        Ok(response.json::<DiscoveryResponse>().await?)
    }
}

// =============================================================================
// Static Agent
// =============================================================================

/// In-memory host agent
#[derive(Default)]
pub struct StaticHostAgent {
    /// pool id -> objects on that pool
    objects: RwLock<BTreeMap<String, Vec<PhysicalObjectDescriptor>>>,
    unreachable: RwLock<BTreeSet<String>>,
}

impl StaticHostAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_object(&self, pool_id: &str, descriptor: PhysicalObjectDescriptor) {
        self.objects
            .write()
            .entry(pool_id.to_string())
            .or_default()
            .push(descriptor);
    }

    pub fn remove_object(&self, pool_id: &str, path: &str) {
        if let Some(objects) = self.objects.write().get_mut(pool_id) {
            objects.retain(|o| o.path != path);
        }
    }

    /// Make discovery on `host_id` fail
    pub fn set_unreachable(&self, host_id: &str, unreachable: bool) {
        let mut hosts = self.unreachable.write();
        if unreachable {
            hosts.insert(host_id.to_string());
        } else {
            hosts.remove(host_id);
        }
    }
}

#[async_trait]
impl HostAgent for StaticHostAgent {
    async fn discover(&self, host: &Host, request: &DiscoveryRequest) -> Result<DiscoveryResponse> {
        if self.unreachable.read().contains(&host.id) {
            return Err(Error::HostAgent {
                host: host.name.clone(),
                reason: "agent unreachable".to_string(),
            });
        }

        let objects = self
            .objects
            .read()
            .get(&request.pool_id)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|o| request.object_path.as_deref().map_or(true, |p| o.path == p))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(DiscoveryResponse { objects })
    }
}
