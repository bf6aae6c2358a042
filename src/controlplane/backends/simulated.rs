//! Simulated Storage Array
//!
//! In-memory array that honours the whole adapter contract. Used for
//! standalone mode and tests; faults can be injected per operation to
//! exercise the orchestrator's failure handling.

use crate::controlplane::naming;
use crate::domain::ports::StorageAdapter;
use crate::domain::types::{
    AddressType, ProviderAdapterContext, ProviderAdapterDataObject, ProviderAdapterDiskProfile,
    ProviderObjectType, ProviderSnapshot, ProviderStats, ProviderVolume,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const SIMULATED_BACKEND: &str = "simulated";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the simulated array
#[derive(Debug, Clone)]
pub struct SimulatedArrayConfig {
    /// Total pool capacity
    pub capacity_bytes: u64,
    /// Hosts allowed to attach; empty allows every host
    pub allowed_hosts: Vec<String>,
    pub direct_attach_snapshots: bool,
    /// How long an injected timeout hangs before erroring
    pub hang_duration: Duration,
}

impl Default for SimulatedArrayConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 10 * 1024 * 1024 * 1024 * 1024, // 10 TiB
            allowed_hosts: Vec::new(),
            direct_attach_snapshots: false,
            hang_duration: Duration::from_secs(300),
        }
    }
}

impl SimulatedArrayConfig {
    /// Overlay string settings from a config file
    pub fn apply_settings(&mut self, settings: &BTreeMap<String, String>) -> Result<()> {
        if let Some(value) = settings.get("capacity_bytes") {
            self.capacity_bytes = value.parse().map_err(|_| {
                Error::Configuration(format!("capacity_bytes is not a number: {}", value))
            })?;
        }
        if let Some(value) = settings.get("allowed_hosts") {
            self.allowed_hosts = value
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = settings.get("direct_attach_snapshots") {
            self.direct_attach_snapshots = value.parse().map_err(|_| {
                Error::Configuration(format!("direct_attach_snapshots is not a bool: {}", value))
            })?;
        }
        Ok(())
    }
}

// =============================================================================
// Fault Injection
// =============================================================================

/// Adapter operations that accept injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayOperation {
    Validate,
    Create,
    Attach,
    Detach,
    Delete,
    Copy,
    Snapshot,
    Revert,
    Resize,
    GetVolume,
    GetSnapshot,
    Stats,
}

impl std::fmt::Display for ArrayOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArrayOperation::Validate => "validate",
            ArrayOperation::Create => "create",
            ArrayOperation::Attach => "attach",
            ArrayOperation::Detach => "detach",
            ArrayOperation::Delete => "delete",
            ArrayOperation::Copy => "copy",
            ArrayOperation::Snapshot => "snapshot",
            ArrayOperation::Revert => "revert",
            ArrayOperation::Resize => "resize",
            ArrayOperation::GetVolume => "get_volume",
            ArrayOperation::GetSnapshot => "get_snapshot",
            ArrayOperation::Stats => "stats",
        };
        write!(f, "{}", name)
    }
}

/// Injected misbehaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail immediately with `BackendUnavailable`
    Unavailable,
    /// Apply the operation, then hang
    TimeoutAfterApply,
    /// Hang without applying anything
    TimeoutBeforeApply,
}

// =============================================================================
// Array Objects
// =============================================================================

#[derive(Debug, Clone)]
struct SimVolume {
    name: String,
    uuid: String,
    wwn: String,
    size_bytes: u64,
    pool_id: String,
    /// host -> LUN
    attachments: BTreeMap<String, String>,
}

impl SimVolume {
    fn view(&self) -> ProviderVolume {
        ProviderVolume {
            name: self.name.clone(),
            external_uuid: self.uuid.clone(),
            address_type: AddressType::Wwn,
            address: self.wwn.clone(),
            allocated_bytes: self.size_bytes,
            used_bytes: 0,
            state: if self.attachments.is_empty() { "online" } else { "mapped" }.to_string(),
            storage_pool_id: self.pool_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct SimSnapshot {
    name: String,
    uuid: String,
    source_volume: String,
    size_bytes: u64,
}

impl SimSnapshot {
    fn view(&self) -> ProviderSnapshot {
        ProviderSnapshot {
            name: self.name.clone(),
            external_uuid: self.uuid.clone(),
            source_volume: self.source_volume.clone(),
            allocated_bytes: self.size_bytes,
            state: "available".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct ArrayContents {
    volumes: BTreeMap<String, SimVolume>,
    snapshots: BTreeMap<String, SimSnapshot>,
    /// Secondary-storage images available as copy sources
    images: BTreeMap<String, u64>,
}

impl ArrayContents {
    fn used_bytes(&self) -> u64 {
        self.volumes.values().map(|v| v.size_bytes).sum()
    }
}

// =============================================================================
// Simulated Array
// =============================================================================

/// In-memory storage array
pub struct SimulatedArray {
    config: RwLock<SimulatedArrayConfig>,
    contents: RwLock<ArrayContents>,
    faults: Mutex<HashMap<ArrayOperation, Fault>>,
    connected: AtomicBool,
    next_lun: AtomicU32,
}

impl SimulatedArray {
    pub fn new(config: SimulatedArrayConfig) -> Self {
        Self {
            config: RwLock::new(config),
            contents: RwLock::new(ArrayContents::default()),
            faults: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            next_lun: AtomicU32::new(1),
        }
    }

    /// Make every subsequent `op` misbehave until cleared
    pub fn inject_fault(&self, op: ArrayOperation, fault: Fault) {
        self.faults.lock().insert(op, fault);
    }

    pub fn clear_fault(&self, op: ArrayOperation) {
        self.faults.lock().remove(&op);
    }

    /// Place an image on secondary storage so it can be copied in
    pub async fn stage_image(&self, name: impl Into<String>, size_bytes: u64) {
        self.contents.write().await.images.insert(name.into(), size_bytes);
    }

    /// Place a volume on the array behind the control plane's back
    pub async fn seed_volume(&self, name: impl Into<String>, pool_id: impl Into<String>, size_bytes: u64) {
        let volume = new_volume(name.into(), pool_id.into(), size_bytes);
        self.contents
            .write()
            .await
            .volumes
            .insert(volume.name.clone(), volume);
    }

    pub async fn volume_names(&self) -> Vec<String> {
        self.contents.read().await.volumes.keys().cloned().collect()
    }

    async fn begin(&self, op: ArrayOperation) -> Result<Option<Fault>> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(Error::BackendUnavailable {
                backend: SIMULATED_BACKEND.to_string(),
                reason: "disconnected".to_string(),
            });
        }

        let fault = self.faults.lock().get(&op).copied();
        match fault {
            Some(Fault::Unavailable) => Err(Error::BackendUnavailable {
                backend: SIMULATED_BACKEND.to_string(),
                reason: format!("{} refused by array", op),
            }),
            Some(Fault::TimeoutBeforeApply) => Err(self.hang(op).await),
            other => Ok(other),
        }
    }

    async fn finish(&self, op: ArrayOperation, fault: Option<Fault>) -> Result<()> {
        if fault == Some(Fault::TimeoutAfterApply) {
            return Err(self.hang(op).await);
        }
        Ok(())
    }

    async fn hang(&self, op: ArrayOperation) -> Error {
        let timeout = self.config.read().await.hang_duration;
        warn!(operation = %op, "Simulated array hanging");
        tokio::time::sleep(timeout).await;
        Error::BackendTimeout {
            backend: SIMULATED_BACKEND.to_string(),
            operation: op.to_string(),
            timeout,
        }
    }

    fn not_found(kind: &str, name: &str) -> Error {
        Error::ResourceNotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    fn failed(op: ArrayOperation, reason: impl Into<String>) -> Error {
        Error::BackendOperationFailed {
            backend: SIMULATED_BACKEND.to_string(),
            operation: op.to_string(),
            reason: reason.into(),
        }
    }
}

impl Default for SimulatedArray {
    fn default() -> Self {
        Self::new(SimulatedArrayConfig::default())
    }
}

fn new_volume(name: String, pool_id: String, size_bytes: u64) -> SimVolume {
    let uuid = uuid::Uuid::new_v4();
    let hex = uuid.simple().to_string();
    SimVolume {
        name,
        uuid: uuid.to_string(),
        wwn: format!("naa.6{}", &hex[..31]),
        size_bytes,
        pool_id,
        attachments: BTreeMap::new(),
    }
}

fn image_view(name: &str, pool_id: &str, size_bytes: u64) -> ProviderVolume {
    ProviderVolume {
        name: name.to_string(),
        external_uuid: String::new(),
        address_type: AddressType::Path,
        address: name.to_string(),
        allocated_bytes: size_bytes,
        used_bytes: size_bytes,
        state: "archived".to_string(),
        storage_pool_id: pool_id.to_string(),
    }
}

#[async_trait]
impl StorageAdapter for SimulatedArray {
    fn backend_type(&self) -> &str {
        SIMULATED_BACKEND
    }

    async fn validate(&self) -> Result<()> {
        let fault = self.begin(ArrayOperation::Validate).await?;
        let config = self.config.read().await;
        if config.capacity_bytes == 0 {
            return Err(Error::Configuration(
                "simulated array capacity must be positive".to_string(),
            ));
        }
        drop(config);
        self.finish(ArrayOperation::Validate, fault).await
    }

    async fn refresh(&self, settings: &BTreeMap<String, String>) -> Result<()> {
        let mut config = self.config.read().await.clone();
        config.apply_settings(settings)?;
        *self.config.write().await = config;
        self.connected.store(true, Ordering::Release);
        info!("Simulated array settings refreshed");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn create(
        &self,
        ctx: &ProviderAdapterContext,
        object: &ProviderAdapterDataObject,
        _profile: &ProviderAdapterDiskProfile,
        size_bytes: u64,
    ) -> Result<ProviderVolume> {
        let fault = self.begin(ArrayOperation::Create).await?;
        let name = naming::resolve_name(ctx, object);
        let capacity = self.config.read().await.capacity_bytes;

        let view = {
            let mut contents = self.contents.write().await;
            if let Some(existing) = contents.volumes.get(&name) {
                debug!(name = %name, "Create found existing volume");
                existing.view()
            } else {
                if contents.used_bytes() + size_bytes > capacity {
                    return Err(Self::failed(ArrayOperation::Create, "insufficient capacity"));
                }
                let volume = new_volume(name.clone(), object.storage_pool_id.clone(), size_bytes);
                let view = volume.view();
                contents.volumes.insert(name.clone(), volume);
                info!(name = %name, size_bytes, "Created simulated volume");
                view
            }
        };

        self.finish(ArrayOperation::Create, fault).await?;
        Ok(view)
    }

    async fn attach(
        &self,
        ctx: &ProviderAdapterContext,
        object: &ProviderAdapterDataObject,
        hostname: &str,
    ) -> Result<String> {
        let fault = self.begin(ArrayOperation::Attach).await?;
        if !self.can_access_host(hostname).await? {
            return Err(Self::failed(
                ArrayOperation::Attach,
                format!("host {} is not in the access list", hostname),
            ));
        }

        let name = naming::resolve_name(ctx, object);
        let lun = {
            let mut contents = self.contents.write().await;
            let volume = contents
                .volumes
                .get_mut(&name)
                .ok_or_else(|| Self::not_found("volume", &name))?;
            volume
                .attachments
                .entry(hostname.to_string())
                .or_insert_with(|| self.next_lun.fetch_add(1, Ordering::Relaxed).to_string())
                .clone()
        };

        self.finish(ArrayOperation::Attach, fault).await?;
        Ok(lun)
    }

    async fn detach(
        &self,
        ctx: &ProviderAdapterContext,
        object: &ProviderAdapterDataObject,
        hostname: &str,
    ) -> Result<()> {
        let fault = self.begin(ArrayOperation::Detach).await?;
        let name = naming::resolve_name(ctx, object);
        if let Some(volume) = self.contents.write().await.volumes.get_mut(&name) {
            volume.attachments.remove(hostname);
        }
        self.finish(ArrayOperation::Detach, fault).await
    }

    async fn delete(&self, ctx: &ProviderAdapterContext, object: &ProviderAdapterDataObject) -> Result<()> {
        let fault = self.begin(ArrayOperation::Delete).await?;
        let name = naming::resolve_name(ctx, object);
        {
            let mut contents = self.contents.write().await;
            match object.object_type {
                ProviderObjectType::Snapshot => {
                    contents.snapshots.remove(&name);
                }
                ProviderObjectType::Volume => {
                    if let Some(volume) = contents.volumes.get(&name) {
                        if !volume.attachments.is_empty() {
                            return Err(Self::failed(ArrayOperation::Delete, "volume is mapped"));
                        }
                    }
                    contents.volumes.remove(&name);
                }
                ProviderObjectType::Template | ProviderObjectType::Archive => {
                    contents.images.remove(&name);
                }
            }
        }
        self.finish(ArrayOperation::Delete, fault).await
    }

    async fn copy(
        &self,
        ctx: &ProviderAdapterContext,
        source: &ProviderAdapterDataObject,
        destination: &ProviderAdapterDataObject,
    ) -> Result<ProviderVolume> {
        let fault = self.begin(ArrayOperation::Copy).await?;
        let source_name = naming::resolve_name(ctx, source);
        let destination_name = naming::resolve_name(ctx, destination);
        let capacity = self.config.read().await.capacity_bytes;

        let view = {
            let mut contents = self.contents.write().await;
            let size_bytes = match source.object_type {
                ProviderObjectType::Volume => contents.volumes.get(&source_name).map(|v| v.size_bytes),
                ProviderObjectType::Snapshot => contents.snapshots.get(&source_name).map(|s| s.size_bytes),
                ProviderObjectType::Template | ProviderObjectType::Archive => {
                    contents.images.get(&source_name).copied()
                }
            }
            .ok_or_else(|| Self::not_found(&source.object_type.to_string(), &source_name))?;

            if matches!(
                destination.object_type,
                ProviderObjectType::Template | ProviderObjectType::Archive
            ) {
                // Copies out to secondary storage
                contents.images.entry(destination_name.clone()).or_insert(size_bytes);
                image_view(&destination_name, &destination.storage_pool_id, size_bytes)
            } else if let Some(existing) = contents.volumes.get(&destination_name) {
                existing.view()
            } else {
                if contents.used_bytes() + size_bytes > capacity {
                    return Err(Self::failed(ArrayOperation::Copy, "insufficient capacity"));
                }
                let volume = new_volume(
                    destination_name.clone(),
                    destination.storage_pool_id.clone(),
                    size_bytes,
                );
                let view = volume.view();
                contents.volumes.insert(destination_name, volume);
                view
            }
        };

        self.finish(ArrayOperation::Copy, fault).await?;
        Ok(view)
    }

    async fn snapshot(
        &self,
        ctx: &ProviderAdapterContext,
        volume: &ProviderAdapterDataObject,
        snapshot: &ProviderAdapterDataObject,
    ) -> Result<ProviderSnapshot> {
        let fault = self.begin(ArrayOperation::Snapshot).await?;
        let volume_name = naming::resolve_name(ctx, volume);
        let snapshot_name = naming::resolve_name(ctx, snapshot);

        let view = {
            let mut contents = self.contents.write().await;
            let size_bytes = contents
                .volumes
                .get(&volume_name)
                .map(|v| v.size_bytes)
                .ok_or_else(|| Self::not_found("volume", &volume_name))?;
            contents
                .snapshots
                .entry(snapshot_name.clone())
                .or_insert_with(|| SimSnapshot {
                    name: snapshot_name,
                    uuid: uuid::Uuid::new_v4().to_string(),
                    source_volume: volume_name,
                    size_bytes,
                })
                .view()
        };

        self.finish(ArrayOperation::Snapshot, fault).await?;
        Ok(view)
    }

    async fn revert(
        &self,
        ctx: &ProviderAdapterContext,
        snapshot: &ProviderAdapterDataObject,
        volume: &ProviderAdapterDataObject,
    ) -> Result<ProviderVolume> {
        let fault = self.begin(ArrayOperation::Revert).await?;
        let snapshot_name = naming::resolve_name(ctx, snapshot);
        let volume_name = naming::resolve_name(ctx, volume);

        let view = {
            let mut contents = self.contents.write().await;
            let snap = contents
                .snapshots
                .get(&snapshot_name)
                .cloned()
                .ok_or_else(|| Self::not_found("snapshot", &snapshot_name))?;
            if snap.source_volume != volume_name {
                return Err(Self::failed(
                    ArrayOperation::Revert,
                    format!("snapshot {} was not taken from {}", snapshot_name, volume_name),
                ));
            }
            let target = contents
                .volumes
                .get_mut(&volume_name)
                .ok_or_else(|| Self::not_found("volume", &volume_name))?;
            target.size_bytes = snap.size_bytes;
            target.view()
        };

        self.finish(ArrayOperation::Revert, fault).await?;
        Ok(view)
    }

    async fn resize(
        &self,
        ctx: &ProviderAdapterContext,
        object: &ProviderAdapterDataObject,
        new_size_bytes: u64,
    ) -> Result<()> {
        let fault = self.begin(ArrayOperation::Resize).await?;
        let name = naming::resolve_name(ctx, object);
        let capacity = self.config.read().await.capacity_bytes;

        {
            let mut contents = self.contents.write().await;
            let used = contents.used_bytes();
            let volume = contents
                .volumes
                .get_mut(&name)
                .ok_or_else(|| Self::not_found("volume", &name))?;
            if new_size_bytes < volume.size_bytes {
                return Err(Self::failed(ArrayOperation::Resize, "shrinking is not supported"));
            }
            if used - volume.size_bytes + new_size_bytes > capacity {
                return Err(Self::failed(ArrayOperation::Resize, "insufficient capacity"));
            }
            volume.size_bytes = new_size_bytes;
        }

        self.finish(ArrayOperation::Resize, fault).await
    }

    async fn get_volume(
        &self,
        ctx: &ProviderAdapterContext,
        object: &ProviderAdapterDataObject,
    ) -> Result<Option<ProviderVolume>> {
        let fault = self.begin(ArrayOperation::GetVolume).await?;
        let name = naming::resolve_name(ctx, object);
        let view = self.contents.read().await.volumes.get(&name).map(SimVolume::view);
        self.finish(ArrayOperation::GetVolume, fault).await?;
        Ok(view)
    }

    async fn get_snapshot(
        &self,
        ctx: &ProviderAdapterContext,
        object: &ProviderAdapterDataObject,
    ) -> Result<Option<ProviderSnapshot>> {
        let fault = self.begin(ArrayOperation::GetSnapshot).await?;
        let name = naming::resolve_name(ctx, object);
        let view = self.contents.read().await.snapshots.get(&name).map(SimSnapshot::view);
        self.finish(ArrayOperation::GetSnapshot, fault).await?;
        Ok(view)
    }

    async fn get_volume_by_address(
        &self,
        _ctx: &ProviderAdapterContext,
        address_type: AddressType,
        address: &str,
    ) -> Result<Option<ProviderVolume>> {
        let fault = self.begin(ArrayOperation::GetVolume).await?;
        let view = self
            .contents
            .read()
            .await
            .volumes
            .values()
            .find(|v| match address_type {
                AddressType::Wwn | AddressType::NvmeGuid => v.wwn == address,
                AddressType::Path => v.name == address,
            })
            .map(SimVolume::view);
        self.finish(ArrayOperation::GetVolume, fault).await?;
        Ok(view)
    }

    async fn stats(&self) -> Result<ProviderStats> {
        let fault = self.begin(ArrayOperation::Stats).await?;
        let stats = ProviderStats {
            capacity_bytes: self.config.read().await.capacity_bytes,
            used_bytes: self.contents.read().await.used_bytes(),
        };
        self.finish(ArrayOperation::Stats, fault).await?;
        Ok(stats)
    }

    async fn can_access_host(&self, hostname: &str) -> Result<bool> {
        let config = self.config.read().await;
        Ok(config.allowed_hosts.is_empty() || config.allowed_hosts.iter().any(|h| h == hostname))
    }

    fn can_direct_attach_snapshot(&self) -> bool {
        self.config
            .try_read()
            .map(|c| c.direct_attach_snapshots)
            .unwrap_or(false)
    }

    async fn connection_id_map(
        &self,
        object: &ProviderAdapterDataObject,
    ) -> Result<BTreeMap<String, String>> {
        let Some(name) = object.external_name.as_deref() else {
            return Ok(BTreeMap::new());
        };
        Ok(self
            .contents
            .read()
            .await
            .volumes
            .get(name)
            .map(|v| v.attachments.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entity::Owner;
    use assert_matches::assert_matches;

    fn ctx() -> ProviderAdapterContext {
        ProviderAdapterContext::from_owner(&Owner::new("acct-1", "dom-1", "zone-1"), None)
    }

    fn object(id: &str, object_type: ProviderObjectType) -> ProviderAdapterDataObject {
        ProviderAdapterDataObject {
            id: id.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
            name: id.into(),
            object_type,
            storage_pool_id: "pool-1".into(),
            external_name: None,
            external_uuid: None,
            external_connection_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_by_name() {
        let array = SimulatedArray::default();
        let obj = object("vol-1", ProviderObjectType::Volume);
        let profile = ProviderAdapterDiskProfile::default();

        let first = array.create(&ctx(), &obj, &profile, 1 << 30).await.unwrap();
        let second = array.create(&ctx(), &obj, &profile, 1 << 30).await.unwrap();

        assert_eq!(first.external_uuid, second.external_uuid);
        assert_eq!(array.volume_names().await.len(), 1);
        assert_eq!(first.name, naming::external_name(&ctx(), &obj));
    }

    #[tokio::test]
    async fn test_absent_is_none_and_unreachable_is_error() {
        let array = SimulatedArray::default();
        let obj = object("vol-1", ProviderObjectType::Volume);
        assert!(array.get_volume(&ctx(), &obj).await.unwrap().is_none());

        array.inject_fault(ArrayOperation::GetVolume, Fault::Unavailable);
        assert_matches!(
            array.get_volume(&ctx(), &obj).await,
            Err(Error::BackendUnavailable { .. })
        );
    }

    #[tokio::test]
    async fn test_attach_respects_access_list() {
        let array = SimulatedArray::new(SimulatedArrayConfig {
            allowed_hosts: vec!["host-a".into()],
            ..Default::default()
        });
        let obj = object("vol-1", ProviderObjectType::Volume);
        array
            .create(&ctx(), &obj, &ProviderAdapterDiskProfile::default(), 1 << 30)
            .await
            .unwrap();

        let lun = array.attach(&ctx(), &obj, "host-a").await.unwrap();
        assert_eq!(array.attach(&ctx(), &obj, "host-a").await.unwrap(), lun);
        assert_matches!(
            array.attach(&ctx(), &obj, "host-b").await,
            Err(Error::BackendOperationFailed { .. })
        );

        let named = obj.clone().with_external_name(naming::external_name(&ctx(), &obj));
        let map = array.connection_id_map(&named).await.unwrap();
        assert_eq!(map.get("host-a"), Some(&lun));
    }

    #[tokio::test]
    async fn test_timeout_after_apply_leaves_object() {
        let array = SimulatedArray::new(SimulatedArrayConfig {
            hang_duration: Duration::from_millis(10),
            ..Default::default()
        });
        array.inject_fault(ArrayOperation::Create, Fault::TimeoutAfterApply);
        let obj = object("vol-1", ProviderObjectType::Volume);

        let result = array
            .create(&ctx(), &obj, &ProviderAdapterDiskProfile::default(), 1 << 30)
            .await;
        assert_matches!(result, Err(Error::BackendTimeout { .. }));

        array.clear_fault(ArrayOperation::Create);
        assert!(array.get_volume(&ctx(), &obj).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_snapshot_revert_and_resize() {
        let array = SimulatedArray::default();
        let vol = object("vol-1", ProviderObjectType::Volume);
        let snap = object("snap-1", ProviderObjectType::Snapshot);
        array
            .create(&ctx(), &vol, &ProviderAdapterDiskProfile::default(), 1 << 30)
            .await
            .unwrap();

        array.snapshot(&ctx(), &vol, &snap).await.unwrap();
        array.resize(&ctx(), &vol, 2 << 30).await.unwrap();
        assert_matches!(
            array.resize(&ctx(), &vol, 1 << 20).await,
            Err(Error::BackendOperationFailed { .. })
        );

        let reverted = array.revert(&ctx(), &snap, &vol).await.unwrap();
        assert_eq!(reverted.allocated_bytes, 1 << 30);
    }

    #[tokio::test]
    async fn test_copy_from_staged_image() {
        let array = SimulatedArray::default();
        let image = object("upload-1", ProviderObjectType::Template).with_external_name("img-1");
        let dst = object("vol-1", ProviderObjectType::Volume);

        assert_matches!(
            array.copy(&ctx(), &image, &dst).await,
            Err(Error::ResourceNotFound { .. })
        );

        array.stage_image("img-1", 4 << 30).await;
        let copied = array.copy(&ctx(), &image, &dst).await.unwrap();
        assert_eq!(copied.allocated_bytes, 4 << 30);
    }

    #[tokio::test]
    async fn test_disconnect_and_refresh() {
        let array = SimulatedArray::default();
        array.disconnect().await.unwrap();
        assert_matches!(array.validate().await, Err(Error::BackendUnavailable { .. }));

        let mut settings = BTreeMap::new();
        settings.insert("capacity_bytes".to_string(), "1024".to_string());
        array.refresh(&settings).await.unwrap();
        array.validate().await.unwrap();
        assert_eq!(array.stats().await.unwrap().capacity_bytes, 1024);

        settings.insert("capacity_bytes".to_string(), "lots".to_string());
        assert_matches!(array.refresh(&settings).await, Err(Error::Configuration(_)));
    }
}
