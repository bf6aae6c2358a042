//! Volume Entity
//!
//! Block volume record, its states, events and transition table.

use super::entity::{generate_id, EntityKind, LifecycleEntity, LifecycleEvent, LifecycleStamp, LifecycleState, Owner};
use crate::error::Result;
use crate::fsm::TransitionTable;
use serde::{Deserialize, Serialize};

// =============================================================================
// States
// =============================================================================

/// Volume lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeState {
    /// Database record only, no physical object
    Allocated,
    Creating,
    Ready,
    Resizing,
    Snapshotting,
    Migrating,
    Reverting,
    /// Being uploaded to secondary staging
    UploadOp,
    Uploaded,
    Destroy,
    Expunging,
    Expunged,
    /// Released from management; the row no longer exists
    Unmanaged,
}

impl VolumeState {
    /// States with an adapter or staging operation outstanding
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            VolumeState::Creating
                | VolumeState::Resizing
                | VolumeState::Snapshotting
                | VolumeState::Migrating
                | VolumeState::Reverting
                | VolumeState::UploadOp
                | VolumeState::Expunging
        )
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl LifecycleState for VolumeState {
    fn all() -> &'static [Self] {
        use VolumeState::*;
        &[
            Allocated, Creating, Ready, Resizing, Snapshotting, Migrating, Reverting, UploadOp,
            Uploaded, Destroy, Expunging, Expunged, Unmanaged,
        ]
    }

    fn is_terminal(&self) -> bool {
        matches!(self, VolumeState::Expunged | VolumeState::Unmanaged)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Volume lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeEvent {
    AllocationRequested,
    CreateRequested,
    CopyRequested,
    CopySucceeded,
    CopyFailed,
    OperationSucceeded,
    OperationFailed,
    ResizeRequested,
    SnapshotRequested,
    MigrationRequested,
    RevertRequested,
    UploadRequested,
    DestroyRequested,
    RecoverRequested,
    ExpungingRequested,
    UnmanageRequested,
}

impl std::fmt::Display for VolumeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl LifecycleEvent for VolumeEvent {
    fn all() -> &'static [Self] {
        use VolumeEvent::*;
        &[
            AllocationRequested, CreateRequested, CopyRequested, CopySucceeded, CopyFailed,
            OperationSucceeded, OperationFailed, ResizeRequested, SnapshotRequested,
            MigrationRequested, RevertRequested, UploadRequested, DestroyRequested,
            RecoverRequested, ExpungingRequested, UnmanageRequested,
        ]
    }
}

// =============================================================================
// Transition Table
// =============================================================================

/// Build the volume transition graph
pub fn volume_transitions() -> Result<TransitionTable<VolumeState, VolumeEvent>> {
    use VolumeEvent::*;
    use VolumeState::*;

    TransitionTable::builder(EntityKind::Volume)
        .initial(AllocationRequested, Allocated)
        .adoptable(Ready)
        // Provisioning
        .edge(Allocated, CreateRequested, Creating)
        .edge(Creating, OperationSucceeded, Ready)
        .edge(Creating, OperationFailed, Allocated)
        // Secondary-storage staging
        .edge(Allocated, UploadRequested, UploadOp)
        .edge(UploadOp, OperationSucceeded, Uploaded)
        .edge(UploadOp, OperationFailed, Allocated)
        .edge(Uploaded, CopyRequested, Creating)
        .edge(Creating, CopySucceeded, Ready)
        .edge(Creating, CopyFailed, Uploaded)
        // Side trips
        .edge(Ready, ResizeRequested, Resizing)
        .edge(Ready, SnapshotRequested, Snapshotting)
        .edge(Ready, MigrationRequested, Migrating)
        .edge(Ready, RevertRequested, Reverting)
        .edges(&[Resizing, Snapshotting, Migrating, Reverting], OperationSucceeded, Ready)
        .edges(&[Resizing, Snapshotting, Migrating, Reverting], OperationFailed, Ready)
        // Teardown
        .edges(&[Ready, Creating, Allocated, Uploaded], DestroyRequested, Destroy)
        .edge(Destroy, RecoverRequested, Ready)
        .edge(Destroy, ExpungingRequested, Expunging)
        .edge(Expunging, OperationSucceeded, Expunged)
        .edge(Expunging, OperationFailed, Destroy)
        // Reconciliation
        .edge(Ready, UnmanageRequested, Unmanaged)
        .build()
}

// =============================================================================
// Volume Record
// =============================================================================

/// Persisted volume record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: String,
    pub uuid: String,
    pub name: String,
    lifecycle: LifecycleStamp<VolumeState>,
    pub size_bytes: u64,
    pub disk_offering_id: Option<String>,
    /// On-disk format (qcow2, raw, ...)
    pub format: String,
    /// Pool owning the physical object
    pub storage_pool_id: Option<String>,
    pub external_name: Option<String>,
    pub external_uuid: Option<String>,
    pub path: Option<String>,
    /// Addressing token handed out by the last attach
    pub connection_id: Option<String>,
    /// Host the volume is currently attached to
    pub attached_host: Option<String>,
    /// Secondary-storage location of an uploaded image
    pub staging_path: Option<String>,
    pub encrypted: bool,
    pub owner: Owner,
}

impl Volume {
    /// New, not yet persisted volume
    pub fn new(name: impl Into<String>, owner: Owner, size_bytes: u64) -> Self {
        Self {
            id: generate_id("vol"),
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            lifecycle: LifecycleStamp::new(VolumeState::Allocated),
            size_bytes,
            disk_offering_id: None,
            format: "qcow2".to_string(),
            storage_pool_id: None,
            external_name: None,
            external_uuid: None,
            path: None,
            connection_id: None,
            attached_host: None,
            staging_path: None,
            encrypted: false,
            owner,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_pool(mut self, pool_id: impl Into<String>) -> Self {
        self.storage_pool_id = Some(pool_id.into());
        self
    }

    pub fn with_disk_offering(mut self, offering_id: impl Into<String>) -> Self {
        self.disk_offering_id = Some(offering_id.into());
        self
    }

    /// Whether a physical object is expected to exist on the backend
    pub fn has_physical_object(&self) -> bool {
        self.external_name.is_some()
    }

    pub fn is_attached(&self) -> bool {
        self.attached_host.is_some()
    }
}

impl LifecycleEntity for Volume {
    type State = VolumeState;
    type Event = VolumeEvent;

    const KIND: EntityKind = EntityKind::Volume;

    fn id(&self) -> &str {
        &self.id
    }

    fn stamp(&self) -> &LifecycleStamp<VolumeState> {
        &self.lifecycle
    }

    fn stamp_mut(&mut self) -> &mut LifecycleStamp<VolumeState> {
        &mut self.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TransitionTable<VolumeState, VolumeEvent> {
        volume_transitions().unwrap()
    }

    #[test]
    fn test_volume_table_is_sound() {
        table().check_soundness().unwrap();
    }

    #[test]
    fn test_every_in_progress_state_has_both_exits() {
        let table = table();
        for state in VolumeState::all().iter().filter(|s| s.is_in_progress()) {
            let events = table.events_from(*state);
            let has_success = events.contains(&VolumeEvent::OperationSucceeded)
                || events.contains(&VolumeEvent::CopySucceeded);
            let has_failure = events.contains(&VolumeEvent::OperationFailed)
                || events.contains(&VolumeEvent::CopyFailed);
            assert!(has_success && has_failure, "{} lacks an exit", state);
        }
    }

    #[test]
    fn test_side_trips_return_to_ready() {
        let table = table();
        for (start, busy) in [
            (VolumeEvent::ResizeRequested, VolumeState::Resizing),
            (VolumeEvent::SnapshotRequested, VolumeState::Snapshotting),
            (VolumeEvent::MigrationRequested, VolumeState::Migrating),
            (VolumeEvent::RevertRequested, VolumeState::Reverting),
        ] {
            assert_eq!(table.next(VolumeState::Ready, start), Some(busy));
            assert_eq!(table.next(busy, VolumeEvent::OperationSucceeded), Some(VolumeState::Ready));
            assert_eq!(table.next(busy, VolumeEvent::OperationFailed), Some(VolumeState::Ready));
        }
    }

    #[test]
    fn test_copy_failure_returns_to_uploaded() {
        let table = table();
        assert_eq!(
            table.next(VolumeState::Creating, VolumeEvent::CopyFailed),
            Some(VolumeState::Uploaded)
        );
        assert_eq!(
            table.next(VolumeState::Creating, VolumeEvent::OperationFailed),
            Some(VolumeState::Allocated)
        );
    }

    #[test]
    fn test_expunged_is_terminal() {
        let table = table();
        assert!(table.events_from(VolumeState::Expunged).is_empty());
        assert!(table.events_from(VolumeState::Unmanaged).is_empty());
    }

    #[test]
    fn test_only_ready_is_adoptable() {
        let table = table();
        assert!(table.is_adoptable(VolumeState::Ready));
        assert!(!table.is_adoptable(VolumeState::Allocated));
    }
}
