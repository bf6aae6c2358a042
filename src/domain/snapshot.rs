//! Snapshot Entity

use super::entity::{generate_id, EntityKind, LifecycleEntity, LifecycleEvent, LifecycleStamp, LifecycleState, Owner};
use crate::error::Result;
use crate::fsm::TransitionTable;
use serde::{Deserialize, Serialize};

/// Snapshot lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotState {
    Creating,
    CreatedOnPrimary,
    BackingUp,
    BackedUp,
    /// Delete in progress for a snapshot that only exists on primary
    DestroyingPrimary,
    /// Delete in progress for a backed-up snapshot
    Destroying,
    Destroyed,
    Error,
}

impl std::fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl LifecycleState for SnapshotState {
    fn all() -> &'static [Self] {
        use SnapshotState::*;
        &[
            Creating,
            CreatedOnPrimary,
            BackingUp,
            BackedUp,
            DestroyingPrimary,
            Destroying,
            Destroyed,
            Error,
        ]
    }

    fn is_terminal(&self) -> bool {
        matches!(self, SnapshotState::Error | SnapshotState::Destroyed)
    }
}

/// Snapshot lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotEvent {
    CreateRequested,
    OperationSucceeded,
    OperationFailed,
    BackupSkipped,
    BackupRequested,
    DestroyRequested,
}

impl std::fmt::Display for SnapshotEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl LifecycleEvent for SnapshotEvent {
    fn all() -> &'static [Self] {
        use SnapshotEvent::*;
        &[
            CreateRequested,
            OperationSucceeded,
            OperationFailed,
            BackupSkipped,
            BackupRequested,
            DestroyRequested,
        ]
    }
}

/// Build the snapshot transition graph
pub fn snapshot_transitions() -> Result<TransitionTable<SnapshotState, SnapshotEvent>> {
    use SnapshotEvent::*;
    use SnapshotState::*;

    TransitionTable::builder(EntityKind::Snapshot)
        .initial(CreateRequested, Creating)
        .edge(Creating, OperationSucceeded, CreatedOnPrimary)
        .edge(Creating, BackupSkipped, BackedUp)
        .edge(Creating, OperationFailed, Error)
        .edge(CreatedOnPrimary, BackupRequested, BackingUp)
        .edge(BackingUp, OperationSucceeded, BackedUp)
        .edge(BackingUp, OperationFailed, Error)
        // A failed delete returns to where it started
        .edge(CreatedOnPrimary, DestroyRequested, DestroyingPrimary)
        .edge(DestroyingPrimary, OperationSucceeded, Destroyed)
        .edge(DestroyingPrimary, OperationFailed, CreatedOnPrimary)
        .edge(BackedUp, DestroyRequested, Destroying)
        .edge(Destroying, OperationSucceeded, Destroyed)
        .edge(Destroying, OperationFailed, BackedUp)
        .build()
}

/// Persisted snapshot record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub uuid: String,
    pub name: String,
    lifecycle: LifecycleStamp<SnapshotState>,
    /// Volume the snapshot was taken from
    pub volume_id: String,
    pub size_bytes: u64,
    pub storage_pool_id: Option<String>,
    pub external_name: Option<String>,
    pub external_uuid: Option<String>,
    /// Secondary-storage copy location once backed up
    pub backup_path: Option<String>,
    pub owner: Owner,
}

impl Snapshot {
    pub fn new(name: impl Into<String>, volume_id: impl Into<String>, owner: Owner, size_bytes: u64) -> Self {
        Self {
            id: generate_id("snap"),
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            lifecycle: LifecycleStamp::new(SnapshotState::Creating),
            volume_id: volume_id.into(),
            size_bytes,
            storage_pool_id: None,
            external_name: None,
            external_uuid: None,
            backup_path: None,
            owner,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

impl LifecycleEntity for Snapshot {
    type State = SnapshotState;
    type Event = SnapshotEvent;

    const KIND: EntityKind = EntityKind::Snapshot;

    fn id(&self) -> &str {
        &self.id
    }

    fn stamp(&self) -> &LifecycleStamp<SnapshotState> {
        &self.lifecycle
    }

    fn stamp_mut(&mut self) -> &mut LifecycleStamp<SnapshotState> {
        &mut self.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_table_is_sound() {
        snapshot_transitions().unwrap().check_soundness().unwrap();
    }

    #[test]
    fn test_backup_can_be_skipped() {
        let table = snapshot_transitions().unwrap();
        assert_eq!(
            table.next(SnapshotState::Creating, SnapshotEvent::BackupSkipped),
            Some(SnapshotState::BackedUp)
        );
        assert_eq!(
            table.next(SnapshotState::BackingUp, SnapshotEvent::OperationFailed),
            Some(SnapshotState::Error)
        );
        assert!(table.events_from(SnapshotState::Error).is_empty());
    }

    #[test]
    fn test_failed_delete_returns_to_origin() {
        let table = snapshot_transitions().unwrap();
        let primary = table
            .next(SnapshotState::CreatedOnPrimary, SnapshotEvent::DestroyRequested)
            .unwrap();
        assert_eq!(
            table.next(primary, SnapshotEvent::OperationFailed),
            Some(SnapshotState::CreatedOnPrimary)
        );

        let backed_up = table
            .next(SnapshotState::BackedUp, SnapshotEvent::DestroyRequested)
            .unwrap();
        assert_eq!(
            table.next(backed_up, SnapshotEvent::OperationFailed),
            Some(SnapshotState::BackedUp)
        );
        assert_eq!(
            table.next(primary, SnapshotEvent::OperationSucceeded),
            Some(SnapshotState::Destroyed)
        );
    }
}
