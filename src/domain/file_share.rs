//! File Share Entity
//!
//! Same mechanism as volumes, different graph: a share is deployed once,
//! then cycles between running and stopped until destroyed.

use super::entity::{generate_id, EntityKind, LifecycleEntity, LifecycleEvent, LifecycleStamp, LifecycleState, Owner};
use crate::error::Result;
use crate::fsm::TransitionTable;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileShareState {
    Allocated,
    Deploying,
    Ready,
    Stopping,
    Stopped,
    Starting,
    Destroyed,
    Expunging,
    Expunged,
    Error,
}

impl std::fmt::Display for FileShareState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl LifecycleState for FileShareState {
    fn all() -> &'static [Self] {
        use FileShareState::*;
        &[
            Allocated, Deploying, Ready, Stopping, Stopped, Starting, Destroyed, Expunging,
            Expunged, Error,
        ]
    }

    fn is_terminal(&self) -> bool {
        matches!(self, FileShareState::Expunged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileShareEvent {
    CreateRequested,
    DeployRequested,
    StartRequested,
    StopRequested,
    OperationSucceeded,
    OperationFailed,
    DestroyRequested,
    RecoverRequested,
    ExpungeRequested,
}

impl std::fmt::Display for FileShareEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl LifecycleEvent for FileShareEvent {
    fn all() -> &'static [Self] {
        use FileShareEvent::*;
        &[
            CreateRequested,
            DeployRequested,
            StartRequested,
            StopRequested,
            OperationSucceeded,
            OperationFailed,
            DestroyRequested,
            RecoverRequested,
            ExpungeRequested,
        ]
    }
}

/// Build the file share transition graph
pub fn file_share_transitions() -> Result<TransitionTable<FileShareState, FileShareEvent>> {
    use FileShareEvent::*;
    use FileShareState::*;

    TransitionTable::builder(EntityKind::FileShare)
        .initial(CreateRequested, Allocated)
        .edge(Allocated, DeployRequested, Deploying)
        .edge(Deploying, OperationSucceeded, Ready)
        .edge(Deploying, OperationFailed, Error)
        .edge(Ready, StopRequested, Stopping)
        .edge(Stopping, OperationSucceeded, Stopped)
        .edge(Stopping, OperationFailed, Ready)
        .edge(Stopped, StartRequested, Starting)
        .edge(Starting, OperationSucceeded, Ready)
        .edge(Starting, OperationFailed, Stopped)
        .edges(&[Allocated, Stopped, Error], DestroyRequested, Destroyed)
        .edge(Destroyed, RecoverRequested, Stopped)
        .edge(Destroyed, ExpungeRequested, Expunging)
        .edge(Expunging, OperationSucceeded, Expunged)
        .edge(Expunging, OperationFailed, Destroyed)
        .build()
}

/// Share export protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareProtocol {
    Nfs,
    Cifs,
}

/// Persisted file share record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileShare {
    pub id: String,
    pub uuid: String,
    pub name: String,
    lifecycle: LifecycleStamp<FileShareState>,
    pub size_bytes: u64,
    pub protocol: ShareProtocol,
    /// Block volume backing the share
    pub volume_id: Option<String>,
    pub storage_pool_id: Option<String>,
    pub export_path: Option<String>,
    pub owner: Owner,
}

impl FileShare {
    pub fn new(name: impl Into<String>, owner: Owner, size_bytes: u64, protocol: ShareProtocol) -> Self {
        Self {
            id: generate_id("share"),
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            lifecycle: LifecycleStamp::new(FileShareState::Allocated),
            size_bytes,
            protocol,
            volume_id: None,
            storage_pool_id: None,
            export_path: None,
            owner,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

impl LifecycleEntity for FileShare {
    type State = FileShareState;
    type Event = FileShareEvent;

    const KIND: EntityKind = EntityKind::FileShare;

    fn id(&self) -> &str {
        &self.id
    }

    fn stamp(&self) -> &LifecycleStamp<FileShareState> {
        &self.lifecycle
    }

    fn stamp_mut(&mut self) -> &mut LifecycleStamp<FileShareState> {
        &mut self.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_share_table_is_sound() {
        file_share_transitions().unwrap().check_soundness().unwrap();
    }

    #[test]
    fn test_stop_start_cycle() {
        let table = file_share_transitions().unwrap();
        let mut state = FileShareState::Ready;
        for event in [
            FileShareEvent::StopRequested,
            FileShareEvent::OperationSucceeded,
            FileShareEvent::StartRequested,
            FileShareEvent::OperationSucceeded,
        ] {
            state = table.next(state, event).unwrap();
        }
        assert_eq!(state, FileShareState::Ready);
    }

    #[test]
    fn test_running_share_cannot_be_destroyed() {
        let table = file_share_transitions().unwrap();
        assert_eq!(table.next(FileShareState::Ready, FileShareEvent::DestroyRequested), None);
    }
}
