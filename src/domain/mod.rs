//! Domain layer - Lifecycle entities, boundary types and port definitions
//!
//! Entities carry their own transition tables; ports define the seams that
//! storage adapters, host agents and inventory owners implement.

pub mod entity;
pub mod file_share;
pub mod inventory;
pub mod ports;
pub mod snapshot;
pub mod types;
pub mod volume;

pub use entity::{EntityKind, LifecycleEntity, LifecycleEvent, LifecycleState, LifecycleStamp, Owner};
pub use file_share::{file_share_transitions, FileShare, FileShareEvent, FileShareState, ShareProtocol};
pub use inventory::{DiskOffering, Host, HostStatus, PoolScope, StoragePool};
pub use ports::*;
pub use snapshot::{snapshot_transitions, Snapshot, SnapshotEvent, SnapshotState};
pub use types::*;
pub use volume::{volume_transitions, Volume, VolumeEvent, VolumeState};
