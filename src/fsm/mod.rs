//! Lifecycle State Machines
//!
//! Per-kind transition tables, the generic persisted engine, and the
//! listeners notified after each committed transition.

pub mod engine;
pub mod listener;
pub mod table;

pub use engine::StateMachine;
pub use listener::{AuditListener, MetricsListener, TransitionListener, TransitionRecord};
pub use table::{TransitionTable, TransitionTableBuilder};

use crate::domain::entity::LifecycleEntity;
use crate::domain::file_share::{file_share_transitions, FileShare, FileShareEvent, FileShareState};
use crate::domain::snapshot::{snapshot_transitions, Snapshot, SnapshotEvent, SnapshotState};
use crate::domain::volume::{volume_transitions, Volume, VolumeEvent, VolumeState};
use crate::error::Result;
use crate::store::EntityStore;
use std::sync::Arc;
use tracing::info;

/// All transition tables, built and checked once at startup
#[derive(Debug, Clone)]
pub struct LifecycleTables {
    pub volume: Arc<TransitionTable<VolumeState, VolumeEvent>>,
    pub snapshot: Arc<TransitionTable<SnapshotState, SnapshotEvent>>,
    pub file_share: Arc<TransitionTable<FileShareState, FileShareEvent>>,
}

impl LifecycleTables {
    /// Build every table and fail on the first conflict or unsound graph
    pub fn build() -> Result<Self> {
        let volume = volume_transitions()?;
        volume.check_soundness()?;
        let snapshot = snapshot_transitions()?;
        snapshot.check_soundness()?;
        let file_share = file_share_transitions()?;
        file_share.check_soundness()?;

        info!(
            volume_edges = volume.len(),
            snapshot_edges = snapshot.len(),
            file_share_edges = file_share.len(),
            "Transition tables built"
        );

        Ok(Self {
            volume: Arc::new(volume),
            snapshot: Arc::new(snapshot),
            file_share: Arc::new(file_share),
        })
    }
}

/// One engine per entity kind over a shared store
#[derive(Clone)]
pub struct LifecycleEngines {
    pub volumes: Arc<StateMachine<Volume>>,
    pub snapshots: Arc<StateMachine<Snapshot>>,
    pub file_shares: Arc<StateMachine<FileShare>>,
}

impl LifecycleEngines {
    /// Wire engines to `store`, each with the audit listener and, when
    /// given, the metrics listener
    pub fn new<S>(tables: &LifecycleTables, store: Arc<S>, metrics: Option<MetricsListener>) -> Self
    where
        S: EntityStore<Volume> + EntityStore<Snapshot> + EntityStore<FileShare> + 'static,
    {
        let volume_store: Arc<dyn EntityStore<Volume>> = store.clone();
        let snapshot_store: Arc<dyn EntityStore<Snapshot>> = store.clone();
        let file_share_store: Arc<dyn EntityStore<FileShare>> = store;

        Self {
            volumes: Arc::new(engine(tables.volume.clone(), volume_store, &metrics)),
            snapshots: Arc::new(engine(tables.snapshot.clone(), snapshot_store, &metrics)),
            file_shares: Arc::new(engine(tables.file_share.clone(), file_share_store, &metrics)),
        }
    }
}

fn engine<E: LifecycleEntity>(
    table: Arc<TransitionTable<E::State, E::Event>>,
    store: Arc<dyn EntityStore<E>>,
    metrics: &Option<MetricsListener>,
) -> StateMachine<E> {
    let machine = StateMachine::new(table, store).with_listener(Arc::new(AuditListener));
    match metrics {
        Some(metrics) => machine.with_listener(Arc::new(metrics.clone())),
        None => machine,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entity::{EntityKind, Owner};
    use crate::store::MemoryDatabase;
    use prometheus::Registry;

    #[test]
    fn test_build_all_tables() {
        let tables = LifecycleTables::build().unwrap();
        assert!(!tables.volume.is_empty());
        assert!(!tables.snapshot.is_empty());
        assert!(!tables.file_share.is_empty());
    }

    #[tokio::test]
    async fn test_engines_share_store_and_metrics() {
        let tables = LifecycleTables::build().unwrap();
        let metrics = MetricsListener::new(&Registry::new()).unwrap();
        let engines = LifecycleEngines::new(&tables, Arc::new(MemoryDatabase::new()), Some(metrics.clone()));

        let vol = Volume::new("data", Owner::new("acct-1", "dom-1", "zone-1"), 1 << 30);
        let vol = engines
            .volumes
            .create(vol, VolumeEvent::AllocationRequested, &[])
            .await
            .unwrap();
        assert_eq!(vol.state(), VolumeState::Allocated);
        assert_eq!(
            metrics.count(EntityKind::Volume, "AllocationRequested", "Allocated"),
            1
        );
    }
}
