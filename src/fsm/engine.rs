//! State Machine Engine
//!
//! Applies transitions to one entity instance through an [`EntityStore`].
//! Legality comes from the entity kind's [`TransitionTable`]; serialization
//! comes from the store's compare-and-set on the update sequence. The engine
//! never talks to a storage backend and never retries.

use super::listener::{TransitionListener, TransitionRecord};
use super::table::TransitionTable;
use crate::domain::entity::{LifecycleEntity, LifecycleState};
use crate::error::{Error, Result};
use crate::store::{EntityStore, UsageDelta};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Generic persisted state machine for one entity kind
pub struct StateMachine<E: LifecycleEntity> {
    table: Arc<TransitionTable<E::State, E::Event>>,
    store: Arc<dyn EntityStore<E>>,
    listeners: Vec<Arc<dyn TransitionListener<E>>>,
}

impl<E: LifecycleEntity> StateMachine<E> {
    pub fn new(table: Arc<TransitionTable<E::State, E::Event>>, store: Arc<dyn EntityStore<E>>) -> Self {
        Self {
            table,
            store,
            listeners: Vec::new(),
        }
    }

    /// Append a listener; listeners run in registration order
    pub fn with_listener(mut self, listener: Arc<dyn TransitionListener<E>>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn table(&self) -> &TransitionTable<E::State, E::Event> {
        &self.table
    }

    pub fn store(&self) -> &Arc<dyn EntityStore<E>> {
        &self.store
    }

    /// Load the persisted entity
    pub async fn load(&self, id: &str) -> Result<E> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: E::KIND.to_string(),
                name: id.to_string(),
            })
    }

    /// Apply `event` to `entity`
    ///
    /// On success the in-memory entity carries the new state and sequence.
    /// On any error it is left exactly as it was.
    pub async fn transition(&self, entity: &mut E, event: E::Event) -> Result<E::State> {
        self.transition_accounted(entity, event, &[]).await
    }

    /// Apply `event` and commit `deltas` in the same store transaction
    pub async fn transition_accounted(
        &self,
        entity: &mut E,
        event: E::Event,
        deltas: &[UsageDelta],
    ) -> Result<E::State> {
        let from = entity.state();
        let to = self.resolve(entity, event).await?;
        let expected_sequence = entity.update_sequence();
        let at = Utc::now();

        let applied = self
            .store
            .compare_and_set(entity.id(), expected_sequence, to, at, deltas)
            .await?;
        if !applied {
            return Err(self.lost_race(entity, event));
        }

        entity.stamp_mut().advance(to, at);
        self.notify(TransitionRecord {
            kind: E::KIND,
            entity_id: entity.id().to_string(),
            from: Some(from),
            to,
            event: Some(event),
            sequence: entity.update_sequence(),
            at,
        })
        .await;

        Ok(to)
    }

    /// Persist a new entity through an initial transition
    pub async fn create(&self, mut entity: E, event: E::Event, deltas: &[UsageDelta]) -> Result<E> {
        let to = self.table.initial(event).ok_or_else(|| Error::IllegalTransition {
            kind: E::KIND,
            entity_id: entity.id().to_string(),
            state: "<none>".to_string(),
            event: event.to_string(),
        })?;

        let at = Utc::now();
        entity.stamp_mut().reset(to, at);
        self.store.insert(entity.clone(), deltas).await?;

        self.notify(TransitionRecord {
            kind: E::KIND,
            entity_id: entity.id().to_string(),
            from: None,
            to,
            event: Some(event),
            sequence: 0,
            at,
        })
        .await;

        Ok(entity)
    }

    /// Register an entity whose physical object already exists
    ///
    /// Only reconciliation uses this. The entity enters `state` directly,
    /// which must be declared adoptable in the table.
    pub async fn adopt(&self, mut entity: E, state: E::State, deltas: &[UsageDelta]) -> Result<E> {
        if !self.table.is_adoptable(state) {
            return Err(Error::InvalidRequest(format!(
                "{} state {} is not an adoption state",
                E::KIND,
                state
            )));
        }

        let at = Utc::now();
        entity.stamp_mut().reset(state, at);
        self.store.insert(entity.clone(), deltas).await?;

        self.notify(TransitionRecord {
            kind: E::KIND,
            entity_id: entity.id().to_string(),
            from: None,
            to: state,
            event: None,
            sequence: 0,
            at,
        })
        .await;

        Ok(entity)
    }

    /// Take a terminal edge and remove the row in the same transaction
    pub async fn retire(&self, entity: &mut E, event: E::Event, deltas: &[UsageDelta]) -> Result<E::State> {
        let from = entity.state();
        let to = self.resolve(entity, event).await?;
        if !to.is_terminal() {
            return Err(Error::InvalidRequest(format!(
                "{} event {} leads to non-terminal state {}",
                E::KIND,
                event,
                to
            )));
        }

        let expected_sequence = entity.update_sequence();
        if !self.store.remove_if(entity.id(), expected_sequence, deltas).await? {
            return Err(self.lost_race(entity, event));
        }

        let at = Utc::now();
        entity.stamp_mut().advance(to, at);
        self.notify(TransitionRecord {
            kind: E::KIND,
            entity_id: entity.id().to_string(),
            from: Some(from),
            to,
            event: Some(event),
            sequence: entity.update_sequence(),
            at,
        })
        .await;

        Ok(to)
    }

    /// Load an entity by id and apply `event` to it
    pub async fn request_transition(&self, id: &str, event: E::Event) -> Result<E> {
        let mut entity = self.load(id).await?;
        self.transition(&mut entity, event).await?;
        Ok(entity)
    }

    /// Persist the entity's non-lifecycle columns
    ///
    /// The write is guarded and counted like a transition: it fails with
    /// `ConcurrentModification` if the row moved since `entity` was read, and
    /// on success the entity carries the new sequence.
    pub async fn save_attributes(&self, entity: &mut E) -> Result<()> {
        let at = Utc::now();
        if !self.store.save_attributes(entity, at).await? {
            return Err(self.lost_race(entity, "attribute write"));
        }
        entity.stamp_mut().touch(at);
        Ok(())
    }

    /// Look up the edge for `event` from the entity's state
    ///
    /// A miss on a copy that is behind the persisted row is reported as
    /// `ConcurrentModification`: the copy's state is stale, so the edge it
    /// lacks says nothing about the current one.
    async fn resolve(&self, entity: &E, event: E::Event) -> Result<E::State> {
        let state = entity.state();
        if let Some(to) = self.table.next(state, event) {
            return Ok(to);
        }

        let current = self.store.get(entity.id()).await?;
        if current.map_or(true, |row| row.update_sequence() != entity.update_sequence()) {
            return Err(self.lost_race(entity, event));
        }
        Err(Error::IllegalTransition {
            kind: E::KIND,
            entity_id: entity.id().to_string(),
            state: state.to_string(),
            event: event.to_string(),
        })
    }

    fn lost_race(&self, entity: &E, operation: impl std::fmt::Display) -> Error {
        debug!(
            kind = %E::KIND,
            entity_id = entity.id(),
            operation = %operation,
            sequence = entity.update_sequence(),
            "Conditional write affected no rows"
        );
        Error::ConcurrentModification {
            kind: E::KIND,
            entity_id: entity.id().to_string(),
            expected_sequence: entity.update_sequence(),
        }
    }

    async fn notify(&self, record: TransitionRecord<E::State, E::Event>) {
        for listener in &self.listeners {
            if let Err(e) = listener.on_transition(&record).await {
                warn!(
                    listener = listener.name(),
                    kind = %record.kind,
                    entity_id = %record.entity_id,
                    to = %record.to,
                    error = %e,
                    "Transition listener failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entity::Owner;
    use crate::domain::volume::{volume_transitions, Volume, VolumeEvent, VolumeState};
    use crate::store::{MemoryDatabase, ResourceAccounting, ResourceType};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records every transition it sees
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(Option<VolumeState>, VolumeState)>>,
    }

    #[async_trait]
    impl TransitionListener<Volume> for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_transition(&self, record: &TransitionRecord<VolumeState, VolumeEvent>) -> Result<()> {
            self.seen.lock().push((record.from, record.to));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl TransitionListener<Volume> for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_transition(&self, _record: &TransitionRecord<VolumeState, VolumeEvent>) -> Result<()> {
            Err(Error::Internal("listener down".into()))
        }
    }

    fn engine(db: Arc<MemoryDatabase>) -> StateMachine<Volume> {
        StateMachine::new(Arc::new(volume_transitions().unwrap()), db)
    }

    fn new_volume() -> Volume {
        Volume::new("data", Owner::new("acct-1", "dom-1", "zone-1"), 1 << 30)
    }

    async fn ready_volume(engine: &StateMachine<Volume>) -> Volume {
        let mut vol = engine
            .create(new_volume(), VolumeEvent::AllocationRequested, &[])
            .await
            .unwrap();
        engine.transition(&mut vol, VolumeEvent::CreateRequested).await.unwrap();
        engine.transition(&mut vol, VolumeEvent::OperationSucceeded).await.unwrap();
        vol
    }

    #[tokio::test]
    async fn test_create_stamps_initial_state() {
        let engine = engine(Arc::new(MemoryDatabase::new()));
        let vol = engine
            .create(new_volume(), VolumeEvent::AllocationRequested, &[])
            .await
            .unwrap();
        assert_eq!(vol.state(), VolumeState::Allocated);
        assert_eq!(vol.update_sequence(), 0);

        let err = engine
            .create(new_volume(), VolumeEvent::CreateRequested, &[])
            .await
            .unwrap_err();
        assert_matches!(err, Error::IllegalTransition { ref state, .. } if state == "<none>");
    }

    #[tokio::test]
    async fn test_illegal_transition_leaves_entity_untouched() {
        let engine = engine(Arc::new(MemoryDatabase::new()));
        let mut vol = engine
            .create(new_volume(), VolumeEvent::AllocationRequested, &[])
            .await
            .unwrap();

        let err = engine.transition(&mut vol, VolumeEvent::ResizeRequested).await.unwrap_err();
        assert_matches!(
            err,
            Error::IllegalTransition { ref state, ref event, .. }
                if state == "Allocated" && event == "ResizeRequested"
        );
        assert_eq!(vol.state(), VolumeState::Allocated);
        assert_eq!(vol.update_sequence(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_transitions_apply_once() {
        let db = Arc::new(MemoryDatabase::new());
        let engine = engine(db.clone());
        let vol = ready_volume(&engine).await;
        let start = vol.update_sequence();

        let mut first = vol.clone();
        let mut second = vol.clone();
        let (a, b) = futures::join!(
            engine.transition(&mut first, VolumeEvent::ResizeRequested),
            engine.transition(&mut second, VolumeEvent::SnapshotRequested),
        );

        let outcomes = [a.is_ok(), b.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        let loser = if a.is_ok() { b } else { a };
        assert_matches!(loser, Err(Error::ConcurrentModification { expected_sequence, .. }) if expected_sequence == start);

        let persisted = engine.load(&vol.id).await.unwrap();
        assert_eq!(persisted.update_sequence(), start + 1);
    }

    #[tokio::test]
    async fn test_stale_copy_fails_with_concurrent_modification() {
        let engine = engine(Arc::new(MemoryDatabase::new()));
        let mut vol = ready_volume(&engine).await;
        let mut stale = vol.clone();

        engine.transition(&mut vol, VolumeEvent::ResizeRequested).await.unwrap();
        let mut mid_resize = vol.clone();
        engine.transition(&mut vol, VolumeEvent::OperationFailed).await.unwrap();
        assert_eq!(vol.state(), VolumeState::Ready);

        // Both copies are legal by state but carry an old sequence
        let err = engine.transition(&mut stale, VolumeEvent::ResizeRequested).await.unwrap_err();
        assert_matches!(err, Error::ConcurrentModification { .. });
        assert_eq!(stale.state(), VolumeState::Ready);

        let err = engine
            .transition(&mut mid_resize, VolumeEvent::OperationSucceeded)
            .await
            .unwrap_err();
        assert_matches!(err, Error::ConcurrentModification { .. });
    }

    #[tokio::test]
    async fn test_stale_in_progress_copy_fails_with_concurrent_modification() {
        let engine = engine(Arc::new(MemoryDatabase::new()));
        let mut vol = ready_volume(&engine).await;

        engine.transition(&mut vol, VolumeEvent::ResizeRequested).await.unwrap();
        let mut stale = vol.clone();
        engine.transition(&mut vol, VolumeEvent::OperationFailed).await.unwrap();
        assert_eq!(vol.state(), VolumeState::Ready);

        // The copy still shows Resizing, which has no ResizeRequested edge
        let err = engine.transition(&mut stale, VolumeEvent::ResizeRequested).await.unwrap_err();
        assert_matches!(
            err,
            Error::ConcurrentModification { expected_sequence, .. }
                if expected_sequence == vol.update_sequence() - 1
        );
        assert_eq!(stale.state(), VolumeState::Resizing);

        // A current copy in the same position gets the table's answer
        let mut current = engine.load(&vol.id).await.unwrap();
        engine.transition(&mut current, VolumeEvent::ResizeRequested).await.unwrap();
        let err = engine.transition(&mut current, VolumeEvent::ResizeRequested).await.unwrap_err();
        assert_matches!(err, Error::IllegalTransition { .. });
    }

    #[tokio::test]
    async fn test_attribute_write_invalidates_older_copies() {
        let engine = engine(Arc::new(MemoryDatabase::new()));
        let mut vol = ready_volume(&engine).await;
        let mut stale = vol.clone();
        let before = vol.update_sequence();

        vol.attached_host = Some("kvm-1".into());
        engine.save_attributes(&mut vol).await.unwrap();
        assert_eq!(vol.update_sequence(), before + 1);
        assert_eq!(vol.state(), VolumeState::Ready);

        assert_matches!(
            engine.retire(&mut stale, VolumeEvent::UnmanageRequested, &[]).await,
            Err(Error::ConcurrentModification { .. })
        );
        stale.attached_host = Some("kvm-2".into());
        assert_matches!(
            engine.save_attributes(&mut stale).await,
            Err(Error::ConcurrentModification { .. })
        );

        let persisted = engine.load(&vol.id).await.unwrap();
        assert_eq!(persisted.attached_host.as_deref(), Some("kvm-1"));
        assert_eq!(persisted.update_sequence(), before + 1);
    }

    #[tokio::test]
    async fn test_upload_then_copy_path() {
        let engine = engine(Arc::new(MemoryDatabase::new()));
        let mut vol = engine
            .create(new_volume(), VolumeEvent::AllocationRequested, &[])
            .await
            .unwrap();

        for (event, expected) in [
            (VolumeEvent::UploadRequested, VolumeState::UploadOp),
            (VolumeEvent::OperationSucceeded, VolumeState::Uploaded),
            (VolumeEvent::CopyRequested, VolumeState::Creating),
            (VolumeEvent::CopyFailed, VolumeState::Uploaded),
            (VolumeEvent::CopyRequested, VolumeState::Creating),
            (VolumeEvent::CopySucceeded, VolumeState::Ready),
        ] {
            assert_eq!(engine.transition(&mut vol, event).await.unwrap(), expected);
        }
        assert_eq!(vol.update_sequence(), 6);
    }

    #[tokio::test]
    async fn test_listeners_run_in_order_and_failures_are_swallowed() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine(Arc::new(MemoryDatabase::new()))
            .with_listener(Arc::new(Failing))
            .with_listener(recorder.clone());

        let mut vol = engine
            .create(new_volume(), VolumeEvent::AllocationRequested, &[])
            .await
            .unwrap();
        engine.transition(&mut vol, VolumeEvent::CreateRequested).await.unwrap();

        let seen = recorder.seen.lock().clone();
        assert_eq!(
            seen,
            vec![
                (None, VolumeState::Allocated),
                (Some(VolumeState::Allocated), VolumeState::Creating)
            ]
        );
    }

    #[tokio::test]
    async fn test_adopt_requires_adoption_state() {
        let engine = engine(Arc::new(MemoryDatabase::new()));
        let err = engine
            .adopt(new_volume(), VolumeState::Resizing, &[])
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidRequest(_));

        let vol = engine.adopt(new_volume(), VolumeState::Ready, &[]).await.unwrap();
        assert_eq!(vol.state(), VolumeState::Ready);
        assert_eq!(engine.load(&vol.id).await.unwrap().state(), VolumeState::Ready);
    }

    #[tokio::test]
    async fn test_retire_removes_row_with_deltas() {
        let db = Arc::new(MemoryDatabase::new());
        let engine = engine(db.clone());
        let deltas = [UsageDelta::increment("acct-1", ResourceType::Volume, 1)];
        let mut vol = engine.adopt(new_volume(), VolumeState::Ready, &deltas).await.unwrap();

        let release = [UsageDelta::decrement("acct-1", ResourceType::Volume, 1)];
        let to = engine
            .retire(&mut vol, VolumeEvent::UnmanageRequested, &release)
            .await
            .unwrap();
        assert_eq!(to, VolumeState::Unmanaged);
        assert_matches!(engine.load(&vol.id).await, Err(Error::ResourceNotFound { .. }));
        assert_eq!(db.usage("acct-1", ResourceType::Volume).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_request_transition_by_id() {
        let engine = engine(Arc::new(MemoryDatabase::new()));
        let vol = engine
            .create(new_volume(), VolumeEvent::AllocationRequested, &[])
            .await
            .unwrap();

        let updated = engine
            .request_transition(&vol.id, VolumeEvent::DestroyRequested)
            .await
            .unwrap();
        assert_eq!(updated.state(), VolumeState::Destroy);

        assert_matches!(
            engine.request_transition("vol-missing", VolumeEvent::DestroyRequested).await,
            Err(Error::ResourceNotFound { .. })
        );
    }
}
