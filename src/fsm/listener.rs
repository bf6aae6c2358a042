//! Transition Listeners
//!
//! Observers invoked after a transition commits. A listener error is logged
//! by the engine and never undoes the transition.

use crate::domain::entity::{EntityKind, LifecycleEntity};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prometheus::{IntCounterVec, Opts, Registry};
use std::fmt::Display;
use tracing::info;

/// A committed transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord<S, Ev> {
    pub kind: EntityKind,
    pub entity_id: String,
    /// `None` for entity creation and adoption
    pub from: Option<S>,
    pub to: S,
    /// `None` for adoption
    pub event: Option<Ev>,
    /// Update sequence after the transition
    pub sequence: u64,
    pub at: DateTime<Utc>,
}

impl<S: Display, Ev: Display> TransitionRecord<S, Ev> {
    fn from_label(&self) -> String {
        self.from
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".to_string())
    }

    fn event_label(&self) -> String {
        self.event
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Adopted".to_string())
    }
}

/// Observer of committed transitions
#[async_trait]
pub trait TransitionListener<E: LifecycleEntity>: Send + Sync {
    fn name(&self) -> &str;

    async fn on_transition(&self, record: &TransitionRecord<E::State, E::Event>) -> Result<()>;
}

// =============================================================================
// Audit Listener
// =============================================================================

/// Emits one structured log line per transition
#[derive(Debug, Default, Clone)]
pub struct AuditListener;

#[async_trait]
impl<E: LifecycleEntity> TransitionListener<E> for AuditListener {
    fn name(&self) -> &str {
        "audit"
    }

    async fn on_transition(&self, record: &TransitionRecord<E::State, E::Event>) -> Result<()> {
        info!(
            target: "audit",
            kind = %record.kind,
            entity_id = %record.entity_id,
            from = %record.from_label(),
            event = %record.event_label(),
            to = %record.to,
            sequence = record.sequence,
            "Lifecycle transition"
        );
        Ok(())
    }
}

// =============================================================================
// Metrics Listener
// =============================================================================

/// Counts transitions by kind, event and target state
#[derive(Clone)]
pub struct MetricsListener {
    transitions: IntCounterVec,
}

impl MetricsListener {
    pub fn new(registry: &Registry) -> Result<Self> {
        let transitions = IntCounterVec::new(
            Opts::new("lifecycle_transitions_total", "Committed lifecycle transitions"),
            &["kind", "event", "to"],
        )
        .map_err(|e| Error::Internal(format!("metric definition: {}", e)))?;

        registry
            .register(Box::new(transitions.clone()))
            .map_err(|e| Error::Internal(format!("metric registration: {}", e)))?;

        Ok(Self { transitions })
    }

    /// Current count for one label combination
    pub fn count(&self, kind: EntityKind, event: &str, to: &str) -> u64 {
        self.transitions
            .with_label_values(&[&kind.to_string(), event, to])
            .get()
    }
}

#[async_trait]
impl<E: LifecycleEntity> TransitionListener<E> for MetricsListener {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn on_transition(&self, record: &TransitionRecord<E::State, E::Event>) -> Result<()> {
        self.transitions
            .with_label_values(&[
                &record.kind.to_string(),
                &record.event_label(),
                &record.to.to_string(),
            ])
            .inc();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::volume::{Volume, VolumeEvent, VolumeState};

    fn record(event: Option<VolumeEvent>) -> TransitionRecord<VolumeState, VolumeEvent> {
        TransitionRecord {
            kind: EntityKind::Volume,
            entity_id: "vol-1".into(),
            from: Some(VolumeState::Ready),
            to: VolumeState::Resizing,
            event,
            sequence: 4,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_metrics_listener_counts() {
        let registry = Registry::new();
        let listener = MetricsListener::new(&registry).unwrap();

        let rec = record(Some(VolumeEvent::ResizeRequested));
        TransitionListener::<Volume>::on_transition(&listener, &rec).await.unwrap();
        TransitionListener::<Volume>::on_transition(&listener, &rec).await.unwrap();

        assert_eq!(listener.count(EntityKind::Volume, "ResizeRequested", "Resizing"), 2);
        assert_eq!(registry.gather().len(), 1);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        MetricsListener::new(&registry).unwrap();
        assert!(MetricsListener::new(&registry).is_err());
    }

    #[test]
    fn test_adoption_labels() {
        let mut rec = record(None);
        rec.from = None;
        assert_eq!(rec.from_label(), "none");
        assert_eq!(rec.event_label(), "Adopted");
    }
}
