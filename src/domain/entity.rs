//! Lifecycle Entity Shape
//!
//! Shared traits and types for every lifecycle-managed record. The `state`
//! and `update_sequence` of an entity live in a [`LifecycleStamp`] whose
//! mutators are crate-private: only the state machine engine moves them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::hash::Hash;

// =============================================================================
// Entity Kind
// =============================================================================

/// Class of lifecycle-managed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Volume,
    Snapshot,
    FileShare,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Volume => write!(f, "volume"),
            EntityKind::Snapshot => write!(f, "snapshot"),
            EntityKind::FileShare => write!(f, "file_share"),
        }
    }
}

// =============================================================================
// State / Event Traits
// =============================================================================

/// A node in an entity kind's transition graph
pub trait LifecycleState:
    Copy + Eq + Hash + Debug + Display + Send + Sync + 'static
{
    /// Every declared state of the kind
    fn all() -> &'static [Self];

    /// Terminal states have no outgoing edges
    fn is_terminal(&self) -> bool;
}

/// An event that may drive a transition
pub trait LifecycleEvent:
    Copy + Eq + Hash + Debug + Display + Send + Sync + 'static
{
    /// Every declared event of the kind
    fn all() -> &'static [Self];
}

// =============================================================================
// Lifecycle Stamp
// =============================================================================

/// Lifecycle columns of a persisted entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleStamp<S> {
    state: S,
    update_sequence: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<S: Copy> LifecycleStamp<S> {
    pub(crate) fn new(state: S) -> Self {
        let now = Utc::now();
        Self {
            state,
            update_sequence: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Current state
    pub fn state(&self) -> S {
        self.state
    }

    /// Optimistic-concurrency counter
    pub fn update_sequence(&self) -> u64 {
        self.update_sequence
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Apply a committed transition
    pub(crate) fn advance(&mut self, to: S, at: DateTime<Utc>) {
        self.state = to;
        self.update_sequence += 1;
        self.updated_at = at;
    }

    /// Record an attribute-only write; the state is unchanged
    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        self.update_sequence += 1;
        self.updated_at = at;
    }

    /// Stamp a freshly inserted row
    pub(crate) fn reset(&mut self, state: S, at: DateTime<Utc>) {
        self.state = state;
        self.update_sequence = 0;
        self.created_at = at;
        self.updated_at = at;
    }
}

// =============================================================================
// Lifecycle Entity
// =============================================================================

/// A persisted record whose state is governed by the engine
pub trait LifecycleEntity: Clone + Debug + Send + Sync + 'static {
    type State: LifecycleState;
    type Event: LifecycleEvent;

    const KIND: EntityKind;

    /// Durable identity
    fn id(&self) -> &str;

    fn stamp(&self) -> &LifecycleStamp<Self::State>;

    fn stamp_mut(&mut self) -> &mut LifecycleStamp<Self::State>;

    fn state(&self) -> Self::State {
        self.stamp().state()
    }

    fn update_sequence(&self) -> u64 {
        self.stamp().update_sequence()
    }
}

// =============================================================================
// Ownership
// =============================================================================

/// Tenant ownership of a resource
///
/// Opaque to the engine; used for resource accounting and backend naming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub account_id: String,
    pub account_uuid: String,
    pub account_name: String,
    pub domain_id: String,
    pub domain_uuid: String,
    pub domain_name: String,
    pub zone_id: String,
}

impl Owner {
    /// Owner with generated UUIDs and names derived from the ids
    pub fn new(
        account_id: impl Into<String>,
        domain_id: impl Into<String>,
        zone_id: impl Into<String>,
    ) -> Self {
        let account_id = account_id.into();
        let domain_id = domain_id.into();
        Self {
            account_name: account_id.clone(),
            account_uuid: uuid::Uuid::new_v4().to_string(),
            account_id,
            domain_name: domain_id.clone(),
            domain_uuid: uuid::Uuid::new_v4().to_string(),
            domain_id,
            zone_id: zone_id.into(),
        }
    }
}

/// Generate an internal id with a kind prefix
pub(crate) fn generate_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}
