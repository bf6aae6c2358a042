//! Transition Tables
//!
//! Immutable `(fromState | None, event) -> toState` graphs, one per entity
//! kind. Tables are assembled through [`TransitionTableBuilder`], which
//! rejects conflicting edges at build time, and are checked for soundness
//! once at process start.

use crate::domain::entity::{EntityKind, LifecycleEvent, LifecycleState};
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};

// =============================================================================
// Transition Table
// =============================================================================

/// Directed transition graph for one entity kind
#[derive(Debug, Clone)]
pub struct TransitionTable<S, E> {
    kind: EntityKind,
    edges: HashMap<(Option<S>, E), S>,
    /// States an out-of-band object may be registered into directly
    adoptable: Vec<S>,
}

impl<S: LifecycleState, E: LifecycleEvent> TransitionTable<S, E> {
    /// Start building a table for an entity kind
    pub fn builder(kind: EntityKind) -> TransitionTableBuilder<S, E> {
        TransitionTableBuilder::new(kind)
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Target state for `event` fired from `from`
    #[inline]
    pub fn next(&self, from: S, event: E) -> Option<S> {
        self.edges.get(&(Some(from), event)).copied()
    }

    /// Target state for an entity-creating `event`
    #[inline]
    pub fn initial(&self, event: E) -> Option<S> {
        self.edges.get(&(None, event)).copied()
    }

    /// Events legal from `state`, in declaration order
    pub fn events_from(&self, state: S) -> Vec<E> {
        E::all()
            .iter()
            .copied()
            .filter(|event| self.edges.contains_key(&(Some(state), *event)))
            .collect()
    }

    /// Whether reconciliation may register an entity directly into `state`
    pub fn is_adoptable(&self, state: S) -> bool {
        self.adoptable.contains(&state)
    }

    /// All edges as `(from, event, to)`
    pub fn edges(&self) -> impl Iterator<Item = (Option<S>, E, S)> + '_ {
        self.edges.iter().map(|((from, event), to)| (*from, *event, *to))
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Verify graph shape
    ///
    /// Every non-terminal state has an outgoing edge, terminal states have
    /// none, and every state is reachable from an initial entry or an
    /// adoption state.
    pub fn check_soundness(&self) -> Result<()> {
        let mut has_outgoing: HashSet<S> = HashSet::new();
        let mut adjacency: HashMap<S, Vec<S>> = HashMap::new();
        let mut roots: Vec<S> = self.adoptable.clone();

        for ((from, _), to) in &self.edges {
            match from {
                Some(from) => {
                    has_outgoing.insert(*from);
                    adjacency.entry(*from).or_default().push(*to);
                }
                None => roots.push(*to),
            }
        }

        if roots.is_empty() {
            return Err(self.unsound("no initial transition or adoption state".into()));
        }

        for state in S::all() {
            let outgoing = has_outgoing.contains(state);
            if state.is_terminal() && outgoing {
                return Err(self.unsound(format!("terminal state {} has outgoing edges", state)));
            }
            if !state.is_terminal() && !outgoing {
                return Err(self.unsound(format!("state {} has no outgoing edge", state)));
            }
        }

        let mut seen: HashSet<S> = roots.iter().copied().collect();
        let mut queue: VecDeque<S> = roots.into_iter().collect();
        while let Some(state) = queue.pop_front() {
            for next in adjacency.get(&state).into_iter().flatten() {
                if seen.insert(*next) {
                    queue.push_back(*next);
                }
            }
        }

        let unreachable: Vec<String> = S::all()
            .iter()
            .filter(|s| !seen.contains(*s))
            .map(|s| s.to_string())
            .collect();
        if !unreachable.is_empty() {
            return Err(self.unsound(format!("unreachable states: {}", unreachable.join(", "))));
        }

        Ok(())
    }

    fn unsound(&self, reason: String) -> Error {
        Error::UnsoundTransitionTable {
            kind: self.kind,
            reason,
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for a [`TransitionTable`]
///
/// Re-registering an identical edge is accepted; registering a different
/// target for an existing `(from, event)` pair fails [`build`](Self::build).
#[derive(Debug)]
pub struct TransitionTableBuilder<S, E> {
    kind: EntityKind,
    edges: HashMap<(Option<S>, E), S>,
    adoptable: Vec<S>,
    conflict: Option<Error>,
}

impl<S: LifecycleState, E: LifecycleEvent> TransitionTableBuilder<S, E> {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            edges: HashMap::new(),
            adoptable: Vec::new(),
            conflict: None,
        }
    }

    /// Entity-creating transition
    pub fn initial(mut self, event: E, to: S) -> Self {
        self.insert(None, event, to);
        self
    }

    pub fn edge(mut self, from: S, event: E, to: S) -> Self {
        self.insert(Some(from), event, to);
        self
    }

    /// Same event and target from several source states
    pub fn edges(mut self, froms: &[S], event: E, to: S) -> Self {
        for from in froms {
            self.insert(Some(*from), event, to);
        }
        self
    }

    /// Mark a state as a direct registration target for reconciliation
    pub fn adoptable(mut self, state: S) -> Self {
        if !self.adoptable.contains(&state) {
            self.adoptable.push(state);
        }
        self
    }

    pub fn build(self) -> Result<TransitionTable<S, E>> {
        if let Some(conflict) = self.conflict {
            return Err(conflict);
        }
        Ok(TransitionTable {
            kind: self.kind,
            edges: self.edges,
            adoptable: self.adoptable,
        })
    }

    fn insert(&mut self, from: Option<S>, event: E, to: S) {
        match self.edges.get(&(from, event)) {
            Some(existing) if *existing != to => {
                if self.conflict.is_none() {
                    self.conflict = Some(Error::DuplicateTransition {
                        kind: self.kind,
                        from: from
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "<initial>".to_string()),
                        event: event.to_string(),
                        existing: existing.to_string(),
                        conflicting: to.to_string(),
                    });
                }
            }
            Some(_) => {}
            None => {
                self.edges.insert((from, event), to);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Light {
        Off,
        On,
        Broken,
    }

    impl std::fmt::Display for Light {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl LifecycleState for Light {
        fn all() -> &'static [Self] {
            &[Light::Off, Light::On, Light::Broken]
        }

        fn is_terminal(&self) -> bool {
            matches!(self, Light::Broken)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Switch {
        Install,
        Flip,
        Smash,
    }

    impl std::fmt::Display for Switch {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl LifecycleEvent for Switch {
        fn all() -> &'static [Self] {
            &[Switch::Install, Switch::Flip, Switch::Smash]
        }
    }

    fn light_builder() -> TransitionTableBuilder<Light, Switch> {
        TransitionTable::builder(EntityKind::Volume)
            .initial(Switch::Install, Light::Off)
            .edge(Light::Off, Switch::Flip, Light::On)
            .edge(Light::On, Switch::Flip, Light::Off)
            .edges(&[Light::Off, Light::On], Switch::Smash, Light::Broken)
    }

    #[test]
    fn test_lookup() {
        let table = light_builder().build().unwrap();
        assert_eq!(table.initial(Switch::Install), Some(Light::Off));
        assert_eq!(table.next(Light::Off, Switch::Flip), Some(Light::On));
        assert_eq!(table.next(Light::Broken, Switch::Flip), None);
        assert_eq!(table.events_from(Light::On), vec![Switch::Flip, Switch::Smash]);
        assert_eq!(table.len(), 5);
        table.check_soundness().unwrap();
    }

    #[test]
    fn test_identical_duplicate_is_accepted() {
        let table = light_builder()
            .edge(Light::Off, Switch::Flip, Light::On)
            .build()
            .unwrap();
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_conflicting_duplicate_fails_build() {
        let result = light_builder()
            .edge(Light::Off, Switch::Flip, Light::Broken)
            .build();
        assert_matches!(
            result,
            Err(Error::DuplicateTransition { ref from, ref existing, ref conflicting, .. })
                if from == "Off" && existing == "On" && conflicting == "Broken"
        );
    }

    #[test]
    fn test_terminal_with_outgoing_edge_is_unsound() {
        let table = light_builder()
            .edge(Light::Broken, Switch::Flip, Light::On)
            .build()
            .unwrap();
        assert_matches!(
            table.check_soundness(),
            Err(Error::UnsoundTransitionTable { .. })
        );
    }

    #[test]
    fn test_dead_end_state_is_unsound() {
        let table = TransitionTable::<Light, Switch>::builder(EntityKind::Volume)
            .initial(Switch::Install, Light::Off)
            .edge(Light::Off, Switch::Flip, Light::On)
            .edge(Light::Off, Switch::Smash, Light::Broken)
            .build()
            .unwrap();
        let err = table.check_soundness().unwrap_err();
        assert!(err.to_string().contains("On has no outgoing edge"));
    }

    #[test]
    fn test_unreachable_state_is_unsound() {
        let table = TransitionTable::<Light, Switch>::builder(EntityKind::Volume)
            .initial(Switch::Install, Light::Off)
            .edge(Light::Off, Switch::Smash, Light::Broken)
            .edge(Light::On, Switch::Flip, Light::Off)
            .build()
            .unwrap();
        let err = table.check_soundness().unwrap_err();
        assert!(err.to_string().contains("unreachable states: On"));
    }

    #[test]
    fn test_adoption_state_counts_as_root() {
        let table = TransitionTable::<Light, Switch>::builder(EntityKind::Volume)
            .adoptable(Light::On)
            .edge(Light::On, Switch::Flip, Light::Off)
            .edge(Light::Off, Switch::Smash, Light::Broken)
            .build()
            .unwrap();
        assert!(table.is_adoptable(Light::On));
        table.check_soundness().unwrap();
    }
}
