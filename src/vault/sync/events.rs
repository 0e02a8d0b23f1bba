//! Event system for delivering derived vault state.
//!
//! This module defines the notifications emitted when a fetch session resolves, the observer
//! trait consumers implement, and the registry that routes notifications to the observers of
//! one tracking scope. The coordinator is the only producer; observers never see results of
//! superseded sessions.

use crate::vault::sync::coordinator::SessionId;
use crate::vault::types::{SharedError, TrackingScope, VaultSnapshot};

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Notifications delivered to observers of a scope
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    /// A session's result became the visible state
    StateChanged {
        scope: TrackingScope,
        session: SessionId,
        snapshot: Arc<VaultSnapshot>,
    },
    /// The newest session failed; the previous state stays visible
    RefreshFailed {
        scope: TrackingScope,
        session: SessionId,
        error: SharedError,
    },
}

impl TrackerEvent {
    pub fn scope(&self) -> &TrackingScope {
        match self {
            TrackerEvent::StateChanged { scope, .. } | TrackerEvent::RefreshFailed { scope, .. } => {
                scope
            }
        }
    }

    pub fn session(&self) -> SessionId {
        match self {
            TrackerEvent::StateChanged { session, .. }
            | TrackerEvent::RefreshFailed { session, .. } => *session,
        }
    }
}

/// Trait for receiving tracker notifications.
///
/// Observers run synchronously inside the apply step. They must return quickly and must not
/// call back into the tracker; forward to a channel for anything heavier.
pub trait StateObserver: Send + Sync {
    fn on_event(&self, event: &TrackerEvent);

    /// Get the name of this observer for logging and diagnostics.
    fn name(&self) -> &'static str {
        "StateObserver"
    }
}

impl<F> StateObserver for F
where
    F: Fn(&TrackerEvent) + Send + Sync,
{
    fn on_event(&self, event: &TrackerEvent) {
        self(event)
    }
}

/// Handle identifying one registered observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Observers grouped by tracking scope.
///
/// Observers of a scope are called in registration order.
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: u64,
    observers: HashMap<TrackingScope, Vec<(ObserverId, Box<dyn StateObserver>)>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scope: TrackingScope, observer: Box<dyn StateObserver>) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        debug!("Registering observer {} for {}", observer.name(), scope);
        self.observers.entry(scope).or_default().push((id, observer));
        id
    }

    /// Remove an observer, returning its scope and how many observers remain there.
    pub fn unregister(&mut self, id: ObserverId) -> Option<(TrackingScope, usize)> {
        let scope = self
            .observers
            .iter()
            .find(|(_, list)| list.iter().any(|(observer_id, _)| *observer_id == id))
            .map(|(scope, _)| *scope)?;

        let list = self.observers.get_mut(&scope)?;
        list.retain(|(observer_id, _)| *observer_id != id);
        let remaining = list.len();
        if remaining == 0 {
            self.observers.remove(&scope);
        }
        Some((scope, remaining))
    }

    pub fn count(&self, scope: &TrackingScope) -> usize {
        self.observers.get(scope).map(Vec::len).unwrap_or(0)
    }

    /// Deliver `event` to every observer of its scope.
    pub fn dispatch(&self, event: &TrackerEvent) {
        if let Some(list) = self.observers.get(event.scope()) {
            for (_, observer) in list {
                observer.on_event(event);
            }
        }
    }
}
