//! Fetch session coordination and the visible vault state.
//!
//! `FetchCoordinator` hands out session ids and decides whether a finished session may touch
//! the visible state. The rule is last-issued-wins: a session applies only if it is still the
//! newest one issued for its scope, the scope is still live, and it has not already resolved.
//! Everything else is dropped silently. `complete` is the only writer of visible state.

use crate::vault::sync::events::{ObserverId, ObserverRegistry, StateObserver, TrackerEvent};
use crate::vault::types::{SharedError, TrackerError, TrackingScope, VaultSnapshot};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Identity of one fetch session.
///
/// `seq` counts sessions within a scope; `epoch` changes whenever the scope is invalidated,
/// so ids from before an invalidation never compare equal to later ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
	pub epoch: u64,
	pub seq: u64,
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.epoch, self.seq)
	}
}

/// A refresh attempt for one scope, carried through the whole fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSession {
	pub id: SessionId,
	pub scope: TrackingScope,
}

/// Why a finished session did not touch the visible state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
	/// A newer session was issued for the scope
	Superseded,
	/// The scope was torn down
	ConsumerGone,
	/// This session already resolved once
	AlreadySettled,
}

/// Terminal state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
	/// Its result is now the visible state
	Applied,
	/// Dropped without any visible effect
	Discarded(DiscardReason),
	/// It was the newest session but failed; the previous state stays visible
	Failed,
}

struct ScopeSlot {
	epoch: u64,
	last_seq: u64,
	active: Option<SessionId>,
	settled: bool,
	live: bool,
	visible: Option<Arc<VaultSnapshot>>,
	last_error: Option<SharedError>,
}

impl ScopeSlot {
	fn new(epoch: u64) -> Self {
		Self {
			epoch,
			last_seq: 0,
			active: None,
			settled: false,
			live: true,
			visible: None,
			last_error: None,
		}
	}
}

#[derive(Default)]
struct CoordinatorState {
	epoch: u64,
	slots: HashMap<TrackingScope, ScopeSlot>,
	observers: ObserverRegistry,
}

impl CoordinatorState {
	/// Replace the slot of `scope` with an empty one in a fresh epoch.
	fn reset(&mut self, scope: &TrackingScope, live: bool) {
		self.epoch += 1;
		let mut slot = ScopeSlot::new(self.epoch);
		slot.live = live;
		self.slots.insert(*scope, slot);
		info!("Invalidated {} (epoch {}, live {})", scope, self.epoch, live);
	}

	fn tear_down(&mut self, scope: &TrackingScope) {
		let epoch = self.epoch;
		self.slots
			.entry(*scope)
			.or_insert_with(|| ScopeSlot::new(epoch))
			.live = false;
		info!("Tore down {}", scope);
	}
}

/// Staleness guard and owner of the visible state of every scope.
#[derive(Default)]
pub struct FetchCoordinator {
	state: Mutex<CoordinatorState>,
}

impl FetchCoordinator {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
		self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Issue a new session for `scope`, superseding any earlier one.
	pub fn start_session(&self, scope: &TrackingScope) -> FetchSession {
		let mut state = self.lock();
		let epoch = state.epoch;
		let slot = state
			.slots
			.entry(*scope)
			.or_insert_with(|| ScopeSlot::new(epoch));

		slot.last_seq += 1;
		let id = SessionId {
			epoch: slot.epoch,
			seq: slot.last_seq,
		};
		if let Some(previous) = slot.active.filter(|_| !slot.settled) {
			debug!("Session {} for {} supersedes pending session {}", id, scope, previous);
		}
		slot.active = Some(id);
		slot.settled = false;

		FetchSession { id, scope: *scope }
	}

	/// Resolve `session` with its result.
	///
	/// Applies the result iff the session is the newest for its scope, the scope is live, and
	/// the session has not resolved before. Observers are notified of applied results and of
	/// failures of the newest session; nothing is reported for discarded sessions.
	pub fn complete(
		&self,
		session: &FetchSession,
		result: Result<VaultSnapshot, TrackerError>,
	) -> SessionOutcome {
		let mut guard = self.lock();
		let CoordinatorState {
			slots, observers, ..
		} = &mut *guard;

		let Some(slot) = slots.get_mut(&session.scope) else {
			return SessionOutcome::Discarded(DiscardReason::ConsumerGone);
		};
		if !slot.live {
			debug!("Discarding session {} for {}: consumer gone", session.id, session.scope);
			return SessionOutcome::Discarded(DiscardReason::ConsumerGone);
		}
		if slot.active != Some(session.id) {
			debug!("Discarding stale session {} for {}", session.id, session.scope);
			return SessionOutcome::Discarded(DiscardReason::Superseded);
		}
		if slot.settled {
			return SessionOutcome::Discarded(DiscardReason::AlreadySettled);
		}
		slot.settled = true;

		let (event, outcome) = match result {
			Ok(snapshot) => {
				let snapshot = Arc::new(snapshot);
				info!(
					"Applied session {} for {}: {} events up to block {}",
					session.id,
					session.scope,
					snapshot.ledger.len(),
					snapshot.head_block
				);
				slot.visible = Some(snapshot.clone());
				slot.last_error = None;
				let event = TrackerEvent::StateChanged {
					scope: session.scope,
					session: session.id,
					snapshot,
				};
				(event, SessionOutcome::Applied)
			}
			Err(error) => {
				warn!(
					"Session {} for {} failed, keeping last good state: {}",
					session.id, session.scope, error
				);
				let error = Arc::new(error);
				slot.last_error = Some(error.clone());
				let event = TrackerEvent::RefreshFailed {
					scope: session.scope,
					session: session.id,
					error,
				};
				(event, SessionOutcome::Failed)
			}
		};

		observers.dispatch(&event);
		outcome
	}

	/// Forget everything about `scope` and restart its session counter.
	///
	/// Sessions issued before the call can never apply afterwards. A torn down scope stays
	/// torn down; only `subscribe` revives it.
	pub fn invalidate(&self, scope: &TrackingScope) {
		let mut state = self.lock();
		let live = state.slots.get(scope).is_none_or(|slot| slot.live);
		state.reset(scope, live);
	}

	/// Mark the consumer of `scope` as gone; no later completion applies.
	pub fn teardown(&self, scope: &TrackingScope) {
		self.lock().tear_down(scope);
	}

	pub fn is_live(&self, scope: &TrackingScope) -> bool {
		self.lock()
			.slots
			.get(scope)
			.map(|slot| slot.live)
			.unwrap_or(true)
	}

	/// Register an observer, reviving the scope if it was torn down.
	pub fn subscribe(&self, scope: &TrackingScope, observer: Box<dyn StateObserver>) -> ObserverId {
		let mut state = self.lock();
		if state.slots.get(scope).is_some_and(|slot| !slot.live) {
			state.reset(scope, true);
		}
		state.observers.register(*scope, observer)
	}

	/// Remove an observer; the scope is torn down when its last observer leaves.
	///
	/// Returns true if this tore the scope down.
	pub fn unsubscribe(&self, id: ObserverId) -> bool {
		let mut state = self.lock();
		match state.observers.unregister(id) {
			Some((scope, 0)) => {
				state.tear_down(&scope);
				true
			}
			_ => false,
		}
	}

	pub fn observer_count(&self, scope: &TrackingScope) -> usize {
		self.lock().observers.count(scope)
	}

	/// Currently visible state of `scope`
	pub fn visible(&self, scope: &TrackingScope) -> Option<Arc<VaultSnapshot>> {
		self.lock().slots.get(scope).and_then(|slot| slot.visible.clone())
	}

	/// Error of the newest session if it failed and nothing applied since
	pub fn last_error(&self, scope: &TrackingScope) -> Option<SharedError> {
		self.lock().slots.get(scope).and_then(|slot| slot.last_error.clone())
	}
}
