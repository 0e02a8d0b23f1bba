//! Vault State Synchronization Module
//!
//! This module provides the building blocks the tracker uses to keep derived vault state in
//! step with the chain. It is composed of several submodules, each responsible for a specific
//! aspect of the refresh process:
//!
//! - `event_source`: Chunked log queries, deduplicated block timestamp lookups and contract reads.
//! - `retry`: Bounded, classified retries around single chain reads.
//! - `reconstructor`: Pure derivation of the balance series, ledger and aggregate from raw logs.
//! - `coordinator`: Session ids and the last-issued-wins rule guarding the visible state.
//! - `events`: Notifications and the observer registry fed by the coordinator.
//! - `poller`: Fixed-interval background refresh with overlap protection.
//! - `rate_limit`: Debounce and throttle for user-driven triggers.
//! - `session_stats`: Counters logged when a session resolves.
//!
//! Only the coordinator writes visible state; every other component either reads the chain or
//! computes values from what was read.

/// Session coordination and visible state
pub mod coordinator;
/// Chain reads for vault logs, blocks and contract state
pub mod event_source;
/// Observer notifications
pub mod events;
/// Background polling
pub mod poller;
/// Debounce and throttle
pub mod rate_limit;
/// Derivation of vault state from logs
pub mod reconstructor;
/// Retry policy and executor
pub mod retry;
/// Per-session statistics
pub mod session_stats;

pub use coordinator::{DiscardReason, FetchCoordinator, FetchSession, SessionId, SessionOutcome};
pub use event_source::EventSource;
pub use events::{ObserverId, StateObserver, TrackerEvent};
pub use poller::Poller;
pub use reconstructor::{ReconstructError, Reconstructor};
pub use retry::{RetryError, RetryExecutor, RetryPolicy};
