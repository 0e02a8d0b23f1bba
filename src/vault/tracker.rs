//! Vault tracker and integration point for all sync services.
//!
//! This module defines the `VaultTracker`, which wires the event source, retry executor,
//! reconstructor and fetch coordinator together and exposes them to consumers as one facade.
//!
//! The tracker is responsible for:
//! - Issuing fetch sessions for explicit refreshes, throttled user refreshes and poll ticks
//! - Running each session: head block, both log streams, block timestamps, reconstruction
//! - Handing every session result to the coordinator, which alone decides what becomes visible
//! - Owning one poller and one throttle per tracked scope
//!
//! A session's id is taken synchronously when the trigger fires, so the order in which
//! triggers are issued decides which result wins, not the order in which fetches finish.

use crate::config::SyncConfig;
use crate::rpc::{BlockRange, ChainReader, EventKind, RawLog, RpcError};
use crate::vault::sync::{
    coordinator::{FetchCoordinator, FetchSession, SessionOutcome},
    event_source::{EventSource, distinct_blocks},
    events::{ObserverId, StateObserver},
    poller::{PollCallback, Poller},
    rate_limit::{Sink, Throttler},
    reconstructor::Reconstructor,
    retry::{RetryExecutor, RetryState},
    session_stats::SessionStatsRecorder,
};
use crate::vault::types::{SharedError, TrackerError, TrackingScope, VaultSnapshot};

use chrono::TimeDelta;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Services shared by every session of a tracker.
struct TrackerInner {
    source: EventSource,
    retry: RetryExecutor,
    reconstructor: Reconstructor,
    coordinator: FetchCoordinator,
    /// First block searched for logs
    from_block: u64,
    /// One throttle per scope with user-triggered refreshes
    user_refreshers: Mutex<HashMap<TrackingScope, Throttler<()>>>,
}

impl TrackerInner {
    /// Issue a session for `scope` and run it to completion.
    async fn run_session(&self, scope: TrackingScope) -> SessionOutcome {
        let session = self.coordinator.start_session(&scope);
        self.resolve(session).await
    }

    /// Fetch, reconstruct and hand the result of `session` to the coordinator.
    async fn resolve(&self, session: FetchSession) -> SessionOutcome {
        info!("Starting session {} for {}", session.id, session.scope);
        let stats = SessionStatsRecorder::new();

        let result = self.fetch_snapshot(&session.scope, &stats).await;
        let head_block = result.as_ref().map(|snapshot| snapshot.head_block).ok();
        if let Err(e) = &result {
            error!("Session {} for {} failed: {}", session.id, session.scope, e);
        }

        let outcome = self.coordinator.complete(&session, result);
        if let (SessionOutcome::Applied, Some(head_block)) = (outcome, head_block) {
            stats.get_stats(head_block).log();
        }
        outcome
    }

    async fn fetch_snapshot(
        &self,
        scope: &TrackingScope,
        stats: &SessionStatsRecorder,
    ) -> Result<VaultSnapshot, TrackerError> {
        let head_block = self
            .retried("eth_blockNumber", stats, || self.source.latest_block())
            .await?;
        let range = BlockRange::new(self.from_block, head_block);
        debug!("Reading {} over blocks {}..={}", scope, range.from, range.to);

        let (deposits, withdrawals, live) = futures::try_join!(
            self.fetch_kind(scope, EventKind::Deposit, range, stats),
            self.fetch_kind(scope, EventKind::Withdrawal, range, stats),
            self.retried("vault balances", stats, || {
                self.source.fetch_live_state(scope.contract, scope.user, head_block)
            }),
        )?;

        let blocks = distinct_blocks(deposits.iter().chain(withdrawals.iter()));
        let timestamps = self
            .retried("block timestamps", stats, || {
                self.source.fetch_block_timestamps(&blocks)
            })
            .await?;
        stats.record_blocks(timestamps.len());

        let mut snapshot = self.reconstructor.reconstruct(
            &deposits,
            &withdrawals,
            &timestamps,
            scope.view(),
            head_block,
        )?;
        snapshot.live = live;
        Ok(snapshot)
    }

    async fn fetch_kind(
        &self,
        scope: &TrackingScope,
        kind: EventKind,
        range: BlockRange,
        stats: &SessionStatsRecorder,
    ) -> Result<Vec<RawLog>, TrackerError> {
        let label = match kind {
            EventKind::Deposit => "Deposit logs",
            EventKind::Withdrawal => "Withdrawal logs",
        };
        let logs = self
            .retried(label, stats, || {
                self.source.fetch_logs(scope.contract, kind, scope.user, range)
            })
            .await?;
        stats.record_logs(kind, self.source.chunk_plan(range).len(), logs.len());
        Ok(logs)
    }

    /// Run one chain read under the retry policy, counting retries.
    async fn retried<T, F, Fut>(
        &self,
        label: &str,
        stats: &SessionStatsRecorder,
        operation: F,
    ) -> Result<T, TrackerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let attempts = self.retry.policy().attempts();
        self.retry
            .execute_observed(operation, |state: &RetryState, e: &RpcError| {
                stats.record_retry();
                warn!(
                    "{} failed (attempt {} of {}), retrying: {}",
                    label, state.attempt, attempts, e
                );
            })
            .await
            .map_err(TrackerError::from)
    }

    /// Drop the user refresh throttle of `scope`, cancelling its trailing refresh.
    fn drop_user_refresher(&self, scope: &TrackingScope) {
        if lock(&self.user_refreshers).remove(scope).is_some() {
            debug!("Dropped user refresh throttle of {}", scope);
        }
    }
}

/// Handle returned by [`VaultTracker::subscribe`].
#[must_use = "dropping a Subscription keeps the observer registered; call unsubscribe to remove it"]
pub struct Subscription {
    id: ObserverId,
    scope: TrackingScope,
    inner: Arc<TrackerInner>,
}

impl Subscription {
    pub fn scope(&self) -> &TrackingScope {
        &self.scope
    }

    /// Remove the observer. Returns true if it was the scope's last observer, in which case
    /// the scope is torn down and in-flight results for it are discarded.
    pub fn unsubscribe(self) -> bool {
        let torn_down = self.inner.coordinator.unsubscribe(self.id);
        if torn_down {
            self.inner.drop_user_refresher(&self.scope);
        }
        torn_down
    }
}

/// Keeps derived vault state current for any number of scopes.
pub struct VaultTracker {
    inner: Arc<TrackerInner>,
    pollers: Mutex<HashMap<TrackingScope, Poller>>,
    user_refresh_cooldown: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl VaultTracker {
    pub fn new(chain: Arc<dyn ChainReader>, config: &SyncConfig) -> Result<Self, TrackerError> {
        let source = EventSource::new(
            chain,
            config.max_block_range,
            config.block_fetch_concurrency,
        );
        let baseline_offset = TimeDelta::try_seconds(config.baseline_offset_secs)
            .filter(|offset| *offset > TimeDelta::zero())
            .ok_or(TrackerError::InvalidBaselineOffset(config.baseline_offset_secs))?;

        Ok(Self {
            inner: Arc::new(TrackerInner {
                source,
                retry: RetryExecutor::new(config.retry.clone()),
                reconstructor: Reconstructor::new(baseline_offset),
                coordinator: FetchCoordinator::new(),
                from_block: config.from_block,
                user_refreshers: Mutex::new(HashMap::new()),
            }),
            pollers: Mutex::new(HashMap::new()),
            user_refresh_cooldown: config.user_refresh_cooldown,
        })
    }

    /// Register `observer` for state changes and failures of `scope`.
    ///
    /// Subscribing to a scope whose last observer left revives it with a fresh session counter.
    pub fn subscribe(&self, scope: TrackingScope, observer: impl StateObserver + 'static) -> Subscription {
        let id = self.inner.coordinator.subscribe(&scope, Box::new(observer));
        Subscription {
            id,
            scope,
            inner: self.inner.clone(),
        }
    }

    /// Issue a new session for `scope` and run it in the background.
    ///
    /// The session supersedes every earlier one for the scope as soon as this returns.
    pub fn request_refresh(&self, scope: TrackingScope) -> JoinHandle<SessionOutcome> {
        let session = self.inner.coordinator.start_session(&scope);
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.resolve(session).await })
    }

    /// Issue a new session for `scope` and wait for its outcome.
    pub async fn refresh(&self, scope: TrackingScope) -> SessionOutcome {
        self.inner.run_session(scope).await
    }

    /// Refresh on behalf of the user, at most once per cooldown with one trailing refresh.
    pub fn user_refresh(&self, scope: TrackingScope) {
        let mut refreshers = lock(&self.inner.user_refreshers);
        let throttler = refreshers.entry(scope).or_insert_with(|| {
            let inner = Arc::downgrade(&self.inner);
            let sink: Sink<()> = Arc::new(move |()| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let session = inner.coordinator.start_session(&scope);
                tokio::spawn(async move { inner.resolve(session).await });
            });
            Throttler::new(self.user_refresh_cooldown, sink)
        });
        throttler.push(());
    }

    /// Whether `scope` holds a user refresh throttle
    pub fn has_user_refresher(&self, scope: &TrackingScope) -> bool {
        lock(&self.inner.user_refreshers).contains_key(scope)
    }

    /// Refresh `scope` every `interval`, replacing any poller already running for it.
    ///
    /// Ticks are skipped while the previous poll is still running or the scope has no consumer.
    pub fn start_polling(&self, scope: TrackingScope, interval: Duration) {
        let inner = self.inner.clone();
        let callback: PollCallback = Arc::new(move || {
            let inner = inner.clone();
            async move {
                if !inner.coordinator.is_live(&scope) {
                    debug!("Skipping poll of {}: no consumer", scope);
                    return;
                }
                inner.run_session(scope).await;
            }
            .boxed()
        });

        info!("Polling {} every {:?}", scope, interval);
        lock(&self.pollers)
            .entry(scope)
            .or_default()
            .start(interval, callback);
    }

    pub fn stop_polling(&self, scope: &TrackingScope) {
        if let Some(mut poller) = lock(&self.pollers).remove(scope) {
            poller.stop();
            info!("Stopped polling {}", scope);
        }
    }

    pub fn is_polling(&self, scope: &TrackingScope) -> bool {
        lock(&self.pollers)
            .get(scope)
            .map(Poller::is_running)
            .unwrap_or(false)
    }

    /// Drop all state of `scope`; sessions already issued for it can no longer apply.
    pub fn invalidate(&self, scope: &TrackingScope) {
        self.inner.coordinator.invalidate(scope);
        self.inner.drop_user_refresher(scope);
    }

    /// Currently visible state of `scope`
    pub fn snapshot(&self, scope: &TrackingScope) -> Option<Arc<VaultSnapshot>> {
        self.inner.coordinator.visible(scope)
    }

    /// Error of the latest failed session, cleared by the next applied one
    pub fn last_error(&self, scope: &TrackingScope) -> Option<SharedError> {
        self.inner.coordinator.last_error(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::{ALICE, BOB, MockChain, OWNER, VAULT, ether, raw_log};
    use crate::vault::sync::coordinator::DiscardReason;
    use crate::vault::sync::events::TrackerEvent;
    use alloy_primitives::I256;

    fn tracker(chain: Arc<MockChain>) -> VaultTracker {
        VaultTracker::new(chain, &SyncConfig::default()).expect("default config is valid")
    }

    fn balances(snapshot: &VaultSnapshot) -> Vec<I256> {
        snapshot.series.iter().map(|point| point.balance).collect()
    }

    fn signed(value: &str) -> I256 {
        I256::try_from(ether(value)).unwrap()
    }

    fn deposit_queries(chain: &MockChain) -> usize {
        chain.with_state(|state| {
            state
                .log_queries
                .iter()
                .filter(|query| query.kind == EventKind::Deposit)
                .count()
        })
    }

    fn recorder(tracker: &VaultTracker, scope: TrackingScope) -> (Subscription, Arc<Mutex<Vec<TrackerEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let subscription = tracker.subscribe(scope, move |event: &TrackerEvent| {
            sink.lock().unwrap().push(event.clone())
        });
        (subscription, events)
    }

    #[tokio::test]
    async fn test_refresh_reconstructs_vault_state() {
        let chain = Arc::new(MockChain::scenario());
        let tracker = tracker(chain.clone());
        let scope = TrackingScope::vault_wide(VAULT);

        assert_eq!(tracker.refresh(scope).await, SessionOutcome::Applied);

        let snapshot = tracker.snapshot(&scope).expect("state is visible");
        assert_eq!(snapshot.head_block, 20);
        assert_eq!(
            balances(&snapshot),
            vec![I256::ZERO, signed("1.0"), signed("1.5"), signed("1.2")]
        );
        assert_eq!(snapshot.aggregate.total_deposits, ether("1.5"));
        assert_eq!(snapshot.aggregate.total_withdrawals, ether("0.3"));
        assert_eq!(snapshot.ledger[0].block_number, 15);
        assert_eq!(snapshot.live.contract_balance, ether("1.2"));
        assert_eq!(snapshot.live.user_balance, None);
        assert!(snapshot.live.is_owner(&OWNER));

        let mut blocks = chain.with_state(|state| state.block_queries.clone());
        blocks.sort_unstable();
        assert_eq!(blocks, vec![10, 12, 15]);
    }

    #[tokio::test]
    async fn test_user_scope_only_sees_own_events() {
        let chain = Arc::new(MockChain::scenario());
        chain.with_state(|state| state.deposits.push(raw_log(11, 0, BOB, "4.0")));
        let tracker = tracker(chain.clone());

        let alice = TrackingScope::for_user(VAULT, ALICE);
        let (_subscription, events) = recorder(&tracker, alice);
        tracker.refresh(alice).await;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let TrackerEvent::StateChanged { snapshot, .. } = &events[0] else {
            panic!("expected a state change, got {:?}", events[0]);
        };
        assert_eq!(snapshot.current_balance(), signed("1.2"));
        assert_eq!(snapshot.live.user_balance, Some(ether("1.2")));
        assert!(chain.with_state(|state| state.log_queries.iter().all(|q| q.user == Some(ALICE))));
        assert!(chain.with_state(|state| state.read_blocks.iter().all(|block| *block == 20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let chain = Arc::new(MockChain::scenario());
        chain.with_state(|state| state.block_failures.push_back(RpcError::StatusError(502)));
        let tracker = tracker(chain.clone());
        let scope = TrackingScope::vault_wide(VAULT);

        assert_eq!(tracker.refresh(scope).await, SessionOutcome::Applied);
        assert_eq!(
            tracker.snapshot(&scope).map(|s| s.current_balance()),
            Some(signed("1.2"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_last_good_state() {
        let chain = Arc::new(MockChain::scenario());
        let tracker = tracker(chain.clone());
        let scope = TrackingScope::vault_wide(VAULT);
        let (_subscription, events) = recorder(&tracker, scope);

        tracker.refresh(scope).await;
        chain.with_state(|state| {
            state.deposits.push(raw_log(18, 0, ALICE, "9.0"));
            for _ in 0..6 {
                state.log_failures.push_back(RpcError::StatusError(503));
            }
        });

        assert_eq!(tracker.refresh(scope).await, SessionOutcome::Failed);
        assert_eq!(
            tracker.snapshot(&scope).map(|s| s.current_balance()),
            Some(signed("1.2"))
        );
        let error = tracker.last_error(&scope).expect("failure is recorded");
        assert!(matches!(*error, TrackerError::ExhaustedRetries { attempts: 3, .. }));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], TrackerEvent::RefreshFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_rejection_fails_without_retry() {
        let chain = Arc::new(MockChain::scenario());
        chain.with_state(|state| {
            state
                .log_failures
                .push_back(RpcError::from_rpc(4001, "User rejected the request".into()))
        });
        let tracker = tracker(chain.clone());
        let scope = TrackingScope::vault_wide(VAULT);
        let started = tokio::time::Instant::now();

        assert_eq!(tracker.refresh(scope).await, SessionOutcome::Failed);
        assert!(tracker.last_error(&scope).expect("recorded").is_user_declined());
        assert!(tracker.snapshot(&scope).is_none());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_issued_session_wins() {
        let chain = Arc::new(MockChain::scenario());
        chain.with_state(|state| {
            state.scripted_heads.push_back((Duration::from_millis(500), 18));
            state.scripted_heads.push_back((Duration::from_millis(100), 20));
        });
        let tracker = tracker(chain.clone());
        let scope = TrackingScope::vault_wide(VAULT);
        let (_subscription, events) = recorder(&tracker, scope);

        let first = tracker.request_refresh(scope);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = tracker.request_refresh(scope);

        assert_eq!(second.await.unwrap(), SessionOutcome::Applied);
        assert_eq!(
            first.await.unwrap(),
            SessionOutcome::Discarded(DiscardReason::Superseded)
        );
        assert_eq!(tracker.snapshot(&scope).map(|s| s.head_block), Some(20));
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_discards_in_flight_session() {
        let chain = Arc::new(MockChain::scenario());
        chain.with_state(|state| state.scripted_heads.push_back((Duration::from_millis(300), 20)));
        let tracker = tracker(chain.clone());
        let scope = TrackingScope::for_user(VAULT, ALICE);

        let pending = tracker.request_refresh(scope);
        tracker.invalidate(&scope);

        assert_eq!(
            pending.await.unwrap(),
            SessionOutcome::Discarded(DiscardReason::Superseded)
        );
        assert!(tracker.snapshot(&scope).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribed_scope_discards_and_revives() {
        let chain = Arc::new(MockChain::scenario());
        chain.with_state(|state| state.scripted_heads.push_back((Duration::from_millis(300), 20)));
        let tracker = tracker(chain.clone());
        let scope = TrackingScope::vault_wide(VAULT);

        let (subscription, _) = recorder(&tracker, scope);
        let pending = tracker.request_refresh(scope);
        assert!(subscription.unsubscribe());
        assert_eq!(
            pending.await.unwrap(),
            SessionOutcome::Discarded(DiscardReason::ConsumerGone)
        );

        let (_subscription, events) = recorder(&tracker, scope);
        assert_eq!(tracker.refresh(scope).await, SessionOutcome::Applied);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_refreshes_until_stopped() {
        let chain = Arc::new(MockChain::scenario());
        let tracker = tracker(chain.clone());
        let scope = TrackingScope::vault_wide(VAULT);
        let (_subscription, events) = recorder(&tracker, scope);

        tracker.start_polling(scope, Duration::from_secs(1));
        assert!(tracker.is_polling(&scope));
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(events.lock().unwrap().len(), 3);

        tracker.stop_polling(&scope);
        tracker.stop_polling(&scope);
        assert!(!tracker.is_polling(&scope));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(events.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_skips_scope_without_consumer() {
        let chain = Arc::new(MockChain::scenario());
        let tracker = tracker(chain.clone());
        let scope = TrackingScope::vault_wide(VAULT);

        let (subscription, _) = recorder(&tracker, scope);
        tracker.start_polling(scope, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let before = deposit_queries(&chain);
        assert_eq!(before, 1);

        subscription.unsubscribe();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(deposit_queries(&chain), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_refresh_is_throttled() {
        let chain = Arc::new(MockChain::scenario());
        let tracker = tracker(chain.clone());
        let scope = TrackingScope::vault_wide(VAULT);

        for _ in 0..5 {
            tracker.user_refresh(scope);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(deposit_queries(&chain), 1);

        // one trailing refresh when the cooldown ends
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(deposit_queries(&chain), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_drops_user_refresh_throttle() {
        let chain = Arc::new(MockChain::scenario());
        let tracker = tracker(chain.clone());
        let scope = TrackingScope::for_user(VAULT, ALICE);
        let (subscription, _) = recorder(&tracker, scope);

        tracker.user_refresh(scope);
        tracker.user_refresh(scope);
        assert!(tracker.has_user_refresher(&scope));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(deposit_queries(&chain), 1);

        assert!(subscription.unsubscribe());
        assert!(!tracker.has_user_refresher(&scope));
        // the trailing refresh was cancelled with the throttle
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(deposit_queries(&chain), 1);

        tracker.user_refresh(scope);
        tracker.invalidate(&scope);
        assert!(!tracker.has_user_refresher(&scope));
    }

    #[test]
    fn test_out_of_range_baseline_offset_is_rejected() {
        let chain = Arc::new(MockChain::scenario());
        for secs in [0, i64::MAX] {
            let config = SyncConfig {
                baseline_offset_secs: secs,
                ..SyncConfig::default()
            };
            assert!(matches!(
                VaultTracker::new(chain.clone(), &config),
                Err(TrackerError::InvalidBaselineOffset(rejected)) if rejected == secs
            ));
        }
    }

    #[tokio::test]
    async fn test_invalidate_keeps_unsubscribed_scope_dead() {
        let chain = Arc::new(MockChain::scenario());
        let tracker = tracker(chain.clone());
        let scope = TrackingScope::vault_wide(VAULT);

        let (subscription, _) = recorder(&tracker, scope);
        subscription.unsubscribe();
        tracker.invalidate(&scope);

        assert_eq!(
            tracker.refresh(scope).await,
            SessionOutcome::Discarded(DiscardReason::ConsumerGone)
        );
        assert!(tracker.snapshot(&scope).is_none());
    }
}
