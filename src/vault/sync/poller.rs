//! Fixed-interval background refresh.
//!
//! A `Poller` owns one ticker task. Each tick starts the callback unless the previous
//! invocation is still running, in which case the tick is skipped. Starting an active poller
//! replaces its ticker, so repeated start/stop never leaves more than one ticker behind.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Callback run on every tick
pub type PollCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Counters of one poller, across restarts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
	pub invocations: u64,
	pub skipped: u64,
}

#[derive(Default)]
struct PollerState {
	generation: u64,
	in_flight: bool,
	stats: PollerStats,
}

#[derive(Default)]
pub struct Poller {
	state: Arc<Mutex<PollerState>>,
	ticker: Option<JoinHandle<()>>,
}

fn lock(state: &Mutex<PollerState>) -> MutexGuard<'_, PollerState> {
	state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Poller {
	pub fn new() -> Self {
		Self::default()
	}

	/// Run `callback` every `interval`, first one interval from now.
	///
	/// Must be called within a tokio runtime.
	pub fn start(&mut self, interval: Duration, callback: PollCallback) {
		self.stop();

		let interval = interval.max(Duration::from_millis(1));
		let generation = {
			let mut state = lock(&self.state);
			state.generation += 1;
			state.generation
		};
		debug!("Starting poller every {:?} (generation {})", interval, generation);

		let state = self.state.clone();
		self.ticker = Some(tokio::spawn(async move {
			let mut next_tick = Instant::now() + interval;
			loop {
				tokio::time::sleep_until(next_tick).await;
				next_tick += interval;

				let start = {
					let mut guard = lock(&state);
					if guard.generation != generation {
						break;
					}
					if guard.in_flight {
						guard.stats.skipped += 1;
						trace!("Poll tick skipped, previous refresh still running");
						false
					} else {
						guard.in_flight = true;
						guard.stats.invocations += 1;
						true
					}
				};

				if start {
					let callback = callback.clone();
					let state = state.clone();
					tokio::spawn(async move {
						let invocation = tokio::spawn(async move { callback().await });
						if let Err(e) = invocation.await {
							warn!("Poll invocation did not complete: {}", e);
						}
						lock(&state).in_flight = false;
					});
				}
			}
		}));
	}

	/// Stop ticking. An invocation already running is left to finish. Idempotent.
	pub fn stop(&mut self) {
		if let Some(ticker) = self.ticker.take() {
			lock(&self.state).generation += 1;
			ticker.abort();
			debug!("Stopped poller");
		}
	}

	pub fn is_running(&self) -> bool {
		self.ticker.is_some()
	}

	pub fn stats(&self) -> PollerStats {
		lock(&self.state).stats
	}
}

impl Drop for Poller {
	fn drop(&mut self) {
		self.stop();
	}
}
