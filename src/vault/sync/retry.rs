//! Bounded, classified retry for single chain reads.
//!
//! `RetryExecutor` drives the `backoff` crate's async retry loop with an attempt-bounded
//! [`Backoff`] whose delays come from [`RetryPolicy::delay_for_attempt`], a pure function of
//! the attempt number. Failures are classified before every retry: an explicit user decline
//! stops immediately, everything else is retried until the attempt budget is spent.

use crate::rpc::RpcError;
use crate::vault::TrackerError;

use backoff::backoff::Backoff;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;

/// Whether a failure is worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
	Retryable,
	Fatal,
}

/// Classification hook for errors passed through [`RetryExecutor`]
pub trait Classify {
	fn classify(&self) -> RetryClass;
}

impl Classify for RpcError {
	fn classify(&self) -> RetryClass {
		if self.is_transient() {
			RetryClass::Retryable
		} else {
			RetryClass::Fatal
		}
	}
}

/// State of one failed attempt, handed to retry observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
	/// 1-based number of the attempt that failed
	pub attempt: u32,
	pub classification: RetryClass,
}

/// Retry limits and delay schedule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
	/// Total attempts including the first one
	pub max_attempts: u32,
	/// Delay before the second attempt
	#[serde(with = "crate::utils::duration::millis")]
	pub base_delay: Duration,
	/// Growth factor applied per further attempt
	pub backoff_multiplier: f64,
	/// Constant `base_delay` when false
	pub backoff: bool,
	/// Upper bound on the whole retry loop, including sleeps
	#[serde(with = "crate::utils::duration::opt_millis", skip_serializing_if = "Option::is_none")]
	pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_delay: Duration::from_millis(500),
			backoff_multiplier: 2.0,
			backoff: true,
			deadline: None,
		}
	}
}

impl RetryPolicy {
	/// Delay to wait after attempt `attempt` (1-based) failed.
	///
	/// `base_delay * backoff_multiplier^(attempt - 1)` with backoff, else `base_delay`.
	pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
		if !self.backoff {
			return self.base_delay;
		}
		let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
		let factor = self.backoff_multiplier.max(0.0).powi(exponent);
		let millis = self.base_delay.as_secs_f64() * 1000.0 * factor;
		if !millis.is_finite() || millis >= u64::MAX as f64 {
			Duration::from_millis(u64::MAX)
		} else {
			Duration::from_millis(millis.round() as u64)
		}
	}

	/// Attempt budget, never below one
	pub fn attempts(&self) -> u32 {
		self.max_attempts.max(1)
	}
}

/// `Backoff` that yields `max_attempts - 1` delays and then gives up.
struct AttemptBackoff {
	policy: RetryPolicy,
	failures: u32,
}

impl Backoff for AttemptBackoff {
	fn reset(&mut self) {
		self.failures = 0;
	}

	fn next_backoff(&mut self) -> Option<Duration> {
		self.failures += 1;
		if self.failures >= self.policy.attempts() {
			None
		} else {
			Some(self.policy.delay_for_attempt(self.failures))
		}
	}
}

/// Terminal failure of a retried operation
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::error::Error + 'static> {
	/// A fatal failure, surfaced after the attempt that produced it
	#[error("{0}")]
	Rejected(#[source] E),

	/// Every attempt failed; carries the last failure
	#[error("exhausted {attempts} attempts: {last}")]
	Exhausted {
		attempts: u32,
		#[source]
		last: E,
	},

	/// The overall deadline elapsed first
	#[error("deadline of {deadline:?} elapsed after {attempts} attempts")]
	DeadlineElapsed { deadline: Duration, attempts: u32 },
}

impl From<RetryError<RpcError>> for TrackerError {
	fn from(error: RetryError<RpcError>) -> Self {
		match error {
			RetryError::Rejected(source) => TrackerError::UserDeclined(source),
			RetryError::Exhausted { attempts, last } => TrackerError::ExhaustedRetries {
				attempts,
				source: last,
			},
			RetryError::DeadlineElapsed { deadline, .. } => TrackerError::DeadlineElapsed(deadline),
		}
	}
}

/// Runs fallible operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
	policy: RetryPolicy,
}

impl RetryExecutor {
	pub fn new(policy: RetryPolicy) -> Self {
		Self { policy }
	}

	pub fn policy(&self) -> &RetryPolicy {
		&self.policy
	}

	/// Run `operation` with retries, logging each retry.
	pub async fn execute<T, E, F, Fut>(&self, label: &str, operation: F) -> Result<T, RetryError<E>>
	where
		E: Classify + std::error::Error + 'static,
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, E>>,
	{
		self.execute_observed(operation, |state: &RetryState, error: &E| {
			warn!(
				"{} failed (attempt {} of {}), retrying: {}",
				label,
				state.attempt,
				self.policy.attempts(),
				error
			);
		})
		.await
	}

	/// Run `operation` with retries, calling `observer` before every retry.
	///
	/// The observer is not called for the final failure; that one is returned.
	pub async fn execute_observed<T, E, F, Fut, O>(
		&self,
		mut operation: F,
		mut observer: O,
	) -> Result<T, RetryError<E>>
	where
		E: Classify + std::error::Error + 'static,
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, E>>,
		O: FnMut(&RetryState, &E),
	{
		let attempts = &AtomicU32::new(0);
		let backoff = AttemptBackoff {
			policy: self.policy.clone(),
			failures: 0,
		};

		let retried = backoff::future::retry_notify(
			backoff,
			|| {
				// backoff builds the next attempt before sleeping, so count it when first polled
				let attempt = operation();
				async move {
					attempts.fetch_add(1, Ordering::SeqCst);
					attempt.await.map_err(|error| match error.classify() {
						RetryClass::Retryable => backoff::Error::transient(error),
						RetryClass::Fatal => backoff::Error::permanent(error),
					})
				}
			},
			|error: E, _delay: Duration| {
				let state = RetryState {
					attempt: attempts.load(Ordering::SeqCst),
					classification: RetryClass::Retryable,
				};
				observer(&state, &error);
			},
		);

		let outcome = match self.policy.deadline {
			Some(deadline) => match tokio::time::timeout(deadline, retried).await {
				Ok(outcome) => outcome,
				Err(_) => {
					return Err(RetryError::DeadlineElapsed {
						deadline,
						attempts: attempts.load(Ordering::SeqCst),
					});
				}
			},
			None => retried.await,
		};

		outcome.map_err(|error| match error.classify() {
			RetryClass::Fatal => RetryError::Rejected(error),
			RetryClass::Retryable => RetryError::Exhausted {
				attempts: attempts.load(Ordering::SeqCst),
				last: error,
			},
		})
	}
}
