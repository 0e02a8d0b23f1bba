//! Debounce and throttle for user-driven triggers.
//!
//! Both types feed values through an unbounded channel into a task that owns the timing, and
//! hand emitted values to a synchronous sink. Sinks that need to do async work spawn it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// Receiver of emitted values
pub type Sink<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Emits the latest pushed value once no new value arrived for `quiet`.
pub struct Debouncer<T> {
	sender: mpsc::UnboundedSender<T>,
	/// Values handed to the channel
	pushed: Arc<AtomicU64>,
	/// Values the task consumed up to its last emission
	settled: Arc<AtomicU64>,
	task: JoinHandle<()>,
}

impl<T: Send + 'static> Debouncer<T> {
	/// Must be called within a tokio runtime.
	pub fn new(quiet: Duration, sink: Sink<T>) -> Self {
		let (sender, mut receiver) = mpsc::unbounded_channel::<T>();
		let pushed = Arc::new(AtomicU64::new(0));
		let settled = Arc::new(AtomicU64::new(0));

		let consumed = settled.clone();
		let task = tokio::spawn(async move {
			let mut received = 0u64;
			while let Some(mut latest) = receiver.recv().await {
				received += 1;
				loop {
					match tokio::time::timeout(quiet, receiver.recv()).await {
						Ok(Some(value)) => {
							received += 1;
							latest = value;
						}
						Ok(None) => {
							consumed.store(received, Ordering::SeqCst);
							sink(latest);
							return;
						}
						Err(_) => break,
					}
				}
				trace!("Debounce window of {:?} elapsed", quiet);
				consumed.store(received, Ordering::SeqCst);
				sink(latest);
			}
		});

		Self {
			sender,
			pushed,
			settled,
			task,
		}
	}

	/// Replace the pending value and restart the quiet window.
	pub fn push(&self, value: T) {
		self.pushed.fetch_add(1, Ordering::SeqCst);
		if self.sender.send(value).is_err() {
			self.pushed.fetch_sub(1, Ordering::SeqCst);
		}
	}

	/// Whether a value is waiting for its quiet window
	pub fn is_pending(&self) -> bool {
		self.pushed.load(Ordering::SeqCst) > self.settled.load(Ordering::SeqCst)
	}
}

impl<T> Drop for Debouncer<T> {
	fn drop(&mut self) {
		self.task.abort();
	}
}

/// Emits the first value at once, then at most one trailing value per `cooldown`.
///
/// Values pushed during a cooldown collapse into the latest one, emitted when the cooldown
/// ends; that emission starts a new cooldown.
pub struct Throttler<T> {
	sender: mpsc::UnboundedSender<T>,
	task: JoinHandle<()>,
}

impl<T: Send + 'static> Throttler<T> {
	/// Must be called within a tokio runtime.
	pub fn new(cooldown: Duration, sink: Sink<T>) -> Self {
		let (sender, mut receiver) = mpsc::unbounded_channel::<T>();

		let task = tokio::spawn(async move {
			while let Some(first) = receiver.recv().await {
				sink(first);
				let mut window_end = Instant::now() + cooldown;

				loop {
					let mut latest = None;
					loop {
						match tokio::time::timeout_at(window_end, receiver.recv()).await {
							Ok(Some(value)) => latest = Some(value),
							Ok(None) => {
								if let Some(value) = latest {
									sink(value);
								}
								return;
							}
							Err(_) => break,
						}
					}

					match latest {
						Some(value) => {
							trace!("Emitting trailing throttled value");
							sink(value);
							window_end = Instant::now() + cooldown;
						}
						None => break,
					}
				}
			}
		});

		Self { sender, task }
	}

	pub fn push(&self, value: T) {
		let _ = self.sender.send(value);
	}
}

impl<T> Drop for Throttler<T> {
	fn drop(&mut self) {
		self.task.abort();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{Mutex, OnceLock};

	fn recording<T: Send + 'static>() -> (Sink<(T, u64)>, Arc<Mutex<Vec<(T, u64)>>>) {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink_seen = seen.clone();
		(Arc::new(move |value: (T, u64)| sink_seen.lock().unwrap().push(value)), seen)
	}

	fn millis_since(start: Instant) -> u64 {
		start.elapsed().as_millis() as u64
	}

	#[tokio::test(start_paused = true)]
	async fn test_debouncer_emits_latest_after_quiet_window() {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let start = Instant::now();
		let sink: Sink<u32> = {
			let seen = seen.clone();
			Arc::new(move |value: u32| seen.lock().unwrap().push((value, millis_since(start))))
		};
		let debouncer = Debouncer::new(Duration::from_millis(500), sink);

		for value in 1..=3 {
			debouncer.push(value);
			assert!(debouncer.is_pending());
			tokio::time::sleep(Duration::from_millis(100)).await;
		}
		assert!(seen.lock().unwrap().is_empty());

		tokio::time::sleep(Duration::from_millis(500)).await;
		assert!(!debouncer.is_pending());
		assert_eq!(*seen.lock().unwrap(), vec![(3, 700)]);

		debouncer.push(4);
		tokio::time::sleep(Duration::from_millis(600)).await;
		assert_eq!(seen.lock().unwrap().len(), 2);
		assert_eq!(seen.lock().unwrap()[1].0, 4);
	}

	#[tokio::test(start_paused = true)]
	async fn test_value_pushed_during_emission_stays_pending() {
		let debouncer: Arc<OnceLock<Debouncer<u32>>> = Arc::new(OnceLock::new());
		let (sink, seen) = recording::<u32>();
		let handle = debouncer.clone();
		let emit: Sink<u32> = Arc::new(move |value: u32| {
			sink((value, 0));
			if value == 1 {
				if let Some(debouncer) = handle.get() {
					debouncer.push(2);
				}
			}
		});
		let debouncer = debouncer.get_or_init(|| Debouncer::new(Duration::from_millis(500), emit));

		debouncer.push(1);
		tokio::time::sleep(Duration::from_millis(600)).await;
		assert_eq!(seen.lock().unwrap().len(), 1);
		assert!(debouncer.is_pending());

		tokio::time::sleep(Duration::from_millis(500)).await;
		assert!(!debouncer.is_pending());
		let values: Vec<u32> = seen.lock().unwrap().iter().map(|(value, _)| *value).collect();
		assert_eq!(values, vec![1, 2]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_dropping_debouncer_cancels_pending_value() {
		let (sink, seen) = recording::<u32>();
		let debouncer = Debouncer::new(
			Duration::from_millis(500),
			Arc::new(move |value: u32| sink((value, 0))),
		);
		debouncer.push(1);
		drop(debouncer);
		tokio::time::sleep(Duration::from_millis(1000)).await;
		assert!(seen.lock().unwrap().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_throttler_leading_and_trailing() {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let start = Instant::now();
		let sink: Sink<u32> = {
			let seen = seen.clone();
			Arc::new(move |value: u32| seen.lock().unwrap().push((value, millis_since(start))))
		};
		let throttler = Throttler::new(Duration::from_millis(1000), sink);

		throttler.push(1);
		tokio::time::sleep(Duration::from_millis(100)).await;
		throttler.push(2);
		tokio::time::sleep(Duration::from_millis(100)).await;
		throttler.push(3);

		tokio::time::sleep(Duration::from_millis(900)).await;
		assert_eq!(*seen.lock().unwrap(), vec![(1, 0), (3, 1000)]);

		// within the window opened by the trailing emission
		throttler.push(4);
		tokio::time::sleep(Duration::from_millis(1000)).await;
		assert_eq!(seen.lock().unwrap().last(), Some(&(4, 2000)));
	}

	#[tokio::test(start_paused = true)]
	async fn test_throttler_idle_window_emits_next_value_immediately() {
		let (sink, seen) = recording::<u32>();
		let throttler = Throttler::new(
			Duration::from_millis(1000),
			Arc::new(move |value: u32| sink((value, 0))),
		);

		throttler.push(1);
		tokio::time::sleep(Duration::from_millis(1500)).await;
		throttler.push(2);
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(seen.lock().unwrap().len(), 2);
	}
}
