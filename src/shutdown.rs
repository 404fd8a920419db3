use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// A listener that can be drained before the process exits.
pub trait AssociationListener {
	/// Stops accepting new associations. Open associations keep running.
	fn stop_accepting(&self);

	/// Number of associations that are still open.
	fn active_association_count(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
	/// All associations completed.
	Drained,
	/// The drain timeout elapsed with `remaining` associations still open.
	TimedOut { remaining: usize },
}

/// Waits for open associations to complete after a shutdown signal.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownCoordinator {
	poll_interval: Duration,
	timeout: Option<Duration>,
}

impl ShutdownCoordinator {
	pub const fn new(poll_interval: Duration, timeout: Option<Duration>) -> Self {
		Self {
			poll_interval,
			timeout,
		}
	}

	/// Stops the listener and polls its association count every `poll_interval`
	/// until it reaches zero. Waits forever without a timeout.
	pub async fn drain(&self, listener: &impl AssociationListener) -> DrainOutcome {
		listener.stop_accepting();
		let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

		loop {
			let remaining = listener.active_association_count();
			if remaining == 0 {
				info!("All associations completed");
				return DrainOutcome::Drained;
			}

			if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
				warn!(remaining, "Shutdown timeout elapsed with open associations");
				return DrainOutcome::TimedOut { remaining };
			}

			info!(remaining, "Waiting for open associations to complete");
			let sleep = match deadline {
				Some(deadline) => self
					.poll_interval
					.min(deadline.saturating_duration_since(Instant::now())),
				None => self.poll_interval,
			};
			tokio::time::sleep(sleep).await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

	/// Every call to `active_association_count` closes one association.
	#[derive(Default)]
	struct MockListener {
		stopped: AtomicBool,
		active: AtomicUsize,
		polls: AtomicUsize,
		closing: bool,
	}

	impl MockListener {
		fn new(active: usize, closing: bool) -> Self {
			Self {
				active: AtomicUsize::new(active),
				closing,
				..Self::default()
			}
		}
	}

	impl AssociationListener for MockListener {
		fn stop_accepting(&self) {
			self.stopped.store(true, Ordering::SeqCst);
		}

		fn active_association_count(&self) -> usize {
			assert!(
				self.stopped.load(Ordering::SeqCst),
				"stop_accepting must be called first"
			);
			self.polls.fetch_add(1, Ordering::SeqCst);
			let active = self.active.load(Ordering::SeqCst);
			if self.closing && active > 0 {
				self.active.store(active - 1, Ordering::SeqCst);
			}
			active
		}
	}

	#[tokio::test(start_paused = true)]
	async fn drains_immediately_without_associations() {
		let listener = MockListener::new(0, false);
		let coordinator = ShutdownCoordinator::new(Duration::from_secs(1), None);

		assert_eq!(coordinator.drain(&listener).await, DrainOutcome::Drained);
		assert!(listener.stopped.load(Ordering::SeqCst));
		assert_eq!(listener.polls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn waits_for_open_associations() {
		let listener = MockListener::new(3, true);
		let coordinator = ShutdownCoordinator::new(Duration::from_secs(1), None);
		let started = Instant::now();

		assert_eq!(coordinator.drain(&listener).await, DrainOutcome::Drained);
		assert_eq!(listener.polls.load(Ordering::SeqCst), 4);
		assert_eq!(started.elapsed(), Duration::from_secs(3));
	}

	#[tokio::test(start_paused = true)]
	async fn times_out_with_stuck_associations() {
		let listener = MockListener::new(2, false);
		let coordinator =
			ShutdownCoordinator::new(Duration::from_secs(1), Some(Duration::from_millis(2500)));
		let started = Instant::now();

		assert_eq!(
			coordinator.drain(&listener).await,
			DrainOutcome::TimedOut { remaining: 2 }
		);
		assert_eq!(started.elapsed(), Duration::from_millis(2500));
	}
}
