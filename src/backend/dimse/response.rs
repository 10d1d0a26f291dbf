use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::trace;

/// Decouples the transmission of responses from their computation.
///
/// Without a delay responses are sent inline by the caller. With a delay every response is sent
/// by a background task after sleeping; at most `workers` of them wait at a time, the others
/// queue for a permit.
#[derive(Debug, Clone)]
pub struct ResponseDispatcher {
	delay: Duration,
	permits: Arc<Semaphore>,
}

impl ResponseDispatcher {
	pub fn new(delay: Duration, workers: usize) -> Self {
		Self {
			delay,
			permits: Arc::new(Semaphore::new(workers.max(1))),
		}
	}

	pub const fn is_immediate(&self) -> bool {
		self.delay.is_zero()
	}

	/// Runs `send` after the configured delay. The task is tracked in `pending` so the association
	/// can flush outstanding responses before it is released.
	pub fn dispatch<F>(&self, pending: &mut JoinSet<()>, send: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let permits = Arc::clone(&self.permits);
		let delay = self.delay;
		pending.spawn(async move {
			// The semaphore is never closed
			let Ok(_permit) = permits.acquire_owned().await else {
				return;
			};
			trace!("Delaying response by {delay:?}");
			tokio::time::sleep(delay).await;
			send.await;
		});
	}
}
