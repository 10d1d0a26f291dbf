use crate::ingest::workqueue::InMemoryWorkQueue;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum NotifyError {
	#[error("Notification channel is full")]
	Full,
	#[error("Notification channel is closed")]
	Closed,
}

/// Tells the downstream study processing that new work was queued.
/// Publishing is fire-and-forget: callers log failures and carry on.
pub trait NotificationSink: Send + Sync {
	fn publish(&self, correlation_token: &str) -> Result<(), NotifyError>;
}

/// Publishes into a bounded channel without ever waiting for capacity.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
	sender: Sender<String>,
}

impl ChannelNotifier {
	pub const fn new(sender: Sender<String>) -> Self {
		Self { sender }
	}
}

impl NotificationSink for ChannelNotifier {
	fn publish(&self, correlation_token: &str) -> Result<(), NotifyError> {
		self.sender
			.try_send(correlation_token.to_owned())
			.map_err(|err| match err {
				TrySendError::Full(_) => NotifyError::Full,
				TrySendError::Closed(_) => NotifyError::Closed,
			})
	}
}

/// Consumes the published messages until every sender is gone.
///
/// The study processing itself runs outside this service; the consumer reports how much work is
/// waiting whenever a message arrives.
pub async fn drain(mut receiver: Receiver<String>, work_queue: Arc<InMemoryWorkQueue>) -> usize {
	let mut received = 0;
	while let Some(correlation_token) = receiver.recv().await {
		received += 1;
		info!(
			correlation_token = %correlation_token,
			pending = work_queue.len(),
			"Received study process message"
		);
	}
	debug!("Study process channel closed after {received} message(s)");
	received
}
