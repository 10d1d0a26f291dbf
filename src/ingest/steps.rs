use crate::ingest::processor::{Step, StepError};
use crate::ingest::workqueue::{WorkItemId, WorkQueue, WorkQueueEntry};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io;
use tracing::{debug, warn};

/// Moves a file and moves it back on rollback.
/// Refuses to overwrite an existing destination.
pub struct MoveFileStep {
	source: PathBuf,
	destination: PathBuf,
	moved: bool,
}

impl MoveFileStep {
	pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
		Self {
			source: source.into(),
			destination: destination.into(),
			moved: false,
		}
	}
}

#[async_trait]
impl Step for MoveFileStep {
	fn description(&self) -> String {
		format!(
			"Move {} to {}",
			self.source.display(),
			self.destination.display()
		)
	}

	async fn apply(&mut self) -> Result<(), StepError> {
		if let Some(parent) = self.destination.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|err| StepError::io(parent, err))?;
		}
		move_file(&self.source, &self.destination).await?;
		self.moved = true;
		Ok(())
	}

	async fn rollback(&mut self) -> Result<(), StepError> {
		if !self.moved {
			return Ok(());
		}
		move_file(&self.destination, &self.source).await?;
		self.moved = false;
		Ok(())
	}
}

/// Moves `from` to `to` without ever replacing an existing `to`.
///
/// The file is hard linked first, which fails atomically if `to` exists, then the source link is
/// removed. Filesystems without hard links, or a move across devices, fall back to copying into a
/// newly created file.
async fn move_file(from: &Path, to: &Path) -> Result<(), StepError> {
	match fs::hard_link(from, to).await {
		Ok(()) => {}
		Err(err) if err.kind() == ErrorKind::AlreadyExists => {
			return Err(StepError::DestinationExists(to.to_path_buf()));
		}
		Err(err) if err.kind() == ErrorKind::NotFound => return Err(StepError::io(from, err)),
		Err(err) => {
			debug!("Hard link to {} failed, copying instead: {err}", to.display());
			copy_new(from, to).await?;
		}
	}
	fs::remove_file(from)
		.await
		.map_err(|err| StepError::io(from, err))
}

async fn copy_new(from: &Path, to: &Path) -> Result<(), StepError> {
	let mut target = match OpenOptions::new().write(true).create_new(true).open(to).await {
		Ok(target) => target,
		Err(err) if err.kind() == ErrorKind::AlreadyExists => {
			return Err(StepError::DestinationExists(to.to_path_buf()));
		}
		Err(err) => return Err(StepError::io(to, err)),
	};
	let copied = async {
		let mut source = fs::File::open(from).await?;
		io::copy(&mut source, &mut target).await?;
		target.sync_all().await
	}
	.await;
	if let Err(err) = copied {
		// Never leave a partial copy behind
		if let Err(cleanup) = fs::remove_file(to).await {
			warn!("Failed to remove partial copy {}: {cleanup}", to.display());
		}
		return Err(StepError::io(from, err));
	}
	Ok(())
}

/// Registers a work item and removes it again on rollback.
pub struct RegisterWorkItemStep {
	queue: Arc<dyn WorkQueue>,
	entry: WorkQueueEntry,
	registered: Option<WorkItemId>,
}

impl RegisterWorkItemStep {
	pub fn new(queue: Arc<dyn WorkQueue>, entry: WorkQueueEntry) -> Self {
		Self {
			queue,
			entry,
			registered: None,
		}
	}
}

#[async_trait]
impl Step for RegisterWorkItemStep {
	fn description(&self) -> String {
		if self.entry.is_duplicate() {
			format!(
				"Register duplicate work item for {}",
				self.entry.sop_instance_uid
			)
		} else {
			format!("Register work item for {}", self.entry.sop_instance_uid)
		}
	}

	async fn apply(&mut self) -> Result<(), StepError> {
		let id = self.queue.register(self.entry.clone()).await?;
		self.registered = Some(id);
		Ok(())
	}

	async fn rollback(&mut self) -> Result<(), StepError> {
		if let Some(id) = self.registered.take() {
			self.queue.remove(id).await?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ingest::processor::CommandProcessor;
	use crate::ingest::test_support::{work_queue_entry, RefusingWorkQueue};
	use crate::ingest::workqueue::InMemoryWorkQueue;

	#[tokio::test]
	async fn move_creates_parent_folders() {
		let dir = tempfile::tempdir().unwrap();
		let source = dir.path().join("staged");
		let destination = dir.path().join("a/b/c.dcm");
		std::fs::write(&source, b"DICM").unwrap();

		let mut step = MoveFileStep::new(&source, &destination);
		step.apply().await.unwrap();

		assert!(!source.exists());
		assert_eq!(std::fs::read(&destination).unwrap(), b"DICM");
	}

	#[tokio::test]
	async fn move_refuses_to_overwrite() {
		let dir = tempfile::tempdir().unwrap();
		let source = dir.path().join("staged");
		let destination = dir.path().join("stored.dcm");
		std::fs::write(&source, b"new").unwrap();
		std::fs::write(&destination, b"old").unwrap();

		let mut step = MoveFileStep::new(&source, &destination);
		let err = step.apply().await.unwrap_err();

		assert!(matches!(err, StepError::DestinationExists(_)));
		assert_eq!(std::fs::read(&destination).unwrap(), b"old");
		assert!(source.exists());
	}

	#[tokio::test]
	async fn copy_fallback_refuses_to_overwrite() {
		let dir = tempfile::tempdir().unwrap();
		let source = dir.path().join("staged");
		let destination = dir.path().join("stored.dcm");
		std::fs::write(&source, b"new").unwrap();
		std::fs::write(&destination, b"old").unwrap();

		let err = copy_new(&source, &destination).await.unwrap_err();

		assert!(matches!(err, StepError::DestinationExists(_)));
		assert_eq!(std::fs::read(&destination).unwrap(), b"old");
	}

	#[tokio::test]
	async fn copy_fallback_copies_into_new_file() {
		let dir = tempfile::tempdir().unwrap();
		let source = dir.path().join("staged");
		let destination = dir.path().join("stored.dcm");
		std::fs::write(&source, b"DICM").unwrap();

		copy_new(&source, &destination).await.unwrap();

		assert_eq!(std::fs::read(&destination).unwrap(), b"DICM");
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn concurrent_moves_to_one_destination_keep_the_first() {
		for _ in 0..50 {
			let dir = tempfile::tempdir().unwrap();
			let destination = dir.path().join("series/instance.dcm");
			let first = dir.path().join("first");
			let second = dir.path().join("second");
			std::fs::write(&first, b"first").unwrap();
			std::fs::write(&second, b"second").unwrap();

			let mut a = MoveFileStep::new(&first, &destination);
			let mut b = MoveFileStep::new(&second, &destination);
			let (a, b) = tokio::join!(
				tokio::spawn(async move { a.apply().await.map(|()| a) }),
				tokio::spawn(async move { b.apply().await.map(|()| b) }),
			);
			let (a, b) = (a.unwrap(), b.unwrap());

			assert!(a.is_ok() != b.is_ok(), "exactly one move must win");
			let (winner, loser, content) = if a.is_ok() {
				(first, second, b"first".as_slice())
			} else {
				(second, first, b"second".as_slice())
			};
			assert!(!winner.exists());
			assert!(loser.exists());
			assert_eq!(std::fs::read(&destination).unwrap(), content);
		}
	}

	#[tokio::test]
	async fn move_rollback_restores_source() {
		let dir = tempfile::tempdir().unwrap();
		let source = dir.path().join("staged");
		let destination = dir.path().join("series/instance.dcm");
		std::fs::write(&source, b"DICM").unwrap();

		let mut step = MoveFileStep::new(&source, &destination);
		step.apply().await.unwrap();
		step.rollback().await.unwrap();

		assert!(source.exists());
		assert!(!destination.exists());
	}

	#[tokio::test]
	async fn failed_registration_moves_file_back() {
		let dir = tempfile::tempdir().unwrap();
		let source = dir.path().join("staged");
		let destination = dir.path().join("series/instance.dcm");
		std::fs::write(&source, b"DICM").unwrap();

		let processor = CommandProcessor::new("store")
			.with_step(MoveFileStep::new(&source, &destination))
			.with_step(RegisterWorkItemStep::new(
				Arc::new(RefusingWorkQueue),
				work_queue_entry("1.2", "1.2.3", "1.2.3.4"),
			));

		assert!(processor.execute().await.is_err());
		assert!(source.exists());
		assert!(!destination.exists());
	}

	#[tokio::test]
	async fn register_rollback_removes_item() {
		let queue = Arc::new(InMemoryWorkQueue::default());
		let mut step = RegisterWorkItemStep::new(
			Arc::clone(&queue) as Arc<dyn WorkQueue>,
			work_queue_entry("1.2", "1.2.3", "1.2.3.4"),
		);

		step.apply().await.unwrap();
		assert_eq!(queue.len(), 1);

		step.rollback().await.unwrap();
		assert!(queue.is_empty());
	}
}
