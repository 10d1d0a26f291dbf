use crate::ingest::{RemoteDevice, Study, StudyStorage};
use crate::types::{AE, UI};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkItemId(pub u64);

impl Display for WorkItemId {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Marks a work item as a duplicate that must be reconciled with the stored copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileTag {
	/// Group identifier for the reconciliation, `dup` for received duplicates.
	pub group: String,
	/// The AE title that sent the duplicate.
	pub source_aet: AE,
}

/// Demographics captured from the received header, kept with the work item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StudySummary {
	pub patient_id: Option<String>,
	pub patient_name: Option<String>,
	pub accession_number: Option<String>,
}

/// Everything the downstream processor needs to pick up one stored instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkQueueEntry {
	pub study_storage: StudyStorage,
	pub device: RemoteDevice,
	pub series_instance_uid: UI,
	pub sop_instance_uid: UI,
	/// Where the instance was committed to.
	pub path: PathBuf,
	pub summary: StudySummary,
	/// Serialized, filtered copy of the received header.
	pub header: Vec<u8>,
	pub reconcile: Option<ReconcileTag>,
}

impl WorkQueueEntry {
	pub const fn is_duplicate(&self) -> bool {
		self.reconcile.is_some()
	}
}

#[derive(Debug, Error)]
pub enum WorkQueueError {
	#[error("Work item {0} does not exist")]
	NotFound(WorkItemId),
	#[error("Work queue is unavailable: {0}")]
	Unavailable(String),
}

/// Intake of the downstream study processing.
#[async_trait]
pub trait WorkQueue: Send + Sync {
	/// Returns true if an unprocessed work item exists for the instance.
	async fn exists_in_flight(
		&self,
		study_storage: &StudyStorage,
		series_instance_uid: &str,
		sop_instance_uid: &str,
	) -> Result<bool, WorkQueueError>;

	async fn register(&self, entry: WorkQueueEntry) -> Result<WorkItemId, WorkQueueError>;

	/// Removes a registered work item again. Used to roll back [`WorkQueue::register`].
	async fn remove(&self, id: WorkItemId) -> Result<(), WorkQueueError>;
}

/// Looks up studies already known to the archive.
#[async_trait]
pub trait StudyDirectory: Send + Sync {
	async fn find_study(&self, study_instance_uid: &str, partition: &str) -> Option<Study>;
}

#[derive(Debug, Clone)]
struct WorkItem {
	entry: WorkQueueEntry,
	registered_at: SystemTime,
}

/// Listing view of a work item without the header blob.
#[derive(Debug, Clone, Serialize)]
pub struct WorkItemSummary {
	pub id: WorkItemId,
	pub partition: AE,
	pub study_instance_uid: UI,
	pub series_instance_uid: UI,
	pub sop_instance_uid: UI,
	pub source_aet: AE,
	pub path: PathBuf,
	pub duplicate: bool,
	pub registered_at: SystemTime,
}

/// Process-local work queue.
///
/// Only unprocessed items are held; [`InMemoryWorkQueue::mark_processed`] drops an item together
/// with its header. The study summaries answering [`StudyDirectory::find_study`] are kept for the
/// lifetime of the process, one per study.
///
/// Check-and-register is not atomic: two deliveries of the same instance can both pass
/// [`WorkQueue::exists_in_flight`] before either registers.
#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
	next_id: AtomicU64,
	items: RwLock<BTreeMap<WorkItemId, WorkItem>>,
	studies: RwLock<HashMap<StudyStorage, StudySummary>>,
}

impl InMemoryWorkQueue {
	/// Work items that were not processed yet, oldest first.
	pub fn pending(&self) -> Vec<WorkItemSummary> {
		let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
		items
			.iter()
			.map(|(id, item)| WorkItemSummary {
				id: *id,
				partition: item.entry.study_storage.partition.clone(),
				study_instance_uid: item.entry.study_storage.study_instance_uid.clone(),
				series_instance_uid: item.entry.series_instance_uid.clone(),
				sop_instance_uid: item.entry.sop_instance_uid.clone(),
				source_aet: item.entry.device.aet.clone(),
				path: item.entry.path.clone(),
				duplicate: item.entry.is_duplicate(),
				registered_at: item.registered_at,
			})
			.collect()
	}

	pub fn get(&self, id: WorkItemId) -> Option<WorkQueueEntry> {
		let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
		items.get(&id).map(|item| item.entry.clone())
	}

	/// Called by the consumer once it is done with an item. The item is dropped.
	pub fn mark_processed(&self, id: WorkItemId) -> Result<(), WorkQueueError> {
		let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
		items.remove(&id).ok_or(WorkQueueError::NotFound(id))?;
		debug!(work_item = %id, "Processed work item");
		Ok(())
	}

	/// Number of unprocessed items.
	pub fn len(&self) -> usize {
		self.items
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
	async fn exists_in_flight(
		&self,
		study_storage: &StudyStorage,
		series_instance_uid: &str,
		sop_instance_uid: &str,
	) -> Result<bool, WorkQueueError> {
		let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
		Ok(items.values().any(|item| {
			item.entry.study_storage == *study_storage
				&& item.entry.series_instance_uid == series_instance_uid
				&& item.entry.sop_instance_uid == sop_instance_uid
		}))
	}

	async fn register(&self, entry: WorkQueueEntry) -> Result<WorkItemId, WorkQueueError> {
		let id = WorkItemId(self.next_id.fetch_add(1, Ordering::SeqCst));
		debug!(
			work_item = %id,
			sop_instance_uid = entry.sop_instance_uid,
			duplicate = entry.is_duplicate(),
			"Registered work item"
		);
		self.studies
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.entry(entry.study_storage.clone())
			.or_insert_with(|| entry.summary.clone());
		let item = WorkItem {
			entry,
			registered_at: SystemTime::now(),
		};
		self.items
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(id, item);
		Ok(id)
	}

	async fn remove(&self, id: WorkItemId) -> Result<(), WorkQueueError> {
		self.items
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&id)
			.map(|_| ())
			.ok_or(WorkQueueError::NotFound(id))
	}
}

#[async_trait]
impl StudyDirectory for InMemoryWorkQueue {
	async fn find_study(&self, study_instance_uid: &str, partition: &str) -> Option<Study> {
		let studies = self.studies.read().unwrap_or_else(PoisonError::into_inner);
		let study_storage = StudyStorage {
			partition: AE::from(partition),
			study_instance_uid: UI::from(study_instance_uid),
		};
		studies.get(&study_storage).map(|summary| Study {
			study_instance_uid: study_storage.study_instance_uid.clone(),
			accession_number: summary.accession_number.clone(),
			patient_name: summary.patient_name.clone(),
			patient_id: summary.patient_id.clone(),
		})
	}
}
