use crate::ingest::processor::CommandProcessor;
use crate::ingest::steps::{MoveFileStep, RegisterWorkItemStep};
use crate::ingest::workqueue::{ReconcileTag, WorkQueue, WorkQueueEntry};
use crate::types::UI;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Reconciliation group assigned to received duplicates.
pub const DUPLICATE_RECONCILE_GROUP: &str = "dup";

/// What a partition does when an instance arrives whose destination is already occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DuplicatePolicy {
	/// Acknowledge with success and discard the received copy.
	SendSuccess,
	/// Answer with a duplicate SOP instance status.
	RejectDuplicates,
	/// Keep the received copy aside and queue it for reconciliation.
	CompareDuplicates,
	/// Replace the stored copy. Recognised in configuration but not supported by the receiver.
	AcceptLatest,
}

impl Display for DuplicatePolicy {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::SendSuccess => write!(f, "SendSuccess"),
			Self::RejectDuplicates => write!(f, "RejectDuplicates"),
			Self::CompareDuplicates => write!(f, "CompareDuplicates"),
			Self::AcceptLatest => write!(f, "AcceptLatest"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DuplicateError {
	#[error("Another copy of the SOP Instance was received but has not been processed: {sop_instance_uid}")]
	InFlight { sop_instance_uid: UI },
	#[error("Duplicate SOP Instance received, rejecting {sop_instance_uid}")]
	Rejected { sop_instance_uid: UI },
	#[error("Duplicate SOP Instance received. Unsupported duplicate policy {policy}.")]
	UnsupportedPolicy { policy: DuplicatePolicy },
}

impl DuplicateError {
	/// Duplicates are reported to the sender as such; a bad policy is a configuration error.
	pub const fn is_duplicate(&self) -> bool {
		matches!(self, Self::InFlight { .. } | Self::Rejected { .. })
	}
}

/// The decision for one received instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
	/// First copy: store it and queue it for processing.
	NewInstance,
	/// Duplicate that is acknowledged and dropped.
	AcceptDuplicate,
	/// Duplicate that is kept aside for reconciliation.
	ReconcileDuplicate,
}

/// Decides how to handle a received instance.
///
/// An unprocessed copy in the work queue always wins, whatever the policy. This keeps two
/// near-simultaneous deliveries of one instance from both taking the new-instance path.
pub fn resolve(
	policy: DuplicatePolicy,
	in_flight: bool,
	destination_exists: bool,
	sop_instance_uid: &str,
) -> Result<Disposition, DuplicateError> {
	if in_flight {
		return Err(DuplicateError::InFlight {
			sop_instance_uid: UI::from(sop_instance_uid),
		});
	}
	if !destination_exists {
		return Ok(Disposition::NewInstance);
	}
	match policy {
		DuplicatePolicy::SendSuccess => Ok(Disposition::AcceptDuplicate),
		DuplicatePolicy::RejectDuplicates => Err(DuplicateError::Rejected {
			sop_instance_uid: UI::from(sop_instance_uid),
		}),
		DuplicatePolicy::CompareDuplicates => Ok(Disposition::ReconcileDuplicate),
		policy @ DuplicatePolicy::AcceptLatest => Err(DuplicateError::UnsupportedPolicy { policy }),
	}
}

/// Inputs needed to turn a [`Disposition`] into a commit plan.
pub struct PlanTargets {
	pub staged: PathBuf,
	pub destination: PathBuf,
	pub reconcile: PathBuf,
	pub work_queue: Arc<dyn WorkQueue>,
	/// The work item as registered for a new instance; path and tag are adjusted for duplicates.
	pub entry: WorkQueueEntry,
}

impl Disposition {
	pub fn plan(self, description: impl Into<String>, targets: PlanTargets) -> CommandProcessor {
		let processor = CommandProcessor::new(description);
		let PlanTargets {
			staged,
			destination,
			reconcile,
			work_queue,
			mut entry,
		} = targets;

		match self {
			Self::NewInstance => {
				entry.path.clone_from(&destination);
				processor
					.with_step(MoveFileStep::new(staged, destination))
					.with_step(RegisterWorkItemStep::new(work_queue, entry))
			}
			Self::AcceptDuplicate => processor,
			Self::ReconcileDuplicate => {
				entry.path.clone_from(&reconcile);
				entry.reconcile = Some(ReconcileTag {
					group: String::from(DUPLICATE_RECONCILE_GROUP),
					source_aet: entry.device.aet.clone(),
				});
				processor
					.with_step(MoveFileStep::new(staged, reconcile))
					.with_step(RegisterWorkItemStep::new(work_queue, entry))
			}
		}
	}
}
