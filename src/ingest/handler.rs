use crate::ingest::allocator::{AllocationError, StorageAllocator};
use crate::ingest::devices::{DeviceRegistry, PartitionDirectory};
use crate::ingest::duplicate::{self, Disposition, DuplicateError, PlanTargets};
use crate::ingest::notify::NotificationSink;
use crate::ingest::processor::ProcessorError;
use crate::ingest::staging::{self, InstanceHeader, ReceiveRequest, StagedInstance, StagingError};
use crate::ingest::workqueue::{StudyDirectory, WorkQueue, WorkQueueEntry, WorkQueueError};
use crate::ingest::{AssociationInfo, FilesystemInfo, Partition, RemoteDevice};
use crate::types::{AE, US};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinError;
use tracing::{debug, error, info, instrument, warn};

/// DIMSE status of a C-STORE as decided by the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
	Success,
	DuplicateSopInstance,
	ProcessingFailure,
}

impl StoreStatus {
	pub const fn code(self) -> US {
		match self {
			Self::Success => 0x0000,
			Self::DuplicateSopInstance => 0x0111,
			Self::ProcessingFailure => 0x0110,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
	pub status: StoreStatus,
	/// Sent back as error comment on failures.
	pub message: Option<String>,
}

impl StoreOutcome {
	pub const fn success() -> Self {
		Self {
			status: StoreStatus::Success,
			message: None,
		}
	}

	pub const fn is_success(&self) -> bool {
		matches!(self.status, StoreStatus::Success)
	}
}

#[derive(Debug, Error)]
pub enum ReceiveError {
	#[error("Partition not found for AE title {0}")]
	UnknownPartition(AE),
	#[error("Remote device {calling_aet} is not known to partition {partition}")]
	UnknownDevice { calling_aet: AE, partition: AE },
	#[error("Unable to process image, no writable filesystem found.")]
	NoFilesystem,
	#[error(transparent)]
	Staging(#[from] StagingError),
	#[error(transparent)]
	Allocation(#[from] AllocationError),
	#[error(transparent)]
	Duplicate(#[from] DuplicateError),
	#[error("Work queue lookup failed: {0}")]
	WorkQueue(#[from] WorkQueueError),
	#[error("Unable to check destination {}: {source}", .path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("Failure processing message: {0}. Sending failure status.")]
	Commit(#[from] ProcessorError),
	#[error("Commit task was interrupted: {0}")]
	Interrupted(#[from] JoinError),
}

impl ReceiveError {
	pub const fn status(&self) -> StoreStatus {
		match self {
			Self::Duplicate(err) if err.is_duplicate() => StoreStatus::DuplicateSopInstance,
			Self::Commit(err) if err.is_destination_taken() => StoreStatus::DuplicateSopInstance,
			_ => StoreStatus::ProcessingFailure,
		}
	}

	/// The error comment sent to the peer. Server paths and nested causes are only logged.
	pub fn comment(&self) -> String {
		match self {
			Self::Staging(
				StagingError::Io { .. }
				| StagingError::Task(_)
				| StagingError::Meta(_)
				| StagingError::Serialize(_),
			) => String::from("Failure staging message"),
			Self::Allocation(AllocationError::Io { .. }) => {
				String::from("Unable to prepare the study folder")
			}
			Self::WorkQueue(_) => String::from("Work queue lookup failed"),
			Self::Io { .. } => String::from("Unable to check the destination"),
			Self::Commit(err) if err.is_destination_taken() => {
				String::from("Another copy of the SOP Instance was stored concurrently")
			}
			Self::Commit(_) | Self::Interrupted(_) => String::from("Failure processing message"),
			_ => self.to_string(),
		}
	}
}

/// The collaborators the pipeline delegates to.
#[derive(Clone)]
pub struct Collaborators {
	pub partitions: Arc<dyn PartitionDirectory>,
	pub devices: Arc<dyn DeviceRegistry>,
	pub allocator: Arc<dyn StorageAllocator>,
	pub work_queue: Arc<dyn WorkQueue>,
	pub studies: Arc<dyn StudyDirectory>,
	pub notifier: Arc<dyn NotificationSink>,
}

/// Handles one received instance from staging to the final commit.
#[derive(Clone)]
pub struct ReceiveHandler {
	collaborators: Collaborators,
	correlation_token: String,
}

impl ReceiveHandler {
	pub fn new(collaborators: Collaborators, correlation_token: impl Into<String>) -> Self {
		Self {
			collaborators,
			correlation_token: correlation_token.into(),
		}
	}

	/// Runs the pipeline for one instance. Never fails: every error is logged and turned into the
	/// status the sender receives.
	#[instrument(skip_all, fields(
		called_aet = %association.called_aet,
		calling_aet = %association.calling_aet,
		sop_instance_uid = %request.sop_instance_uid,
	))]
	pub async fn receive(&self, association: &AssociationInfo, request: ReceiveRequest) -> StoreOutcome {
		match self.try_receive(association, request).await {
			Ok(disposition) => {
				debug!(?disposition, "Committed");
				if let Err(err) = self
					.collaborators
					.notifier
					.publish(&self.correlation_token)
				{
					warn!("Failed to publish study process message: {err}");
				}
				StoreOutcome::success()
			}
			Err(err) => {
				let status = err.status();
				if status == StoreStatus::DuplicateSopInstance {
					warn!("{err}");
				} else {
					error!("{err}");
				}
				StoreOutcome {
					status,
					message: Some(err.comment()),
				}
			}
		}
	}

	async fn try_receive(
		&self,
		association: &AssociationInfo,
		request: ReceiveRequest,
	) -> Result<Disposition, ReceiveError> {
		let partition = self
			.collaborators
			.partitions
			.find_by_aet(&association.called_aet)
			.ok_or_else(|| ReceiveError::UnknownPartition(association.called_aet.clone()))?;

		let device = self
			.collaborators
			.devices
			.lookup_or_register(
				&partition,
				&association.calling_aet,
				&association.peer.ip().to_string(),
				association.peer.port(),
			)
			.await
			.ok_or_else(|| ReceiveError::UnknownDevice {
				calling_aet: association.calling_aet.clone(),
				partition: partition.aet.clone(),
			})?;

		let filesystem = self
			.collaborators
			.allocator
			.select_filesystem()
			.await
			.ok_or(ReceiveError::NoFilesystem)?;

		let staged = staging::stage(&filesystem.temp_dir, request).await?;
		debug!(path = %staged.path.display(), "Staged");

		let result = self
			.commit(&partition, &device, &filesystem, &staged)
			.await;
		staged.discard().await;
		result
	}

	async fn commit(
		&self,
		partition: &Partition,
		device: &RemoteDevice,
		filesystem: &FilesystemInfo,
		staged: &StagedInstance,
	) -> Result<Disposition, ReceiveError> {
		let header = &staged.header;
		let location = self
			.collaborators
			.allocator
			.get_or_create_writable_location(
				&header.study_instance_uid,
				header.study_date.as_deref(),
				&header.transfer_syntax,
				partition,
			)
			.await?;
		debug!(root = %location.root.display(), "Location resolved");

		let destination =
			location.instance_path(&header.series_instance_uid, &header.sop_instance_uid);
		// The check and the later registration are not atomic. Two concurrent copies may both pass;
		// the move of the second one then fails on the occupied destination and its plan rolls back.
		let in_flight = self
			.collaborators
			.work_queue
			.exists_in_flight(
				&location.study_storage,
				&header.series_instance_uid,
				&header.sop_instance_uid,
			)
			.await?;
		let destination_exists =
			fs::try_exists(&destination)
				.await
				.map_err(|source| ReceiveError::Io {
					path: destination.clone(),
					source,
				})?;

		if destination_exists && !in_flight {
			self.log_duplicate(partition, device, header, &destination)
				.await;
		}

		let disposition = duplicate::resolve(
			partition.duplicate_policy,
			in_flight,
			destination_exists,
			&header.sop_instance_uid,
		)?;
		debug!(?disposition, "Resolved");

		let entry = WorkQueueEntry {
			study_storage: location.study_storage.clone(),
			device: device.clone(),
			series_instance_uid: header.series_instance_uid.clone(),
			sop_instance_uid: header.sop_instance_uid.clone(),
			path: destination.clone(),
			summary: header.summary.clone(),
			header: staged.filtered_header.clone(),
			reconcile: None,
		};
		let targets = PlanTargets {
			staged: staged.path.clone(),
			reconcile: filesystem.reconcile_path(
				&device.aet,
				&header.study_instance_uid,
				&header.series_instance_uid,
				&header.sop_instance_uid,
				staged.id,
			),
			destination,
			work_queue: Arc::clone(&self.collaborators.work_queue),
			entry,
		};
		let plan = disposition.plan(format!("Store {}", header.sop_instance_uid), targets);

		// Spawned so that a dropped association can not interrupt a half-applied plan
		let applied = tokio::spawn(plan.execute()).await??;
		debug!(applied, "Plan executed");
		Ok(disposition)
	}

	async fn log_duplicate(
		&self,
		partition: &Partition,
		device: &RemoteDevice,
		header: &InstanceHeader,
		destination: &Path,
	) {
		let study = self
			.collaborators
			.studies
			.find_study(&header.study_instance_uid, &partition.aet)
			.await;
		match study {
			Some(study) => info!(
				source_aet = device.aet,
				accession_number = study.accession_number.as_deref().unwrap_or_default(),
				patient_name = study.patient_name.as_deref().unwrap_or_default(),
				policy = %partition.duplicate_policy,
				"Duplicate SOP Instance received, existing copy at {}",
				destination.display()
			),
			None => info!(
				source_aet = device.aet,
				policy = %partition.duplicate_policy,
				"Duplicate SOP Instance received, existing copy at {}",
				destination.display()
			),
		}
	}
}
