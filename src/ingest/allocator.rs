use crate::config::{FilesystemConfig, FilesystemTier, StorageConfig};
use crate::ingest::{FilesystemInfo, Partition, StorageLocation, StudyStorage};
use crate::types::{trim_uid, UI};
use async_trait::async_trait;
use dicom::encoding::TransferSyntaxIndex;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Folder used when a study carries no usable study date.
const UNKNOWN_STUDY_DATE: &str = "UNKNOWN";

#[derive(Debug, Error)]
pub enum AllocationError {
	#[error("Unable to process image, no writable filesystem found for Study UID {study_instance_uid}.")]
	NoWritableFilesystem { study_instance_uid: UI },
	#[error("Study {study_instance_uid} is nearline{}", restore_suffix(.restore_requested))]
	Nearline {
		study_instance_uid: UI,
		restore_requested: bool,
	},
	#[error("Transfer syntax {transfer_syntax} is not supported for storage")]
	UnsupportedTransferSyntax { transfer_syntax: UI },
	#[error("Unable to prepare the study folder {}: {source}", .path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

const fn restore_suffix(restore_requested: &bool) -> &'static str {
	if *restore_requested {
		". Restore has been requested."
	} else {
		""
	}
}

/// Resolves where the instances of a study are written to.
///
/// Implementations must be safe for concurrent callers and deterministic per study: once a
/// location was chosen for a study, every later call for that study returns the same root for as
/// long as the study folder stays there.
#[async_trait]
pub trait StorageAllocator: Send + Sync {
	/// The staging area of a writable filesystem, or `None` if none is writable.
	async fn select_filesystem(&self) -> Option<FilesystemInfo>;

	async fn get_or_create_writable_location(
		&self,
		study_instance_uid: &str,
		study_date: Option<&str>,
		transfer_syntax: &str,
		partition: &Partition,
	) -> Result<StorageLocation, AllocationError>;
}

/// Allocates study folders on the configured filesystems.
///
/// Studies live at `<filesystem>/<partition folder>/<study date>/<study uid>`. A study whose
/// folder is found on a nearline filesystem cannot be written to until it is restored.
///
/// Chosen roots and restore requests are kept in memory for the lifetime of the process, one
/// entry per study. Suited for a single node; a deployment with a catalogue database would look
/// the study up there instead.
pub struct FilesystemAllocator {
	filesystems: Vec<FilesystemConfig>,
	restore_nearline: bool,
	state: Mutex<AllocatorState>,
}

#[derive(Default)]
struct AllocatorState {
	locations: HashMap<StudyStorage, PathBuf>,
	restore_requests: HashSet<StudyStorage>,
}

impl FilesystemAllocator {
	pub fn new(filesystems: &[FilesystemConfig], storage: &StorageConfig) -> Self {
		Self {
			filesystems: filesystems.to_vec(),
			restore_nearline: storage.restore_nearline,
			state: Mutex::new(AllocatorState::default()),
		}
	}

	fn writable(&self) -> impl Iterator<Item = &FilesystemConfig> {
		self.filesystems
			.iter()
			.filter(|filesystem| filesystem.writable && filesystem.tier == FilesystemTier::Online)
	}

	fn nearline(&self) -> impl Iterator<Item = &FilesystemConfig> {
		self.filesystems
			.iter()
			.filter(|filesystem| filesystem.tier == FilesystemTier::Nearline)
	}

	/// Studies requested for restore from nearline storage.
	pub async fn restore_requests(&self) -> Vec<StudyStorage> {
		let state = self.state.lock().await;
		let mut requests: Vec<_> = state.restore_requests.iter().cloned().collect();
		requests.sort();
		requests
	}
}

fn study_folder(root: &Path, partition: &Partition, study_date: &str, study: &str) -> PathBuf {
	root.join(&partition.folder).join(study_date).join(study)
}

fn folder_date(study_date: Option<&str>) -> &str {
	match study_date.map(str::trim) {
		Some(date) if date.len() == 8 && date.bytes().all(|b| b.is_ascii_digit()) => date,
		_ => UNKNOWN_STUDY_DATE,
	}
}

async fn is_dir(path: &Path) -> bool {
	fs::metadata(path)
		.await
		.is_ok_and(|metadata| metadata.is_dir())
}

#[async_trait]
impl StorageAllocator for FilesystemAllocator {
	async fn select_filesystem(&self) -> Option<FilesystemInfo> {
		self.writable().next().map(|filesystem| FilesystemInfo {
			temp_dir: filesystem.path.join("temp"),
			reconcile_dir: filesystem.path.join("reconcile"),
		})
	}

	async fn get_or_create_writable_location(
		&self,
		study_instance_uid: &str,
		study_date: Option<&str>,
		transfer_syntax: &str,
		partition: &Partition,
	) -> Result<StorageLocation, AllocationError> {
		let transfer_syntax = trim_uid(transfer_syntax);
		if TransferSyntaxRegistry
			.get(transfer_syntax)
			.is_none_or(|ts| ts.is_unsupported())
		{
			return Err(AllocationError::UnsupportedTransferSyntax {
				transfer_syntax: UI::from(transfer_syntax),
			});
		}

		let study_storage = StudyStorage {
			partition: partition.aet.clone(),
			study_instance_uid: UI::from(study_instance_uid),
		};
		let location = |root: PathBuf| StorageLocation {
			study_storage: study_storage.clone(),
			root,
			transfer_syntax: UI::from(transfer_syntax),
		};

		// Held for the whole allocation so that concurrent receives of one study agree on a root
		let mut state = self.state.lock().await;
		if let Some(root) = state.locations.get(&study_storage).cloned() {
			if is_dir(&root).await {
				return Ok(location(root));
			}
			// Relocated or removed since, e.g. migrated to a nearline filesystem
			debug!(study_instance_uid, "Study folder {} is gone", root.display());
			state.locations.remove(&study_storage);
		}

		let date = folder_date(study_date);

		for filesystem in self.nearline() {
			if is_dir(&study_folder(&filesystem.path, partition, date, study_instance_uid)).await {
				let restore_requested = self.restore_nearline;
				if restore_requested && state.restore_requests.insert(study_storage.clone()) {
					info!(
						study_instance_uid,
						"Requested restore of nearline study from {}",
						filesystem.path.display()
					);
				}
				return Err(AllocationError::Nearline {
					study_instance_uid: UI::from(study_instance_uid),
					restore_requested,
				});
			}
		}

		// A study already on disk (e.g. from before a restart) keeps its folder
		for filesystem in self.writable() {
			let root = study_folder(&filesystem.path, partition, date, study_instance_uid);
			if is_dir(&root).await {
				debug!(study_instance_uid, "Reusing study folder {}", root.display());
				state.locations.insert(study_storage.clone(), root.clone());
				return Ok(location(root));
			}
		}

		let Some(filesystem) = self.writable().next() else {
			warn!(study_instance_uid, "No writable filesystem available");
			return Err(AllocationError::NoWritableFilesystem {
				study_instance_uid: UI::from(study_instance_uid),
			});
		};

		let root = study_folder(&filesystem.path, partition, date, study_instance_uid);
		fs::create_dir_all(&root)
			.await
			.map_err(|source| AllocationError::Io {
				path: root.clone(),
				source,
			})?;
		debug!(study_instance_uid, "Created study folder {}", root.display());
		state.locations.insert(study_storage.clone(), root.clone());
		Ok(location(root))
	}
}
