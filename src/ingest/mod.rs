//! The storage ingestion pipeline.
//!
//! Every received instance flows through the [`ReceiveHandler`]: it is staged to a temporary
//! file, a storage location is resolved for its study, the [`duplicate`] policy decides what to
//! do with it and the resulting commit plan is applied all-or-nothing by the [`CommandProcessor`].

pub mod allocator;
pub mod devices;
pub mod duplicate;
pub mod handler;
pub mod notify;
pub mod processor;
pub mod staging;
pub mod steps;
pub mod workqueue;

#[cfg(test)]
pub(crate) mod test_support;

pub use allocator::{AllocationError, FilesystemAllocator, StorageAllocator};
pub use devices::{ConfiguredPartitions, DeviceRegistry, InMemoryDeviceRegistry, PartitionDirectory};
pub use duplicate::{Disposition, DuplicateError, DuplicatePolicy};
pub use handler::{Collaborators, ReceiveHandler, StoreOutcome, StoreStatus};
pub use notify::{ChannelNotifier, NotificationSink};
pub use processor::{CommandProcessor, ProcessorError, Step, StepError};
pub use staging::ReceiveRequest;
pub use workqueue::{InMemoryWorkQueue, StudyDirectory, WorkQueue, WorkQueueEntry};

use crate::config::{DeviceConfig, PartitionConfig};
use crate::types::{AE, UI};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use uuid::Uuid;

/// A logically isolated archive tenant, reachable under its own AE title and port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
	pub aet: AE,
	pub interface: IpAddr,
	pub port: u16,
	pub enabled: bool,
	pub duplicate_policy: DuplicatePolicy,
	/// Folder below a filesystem root that holds the studies of this partition.
	pub folder: String,
	pub accept_unknown_devices: bool,
	pub uncompressed: bool,
}

impl From<&PartitionConfig> for Partition {
	fn from(config: &PartitionConfig) -> Self {
		Self {
			aet: config.aet.clone(),
			interface: config.interface,
			port: config.port,
			enabled: config.enabled,
			duplicate_policy: config.duplicate_policy,
			folder: config
				.folder
				.clone()
				.unwrap_or_else(|| path_component(&config.aet)),
			accept_unknown_devices: config.accept_unknown_devices,
			uncompressed: config.uncompressed,
		}
	}
}

impl Partition {
	pub const fn address(&self) -> SocketAddr {
		SocketAddr::new(self.interface, self.port)
	}
}

/// A sending application entity, scoped to the partition it called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteDevice {
	pub aet: AE,
	pub partition: AE,
	pub host: String,
	pub port: u16,
}

impl From<&DeviceConfig> for RemoteDevice {
	fn from(config: &DeviceConfig) -> Self {
		Self {
			aet: AE::from(config.aet.trim()),
			partition: AE::from(config.partition.trim()),
			host: config.host.clone(),
			port: config.port,
		}
	}
}

/// What the transport knows about the association an instance arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationInfo {
	pub called_aet: AE,
	pub calling_aet: AE,
	pub peer: SocketAddr,
}

/// Identifies the storage record of one study within one partition.
/// Work items and in-flight checks are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StudyStorage {
	pub partition: AE,
	pub study_instance_uid: UI,
}

/// A writable destination for the instances of one study.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
	pub study_storage: StudyStorage,
	/// The study folder, e.g. `<filesystem>/<partition>/<study date>/<study uid>`.
	pub root: PathBuf,
	pub transfer_syntax: UI,
}

impl StorageLocation {
	/// The final path of an instance: `<root>/<series uid>/<sop instance uid>.dcm`.
	pub fn instance_path(&self, series_instance_uid: &str, sop_instance_uid: &str) -> PathBuf {
		self.root
			.join(series_instance_uid)
			.join(format!("{sop_instance_uid}.dcm"))
	}
}

/// The staging area of a writable filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemInfo {
	pub temp_dir: PathBuf,
	pub reconcile_dir: PathBuf,
}

impl FilesystemInfo {
	/// Holding path for a duplicate that has to be reconciled with the stored copy. Every received
	/// copy gets its own file so that earlier copies awaiting reconciliation are kept.
	pub fn reconcile_path(
		&self,
		sender_aet: &str,
		study_instance_uid: &str,
		series_instance_uid: &str,
		sop_instance_uid: &str,
		copy: Uuid,
	) -> PathBuf {
		self.reconcile_dir
			.join(path_component(sender_aet))
			.join(study_instance_uid)
			.join(series_instance_uid)
			.join(format!("{sop_instance_uid}.{copy}.dcm"))
	}
}

/// Study level attributes of a study already known to the archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Study {
	pub study_instance_uid: UI,
	pub accession_number: Option<String>,
	pub patient_name: Option<String>,
	pub patient_id: Option<String>,
}

/// Makes an AE title usable as a single path component.
pub fn path_component(value: &str) -> String {
	let sanitized: String = value
		.trim()
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
				c
			} else {
				'_'
			}
		})
		.collect();
	if sanitized.is_empty() {
		String::from("_")
	} else {
		sanitized
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn instance_path_is_derived_from_series_and_instance() {
		let location = StorageLocation {
			study_storage: StudyStorage {
				partition: AE::from("ARCHIVE"),
				study_instance_uid: UI::from("1.2.3"),
			},
			root: PathBuf::from("/fs0/ARCHIVE/20240101/1.2.3"),
			transfer_syntax: UI::from("1.2.840.10008.1.2.1"),
		};

		assert_eq!(
			location.instance_path("1.2.3.4", "1.2.3.4.5"),
			PathBuf::from("/fs0/ARCHIVE/20240101/1.2.3/1.2.3.4/1.2.3.4.5.dcm")
		);
	}

	#[test]
	fn reconcile_path_is_keyed_by_sender() {
		let filesystem = FilesystemInfo {
			temp_dir: PathBuf::from("/fs0/temp"),
			reconcile_dir: PathBuf::from("/fs0/reconcile"),
		};

		assert_eq!(
			filesystem.reconcile_path("CT 01/../", "1.2", "1.2.3", "1.2.3.4", Uuid::nil()),
			PathBuf::from(
				"/fs0/reconcile/CT_01____/1.2/1.2.3/1.2.3.4.00000000-0000-0000-0000-000000000000.dcm"
			)
		);
	}
}
