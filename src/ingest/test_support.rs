//! Fixtures shared by the ingest tests.

use crate::ingest::workqueue::{StudySummary, WorkItemId, WorkQueue, WorkQueueEntry, WorkQueueError};
use crate::ingest::{
	AssociationInfo, ChannelNotifier, DuplicatePolicy, NotificationSink, Partition, ReceiveRequest,
	RemoteDevice, StudyStorage,
};
use crate::types::{AE, UI};
use async_trait::async_trait;
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn partition(duplicate_policy: DuplicatePolicy) -> Partition {
	Partition {
		aet: AE::from("ARCHIVE"),
		interface: "127.0.0.1".parse().unwrap(),
		port: 11112,
		enabled: true,
		duplicate_policy,
		folder: String::from("ARCHIVE"),
		accept_unknown_devices: true,
		uncompressed: false,
	}
}

/// A notifier whose messages are discarded in the background. Needs a running runtime.
pub fn notifier() -> Arc<dyn NotificationSink> {
	let (tx, mut rx) = mpsc::channel(64);
	tokio::spawn(async move { while rx.recv().await.is_some() {} });
	Arc::new(ChannelNotifier::new(tx))
}

pub fn association_info() -> AssociationInfo {
	AssociationInfo {
		called_aet: AE::from("ARCHIVE"),
		calling_aet: AE::from("MODALITY"),
		peer: "10.0.0.7:4100".parse().unwrap(),
	}
}

pub fn work_queue_entry(study: &str, series: &str, sop: &str) -> WorkQueueEntry {
	WorkQueueEntry {
		study_storage: StudyStorage {
			partition: AE::from("ARCHIVE"),
			study_instance_uid: UI::from(study),
		},
		device: RemoteDevice {
			aet: AE::from("MODALITY"),
			partition: AE::from("ARCHIVE"),
			host: String::from("10.0.0.7"),
			port: 4100,
		},
		series_instance_uid: UI::from(series),
		sop_instance_uid: UI::from(sop),
		path: PathBuf::from(format!("/fs0/ARCHIVE/{study}/{series}/{sop}.dcm")),
		summary: StudySummary::default(),
		header: Vec::new(),
		reconcile: None,
	}
}

/// A minimal CT instance.
pub fn instance(study: &str, series: &str, sop: &str) -> InMemDicomObject {
	InMemDicomObject::from_element_iter([
		DataElement::new(
			tags::SOP_CLASS_UID,
			VR::UI,
			PrimitiveValue::from(uids::CT_IMAGE_STORAGE),
		),
		DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop)),
		DataElement::new(tags::STUDY_DATE, VR::DA, PrimitiveValue::from("20240102")),
		DataElement::new(tags::ACCESSION_NUMBER, VR::SH, PrimitiveValue::from("A-42")),
		DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
		DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("DOE^JANE")),
		DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("P-1")),
		DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(study)),
		DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(series)),
	])
}

/// Encodes `data_set` as explicit VR little endian, the way it arrives in P-DATA.
pub fn receive_request(data_set: &InMemDicomObject) -> ReceiveRequest {
	let transfer_syntax = TransferSyntaxRegistry
		.get(uids::EXPLICIT_VR_LITTLE_ENDIAN)
		.unwrap();
	let mut data = Vec::new();
	data_set
		.write_dataset_with_ts(&mut data, transfer_syntax)
		.unwrap();

	let uid = |tag| data_set.element(tag).unwrap().to_str().unwrap().to_string();
	ReceiveRequest {
		sop_class_uid: uid(tags::SOP_CLASS_UID),
		sop_instance_uid: uid(tags::SOP_INSTANCE_UID),
		transfer_syntax: UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
		data,
	}
}

/// A work queue that is reachable for lookups but refuses every write.
pub struct RefusingWorkQueue;

#[async_trait]
impl WorkQueue for RefusingWorkQueue {
	async fn exists_in_flight(
		&self,
		_study_storage: &StudyStorage,
		_series_instance_uid: &str,
		_sop_instance_uid: &str,
	) -> Result<bool, WorkQueueError> {
		Ok(false)
	}

	async fn register(&self, _entry: WorkQueueEntry) -> Result<WorkItemId, WorkQueueError> {
		Err(WorkQueueError::Unavailable(String::from("refused")))
	}

	async fn remove(&self, id: WorkItemId) -> Result<(), WorkQueueError> {
		Err(WorkQueueError::NotFound(id))
	}
}
