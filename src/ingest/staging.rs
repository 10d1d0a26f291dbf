//! Staging of received data sets.
//!
//! The data set bytes arrive encoded in the negotiated transfer syntax. They are written
//! unchanged behind a freshly built file meta group, so the staged file is a valid DICOM file
//! that can be moved to its final destination as is.

use crate::ingest::workqueue::StudySummary;
use crate::types::{is_valid_uid, trim_uid, UI};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{FileMetaTable, FileMetaTableBuilder, InMemDicomObject, Tag};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

/// Attributes kept in the header copy that is persisted with the work item.
/// The transfer syntax travels in the file meta group.
pub const HEADER_ATTRIBUTES: [Tag; 28] = [
	tags::STUDY_INSTANCE_UID,
	tags::SERIES_INSTANCE_UID,
	tags::SOP_INSTANCE_UID,
	tags::SOP_CLASS_UID,
	tags::PATIENT_ID,
	tags::ISSUER_OF_PATIENT_ID,
	tags::ACCESSION_NUMBER,
	tags::PATIENT_NAME,
	tags::PATIENT_BIRTH_DATE,
	tags::PATIENT_BIRTH_TIME,
	tags::PATIENT_SEX,
	tags::STUDY_DATE,
	tags::STUDY_TIME,
	tags::STUDY_DESCRIPTION,
	tags::PATIENT_WEIGHT,
	tags::PATIENT_SIZE,
	tags::PATIENT_AGE,
	tags::INSTITUTION_NAME,
	tags::MODALITY,
	tags::SERIES_DESCRIPTION,
	tags::SERIES_NUMBER,
	tags::BODY_PART_EXAMINED,
	tags::MANUFACTURER,
	tags::PERFORMING_PHYSICIAN_NAME,
	tags::OPERATORS_NAME,
	tags::PATIENT_POSITION,
	tags::INSTANCE_NUMBER,
	tags::NUMBER_OF_FRAMES,
];

#[derive(Debug, Error)]
pub enum StagingError {
	#[error("Unknown transfer syntax {0}")]
	UnknownTransferSyntax(UI),
	#[error("Failed to build file meta group: {0}")]
	Meta(#[from] dicom::object::meta::Error),
	#[error("Failed to write staged file {}: {source}", .path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("Can not get the Dicom header: {0}")]
	Header(#[from] dicom::object::ReadError),
	#[error("Can not get the Dicom header: missing attribute {0}")]
	MissingAttribute(Tag),
	#[error("Invalid UID '{value}' in attribute {tag}")]
	InvalidUid { tag: Tag, value: String },
	#[error("Failed to serialize the filtered header: {0}")]
	Serialize(#[from] dicom::object::WriteError),
	#[error("Staging task failed: {0}")]
	Task(#[from] tokio::task::JoinError),
}

/// An instance as it arrived from the transport, before it is staged.
#[derive(Debug, Clone)]
pub struct ReceiveRequest {
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	/// The transfer syntax the data set is encoded in.
	pub transfer_syntax: UI,
	/// The encoded data set.
	pub data: Vec<u8>,
}

/// The identifying attributes of a received instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHeader {
	pub study_instance_uid: UI,
	pub series_instance_uid: UI,
	pub sop_instance_uid: UI,
	pub sop_class_uid: UI,
	pub transfer_syntax: UI,
	pub study_date: Option<String>,
	pub summary: StudySummary,
}

/// A received instance written to a temporary file.
#[derive(Debug)]
pub struct StagedInstance {
	/// Unique per received copy, also the name of the temporary file.
	pub id: Uuid,
	pub path: PathBuf,
	pub header: InstanceHeader,
	/// Serialized copy of the [`HEADER_ATTRIBUTES`] including the file meta group.
	pub filtered_header: Vec<u8>,
}

impl StagedInstance {
	/// Removes the temporary file if it is still there, i.e. it was not moved by a commit.
	pub async fn discard(self) {
		match fs::try_exists(&self.path).await {
			Ok(true) => {
				if let Err(err) = fs::remove_file(&self.path).await {
					warn!("Failed to delete temporary file {}: {err}", self.path.display());
				} else {
					debug!("Deleted temporary file {}", self.path.display());
				}
			}
			Ok(false) => {}
			Err(err) => warn!("Failed to check temporary file {}: {err}", self.path.display()),
		}
	}
}

/// Stages `request` into a uniquely named file below `temp_dir` and captures its header.
/// Nothing is left behind in `temp_dir` if staging fails.
pub async fn stage(temp_dir: &Path, request: ReceiveRequest) -> Result<StagedInstance, StagingError> {
	let id = Uuid::new_v4();
	let path = temp_dir.join(id.to_string());
	let temp_dir = temp_dir.to_path_buf();
	let staged_path = path.clone();

	let result = tokio::task::spawn_blocking(move || {
		std::fs::create_dir_all(&temp_dir).map_err(|source| StagingError::Io {
			path: temp_dir.clone(),
			source,
		})?;
		stage_blocking(&staged_path, &request)
	})
	.await
	.map_err(StagingError::from)
	.and_then(|result| result);

	match result {
		Ok((header, filtered_header)) => Ok(StagedInstance {
			id,
			path,
			header,
			filtered_header,
		}),
		Err(err) => {
			if fs::try_exists(&path).await.unwrap_or(false) {
				if let Err(cleanup) = fs::remove_file(&path).await {
					warn!("Failed to delete temporary file {}: {cleanup}", path.display());
				}
			}
			Err(err)
		}
	}
}

fn stage_blocking(
	path: &Path,
	request: &ReceiveRequest,
) -> Result<(InstanceHeader, Vec<u8>), StagingError> {
	let transfer_syntax = TransferSyntaxRegistry
		.get(trim_uid(&request.transfer_syntax))
		.ok_or_else(|| StagingError::UnknownTransferSyntax(request.transfer_syntax.clone()))?;

	let meta = FileMetaTableBuilder::new()
		.media_storage_sop_class_uid(trim_uid(&request.sop_class_uid))
		.media_storage_sop_instance_uid(trim_uid(&request.sop_instance_uid))
		.transfer_syntax(transfer_syntax.uid())
		.implementation_class_uid(IMPLEMENTATION_CLASS_UID)
		.implementation_version_name(IMPLEMENTATION_VERSION_NAME)
		.build()?;

	write_part10(path, &meta, &request.data)?;

	let data_set = InMemDicomObject::read_dataset_with_ts(request.data.as_slice(), transfer_syntax)?;
	let header = InstanceHeader::from_data_set(&data_set, transfer_syntax.uid())?;
	let filtered_header = filter_header(&data_set, meta)?;

	Ok((header, filtered_header))
}

/// Writes preamble, file meta group and the encoded data set.
fn write_part10(path: &Path, meta: &FileMetaTable, data: &[u8]) -> Result<(), StagingError> {
	let io_error = |source: std::io::Error| StagingError::Io {
		path: path.to_path_buf(),
		source,
	};

	let mut writer = BufWriter::new(File::create(path).map_err(io_error)?);
	writer.write_all(&[0; 128]).map_err(io_error)?;
	writer.write_all(b"DICM").map_err(io_error)?;
	meta.write(&mut writer)?;
	writer.write_all(data).map_err(io_error)?;
	let file = writer
		.into_inner()
		.map_err(|err| io_error(err.into_error()))?;
	file.sync_all().map_err(io_error)
}

fn filter_header(data_set: &InMemDicomObject, meta: FileMetaTable) -> Result<Vec<u8>, StagingError> {
	let mut filtered = InMemDicomObject::new_empty();
	for tag in HEADER_ATTRIBUTES {
		if let Some(element) = data_set.get(tag) {
			filtered.put(element.clone());
		}
	}

	let mut buffer = Vec::new();
	filtered.with_exact_meta(meta).write_all(&mut buffer)?;
	Ok(buffer)
}

fn optional_string(data_set: &InMemDicomObject, tag: Tag) -> Option<String> {
	data_set
		.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
		.filter(|value| !value.is_empty())
}

fn required_uid(data_set: &InMemDicomObject, tag: Tag) -> Result<UI, StagingError> {
	let value = optional_string(data_set, tag).ok_or(StagingError::MissingAttribute(tag))?;
	if is_valid_uid(&value) {
		Ok(value)
	} else {
		Err(StagingError::InvalidUid { tag, value })
	}
}

impl InstanceHeader {
	pub fn from_data_set(
		data_set: &InMemDicomObject,
		transfer_syntax: &str,
	) -> Result<Self, StagingError> {
		Ok(Self {
			study_instance_uid: required_uid(data_set, tags::STUDY_INSTANCE_UID)?,
			series_instance_uid: required_uid(data_set, tags::SERIES_INSTANCE_UID)?,
			sop_instance_uid: required_uid(data_set, tags::SOP_INSTANCE_UID)?,
			sop_class_uid: required_uid(data_set, tags::SOP_CLASS_UID)?,
			transfer_syntax: UI::from(trim_uid(transfer_syntax)),
			study_date: optional_string(data_set, tags::STUDY_DATE),
			summary: StudySummary {
				patient_id: optional_string(data_set, tags::PATIENT_ID),
				patient_name: optional_string(data_set, tags::PATIENT_NAME),
				accession_number: optional_string(data_set, tags::ACCESSION_NUMBER),
			},
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ingest::test_support::{instance, receive_request};
	use dicom::dictionary_std::uids;

	#[tokio::test]
	async fn stages_a_readable_dicom_file() {
		let dir = tempfile::tempdir().unwrap();
		let request = receive_request(&instance("1.2", "1.2.3", "1.2.3.4"));

		let staged = stage(dir.path(), request).await.unwrap();

		assert!(staged.path.starts_with(dir.path()));
		let file = dicom::object::open_file(&staged.path).unwrap();
		assert_eq!(file.meta().media_storage_sop_instance_uid(), "1.2.3.4");
		assert_eq!(
			file.element(tags::SERIES_INSTANCE_UID)
				.unwrap()
				.to_str()
				.unwrap(),
			"1.2.3"
		);

		assert_eq!(staged.header.study_instance_uid, "1.2");
		assert_eq!(staged.header.series_instance_uid, "1.2.3");
		assert_eq!(staged.header.sop_instance_uid, "1.2.3.4");
		assert_eq!(staged.header.study_date.as_deref(), Some("20240102"));
		assert_eq!(
			staged.header.summary.patient_name.as_deref(),
			Some("DOE^JANE")
		);
		assert_eq!(staged.header.transfer_syntax, uids::EXPLICIT_VR_LITTLE_ENDIAN);
	}

	#[tokio::test]
	async fn filtered_header_drops_other_attributes() {
		let dir = tempfile::tempdir().unwrap();
		let mut data_set = instance("1.2", "1.2.3", "1.2.3.4");
		data_set.put(InMemElement::new(
			tags::IMAGE_COMMENTS,
			dicom::core::VR::LT,
			dicom::core::PrimitiveValue::from("not persisted"),
		));

		let staged = stage(dir.path(), receive_request(&data_set)).await.unwrap();

		// from_reader expects the file without its preamble
		let header = dicom::object::from_reader(&staged.filtered_header[128..]).unwrap();
		assert!(header.get(tags::IMAGE_COMMENTS).is_none());
		assert!(header.get(tags::PATIENT_NAME).is_some());
		assert_eq!(
			header.meta().transfer_syntax(),
			uids::EXPLICIT_VR_LITTLE_ENDIAN
		);
	}

	#[tokio::test]
	async fn missing_uid_leaves_nothing_behind() {
		let dir = tempfile::tempdir().unwrap();
		let mut data_set = instance("1.2", "1.2.3", "1.2.3.4");
		data_set.remove_element(tags::SERIES_INSTANCE_UID);

		let err = stage(dir.path(), receive_request(&data_set))
			.await
			.unwrap_err();

		assert!(matches!(
			err,
			StagingError::MissingAttribute(tag) if tag == tags::SERIES_INSTANCE_UID
		));
		assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
	}

	#[tokio::test]
	async fn path_like_uids_are_refused() {
		let dir = tempfile::tempdir().unwrap();
		let data_set = instance("1.2", "../../escape", "1.2.3.4");

		let err = stage(dir.path(), receive_request(&data_set))
			.await
			.unwrap_err();

		assert!(matches!(err, StagingError::InvalidUid { .. }));
	}

	#[tokio::test]
	async fn garbage_is_not_a_header() {
		let dir = tempfile::tempdir().unwrap();
		let mut request = receive_request(&instance("1.2", "1.2.3", "1.2.3.4"));
		request.data = vec![0xFF; 7];

		assert!(stage(dir.path(), request).await.is_err());
		assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
	}

	#[tokio::test]
	async fn discard_removes_the_file_once() {
		let dir = tempfile::tempdir().unwrap();
		let request = receive_request(&instance("1.2", "1.2.3", "1.2.3.4"));

		let staged = stage(dir.path(), request).await.unwrap();
		let path = staged.path.clone();
		staged.discard().await;

		assert!(!path.exists());
	}
}
