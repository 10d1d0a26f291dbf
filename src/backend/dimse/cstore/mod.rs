pub mod storescp;

use crate::backend::dimse::{command, DicomMessage, ReadError, DATA_SET_MISSING};
use crate::types::{AE, UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;

/// ERROR_COMMENT is a LO value.
const MAX_ERROR_COMMENT_LENGTH: usize = 64;

/// C-STORE-RQ
#[derive(Debug)]
pub struct CompositeStoreRequest {
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub move_originator_aet: Option<AE>,
	pub move_originator_message_id: Option<US>,
	pub message_id: US,
	pub priority: US,
	/// The encoded data set.
	pub data_set: Vec<u8>,
}

impl TryFrom<DicomMessage> for CompositeStoreRequest {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let affected_sop_class_uid = message.require_str(tags::AFFECTED_SOP_CLASS_UID)?;
		let affected_sop_instance_uid = message.require_str(tags::AFFECTED_SOP_INSTANCE_UID)?;
		let message_id = message
			.message_id()
			.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID))?;
		let priority = message
			.command
			.get(tags::PRIORITY)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.unwrap_or_default();
		let move_originator_message_id = message
			.command
			.get(tags::MOVE_ORIGINATOR_MESSAGE_ID)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok);
		let move_originator_aet = message
			.require_str(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE)
			.ok()
			.map(|aet| AE::from(aet.trim()));
		let data_set = message
			.data
			.ok_or(ReadError::MissingAttribute(tags::COMMAND_DATA_SET_TYPE))?;

		Ok(Self {
			affected_sop_class_uid,
			affected_sop_instance_uid,
			move_originator_aet,
			move_originator_message_id,
			message_id,
			priority,
			data_set,
		})
	}
}

/// C-STORE-RSP
#[derive(Debug)]
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub status: US,
	pub error_comment: Option<String>,
}

fn truncate_comment(comment: &str) -> &str {
	match comment.char_indices().nth(MAX_ERROR_COMMENT_LENGTH) {
		Some((index, _)) => &comment[..index],
		None => comment,
	}
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
		let mut command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command::response_to(command::C_STORE_RQ)])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid)),
		]);

		if let Some(comment) = response.error_comment.as_deref() {
			command.put_element(DataElement::new(tags::ERROR_COMMENT, VR::LO, dicom_value!(Str, truncate_comment(comment))));
		}

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}
