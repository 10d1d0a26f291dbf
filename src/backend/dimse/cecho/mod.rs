use super::{command, DicomMessage, ReadError, DATA_SET_MISSING};
use crate::types::US;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;

/// C-ECHO-RQ
#[derive(Debug)]
pub struct CompositeEchoRequest {
	pub message_id: US,
}

impl TryFrom<&DicomMessage> for CompositeEchoRequest {
	type Error = ReadError;

	fn try_from(message: &DicomMessage) -> Result<Self, Self::Error> {
		let message_id = message
			.message_id()
			.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID))?;

		Ok(Self { message_id })
	}
}

/// C-ECHO-RSP
#[derive(Debug)]
pub struct CompositeEchoResponse {
	pub message_id: US,
	pub status: US,
}

impl From<CompositeEchoResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeEchoResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command::response_to(command::C_ECHO_RQ)])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}
