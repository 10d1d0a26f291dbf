//! This module contains the DIMSE transport of the storage SCP.
//! - C-ECHO is answered by the verification service.
//! - C-STORE is handed to the ingestion pipeline by the storage service.
//! - Every other command is answered with a failure status.
//!

pub mod association;
pub mod cecho;
pub mod cstore;
pub mod listener;
pub mod response;
pub mod service;

use crate::types::{UI, US};
use association::{Association, AssociationError};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::fmt::{Debug, Formatter};
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message contains a data set.
/// For reading DICOM messages, prefer checking if (command_data_set_type != DATA_SET_MISSING) as
/// AEs are free to choose another value for a truthy state.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message has no data set.
pub const DATA_SET_MISSING: US = 0x0101; // DICOM NULL

/// Command field values.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_E.1.html>
pub mod command {
	use crate::types::US;

	pub const C_STORE_RQ: US = 0x0001;
	pub const C_GET_RQ: US = 0x0010;
	pub const C_FIND_RQ: US = 0x0020;
	pub const C_MOVE_RQ: US = 0x0021;
	pub const C_ECHO_RQ: US = 0x0030;
	pub const C_CANCEL_RQ: US = 0x0FFF;

	/// The command field of the response to `request`.
	pub const fn response_to(request: US) -> US {
		request | 0x8000
	}
}

/// Status codes sent by this SCP.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part04/sect_B.2.3.html>
pub mod status {
	use crate::types::US;

	pub const SUCCESS: US = 0x0000;
	pub const PROCESSING_FAILURE: US = 0x0110;
	pub const DUPLICATE_SOP_INSTANCE: US = 0x0111;
	pub const SOP_CLASS_NOT_SUPPORTED: US = 0x0122;
	pub const UNRECOGNIZED_OPERATION: US = 0x0211;
}

/// Represents a DICOM message composed of a command set followed by an optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	/// The command set.
	pub command: InMemDicomObject,
	/// The data set, still encoded in the transfer syntax of its presentation context.
	pub data: Option<Vec<u8>>,
	/// The presentation context id
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match &self.data {
			Some(data) => write!(f, "DicomMessage {{ command, data: {} bytes }}", data.len()),
			None => write!(f, "DicomMessage {{ command }}"),
		}
	}
}

impl DicomMessage {
	pub fn command_field(&self) -> Option<US> {
		self.command
			.get(tags::COMMAND_FIELD)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
	}

	pub fn message_id(&self) -> Option<US> {
		self.command
			.get(tags::MESSAGE_ID)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
	}

	pub fn require_str(&self, tag: Tag) -> Result<UI, ReadError> {
		self.command
			.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|value| UI::from(value.trim_end_matches(['\0', ' '])))
			.ok_or(ReadError::MissingAttribute(tag))
	}
}

/// Status types supported by the DIMSE services.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl TryFrom<u16> for StatusType {
	type Error = u16;

	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
	fn try_from(value: u16) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0x0100..=0x01FF | 0x0200..=0x02FF => Ok(Self::Failure),
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

pub trait DicomMessageReader {
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError>;
}

pub trait DicomMessageWriter {
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError>;
}

impl<A: Association> DicomMessageWriter for A {
	#[instrument(skip_all)]
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError> {
		let message: DicomMessage = Into::into(message);

		let presentation_context = match presentation_context_id {
			None => self.presentation_contexts().first(),
			Some(presentation_context_id) => self
				.presentation_contexts()
				.iter()
				.find(|pctx| pctx.id == presentation_context_id),
		}
		.ok_or(NegotiationError::NoPresentationContext)?;

		let mut command_buf = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;

		let command_pdu = Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Command,
				presentation_context_id: presentation_context.id,
				is_last: true,
				data: command_buf,
			}],
		};
		self.send(command_pdu, timeout).await?;

		if let Some(data) = message.data {
			let data_pdu = Pdu::PData {
				data: vec![PDataValue {
					value_type: PDataValueType::Data,
					presentation_context_id: presentation_context.id,
					is_last: true,
					data,
				}],
			};

			self.send(data_pdu, timeout).await?;
		}

		Ok(())
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Pdu),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Peer requested release of the association")]
	Released,
	#[error("Peer aborted the association")]
	Aborted,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute {0} is missing")]
	MissingAttribute(Tag),
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Failed to negotiate a presentation context")]
	NoPresentationContext,
}

/// Looks up the transfer syntax negotiated for a presentation context.
pub fn negotiated_transfer_syntax<A: Association>(
	association: &A,
	presentation_context_id: Option<u8>,
) -> Result<UI, NegotiationError> {
	let presentation_context = association
		.presentation_contexts()
		.iter()
		.find(|pctx| Some(pctx.id) == presentation_context_id)
		.ok_or(NegotiationError::NoPresentationContext)?;
	let transfer_syntax = presentation_context
		.transfer_syntax
		.trim_end_matches(['\0', ' ']);
	TransferSyntaxRegistry
		.get(transfer_syntax)
		.map(|ts| UI::from(ts.uid()))
		.ok_or_else(|| NegotiationError::UnknownTransferSyntax(UI::from(transfer_syntax)))
}

impl<A: Association> DicomMessageReader for A {
	#[instrument(skip_all)]
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let mut command_fragments = Vec::new();
		let mut data_fragments = Vec::new();
		let mut message_command: Option<InMemDicomObject> = None;

		loop {
			let pdu = self.receive(timeout).await?;
			let data = match pdu {
				Pdu::PData { data } => data,
				Pdu::ReleaseRQ => return Err(ReadError::Released),
				Pdu::AbortRQ { .. } => return Err(ReadError::Aborted),
				pdu => return Err(ReadError::UnexpectedPdu(pdu)),
			};

			for mut pdv in data {
				match pdv.value_type {
					PDataValueType::Command => {
						trace!("Received command fragment (last={})", pdv.is_last);
						if message_command.is_some() {
							// Already received the full command set.
							// Receiving another command fragment is not expected.
							return Err(ReadError::OutOfOrder);
						}
						command_fragments.append(&mut pdv.data);
						if pdv.is_last {
							let command = InMemDicomObject::read_dataset_with_ts(
								command_fragments.as_slice(),
								&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
							)?;
							let has_data_set = command
								.get(tags::COMMAND_DATA_SET_TYPE)
								.map(InMemElement::to_int::<US>)
								.and_then(Result::ok)
								.is_some_and(|value| value != DATA_SET_MISSING);

							if has_data_set {
								message_command = Some(command);
							} else {
								return Ok(DicomMessage {
									command,
									data: None,
									presentation_context_id: Some(pdv.presentation_context_id),
								});
							}
						}
					}
					PDataValueType::Data => {
						trace!("Received data fragment (last={})", pdv.is_last);
						// Cannot handle data fragments before the entire command set is received.
						if message_command.is_none() {
							return Err(ReadError::OutOfOrder);
						}
						data_fragments.append(&mut pdv.data);
						if pdv.is_last {
							let command = message_command.take().ok_or(ReadError::OutOfOrder)?;
							return Ok(DicomMessage {
								command,
								data: Some(data_fragments),
								presentation_context_id: Some(pdv.presentation_context_id),
							});
						}
					}
				}
			}
		}
	}
}
