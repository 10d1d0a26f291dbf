//! The DIMSE services offered on every partition endpoint.
//!
//! Services are looked up by the command field of the request. Registering a service for a
//! command field that is already taken replaces the previous service.

use crate::backend::dimse::cecho::{CompositeEchoRequest, CompositeEchoResponse};
use crate::backend::dimse::cstore::{CompositeStoreRequest, CompositeStoreResponse};
use crate::backend::dimse::{command, status, DicomMessage, ReadError, DATA_SET_MISSING};
use crate::ingest::{AssociationInfo, ReceiveHandler, ReceiveRequest};
use crate::types::{UI, US};
use async_trait::async_trait;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Per association state shared by the services.
#[derive(Debug)]
pub struct AssociationContext {
	pub info: AssociationInfo,
	stored: usize,
}

impl AssociationContext {
	pub const fn new(info: AssociationInfo) -> Self {
		Self { info, stored: 0 }
	}

	/// Bookkeeping after an instance was accepted.
	pub fn instance_stored(&mut self, sop_class_uid: &str, sop_instance_uid: &str) {
		self.stored += 1;
		info!(
			sop_instance_uid,
			sop_class_uid,
			stored = self.stored,
			"Received instance"
		);
	}

	/// Number of instances accepted on this association.
	pub const fn stored(&self) -> usize {
		self.stored
	}
}

/// A request together with the transfer syntax of its presentation context.
#[derive(Debug)]
pub struct ServiceRequest {
	pub message: DicomMessage,
	pub transfer_syntax: UI,
}

#[async_trait]
pub trait DimseService: Send + Sync {
	fn name(&self) -> &'static str;

	/// The command field of the requests this service answers.
	fn command_field(&self) -> US;

	async fn handle(
		&self,
		context: &mut AssociationContext,
		request: ServiceRequest,
	) -> Result<DicomMessage, ReadError>;
}

#[derive(Clone, Default)]
pub struct ServiceRegistry {
	services: BTreeMap<US, Arc<dyn DimseService>>,
}

impl ServiceRegistry {
	/// The verification and storage services backed by `handler`.
	pub fn storage(handler: ReceiveHandler) -> Self {
		let mut registry = Self::default();
		registry.register(VerificationService);
		registry.register(StoreService::new(handler));
		registry
	}

	pub fn register(&mut self, service: impl DimseService + 'static) {
		let command_field = service.command_field();
		if let Some(previous) = self.services.insert(command_field, Arc::new(service)) {
			debug!(
				"Replaced service {} for command field {command_field:#06x}",
				previous.name()
			);
		}
	}

	pub fn find(&self, command_field: US) -> Option<Arc<dyn DimseService>> {
		self.services.get(&command_field).cloned()
	}

	pub fn names(&self) -> Vec<&'static str> {
		self.services.values().map(|service| service.name()).collect()
	}
}

/// Answers a request no service is registered for.
/// Returns `None` for requests that must not be answered.
pub fn refuse(message: &DicomMessage, command_field: US) -> Option<DicomMessage> {
	let status = match command_field {
		command::C_CANCEL_RQ => return None,
		command::C_FIND_RQ | command::C_MOVE_RQ | command::C_GET_RQ => {
			status::SOP_CLASS_NOT_SUPPORTED
		}
		_ => status::UNRECOGNIZED_OPERATION,
	};

	let mut response = InMemDicomObject::command_from_element_iter([
		DataElement::new(
			tags::COMMAND_FIELD,
			VR::US,
			dicom_value!(U16, [command::response_to(command_field)]),
		),
		DataElement::new(
			tags::MESSAGE_ID_BEING_RESPONDED_TO,
			VR::US,
			dicom_value!(U16, [message.message_id().unwrap_or_default()]),
		),
		DataElement::new(
			tags::COMMAND_DATA_SET_TYPE,
			VR::US,
			dicom_value!(U16, [DATA_SET_MISSING]),
		),
		DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
	]);
	if let Ok(sop_class_uid) = message.require_str(tags::AFFECTED_SOP_CLASS_UID) {
		response.put_element(DataElement::new(
			tags::AFFECTED_SOP_CLASS_UID,
			VR::UI,
			dicom_value!(Str, sop_class_uid),
		));
	}

	Some(DicomMessage {
		command: response,
		data: None,
		presentation_context_id: None,
	})
}

/// C-ECHO
pub struct VerificationService;

#[async_trait]
impl DimseService for VerificationService {
	fn name(&self) -> &'static str {
		"Verification"
	}

	fn command_field(&self) -> US {
		command::C_ECHO_RQ
	}

	async fn handle(
		&self,
		_context: &mut AssociationContext,
		request: ServiceRequest,
	) -> Result<DicomMessage, ReadError> {
		let echo = CompositeEchoRequest::try_from(&request.message)?;
		debug!(message_id = echo.message_id, "Received echo request");
		Ok(CompositeEchoResponse {
			message_id: echo.message_id,
			status: status::SUCCESS,
		}
		.into())
	}
}

/// C-STORE, handed to the ingestion pipeline.
pub struct StoreService {
	handler: ReceiveHandler,
}

impl StoreService {
	pub const fn new(handler: ReceiveHandler) -> Self {
		Self { handler }
	}
}

#[async_trait]
impl DimseService for StoreService {
	fn name(&self) -> &'static str {
		"Storage"
	}

	fn command_field(&self) -> US {
		command::C_STORE_RQ
	}

	async fn handle(
		&self,
		context: &mut AssociationContext,
		request: ServiceRequest,
	) -> Result<DicomMessage, ReadError> {
		let store = CompositeStoreRequest::try_from(request.message)?;
		if let Some(move_originator) = &store.move_originator_aet {
			debug!(
				move_originator,
				move_originator_message_id = store.move_originator_message_id,
				"Received instance as C-MOVE sub-operation"
			);
		}

		let outcome = self
			.handler
			.receive(
				&context.info,
				ReceiveRequest {
					sop_class_uid: store.affected_sop_class_uid.clone(),
					sop_instance_uid: store.affected_sop_instance_uid.clone(),
					transfer_syntax: request.transfer_syntax,
					data: store.data_set,
				},
			)
			.await;

		if outcome.is_success() {
			context.instance_stored(
				&store.affected_sop_class_uid,
				&store.affected_sop_instance_uid,
			);
		}

		Ok(CompositeStoreResponse {
			message_id: store.message_id,
			sop_class_uid: store.affected_sop_class_uid,
			sop_instance_uid: store.affected_sop_instance_uid,
			status: outcome.status.code(),
			error_comment: outcome.message,
		}
		.into())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{FilesystemConfig, FilesystemTier, StorageConfig};
	use crate::ingest::test_support::{
		association_info, instance, notifier, partition, receive_request,
	};
	use crate::ingest::{
		Collaborators, DuplicatePolicy, FilesystemAllocator, InMemoryDeviceRegistry,
		InMemoryWorkQueue, Partition, PartitionDirectory,
	};
	use crate::backend::dimse::DATA_SET_EXISTS;
	use dicom::object::mem::InMemElement;

	struct OnePartition(Partition);

	impl PartitionDirectory for OnePartition {
		fn find_by_aet(&self, aet: &str) -> Option<Partition> {
			(self.0.aet == aet).then(|| self.0.clone())
		}

		fn enabled(&self) -> Vec<Partition> {
			vec![self.0.clone()]
		}
	}

	fn registry(root: &std::path::Path, queue: Arc<InMemoryWorkQueue>) -> ServiceRegistry {
		let allocator = FilesystemAllocator::new(
			&[FilesystemConfig {
				path: root.to_path_buf(),
				tier: FilesystemTier::Online,
				writable: true,
			}],
			&StorageConfig {
				restore_nearline: false,
			},
		);
		ServiceRegistry::storage(ReceiveHandler::new(
			Collaborators {
				partitions: Arc::new(OnePartition(partition(DuplicatePolicy::RejectDuplicates))),
				devices: Arc::new(InMemoryDeviceRegistry::default()),
				allocator: Arc::new(allocator),
				work_queue: queue.clone(),
				studies: queue,
				notifier: notifier(),
			},
			"token",
		))
	}

	fn status_of(message: &DicomMessage) -> US {
		message
			.command
			.get(tags::STATUS)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.unwrap()
	}

	fn store_message(sop: &str) -> ServiceRequest {
		let request = receive_request(&instance("1.2", "1.2.3", sop));
		ServiceRequest {
			message: DicomMessage {
				command: InMemDicomObject::command_from_element_iter([
					DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command::C_STORE_RQ])),
					DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
					DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.sop_class_uid)),
					DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.sop_instance_uid)),
					DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [1])),
				]),
				data: Some(request.data),
				presentation_context_id: Some(1),
			},
			transfer_syntax: request.transfer_syntax,
		}
	}

	#[tokio::test]
	async fn store_service_counts_accepted_instances() {
		let dir = tempfile::tempdir().unwrap();
		let queue = Arc::new(InMemoryWorkQueue::default());
		let registry = registry(dir.path(), Arc::clone(&queue));
		let service = registry.find(command::C_STORE_RQ).unwrap();
		let mut context = AssociationContext::new(association_info());

		let first = service
			.handle(&mut context, store_message("1.2.3.4"))
			.await
			.unwrap();
		let second = service
			.handle(&mut context, store_message("1.2.3.4"))
			.await
			.unwrap();

		assert_eq!(status_of(&first), status::SUCCESS);
		assert_eq!(status_of(&second), status::DUPLICATE_SOP_INSTANCE);
		assert!(second.command.get(tags::ERROR_COMMENT).is_some());
		assert_eq!(context.stored(), 1);
		assert_eq!(queue.pending().len(), 1);
	}

	#[tokio::test]
	async fn verification_service_answers_success() {
		let dir = tempfile::tempdir().unwrap();
		let registry = registry(dir.path(), Arc::new(InMemoryWorkQueue::default()));
		let mut context = AssociationContext::new(association_info());
		let request = ServiceRequest {
			message: DicomMessage {
				command: InMemDicomObject::command_from_element_iter([
					DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command::C_ECHO_RQ])),
					DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [9])),
				]),
				data: None,
				presentation_context_id: Some(1),
			},
			transfer_syntax: UI::from("1.2.840.10008.1.2"),
		};

		let response = registry
			.find(command::C_ECHO_RQ)
			.unwrap()
			.handle(&mut context, request)
			.await
			.unwrap();

		assert_eq!(status_of(&response), status::SUCCESS);
		assert_eq!(context.stored(), 0);
		assert_eq!(registry.names(), vec!["Storage", "Verification"]);
	}

	#[test]
	fn query_retrieve_is_not_supported() {
		let find = DicomMessage {
			command: InMemDicomObject::command_from_element_iter([
				DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command::C_FIND_RQ])),
				DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [5])),
				DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, "1.2.840.10008.5.1.4.1.2.2.1")),
			]),
			data: None,
			presentation_context_id: Some(1),
		};

		let response = refuse(&find, command::C_FIND_RQ).unwrap();

		assert_eq!(status_of(&response), status::SOP_CLASS_NOT_SUPPORTED);
		assert_eq!(
			response
				.command
				.get(tags::COMMAND_FIELD)
				.unwrap()
				.to_int::<US>()
				.unwrap(),
			0x8020
		);
		assert_eq!(
			status_of(&refuse(&find, 0x0120).unwrap()),
			status::UNRECOGNIZED_OPERATION
		);
		assert!(refuse(&find, command::C_CANCEL_RQ).is_none());
	}
}
