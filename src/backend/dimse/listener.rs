use crate::backend::dimse::cstore::storescp::StoreServiceClassProvider;
use crate::backend::dimse::response::ResponseDispatcher;
use crate::backend::dimse::service::ServiceRegistry;
use crate::ingest::Partition;
use crate::types::AE;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// How the endpoints of the partitions answer their peers.
#[derive(Clone)]
pub struct EndpointOptions {
	pub services: ServiceRegistry,
	pub dispatcher: ResponseDispatcher,
	pub message_timeout: Duration,
}

struct Listener {
	address: SocketAddr,
	handle: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerStatus {
	pub aet: AE,
	pub address: SocketAddr,
	pub running: bool,
}

/// The network endpoints of the enabled partitions, keyed by AE title.
#[derive(Default)]
pub struct ListenerRegistry {
	listeners: Mutex<BTreeMap<AE, Listener>>,
}

impl ListenerRegistry {
	/// Binds an endpoint for every partition. Binding happens concurrently; a partition that
	/// fails to bind is logged and skipped. Returns the number of endpoints started.
	pub async fn start(&self, partitions: Vec<Partition>, options: &EndpointOptions) -> usize {
		let bound = join_all(partitions.into_iter().map(|partition| async move {
			let configured = partition.address();
			let provider = StoreServiceClassProvider::new(
				partition,
				options.services.clone(),
				options.dispatcher.clone(),
				options.message_timeout,
			);
			let listener = provider.bind().await;
			(provider, configured, listener)
		}))
		.await;

		let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
		let mut started = 0;
		for (provider, configured, listener) in bound {
			let aet = provider.aet().clone();
			let listener = match listener {
				Ok(listener) => listener,
				Err(err) => {
					error!(aet, "Failed to bind partition endpoint on {configured}: {err}");
					continue;
				}
			};
			if listeners.contains_key(&aet) {
				error!(aet, "Partition endpoint is already running");
				continue;
			}

			let address = listener.local_addr().unwrap_or(configured);
			let handle = tokio::spawn(provider.serve(listener));
			listeners.insert(aet, Listener { address, handle });
			started += 1;
		}
		info!("Started {started} partition endpoint(s)");
		started
	}

	pub fn status(&self) -> Vec<ListenerStatus> {
		let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
		listeners
			.iter()
			.map(|(aet, listener)| ListenerStatus {
				aet: aet.clone(),
				address: listener.address,
				running: !listener.handle.is_finished(),
			})
			.collect()
	}

	/// Stops every started endpoint. Associations in progress are not interrupted.
	pub fn shutdown(&self) {
		let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
		for (aet, listener) in std::mem::take(&mut *listeners) {
			listener.handle.abort();
			info!(aet, "Stopped partition endpoint on {}", listener.address);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::dimse::status;
	use crate::config::{FilesystemConfig, FilesystemTier, StorageConfig};
	use crate::ingest::test_support::{notifier, partition};
	use crate::ingest::{
		Collaborators, ConfiguredPartitions, DuplicatePolicy, FilesystemAllocator,
		InMemoryDeviceRegistry, InMemoryWorkQueue, ReceiveHandler,
	};
	use dicom::dictionary_std::{tags, uids};
	use dicom::object::mem::InMemElement;
	use dicom::object::InMemDicomObject;
	use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
	use dicom::ul::pdu::{PDataValue, PDataValueType, Pdu};
	use std::sync::Arc;

	fn options(root: &std::path::Path, partitions: ConfiguredPartitions) -> EndpointOptions {
		let queue = Arc::new(InMemoryWorkQueue::default());
		let handler = ReceiveHandler::new(
			Collaborators {
				partitions: Arc::new(partitions),
				devices: Arc::new(InMemoryDeviceRegistry::default()),
				allocator: Arc::new(FilesystemAllocator::new(
					&[FilesystemConfig {
						path: root.to_path_buf(),
						tier: FilesystemTier::Online,
						writable: true,
					}],
					&StorageConfig {
						restore_nearline: false,
					},
				)),
				work_queue: queue.clone(),
				studies: queue,
				notifier: notifier(),
			},
			"token",
		);
		EndpointOptions {
			services: ServiceRegistry::storage(handler),
			dispatcher: ResponseDispatcher::new(Duration::ZERO, 1),
			message_timeout: Duration::from_secs(5),
		}
	}

	fn ephemeral(aet: &str, port: u16) -> Partition {
		let mut partition = partition(DuplicatePolicy::SendSuccess);
		partition.aet = AE::from(aet);
		partition.port = port;
		partition
	}

	#[tokio::test]
	async fn bind_failure_does_not_stop_other_partitions() {
		let dir = tempfile::tempdir().unwrap();
		let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let occupied_port = occupied.local_addr().unwrap().port();
		let registry = ListenerRegistry::default();

		let started = registry
			.start(
				vec![ephemeral("BUSY", occupied_port), ephemeral("FREE", 0)],
				&options(dir.path(), ConfiguredPartitions::default()),
			)
			.await;

		assert_eq!(started, 1);
		let listeners = registry.status();
		assert_eq!(listeners.len(), 1);
		assert_eq!(listeners[0].aet, "FREE");
		assert!(listeners[0].running);
		assert_ne!(listeners[0].address.port(), 0);

		registry.shutdown();
		assert!(registry.status().is_empty());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn answers_echo_over_the_network() {
		let dir = tempfile::tempdir().unwrap();
		let partition = ephemeral("ARCHIVE", 0);
		let registry = ListenerRegistry::default();
		registry
			.start(
				vec![partition],
				&options(dir.path(), ConfiguredPartitions::default()),
			)
			.await;
		let address = registry.status()[0].address;

		let echo_status = tokio::task::spawn_blocking(move || {
			let mut association = dicom::ul::ClientAssociationOptions::new()
				.with_abstract_syntax(uids::VERIFICATION)
				.calling_ae_title("ECHOSCU")
				.called_ae_title("ARCHIVE")
				.establish(address)
				.unwrap();
			let presentation_context_id = association.presentation_contexts()[0].id;

			let command = InMemDicomObject::command_from_element_iter([
				dicom::core::DataElement::new(
					tags::AFFECTED_SOP_CLASS_UID,
					dicom::core::VR::UI,
					dicom::core::PrimitiveValue::from(uids::VERIFICATION),
				),
				dicom::core::DataElement::new(
					tags::COMMAND_FIELD,
					dicom::core::VR::US,
					dicom::core::PrimitiveValue::from(0x0030_u16),
				),
				dicom::core::DataElement::new(
					tags::MESSAGE_ID,
					dicom::core::VR::US,
					dicom::core::PrimitiveValue::from(1_u16),
				),
				dicom::core::DataElement::new(
					tags::COMMAND_DATA_SET_TYPE,
					dicom::core::VR::US,
					dicom::core::PrimitiveValue::from(0x0101_u16),
				),
			]);
			let mut data = Vec::new();
			command
				.write_dataset_with_ts(&mut data, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
				.unwrap();
			association
				.send(&Pdu::PData {
					data: vec![PDataValue {
						value_type: PDataValueType::Command,
						presentation_context_id,
						is_last: true,
						data,
					}],
				})
				.unwrap();

			let Pdu::PData { data } = association.receive().unwrap() else {
				panic!("expected P-DATA");
			};
			let response = InMemDicomObject::read_dataset_with_ts(
				data[0].data.as_slice(),
				&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
			)
			.unwrap();
			association.release().unwrap();
			response
				.get(tags::STATUS)
				.map(InMemElement::to_int::<u16>)
				.and_then(Result::ok)
		})
		.await
		.unwrap();

		assert_eq!(echo_status, Some(status::SUCCESS));
		registry.shutdown();
	}
}
