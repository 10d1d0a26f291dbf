use crate::backend::dimse::association::{self, Association};
use crate::backend::dimse::response::ResponseDispatcher;
use crate::backend::dimse::service::{refuse, AssociationContext, ServiceRegistry, ServiceRequest};
use crate::backend::dimse::{
	negotiated_transfer_syntax, DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError,
	StatusType,
};
use crate::ingest::{AssociationInfo, Partition};
use crate::types::{AE, US};
use anyhow::Context;
use association::server::{ServerAssociation, ServerAssociationOptions};
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// The store service class provider of one partition.
pub struct StoreServiceClassProvider {
	inner: Arc<InnerStoreServiceClassProvider>,
}

struct InnerStoreServiceClassProvider {
	partition: Partition,
	services: ServiceRegistry,
	dispatcher: ResponseDispatcher,
	message_timeout: Duration,
}

impl StoreServiceClassProvider {
	pub fn new(
		partition: Partition,
		services: ServiceRegistry,
		dispatcher: ResponseDispatcher,
		message_timeout: Duration,
	) -> Self {
		Self {
			inner: Arc::new(InnerStoreServiceClassProvider {
				partition,
				services,
				dispatcher,
				message_timeout,
			}),
		}
	}

	pub fn aet(&self) -> &AE {
		&self.inner.partition.aet
	}

	pub async fn bind(&self) -> std::io::Result<TcpListener> {
		TcpListener::bind(self.inner.partition.address()).await
	}

	/// Accepts associations until the task is aborted.
	pub async fn serve(self, listener: TcpListener) {
		if let Ok(address) = listener.local_addr() {
			info!(
				aet = self.inner.partition.aet,
				"Started Store Service Class Provider on {address}"
			);
		}
		loop {
			match listener.accept().await {
				Ok((stream, peer)) => {
					let span = info_span!(
						"STORE-SCP",
						aet = &self.inner.partition.aet,
						peer = peer.to_string()
					);
					info!("Accepted incoming connection from {peer}");
					let inner = Arc::clone(&self.inner);
					tokio::spawn(async move {
						if let Err(err) = Self::process(stream, inner).instrument(span).await {
							error!("{err:#}");
						}
					});
				}
				Err(err) => error!("Failed to accept incoming connection: {err}"),
			};
		}
	}

	#[instrument(skip_all)]
	async fn process(
		stream: TcpStream,
		inner: Arc<InnerStoreServiceClassProvider>,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// This is required because the `dicom-rs` crate does not use non-blocking reads/writes.
		// The actual reading/writing happens in ServerAssociation, which moves IO operation
		// to another thread.
		tcp_stream.set_nonblocking(false)?;

		let options = ServerAssociationOptions {
			aet: inner.partition.aet.clone(),
			tcp_stream,
			uncompressed: inner.partition.uncompressed,
		};
		let association = Arc::new(ServerAssociation::new(options).await?);
		let mut context = AssociationContext::new(AssociationInfo {
			called_aet: inner.partition.aet.clone(),
			calling_aet: AE::from(association.calling_aet()),
			peer: association.peer(),
		});
		let mut pending = JoinSet::new();

		loop {
			// Duration::MAX to indefinitely wait for incoming messages
			let message = match association.read_message(Duration::MAX).await {
				Ok(message) => message,
				Err(ReadError::Released) => {
					debug!("Flushing {} pending response(s) before release", pending.len());
					while pending.join_next().await.is_some() {}
					association
						.release(inner.message_timeout)
						.await
						.context("Failed to confirm association release")?;
					break;
				}
				Err(ReadError::Aborted) => {
					warn!("Association was aborted by the peer");
					break;
				}
				Err(err) => return Err(err.into()),
			};

			let presentation_context_id = message.presentation_context_id;
			let command_field = message
				.command_field()
				.context("Missing tag COMMAND_FIELD (0000,0100)")?;

			let response = match inner.services.find(command_field) {
				Some(service) => {
					let transfer_syntax =
						negotiated_transfer_syntax(&*association, presentation_context_id)?;
					debug!(
						service = service.name(),
						"Used transfer syntax {transfer_syntax} to read message"
					);
					service
						.handle(
							&mut context,
							ServiceRequest {
								message,
								transfer_syntax,
							},
						)
						.await?
				}
				None => {
					warn!("Refusing unsupported command field {command_field:#06x}");
					match refuse(&message, command_field) {
						Some(response) => response,
						None => continue,
					}
				}
			};

			Self::respond(
				&inner,
				&association,
				&mut pending,
				response,
				presentation_context_id,
			)
			.await?;

			while pending.try_join_next().is_some() {}
		}

		info!(stored = context.stored(), "Association closed");
		Ok(())
	}

	async fn respond(
		inner: &InnerStoreServiceClassProvider,
		association: &Arc<ServerAssociation>,
		pending: &mut JoinSet<()>,
		response: DicomMessage,
		presentation_context_id: Option<u8>,
	) -> anyhow::Result<()> {
		let status = response
			.command
			.get(tags::STATUS)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.unwrap_or_default();
		if !matches!(StatusType::try_from(status), Ok(StatusType::Success)) {
			debug!("Responding with status {status:#06x}");
		}

		let timeout = inner.message_timeout;
		if inner.dispatcher.is_immediate() {
			association
				.write_message(response, presentation_context_id, timeout)
				.await?;
		} else {
			let association = Arc::clone(association);
			inner.dispatcher.dispatch(
				pending,
				async move {
					if let Err(err) = association
						.write_message(response, presentation_context_id, timeout)
						.await
					{
						warn!("Failed to send delayed response: {err}");
					}
				}
				.in_current_span(),
			);
		}
		Ok(())
	}
}
