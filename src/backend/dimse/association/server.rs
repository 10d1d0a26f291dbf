use super::{oneshot, AskPattern, Association, AssociationError, ChannelError, Command, Sender};
use crate::types::AE;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::Pdu;
use dicom::ul::pdu::PresentationContextNegotiated;
use std::convert::identity;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::{net::TcpStream, thread, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// An association accepted from a remote SCU.
#[derive(Debug)]
pub struct ServerAssociation {
	channel: Sender<Command>,
	presentation_contexts: Vec<PresentationContextNegotiated>,
	calling_aet: AE,
	peer: SocketAddr,
	tcp_stream: TcpStream,
}

pub struct ServerAssociationOptions {
	/// The AE title of the partition. Associations calling another AE title are rejected.
	pub aet: AE,
	pub tcp_stream: TcpStream,
	/// Only negotiate transfer syntaxes that need no codec.
	pub uncompressed: bool,
}

struct Established {
	tcp_stream: TcpStream,
	presentation_contexts: Vec<PresentationContextNegotiated>,
	calling_aet: AE,
}

impl ServerAssociation {
	pub async fn new(options: ServerAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let peer = options
			.tcp_stream
			.peer_addr()
			.map_err(AssociationError::Stream)?;
		let mut server_options = dicom::ul::ServerAssociationOptions::new()
			.accept_called_ae_title()
			.ae_title(options.aet.clone())
			.promiscuous(true);

		for syntax in TransferSyntaxRegistry.iter() {
			if (options.uncompressed && syntax.is_codec_free())
				|| (!options.uncompressed && !syntax.is_unsupported())
			{
				server_options = server_options.with_transfer_syntax(syntax.uid());
			}
		}

		let (connect_tx, connect_result) =
			oneshot::channel::<Result<Established, AssociationError>>();

		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let _handle = thread::Builder::new()
			.name(format!("{}-server", options.aet))
			.spawn(move || {
				let span =
					tracing::info_span!("ServerAssociation", association_id = uuid.to_string());
				let _enter = span.enter();

				let mut association = match server_options.establish(options.tcp_stream) {
					Ok(mut association) => {
						let calling_aet = AE::from(association.client_ae_title().trim());
						info!(
							calling_aet,
							called_aet = options.aet,
							"Established new server association"
						);

						let established = association
							.inner_stream()
							.try_clone()
							.map_err(AssociationError::Stream)
							.map(|tcp_stream| Established {
								tcp_stream,
								presentation_contexts: association.presentation_contexts().to_vec(),
								calling_aet,
							});
						let failed = established.is_err();
						connect_tx.send(established).map_err(|_value| ())?;
						if failed {
							return Err(());
						}
						association
					}
					Err(e) => {
						connect_tx.send(Err(e.into())).map_err(|_value| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, response) => {
							let send_result = association
								.send(&pdu)
								.map_err(AssociationError::Association);
							response
								.send(send_result)
								.map_err(|_value| ChannelError::Closed)
						}
						Command::Receive(response) => {
							let receive_result =
								association.receive().map_err(AssociationError::Association);
							response
								.send(receive_result)
								.map_err(|_value| ChannelError::Closed)
						}
						Command::Release(response) => {
							let release_result = association
								.send(&Pdu::ReleaseRP)
								.map_err(AssociationError::Association);
							if response.send(release_result).is_err() {
								debug!("Release confirmation was not awaited");
							}
							info!("Released server association");
							return Ok(());
						}
					};

					if let Some(err) = result.err() {
						error!("Error in ServerAssociation: {err}");
						return Err(());
					}
				}

				rx.close();

				if let Err(e) = association.abort() {
					match e {
						dicom::ul::association::Error::WireSend { source, .. }
							if source.kind() == ErrorKind::BrokenPipe =>
						{
							// no-op, happens on MacOS if the TCP stream is already closed
						}
						_ => {
							warn!("ServerAssociation.abort() returned error: {e}");
						}
					}
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let established = connect_result
			.await
			.map_err(|_| AssociationError::Channel(ChannelError::Closed))??;

		Ok(Self {
			channel: tx,
			presentation_contexts: established.presentation_contexts,
			calling_aet: established.calling_aet,
			peer,
			tcp_stream: established.tcp_stream,
		})
	}

	/// The AE title the peer identified itself with.
	pub fn calling_aet(&self) -> &str {
		&self.calling_aet
	}

	pub const fn peer(&self) -> SocketAddr {
		self.peer
	}
}

impl Association for ServerAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn release(&self, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(Command::Release, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		debug!("Closing TcpStream from outside");

		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			// The stream is already gone after a release
			if err.kind() != ErrorKind::NotConnected {
				warn!("TcpStream::shutdown failed: {err}");
			}
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}
}

impl Drop for ServerAssociation {
	fn drop(&mut self) {
		self.close();
	}
}
