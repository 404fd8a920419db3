use super::{oneshot, AskPattern, Association, AssociationError, ChannelError, Command, Sender};
use crate::types::AE;
use dicom::dictionary_std::uids;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::Pdu;
use dicom::ul::pdu::PresentationContextNegotiated;
use std::convert::identity;
use std::io::ErrorKind;
use std::{net::TcpStream, thread, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Abstract syntaxes accepted by the worklist SCP.
pub const ABSTRACT_SYNTAXES: &[&str] = &[
	uids::VERIFICATION,
	uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
];

/// How long a poll waits for the peer to start sending a PDU.
const POLL_TIMEOUT: Duration = Duration::from_millis(5);

#[derive(Debug)]
pub struct ServerAssociation {
	channel: Sender<Command>,
	presentation_contexts: Vec<PresentationContextNegotiated>,
	tcp_stream: TcpStream,
	calling_aet: AE,
}

pub struct ServerAssociationOptions {
	pub aet: String,
	pub tcp_stream: TcpStream,
	pub uncompressed: bool,
}

impl ServerAssociation {
	pub async fn new(options: ServerAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let mut server_options = dicom::ul::ServerAssociationOptions::new()
			.accept_any()
			.ae_title(options.aet.clone());

		for abstract_syntax in ABSTRACT_SYNTAXES {
			server_options = server_options.with_abstract_syntax(*abstract_syntax);
		}

		for syntax in TransferSyntaxRegistry.iter() {
			if (options.uncompressed && syntax.is_codec_free())
				|| (!options.uncompressed && !syntax.is_unsupported())
			{
				server_options = server_options.with_transfer_syntax(syntax.uid());
			}
		}

		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let _handle = thread::Builder::new()
			.name(format!("{}-server", options.aet))
			.spawn(move || {
				let span =
					tracing::info_span!("ServerAssociation", association_id = uuid.to_string());
				let _enter = span.enter();

				let mut association = match server_options.establish(options.tcp_stream) {
					Ok(mut association) => {
						let calling_aet = association.client_ae_title().to_owned();
						info!(
							calling_aet = calling_aet.as_str(),
							called_aet = options.aet,
							"Established new server association"
						);

						let pcs = association.presentation_contexts().to_vec();

						let stream = match association.inner_stream().try_clone() {
							Ok(stream) => stream,
							Err(e) => {
								connect_tx
									.send(Err(AssociationError::Stream(e)))
									.map_err(|_value| ())?;
								return Err(());
							}
						};

						connect_tx
							.send(Ok((stream, pcs, calling_aet)))
							.map_err(|_value| ())?;
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
						Command::Poll(response) => {
							// Receive through the association, which may already hold buffered PDUs
							let poll_result = match association
								.inner_stream()
								.set_read_timeout(Some(POLL_TIMEOUT))
							{
								Ok(()) => {
									let received = match association.receive() {
										Ok(pdu) => Ok(Some(pdu)),
										Err(e) if is_timeout(&e) => Ok(None),
										Err(e) => Err(AssociationError::Association(e)),
									};
									association
										.inner_stream()
										.set_read_timeout(None)
										.map_err(AssociationError::Stream)
										.and(received)
								}
								Err(e) => Err(AssociationError::Stream(e)),
							};
							response
								.send(poll_result)
								.map_err(|_value| ChannelError::Closed)
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
							if matches!(
								source.kind(),
								ErrorKind::BrokenPipe | ErrorKind::NotConnected
							) =>
						{
							// no-op, the TCP stream is already closed
						}
						_ => {
							debug!("ServerAssociation.abort() returned error: {e}");
						}
					}
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts, calling_aet) = connect_result
			.await
			.map_err(|_| AssociationError::Channel(ChannelError::Closed))??;

		Ok(Self {
			channel: tx,
			presentation_contexts,
			tcp_stream,
			calling_aet,
		})
	}

	/// The application entity title of the modality.
	pub fn calling_aet(&self) -> &str {
		&self.calling_aet
	}
}

/// Checks if a receive failed only because the read timeout of the stream elapsed.
fn is_timeout(error: &dicom::ul::association::Error) -> bool {
	let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
	while let Some(error) = source {
		if let Some(io) = error.downcast_ref::<std::io::Error>() {
			return matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut);
		}
		source = error.source();
	}
	false
}

impl Association for ServerAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn poll(&self, timeout: Duration) -> Result<Option<Pdu>, AssociationError> {
		self.channel
			.ask(Command::Poll, timeout)
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

	fn close(&mut self) {
		debug!("Closing TcpStream from outside");

		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
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
