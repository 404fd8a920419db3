use super::association::server::{ServerAssociation, ServerAssociationOptions};
use super::association::Association;
use super::cecho::{verify, CompositeEchoRequest, COMMAND_FIELD_COMPOSITE_ECHO_REQUEST};
use super::cfind::{
	CompositeCancelRequest, CompositeFindRequest, CompositeFindResponse,
	COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST, COMMAND_FIELD_COMPOSITE_FIND_REQUEST,
};
use super::{DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, ResponseStatus};
use crate::config::ServerConfig;
use crate::mwl::{CancelFlag, MwlFindService};
use crate::shutdown::AssociationListener;
use crate::types::UI;
use anyhow::Context;
use dicom::dictionary_std::{tags, uids};
use dicom::ul::Pdu;
use futures::StreamExt;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Counts the associations that are currently open.
#[derive(Debug, Clone, Default)]
pub struct ActiveAssociations(Arc<AtomicUsize>);

impl ActiveAssociations {
	pub fn count(&self) -> usize {
		self.0.load(Ordering::SeqCst)
	}

	/// Counts a new association until the returned guard is dropped.
	pub fn track(&self) -> ActiveAssociationGuard {
		self.0.fetch_add(1, Ordering::SeqCst);
		ActiveAssociationGuard(Arc::clone(&self.0))
	}
}

#[derive(Debug)]
pub struct ActiveAssociationGuard(Arc<AtomicUsize>);

impl Drop for ActiveAssociationGuard {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::SeqCst);
	}
}

/// Service class provider for the Verification and Modality Worklist FIND SOP classes.
pub struct WorklistServiceClassProvider {
	inner: Arc<InnerWorklistServiceClassProvider>,
	active: ActiveAssociations,
	stop: watch::Sender<bool>,
}

struct InnerWorklistServiceClassProvider {
	service: MwlFindService,
	config: ServerConfig,
}

impl WorklistServiceClassProvider {
	pub fn new(config: ServerConfig, service: MwlFindService) -> Self {
		let (stop, _) = watch::channel(false);
		Self {
			inner: Arc::new(InnerWorklistServiceClassProvider { service, config }),
			active: ActiveAssociations::default(),
			stop,
		}
	}

	/// Binds to the configured address and accepts associations until
	/// [`AssociationListener::stop_accepting`] is called.
	pub async fn spawn(&self) -> anyhow::Result<()> {
		let address = SocketAddr::from((self.inner.config.interface, self.inner.config.port));
		let listener = TcpListener::bind(&address)
			.await
			.with_context(|| format!("Failed to bind to {address}"))?;
		info!(
			aet = self.inner.config.aet,
			"Started Worklist Service Class Provider on {address}"
		);
		self.serve(listener).await;
		Ok(())
	}

	async fn serve(&self, listener: TcpListener) {
		let mut stop = self.stop.subscribe();
		if *stop.borrow_and_update() {
			return;
		}

		loop {
			tokio::select! {
				_ = stop.changed() => {
					info!("Stopped accepting new associations");
					return;
				}
				accepted = listener.accept() => match accepted {
					Ok((stream, peer)) => {
						let span = info_span!(
							"MWL-SCP",
							aet = &self.inner.config.aet,
							peer = peer.to_string()
						);
						info!("Accepted incoming connection from {peer}");
						let inner = Arc::clone(&self.inner);
						let guard = self.active.track();
						tokio::spawn(async move {
							if let Err(err) = Self::process(stream, inner).instrument(span).await {
								error!("{err:#}");
							}
							drop(guard);
						});
					}
					Err(err) => error!("Failed to accept incoming connection: {err}"),
				}
			}
		}
	}

	#[instrument(skip_all)]
	async fn process(
		stream: TcpStream,
		inner: Arc<InnerWorklistServiceClassProvider>,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// dicom-ul does blocking IO on the association thread
		tcp_stream.set_nonblocking(false)?;

		let options = ServerAssociationOptions {
			aet: inner.config.aet.clone(),
			tcp_stream,
			uncompressed: inner.config.uncompressed,
		};
		let association = ServerAssociation::new(options).await?;
		let timeout = inner.config.timeout();

		loop {
			// Duration::MAX to indefinitely wait for incoming messages
			let message = match association.read_message(Duration::MAX).await {
				Ok(message) => message,
				Err(ReadError::Released) => {
					association.send(Pdu::ReleaseRP, timeout).await?;
					info!(
						calling_aet = association.calling_aet(),
						"Released association"
					);
					return Ok(());
				}
				Err(ReadError::Aborted) => {
					warn!(
						calling_aet = association.calling_aet(),
						"Association aborted by peer"
					);
					return Ok(());
				}
				Err(err) => return Err(err).context("Failed to read DICOM message"),
			};

			match message.command_field()? {
				COMMAND_FIELD_COMPOSITE_ECHO_REQUEST => {
					let request = CompositeEchoRequest::try_from(&message)?;
					association
						.write_message(verify(request), message.presentation_context_id, timeout)
						.await?;
				}
				COMMAND_FIELD_COMPOSITE_FIND_REQUEST => {
					Self::find(&association, message, &inner.service, timeout).await?;
				}
				COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST => {
					debug!("Ignoring C-CANCEL-RQ without a running query");
				}
				command_field => {
					anyhow::bail!(
						"Unexpected command field {command_field:#06x}. Only C-ECHO-RQ and C-FIND-RQ are supported."
					);
				}
			}
		}
	}

	/// Streams the responses of a single C-FIND-RQ and checks for a C-CANCEL-RQ
	/// after every pending response.
	async fn find(
		association: &ServerAssociation,
		message: DicomMessage,
		service: &MwlFindService,
		timeout: Duration,
	) -> anyhow::Result<()> {
		let presentation_context_id = message.presentation_context_id;
		// Without a Message ID there is nothing to respond to
		let message_id = message.command_int(tags::MESSAGE_ID)?;
		let request = match CompositeFindRequest::try_from(message) {
			Ok(request) => request,
			Err(err) => {
				warn!(message_id, "Unable to process C-FIND-RQ: {err}");
				let response = CompositeFindResponse {
					message_id,
					affected_sop_class_uid: UI::from(uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND),
					status: ResponseStatus::UnableToProcess,
					identifier: None,
				};
				association
					.write_message(response, presentation_context_id, timeout)
					.await?;
				return Ok(());
			}
		};
		info!(
			message_id = request.message_id,
			priority = request.priority,
			"Received C-FIND-RQ"
		);

		let cancel = CancelFlag::default();
		let mut responses = pin!(service.search(request.identifier.clone(), cancel.clone()));

		while let Some(response) = responses.next().await {
			let status = response.status;
			association
				.write_message(
					CompositeFindResponse::new(&request, response),
					presentation_context_id,
					timeout,
				)
				.await?;

			if status != ResponseStatus::Pending {
				// Cancelled and failed queries end with their own status.
				return Ok(());
			}

			if let Some(message) = association.poll_message(timeout).await? {
				Self::cancel(&message, &request, &cancel)?;
			}
		}

		association
			.write_message(
				CompositeFindResponse::success(&request),
				presentation_context_id,
				timeout,
			)
			.await?;
		Ok(())
	}

	fn cancel(
		message: &DicomMessage,
		request: &CompositeFindRequest,
		cancel: &CancelFlag,
	) -> anyhow::Result<()> {
		let command_field = message.command_field()?;
		if command_field != COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST {
			anyhow::bail!("Unexpected command field {command_field:#06x} while a C-FIND is running");
		}

		let cancel_request = CompositeCancelRequest::try_from(message)?;
		if cancel_request.message_id_being_responded_to == request.message_id {
			info!(message_id = request.message_id, "Received C-CANCEL-RQ");
			cancel.cancel();
		} else {
			warn!(
				message_id = cancel_request.message_id_being_responded_to,
				"Ignoring C-CANCEL-RQ for an unknown query"
			);
		}
		Ok(())
	}
}

impl AssociationListener for WorklistServiceClassProvider {
	fn stop_accepting(&self) {
		self.stop.send_replace(true);
	}

	fn active_association_count(&self) -> usize {
		self.active.count()
	}
}
