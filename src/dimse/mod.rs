//! This module contains the DIMSE side of the bridge.
//! - C-ECHO is answered by the verification service class provider.
//! - C-FIND is answered by the modality worklist service class provider.
//! - C-CANCEL terminates a running C-FIND.
//!

pub mod association;
pub mod cecho;
pub mod cfind;
pub mod scp;

pub use scp::WorklistServiceClassProvider;

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

/// Represents a DICOM message composed of a command set followed by an optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	/// The command set.
	pub command: InMemDicomObject,
	/// The data set.
	pub data: Option<InMemDicomObject>,
	/// The presentation context id
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command, data }}")
		} else {
			write!(f, "DicomMessage {{ command }}")
		}
	}
}

impl DicomMessage {
	/// Returns the Command Field (0000,0100) of the command set.
	pub fn command_field(&self) -> Result<US, ReadError> {
		self.command_int(tags::COMMAND_FIELD)
	}

	fn command_int(&self, tag: Tag) -> Result<US, ReadError> {
		self.command
			.get(tag)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.ok_or(ReadError::MissingAttribute(tag))
	}

	fn command_str(&self, tag: Tag) -> Result<UI, ReadError> {
		self.command
			.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
			.ok_or(ReadError::MissingAttribute(tag))
	}
}

/// Status codes sent by the worklist SCP.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part04/sect_K.4.html#table_K.4-1>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
	/// Matching is complete.
	Success,
	/// Matches are continuing, the current match is supplied.
	Pending,
	/// Matching terminated due to a cancel request.
	Cancelled,
	/// Failed: unable to process.
	UnableToProcess,
}

impl From<ResponseStatus> for US {
	fn from(status: ResponseStatus) -> Self {
		match status {
			ResponseStatus::Success => 0x0000,
			ResponseStatus::Pending => 0xFF00,
			ResponseStatus::Cancelled => 0xFE00,
			ResponseStatus::UnableToProcess => 0xC000,
		}
	}
}

impl TryFrom<US> for ResponseStatus {
	type Error = US;

	fn try_from(value: US) -> Result<Self, Self::Error> {
		match value {
			0x0000 => Ok(Self::Success),
			0xFF00 => Ok(Self::Pending),
			0xFE00 => Ok(Self::Cancelled),
			0xC000 => Ok(Self::UnableToProcess),
			_ => Err(value),
		}
	}
}

pub trait DicomMessageReader {
	/// Waits for the next DICOM message.
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError>;

	/// Reads the next DICOM message if the peer already started sending it.
	async fn poll_message(&self, timeout: Duration) -> Result<Option<DicomMessage>, ReadError>;
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

		let presentation_context = match presentation_context_id.or(message.presentation_context_id)
		{
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
			let transfer_syntax = TransferSyntaxRegistry
				.get(&presentation_context.transfer_syntax)
				.ok_or_else(|| {
					NegotiationError::UnknownTransferSyntax(UI::from(
						&presentation_context.transfer_syntax,
					))
				})?;
			let mut data_buf = Vec::new();
			data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;

			let data_pdu = Pdu::PData {
				data: vec![PDataValue {
					value_type: PDataValueType::Data,
					presentation_context_id: presentation_context.id,
					is_last: true,
					data: data_buf,
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
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute {0} is missing")]
	MissingAttribute(Tag),
	#[error("Peer requested to release the association")]
	Released,
	#[error("Peer aborted the association")]
	Aborted,
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

impl<A: Association> DicomMessageReader for A {
	#[instrument(skip_all)]
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let pdu = self.receive(timeout).await?;
		read_message_from(self, pdu, timeout).await
	}

	#[instrument(skip_all)]
	async fn poll_message(&self, timeout: Duration) -> Result<Option<DicomMessage>, ReadError> {
		match self.poll(timeout).await? {
			Some(pdu) => read_message_from(self, pdu, timeout).await.map(Some),
			None => Ok(None),
		}
	}
}

/// Assembles a DICOM message that starts with `first` and continues with the
/// PDUs received from the association.
async fn read_message_from<A: Association>(
	association: &A,
	first: Pdu,
	timeout: Duration,
) -> Result<DicomMessage, ReadError> {
	let mut command_fragments = Vec::new();
	let mut data_fragments = Vec::new();
	let mut message_command: Option<InMemDicomObject> = None;
	let mut next = Some(first);

	loop {
		let pdu = match next.take() {
			Some(pdu) => pdu,
			None => association.receive(timeout).await?,
		};
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
					data_fragments.append(&mut pdv.data);
					if pdv.is_last {
						let presentation_context = association
							.presentation_contexts()
							.iter()
							.find(|pctx| pctx.id == pdv.presentation_context_id)
							.ok_or(NegotiationError::NoPresentationContext)?;
						let transfer_syntax = TransferSyntaxRegistry
							.get(&presentation_context.transfer_syntax)
							.ok_or_else(|| {
								NegotiationError::UnknownTransferSyntax(UI::from(
									&presentation_context.transfer_syntax,
								))
							})?;
						let data = InMemDicomObject::read_dataset_with_ts(
							data_fragments.as_slice(),
							transfer_syntax,
						)?;

						// Cannot handle data fragments before the entire command set is received.
						let command = message_command.ok_or(ReadError::OutOfOrder)?;
						return Ok(DicomMessage {
							command,
							data: Some(data),
							presentation_context_id: Some(pdv.presentation_context_id),
						});
					}
				}
			}
		}
	}
}
