use super::{DicomMessage, ReadError, ResponseStatus, DATA_SET_MISSING};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use tracing::info;

// Command field values from PS3.7 Annex E.
pub const COMMAND_FIELD_COMPOSITE_ECHO_REQUEST: US = 0x0030;
pub const COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE: US = 0x8030;

/// C-ECHO-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_9.3.5.html>
#[derive(Debug)]
pub struct CompositeEchoRequest {
	pub message_id: US,
	pub affected_sop_class_uid: UI,
}

impl TryFrom<&DicomMessage> for CompositeEchoRequest {
	type Error = ReadError;

	fn try_from(message: &DicomMessage) -> Result<Self, Self::Error> {
		let message_id = message.command_int(tags::MESSAGE_ID)?;
		let affected_sop_class_uid = message
			.command_str(tags::AFFECTED_SOP_CLASS_UID)
			.unwrap_or_else(|_| UI::from(uids::VERIFICATION));

		Ok(Self {
			message_id,
			affected_sop_class_uid,
		})
	}
}

/// C-ECHO-RSP
#[derive(Debug)]
pub struct CompositeEchoResponse {
	pub message_id: US,
	pub affected_sop_class_uid: UI,
	pub status: ResponseStatus,
}

impl From<CompositeEchoResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeEchoResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [US::from(response.status)])),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

/// Service class provider for the Verification SOP class.
/// A connectivity check cannot fail, every C-ECHO-RQ is answered with success.
pub fn verify(request: CompositeEchoRequest) -> CompositeEchoResponse {
	info!(message_id = request.message_id, "Received C-ECHO-RQ");
	CompositeEchoResponse {
		message_id: request.message_id,
		affected_sop_class_uid: request.affected_sop_class_uid,
		status: ResponseStatus::Success,
	}
}
