use super::{DicomMessage, ReadError, ResponseStatus, DATA_SET_EXISTS, DATA_SET_MISSING};
use crate::mwl::FindResponse;
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

// Command field values from PS3.7 Annex E.
pub const COMMAND_FIELD_COMPOSITE_FIND_REQUEST: US = 0x0020;
pub const COMMAND_FIELD_COMPOSITE_FIND_RESPONSE: US = 0x8020;
pub const COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST: US = 0x0FFF;

/// C-FIND-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-2>
#[derive(Debug)]
pub struct CompositeFindRequest {
	pub message_id: US,
	pub priority: US,
	pub affected_sop_class_uid: UI,
	pub identifier: InMemDicomObject,
}

impl TryFrom<DicomMessage> for CompositeFindRequest {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let message_id = message.command_int(tags::MESSAGE_ID)?;
		let affected_sop_class_uid = message.command_str(tags::AFFECTED_SOP_CLASS_UID)?;
		let priority = message.command_int(tags::PRIORITY).unwrap_or_default();
		let identifier = message
			.data
			.ok_or(ReadError::MissingAttribute(tags::COMMAND_DATA_SET_TYPE))?;

		Ok(Self {
			message_id,
			priority,
			affected_sop_class_uid,
			identifier,
		})
	}
}

/// C-FIND-RSP
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-3>
#[derive(Debug)]
pub struct CompositeFindResponse {
	pub message_id: US,
	pub affected_sop_class_uid: UI,
	pub status: ResponseStatus,
	pub identifier: Option<InMemDicomObject>,
}

impl CompositeFindResponse {
	pub fn new(request: &CompositeFindRequest, response: FindResponse) -> Self {
		Self {
			message_id: request.message_id,
			affected_sop_class_uid: request.affected_sop_class_uid.clone(),
			status: response.status,
			identifier: response.identifier,
		}
	}

	/// The final response after all matches have been sent.
	pub fn success(request: &CompositeFindRequest) -> Self {
		Self {
			message_id: request.message_id,
			affected_sop_class_uid: request.affected_sop_class_uid.clone(),
			status: ResponseStatus::Success,
			identifier: None,
		}
	}
}

impl From<CompositeFindResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeFindResponse) -> Self {
		let data_set_type = if response.identifier.is_some() { DATA_SET_EXISTS } else { DATA_SET_MISSING };
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [US::from(response.status)])),
		]);

		Self {
			command,
			data: response.identifier,
			presentation_context_id: None,
		}
	}
}

/// C-CANCEL-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_9.3.2.3.html>
#[derive(Debug, PartialEq, Eq)]
pub struct CompositeCancelRequest {
	pub message_id_being_responded_to: US,
}

impl TryFrom<&DicomMessage> for CompositeCancelRequest {
	type Error = ReadError;

	fn try_from(message: &DicomMessage) -> Result<Self, Self::Error> {
		let message_id_being_responded_to =
			message.command_int(tags::MESSAGE_ID_BEING_RESPONDED_TO)?;
		Ok(Self {
			message_id_being_responded_to,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::PrimitiveValue;
	use dicom::dictionary_std::uids;
	use dicom::object::mem::InMemElement;

	fn find_request() -> DicomMessage {
		let identifier = InMemDicomObject::from_element_iter([DataElement::new(
			tags::QUERY_RETRIEVE_LEVEL,
			VR::CS,
			PrimitiveValue::from("PATIENT"),
		)]);

		#[rustfmt::skip]
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [42])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		DicomMessage {
			command,
			data: Some(identifier),
			presentation_context_id: Some(3),
		}
	}

	fn int(message: &DicomMessage, tag: dicom::core::Tag) -> US {
		message
			.command
			.get(tag)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.unwrap()
	}

	#[test]
	fn parse_find_request() {
		let request = CompositeFindRequest::try_from(find_request()).unwrap();
		assert_eq!(request.message_id, 42);
		assert_eq!(
			request.affected_sop_class_uid,
			uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND
		);
		assert!(request.identifier.get(tags::QUERY_RETRIEVE_LEVEL).is_some());
	}

	#[test]
	fn find_request_without_identifier() {
		let mut message = find_request();
		message.data = None;
		assert!(CompositeFindRequest::try_from(message).is_err());
	}

	#[test]
	fn pending_response_carries_identifier() {
		let request = CompositeFindRequest::try_from(find_request()).unwrap();
		let response = CompositeFindResponse::new(
			&request,
			FindResponse::pending(InMemDicomObject::new_empty()),
		);
		let message = DicomMessage::from(response);

		assert!(message.data.is_some());
		assert_eq!(
			int(&message, tags::COMMAND_FIELD),
			COMMAND_FIELD_COMPOSITE_FIND_RESPONSE
		);
		assert_eq!(int(&message, tags::MESSAGE_ID_BEING_RESPONDED_TO), 42);
		assert_eq!(int(&message, tags::STATUS), 0xFF00);
		assert_eq!(int(&message, tags::COMMAND_DATA_SET_TYPE), DATA_SET_EXISTS);
	}

	#[test]
	fn final_responses_have_no_identifier() {
		let request = CompositeFindRequest::try_from(find_request()).unwrap();
		let cases = [
			(CompositeFindResponse::success(&request), 0x0000),
			(
				CompositeFindResponse::new(&request, FindResponse::cancelled()),
				0xFE00,
			),
			(
				CompositeFindResponse::new(&request, FindResponse::unable_to_process()),
				0xC000,
			),
		];

		for (response, status) in cases {
			let message = DicomMessage::from(response);
			assert!(message.data.is_none());
			assert_eq!(int(&message, tags::STATUS), status);
			assert_eq!(int(&message, tags::COMMAND_DATA_SET_TYPE), DATA_SET_MISSING);
		}
	}

	#[test]
	fn parse_cancel_request() {
		#[rustfmt::skip]
		let message = DicomMessage {
			command: InMemDicomObject::command_from_element_iter([
				DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST])),
				DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [42])),
				DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			]),
			data: None,
			presentation_context_id: Some(3),
		};

		assert_eq!(
			CompositeCancelRequest::try_from(&message).unwrap(),
			CompositeCancelRequest {
				message_id_being_responded_to: 42
			}
		);
	}
}
