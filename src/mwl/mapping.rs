use dicom::core::{Tag, VR};
use dicom::dictionary_std::tags;

/// Scheduled Study Start Date (0032,1000). Retired from the standard, but still sent by modalities.
pub const SCHEDULED_STUDY_START_DATE: Tag = Tag(0x0032, 0x1000);

/// Backend field that carries the appointment date.
pub const APPOINTMENT_DATE: &str = "appointment_date";

/// A backend field that is copied into the outgoing identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundMapping {
	pub field: &'static str,
	pub tag: Tag,
	pub vr: VR,
}

/// A DICOM matching key that is translated into a backend filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundMapping {
	pub tag: Tag,
	pub field: &'static str,
}

const fn outbound(field: &'static str, tag: Tag, vr: VR) -> OutboundMapping {
	OutboundMapping { field, tag, vr }
}

const fn inbound(tag: Tag, field: &'static str) -> InboundMapping {
	InboundMapping { tag, field }
}

/// Backend record field → DICOM attribute.
/// `name`, `status` and `appointment_time` have no counterpart.
pub const OUTBOUND: &[OutboundMapping] = &[
	outbound("patient", tags::PATIENT_ID, VR::LO),
	outbound("patient_name", tags::PATIENT_NAME, VR::PN),
	outbound(APPOINTMENT_DATE, SCHEDULED_STUDY_START_DATE, VR::DA),
	outbound("procedure_template", tags::SCHEDULED_PROCEDURE_STEP_ID, VR::SH),
	outbound("practitioner_name", tags::SCHEDULED_PERFORMING_PHYSICIAN_NAME, VR::PN),
	outbound("referring_practitioner", tags::REQUESTING_PHYSICIAN, VR::PN),
	outbound("service_unit", tags::MODALITY, VR::CS),
	outbound("ae_title", tags::SCHEDULED_STATION_AE_TITLE, VR::AE),
	outbound("location", tags::SCHEDULED_PROCEDURE_STEP_LOCATION, VR::SH),
	outbound("description", tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION, VR::LO),
	outbound("premedication", tags::PRE_MEDICATION, VR::LO),
];

/// DICOM matching key → backend filter field.
///
/// Order matters: a later key overrides an earlier key that targets the same field,
/// so the performing physician wins over the requesting physician.
pub const INBOUND: &[InboundMapping] = &[
	inbound(tags::PATIENT_NAME, "patient_name"),
	inbound(tags::PATIENT_ID, "patient"),
	inbound(tags::REQUESTING_PHYSICIAN, "practitioner"),
	inbound(tags::SCHEDULED_PERFORMING_PHYSICIAN_NAME, "practitioner"),
	inbound(tags::SCHEDULED_STATION_AE_TITLE, "ae_title"),
	inbound(tags::MODALITY, "service_unit"),
];

/// Matching keys for the appointment date, by precedence.
pub const DATE_KEYS: &[Tag] = &[
	tags::SCHEDULED_PROCEDURE_STEP_START_DATE,
	SCHEDULED_STUDY_START_DATE,
];

/// Fields requested from the backend for every query.
pub const REQUIRED_FIELDS: &[&str] = &[
	"name",
	"status",
	"patient",
	"patient_name",
	APPOINTMENT_DATE,
	"appointment_time",
	"procedure_template",
	"practitioner_name",
	"referring_practitioner",
	"service_unit",
	"ae_title",
	"location",
	"description",
	"premedication",
];

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;

	#[test]
	fn outbound_fields_are_requested() {
		for mapping in OUTBOUND {
			assert!(
				REQUIRED_FIELDS.contains(&mapping.field),
				"{} is not requested from the backend",
				mapping.field
			);
		}
	}

	#[test]
	fn outbound_tags_are_unique() {
		let tags: HashSet<Tag> = OUTBOUND.iter().map(|mapping| mapping.tag).collect();
		assert_eq!(tags.len(), OUTBOUND.len());
	}

	#[test]
	fn appointment_time_is_not_mapped() {
		assert!(OUTBOUND
			.iter()
			.all(|mapping| mapping.field != "appointment_time"));
	}
}
