use super::mapping::{OutboundMapping, OUTBOUND};
use super::record::WorklistRecord;
use crate::types::QueryRetrieveLevel;
use chrono::NaiveDate;
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use tracing::warn;

/// Builds the C-FIND-RSP identifier for a single worklist record.
///
/// The identifier echoes the Query/Retrieve Level of the request. Record fields
/// without an outbound mapping and empty fields are skipped.
pub fn identifier(record: &WorklistRecord, level: QueryRetrieveLevel) -> InMemDicomObject {
	let mut identifier = InMemDicomObject::new_empty();
	identifier.put(DataElement::new(
		tags::QUERY_RETRIEVE_LEVEL,
		VR::CS,
		PrimitiveValue::from(level),
	));

	for mapping in OUTBOUND {
		if let Some(value) = value_of(record, mapping) {
			identifier.put(DataElement::new(mapping.tag, mapping.vr, value));
		}
	}

	identifier
}

fn value_of(record: &WorklistRecord, mapping: &OutboundMapping) -> Option<PrimitiveValue> {
	let value = record.field(mapping.field)?;
	if mapping.vr != VR::DA {
		return Some(PrimitiveValue::from(value));
	}

	match dicom_date(value) {
		Some(date) => Some(PrimitiveValue::from(date)),
		None => {
			warn!(
				field = mapping.field,
				value, "Skipping backend date that is not ISO 8601"
			);
			None
		}
	}
}

/// Converts an ISO 8601 date (`YYYY-MM-DD`) to a DICOM date (`YYYYMMDD`).
pub fn dicom_date(iso: &str) -> Option<String> {
	// Datetimes are accepted as well, the time part is dropped
	let date = iso.get(..10).unwrap_or(iso);
	NaiveDate::parse_from_str(date, "%Y-%m-%d")
		.ok()
		.map(|date| date.format("%Y%m%d").to_string())
}
