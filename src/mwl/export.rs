//! Batch export of the upcoming appointments as worklist files (`.wl`) for
//! worklist servers that read their entries from a directory.

use super::filter::FilterSet;
use super::mapper::dicom_date;
use super::mapping::REQUIRED_FIELDS;
use super::record::WorklistRecord;
use crate::backend::{FetchError, WorklistFetcher};
use chrono::NaiveDate;
use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

// Static values for attributes the appointment backend does not provide
const PLACEHOLDER_ACCESSION_NUMBER: &str = "12345-abc";
const PLACEHOLDER_PATIENT_BIRTH_DATE: &str = "19700101";
const PLACEHOLDER_PATIENT_SEX: &str = "O";

/// Record fields on the top level of a worklist file.
const PATIENT_ATTRIBUTES: &[(&str, Tag, VR)] = &[
	("patient", tags::PATIENT_ID, VR::LO),
	("patient_name", tags::PATIENT_NAME, VR::PN),
	("referring_practitioner", tags::REQUESTING_PHYSICIAN, VR::PN),
	("description", tags::REQUESTED_PROCEDURE_DESCRIPTION, VR::LO),
];

/// Record fields of the Scheduled Procedure Step Sequence item.
const STEP_ATTRIBUTES: &[(&str, Tag, VR)] = &[
	("service_unit", tags::MODALITY, VR::CS),
	("ae_title", tags::SCHEDULED_STATION_AE_TITLE, VR::AE),
	("practitioner_name", tags::SCHEDULED_PERFORMING_PHYSICIAN_NAME, VR::PN),
	("location", tags::SCHEDULED_PROCEDURE_STEP_LOCATION, VR::SH),
	("description", tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION, VR::LO),
	("procedure_template", tags::SCHEDULED_PROCEDURE_STEP_ID, VR::SH),
];

#[derive(Debug, Error)]
pub enum ExportError {
	#[error(transparent)]
	Fetch(#[from] FetchError),
	#[error("Failed to build file meta group: {0}")]
	Meta(#[from] dicom::object::meta::Error),
	#[error("Failed to encode worklist file: {0}")]
	Write(#[from] dicom::object::WriteError),
	#[error("Failed to write {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

/// Fetches all appointments from `today` onwards and writes one worklist file per
/// appointment into `directory`. Returns the number of written files.
pub async fn export(
	fetcher: &dyn WorklistFetcher,
	directory: &Path,
	today: NaiveDate,
) -> Result<usize, ExportError> {
	let records = fetcher.fetch(&FilterSet::new(today), REQUIRED_FIELDS).await?;
	tokio::fs::create_dir_all(directory)
		.await
		.map_err(|source| ExportError::Io {
			path: directory.to_path_buf(),
			source,
		})?;

	let mut written = 0;
	for record in &records {
		let Some(file_name) = record.field("name").map(file_name) else {
			warn!("Skipping appointment without a name");
			continue;
		};

		let path = directory.join(file_name);
		let mut buf = Vec::new();
		worklist_file(record, today)?.write_all(&mut buf)?;
		tokio::fs::write(&path, buf)
			.await
			.map_err(|source| ExportError::Io {
				path: path.clone(),
				source,
			})?;
		info!(path = %path.display(), "Wrote worklist file");
		written += 1;
	}

	Ok(written)
}

/// Builds the worklist file for a single appointment.
pub fn worklist_file(
	record: &WorklistRecord,
	today: NaiveDate,
) -> Result<FileDicomObject<InMemDicomObject>, ExportError> {
	let sop_instance_uid = random_uid();
	let mut object = InMemDicomObject::from_element_iter([
		DataElement::new(
			tags::SPECIFIC_CHARACTER_SET,
			VR::CS,
			PrimitiveValue::from("ISO_IR 6"),
		),
		DataElement::new(
			tags::INSTANCE_CREATION_DATE,
			VR::DA,
			PrimitiveValue::from(today.format("%Y%m%d").to_string()),
		),
		DataElement::new(
			tags::SOP_CLASS_UID,
			VR::UI,
			PrimitiveValue::from(uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND),
		),
		DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(sop_instance_uid.as_str()),
		),
		DataElement::new(
			tags::ACCESSION_NUMBER,
			VR::SH,
			PrimitiveValue::from(PLACEHOLDER_ACCESSION_NUMBER),
		),
		DataElement::new(
			tags::PATIENT_BIRTH_DATE,
			VR::DA,
			PrimitiveValue::from(PLACEHOLDER_PATIENT_BIRTH_DATE),
		),
		DataElement::new(
			tags::PATIENT_SEX,
			VR::CS,
			PrimitiveValue::from(PLACEHOLDER_PATIENT_SEX),
		),
		DataElement::new(
			tags::STUDY_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(random_uid()),
		),
	]);
	put_fields(&mut object, record, PATIENT_ATTRIBUTES);

	let mut step = InMemDicomObject::new_empty();
	if let Some(date) = record.field("appointment_date").and_then(dicom_date) {
		step.put(DataElement::new(
			tags::SCHEDULED_PROCEDURE_STEP_START_DATE,
			VR::DA,
			PrimitiveValue::from(date),
		));
	}
	put_fields(&mut step, record, STEP_ATTRIBUTES);
	object.put(DataElement::new(
		tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE,
		VR::SQ,
		DataSetSequence::from(vec![step]),
	));

	let meta = FileMetaTableBuilder::new()
		.media_storage_sop_class_uid(uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND)
		.media_storage_sop_instance_uid(sop_instance_uid)
		.transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
		.build()?;

	Ok(object.with_exact_meta(meta))
}

fn put_fields(
	object: &mut InMemDicomObject,
	record: &WorklistRecord,
	fields: &[(&str, Tag, VR)],
) {
	for &(field, tag, vr) in fields {
		if let Some(value) = record.field(field) {
			object.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
		}
	}
}

/// A UUID derived UID under the 2.25 root.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part05/sect_B.2.html>
fn random_uid() -> String {
	format!("2.25.{}", Uuid::new_v4().as_u128())
}

/// Appointment names may contain path separators.
fn file_name(name: &str) -> String {
	format!("{}.wl", name.replace(['/', '\\'], "_"))
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::object::mem::InMemElement;

	fn record() -> WorklistRecord {
		WorklistRecord {
			name: Some(String::from("APP-2024-00017")),
			patient: Some(String::from("PID-0042")),
			patient_name: Some(String::from("SMITH^JOHN")),
			appointment_date: Some(String::from("2024-03-01")),
			service_unit: Some(String::from("CT")),
			ae_title: Some(String::from("CT01")),
			practitioner_name: Some(String::from("Dr. Brown")),
			description: Some(String::from("CT Thorax")),
			..WorklistRecord::default()
		}
	}

	fn str_of(object: &InMemDicomObject, tag: Tag) -> Option<String> {
		object
			.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
	}

	fn today() -> NaiveDate {
		NaiveDate::from_ymd_opt(2026, 10, 14).unwrap()
	}

	#[test]
	fn file_contains_patient_and_step() {
		let file = worklist_file(&record(), today()).unwrap();

		assert_eq!(
			file.meta().transfer_syntax(),
			uids::EXPLICIT_VR_LITTLE_ENDIAN
		);
		assert_eq!(str_of(&file, tags::PATIENT_ID).as_deref(), Some("PID-0042"));
		assert_eq!(
			str_of(&file, tags::PATIENT_NAME).as_deref(),
			Some("SMITH^JOHN")
		);
		assert_eq!(
			str_of(&file, tags::REQUESTED_PROCEDURE_DESCRIPTION).as_deref(),
			Some("CT Thorax")
		);
		assert_eq!(
			str_of(&file, tags::INSTANCE_CREATION_DATE).as_deref(),
			Some("20261014")
		);
		assert!(str_of(&file, tags::STUDY_INSTANCE_UID)
			.unwrap()
			.starts_with("2.25."));

		let steps = file
			.get(tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE)
			.and_then(|element| element.items())
			.unwrap();
		assert_eq!(steps.len(), 1);
		assert_eq!(str_of(&steps[0], tags::MODALITY).as_deref(), Some("CT"));
		assert_eq!(
			str_of(&steps[0], tags::SCHEDULED_PROCEDURE_STEP_START_DATE).as_deref(),
			Some("20240301")
		);
		assert_eq!(
			str_of(&steps[0], tags::SCHEDULED_STATION_AE_TITLE).as_deref(),
			Some("CT01")
		);
		assert!(steps[0].get(tags::SCHEDULED_PROCEDURE_STEP_LOCATION).is_none());
	}

	#[test]
	fn instance_uids_are_unique() {
		let first = worklist_file(&record(), today()).unwrap();
		let second = worklist_file(&record(), today()).unwrap();
		assert_ne!(
			first.meta().media_storage_sop_instance_uid(),
			second.meta().media_storage_sop_instance_uid()
		);
	}

	#[test]
	fn file_names_without_separators() {
		assert_eq!(file_name("APP-0001"), "APP-0001.wl");
		assert_eq!(file_name("../etc/passwd"), ".._etc_passwd.wl");
		assert_eq!(file_name("a\\b"), "a_b.wl");
	}
}
