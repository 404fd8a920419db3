use super::mapping::{APPOINTMENT_DATE, DATE_KEYS, INBOUND};
use crate::types::QueryRetrieveLevel;
use chrono::NaiveDate;
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use serde::ser::{SerializeMap, SerializeTuple};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// DICOM date format (DA).
const DICOM_DATE: &str = "%Y%m%d";
/// ISO 8601 calendar date, as used by the backend.
const ISO_DATE: &str = "%Y-%m-%d";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
	#[error("Missing QueryRetrieveLevel (0008,0052)")]
	MissingLevel,
	#[error("Unknown QueryRetrieveLevel '{0}'")]
	UnknownLevel(String),
	#[error("Invalid date '{0}', expected YYYYMMDD or a range of it")]
	InvalidDateFormat(String),
}

/// Comparison applied by the backend to a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
	Eq(String),
	/// SQL `LIKE` pattern, translated from DICOM wildcard matching.
	Like(String),
	Gte(String),
	Lte(String),
	Between(String, String),
}

impl Condition {
	pub const fn operator(&self) -> &'static str {
		match self {
			Self::Eq(_) => "=",
			Self::Like(_) => "like",
			Self::Gte(_) => ">=",
			Self::Lte(_) => "<=",
			Self::Between(..) => "between",
		}
	}
}

impl Serialize for Condition {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		match self {
			Self::Eq(value) => serializer.serialize_str(value),
			Self::Like(value) | Self::Gte(value) | Self::Lte(value) => {
				let mut tuple = serializer.serialize_tuple(2)?;
				tuple.serialize_element(self.operator())?;
				tuple.serialize_element(value)?;
				tuple.end()
			}
			Self::Between(from, to) => {
				let mut tuple = serializer.serialize_tuple(2)?;
				tuple.serialize_element(self.operator())?;
				tuple.serialize_element(&[from, to])?;
				tuple.end()
			}
		}
	}
}

/// Backend filter criteria, keyed by field name.
///
/// A filter set always restricts the appointment date. It is initialized with
/// `appointment_date >= today` and only an explicit date in the query replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSet(BTreeMap<&'static str, Condition>);

impl FilterSet {
	pub fn new(today: NaiveDate) -> Self {
		let mut criteria = BTreeMap::new();
		criteria.insert(
			APPOINTMENT_DATE,
			Condition::Gte(today.format(ISO_DATE).to_string()),
		);
		Self(criteria)
	}

	/// Adds a criterion. An existing criterion for the same field is replaced.
	pub fn insert(&mut self, field: &'static str, condition: Condition) {
		self.0.insert(field, condition);
	}

	pub fn get(&self, field: &str) -> Option<&Condition> {
		self.0.get(field)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}
}

impl Serialize for FilterSet {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut map = serializer.serialize_map(Some(self.0.len()))?;
		for (field, condition) in &self.0 {
			map.serialize_entry(field, condition)?;
		}
		map.end()
	}
}

/// A validated worklist query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorklistQuery {
	pub level: QueryRetrieveLevel,
	pub filters: FilterSet,
}

/// Reads the mandatory Query/Retrieve Level of an identifier.
pub fn query_retrieve_level(
	identifier: &InMemDicomObject,
) -> Result<QueryRetrieveLevel, ValidationError> {
	let value = identifier
		.get(tags::QUERY_RETRIEVE_LEVEL)
		.map(|element| element.to_str())
		.and_then(Result::ok)
		.ok_or(ValidationError::MissingLevel)?;

	let value = value.trim_matches([' ', '\0']);
	if value.is_empty() {
		return Err(ValidationError::MissingLevel);
	}
	value.parse().map_err(ValidationError::UnknownLevel)
}

/// Translates a C-FIND identifier into backend filter criteria.
///
/// Only PATIENT level queries are translated key by key. Every other level is
/// answered with the default date filter.
pub fn translate(
	identifier: &InMemDicomObject,
	today: NaiveDate,
) -> Result<WorklistQuery, ValidationError> {
	let level = query_retrieve_level(identifier)?;
	let mut filters = FilterSet::new(today);

	if level != QueryRetrieveLevel::Patient {
		debug!(%level, "Ignoring matching keys of non-PATIENT query");
		return Ok(WorklistQuery { level, filters });
	}

	for mapping in INBOUND {
		if let Some(value) = matching_value(identifier, mapping.tag) {
			filters.insert(mapping.field, match_condition(value));
		}
	}

	if let Some(value) = DATE_KEYS
		.iter()
		.find_map(|tag| matching_value(identifier, *tag))
	{
		filters.insert(APPOINTMENT_DATE, date_condition(&value)?);
	}

	Ok(WorklistQuery { level, filters })
}

/// Values that match everything in DICOM universal matching.
fn is_universal_match(value: &str) -> bool {
	matches!(value, "" | "*" | "?")
}

/// Returns the value of a matching key, looking into the first Scheduled Procedure
/// Step item if the key is not set at the top level.
/// Universal matches are treated like an absent key.
fn matching_value(identifier: &InMemDicomObject, tag: Tag) -> Option<String> {
	let scheduled_step = identifier
		.get(tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE)
		.and_then(|sequence| sequence.items())
		.and_then(<[InMemDicomObject]>::first);

	[Some(identifier), scheduled_step]
		.into_iter()
		.flatten()
		.filter_map(|object| object.get(tag))
		.filter_map(|element| element.to_str().ok())
		.map(|value| value.trim_matches([' ', '\0']).to_owned())
		.find(|value| !is_universal_match(value))
}

fn match_condition(value: String) -> Condition {
	if value.contains(['*', '?']) {
		Condition::Like(value.replace('*', "%").replace('?', "_"))
	} else {
		Condition::Eq(value)
	}
}

/// Converts a DICOM date or date range to the matching backend condition.
fn date_condition(value: &str) -> Result<Condition, ValidationError> {
	let condition = match value.split_once('-') {
		None => Condition::Eq(iso_date(value)?),
		Some(("", "")) => return Err(ValidationError::InvalidDateFormat(value.to_owned())),
		Some((from, "")) => Condition::Gte(iso_date(from)?),
		Some(("", to)) => Condition::Lte(iso_date(to)?),
		Some((from, to)) => Condition::Between(iso_date(from)?, iso_date(to)?),
	};
	Ok(condition)
}

fn iso_date(value: &str) -> Result<String, ValidationError> {
	let trimmed = value.trim();
	if trimmed.len() != 8 {
		return Err(ValidationError::InvalidDateFormat(value.to_owned()));
	}
	NaiveDate::parse_from_str(trimmed, DICOM_DATE)
		.map(|date| date.format(ISO_DATE).to_string())
		.map_err(|_| ValidationError::InvalidDateFormat(value.to_owned()))
}
