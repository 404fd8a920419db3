use serde::Deserialize;

/// A `Patient Appointment` as returned by the backend.
/// Every field may be missing or `null`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorklistRecord {
	pub name: Option<String>,
	pub status: Option<String>,
	pub patient: Option<String>,
	pub patient_name: Option<String>,
	pub appointment_date: Option<String>,
	pub appointment_time: Option<String>,
	pub procedure_template: Option<String>,
	pub practitioner_name: Option<String>,
	pub referring_practitioner: Option<String>,
	pub service_unit: Option<String>,
	pub ae_title: Option<String>,
	pub location: Option<String>,
	pub description: Option<String>,
	pub premedication: Option<String>,
}

impl WorklistRecord {
	/// Returns the non-empty value of a backend field by its name.
	pub fn field(&self, name: &str) -> Option<&str> {
		let value = match name {
			"name" => &self.name,
			"status" => &self.status,
			"patient" => &self.patient,
			"patient_name" => &self.patient_name,
			"appointment_date" => &self.appointment_date,
			"appointment_time" => &self.appointment_time,
			"procedure_template" => &self.procedure_template,
			"practitioner_name" => &self.practitioner_name,
			"referring_practitioner" => &self.referring_practitioner,
			"service_unit" => &self.service_unit,
			"ae_title" => &self.ae_title,
			"location" => &self.location,
			"description" => &self.description,
			"premedication" => &self.premedication,
			_ => return None,
		};
		value.as_deref().filter(|value| !value.is_empty())
	}
}
