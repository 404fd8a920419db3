//! Access to the appointment-scheduling backend.
//! - [`WorklistFetcher`] is the seam used by the worklist service.
//! - [`AppointmentFetcher`] queries the `Patient Appointment` REST resource.

mod appointment;

pub use appointment::AppointmentFetcher;

use crate::mwl::{FilterSet, WorklistRecord};
use async_trait::async_trait;
use thiserror::Error;

/// Executes a single backend query.
#[async_trait]
pub trait WorklistFetcher: Send + Sync {
	/// Returns the records matching `filters`, in backend order.
	/// Only `fields` are requested from the backend.
	async fn fetch(
		&self,
		filters: &FilterSet,
		fields: &[&str],
	) -> Result<Vec<WorklistRecord>, FetchError>;
}

#[derive(Debug, Error)]
pub enum FetchError {
	#[error("Backend credentials are not a valid Authorization header: {0}")]
	Credentials(#[source] reqwest::header::InvalidHeaderValue),
	#[error("Failed to encode request parameters: {0}")]
	Encode(#[source] serde_json::Error),
	#[error("Backend request failed: {0}")]
	Request(#[from] reqwest::Error),
	#[error("Backend responded with status {0}")]
	Status(reqwest::StatusCode),
	#[error("Failed to decode backend response: {0}")]
	Decode(#[source] serde_json::Error),
}
