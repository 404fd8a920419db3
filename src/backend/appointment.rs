use super::{FetchError, WorklistFetcher};
use crate::config::BackendCredentials;
use crate::mwl::{FilterSet, WorklistRecord};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

const RESOURCE_PATH: &str = "/api/resource/Patient Appointment";

/// Fetches worklist records from the `Patient Appointment` resource of the backend.
pub struct AppointmentFetcher {
	client: reqwest::Client,
	url: String,
	authorization: HeaderValue,
}

/// Body of a resource list response.
#[derive(Debug, Default, Deserialize)]
struct ResourceList {
	#[serde(default)]
	data: Option<Vec<WorklistRecord>>,
}

impl AppointmentFetcher {
	pub fn new(credentials: BackendCredentials, timeout: Duration) -> Result<Self, FetchError> {
		let mut authorization = HeaderValue::from_str(&format!(
			"token {}:{}",
			credentials.api_key, credentials.api_secret
		))
		.map_err(FetchError::Credentials)?;
		authorization.set_sensitive(true);

		let client = reqwest::Client::builder().timeout(timeout).build()?;
		let url = format!(
			"{}{RESOURCE_PATH}",
			credentials.host_name.trim_end_matches('/')
		);
		Ok(Self {
			client,
			url,
			authorization,
		})
	}

	fn headers(&self) -> HeaderMap {
		let mut headers = HeaderMap::new();
		headers.insert(AUTHORIZATION, self.authorization.clone());
		headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
		headers
	}
}

#[async_trait]
impl WorklistFetcher for AppointmentFetcher {
	#[instrument(skip_all, fields(url = %self.url))]
	async fn fetch(
		&self,
		filters: &FilterSet,
		fields: &[&str],
	) -> Result<Vec<WorklistRecord>, FetchError> {
		let fields = serde_json::to_string(fields).map_err(FetchError::Encode)?;
		let filters = serde_json::to_string(filters).map_err(FetchError::Encode)?;
		debug!(%fields, %filters, "Requesting appointments");

		let response = self
			.client
			.get(&self.url)
			.headers(self.headers())
			.form(&[("fields", fields), ("filters", filters)])
			.send()
			.await?;

		let status = response.status();
		if !status.is_success() {
			return Err(FetchError::Status(status));
		}

		let body = response.bytes().await?;
		let records = decode(&body)?;
		debug!("Received {} appointments", records.len());
		Ok(records)
	}
}

/// Decodes a resource list. A `null` body or a missing `data` key contains no records.
fn decode(body: &[u8]) -> Result<Vec<WorklistRecord>, FetchError> {
	let list: Option<ResourceList> = serde_json::from_slice(body).map_err(FetchError::Decode)?;
	Ok(list.and_then(|list| list.data).unwrap_or_default())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn credentials(host_name: &str) -> BackendCredentials {
		BackendCredentials {
			host_name: String::from(host_name),
			api_key: String::from("key"),
			api_secret: String::from("secret"),
		}
	}

	#[test]
	fn resource_url() {
		let fetcher =
			AppointmentFetcher::new(credentials("http://localhost:8000/"), Duration::from_secs(1))
				.unwrap();
		assert_eq!(
			fetcher.url,
			"http://localhost:8000/api/resource/Patient Appointment"
		);
	}

	#[test]
	fn request_headers() {
		let fetcher =
			AppointmentFetcher::new(credentials("http://localhost"), Duration::from_secs(1))
				.unwrap();
		let headers = fetcher.headers();
		assert_eq!(headers[AUTHORIZATION], "token key:secret");
		assert_eq!(headers[ACCEPT], "application/json");
		assert!(headers[AUTHORIZATION].is_sensitive());
	}

	#[test]
	fn invalid_token_is_rejected() {
		let mut credentials = credentials("http://localhost");
		credentials.api_secret = String::from("secret\n");
		assert!(matches!(
			AppointmentFetcher::new(credentials, Duration::from_secs(1)),
			Err(FetchError::Credentials(_))
		));
	}

	#[test]
	fn decode_records_in_order() {
		let records = decode(
			br#"{"data": [{"name": "APP-2"}, {"name": "APP-1", "patient": "PID-1"}]}"#,
		)
		.unwrap();
		let names: Vec<_> = records.iter().filter_map(|r| r.field("name")).collect();
		assert_eq!(names, ["APP-2", "APP-1"]);
	}

	#[test]
	fn decode_missing_data_as_empty() {
		assert!(decode(b"{}").unwrap().is_empty());
		assert!(decode(br#"{"data": null}"#).unwrap().is_empty());
		assert!(decode(br#"{"data": []}"#).unwrap().is_empty());
		assert!(decode(b"null").unwrap().is_empty());
	}

	#[test]
	fn decode_garbage_fails() {
		assert!(matches!(
			decode(b"<html>502 Bad Gateway</html>"),
			Err(FetchError::Decode(_))
		));
	}
}
