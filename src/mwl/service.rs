use super::filter;
use super::mapper;
use super::mapping::REQUIRED_FIELDS;
use crate::backend::WorklistFetcher;
use crate::dimse::ResponseStatus;
use async_stream::stream;
use chrono::{Local, NaiveDate};
use dicom::object::InMemDicomObject;
use futures::Stream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Set when the SCU sent a C-CANCEL-RQ for the running query.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

/// A single C-FIND response. Only pending responses carry an identifier.
#[derive(Debug)]
pub struct FindResponse {
	pub status: ResponseStatus,
	pub identifier: Option<InMemDicomObject>,
}

impl FindResponse {
	pub const fn pending(identifier: InMemDicomObject) -> Self {
		Self {
			status: ResponseStatus::Pending,
			identifier: Some(identifier),
		}
	}

	pub const fn cancelled() -> Self {
		Self {
			status: ResponseStatus::Cancelled,
			identifier: None,
		}
	}

	pub const fn unable_to_process() -> Self {
		Self {
			status: ResponseStatus::UnableToProcess,
			identifier: None,
		}
	}
}

/// Answers modality worklist queries from the appointment backend.
pub struct MwlFindService {
	fetcher: Arc<dyn WorklistFetcher>,
}

impl MwlFindService {
	pub fn new(fetcher: Arc<dyn WorklistFetcher>) -> Self {
		Self { fetcher }
	}

	/// Searches the worklist for matches of a C-FIND identifier.
	/// See [`MwlFindService::search_at`].
	pub fn search(
		&self,
		identifier: InMemDicomObject,
		cancel: CancelFlag,
	) -> impl Stream<Item = FindResponse> + Send + '_ {
		self.search_at(identifier, cancel, Local::now().date_naive())
	}

	/// Searches the worklist for matches of a C-FIND identifier, with `today` as
	/// the earliest appointment date unless the identifier asks for another date.
	///
	/// The stream yields one pending response per backend record, in backend order.
	/// It ends after the last match, which signals success to the SCU.
	/// A query that cannot be translated or fetched yields a single
	/// [`ResponseStatus::UnableToProcess`] response. A cancelled query yields a single
	/// [`ResponseStatus::Cancelled`] response in place of the next match.
	/// `cancel` is checked before every match.
	pub fn search_at(
		&self,
		identifier: InMemDicomObject,
		cancel: CancelFlag,
		today: NaiveDate,
	) -> impl Stream<Item = FindResponse> + Send + '_ {
		stream! {
			let query = match filter::translate(&identifier, today) {
				Ok(query) => query,
				Err(err) => {
					warn!("Unable to process C-FIND identifier: {err}");
					yield FindResponse::unable_to_process();
					return;
				}
			};
			drop(identifier);

			let records = match self.fetcher.fetch(&query.filters, REQUIRED_FIELDS).await {
				Ok(records) => records,
				Err(err) => {
					error!("Failed to fetch worklist: {err}");
					yield FindResponse::unable_to_process();
					return;
				}
			};

			info!(
				level = %query.level,
				criteria = query.filters.len(),
				"Sending {} worklist items",
				records.len()
			);
			for (sent, record) in records.into_iter().enumerate() {
				if cancel.is_cancelled() {
					info!(sent, "Matching terminated due to cancel request");
					yield FindResponse::cancelled();
					return;
				}
				yield FindResponse::pending(mapper::identifier(&record, query.level));
			}
			info!("Worklist send complete");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::FetchError;
	use crate::mwl::filter::Condition;
	use crate::mwl::mapping::{APPOINTMENT_DATE, SCHEDULED_STUDY_START_DATE};
	use crate::mwl::{FilterSet, WorklistRecord};
	use async_trait::async_trait;
	use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
	use dicom::dictionary_std::tags;
	use futures::StreamExt;
	use std::sync::Mutex;

	/// Returns a fixed set of records and remembers every received filter set.
	struct MockFetcher {
		records: Vec<WorklistRecord>,
		fail: bool,
		requests: Mutex<Vec<FilterSet>>,
	}

	impl MockFetcher {
		fn with_records(count: usize) -> Arc<Self> {
			let records = (1..=count)
				.map(|n| WorklistRecord {
					name: Some(format!("APP-{n}")),
					patient: Some(format!("PID-{n}")),
					appointment_date: Some(String::from("2024-03-01")),
					..WorklistRecord::default()
				})
				.collect();
			Arc::new(Self {
				records,
				fail: false,
				requests: Mutex::new(Vec::new()),
			})
		}

		fn failing() -> Arc<Self> {
			Arc::new(Self {
				records: Vec::new(),
				fail: true,
				requests: Mutex::new(Vec::new()),
			})
		}

		fn requests(&self) -> Vec<FilterSet> {
			self.requests.lock().unwrap().clone()
		}
	}

	#[async_trait]
	impl WorklistFetcher for MockFetcher {
		async fn fetch(
			&self,
			filters: &FilterSet,
			fields: &[&str],
		) -> Result<Vec<WorklistRecord>, FetchError> {
			assert_eq!(fields, REQUIRED_FIELDS);
			self.requests.lock().unwrap().push(filters.clone());
			if self.fail {
				return Err(FetchError::Status(reqwest::StatusCode::BAD_GATEWAY));
			}
			Ok(self.records.clone())
		}
	}

	fn today() -> NaiveDate {
		NaiveDate::from_ymd_opt(2026, 10, 14).unwrap()
	}

	fn query(elements: &[(Tag, VR, &str)]) -> InMemDicomObject {
		InMemDicomObject::from_element_iter(
			elements
				.iter()
				.map(|(tag, vr, value)| DataElement::new(*tag, *vr, PrimitiveValue::from(*value))),
		)
	}

	fn patient_query() -> InMemDicomObject {
		query(&[
			(tags::QUERY_RETRIEVE_LEVEL, VR::CS, "PATIENT"),
			(tags::PATIENT_NAME, VR::PN, "*"),
		])
	}

	fn patient_id(response: &FindResponse) -> Option<String> {
		response
			.identifier
			.as_ref()?
			.get(tags::PATIENT_ID)
			.map(|element| element.to_str())
			.and_then(Result::ok)
			.map(|value| value.trim_end().to_owned())
	}

	#[tokio::test]
	async fn missing_level_is_unable_to_process() {
		let fetcher = MockFetcher::with_records(3);
		let service = MwlFindService::new(fetcher.clone());
		let identifier = query(&[(tags::PATIENT_NAME, VR::PN, "SMITH")]);

		let responses: Vec<FindResponse> = service
			.search_at(identifier, CancelFlag::default(), today())
			.collect()
			.await;

		assert_eq!(responses.len(), 1);
		assert_eq!(responses[0].status, ResponseStatus::UnableToProcess);
		assert!(responses[0].identifier.is_none());
		assert!(fetcher.requests().is_empty(), "fetcher must not be called");
	}

	#[tokio::test]
	async fn invalid_date_is_unable_to_process() {
		let fetcher = MockFetcher::with_records(1);
		let service = MwlFindService::new(fetcher.clone());
		let identifier = query(&[
			(tags::QUERY_RETRIEVE_LEVEL, VR::CS, "PATIENT"),
			(SCHEDULED_STUDY_START_DATE, VR::DA, "2024-13-45"),
		]);

		let responses: Vec<FindResponse> = service
			.search_at(identifier, CancelFlag::default(), today())
			.collect()
			.await;

		assert_eq!(responses.len(), 1);
		assert_eq!(responses[0].status, ResponseStatus::UnableToProcess);
		assert!(fetcher.requests().is_empty());
	}

	#[tokio::test]
	async fn fetch_error_is_unable_to_process() {
		let service = MwlFindService::new(MockFetcher::failing());

		let responses: Vec<FindResponse> = service
			.search_at(patient_query(), CancelFlag::default(), today())
			.collect()
			.await;

		assert_eq!(responses.len(), 1);
		assert_eq!(responses[0].status, ResponseStatus::UnableToProcess);
		assert!(responses[0].identifier.is_none());
	}

	#[tokio::test]
	async fn stream_all_records_in_order() {
		let fetcher = MockFetcher::with_records(4);
		let service = MwlFindService::new(fetcher.clone());

		let responses: Vec<FindResponse> = service
			.search_at(patient_query(), CancelFlag::default(), today())
			.collect()
			.await;

		assert_eq!(responses.len(), 4);
		assert!(responses
			.iter()
			.all(|response| response.status == ResponseStatus::Pending));
		let ids: Vec<_> = responses.iter().filter_map(patient_id).collect();
		assert_eq!(ids, ["PID-1", "PID-2", "PID-3", "PID-4"]);
	}

	#[tokio::test]
	async fn empty_worklist_ends_immediately() {
		let service = MwlFindService::new(MockFetcher::with_records(0));
		let mut stream = Box::pin(service.search_at(patient_query(), CancelFlag::default(), today()));
		assert!(stream.next().await.is_none());
	}

	#[tokio::test]
	async fn cancel_before_record() {
		let service = MwlFindService::new(MockFetcher::with_records(5));
		let cancel = CancelFlag::default();
		let mut stream = Box::pin(service.search_at(patient_query(), cancel.clone(), today()));

		// Cancel before the third record is processed
		for _ in 0..2 {
			let response = stream.next().await.unwrap();
			assert_eq!(response.status, ResponseStatus::Pending);
		}
		cancel.cancel();

		let response = stream.next().await.unwrap();
		assert_eq!(response.status, ResponseStatus::Cancelled);
		assert!(response.identifier.is_none());
		assert!(stream.next().await.is_none());
	}

	#[tokio::test]
	async fn cancel_before_first_record() {
		let service = MwlFindService::new(MockFetcher::with_records(2));
		let cancel = CancelFlag::default();
		cancel.cancel();

		let responses: Vec<FindResponse> = service
			.search_at(patient_query(), cancel, today())
			.collect()
			.await;

		assert_eq!(responses.len(), 1);
		assert_eq!(responses[0].status, ResponseStatus::Cancelled);
	}

	#[tokio::test]
	async fn default_date_filter_uses_today() {
		let fetcher = MockFetcher::with_records(1);
		let service = MwlFindService::new(fetcher.clone());

		let _: Vec<FindResponse> = service
			.search_at(patient_query(), CancelFlag::default(), today())
			.collect()
			.await;

		let requests = fetcher.requests();
		assert_eq!(requests.len(), 1);
		assert_eq!(
			requests[0].get(APPOINTMENT_DATE),
			Some(&Condition::Gte(String::from("2026-10-14")))
		);
		assert_eq!(requests[0].get("patient_name"), None);
	}

	#[tokio::test]
	async fn nothing_is_fetched_before_polling() {
		let fetcher = MockFetcher::with_records(1);
		let service = MwlFindService::new(fetcher.clone());

		let stream = service.search_at(patient_query(), CancelFlag::default(), today());
		assert!(fetcher.requests().is_empty());
		drop(stream);
		assert!(fetcher.requests().is_empty());
	}
}
