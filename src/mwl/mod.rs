//! Modality worklist: translation between C-FIND identifiers and appointment
//! records, and the streaming find service built on top of it.

pub mod export;
pub mod filter;
pub mod mapper;
pub mod mapping;
mod record;
pub mod service;

pub use filter::FilterSet;
pub use record::WorklistRecord;
pub use service::{CancelFlag, FindResponse, MwlFindService};
