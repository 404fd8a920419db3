use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub server: ServerConfig,
	pub shutdown: ShutdownConfig,
	pub backend: BackendConfig,
}

impl AppConfig {
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::Config;
		let s = Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::with_name("ris-bridge.toml").required(false))
			.add_source(config::Environment::with_prefix("RIS_BRIDGE").separator("__"))
			.build()?;

		s.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	// Configurable logging level. Also configurable via env vars RUST_LOG and RIS_BRIDGE_TELEMETRY__LEVEL
	pub level: String,
	/// Sentry DSN. Sentry is disabled if unset.
	pub sentry: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	/// The application entity title of the worklist SCP.
	pub aet: String,
	pub interface: IpAddr,
	pub port: u16,
	/// Only accept transfer syntaxes that do not need a codec.
	pub uncompressed: bool,
	/// Timeout in milliseconds for sending a single DIMSE message.
	pub timeout: u64,
}

impl ServerConfig {
	pub const fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
	pub poll_interval: u64,
	pub timeout: Option<u64>,
}

impl ShutdownConfig {
	pub const fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval)
	}

	pub fn timeout(&self) -> Option<Duration> {
		self.timeout.map(Duration::from_millis)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
	/// Path of the JSON document holding the backend credentials.
	pub credentials: PathBuf,
	/// Timeout in milliseconds for a single backend request.
	pub request_timeout: u64,
}

impl BackendConfig {
	pub const fn request_timeout(&self) -> Duration {
		Duration::from_millis(self.request_timeout)
	}
}

/// Base URL and API token of the appointment backend.
#[derive(Clone, Deserialize)]
pub struct BackendCredentials {
	#[serde(alias = "url")]
	pub host_name: String,
	pub api_key: String,
	pub api_secret: String,
}

impl std::fmt::Debug for BackendCredentials {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BackendCredentials")
			.field("host_name", &self.host_name)
			.field("api_key", &self.api_key)
			.finish_non_exhaustive()
	}
}

impl BackendCredentials {
	pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
		config::Config::builder()
			.add_source(config::File::from(path).format(config::FileFormat::Json))
			.build()?
			.try_deserialize()
	}
}
