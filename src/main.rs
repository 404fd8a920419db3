pub(crate) mod backend;
pub(crate) mod config;
pub(crate) mod dimse;
pub(crate) mod mwl;
pub(crate) mod shutdown;
pub(crate) mod types;

use crate::backend::{AppointmentFetcher, WorklistFetcher};
use crate::config::{AppConfig, BackendConfig, BackendCredentials};
use crate::dimse::WorklistServiceClassProvider;
use crate::mwl::MwlFindService;
use crate::shutdown::{DrainOutcome, ShutdownCoordinator};
use anyhow::Context;
use clap::Parser;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, level_filters::LevelFilter, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// DICOM Modality Worklist SCP serving the appointments of a Patient Appointment REST API.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
	/// Application entity title of the worklist SCP
	title: String,
	/// Interface to listen on [default: 127.0.0.1]
	#[arg(long)]
	host: Option<IpAddr>,
	/// Port to listen on [default: 104]
	#[arg(short, long)]
	port: Option<u16>,
	/// Enable debug logging
	#[arg(short, long)]
	debug: bool,
	/// JSON file with the backend credentials [default: config.json]
	#[arg(short, long, value_name = "FILE")]
	config: Option<PathBuf>,
	/// Write the upcoming appointments as worklist files into DIR and exit
	#[arg(long, value_name = "DIR")]
	export: Option<PathBuf>,
}

impl Cli {
	/// Command line arguments take precedence over all configuration sources.
	fn apply(&self, mut config: AppConfig) -> AppConfig {
		config.server.aet.clone_from(&self.title);
		if let Some(host) = self.host {
			config.server.interface = host;
		}
		if let Some(port) = self.port {
			config.server.port = port;
		}
		if let Some(credentials) = &self.config {
			config.backend.credentials.clone_from(credentials);
		}
		if self.debug {
			config.telemetry.level = String::from("debug");
		}
		config
	}
}

fn init_logger(level: Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	};

	guard
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
	let cli = Cli::parse();
	let config = cli.apply(AppConfig::new()?);
	init_logger(config.telemetry.level.parse()?);

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	let exit_code = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			let result = match &cli.export {
				Some(directory) => export(config, directory).await,
				None => run(config).await,
			};
			result.unwrap_or_else(|error| {
				error!("Application failed due to error: {error:#}");
				ExitCode::FAILURE
			})
		});
	Ok(exit_code)
}

fn fetcher(config: &BackendConfig) -> anyhow::Result<Arc<dyn WorklistFetcher>> {
	let credentials = BackendCredentials::load(&config.credentials).with_context(|| {
		format!(
			"Failed to load backend credentials from {}",
			config.credentials.display()
		)
	})?;
	let fetcher = AppointmentFetcher::new(credentials, config.request_timeout())?;
	Ok(Arc::new(fetcher))
}

async fn run(config: AppConfig) -> anyhow::Result<ExitCode> {
	let service = MwlFindService::new(fetcher(&config.backend)?);
	let scp = Arc::new(WorklistServiceClassProvider::new(
		config.server.clone(),
		service,
	));

	let server = Arc::clone(&scp);
	let mut listener = tokio::spawn(async move { server.spawn().await });

	tokio::select! {
		result = &mut listener => {
			result??;
			anyhow::bail!("Worklist SCP stopped unexpectedly");
		}
		result = shutdown_signal() => {
			result.context("Failed to listen for shutdown signals")?;
		}
	}

	info!("Received shutdown signal");
	let coordinator =
		ShutdownCoordinator::new(config.shutdown.poll_interval(), config.shutdown.timeout());
	match coordinator.drain(scp.as_ref()).await {
		DrainOutcome::Drained => Ok(ExitCode::SUCCESS),
		DrainOutcome::TimedOut { remaining } => {
			error!(remaining, "Exiting with open associations");
			Ok(ExitCode::FAILURE)
		}
	}
}

async fn export(config: AppConfig, directory: &Path) -> anyhow::Result<ExitCode> {
	let fetcher = fetcher(&config.backend)?;
	let today = chrono::Local::now().date_naive();
	let written = mwl::export::export(fetcher.as_ref(), directory, today).await?;
	info!(written, directory = %directory.display(), "Exported worklist files");
	Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() -> std::io::Result<()> {
	#[cfg(unix)]
	{
		let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
		tokio::select! {
			result = signal::ctrl_c() => result,
			_ = terminate.recv() => Ok(()),
		}
	}

	#[cfg(not(unix))]
	signal::ctrl_c().await
}
