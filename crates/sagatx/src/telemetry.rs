// Logging setup for binaries embedding the agent

use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Error, Debug)]
pub enum TelemetryError {
	#[error("invalid log filter: {0}")]
	Filter(#[from] tracing_subscriber::filter::ParseError),

	#[error("failed to install subscriber: {0}")]
	Init(#[from] tracing_subscriber::util::TryInitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
	#[default]
	Text,
	Json,
}

impl FromStr for LogFormat {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"text" | "plain" => Ok(LogFormat::Text),
			"json" => Ok(LogFormat::Json),
			other => Err(format!("unknown log format '{other}'")),
		}
	}
}

/// Build the filter: `RUST_LOG` when set, otherwise `default_filter`.
pub fn env_filter(default_filter: &str) -> Result<EnvFilter, TelemetryError> {
	match EnvFilter::try_from_default_env() {
		Ok(filter) => Ok(filter),
		Err(_) => parse_filter(default_filter),
	}
}

fn parse_filter(directives: &str) -> Result<EnvFilter, TelemetryError> {
	Ok(EnvFilter::try_new(directives)?)
}

/// Install a global `tracing` subscriber writing to stdout.
pub fn init(default_filter: &str, format: LogFormat) -> Result<(), TelemetryError> {
	let filter = env_filter(default_filter)?;
	let layer = match format {
		LogFormat::Text => tracing_subscriber::fmt::layer()
			.with_target(true)
			.with_filter(filter)
			.boxed(),
		LogFormat::Json => tracing_subscriber::fmt::layer()
			.json()
			.with_current_span(true)
			.with_target(true)
			.with_filter(filter)
			.boxed(),
	};
	tracing_subscriber::registry().with(layer).try_init()?;
	Ok(())
}
