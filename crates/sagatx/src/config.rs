//! Agent configuration.
//!
//! Configuration is usually loaded from YAML:
//!
//! ```yaml
//! serviceName: transfer-service
//! coordinatorAddress: 127.0.0.1:8080
//! communicateTimeout: 5s
//! reconnectDelay: 10s
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for every unary call and for connection establishment.
pub const DEFAULT_COMMUNICATE_TIMEOUT: Duration = Duration::from_secs(5);
/// Delay between reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);
/// Maximum number of bytes of error text carried in a TxAborted payload.
pub const DEFAULT_PAYLOAD_MAX_LENGTH: usize = 10240;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("failed to parse config: {0}")]
	Parse(#[from] serde_yaml::Error),

	#[error("failed to read config file: {0}")]
	Io(#[from] std::io::Error),

	#[error("invalid duration '{0}'")]
	InvalidDuration(String),

	#[error("invalid config: {0}")]
	Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentConfig {
	/// Name this service registers under with the coordinator
	pub service_name: String,

	/// `host:port` (or full `http://` URI) of the coordinator
	pub coordinator_address: String,

	/// Explicit instance id; derived from the host address when absent
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub instance_id: Option<String>,

	#[serde(default = "default_communicate_timeout", with = "serde_dur")]
	pub communicate_timeout: Duration,

	#[serde(default = "default_reconnect_delay", with = "serde_dur")]
	pub reconnect_delay: Duration,

	#[serde(default = "default_payload_max_length")]
	pub payload_max_length: usize,
}

fn default_communicate_timeout() -> Duration {
	DEFAULT_COMMUNICATE_TIMEOUT
}

fn default_reconnect_delay() -> Duration {
	DEFAULT_RECONNECT_DELAY
}

fn default_payload_max_length() -> usize {
	DEFAULT_PAYLOAD_MAX_LENGTH
}

impl AgentConfig {
	pub fn new(service_name: impl Into<String>, coordinator_address: impl Into<String>) -> Self {
		Self {
			service_name: service_name.into(),
			coordinator_address: coordinator_address.into(),
			instance_id: None,
			communicate_timeout: DEFAULT_COMMUNICATE_TIMEOUT,
			reconnect_delay: DEFAULT_RECONNECT_DELAY,
			payload_max_length: DEFAULT_PAYLOAD_MAX_LENGTH,
		}
	}

	pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
		self.instance_id = Some(instance_id.into());
		self
	}

	pub fn with_communicate_timeout(mut self, timeout: Duration) -> Self {
		self.communicate_timeout = timeout;
		self
	}

	pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
		self.reconnect_delay = delay;
		self
	}

	pub fn with_payload_max_length(mut self, len: usize) -> Self {
		self.payload_max_length = len;
		self
	}

	/// Parse and validate a YAML document.
	pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
		let config: AgentConfig = serde_yaml::from_str(yaml)?;
		config.validate()?;
		Ok(config)
	}

	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let content = fs_err::read_to_string(path.as_ref())?;
		Self::from_yaml(&content)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.service_name.trim().is_empty() {
			return Err(ConfigError::Invalid("serviceName must not be empty".into()));
		}
		if self.coordinator_address.trim().is_empty() {
			return Err(ConfigError::Invalid(
				"coordinatorAddress must not be empty".into(),
			));
		}
		if self.communicate_timeout.is_zero() {
			return Err(ConfigError::Invalid(
				"communicateTimeout must be positive".into(),
			));
		}
		if self.reconnect_delay.is_zero() {
			return Err(ConfigError::Invalid("reconnectDelay must be positive".into()));
		}
		if self.payload_max_length == 0 {
			return Err(ConfigError::Invalid(
				"payloadMaxLength must be positive".into(),
			));
		}
		Ok(())
	}
}

/// Parse a duration string like "500ms", "5s", "1m" or "1h". A bare number
/// is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
	let s = s.trim();
	if s.is_empty() {
		return Err(ConfigError::InvalidDuration(s.to_string()));
	}

	let (num_str, unit) = if let Some(n) = s.strip_suffix("ms") {
		(n, "ms")
	} else if let Some(n) = s.strip_suffix('s') {
		(n, "s")
	} else if let Some(n) = s.strip_suffix('m') {
		(n, "m")
	} else if let Some(n) = s.strip_suffix('h') {
		(n, "h")
	} else {
		(s, "s")
	};

	let num: u64 = num_str
		.parse()
		.map_err(|_| ConfigError::InvalidDuration(s.to_string()))?;

	Ok(match unit {
		"ms" => Duration::from_millis(num),
		"m" => Duration::from_secs(num * 60),
		"h" => Duration::from_secs(num * 60 * 60),
		_ => Duration::from_secs(num),
	})
}

fn format_duration(d: &Duration) -> String {
	let millis = d.as_millis();
	if millis % 1000 == 0 {
		format!("{}s", d.as_secs())
	} else {
		format!("{millis}ms")
	}
}

mod serde_dur {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&super::format_duration(d))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(d)?;
		super::parse_duration(&raw).map_err(serde::de::Error::custom)
	}
}
