//! Coordinator protocol messages.
//!
//! The domain types here mirror the generated gRPC messages one to one;
//! conversions live next to them so the rest of the crate never touches the
//! generated code.

use std::fmt;

use crate::identity::ServiceIdentity;

#[allow(warnings)]
#[warn(clippy::derive_partial_eq_without_eq)]
// Tonic generates the nested package layout, so build the module structure it
// expects and re-export a flat module.
pub mod org {
	pub mod apache {
		pub mod servicecomb {
			pub mod pack {
				pub mod contract {
					pub mod grpc {
						tonic::include_proto!("org.apache.servicecomb.pack.contract.grpc");
					}
				}
			}
		}
	}
}
pub mod proto {
	pub use super::org::apache::servicecomb::pack::contract::grpc::*;
}

/// Lifecycle event types understood by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
	SagaStarted,
	SagaEnded,
	TxStarted,
	TxEnded,
	TxAborted,
	TxCompensated,
}

impl EventType {
	/// Wire name of the event type.
	pub fn as_str(&self) -> &'static str {
		match self {
			EventType::SagaStarted => "SagaStartedEvent",
			EventType::SagaEnded => "SagaEndedEvent",
			EventType::TxStarted => "TxStartedEvent",
			EventType::TxEnded => "TxEndedEvent",
			EventType::TxAborted => "TxAbortedEvent",
			EventType::TxCompensated => "TxCompensatedEvent",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		Some(match s {
			"SagaStartedEvent" => EventType::SagaStarted,
			"SagaEndedEvent" => EventType::SagaEnded,
			"TxStartedEvent" => EventType::TxStarted,
			"TxEndedEvent" => EventType::TxEnded,
			"TxAbortedEvent" => EventType::TxAborted,
			"TxCompensatedEvent" => EventType::TxCompensated,
			_ => return None,
		})
	}
}

impl fmt::Display for EventType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Outbound lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEvent {
	pub service_name: String,
	pub instance_id: String,
	pub timestamp_millis: i64,
	pub global_tx_id: String,
	pub local_tx_id: String,
	pub parent_tx_id: String,
	pub event_type: EventType,
	pub timeout_seconds: i32,
	pub compensation_method: String,
	/// Reserved by the protocol, never populated
	pub retry_method: String,
	/// Reserved by the protocol, never populated
	pub retries: i32,
	pub payload: Vec<u8>,
}

impl TxEvent {
	/// An event stamped with the current time and no optional fields set.
	pub fn new(
		identity: &ServiceIdentity,
		event_type: EventType,
		global_tx_id: impl Into<String>,
		local_tx_id: impl Into<String>,
	) -> Self {
		Self {
			service_name: identity.service_name.clone(),
			instance_id: identity.instance_id.clone(),
			timestamp_millis: chrono::Utc::now().timestamp_millis(),
			global_tx_id: global_tx_id.into(),
			local_tx_id: local_tx_id.into(),
			parent_tx_id: String::new(),
			event_type,
			timeout_seconds: 0,
			compensation_method: String::new(),
			retry_method: String::new(),
			retries: 0,
			payload: Vec::new(),
		}
	}

	pub fn with_parent_tx_id(mut self, parent_tx_id: impl Into<String>) -> Self {
		self.parent_tx_id = parent_tx_id.into();
		self
	}

	pub fn with_timeout_seconds(mut self, timeout_seconds: i32) -> Self {
		self.timeout_seconds = timeout_seconds;
		self
	}

	pub fn with_compensation_method(mut self, method: impl Into<String>) -> Self {
		self.compensation_method = method.into();
		self
	}

	pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
		self.payload = payload;
		self
	}
}

impl From<TxEvent> for proto::GrpcTxEvent {
	fn from(e: TxEvent) -> Self {
		proto::GrpcTxEvent {
			timestamp: e.timestamp_millis,
			global_tx_id: e.global_tx_id,
			local_tx_id: e.local_tx_id,
			parent_tx_id: e.parent_tx_id,
			r#type: e.event_type.as_str().to_string(),
			compensation_method: e.compensation_method,
			payloads: e.payload,
			service_name: e.service_name,
			instance_id: e.instance_id,
			timeout: e.timeout_seconds,
			retries: e.retries,
			retry_method: e.retry_method,
		}
	}
}

impl TryFrom<proto::GrpcTxEvent> for TxEvent {
	type Error = String;

	fn try_from(e: proto::GrpcTxEvent) -> Result<Self, Self::Error> {
		let event_type =
			EventType::parse(&e.r#type).ok_or_else(|| format!("unknown event type: {}", e.r#type))?;
		Ok(TxEvent {
			service_name: e.service_name,
			instance_id: e.instance_id,
			timestamp_millis: e.timestamp,
			global_tx_id: e.global_tx_id,
			local_tx_id: e.local_tx_id,
			parent_tx_id: e.parent_tx_id,
			event_type,
			timeout_seconds: e.timeout,
			compensation_method: e.compensation_method,
			retry_method: e.retry_method,
			retries: e.retries,
			payload: e.payloads,
		})
	}
}

/// Inbound instruction to run a compensating function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensateCommand {
	pub global_tx_id: String,
	pub local_tx_id: String,
	pub parent_tx_id: String,
	pub compensation_method: String,
	pub payload: Vec<u8>,
}

impl From<proto::GrpcCompensateCommand> for CompensateCommand {
	fn from(c: proto::GrpcCompensateCommand) -> Self {
		CompensateCommand {
			global_tx_id: c.global_tx_id,
			local_tx_id: c.local_tx_id,
			parent_tx_id: c.parent_tx_id,
			compensation_method: c.compensation_method,
			payload: c.payloads,
		}
	}
}

impl From<CompensateCommand> for proto::GrpcCompensateCommand {
	fn from(c: CompensateCommand) -> Self {
		proto::GrpcCompensateCommand {
			global_tx_id: c.global_tx_id,
			local_tx_id: c.local_tx_id,
			parent_tx_id: c.parent_tx_id,
			compensation_method: c.compensation_method,
			payloads: c.payload,
		}
	}
}

impl From<&ServiceIdentity> for proto::GrpcServiceConfig {
	fn from(identity: &ServiceIdentity) -> Self {
		proto::GrpcServiceConfig {
			service_name: identity.service_name.clone(),
			instance_id: identity.instance_id.clone(),
		}
	}
}

impl From<proto::GrpcServiceConfig> for ServiceIdentity {
	fn from(config: proto::GrpcServiceConfig) -> Self {
		ServiceIdentity::new(config.service_name, config.instance_id)
	}
}

/// Cut `text` to at most `max_len` bytes without splitting a character.
pub fn truncate_payload(text: &str, max_len: usize) -> &str {
	if text.len() <= max_len {
		return text;
	}
	let mut end = max_len;
	while !text.is_char_boundary(end) {
		end -= 1;
	}
	&text[..end]
}
