// Error taxonomy for the saga agent

use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by business functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by decorated calls and agent operations.
#[derive(Error, Debug)]
pub enum SagaError {
	/// Decoration-time misconfiguration, raised before any traffic is sent.
	#[error("invalid decoration: {0}")]
	Validation(String),

	#[error("transport error: {0}")]
	Transport(#[from] TransportError),

	/// The coordinator signalled that the transaction was aborted.
	#[error("{0}")]
	Aborted(String),

	#[error("serialization error: {0}")]
	Serialization(#[from] SerializationError),

	/// No transaction context is installed on the call chain.
	#[error("transaction context not found")]
	NotFound,

	/// The wrapped business function returned an error.
	#[error("{0}")]
	Target(BoxError),

	/// The wrapped business function panicked.
	#[error("call panicked: {0}")]
	Panicked(String),
}

impl SagaError {
	pub fn validation(message: impl Into<String>) -> Self {
		Self::Validation(message.into())
	}

	pub fn aborted(message: impl Into<String>) -> Self {
		Self::Aborted(message.into())
	}

	/// Recover a `SagaError` that was boxed by a nested decorated call.
	pub fn from_boxed(err: BoxError) -> Self {
		match err.downcast::<SagaError>() {
			Ok(saga) => *saga,
			Err(other) => Self::Target(other),
		}
	}

	pub fn is_aborted(&self) -> bool {
		matches!(self, Self::Aborted(_))
	}
}

/// Errors talking to the coordinator.
#[derive(Error, Debug)]
pub enum TransportError {
	#[error("invalid coordinator address '{address}': {message}")]
	InvalidAddress { address: String, message: String },

	#[error("failed to connect to coordinator: {0}")]
	Connect(#[from] tonic::transport::Error),

	#[error("coordinator returned status: {0}")]
	Status(#[from] tonic::Status),

	#[error("coordinator call timed out after {0:?}")]
	Timeout(Duration),

	#[error("not connected to coordinator")]
	NotConnected,

	#[error("command stream closed")]
	StreamClosed,

	#[error("transport error: {0}")]
	Other(String),
}

/// Errors encoding or decoding call arguments.
#[derive(Error, Debug)]
pub enum SerializationError {
	#[error("encode args failed: {0}")]
	Encode(String),

	#[error("decode values failed: {0}")]
	Decode(String),
}
