//! Encoding of call arguments.
//!
//! Arguments travel to the coordinator inside TxStarted events and come back
//! in compensate commands. A call's arguments are a tuple, converted to a
//! [`serde_json::Value`] (an array for tuples of any arity) which a pluggable
//! [`Serializer`] turns into bytes.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::SerializationError;

/// Converts argument values to and from payload bytes.
pub trait Serializer: Send + Sync {
	fn serialize(&self, args: &Value) -> Result<Vec<u8>, SerializationError>;

	fn deserialize(&self, payload: &[u8]) -> Result<Value, SerializationError>;
}

/// Default serializer writing arguments as compact JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
	fn serialize(&self, args: &Value) -> Result<Vec<u8>, SerializationError> {
		serde_json::to_vec(args).map_err(|e| SerializationError::Encode(e.to_string()))
	}

	fn deserialize(&self, payload: &[u8]) -> Result<Value, SerializationError> {
		serde_json::from_slice(payload).map_err(|e| SerializationError::Decode(e.to_string()))
	}
}

/// Lift typed call arguments into the dynamic representation.
pub fn to_args<A: Serialize>(args: &A) -> Result<Value, SerializationError> {
	serde_json::to_value(args).map_err(|e| SerializationError::Encode(e.to_string()))
}

/// Recover typed call arguments from the dynamic representation.
pub fn from_args<A: DeserializeOwned>(args: Value) -> Result<A, SerializationError> {
	serde_json::from_value(args).map_err(|e| SerializationError::Decode(e.to_string()))
}
