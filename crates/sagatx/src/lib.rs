//! Client-side agent for Saga distributed transactions.
//!
//! Business functions are decorated through a [`SagaAgent`]; the agent
//! reports their lifecycle to a remote coordinator and runs registered
//! compensations when the coordinator asks for them.

pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod intercept;
pub mod middleware;
pub mod processor;
pub mod protocol;
pub mod saga;
pub mod serializer;
pub mod telemetry;
pub mod transport;

pub use config::AgentConfig;
pub use context::{ContextCarrier, IdGenerator, TxContext, UuidGenerator};
pub use error::{BoxError, SagaError, SerializationError, TransportError};
pub use identity::ServiceIdentity;
pub use intercept::{CallMetadata, Decorated, Interceptor, NoHooks, Target};
pub use middleware::SagaContextLayer;
pub use processor::{CompensationOutcome, CompensationProcessor};
pub use saga::{SagaAgent, SagaAgentBuilder};
pub use serializer::{JsonSerializer, Serializer};
pub use transport::TransportClient;
