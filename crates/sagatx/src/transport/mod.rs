// Coordinator transport
//
// The client talks to the coordinator through two seams: a connector that
// dials and a session that carries calls over one live connection. The gRPC
// implementation lives in `grpc`; tests plug in in-memory sessions.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::TransportError;
use crate::identity::ServiceIdentity;
use crate::protocol::{CompensateCommand, TxEvent};

mod client;
mod grpc;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::TransportClient;
pub use grpc::GrpcConnector;

/// Server-pushed compensate commands for one subscription.
pub type CommandStream = BoxStream<'static, Result<CompensateCommand, TransportError>>;

/// Establishes sessions with the coordinator.
#[async_trait]
pub trait CoordinatorConnector: Send + Sync {
	async fn connect(&self) -> Result<Arc<dyn CoordinatorSession>, TransportError>;
}

/// Calls available on one live connection.
#[async_trait]
pub trait CoordinatorSession: Send + Sync {
	/// Register this instance and subscribe to its compensate commands.
	async fn on_connected(&self, identity: &ServiceIdentity) -> Result<CommandStream, TransportError>;

	async fn on_disconnected(&self, identity: &ServiceIdentity) -> Result<(), TransportError>;

	/// Deliver a lifecycle event. Returns the `aborted` flag of the ack.
	async fn on_tx_event(&self, event: TxEvent) -> Result<bool, TransportError>;
}
