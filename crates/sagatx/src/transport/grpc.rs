use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use super::{CommandStream, CoordinatorConnector, CoordinatorSession};
use crate::error::TransportError;
use crate::identity::ServiceIdentity;
use crate::protocol::proto::tx_event_service_client::TxEventServiceClient;
use crate::protocol::proto::{GrpcServiceConfig, GrpcTxEvent};
use crate::protocol::{CompensateCommand, TxEvent};

/// Dials the coordinator's `TxEventService` over gRPC.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
	endpoint: Endpoint,
	timeout: Duration,
}

impl GrpcConnector {
	/// `address` is `host:port` or a full URI. Every connect and unary call is
	/// bounded by `timeout`.
	pub fn new(address: &str, timeout: Duration) -> Result<Self, TransportError> {
		let uri = if address.contains("://") {
			address.to_string()
		} else {
			format!("http://{address}")
		};
		let endpoint = Endpoint::from_shared(uri).map_err(|e| TransportError::InvalidAddress {
			address: address.to_string(),
			message: e.to_string(),
		})?;
		Ok(Self {
			endpoint: endpoint.connect_timeout(timeout),
			timeout,
		})
	}
}

#[async_trait]
impl CoordinatorConnector for GrpcConnector {
	async fn connect(&self) -> Result<Arc<dyn CoordinatorSession>, TransportError> {
		debug!(uri = %self.endpoint.uri(), "dialing coordinator");
		let channel = self.endpoint.connect().await?;
		Ok(Arc::new(GrpcSession {
			client: TxEventServiceClient::new(channel),
			timeout: self.timeout,
		}))
	}
}

struct GrpcSession {
	client: TxEventServiceClient<Channel>,
	timeout: Duration,
}

impl GrpcSession {
	async fn bounded<T, F>(&self, call: F) -> Result<T, TransportError>
	where
		F: Future<Output = Result<tonic::Response<T>, tonic::Status>>,
	{
		match tokio::time::timeout(self.timeout, call).await {
			Ok(res) => Ok(res?.into_inner()),
			Err(_) => Err(TransportError::Timeout(self.timeout)),
		}
	}
}

#[async_trait]
impl CoordinatorSession for GrpcSession {
	async fn on_connected(&self, identity: &ServiceIdentity) -> Result<CommandStream, TransportError> {
		let mut client = self.client.clone();
		let streaming = self
			.bounded(client.on_connected(GrpcServiceConfig::from(identity)))
			.await?;
		Ok(
			streaming
				.map(|item| item.map(CompensateCommand::from).map_err(TransportError::from))
				.boxed(),
		)
	}

	async fn on_disconnected(&self, identity: &ServiceIdentity) -> Result<(), TransportError> {
		let mut client = self.client.clone();
		self
			.bounded(client.on_disconnected(GrpcServiceConfig::from(identity)))
			.await?;
		Ok(())
	}

	async fn on_tx_event(&self, event: TxEvent) -> Result<bool, TransportError> {
		let mut client = self.client.clone();
		let ack = self.bounded(client.on_tx_event(GrpcTxEvent::from(event))).await?;
		Ok(ack.aborted)
	}
}
