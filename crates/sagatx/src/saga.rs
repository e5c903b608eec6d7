//! Saga orchestration.
//!
//! A [`SagaAgent`] decorates ordinary async functions with one of three
//! behaviours:
//!
//! * [`SagaAgent::saga_start`] opens a global transaction around the call and
//!   (with `auto_close`) closes it when the call returns.
//! * [`SagaAgent::saga_end`] closes a transaction opened elsewhere in the
//!   same call chain.
//! * [`SagaAgent::compensable`] runs the call as a sub-transaction under a
//!   fresh local id and registers the function the coordinator calls to undo
//!   it.
//!
//! ```ignore
//! let agent = SagaAgent::builder(config).build()?;
//! agent.connect().await?;
//!
//! let transfer_out = agent.compensable(
//! 	"transfer_out",
//! 	"cancel_transfer_out",
//! 	0,
//! 	transfer_out,
//! 	cancel_transfer_out,
//! )?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::config::AgentConfig;
use crate::context::{ContextCarrier, IdGenerator, TxContext, UuidGenerator};
use crate::error::{BoxError, SagaError};
use crate::identity::ServiceIdentity;
use crate::intercept::{CallMetadata, Decorated, Interceptor, Target, validate_label};
use crate::processor::CompensationProcessor;
use crate::serializer::{JsonSerializer, Serializer, to_args};
use crate::transport::{CoordinatorConnector, GrpcConnector, TransportClient};

/// Handle to the agent. Build once, clone into call sites.
#[derive(Clone)]
pub struct SagaAgent {
	inner: Arc<AgentInner>,
}

struct AgentInner {
	transport: TransportClient,
	processor: Arc<CompensationProcessor>,
	serializer: Arc<dyn Serializer>,
	ids: Arc<dyn IdGenerator>,
}

impl fmt::Debug for SagaAgent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SagaAgent")
			.field("transport", &self.inner.transport)
			.finish_non_exhaustive()
	}
}

pub struct SagaAgentBuilder {
	config: AgentConfig,
	identity: Option<ServiceIdentity>,
	connector: Option<Arc<dyn CoordinatorConnector>>,
	serializer: Option<Arc<dyn Serializer>>,
	ids: Option<Arc<dyn IdGenerator>>,
}

impl SagaAgentBuilder {
	/// Use `identity` instead of deriving it from the config and host.
	pub fn identity(mut self, identity: ServiceIdentity) -> Self {
		self.identity = Some(identity);
		self
	}

	/// Replace the gRPC connector.
	pub fn connector(mut self, connector: Arc<dyn CoordinatorConnector>) -> Self {
		self.connector = Some(connector);
		self
	}

	pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
		self.serializer = Some(serializer);
		self
	}

	pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
		self.ids = Some(ids);
		self
	}

	pub fn build(self) -> Result<SagaAgent, SagaError> {
		self
			.config
			.validate()
			.map_err(|e| SagaError::validation(e.to_string()))?;
		let identity = match self.identity {
			Some(identity) => identity,
			None => ServiceIdentity::from_config(&self.config)
				.map_err(|e| SagaError::validation(format!("service identity: {e}")))?,
		};
		let connector: Arc<dyn CoordinatorConnector> = match self.connector {
			Some(connector) => connector,
			None => Arc::new(GrpcConnector::new(
				&self.config.coordinator_address,
				self.config.communicate_timeout,
			)?),
		};
		let serializer = self.serializer.unwrap_or_else(|| Arc::new(JsonSerializer));
		let ids = self.ids.unwrap_or_else(|| Arc::new(UuidGenerator));
		let processor = Arc::new(CompensationProcessor::new(serializer.clone()));
		let transport = TransportClient::new(&self.config, identity, connector, processor.clone());
		Ok(SagaAgent {
			inner: Arc::new(AgentInner {
				transport,
				processor,
				serializer,
				ids,
			}),
		})
	}
}

impl SagaAgent {
	pub fn builder(config: AgentConfig) -> SagaAgentBuilder {
		SagaAgentBuilder {
			config,
			identity: None,
			connector: None,
			serializer: None,
			ids: None,
		}
	}

	/// Connect to the coordinator and start receiving compensate commands.
	pub async fn connect(&self) -> Result<(), SagaError> {
		Ok(self.inner.transport.connect().await?)
	}

	pub async fn shutdown(&self) {
		self.inner.transport.shutdown().await
	}

	/// Disconnect from the coordinator on SIGINT or SIGTERM.
	pub fn spawn_signal_handler(&self) -> tokio::task::JoinHandle<()> {
		self.inner.transport.spawn_signal_handler()
	}

	pub fn transport(&self) -> &TransportClient {
		&self.inner.transport
	}

	pub fn processor(&self) -> &Arc<CompensationProcessor> {
		&self.inner.processor
	}

	/// Decorate `target` as the start of a saga.
	///
	/// With `auto_close` the saga ends when the call returns and the context
	/// is cleared; otherwise the context stays installed for a later
	/// [`SagaAgent::saga_end`].
	pub fn saga_start<A, O, T>(
		&self,
		label: impl Into<String>,
		timeout_seconds: i32,
		auto_close: bool,
		target: T,
	) -> Result<Decorated<A, O, T, SagaStartHooks>, SagaError>
	where
		A: Send + 'static,
		O: Send + 'static,
		T: Target<A, O>,
	{
		Decorated::new(
			label,
			target,
			SagaStartHooks {
				agent: self.clone(),
				timeout_seconds,
				auto_close,
			},
		)
	}

	/// Decorate `target` as the end of a saga started earlier in the chain.
	pub fn saga_end<A, O, T>(
		&self,
		label: impl Into<String>,
		target: T,
	) -> Result<Decorated<A, O, T, SagaEndHooks>, SagaError>
	where
		A: Send + 'static,
		O: Send + 'static,
		T: Target<A, O>,
	{
		Decorated::new(label, target, SagaEndHooks {
			agent: self.clone(),
		})
	}

	/// Decorate `target` as a compensable sub-transaction and register
	/// `compensation` under `compensation_name`.
	///
	/// `compensation` takes the same arguments as `target`; the coordinator
	/// sends them back when it asks for compensation.
	pub fn compensable<A, O, T, C, CO, CE, CFut>(
		&self,
		label: impl Into<String>,
		compensation_name: impl Into<String>,
		timeout_seconds: i32,
		target: T,
		compensation: C,
	) -> Result<Decorated<A, O, T, CompensableHooks>, SagaError>
	where
		A: Serialize + DeserializeOwned + Send + 'static,
		O: Send + 'static,
		T: Target<A, O>,
		C: Fn(ContextCarrier, A) -> CFut + Send + Sync + 'static,
		CFut: Future<Output = Result<CO, CE>> + Send + 'static,
		CE: Into<BoxError>,
	{
		let compensation_name = validate_label(compensation_name.into())?;
		let decorated = Decorated::new(
			label,
			target,
			CompensableHooks {
				agent: self.clone(),
				compensation_name: compensation_name.clone(),
				timeout_seconds,
			},
		)?;
		self
			.inner
			.processor
			.register(compensation_name, compensation);
		Ok(decorated)
	}

	async fn report_aborted(
		&self,
		ctx: &TxContext,
		parent_tx_id: &str,
		label: &str,
		failure: &(dyn fmt::Display + Sync),
	) {
		if let Err(e) = self
			.transport()
			.send_tx_aborted_event(ctx, parent_tx_id, label, failure)
			.await
		{
			warn!(
				global_tx_id = %ctx.global_tx_id,
				local_tx_id = %ctx.local_tx_id,
				error = %e,
				"failed to report aborted transaction"
			);
		}
	}

	/// Report the end of the saga in `ctx`, or its failure.
	async fn close_saga(
		&self,
		ctx: &TxContext,
		label: &str,
		failure: Option<&str>,
	) -> Result<(), SagaError> {
		if let Some(failure) = failure {
			self.report_aborted(ctx, "", label, &failure).await;
			error!(global_tx_id = %ctx.global_tx_id, error = failure, "transaction failed");
			return Ok(());
		}
		match self.transport().send_saga_ended_event(ctx).await {
			Ok(false) => {
				debug!(global_tx_id = %ctx.global_tx_id, "transaction finished");
				Ok(())
			},
			Ok(true) => Err(SagaError::aborted(format!(
				"transaction {} is aborted",
				ctx.global_tx_id
			))),
			Err(e) => {
				self.report_aborted(ctx, "", label, &e).await;
				error!(global_tx_id = %ctx.global_tx_id, error = %e, "transaction failed");
				Err(e.into())
			},
		}
	}
}

/// Hooks of [`SagaAgent::saga_start`].
pub struct SagaStartHooks {
	agent: SagaAgent,
	timeout_seconds: i32,
	auto_close: bool,
}

#[async_trait]
impl<A: Send + 'static> Interceptor<A> for SagaStartHooks {
	async fn before(&self, meta: &mut CallMetadata<A>) -> Result<(), SagaError> {
		let carrier = meta.carrier();
		let ctx = carrier.initialize(self.agent.inner.ids.as_ref());
		let err = match self
			.agent
			.transport()
			.send_saga_started_event(&ctx, self.timeout_seconds)
			.await
		{
			Ok(false) => {
				debug!(context = %ctx, label = meta.label(), "initialized saga context");
				return Ok(());
			},
			Ok(true) => SagaError::aborted(format!("transaction {} is aborted", ctx.global_tx_id)),
			Err(e) => SagaError::from(e),
		};
		self.agent.report_aborted(&ctx, "", meta.label(), &err).await;
		carrier.clear();
		Err(err)
	}

	async fn after(&self, meta: &mut CallMetadata<A>) -> Result<(), SagaError> {
		let result = match meta.carrier().get() {
			Ok(ctx) if self.auto_close => {
				self
					.agent
					.close_saga(&ctx, meta.label(), meta.failure())
					.await
			},
			Ok(ctx) => {
				debug!(context = %ctx, "saga left open for a later saga end");
				Ok(())
			},
			Err(e) => {
				error!(label = meta.label(), "saga context missing at saga start exit");
				Err(e)
			},
		};
		if self.auto_close {
			meta.carrier().clear();
		}
		result
	}
}

/// Hooks of [`SagaAgent::saga_end`].
pub struct SagaEndHooks {
	agent: SagaAgent,
}

#[async_trait]
impl<A: Send + 'static> Interceptor<A> for SagaEndHooks {
	async fn after(&self, meta: &mut CallMetadata<A>) -> Result<(), SagaError> {
		let result = match meta.carrier().get() {
			Ok(ctx) => {
				self
					.agent
					.close_saga(&ctx, meta.label(), meta.failure())
					.await
			},
			Err(e) => {
				error!(label = meta.label(), "saga context missing at saga end");
				Err(e)
			},
		};
		meta.carrier().clear();
		result
	}
}

/// Hooks of [`SagaAgent::compensable`].
pub struct CompensableHooks {
	agent: SagaAgent,
	compensation_name: String,
	timeout_seconds: i32,
}

impl CompensableHooks {
	pub fn compensation_name(&self) -> &str {
		&self.compensation_name
	}

	fn encode<A: Serialize>(&self, args: Option<&A>) -> Result<Vec<u8>, SagaError> {
		let Some(args) = args else {
			return Ok(Vec::new());
		};
		let value = to_args(args)?;
		Ok(self.agent.inner.serializer.serialize(&value)?)
	}

	async fn finish(&self, ctx: &TxContext, parent: &str, label: &str, failure: Option<&str>) -> Result<(), SagaError> {
		if let Some(failure) = failure {
			self.agent.report_aborted(ctx, parent, label, &failure).await;
			error!(context = %ctx, error = failure, "sub transaction failed");
			return Ok(());
		}
		match self
			.agent
			.transport()
			.send_tx_ended_event(ctx, parent, &self.compensation_name)
			.await
		{
			Ok(false) => Ok(()),
			Ok(true) => Err(SagaError::aborted(format!("transaction {parent} is already aborted"))),
			Err(e) => {
				self.agent.report_aborted(ctx, parent, label, &e).await;
				error!(context = %ctx, error = %e, "sub transaction failed");
				Err(e.into())
			},
		}
	}
}

fn restore_local_tx_id(carrier: &ContextCarrier, parent: &str) {
	match carrier.set_local_tx_id(parent) {
		Ok(()) => debug!(local_tx_id = parent, "restored local transaction id"),
		Err(e) => warn!(error = %e, "could not restore local transaction id"),
	}
}

#[async_trait]
impl<A: Serialize + Send + 'static> Interceptor<A> for CompensableHooks {
	async fn before(&self, meta: &mut CallMetadata<A>) -> Result<(), SagaError> {
		let carrier = meta.carrier().clone();
		let parent = carrier.get()?.local_tx_id;
		meta.set_parent_local_tx_id(parent.clone());
		let ctx = carrier.new_local_tx_id(self.agent.inner.ids.as_ref())?;
		debug!(context = %ctx, label = meta.label(), "entering compensable call");

		let payload = match self.encode(meta.args()) {
			Ok(payload) => payload,
			Err(e) => {
				restore_local_tx_id(&carrier, &parent);
				return Err(e);
			},
		};

		let sent = self
			.agent
			.transport()
			.send_tx_started_event(
				&ctx,
				&parent,
				&self.compensation_name,
				self.timeout_seconds,
				payload,
			)
			.await;
		match sent {
			Ok(false) => Ok(()),
			Ok(true) => {
				restore_local_tx_id(&carrier, &parent);
				Err(SagaError::aborted(format!(
					"Abort sub transaction {} because global transaction {} has already aborted.",
					ctx.local_tx_id, ctx.global_tx_id
				)))
			},
			Err(e) => {
				restore_local_tx_id(&carrier, &parent);
				Err(e.into())
			},
		}
	}

	async fn after(&self, meta: &mut CallMetadata<A>) -> Result<(), SagaError> {
		let parent = meta.parent_local_tx_id().unwrap_or_default().to_string();
		let result = match meta.carrier().get() {
			Ok(ctx) => self.finish(&ctx, &parent, meta.label(), meta.failure()).await,
			Err(e) => Err(e),
		};
		restore_local_tx_id(meta.carrier(), &parent);
		result
	}
}
