// Transport client: event delivery, command reception and reconnection

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CommandStream, CoordinatorConnector, CoordinatorSession};
use crate::config::AgentConfig;
use crate::context::{ContextCarrier, TxContext};
use crate::error::TransportError;
use crate::identity::ServiceIdentity;
use crate::processor::CompensationProcessor;
use crate::protocol::{CompensateCommand, EventType, TxEvent, truncate_payload};

/// Client side of the coordinator protocol.
///
/// Cloning is cheap; all clones share one connection, one reconnect
/// scheduler and one shutdown token.
#[derive(Clone)]
pub struct TransportClient {
	inner: Arc<Inner>,
}

/// One live session, tagged so stale receive loops can recognise that they
/// were superseded. `cancel` stops the session's receive loop.
struct Connection {
	session: Arc<dyn CoordinatorSession>,
	generation: u64,
	cancel: CancellationToken,
}

struct Inner {
	address: String,
	identity: ServiceIdentity,
	connector: Arc<dyn CoordinatorConnector>,
	processor: Arc<CompensationProcessor>,
	communicate_timeout: Duration,
	reconnect_delay: Duration,
	payload_max_length: usize,
	connection: ArcSwapOption<Connection>,
	generation: AtomicU64,
	reconnect_tx: mpsc::Sender<()>,
	reconnect_rx: Mutex<Option<mpsc::Receiver<()>>>,
	shutdown: CancellationToken,
}

impl fmt::Debug for TransportClient {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TransportClient")
			.field("address", &self.inner.address)
			.field("identity", &self.inner.identity)
			.field("connected", &self.is_connected())
			.finish()
	}
}

impl TransportClient {
	pub fn new(
		config: &AgentConfig,
		identity: ServiceIdentity,
		connector: Arc<dyn CoordinatorConnector>,
		processor: Arc<CompensationProcessor>,
	) -> Self {
		// A single slot: a pending reconnect absorbs every further request.
		let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
		Self {
			inner: Arc::new(Inner {
				address: config.coordinator_address.clone(),
				identity,
				connector,
				processor,
				communicate_timeout: config.communicate_timeout,
				reconnect_delay: config.reconnect_delay,
				payload_max_length: config.payload_max_length,
				connection: ArcSwapOption::empty(),
				generation: AtomicU64::new(0),
				reconnect_tx,
				reconnect_rx: Mutex::new(Some(reconnect_rx)),
				shutdown: CancellationToken::new(),
			}),
		}
	}

	pub fn identity(&self) -> &ServiceIdentity {
		&self.inner.identity
	}

	pub fn is_connected(&self) -> bool {
		self.inner.connection.load().is_some()
	}

	pub fn is_shutdown(&self) -> bool {
		self.inner.shutdown.is_cancelled()
	}

	/// Token cancelled once the client shuts down.
	pub fn shutdown_token(&self) -> CancellationToken {
		self.inner.shutdown.clone()
	}

	/// Connect, subscribe to compensate commands and start the background
	/// tasks. An existing session is replaced and told to disconnect.
	pub async fn connect(&self) -> Result<(), TransportError> {
		if self.is_shutdown() {
			return Err(shut_down());
		}
		let scheduler = self.inner.reconnect_rx.lock().take();
		if let Some(tasks) = scheduler {
			tokio::spawn(self.inner.clone().run_scheduler(tasks));
		}
		info!(address = %self.inner.address, "connecting to coordinator");
		self.inner.establish().await
	}

	/// Send OnDisconnected (best effort) and stop all background tasks.
	/// Later calls are no-ops.
	pub async fn shutdown(&self) {
		if self.inner.shutdown.is_cancelled() {
			return;
		}
		self.inner.shutdown.cancel();
		if let Some(conn) = self.inner.connection.swap(None) {
			self.inner.retire(&conn).await;
		}
		info!(address = %self.inner.address, "transport client shut down");
	}

	/// Call [`TransportClient::shutdown`] on SIGINT or SIGTERM.
	pub fn spawn_signal_handler(&self) -> JoinHandle<()> {
		let client = self.clone();
		tokio::spawn(async move {
			tokio::select! {
				_ = client.inner.shutdown.cancelled() => return,
				_ = shutdown_signal() => {},
			}
			info!("shutdown signal received, disconnecting from coordinator");
			client.shutdown().await;
		})
	}

	pub async fn send_saga_started_event(
		&self,
		ctx: &TxContext,
		timeout_seconds: i32,
	) -> Result<bool, TransportError> {
		let event = self
			.event(EventType::SagaStarted, ctx)
			.with_timeout_seconds(timeout_seconds);
		self.inner.send(event).await
	}

	pub async fn send_saga_ended_event(&self, ctx: &TxContext) -> Result<bool, TransportError> {
		self.inner.send(self.event(EventType::SagaEnded, ctx)).await
	}

	pub async fn send_tx_started_event(
		&self,
		ctx: &TxContext,
		parent_tx_id: &str,
		compensation_method: &str,
		timeout_seconds: i32,
		payload: Vec<u8>,
	) -> Result<bool, TransportError> {
		let event = self
			.event(EventType::TxStarted, ctx)
			.with_parent_tx_id(parent_tx_id)
			.with_compensation_method(compensation_method)
			.with_timeout_seconds(timeout_seconds)
			.with_payload(payload);
		self.inner.send(event).await
	}

	pub async fn send_tx_ended_event(
		&self,
		ctx: &TxContext,
		parent_tx_id: &str,
		compensation_method: &str,
	) -> Result<bool, TransportError> {
		let event = self
			.event(EventType::TxEnded, ctx)
			.with_parent_tx_id(parent_tx_id)
			.with_compensation_method(compensation_method);
		self.inner.send(event).await
	}

	/// The error text becomes the payload, cut to the configured maximum.
	pub async fn send_tx_aborted_event(
		&self,
		ctx: &TxContext,
		parent_tx_id: &str,
		compensation_method: &str,
		error: &(dyn fmt::Display + Sync),
	) -> Result<bool, TransportError> {
		let text = error.to_string();
		let payload = truncate_payload(&text, self.inner.payload_max_length)
			.as_bytes()
			.to_vec();
		let event = self
			.event(EventType::TxAborted, ctx)
			.with_parent_tx_id(parent_tx_id)
			.with_compensation_method(compensation_method)
			.with_payload(payload);
		self.inner.send(event).await
	}

	pub async fn send_tx_compensated_event(
		&self,
		global_tx_id: &str,
		local_tx_id: &str,
		parent_tx_id: &str,
		compensation_method: &str,
	) -> Result<bool, TransportError> {
		self.inner
			.send_compensated(global_tx_id, local_tx_id, parent_tx_id, compensation_method)
			.await
	}

	fn event(&self, event_type: EventType, ctx: &TxContext) -> TxEvent {
		TxEvent::new(
			&self.inner.identity,
			event_type,
			ctx.global_tx_id.clone(),
			ctx.local_tx_id.clone(),
		)
	}
}

impl Inner {
	async fn establish(self: &Arc<Self>) -> Result<(), TransportError> {
		let session = tokio::select! {
			biased;
			_ = self.shutdown.cancelled() => return Err(shut_down()),
			session = self.connector.connect() => session?,
		};
		let commands = session.on_connected(&self.identity).await?;
		let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
		let cancel = self.shutdown.child_token();
		let previous = self.connection.swap(Some(Arc::new(Connection {
			session,
			generation,
			cancel: cancel.clone(),
		})));
		if let Some(previous) = previous {
			debug!(generation = previous.generation, "replacing coordinator session");
			self.retire(&previous).await;
		}
		// A shutdown that ran while subscribing never saw this session.
		if self.shutdown.is_cancelled() {
			if let Some(conn) = self.connection.swap(None) {
				self.retire(&conn).await;
			}
			return Err(shut_down());
		}
		info!(
			address = %self.address,
			service_name = %self.identity.service_name,
			instance_id = %self.identity.instance_id,
			generation,
			"connected to coordinator"
		);
		tokio::spawn(self.clone().receive_loop(generation, cancel, commands));
		Ok(())
	}

	/// Stop the session's receive loop and send OnDisconnected on it.
	async fn retire(&self, conn: &Connection) {
		conn.cancel.cancel();
		self.send_disconnected(conn).await;
	}

	async fn send(&self, event: TxEvent) -> Result<bool, TransportError> {
		let Some(conn) = self.connection.load_full() else {
			return Err(TransportError::NotConnected);
		};
		let event_type = event.event_type;
		debug!(
			event_type = %event_type,
			global_tx_id = %event.global_tx_id,
			local_tx_id = %event.local_tx_id,
			"sending event"
		);
		match tokio::time::timeout(self.communicate_timeout, conn.session.on_tx_event(event)).await {
			Ok(res) => res,
			Err(_) => Err(TransportError::Timeout(self.communicate_timeout)),
		}
	}

	async fn send_compensated(
		&self,
		global_tx_id: &str,
		local_tx_id: &str,
		parent_tx_id: &str,
		compensation_method: &str,
	) -> Result<bool, TransportError> {
		let event = TxEvent::new(
			&self.identity,
			EventType::TxCompensated,
			global_tx_id,
			local_tx_id,
		)
		.with_parent_tx_id(parent_tx_id)
		.with_compensation_method(compensation_method);
		self.send(event).await
	}

	async fn send_disconnected(&self, conn: &Connection) {
		let res =
			tokio::time::timeout(self.communicate_timeout, conn.session.on_disconnected(&self.identity))
				.await;
		match res {
			Ok(Ok(())) => debug!(generation = conn.generation, "sent disconnect"),
			Ok(Err(e)) => debug!(error = %e, "failed to send disconnect"),
			Err(_) => debug!("disconnect timed out"),
		}
	}

	async fn receive_loop(
		self: Arc<Self>,
		generation: u64,
		cancel: CancellationToken,
		mut commands: CommandStream,
	) {
		let failure = loop {
			let next = tokio::select! {
				biased;
				_ = cancel.cancelled() => return,
				next = commands.next() => next,
			};
			match next {
				Some(Ok(command)) => self.handle_command(command).await,
				Some(Err(e)) => break e,
				None => break TransportError::StreamClosed,
			}
		};
		if cancel.is_cancelled() {
			return;
		}
		error!(generation, error = %failure, "failed to receive compensate command");
		let current = self.connection.load().as_ref().map(|c| c.generation);
		if current == Some(generation) {
			self.request_reconnect();
		}
	}

	async fn handle_command(&self, command: CompensateCommand) {
		info!(
			global_tx_id = %command.global_tx_id,
			local_tx_id = %command.local_tx_id,
			compensation_method = %command.compensation_method,
			"received compensate command"
		);
		let carrier = ContextCarrier::new();
		self
			.processor
			.execute_compensate(
				&carrier,
				&command.global_tx_id,
				&command.local_tx_id,
				&command.compensation_method,
				&command.payload,
			)
			.await;
		if let Err(e) = self
			.send_compensated(
				&command.global_tx_id,
				&command.local_tx_id,
				&command.parent_tx_id,
				&command.compensation_method,
			)
			.await
		{
			warn!(
				global_tx_id = %command.global_tx_id,
				local_tx_id = %command.local_tx_id,
				error = %e,
				"failed to report compensation"
			);
		}
	}

	fn request_reconnect(&self) {
		match self.reconnect_tx.try_send(()) {
			Ok(()) => debug!("reconnect scheduled"),
			Err(mpsc::error::TrySendError::Full(())) => debug!("reconnect already pending"),
			Err(mpsc::error::TrySendError::Closed(())) => {},
		}
	}

	async fn run_scheduler(self: Arc<Self>, mut tasks: mpsc::Receiver<()>) {
		let mut idle = tokio::time::interval(self.reconnect_delay);
		idle.set_missed_tick_behavior(MissedTickBehavior::Skip);
		loop {
			tokio::select! {
				biased;
				_ = self.shutdown.cancelled() => {
					debug!("reconnect scheduler stopped");
					return;
				},
				Some(()) = tasks.recv() => self.reconnect().await,
				_ = idle.tick() => {},
			}
		}
	}

	async fn reconnect(self: &Arc<Self>) {
		info!(address = %self.address, "retry connecting to coordinator");
		if let Some(conn) = self.connection.swap(None) {
			self.retire(&conn).await;
		}
		match self.establish().await {
			Ok(()) => info!(address = %self.address, "reconnected to coordinator"),
			Err(_) if self.shutdown.is_cancelled() => debug!("reconnect abandoned on shutdown"),
			Err(e) => {
				error!(
					address = %self.address,
					error = %e,
					delay = ?self.reconnect_delay,
					"failed to reconnect to coordinator"
				);
				tokio::select! {
					_ = self.shutdown.cancelled() => return,
					_ = tokio::time::sleep(self.reconnect_delay) => {},
				}
				self.request_reconnect();
			},
		}
	}
}

fn shut_down() -> TransportError {
	TransportError::Other("client is shut down".into())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			error!("failed to listen for ctrl-c: {e}");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let term = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			},
			Err(e) => {
				error!("failed to register SIGTERM handler: {e}");
				std::future::pending::<()>().await;
			},
		}
	};
	#[cfg(not(unix))]
	let term = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = term => {},
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;
	use crate::error::BoxError;
	use crate::serializer::JsonSerializer;
	use crate::transport::testing::MockCoordinator;

	fn client_with(mock: &MockCoordinator, processor: Arc<CompensationProcessor>) -> TransportClient {
		let config = AgentConfig::new("transfer", "mock:0")
			.with_reconnect_delay(Duration::from_secs(10))
			.with_payload_max_length(16);
		TransportClient::new(
			&config,
			ServiceIdentity::new("transfer", "transfer-10.0.0.1"),
			Arc::new(mock.clone()),
			processor,
		)
	}

	fn client(mock: &MockCoordinator) -> TransportClient {
		client_with(mock, Arc::new(CompensationProcessor::new(Arc::new(JsonSerializer))))
	}

	#[tokio::test]
	async fn test_send_before_connect_is_not_connected() {
		let mock = MockCoordinator::new();
		let c = client(&mock);
		let err = c
			.send_saga_started_event(&TxContext::new("g", "g"), 0)
			.await
			.unwrap_err();
		assert_matches!(err, TransportError::NotConnected);
		assert!(mock.events().is_empty());
	}

	#[tokio::test]
	async fn test_event_fields() {
		let mock = MockCoordinator::new();
		let c = client(&mock);
		c.connect().await.unwrap();

		let ctx = TxContext::new("g1", "l2");
		assert!(!c.send_saga_started_event(&ctx, 30).await.unwrap());
		c.send_tx_started_event(&ctx, "l1", "cancel", 5, b"[1]".to_vec())
			.await
			.unwrap();
		c.send_tx_ended_event(&ctx, "l1", "cancel").await.unwrap();
		c.send_saga_ended_event(&ctx).await.unwrap();

		let events = mock.events();
		assert_eq!(
			mock.event_types(),
			vec![
				EventType::SagaStarted,
				EventType::TxStarted,
				EventType::TxEnded,
				EventType::SagaEnded
			]
		);
		assert_eq!(events[0].timeout_seconds, 30);
		assert_eq!(events[0].instance_id, "transfer-10.0.0.1");
		assert_eq!(events[1].parent_tx_id, "l1");
		assert_eq!(events[1].compensation_method, "cancel");
		assert_eq!(events[1].payload, b"[1]".to_vec());
		assert_eq!(events[2].payload, Vec::<u8>::new());
		assert_eq!(events[3].parent_tx_id, "");
	}

	#[tokio::test]
	async fn test_aborted_payload_is_truncated() {
		let mock = MockCoordinator::new();
		let c = client(&mock);
		c.connect().await.unwrap();

		let long = "x".repeat(100);
		c.send_tx_aborted_event(&TxContext::new("g", "l"), "p", "cancel", &long)
			.await
			.unwrap();
		let event = mock.wait_for_event(EventType::TxAborted).await;
		assert_eq!(event.payload.len(), 16);
	}

	#[tokio::test]
	async fn test_aborted_ack_is_returned() {
		let mock = MockCoordinator::new();
		mock.abort_when(|e| e.event_type == EventType::TxStarted);
		let c = client(&mock);
		c.connect().await.unwrap();
		let aborted = c
			.send_tx_started_event(&TxContext::new("g", "l"), "g", "m", 0, Vec::new())
			.await
			.unwrap();
		assert!(aborted);
	}

	#[tokio::test]
	async fn test_command_is_compensated_and_reported() {
		let mock = MockCoordinator::new();
		let processor = Arc::new(CompensationProcessor::new(Arc::new(JsonSerializer)));
		let calls = Arc::new(Mutex::new(Vec::new()));
		let record = calls.clone();
		processor.register("cancel", move |ctx: ContextCarrier, (amount,): (i64,)| {
			let record = record.clone();
			async move {
				record.lock().push((ctx.get()?, amount));
				Ok::<_, BoxError>(())
			}
		});
		let c = client_with(&mock, processor);
		c.connect().await.unwrap();

		mock.push_command(CompensateCommand {
			global_tx_id: "g1".into(),
			local_tx_id: "l2".into(),
			parent_tx_id: "l1".into(),
			compensation_method: "cancel".into(),
			payload: b"[100]".to_vec(),
		});

		let event = mock.wait_for_event(EventType::TxCompensated).await;
		assert_eq!(event.global_tx_id, "g1");
		assert_eq!(event.local_tx_id, "l2");
		assert_eq!(event.parent_tx_id, "l1");
		assert_eq!(event.compensation_method, "cancel");
		assert_eq!(calls.lock().clone(), vec![(TxContext::new("g1", "l2"), 100)]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_reconnects_after_stream_failure() {
		let mock = MockCoordinator::new();
		let c = client(&mock);
		c.connect().await.unwrap();
		assert_eq!(mock.attempts(), 1);

		let failures = 3;
		mock.fail_next_connects(failures);
		mock.break_stream(TransportError::Other("reset".into()));

		mock.wait_for_connections(2).await;
		assert_eq!(mock.attempts(), 1 + failures + 1);
		assert!(mock.disconnects() >= 1);
		assert!(c.is_connected());

		// commands flow on the new stream
		mock.push_command(CompensateCommand {
			global_tx_id: "g".into(),
			local_tx_id: "l".into(),
			parent_tx_id: "g".into(),
			compensation_method: "unknown".into(),
			payload: b"null".to_vec(),
		});
		let event = mock.wait_for_event(EventType::TxCompensated).await;
		assert_eq!(event.compensation_method, "unknown");
	}

	#[tokio::test(start_paused = true)]
	async fn test_stream_end_triggers_reconnect() {
		let mock = MockCoordinator::new();
		let c = client(&mock);
		c.connect().await.unwrap();
		mock.close_stream();
		mock.wait_for_connections(2).await;
		assert_eq!(mock.attempts(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn test_shutdown_stops_reconnects() {
		let mock = MockCoordinator::new();
		let c = client(&mock);
		c.connect().await.unwrap();

		c.shutdown().await;
		assert!(c.is_shutdown());
		assert!(!c.is_connected());
		assert_eq!(mock.disconnects(), 1);

		mock.close_stream();
		tokio::time::sleep(Duration::from_secs(60)).await;
		assert_eq!(mock.attempts(), 1);

		// idempotent
		c.shutdown().await;
		assert_eq!(mock.disconnects(), 1);
		assert!(c.connect().await.is_err());
	}

	#[tokio::test(start_paused = true)]
	async fn test_shutdown_during_slow_reconnect() {
		let mock = MockCoordinator::new();
		let c = client(&mock);
		c.connect().await.unwrap();

		mock.delay_connects(Duration::from_secs(2));
		mock.break_stream(TransportError::Other("reset".into()));
		tokio::time::sleep(Duration::from_millis(500)).await;
		assert_eq!(mock.attempts(), 2);

		c.shutdown().await;
		tokio::time::sleep(Duration::from_secs(5)).await;
		assert!(!c.is_connected());
		assert_eq!(mock.connections(), 1);
		assert_eq!(mock.attempts(), 2);
		assert_eq!(mock.disconnects(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_shutdown_during_slow_subscription() {
		let mock = MockCoordinator::new();
		let c = client(&mock);
		c.connect().await.unwrap();

		mock.delay_subscriptions(Duration::from_secs(2));
		mock.break_stream(TransportError::Other("reset".into()));
		tokio::time::sleep(Duration::from_millis(500)).await;
		c.shutdown().await;
		assert_eq!(mock.disconnects(), 1);

		// the late subscription is disconnected instead of kept
		tokio::time::sleep(Duration::from_secs(5)).await;
		assert!(!c.is_connected());
		assert_eq!(mock.connections(), 2);
		assert_eq!(mock.disconnects(), 2);
		assert_eq!(mock.attempts(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn test_connect_again_replaces_session() {
		let mock = MockCoordinator::new();
		let c = client(&mock);
		c.connect().await.unwrap();
		c.connect().await.unwrap();
		assert!(c.is_connected());
		assert_eq!(mock.connections(), 2);
		assert_eq!(mock.disconnects(), 1);

		// the replaced stream ends without scheduling a reconnect
		tokio::time::sleep(Duration::from_secs(30)).await;
		assert_eq!(mock.attempts(), 2);

		mock.push_command(CompensateCommand {
			global_tx_id: "g".into(),
			local_tx_id: "l".into(),
			parent_tx_id: "g".into(),
			compensation_method: "unknown".into(),
			payload: b"null".to_vec(),
		});
		mock.wait_for_event(EventType::TxCompensated).await;
		tokio::time::sleep(Duration::from_secs(1)).await;
		assert_eq!(mock.event_types(), vec![EventType::TxCompensated]);
	}

	#[tokio::test]
	async fn test_initial_connect_failure_is_returned() {
		let mock = MockCoordinator::new();
		mock.fail_next_connects(1);
		let c = client(&mock);
		assert!(c.connect().await.is_err());
		assert!(!c.is_connected());
		c.connect().await.unwrap();
		assert!(c.is_connected());
	}
}
