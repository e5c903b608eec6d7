// In-process gRPC coordinator used by the integration tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use sagatx::protocol::proto::tx_event_service_server::{TxEventService, TxEventServiceServer};
use sagatx::protocol::proto::{GrpcAck, GrpcCompensateCommand, GrpcServiceConfig, GrpcTxEvent};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{Request, Response, Status};

type CommandSender = mpsc::Sender<Result<GrpcCompensateCommand, Status>>;

#[derive(Default)]
struct State {
	events: Mutex<Vec<GrpcTxEvent>>,
	subscribers: Mutex<Vec<(GrpcServiceConfig, CommandSender)>>,
	abort_method: Mutex<Option<String>>,
	disconnects: AtomicUsize,
	changed: Notify,
}

#[derive(Clone, Default)]
pub struct Coordinator {
	state: Arc<State>,
}

pub struct Running {
	pub addr: SocketAddr,
	stop: Option<oneshot::Sender<()>>,
}

impl Drop for Running {
	fn drop(&mut self) {
		if let Some(stop) = self.stop.take() {
			let _ = stop.send(());
		}
	}
}

impl Coordinator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Ack TxStarted events for `method` with `aborted = true`.
	pub fn abort_tx_started_for(&self, method: &str) {
		*self.state.abort_method.lock() = Some(method.to_string());
	}

	pub async fn start(&self) -> anyhow::Result<Running> {
		let listener = TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;
		let (stop, stopped) = oneshot::channel::<()>();
		let service = TxEventServiceServer::new(self.clone());
		tokio::spawn(async move {
			let _ = tonic::transport::Server::builder()
				.add_service(service)
				.serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
					let _ = stopped.await;
				})
				.await;
		});
		Ok(Running {
			addr,
			stop: Some(stop),
		})
	}

	pub fn events(&self) -> Vec<GrpcTxEvent> {
		self.state.events.lock().clone()
	}

	pub fn event_types(&self) -> Vec<String> {
		self.events().into_iter().map(|e| e.r#type).collect()
	}

	pub fn disconnects(&self) -> usize {
		self.state.disconnects.load(Ordering::SeqCst)
	}

	pub fn subscribers(&self) -> Vec<GrpcServiceConfig> {
		self
			.state
			.subscribers
			.lock()
			.iter()
			.map(|(config, _)| config.clone())
			.collect()
	}

	/// Send a compensate command to every subscriber.
	pub async fn compensate(&self, command: GrpcCompensateCommand) {
		let senders: Vec<CommandSender> = self
			.state
			.subscribers
			.lock()
			.iter()
			.map(|(_, tx)| tx.clone())
			.collect();
		for tx in senders {
			let _ = tx.send(Ok(command.clone())).await;
		}
	}

	pub async fn wait_for_subscribers(&self, n: usize) {
		loop {
			let notified = self.state.changed.notified();
			if self.state.subscribers.lock().len() >= n {
				return;
			}
			notified.await;
		}
	}

	pub async fn wait_for_event(&self, event_type: &str) -> GrpcTxEvent {
		loop {
			let notified = self.state.changed.notified();
			if let Some(e) = self.events().into_iter().find(|e| e.r#type == event_type) {
				return e;
			}
			notified.await;
		}
	}
}

#[tonic::async_trait]
impl TxEventService for Coordinator {
	type OnConnectedStream = ReceiverStream<Result<GrpcCompensateCommand, Status>>;

	async fn on_connected(
		&self,
		request: Request<GrpcServiceConfig>,
	) -> Result<Response<Self::OnConnectedStream>, Status> {
		let (tx, rx) = mpsc::channel(16);
		self.state.subscribers.lock().push((request.into_inner(), tx));
		self.state.changed.notify_waiters();
		Ok(Response::new(ReceiverStream::new(rx)))
	}

	async fn on_tx_event(&self, request: Request<GrpcTxEvent>) -> Result<Response<GrpcAck>, Status> {
		let event = request.into_inner();
		let aborted = event.r#type == "TxStartedEvent"
			&& self.state.abort_method.lock().as_deref() == Some(event.compensation_method.as_str());
		self.state.events.lock().push(event);
		self.state.changed.notify_waiters();
		Ok(Response::new(GrpcAck { aborted }))
	}

	async fn on_disconnected(
		&self,
		_request: Request<GrpcServiceConfig>,
	) -> Result<Response<GrpcAck>, Status> {
		self.state.disconnects.fetch_add(1, Ordering::SeqCst);
		self.state.changed.notify_waiters();
		Ok(Response::new(GrpcAck { aborted: false }))
	}
}
