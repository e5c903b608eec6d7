//! In-memory coordinator for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{CommandStream, CoordinatorConnector, CoordinatorSession};
use crate::error::TransportError;
use crate::identity::ServiceIdentity;
use crate::protocol::{CompensateCommand, EventType, TxEvent};

type EventRule = Box<dyn Fn(&TxEvent) -> bool + Send + Sync>;

#[derive(Default)]
struct State {
	attempts: AtomicUsize,
	connections: AtomicUsize,
	disconnects: AtomicUsize,
	failing_connects: AtomicUsize,
	connect_delay: Mutex<Duration>,
	subscribe_delay: Mutex<Duration>,
	events: Mutex<Vec<TxEvent>>,
	fail_rule: Mutex<Option<EventRule>>,
	abort_rule: Mutex<Option<EventRule>>,
	queued: Mutex<VecDeque<CompensateCommand>>,
	commands: Mutex<Option<mpsc::UnboundedSender<Result<CompensateCommand, TransportError>>>>,
	changed: Notify,
}

/// Records every event, answers acks by rule, and pushes commands on demand.
/// Acts as both connector and session.
#[derive(Clone, Default)]
pub struct MockCoordinator {
	state: Arc<State>,
}

impl MockCoordinator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Fail the next `n` connection attempts.
	pub fn fail_next_connects(&self, n: usize) {
		self.state.failing_connects.store(n, Ordering::SeqCst);
	}

	/// Make every event delivery fail with a transport error.
	pub fn fail_events(&self, fail: bool) {
		if fail {
			self.fail_when(|_| true);
		} else {
			self.state.fail_rule.lock().take();
		}
	}

	/// Fail delivery of the events `rule` matches; they are not recorded.
	pub fn fail_when(&self, rule: impl Fn(&TxEvent) -> bool + Send + Sync + 'static) {
		*self.state.fail_rule.lock() = Some(Box::new(rule));
	}

	/// Hold every later connection attempt for `delay` before answering.
	pub fn delay_connects(&self, delay: Duration) {
		*self.state.connect_delay.lock() = delay;
	}

	/// Hold every later subscription for `delay` before answering.
	pub fn delay_subscriptions(&self, delay: Duration) {
		*self.state.subscribe_delay.lock() = delay;
	}

	/// Ack with `aborted = true` whenever `rule` matches the event.
	pub fn abort_when(&self, rule: impl Fn(&TxEvent) -> bool + Send + Sync + 'static) {
		*self.state.abort_rule.lock() = Some(Box::new(rule));
	}

	pub fn attempts(&self) -> usize {
		self.state.attempts.load(Ordering::SeqCst)
	}

	pub fn connections(&self) -> usize {
		self.state.connections.load(Ordering::SeqCst)
	}

	pub fn disconnects(&self) -> usize {
		self.state.disconnects.load(Ordering::SeqCst)
	}

	pub fn events(&self) -> Vec<TxEvent> {
		self.state.events.lock().clone()
	}

	pub fn event_types(&self) -> Vec<EventType> {
		self.state.events.lock().iter().map(|e| e.event_type).collect()
	}

	/// Push a command to the current subscriber, or hold it until the next
	/// one subscribes.
	pub fn push_command(&self, command: CompensateCommand) {
		let sender = self.state.commands.lock().clone();
		match sender {
			Some(tx) => {
				if let Err(mpsc::error::SendError(Ok(command))) = tx.send(Ok(command)) {
					self.state.queued.lock().push_back(command);
				}
			},
			None => self.state.queued.lock().push_back(command),
		}
	}

	/// Fail the current command stream with `error`.
	pub fn break_stream(&self, error: TransportError) {
		if let Some(tx) = self.state.commands.lock().take() {
			let _ = tx.send(Err(error));
		}
	}

	/// End the current command stream.
	pub fn close_stream(&self) {
		self.state.commands.lock().take();
	}

	/// Wait until `n` subscriptions succeeded.
	pub async fn wait_for_connections(&self, n: usize) {
		self.wait_until(|c| c.connections() >= n).await
	}

	/// Wait until an event of type `t` has been recorded.
	pub async fn wait_for_event(&self, t: EventType) -> TxEvent {
		loop {
			let notified = self.state.changed.notified();
			if let Some(e) = self.events().into_iter().find(|e| e.event_type == t) {
				return e;
			}
			notified.await;
		}
	}

	async fn wait_until(&self, check: impl Fn(&Self) -> bool) {
		loop {
			let notified = self.state.changed.notified();
			if check(self) {
				return;
			}
			notified.await;
		}
	}
}

#[async_trait]
impl CoordinatorConnector for MockCoordinator {
	async fn connect(&self) -> Result<Arc<dyn CoordinatorSession>, TransportError> {
		self.state.attempts.fetch_add(1, Ordering::SeqCst);
		self.state.changed.notify_waiters();
		let delay = *self.state.connect_delay.lock();
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}
		let failing = self
			.state
			.failing_connects
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok();
		self.state.changed.notify_waiters();
		if failing {
			return Err(TransportError::Other("connection refused".into()));
		}
		Ok(Arc::new(self.clone()))
	}
}

#[async_trait]
impl CoordinatorSession for MockCoordinator {
	async fn on_connected(&self, _identity: &ServiceIdentity) -> Result<CommandStream, TransportError> {
		let delay = *self.state.subscribe_delay.lock();
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}
		let (tx, rx) = mpsc::unbounded_channel();
		*self.state.commands.lock() = Some(tx.clone());
		for command in self.state.queued.lock().drain(..) {
			let _ = tx.send(Ok(command));
		}
		self.state.connections.fetch_add(1, Ordering::SeqCst);
		self.state.changed.notify_waiters();
		Ok(UnboundedReceiverStream::new(rx).boxed())
	}

	async fn on_disconnected(&self, _identity: &ServiceIdentity) -> Result<(), TransportError> {
		self.state.disconnects.fetch_add(1, Ordering::SeqCst);
		self.state.changed.notify_waiters();
		Ok(())
	}

	async fn on_tx_event(&self, event: TxEvent) -> Result<bool, TransportError> {
		let failing = self
			.state
			.fail_rule
			.lock()
			.as_ref()
			.is_some_and(|rule| rule(&event));
		if failing {
			return Err(TransportError::Other("coordinator unavailable".into()));
		}
		let aborted = self
			.state
			.abort_rule
			.lock()
			.as_ref()
			.is_some_and(|rule| rule(&event));
		self.state.events.lock().push(event);
		self.state.changed.notify_waiters();
		Ok(aborted)
	}
}
