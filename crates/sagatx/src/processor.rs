//! Compensation registry and dispatch.
//!
//! Compensating functions are registered by name when a compensable function
//! is decorated. When the coordinator asks for compensation, the payload is
//! decoded back into the call arguments and the function runs under
//! the transaction identity named by the coordinator.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::context::{ContextCarrier, TxContext};
use crate::error::{BoxError, SagaError};
use crate::intercept::contain;
use crate::serializer::{Serializer, from_args};

type CompensationFn =
	Arc<dyn Fn(ContextCarrier, Value) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// What happened to a compensate command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationOutcome {
	/// The compensating function ran and succeeded.
	Compensated,
	/// The compensating function returned an error or panicked.
	Failed(String),
	/// No function is registered under the requested name. The coordinator
	/// is not told about this.
	Unregistered,
	/// The payload could not be decoded; the command was abandoned.
	Undecodable(String),
}

pub struct CompensationProcessor {
	serializer: Arc<dyn Serializer>,
	funcs: RwLock<HashMap<String, CompensationFn>>,
}

impl CompensationProcessor {
	pub fn new(serializer: Arc<dyn Serializer>) -> Self {
		Self {
			serializer,
			funcs: RwLock::new(HashMap::new()),
		}
	}

	pub fn serializer(&self) -> &Arc<dyn Serializer> {
		&self.serializer
	}

	/// Register `f` under `name`. A later registration for the same name
	/// replaces the earlier one.
	pub fn register<A, O, E, F, Fut>(&self, name: impl Into<String>, f: F)
	where
		A: DeserializeOwned + Send + 'static,
		F: Fn(ContextCarrier, A) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<O, E>> + Send + 'static,
		E: Into<BoxError>,
	{
		let name = name.into();
		let f = Arc::new(f);
		let erased: CompensationFn = Arc::new(move |carrier: ContextCarrier, args: Value| {
			let f = f.clone();
			async move {
				let args: A = from_args(args).map_err(|e| Box::new(e) as BoxError)?;
				f(carrier, args).await.map(|_| ()).map_err(Into::into)
			}
			.boxed()
		});
		if self.funcs.write().insert(name.clone(), erased).is_some() {
			debug!(compensation_method = %name, "replaced compensation function");
		}
	}

	pub fn is_registered(&self, name: &str) -> bool {
		self.funcs.read().contains_key(name)
	}

	/// Run the compensation registered under `name`.
	///
	/// `carrier` is set to `{global_tx_id, local_tx_id}` for the duration of
	/// the call and restored to its previous content afterwards.
	pub async fn execute_compensate(
		&self,
		carrier: &ContextCarrier,
		global_tx_id: &str,
		local_tx_id: &str,
		name: &str,
		payload: &[u8],
	) -> CompensationOutcome {
		let args = match self.serializer.deserialize(payload) {
			Ok(args) => args,
			Err(e) => {
				error!(
					global_tx_id,
					local_tx_id,
					compensation_method = name,
					error = %e,
					"failed to decode compensation payload"
				);
				return CompensationOutcome::Undecodable(e.to_string());
			},
		};

		let Some(f) = self.funcs.read().get(name).cloned() else {
			warn!(
				global_tx_id,
				local_tx_id,
				compensation_method = name,
				"no compensation function registered"
			);
			return CompensationOutcome::Unregistered;
		};

		let previous = carrier.replace(Some(TxContext::new(global_tx_id, local_tx_id)));
		let call_carrier = carrier.clone();
		let result = contain(move || f(call_carrier, args)).await;
		carrier.replace(previous);

		match result {
			Ok(()) => {
				info!(global_tx_id, local_tx_id, compensation_method = name, "compensation succeeded");
				CompensationOutcome::Compensated
			},
			Err(e) => {
				error!(
					global_tx_id,
					local_tx_id,
					compensation_method = name,
					error = %e,
					"compensation failed"
				);
				CompensationOutcome::Failed(failure_text(&e))
			},
		}
	}
}

fn failure_text(e: &SagaError) -> String {
	e.to_string()
}
