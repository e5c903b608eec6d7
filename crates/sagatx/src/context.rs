//! Transaction context propagation.
//!
//! A [`ContextCarrier`] is the slot holding the active [`TxContext`] for one
//! logical call chain. It is passed explicitly through decorated calls, the
//! same way a cancellation token is, so a chain keeps its context no matter
//! which worker thread polls it. Clones share the same slot.

use std::fmt;
use std::sync::Arc;

use http::HeaderMap;
use http::header::HeaderValue;
use parking_lot::Mutex;

use crate::error::SagaError;

/// Header carrying the global transaction id between processes
pub const GLOBAL_TX_ID_HEADER: &str = "x-pack-global-transaction-id";
/// Header carrying the local transaction id between processes
pub const LOCAL_TX_ID_HEADER: &str = "x-pack-local-transaction-id";

/// Identifiers of the saga and of the currently executing sub-transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxContext {
	pub global_tx_id: String,
	pub local_tx_id: String,
}

impl TxContext {
	pub fn new(global_tx_id: impl Into<String>, local_tx_id: impl Into<String>) -> Self {
		Self {
			global_tx_id: global_tx_id.into(),
			local_tx_id: local_tx_id.into(),
		}
	}
}

impl fmt::Display for TxContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{{globalTxId: {}, localTxId: {}}}",
			self.global_tx_id, self.local_tx_id
		)
	}
}

/// Source of transaction ids.
pub trait IdGenerator: Send + Sync {
	fn next_id(&self) -> String;
}

/// Generates random (v4) UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
	fn next_id(&self) -> String {
		uuid::Uuid::new_v4().to_string()
	}
}

/// Per call chain transaction context slot.
#[derive(Clone, Default)]
pub struct ContextCarrier {
	slot: Arc<Mutex<Option<TxContext>>>,
}

impl fmt::Debug for ContextCarrier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ContextCarrier")
			.field("context", &*self.slot.lock())
			.finish()
	}
}

impl ContextCarrier {
	pub fn new() -> Self {
		Self::default()
	}

	/// A carrier that already holds `ctx`.
	pub fn with_context(ctx: TxContext) -> Self {
		Self {
			slot: Arc::new(Mutex::new(Some(ctx))),
		}
	}

	/// Mint a new saga: fresh global id, local id equal to it.
	pub fn initialize(&self, ids: &dyn IdGenerator) -> TxContext {
		let global_tx_id = ids.next_id();
		let ctx = TxContext::new(global_tx_id.clone(), global_tx_id);
		*self.slot.lock() = Some(ctx.clone());
		ctx
	}

	/// Replace only the local id, returning the updated context.
	pub fn new_local_tx_id(&self, ids: &dyn IdGenerator) -> Result<TxContext, SagaError> {
		let mut slot = self.slot.lock();
		let ctx = slot.as_mut().ok_or(SagaError::NotFound)?;
		ctx.local_tx_id = ids.next_id();
		Ok(ctx.clone())
	}

	/// Overwrite the local id of the active context.
	pub fn set_local_tx_id(&self, local_tx_id: impl Into<String>) -> Result<(), SagaError> {
		let mut slot = self.slot.lock();
		let ctx = slot.as_mut().ok_or(SagaError::NotFound)?;
		ctx.local_tx_id = local_tx_id.into();
		Ok(())
	}

	pub fn get(&self) -> Result<TxContext, SagaError> {
		self.slot.lock().clone().ok_or(SagaError::NotFound)
	}

	pub fn is_active(&self) -> bool {
		self.slot.lock().is_some()
	}

	pub fn set(&self, ctx: TxContext) {
		*self.slot.lock() = Some(ctx);
	}

	/// Swap the slot's content, returning what was there before.
	pub fn replace(&self, ctx: Option<TxContext>) -> Option<TxContext> {
		std::mem::replace(&mut *self.slot.lock(), ctx)
	}

	pub fn clear(&self) {
		self.slot.lock().take();
	}

	/// Install a context from inbound headers unless one is already active.
	///
	/// Returns true when a context was installed.
	pub fn extract_from_headers(&self, headers: &HeaderMap) -> bool {
		let mut slot = self.slot.lock();
		if slot.is_some() {
			return false;
		}
		let Some(global_tx_id) = header_str(headers, GLOBAL_TX_ID_HEADER) else {
			return false;
		};
		let local_tx_id = header_str(headers, LOCAL_TX_ID_HEADER).unwrap_or_default();
		*slot = Some(TxContext::new(global_tx_id, local_tx_id));
		true
	}

	/// Copy the active context's ids into outbound headers.
	pub fn inject_into_headers(&self, headers: &mut HeaderMap) {
		let Some(ctx) = self.slot.lock().clone() else {
			return;
		};
		for (name, value) in [
			(GLOBAL_TX_ID_HEADER, ctx.global_tx_id),
			(LOCAL_TX_ID_HEADER, ctx.local_tx_id),
		] {
			match HeaderValue::from_str(&value) {
				Ok(v) => {
					headers.insert(name, v);
				},
				Err(e) => {
					tracing::warn!(header = name, error = %e, "transaction id is not a valid header value");
				},
			}
		}
	}
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
	headers
		.get(name)
		.and_then(|v| v.to_str().ok())
		.filter(|s| !s.is_empty())
		.map(|s| s.to_string())
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
	use std::sync::atomic::{AtomicU64, Ordering};

	use super::IdGenerator;

	/// Deterministic ids: `{prefix}-1`, `{prefix}-2`, ...
	#[derive(Debug)]
	pub struct SequentialIds {
		prefix: String,
		next: AtomicU64,
	}

	impl SequentialIds {
		pub fn new(prefix: impl Into<String>) -> Self {
			Self {
				prefix: prefix.into(),
				next: AtomicU64::new(1),
			}
		}
	}

	impl IdGenerator for SequentialIds {
		fn next_id(&self) -> String {
			format!("{}-{}", self.prefix, self.next.fetch_add(1, Ordering::Relaxed))
		}
	}
}
