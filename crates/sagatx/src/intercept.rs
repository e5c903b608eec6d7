//! Function interception engine.
//!
//! A [`Decorated`] call runs in three phases:
//!
//! 1. [`Interceptor::before`] with a fresh [`CallMetadata`]. An error
//!    short-circuits the call: neither the target nor `after` run.
//! 2. The [`Target`] itself. Panics, in the synchronous part or while the
//!    returned future is polled, are converted into [`SagaError::Panicked`].
//! 3. [`Interceptor::after`], which always runs once `before` succeeded and
//!    sees the outcome recorded in the metadata. Its error replaces the
//!    call's result.
//!
//! Call arguments are a tuple `A`, so targets of any arity share one shape:
//! `Fn(ContextCarrier, A) -> impl Future<Output = Result<O, E>>`.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use crate::context::ContextCarrier;
use crate::error::{BoxError, SagaError};

/// Per-invocation state shared between the hooks of one call.
pub struct CallMetadata<A> {
	label: Arc<str>,
	carrier: ContextCarrier,
	args: Option<A>,
	failure: Option<String>,
	parent_local_tx_id: Option<String>,
}

impl<A> CallMetadata<A> {
	pub fn new(label: Arc<str>, carrier: ContextCarrier, args: A) -> Self {
		Self {
			label,
			carrier,
			args: Some(args),
			failure: None,
			parent_local_tx_id: None,
		}
	}

	/// Label of the decorated function.
	pub fn label(&self) -> &str {
		&self.label
	}

	pub fn carrier(&self) -> &ContextCarrier {
		&self.carrier
	}

	/// Call arguments; only available until the target is invoked.
	pub fn args(&self) -> Option<&A> {
		self.args.as_ref()
	}

	/// Error text of the target outcome, if it failed.
	pub fn failure(&self) -> Option<&str> {
		self.failure.as_deref()
	}

	pub fn record_failure(&mut self, failure: impl Into<String>) {
		self.failure = Some(failure.into());
	}

	pub fn parent_local_tx_id(&self) -> Option<&str> {
		self.parent_local_tx_id.as_deref()
	}

	pub fn set_parent_local_tx_id(&mut self, id: impl Into<String>) {
		self.parent_local_tx_id = Some(id.into());
	}

	fn take_args(&mut self) -> Option<A> {
		self.args.take()
	}
}

/// Hooks wrapped around a target. Both phases are optional.
#[async_trait]
pub trait Interceptor<A: Send + 'static>: Send + Sync {
	async fn before(&self, _meta: &mut CallMetadata<A>) -> Result<(), SagaError> {
		Ok(())
	}

	async fn after(&self, _meta: &mut CallMetadata<A>) -> Result<(), SagaError> {
		Ok(())
	}
}

/// Interceptor with neither hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl<A: Send + 'static> Interceptor<A> for NoHooks {}

/// A function that can be decorated.
pub trait Target<A, O>: Send + Sync {
	fn invoke(&self, carrier: ContextCarrier, args: A) -> BoxFuture<'static, Result<O, BoxError>>;
}

impl<A, O, E, F, Fut> Target<A, O> for F
where
	F: Fn(ContextCarrier, A) -> Fut + Send + Sync,
	Fut: Future<Output = Result<O, E>> + Send + 'static,
	E: Into<BoxError>,
{
	fn invoke(&self, carrier: ContextCarrier, args: A) -> BoxFuture<'static, Result<O, BoxError>> {
		let fut = (self)(carrier, args);
		async move { fut.await.map_err(Into::into) }.boxed()
	}
}

/// A target wrapped with an interceptor.
pub struct Decorated<A, O, T, I> {
	label: Arc<str>,
	target: T,
	hooks: I,
	_marker: PhantomData<fn(A) -> O>,
}

impl<A, O, T, I> fmt::Debug for Decorated<A, O, T, I> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Decorated")
			.field("label", &self.label)
			.finish_non_exhaustive()
	}
}

impl<A, O, T, I> Decorated<A, O, T, I>
where
	A: Send + 'static,
	O: Send + 'static,
	T: Target<A, O>,
	I: Interceptor<A>,
{
	/// Wire `hooks` around `target`. Fails before any call is made when the
	/// label is empty.
	pub fn new(label: impl Into<String>, target: T, hooks: I) -> Result<Self, SagaError> {
		let label = validate_label(label.into())?;
		Ok(Self {
			label: label.into(),
			target,
			hooks,
			_marker: PhantomData,
		})
	}

	pub fn label(&self) -> &str {
		&self.label
	}

	pub fn hooks(&self) -> &I {
		&self.hooks
	}

	pub async fn call(&self, carrier: &ContextCarrier, args: A) -> Result<O, SagaError> {
		let mut meta = CallMetadata::new(self.label.clone(), carrier.clone(), args);

		if let Err(e) = self.hooks.before(&mut meta).await {
			debug!(label = %self.label, error = %e, "before hook short-circuited call");
			return Err(e);
		}

		let Some(args) = meta.take_args() else {
			return Err(SagaError::validation("call arguments were consumed by a hook"));
		};
		let target = &self.target;
		let carrier = meta.carrier.clone();
		let outcome = contain(move || target.invoke(carrier, args)).await;
		if let Err(e) = &outcome {
			meta.record_failure(e.to_string());
		}

		self.hooks.after(&mut meta).await?;
		outcome
	}
}

pub(crate) fn validate_label(label: String) -> Result<String, SagaError> {
	if label.trim().is_empty() {
		return Err(SagaError::validation("function label must not be empty"));
	}
	Ok(label)
}

/// Run a future-producing closure, turning panics into errors.
pub async fn contain<O, F>(start: F) -> Result<O, SagaError>
where
	F: FnOnce() -> BoxFuture<'static, Result<O, BoxError>>,
{
	let fut = match std::panic::catch_unwind(AssertUnwindSafe(start)) {
		Ok(fut) => fut,
		Err(payload) => return Err(SagaError::Panicked(panic_message(payload))),
	};
	match AssertUnwindSafe(fut).catch_unwind().await {
		Ok(result) => result.map_err(SagaError::from_boxed),
		Err(payload) => Err(SagaError::Panicked(panic_message(payload))),
	}
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"unknown panic".to_string()
	}
}
