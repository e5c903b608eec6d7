// Inbound HTTP context extraction
//
// Services that take part in a saga receive the transaction ids in request
// headers. `SagaContextLayer` turns those headers into a `ContextCarrier`
// stored in the request extensions, where handlers pick it up and pass it to
// decorated calls.

use std::task::{Context, Poll};

use http::Request;
use tower::{Layer, Service};
use tracing::debug;

use crate::context::ContextCarrier;

#[derive(Debug, Clone, Copy, Default)]
pub struct SagaContextLayer;

impl SagaContextLayer {
	pub fn new() -> Self {
		Self
	}
}

impl<S> Layer<S> for SagaContextLayer {
	type Service = SagaContext<S>;

	fn layer(&self, inner: S) -> Self::Service {
		SagaContext { inner }
	}
}

#[derive(Debug, Clone)]
pub struct SagaContext<S> {
	inner: S,
}

impl<S, B> Service<Request<B>> for SagaContext<S>
where
	S: Service<Request<B>>,
{
	type Response = S::Response;
	type Error = S::Error;
	type Future = S::Future;

	fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		self.inner.poll_ready(cx)
	}

	fn call(&mut self, mut req: Request<B>) -> Self::Future {
		// An outer layer may already have attached a carrier.
		let carrier = req
			.extensions()
			.get::<ContextCarrier>()
			.cloned()
			.unwrap_or_default();
		if carrier.extract_from_headers(req.headers()) {
			debug!(context = ?carrier, "extracted saga context from request headers");
		}
		req.extensions_mut().insert(carrier);
		self.inner.call(req)
	}
}

/// The carrier attached by [`SagaContextLayer`], or an empty one.
pub fn request_carrier<B>(req: &Request<B>) -> ContextCarrier {
	req
		.extensions()
		.get::<ContextCarrier>()
		.cloned()
		.unwrap_or_default()
}
