#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Response, StatusCode};

use crate::server::endpoint::{AppRequest, BusResponse, Fallback};

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Default wrapped application: liveness and readiness probes, `404` for everything else.
#[derive(Clone, Default)]
pub struct HealthApp {
	state: HealthState,
}

impl HealthApp {
	pub fn new(state: HealthState) -> Self {
		Self { state }
	}
}

#[async_trait::async_trait]
impl Fallback for HealthApp {
	async fn call(&self, req: AppRequest) -> BusResponse {
		if req.method() != Method::GET {
			return plain(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
		}

		match req.uri().path() {
			"/healthz" => plain(StatusCode::OK, Bytes::from_static(b"ok")),
			"/readyz" if self.state.is_ready() => plain(StatusCode::OK, Bytes::from_static(b"ready")),
			"/readyz" => plain(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")),
			_ => plain(StatusCode::NOT_FOUND, Bytes::new()),
		}
	}
}

fn plain(status: StatusCode, body: Bytes) -> BusResponse {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp
}

#[cfg(test)]
mod tests {
	use http_body_util::{BodyExt as _, Empty};
	use hyper::Request;

	use super::*;
	use crate::server::endpoint::BoxError;

	fn get(method: Method, path: &str) -> AppRequest {
		Request::builder()
			.method(method)
			.uri(path)
			.body(Empty::<Bytes>::new().map_err(|never| -> BoxError { match never {} }).boxed_unsync())
			.unwrap()
	}

	#[tokio::test]
	async fn readiness_follows_state() {
		let state = HealthState::new();
		let app = HealthApp::new(state.clone());

		let resp = app.call(get(Method::GET, "/readyz")).await;
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

		state.mark_ready();
		let resp = app.call(get(Method::GET, "/readyz")).await;
		assert_eq!(resp.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn other_routes_and_methods() {
		let app = HealthApp::default();
		assert_eq!(app.call(get(Method::GET, "/healthz")).await.status(), StatusCode::OK);
		assert_eq!(app.call(get(Method::GET, "/nope")).await.status(), StatusCode::NOT_FOUND);
		assert_eq!(
			app.call(get(Method::POST, "/healthz")).await.status(),
			StatusCode::METHOD_NOT_ALLOWED
		);
	}
}
