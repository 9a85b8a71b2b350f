#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt as _, Full, LengthLimitError, Limited};
use hyper::header::{self, HeaderValue};
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use msgbus_domain::{ClientId, Message, MessageTargets};
use msgbus_protocol::routes::{self, client_id_segment};
use msgbus_protocol::{WireError, encode_messages, form_value, long_poll_disabled, parse_subscriptions, wire};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::auth::{AnonymousResolver, AuthContextResolver};
use crate::server::channel_log::ChannelLog;
use crate::server::connection_manager::{ConnectionManager, SessionToken};
use crate::server::session::{ClientSession, HoldOutcome, ResponseCompleter};

pub type BusResponse = Response<Full<Bytes>>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request handed to the wrapped application, body still unread.
pub type AppRequest = Request<UnsyncBoxBody<Bytes, BoxError>>;

/// The application wrapped by the bus; receives every request the bus does not handle.
///
/// Also used for the delegated diagnostics routes.
#[async_trait::async_trait]
pub trait Fallback: Send + Sync {
	async fn call(&self, req: AppRequest) -> BusResponse;
}

/// Wrapped application answering `404` to everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFoundApp;

#[async_trait::async_trait]
impl Fallback for NotFoundApp {
	async fn call(&self, _req: AppRequest) -> BusResponse {
		text_response(StatusCode::NOT_FOUND, "not found")
	}
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
	#[error("failed to read request body: {0}")]
	Body(String),

	#[error("channel log error: {0:#}")]
	Log(#[from] anyhow::Error),

	#[error(transparent)]
	Wire(#[from] WireError),
}

pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

/// Long-poll endpoint settings.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
	/// Hold connections at all; when off every poll is answered immediately.
	pub long_polling_enabled: bool,
	/// How long a held connection waits for a publish.
	pub long_polling_interval: Duration,
	/// Expose the unauthenticated debug publish route.
	pub allow_broadcast: bool,
	/// Largest poll or broadcast body read; larger ones get `413`.
	pub max_body_bytes: usize,
}

impl Default for EndpointConfig {
	fn default() -> Self {
		Self {
			long_polling_enabled: true,
			long_polling_interval: Duration::from_millis(25_000),
			allow_broadcast: false,
			max_body_bytes: DEFAULT_MAX_BODY_BYTES,
		}
	}
}

/// HTTP interception layer: serves `/message-bus/*` and passes everything else through.
#[derive(Clone)]
pub struct MessageBusService {
	cfg: EndpointConfig,
	log: Arc<dyn ChannelLog>,
	manager: ConnectionManager,
	auth: Arc<dyn AuthContextResolver>,
	app: Arc<dyn Fallback>,
	diagnostics: Option<Arc<dyn Fallback>>,
}

impl fmt::Debug for MessageBusService {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MessageBusService")
			.field("cfg", &self.cfg)
			.field("held", &self.manager.client_count())
			.field("diagnostics", &self.diagnostics.is_some())
			.finish()
	}
}

impl MessageBusService {
	pub fn new(cfg: EndpointConfig, log: Arc<dyn ChannelLog>, manager: ConnectionManager) -> Self {
		Self {
			cfg,
			log,
			manager,
			auth: Arc::new(AnonymousResolver),
			app: Arc::new(NotFoundApp),
			diagnostics: None,
		}
	}

	pub fn with_auth(mut self, auth: Arc<dyn AuthContextResolver>) -> Self {
		self.auth = auth;
		self
	}

	pub fn with_app(mut self, app: Arc<dyn Fallback>) -> Self {
		self.app = app;
		self
	}

	pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Fallback>) -> Self {
		self.diagnostics = Some(diagnostics);
		self
	}

	pub fn manager(&self) -> &ConnectionManager {
		&self.manager
	}

	pub fn log(&self) -> &Arc<dyn ChannelLog> {
		&self.log
	}

	/// Entry point for hyper: errors become `500` responses.
	pub async fn serve_request<B>(&self, req: Request<B>) -> Result<BusResponse, Infallible>
	where
		B: hyper::body::Body<Data = Bytes> + Send + 'static,
		B::Error: Into<BoxError>,
	{
		match self.handle(req).await {
			Ok(resp) => Ok(resp),
			Err(e) => {
				warn!(error = %e, "message bus request failed");
				Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
			}
		}
	}

	/// Route one request.
	pub async fn handle<B>(&self, req: Request<B>) -> Result<BusResponse, EndpointError>
	where
		B: hyper::body::Body<Data = Bytes> + Send + 'static,
		B::Error: Into<BoxError>,
	{
		let path = req.uri().path();

		if !path.starts_with(routes::PREFIX) {
			return Ok(self.app.call(app_request(req)).await);
		}

		if path == routes::BROADCAST {
			if !self.cfg.allow_broadcast {
				return Ok(self.app.call(app_request(req)).await);
			}
			let (parts, body) = req.into_parts();
			return match self.read_body(body).await? {
				Some(body) => self.broadcast(&parts, body).await,
				None => Ok(too_large()),
			};
		}

		if path.starts_with(routes::DIAGNOSTICS_PREFIX) {
			return Ok(match &self.diagnostics {
				Some(diagnostics) => diagnostics.call(app_request(req)).await,
				None => self.app.call(app_request(req)).await,
			});
		}

		let Some(client_id) = client_id_segment(path).and_then(|s| ClientId::new(s).ok()) else {
			return Ok(text_response(StatusCode::NOT_FOUND, "not found"));
		};

		let (parts, body) = req.into_parts();
		match self.read_body(body).await? {
			Some(body) => self.poll(client_id, parts, body).await,
			None => Ok(too_large()),
		}
	}

	/// Buffer a bus request body up to `max_body_bytes`; `None` when it is larger.
	async fn read_body<B>(&self, body: B) -> Result<Option<Bytes>, EndpointError>
	where
		B: hyper::body::Body<Data = Bytes>,
		B::Error: Into<BoxError>,
	{
		match Limited::new(body, self.cfg.max_body_bytes).collect().await {
			Ok(collected) => Ok(Some(collected.to_bytes())),
			Err(e) if e.is::<LengthLimitError>() => {
				debug!(limit = self.cfg.max_body_bytes, "request body over limit");
				Ok(None)
			}
			Err(e) => Err(EndpointError::Body(e.to_string())),
		}
	}

	async fn broadcast(&self, parts: &Parts, body: Bytes) -> Result<BusResponse, EndpointError> {
		let query = parts.uri.query().unwrap_or_default().as_bytes();
		let field = |key: &str| form_value(&body, key).or_else(|| form_value(query, key));

		let Some(channel) = field("channel").filter(|c| !c.is_empty()) else {
			return Ok(text_response(StatusCode::BAD_REQUEST, "missing channel"));
		};
		let data = field("data").map(serde_json::Value::String).unwrap_or(serde_json::Value::Null);

		match self.log.publish(&channel, data, MessageTargets::default()).await {
			Ok(msg) => {
				info!(channel = %msg.channel, message_id = msg.message_id, "debug broadcast published");
				Ok(text_response(StatusCode::OK, "sent"))
			}
			Err(e) => Ok(text_response(StatusCode::BAD_REQUEST, &format!("{e:#}"))),
		}
	}

	async fn poll(&self, client_id: ClientId, parts: Parts, body: Bytes) -> Result<BusResponse, EndpointError> {
		metrics::counter!("msgbus_polls_total").increment(1);

		let auth = self.auth.resolve(&parts);
		let mut session = ClientSession::new(client_id, auth);
		for (channel, last_id) in parse_subscriptions(&body) {
			session.subscribe(channel, last_id);
		}

		let backlog = session.backlog(self.log.as_ref()).await?;
		if !backlog.is_empty() {
			debug!(client_id = %session.client_id, count = backlog.len(), "poll answered from backlog");
			return batch_response(&backlog);
		}

		let hold = self.cfg.long_polling_enabled && !long_poll_disabled(parts.uri.query()) && !self.manager.at_capacity();
		if !hold {
			metrics::counter!("msgbus_polls_immediate_total").increment(1);
			return Ok(empty_response());
		}

		let (completer, pending) = ResponseCompleter::channel();
		let snapshot = session.snapshot();
		session.attach(completer);

		let token = self.manager.add(session, self.cfg.long_polling_interval);
		let _guard = HoldGuard {
			manager: self.manager.clone(),
			token,
		};

		// Catch publishes that landed between the first backlog read and registration.
		let late = snapshot.backlog(self.log.as_ref()).await?;
		if !late.is_empty() && self.manager.remove(token) {
			return batch_response(&late);
		}

		match pending.wait().await {
			HoldOutcome::Delivered(messages) => batch_response(&messages),
			HoldOutcome::TimedOut => Ok(empty_response()),
		}
	}
}

/// Deregisters a held session when the request future goes away.
///
/// Dropping the future mid-hold (client disconnect) leaves nothing behind in the registry; after a
/// normal completion the removal is a no-op.
struct HoldGuard {
	manager: ConnectionManager,
	token: SessionToken,
}

impl Drop for HoldGuard {
	fn drop(&mut self) {
		if self.manager.remove(self.token) {
			debug!(token = %self.token, "held poll abandoned");
		}
	}
}

fn app_request<B>(req: Request<B>) -> AppRequest
where
	B: hyper::body::Body<Data = Bytes> + Send + 'static,
	B::Error: Into<BoxError>,
{
	req.map(|body| body.map_err(Into::into).boxed_unsync())
}

fn too_large() -> BusResponse {
	text_response(StatusCode::PAYLOAD_TOO_LARGE, "payload too large")
}

fn batch_response(messages: &[Message]) -> Result<BusResponse, EndpointError> {
	Ok(json_response(encode_messages(messages)?))
}

fn empty_response() -> BusResponse {
	json_response(wire::EMPTY_BATCH.to_string())
}

fn json_response(body: String) -> BusResponse {
	let mut resp = Response::new(Full::new(Bytes::from(body)));
	let headers = resp.headers_mut();
	headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(wire::CACHE_CONTROL));
	headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(wire::CONTENT_TYPE_JSON));
	resp
}

pub(crate) fn text_response(status: StatusCode, body: &str) -> BusResponse {
	let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
	*resp.status_mut() = status;
	resp.headers_mut().insert(
		header::CONTENT_TYPE,
		HeaderValue::from_static("text/plain; charset=utf-8"),
	);
	resp
}

/// Accept HTTP/1 connections on `listener` and serve them with `service`.
pub async fn serve(listener: TcpListener, service: MessageBusService) -> anyhow::Result<()> {
	loop {
		let (stream, remote) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let service = service.clone();
		tokio::spawn(async move {
			let svc = service_fn(move |req| {
				let service = service.clone();
				async move { service.serve_request(req).await }
			});
			if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
				debug!(error = %err, %remote, "http connection closed with error");
			}
		});
	}
}

/// Spawn `serve` in the background.
pub fn spawn_server(listener: TcpListener, service: MessageBusService) -> JoinHandle<()> {
	tokio::spawn(async move {
		if let Err(err) = serve(listener, service).await {
			warn!(error = %err, "message bus server stopped");
		}
	})
}
