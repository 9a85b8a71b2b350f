#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use msgbus_domain::{ChannelPattern, ClientId, Message, ParseChannelError, normalize_last_id};
use msgbus_protocol::{DISABLE_LONG_POLL_PARAM, WireError, decode_messages, routes};
use msgbus_util::endpoint::HttpEndpoint;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Local dev default, matches the server's default bind.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:18300";

/// Delay before the next poll when the previous one returned messages.
pub const GOT_DATA_DELAY: Duration = Duration::from_millis(100);

/// Delay between checks while there is nothing to poll for.
pub const IDLE_DELAY: Duration = Duration::from_millis(500);

/// Poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
	/// Server base URL (`http://host:port[/base/]`).
	pub base_url: String,

	/// When off every poll is sent with `dlp=t`.
	pub enable_long_polling: bool,

	/// Base delay between polls that returned nothing.
	pub callback_interval: Duration,

	/// Upper bound for the computed delay.
	pub max_poll_interval: Duration,

	/// Keep long polling while backgrounded.
	pub always_long_poll: bool,

	/// Per-request timeout; must exceed the server's long-poll interval.
	pub request_timeout: Duration,
}

impl Default for PollerConfig {
	fn default() -> Self {
		Self {
			base_url: DEFAULT_BASE_URL.to_string(),
			enable_long_polling: true,
			callback_interval: Duration::from_millis(60_000),
			max_poll_interval: Duration::from_millis(180_000),
			always_long_poll: false,
			request_timeout: Duration::from_secs(60),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// Base URL could not be parsed.
	#[error("invalid base url: {0}")]
	Endpoint(String),

	/// Transport or HTTP status failure.
	#[error("http request failed: {0}")]
	Http(#[from] reqwest::Error),

	/// Response body was not a message batch.
	#[error(transparent)]
	Wire(#[from] WireError),

	/// Invalid channel or unsubscribe pattern.
	#[error(transparent)]
	Channel(#[from] ParseChannelError),
}

/// Whether the hosting application is currently in the background.
pub trait Visibility: Send + Sync {
	fn is_hidden(&self) -> bool;
}

/// `Visibility` backed by a flag the host flips.
#[derive(Debug, Default)]
pub struct VisibilityFlag {
	hidden: AtomicBool,
}

impl VisibilityFlag {
	pub fn set_hidden(&self, hidden: bool) {
		self.hidden.store(hidden, Ordering::Relaxed);
	}
}

impl Visibility for VisibilityFlag {
	fn is_hidden(&self) -> bool {
		self.hidden.load(Ordering::Relaxed)
	}
}

/// Handler invoked with the `data` of each message on a subscribed channel.
pub type Handler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

struct Callback {
	channel: String,
	handler: Handler,
	last_id: i64,
}

#[derive(Default)]
struct PollerState {
	callbacks: Vec<Callback>,
	fail_count: u32,
	started: bool,
	stopped: bool,
	epoch: u64,
}

struct Shared {
	cfg: PollerConfig,
	poll_base: String,
	client_id: ClientId,
	http: reqwest::Client,
	visibility: Arc<dyn Visibility>,
	state: Mutex<PollerState>,
	abort_tx: watch::Sender<u64>,
}

/// Adaptive long-polling client.
///
/// One background loop per client issues a poll, waits for it to finish, then schedules the next
/// one. Subscribing or unsubscribing aborts the poll in flight so the next one carries the new set.
pub struct MessageBusClient {
	shared: Arc<Shared>,
}

impl MessageBusClient {
	pub fn new(cfg: PollerConfig) -> Result<Self, ClientCoreError> {
		Self::with_visibility(cfg, Arc::new(VisibilityFlag::default()))
	}

	pub fn with_visibility(cfg: PollerConfig, visibility: Arc<dyn Visibility>) -> Result<Self, ClientCoreError> {
		let endpoint = HttpEndpoint::parse(&cfg.base_url).map_err(ClientCoreError::Endpoint)?;
		let poll_base = endpoint.base_url().trim_end_matches('/').to_string();
		let (abort_tx, _) = watch::channel(0u64);

		Ok(Self {
			shared: Arc::new(Shared {
				cfg,
				poll_base,
				client_id: ClientId::new_v4(),
				http: reqwest::Client::new(),
				visibility,
				state: Mutex::new(PollerState::default()),
				abort_tx,
			}),
		})
	}

	pub fn client_id(&self) -> &ClientId {
		&self.shared.client_id
	}

	pub fn config(&self) -> &PollerConfig {
		&self.shared.cfg
	}

	/// Start the poll loop. No-op while already started. Must be called within a tokio runtime.
	pub fn start(&self) {
		let epoch = {
			let mut state = self.shared.state.lock();
			if state.started {
				return;
			}
			state.started = true;
			state.stopped = false;
			state.epoch = state.epoch.wrapping_add(1);
			state.epoch
		};

		info!(client_id = %self.shared.client_id, "message bus client started");
		tokio::spawn(run_poll_loop(Arc::clone(&self.shared), epoch));
	}

	/// Stop scheduling polls. Subscriptions and cursors are kept for a later `start`.
	pub fn stop(&self) {
		{
			let mut state = self.shared.state.lock();
			state.stopped = true;
			state.started = false;
		}
		self.shared.abort_in_flight();
	}

	pub fn is_started(&self) -> bool {
		self.shared.state.lock().started
	}

	/// Register `handler` for `channel`, resuming after `last_id`.
	///
	/// `None` sends `-1`, which the server answers with the channel's whole retained backlog. Pass
	/// the channel's current id to receive only messages published after it.
	///
	/// Starts the client unless it was explicitly stopped.
	pub fn subscribe<F>(&self, channel: impl Into<String>, handler: F, last_id: Option<i64>) -> Result<(), ClientCoreError>
	where
		F: Fn(&serde_json::Value) + Send + Sync + 'static,
	{
		let channel = channel.into();
		if channel.is_empty() {
			return Err(ParseChannelError::Empty.into());
		}

		let auto_start = {
			let mut state = self.shared.state.lock();
			state.callbacks.push(Callback {
				channel: channel.clone(),
				handler: Arc::new(handler),
				last_id: normalize_last_id(last_id.unwrap_or(-1)),
			});
			!state.started && !state.stopped
		};
		debug!(%channel, "subscribed");

		if auto_start {
			self.start();
		}
		self.shared.abort_in_flight();
		Ok(())
	}

	/// Remove callbacks matching `spec` (`"/prefix*"` or an exact channel). Returns how many were removed.
	pub fn unsubscribe(&self, spec: &str) -> Result<usize, ClientCoreError> {
		let pattern = ChannelPattern::parse(spec)?;

		let removed = {
			let mut state = self.shared.state.lock();
			let before = state.callbacks.len();
			state.callbacks.retain(|cb| !pattern.matches(&cb.channel));
			before - state.callbacks.len()
		};
		debug!(%pattern, removed, "unsubscribed");

		self.shared.abort_in_flight();
		Ok(removed)
	}

	/// Current `(channel, last_id)` per subscribed channel, in subscription order.
	pub fn subscriptions(&self) -> Vec<(String, i64)> {
		self.shared.subscriptions()
	}

	pub fn fail_count(&self) -> u32 {
		self.shared.state.lock().fail_count
	}

	/// Issue one poll for `subscriptions` and return the raw batch.
	///
	/// Does not touch callbacks, cursors or the failure counter.
	pub async fn fetch(&self, subscriptions: &[(String, i64)], long_poll: bool) -> Result<Vec<Message>, ClientCoreError> {
		self.shared.fetch(subscriptions, long_poll).await
	}
}

impl Drop for MessageBusClient {
	fn drop(&mut self) {
		self.stop();
	}
}

impl Shared {
	fn abort_in_flight(&self) {
		self.abort_tx.send_modify(|generation| *generation = generation.wrapping_add(1));
	}

	fn is_current(&self, epoch: u64) -> bool {
		let state = self.state.lock();
		state.started && state.epoch == epoch
	}

	fn subscriptions(&self) -> Vec<(String, i64)> {
		let state = self.state.lock();
		let mut subs: Vec<(String, i64)> = Vec::with_capacity(state.callbacks.len());
		for cb in &state.callbacks {
			// Several callbacks on one channel share one form field; the last one wins.
			match subs.iter_mut().find(|(c, _)| *c == cb.channel) {
				Some(entry) => entry.1 = cb.last_id,
				None => subs.push((cb.channel.clone(), cb.last_id)),
			}
		}
		subs
	}

	fn should_long_poll(&self) -> bool {
		self.cfg.always_long_poll || !self.visibility.is_hidden()
	}

	async fn fetch(&self, subscriptions: &[(String, i64)], long_poll: bool) -> Result<Vec<Message>, ClientCoreError> {
		let mut url = format!("{}{}", self.poll_base, routes::poll_path(self.client_id.as_str()));
		if !long_poll {
			url.push('?');
			url.push_str(DISABLE_LONG_POLL_PARAM);
			url.push_str("=t");
		}

		let form: Vec<(&str, String)> = subscriptions
			.iter()
			.map(|(channel, last_id)| (channel.as_str(), last_id.to_string()))
			.collect();

		let body = self
			.http
			.post(url)
			.form(&form)
			.timeout(self.cfg.request_timeout)
			.send()
			.await?
			.error_for_status()?
			.bytes()
			.await?;

		Ok(decode_messages(&body)?)
	}

	/// Advance cursors and collect handler calls, then run the handlers outside the lock.
	fn deliver(&self, messages: &[Message]) {
		let mut calls: Vec<(Handler, serde_json::Value)> = Vec::new();
		{
			let mut state = self.state.lock();
			for message in messages {
				for cb in state.callbacks.iter_mut() {
					if message.is_status() {
						if let Some(id) = message.status_id_for(&cb.channel) {
							cb.last_id = id;
						}
					} else if cb.channel == message.channel {
						if cb.last_id >= 0 && message.message_id <= cb.last_id {
							continue;
						}
						cb.last_id = message.message_id;
						calls.push((Arc::clone(&cb.handler), message.data.clone()));
					}
				}
			}
		}

		for (handler, data) in calls {
			handler(&data);
		}
	}

	fn record_success(&self) {
		self.state.lock().fail_count = 0;
	}

	fn record_failure(&self) -> u32 {
		let mut state = self.state.lock();
		state.fail_count = state.fail_count.saturating_add(1);
		state.fail_count
	}
}

/// Delay before the next poll.
///
/// `backgrounded` is true when the last poll was not long because the host is hidden.
pub fn next_delay(cfg: &PollerConfig, got_data: bool, fail_count: u32, backgrounded: bool) -> Duration {
	if got_data {
		return GOT_DATA_DELAY;
	}

	let interval = if fail_count > 2 {
		cfg.callback_interval.saturating_mul(fail_count)
	} else if backgrounded {
		cfg.callback_interval.saturating_mul(4)
	} else {
		cfg.callback_interval
	};

	interval.min(cfg.max_poll_interval)
}

enum PollOutcome {
	Completed(Result<Vec<Message>, ClientCoreError>),
	Aborted,
}

async fn run_poll_loop(shared: Arc<Shared>, epoch: u64) {
	let mut abort_rx = shared.abort_tx.subscribe();

	loop {
		if !shared.is_current(epoch) {
			debug!(epoch, "poll loop exiting");
			break;
		}

		// Mark the current generation seen before reading the subscription set.
		let _ = abort_rx.borrow_and_update();

		let subs = shared.subscriptions();
		if subs.is_empty() {
			wait_or_abort(&mut abort_rx, IDLE_DELAY).await;
			continue;
		}

		let should_long_poll = shared.should_long_poll();
		let long_poll = should_long_poll && shared.cfg.enable_long_polling;

		let outcome = tokio::select! {
			res = shared.fetch(&subs, long_poll) => PollOutcome::Completed(res),
			_ = abort_rx.changed() => PollOutcome::Aborted,
		};

		let (got_data, fail_count) = match outcome {
			PollOutcome::Aborted => {
				debug!("poll aborted; re-polling with the current subscriptions");
				continue;
			}
			PollOutcome::Completed(Ok(messages)) => {
				shared.record_success();
				if !shared.is_current(epoch) {
					break;
				}
				shared.deliver(&messages);
				(!messages.is_empty(), 0)
			}
			PollOutcome::Completed(Err(e)) => {
				let fail_count = shared.record_failure();
				warn!(error = %e, fail_count, "poll failed");
				(false, fail_count)
			}
		};

		let delay = next_delay(&shared.cfg, got_data, fail_count, !should_long_poll);
		debug!(delay_ms = delay.as_millis() as u64, got_data, fail_count, "next poll scheduled");
		wait_or_abort(&mut abort_rx, delay).await;
	}
}

/// Sleep for `delay`, waking early when subscriptions change or the client stops.
async fn wait_or_abort(abort_rx: &mut watch::Receiver<u64>, delay: Duration) {
	tokio::select! {
		_ = tokio::time::sleep(delay) => {}
		_ = abort_rx.changed() => {}
	}
}
