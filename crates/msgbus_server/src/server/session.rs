#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use msgbus_domain::{AuthContext, ClientId, Message, normalize_last_id};
use tokio::sync::oneshot;

use crate::server::channel_log::ChannelLog;

/// How a held connection was completed.
#[derive(Debug, Clone, PartialEq)]
pub enum HoldOutcome {
	/// New messages for at least one subscription.
	Delivered(Vec<Message>),
	/// The hold expired with nothing to deliver.
	TimedOut,
}

/// Completion handle for one held request.
///
/// Whoever owns the completer decides the response; the manager hands it out at most once.
#[derive(Debug)]
pub struct ResponseCompleter {
	tx: oneshot::Sender<HoldOutcome>,
}

/// Request side of a held connection, resolved by its `ResponseCompleter`.
#[derive(Debug)]
pub struct PendingResponse {
	rx: oneshot::Receiver<HoldOutcome>,
}

impl ResponseCompleter {
	pub fn channel() -> (Self, PendingResponse) {
		let (tx, rx) = oneshot::channel();
		(Self { tx }, PendingResponse { rx })
	}

	/// Complete the request; `false` when the transport already went away.
	pub fn complete(self, outcome: HoldOutcome) -> bool {
		self.tx.send(outcome).is_ok()
	}

	/// True once the waiting request has been dropped (client disconnected).
	pub fn is_cancelled(&self) -> bool {
		self.tx.is_closed()
	}
}

impl PendingResponse {
	/// Wait for the outcome. A completer dropped without completing counts as a timeout.
	pub async fn wait(self) -> HoldOutcome {
		self.rx.await.unwrap_or(HoldOutcome::TimedOut)
	}
}

/// Server-side state of one poll request.
#[derive(Debug)]
pub struct ClientSession {
	pub client_id: ClientId,
	pub auth: AuthContext,
	subscriptions: Vec<(String, i64)>,
	created_at: Instant,
	completer: Option<ResponseCompleter>,
}

impl ClientSession {
	pub fn new(client_id: ClientId, auth: AuthContext) -> Self {
		Self {
			client_id,
			auth,
			subscriptions: Vec::new(),
			created_at: Instant::now(),
			completer: None,
		}
	}

	/// Subscribe to `channel`; re-subscribing replaces the cursor.
	pub fn subscribe(&mut self, channel: impl Into<String>, last_id: i64) {
		let channel = channel.into();
		let last_id = normalize_last_id(last_id);
		match self.subscriptions.iter_mut().find(|(c, _)| *c == channel) {
			Some(entry) => entry.1 = last_id,
			None => self.subscriptions.push((channel, last_id)),
		}
	}

	pub fn subscriptions(&self) -> &[(String, i64)] {
		&self.subscriptions
	}

	pub fn last_id(&self, channel: &str) -> Option<i64> {
		self.subscriptions.iter().find(|(c, _)| c == channel).map(|(_, id)| *id)
	}

	pub fn is_subscribed(&self, channel: &str) -> bool {
		self.last_id(channel).is_some()
	}

	/// Move the cursor for an existing subscription; unknown channels are ignored.
	pub fn advance(&mut self, channel: &str, last_id: i64) -> bool {
		match self.subscriptions.iter_mut().find(|(c, _)| c == channel) {
			Some(entry) => {
				entry.1 = last_id;
				true
			}
			None => false,
		}
	}

	pub fn age(&self) -> Duration {
		self.created_at.elapsed()
	}

	pub fn attach(&mut self, completer: ResponseCompleter) {
		self.completer = Some(completer);
	}

	pub fn take_completer(&mut self) -> Option<ResponseCompleter> {
		self.completer.take()
	}

	/// True when the session holds a connection whose client already went away.
	pub fn is_abandoned(&self) -> bool {
		self.completer.as_ref().map(ResponseCompleter::is_cancelled).unwrap_or(false)
	}

	/// A detached copy (no completer) for re-checking the backlog.
	pub fn snapshot(&self) -> Self {
		Self {
			client_id: self.client_id.clone(),
			auth: self.auth.clone(),
			subscriptions: self.subscriptions.clone(),
			created_at: self.created_at,
			completer: None,
		}
	}

	/// Messages this session has not seen yet, per channel in publish order.
	///
	/// Cursors ahead of the channel tail (the log was reset or trimmed) produce one trailing
	/// status message carrying the real tail ids.
	pub async fn backlog(&self, log: &dyn ChannelLog) -> anyhow::Result<Vec<Message>> {
		let mut out = Vec::new();
		let mut stale = BTreeMap::new();

		for (channel, last_id) in &self.subscriptions {
			let messages = log.backlog(channel, *last_id).await?;
			out.extend(messages.into_iter().filter(|m| m.is_visible_to(&self.auth)));

			if *last_id > 0 {
				let tail = log.last_id(channel).await?;
				if *last_id > tail {
					stale.insert(channel.clone(), tail);
				}
			}
		}

		if !stale.is_empty() {
			out.push(Message::status(stale));
		}

		Ok(out)
	}
}
