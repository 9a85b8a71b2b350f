#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};

use anyhow::anyhow;
use msgbus_domain::{Message, MessageTargets, STATUS_CHANNEL};
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

/// Storage collaborator: append-only per-channel logs with id assignment.
#[async_trait::async_trait]
pub trait ChannelLog: Send + Sync {
	/// Append to `channel`, assign ids and notify subscribers.
	async fn publish(&self, channel: &str, data: serde_json::Value, targets: MessageTargets) -> anyhow::Result<Message>;

	/// All retained messages on `channel` with `message_id > after_id`, oldest first.
	async fn backlog(&self, channel: &str, after_id: i64) -> anyhow::Result<Vec<Message>>;

	/// Id of the newest message on `channel`, `0` when nothing was published.
	async fn last_id(&self, channel: &str) -> anyhow::Result<i64>;

	/// Publish notifications, consumed by the dispatcher.
	fn subscribe(&self) -> broadcast::Receiver<Message>;
}

#[derive(Debug, Clone)]
pub struct ChannelLogConfig {
	/// Messages retained per channel for backlog queries.
	pub per_channel_capacity: usize,
	/// Buffered publish notifications before the dispatcher lags.
	pub notify_capacity: usize,
}

impl Default for ChannelLogConfig {
	fn default() -> Self {
		Self {
			per_channel_capacity: 1000,
			notify_capacity: 1024,
		}
	}
}

#[derive(Debug, Default)]
struct LogStore {
	last_global_id: i64,
	channels: HashMap<String, ChannelEntry>,
}

#[derive(Debug, Default)]
struct ChannelEntry {
	last_id: i64,
	retained: VecDeque<Message>,
}

impl LogStore {
	fn append(&mut self, channel: &str, data: serde_json::Value, targets: MessageTargets, capacity: usize) -> Message {
		self.last_global_id = self.last_global_id.saturating_add(1);
		let entry = self.channels.entry(channel.to_string()).or_default();
		entry.last_id = entry.last_id.saturating_add(1);

		let mut msg = Message::new(self.last_global_id, entry.last_id, channel, data);
		msg.targets = targets;

		entry.retained.push_back(msg.clone());
		while entry.retained.len() > capacity {
			entry.retained.pop_front();
		}

		msg
	}

	fn backlog(&self, channel: &str, after_id: i64) -> Vec<Message> {
		let Some(entry) = self.channels.get(channel) else {
			return Vec::new();
		};
		entry.retained.iter().filter(|m| m.message_id > after_id).cloned().collect()
	}

	fn last_id(&self, channel: &str) -> i64 {
		self.channels.get(channel).map(|e| e.last_id).unwrap_or(0)
	}
}

/// Process-local channel log with a bounded retention window per channel.
pub struct InMemoryChannelLog {
	inner: Mutex<LogStore>,
	notify_tx: broadcast::Sender<Message>,
	cfg: ChannelLogConfig,
}

impl InMemoryChannelLog {
	pub fn new(cfg: ChannelLogConfig) -> Self {
		let (notify_tx, _notify_rx) = broadcast::channel(cfg.notify_capacity.max(1));
		Self {
			inner: Mutex::new(LogStore::default()),
			notify_tx,
			cfg,
		}
	}

	/// Broadcast a `/__status` batch so held clients can fast-forward their cursors.
	///
	/// Status messages are never retained.
	pub fn announce_status(&self, latest: BTreeMap<String, i64>) {
		if latest.is_empty() {
			return;
		}
		let _ = self.notify_tx.send(Message::status(latest));
	}
}

impl Default for InMemoryChannelLog {
	fn default() -> Self {
		Self::new(ChannelLogConfig::default())
	}
}

#[async_trait::async_trait]
impl ChannelLog for InMemoryChannelLog {
	async fn publish(&self, channel: &str, data: serde_json::Value, targets: MessageTargets) -> anyhow::Result<Message> {
		if channel.is_empty() {
			return Err(anyhow!("cannot publish to an empty channel name"));
		}
		if channel == STATUS_CHANNEL {
			return Err(anyhow!("{STATUS_CHANNEL} is reserved for status announcements"));
		}

		let msg = {
			let mut guard = self.inner.lock().await;
			guard.append(channel, data, targets, self.cfg.per_channel_capacity)
		};

		metrics::counter!("msgbus_messages_published_total").increment(1);
		debug!(
			channel = %msg.channel,
			message_id = msg.message_id,
			global_id = msg.global_id,
			"channel log: published"
		);

		// No receivers just means nobody is holding a connection right now.
		let _ = self.notify_tx.send(msg.clone());

		Ok(msg)
	}

	async fn backlog(&self, channel: &str, after_id: i64) -> anyhow::Result<Vec<Message>> {
		let guard = self.inner.lock().await;
		Ok(guard.backlog(channel, after_id))
	}

	async fn last_id(&self, channel: &str) -> anyhow::Result<i64> {
		let guard = self.inner.lock().await;
		Ok(guard.last_id(channel))
	}

	fn subscribe(&self) -> broadcast::Receiver<Message> {
		self.notify_tx.subscribe()
	}
}
