#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use msgbus_domain::Message;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::server::session::{ClientSession, HoldOutcome};

/// Registry of held poll requests.
///
/// Every way out of the registry (dispatch, timeout, disconnect) goes through taking the entry
/// out under the lock, so exactly one of them completes a given session.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
	inner: Arc<Mutex<Inner>>,
	cfg: ConnectionManagerConfig,
}

/// Configuration for `ConnectionManager`.
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
	/// Held connections above which new polls are answered immediately.
	pub max_active_clients: usize,

	pub debug_logs: bool,
}

impl Default for ConnectionManagerConfig {
	fn default() -> Self {
		Self {
			max_active_clients: 1000,
			debug_logs: false,
		}
	}
}

/// Opaque registration handle for a held session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionToken(u64);

impl fmt::Display for SessionToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Default)]
struct Inner {
	next_token: u64,
	sessions: HashMap<SessionToken, HeldSession>,
}

#[derive(Debug)]
struct HeldSession {
	session: ClientSession,
	reaper: Option<JoinHandle<()>>,
}

impl HeldSession {
	fn cancel_reaper(&mut self) {
		if let Some(reaper) = self.reaper.take() {
			reaper.abort();
		}
	}
}

impl ConnectionManager {
	pub fn new(cfg: ConnectionManagerConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	pub fn config(&self) -> &ConnectionManagerConfig {
		&self.cfg
	}

	/// Register a held session and arm its timeout. Must be called within a tokio runtime.
	pub fn add(&self, session: ClientSession, timeout: Duration) -> SessionToken {
		let mut inner = self.inner.lock();
		inner.next_token = inner.next_token.wrapping_add(1);
		let token = SessionToken(inner.next_token);

		// The reaper cannot observe the registry before this lock is released.
		let manager = self.clone();
		let reaper = tokio::spawn(async move {
			tokio::time::sleep(timeout).await;
			manager.reap(token);
		});

		if self.cfg.debug_logs {
			debug!(
				%token,
				client_id = %session.client_id,
				channels = session.subscriptions().len(),
				timeout_ms = timeout.as_millis() as u64,
				"connection manager: holding"
			);
		}

		inner.sessions.insert(
			token,
			HeldSession {
				session,
				reaper: Some(reaper),
			},
		);
		record_held(inner.sessions.len());

		token
	}

	/// Deregister a session without completing it. Returns `false` if it was already gone.
	pub fn remove(&self, token: SessionToken) -> bool {
		let removed = {
			let mut inner = self.inner.lock();
			let removed = inner.sessions.remove(&token);
			record_held(inner.sessions.len());
			removed
		};

		match removed {
			Some(mut held) => {
				held.cancel_reaper();
				if self.cfg.debug_logs {
					debug!(%token, client_id = %held.session.client_id, "connection manager: removed");
				}
				true
			}
			None => false,
		}
	}

	/// Dispatch a published message to every held session that wants it.
	///
	/// Returns the number of sessions completed.
	pub fn notify(&self, message: &Message) -> usize {
		let ready = {
			let mut inner = self.inner.lock();

			let mut ready: Vec<(ClientSession, HoldOutcome)> = Vec::new();
			let mut abandoned = Vec::new();
			let mut matched = Vec::new();

			for (token, held) in inner.sessions.iter() {
				if held.session.is_abandoned() {
					abandoned.push(*token);
				} else if wants(&held.session, message) {
					matched.push(*token);
				}
			}

			for token in abandoned {
				if let Some(mut held) = inner.sessions.remove(&token) {
					held.cancel_reaper();
				}
			}

			for token in matched {
				let Some(mut held) = inner.sessions.remove(&token) else {
					continue;
				};
				held.cancel_reaper();

				let mut session = held.session;
				let outcome = if message.is_status() {
					let relevant = message
						.status_entries()
						.into_iter()
						.filter(|(channel, _)| session.is_subscribed(channel))
						.collect::<BTreeMap<_, _>>();
					for (channel, id) in &relevant {
						session.advance(channel, *id);
					}
					HoldOutcome::Delivered(vec![Message::status(relevant)])
				} else {
					session.advance(&message.channel, message.message_id);
					HoldOutcome::Delivered(vec![message.clone()])
				};

				ready.push((session, outcome));
			}

			record_held(inner.sessions.len());
			ready
		};

		let mut completed = 0usize;
		for (mut session, outcome) in ready {
			let Some(completer) = session.take_completer() else {
				continue;
			};
			if completer.complete(outcome) {
				completed += 1;
			}
		}

		if completed > 0 {
			metrics::counter!("msgbus_dispatched_total").increment(completed as u64);
		}

		if self.cfg.debug_logs {
			debug!(
				channel = %message.channel,
				message_id = message.message_id,
				completed,
				"connection manager: notified"
			);
		}

		completed
	}

	/// Number of currently held sessions.
	pub fn client_count(&self) -> usize {
		self.inner.lock().sessions.len()
	}

	/// True when new polls should not be held.
	pub fn at_capacity(&self) -> bool {
		self.client_count() >= self.cfg.max_active_clients
	}

	pub fn contains(&self, token: SessionToken) -> bool {
		self.inner.lock().sessions.contains_key(&token)
	}

	/// Timer expiry: complete with an empty result unless something else got there first.
	fn reap(&self, token: SessionToken) {
		let removed = {
			let mut inner = self.inner.lock();
			let removed = inner.sessions.remove(&token);
			record_held(inner.sessions.len());
			removed
		};

		let Some(held) = removed else {
			return;
		};

		let mut session = held.session;
		if self.cfg.debug_logs {
			debug!(
				%token,
				client_id = %session.client_id,
				age_ms = session.age().as_millis() as u64,
				"connection manager: timed out"
			);
		}

		metrics::counter!("msgbus_timeouts_total").increment(1);
		if let Some(completer) = session.take_completer() {
			let _ = completer.complete(HoldOutcome::TimedOut);
		}
	}
}

impl Default for ConnectionManager {
	fn default() -> Self {
		Self::new(ConnectionManagerConfig::default())
	}
}

fn wants(session: &ClientSession, message: &Message) -> bool {
	if message.is_status() {
		return message.status_entries().keys().any(|channel| session.is_subscribed(channel));
	}
	// Cursors only move forward: a late notification for an id the poll already carried is dropped.
	session
		.last_id(&message.channel)
		.is_some_and(|last_id| message.message_id > last_id)
		&& message.is_visible_to(&session.auth)
}

fn record_held(count: usize) {
	metrics::gauge!("msgbus_held_connections").set(count as f64);
}
