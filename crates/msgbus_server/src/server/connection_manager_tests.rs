#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use msgbus_domain::{AuthContext, ClientId, Message, MessageTargets};
use serde_json::json;
use tokio::time::timeout;

use crate::server::connection_manager::{ConnectionManager, ConnectionManagerConfig};
use crate::server::session::{ClientSession, HoldOutcome, PendingResponse, ResponseCompleter};

const LONG: Duration = Duration::from_secs(30);

fn manager() -> ConnectionManager {
	ConnectionManager::new(ConnectionManagerConfig {
		max_active_clients: 2,
		debug_logs: false,
	})
}

fn held_session(client: &str, subs: &[(&str, i64)]) -> (ClientSession, PendingResponse) {
	let mut session = ClientSession::new(ClientId::new(client).expect("valid ClientId"), AuthContext::anonymous());
	for (channel, last_id) in subs {
		session.subscribe(*channel, *last_id);
	}
	let (completer, pending) = ResponseCompleter::channel();
	session.attach(completer);
	(session, pending)
}

fn msg(channel: &str, message_id: i64, data: serde_json::Value) -> Message {
	Message::new(message_id, message_id, channel, data)
}

#[tokio::test]
async fn notify_completes_only_matching_sessions() {
	let mgr = manager();

	let (a, pending_a) = held_session("a", &[("/a", -1)]);
	let (b, pending_b) = held_session("b", &[("/b", -1)]);
	let token_a = mgr.add(a, LONG);
	let token_b = mgr.add(b, LONG);

	assert_eq!(mgr.notify(&msg("/a", 1, json!("hello"))), 1);

	let outcome = timeout(Duration::from_millis(250), pending_a.wait())
		.await
		.expect("held session A should complete");
	match outcome {
		HoldOutcome::Delivered(msgs) => {
			assert_eq!(msgs.len(), 1);
			assert_eq!(msgs[0].channel, "/a");
			assert_eq!(msgs[0].data, json!("hello"));
		}
		other => panic!("expected Delivered, got {other:?}"),
	}

	assert!(!mgr.contains(token_a));
	assert!(mgr.contains(token_b));
	assert_eq!(mgr.client_count(), 1);

	let still_waiting = timeout(Duration::from_millis(50), pending_b.wait()).await;
	assert!(still_waiting.is_err(), "session B must not be completed by a message on /a");
}

#[tokio::test]
async fn session_is_dispatched_at_most_once() {
	let mgr = manager();
	let (s, pending) = held_session("a", &[("/a", -1)]);
	mgr.add(s, LONG);

	assert_eq!(mgr.notify(&msg("/a", 1, json!(1))), 1);
	assert_eq!(mgr.notify(&msg("/a", 2, json!(2))), 0);

	match pending.wait().await {
		HoldOutcome::Delivered(msgs) => {
			assert_eq!(msgs.iter().map(|m| m.message_id).collect::<Vec<_>>(), vec![1]);
		}
		other => panic!("expected Delivered, got {other:?}"),
	}
}

#[tokio::test]
async fn timeout_completes_empty_and_deregisters() {
	let mgr = manager();
	let (s, pending) = held_session("a", &[("/a", -1)]);

	let hold = Duration::from_millis(80);
	let started = Instant::now();
	let token = mgr.add(s, hold);

	let outcome = timeout(Duration::from_secs(2), pending.wait())
		.await
		.expect("timeout should fire");
	assert_eq!(outcome, HoldOutcome::TimedOut);
	assert!(started.elapsed() >= hold, "completed before the configured timeout");
	assert!(!mgr.contains(token));
	assert_eq!(mgr.client_count(), 0);
}

#[tokio::test]
async fn dispatch_wins_over_later_timeout() {
	let mgr = manager();
	let (s, pending) = held_session("a", &[("/a", -1)]);
	mgr.add(s, Duration::from_millis(60));

	assert_eq!(mgr.notify(&msg("/a", 1, json!(1))), 1);
	tokio::time::sleep(Duration::from_millis(120)).await;

	assert!(matches!(pending.wait().await, HoldOutcome::Delivered(_)));
	assert_eq!(mgr.client_count(), 0);
}

#[tokio::test]
async fn remove_is_idempotent_and_isolated() {
	let mgr = manager();
	let (a, _pending_a) = held_session("a", &[("/a", -1)]);
	let (b, _pending_b) = held_session("b", &[("/a", -1)]);
	let token_a = mgr.add(a, LONG);
	let token_b = mgr.add(b, LONG);

	assert!(mgr.remove(token_a));
	assert!(!mgr.remove(token_a));
	assert!(mgr.contains(token_b));
	assert_eq!(mgr.client_count(), 1);
}

#[tokio::test]
async fn removed_session_is_not_reaped_later() {
	let mgr = manager();
	let (s, pending) = held_session("a", &[("/a", -1)]);
	let token = mgr.add(s, Duration::from_millis(30));

	assert!(mgr.remove(token));
	tokio::time::sleep(Duration::from_millis(80)).await;

	// Completer was dropped with the session; nothing else may resolve it.
	assert_eq!(pending.wait().await, HoldOutcome::TimedOut);
	assert_eq!(mgr.client_count(), 0);
}

#[tokio::test]
async fn abandoned_sessions_are_pruned_on_notify() {
	let mgr = manager();
	let (s, pending) = held_session("a", &[("/other", -1)]);
	mgr.add(s, LONG);
	drop(pending);

	assert_eq!(mgr.notify(&msg("/a", 1, json!(1))), 0);
	assert_eq!(mgr.client_count(), 0);
}

#[tokio::test]
async fn targeted_messages_skip_foreign_sessions() {
	let mgr = manager();
	let (s, pending) = held_session("a", &[("/private", -1)]);
	mgr.add(s, LONG);

	let mut private = msg("/private", 1, json!("secret"));
	private.targets = MessageTargets {
		user_ids: Some(vec![7]),
		..MessageTargets::default()
	};

	assert_eq!(mgr.notify(&private), 0);
	assert_eq!(mgr.client_count(), 1);
	assert!(timeout(Duration::from_millis(50), pending.wait()).await.is_err());
}

#[tokio::test]
async fn status_only_reaches_sessions_with_listed_channels() {
	let mgr = manager();
	let (a, pending_a) = held_session("a", &[("/a", 1), ("/b", 1)]);
	let (c, pending_c) = held_session("c", &[("/c", 1)]);
	mgr.add(a, LONG);
	mgr.add(c, LONG);

	let mut latest = BTreeMap::new();
	latest.insert("/a".to_string(), 9);
	latest.insert("/z".to_string(), 4);

	assert_eq!(mgr.notify(&Message::status(latest)), 1);

	match pending_a.wait().await {
		HoldOutcome::Delivered(msgs) => {
			assert_eq!(msgs.len(), 1);
			assert!(msgs[0].is_status());
			assert_eq!(msgs[0].status_id_for("/a"), Some(9));
			assert_eq!(msgs[0].status_id_for("/z"), None, "status must be filtered to own channels");
		}
		other => panic!("expected Delivered, got {other:?}"),
	}

	assert!(timeout(Duration::from_millis(50), pending_c.wait()).await.is_err());
}

#[tokio::test]
async fn capacity_reflects_held_count() {
	let mgr = manager();
	assert!(!mgr.at_capacity());

	let (a, _pa) = held_session("a", &[("/a", -1)]);
	let (b, _pb) = held_session("b", &[("/a", -1)]);
	mgr.add(a, LONG);
	assert!(!mgr.at_capacity());
	mgr.add(b, LONG);
	assert!(mgr.at_capacity());
}

#[tokio::test]
async fn late_notification_for_seen_id_is_not_redelivered() {
	let mgr = manager();
	let (s, pending) = held_session("a", &[("/a", 3)]);
	let token = mgr.add(s, LONG);

	assert_eq!(mgr.notify(&msg("/a", 2, json!("old"))), 0);
	assert_eq!(mgr.notify(&msg("/a", 3, json!("seen"))), 0);
	assert!(mgr.contains(token), "session must stay held after stale notifications");

	assert_eq!(mgr.notify(&msg("/a", 4, json!("new"))), 1);
	match pending.wait().await {
		HoldOutcome::Delivered(msgs) => {
			assert_eq!(msgs.iter().map(|m| m.message_id).collect::<Vec<_>>(), vec![4]);
		}
		other => panic!("expected Delivered, got {other:?}"),
	}
}
