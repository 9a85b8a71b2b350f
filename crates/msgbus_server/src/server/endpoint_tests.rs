#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{Request, StatusCode, header};
use msgbus_domain::{Message, MessageTargets};
use msgbus_protocol::{decode_messages, encode_subscriptions, routes, wire};
use serde_json::json;
use tokio::time::timeout;

use crate::server::auth::{HeaderAuthResolver, USER_ID_HEADER};
use crate::server::channel_log::{ChannelLog, InMemoryChannelLog};
use crate::server::connection_manager::{ConnectionManager, ConnectionManagerConfig};
use crate::server::dispatcher::{DispatcherConfig, spawn_dispatcher};
use crate::server::endpoint::{AppRequest, BusResponse, EndpointConfig, Fallback, MessageBusService};
use crate::server::health::{HealthApp, HealthState};

struct Harness {
	log: Arc<InMemoryChannelLog>,
	service: MessageBusService,
}

fn harness(cfg: EndpointConfig, max_active_clients: usize) -> Harness {
	let log = Arc::new(InMemoryChannelLog::default());
	let manager = ConnectionManager::new(ConnectionManagerConfig {
		max_active_clients,
		debug_logs: false,
	});
	spawn_dispatcher(log.as_ref(), manager.clone(), DispatcherConfig::default());
	let service = MessageBusService::new(cfg, log.clone(), manager);
	Harness { log, service }
}

fn hold_for(interval: Duration) -> EndpointConfig {
	EndpointConfig {
		long_polling_interval: interval,
		..EndpointConfig::default()
	}
}

fn poll_request(client: &str, subs: &[(&str, i64)], query: Option<&str>) -> Request<Full<Bytes>> {
	let mut uri = routes::poll_path(client);
	if let Some(q) = query {
		uri = format!("{uri}?{q}");
	}
	Request::post(uri)
		.header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
		.body(Full::new(Bytes::from(encode_subscriptions(subs.iter().copied()))))
		.unwrap()
}

async fn body_of(resp: BusResponse) -> Bytes {
	resp.into_body().collect().await.unwrap().to_bytes()
}

async fn messages_of(resp: BusResponse) -> Vec<Message> {
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(
		resp.headers().get(header::CACHE_CONTROL).and_then(|v| v.to_str().ok()),
		Some(wire::CACHE_CONTROL)
	);
	decode_messages(&body_of(resp).await).unwrap()
}

#[tokio::test]
async fn backlog_is_answered_immediately() {
	let h = harness(hold_for(Duration::from_secs(30)), 10);
	h.log.publish("/test", json!("hello"), MessageTargets::default()).await.unwrap();

	let resp = timeout(Duration::from_secs(1), h.service.handle(poll_request("abc", &[("/test", -1)], None)))
		.await
		.expect("backlog must not be held")
		.unwrap();

	let msgs = messages_of(resp).await;
	assert_eq!(msgs.len(), 1);
	assert_eq!(msgs[0].channel, "/test");
	assert_eq!(msgs[0].message_id, 1);
	assert_eq!(msgs[0].data, json!("hello"));
	assert_eq!(h.service.manager().client_count(), 0);
}

#[tokio::test]
async fn held_poll_receives_publish() {
	let h = harness(hold_for(Duration::from_secs(30)), 10);
	let service = h.service.clone();

	let poll = tokio::spawn(async move { service.handle(poll_request("abc", &[("/test", 0)], None)).await });

	// Wait until the request is registered before publishing.
	for _ in 0..100 {
		if h.service.manager().client_count() == 1 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	assert_eq!(h.service.manager().client_count(), 1);

	h.log.publish("/test", json!({"n": 1}), MessageTargets::default()).await.unwrap();

	let resp = timeout(Duration::from_secs(2), poll).await.unwrap().unwrap().unwrap();
	let msgs = messages_of(resp).await;
	assert_eq!(msgs.iter().map(|m| m.message_id).collect::<Vec<_>>(), vec![1]);
	assert_eq!(h.service.manager().client_count(), 0);
}

#[tokio::test]
async fn held_poll_times_out_empty() {
	let h = harness(hold_for(Duration::from_millis(100)), 10);

	let resp = timeout(Duration::from_secs(2), h.service.handle(poll_request("abc", &[("/quiet", 0)], None)))
		.await
		.unwrap()
		.unwrap();

	assert!(messages_of(resp).await.is_empty());
	assert_eq!(h.service.manager().client_count(), 0);
}

#[tokio::test]
async fn capacity_answers_immediately() {
	let h = harness(hold_for(Duration::from_secs(30)), 0);

	let resp = timeout(Duration::from_millis(500), h.service.handle(poll_request("abc", &[("/x", 0)], None)))
		.await
		.expect("at capacity the poll must not be held")
		.unwrap();

	assert_eq!(body_of(resp).await, Bytes::from_static(b"[]"));
	assert_eq!(h.service.manager().client_count(), 0);
}

#[tokio::test]
async fn dlp_and_disabled_long_polling_answer_immediately() {
	let h = harness(hold_for(Duration::from_secs(30)), 10);
	let resp = timeout(
		Duration::from_millis(500),
		h.service.handle(poll_request("abc", &[("/x", 0)], Some("dlp=t"))),
	)
	.await
	.unwrap()
	.unwrap();
	assert!(messages_of(resp).await.is_empty());

	let h = harness(
		EndpointConfig {
			long_polling_enabled: false,
			..EndpointConfig::default()
		},
		10,
	);
	let resp = timeout(Duration::from_millis(500), h.service.handle(poll_request("abc", &[("/x", 0)], None)))
		.await
		.unwrap()
		.unwrap();
	assert!(messages_of(resp).await.is_empty());
}

#[tokio::test]
async fn dropped_request_leaves_no_session_behind() {
	let h = harness(hold_for(Duration::from_secs(30)), 10);
	let service = h.service.clone();

	let poll = tokio::spawn(async move { service.handle(poll_request("abc", &[("/x", 0)], None)).await });
	for _ in 0..100 {
		if h.service.manager().client_count() == 1 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	assert_eq!(h.service.manager().client_count(), 1);

	poll.abort();
	let _ = poll.await;
	assert_eq!(h.service.manager().client_count(), 0);
}

#[tokio::test]
async fn missing_client_id_is_not_found() {
	let h = harness(EndpointConfig::default(), 10);
	let req = Request::post("/message-bus/").body(Full::new(Bytes::new())).unwrap();
	let resp = h.service.handle(req).await.unwrap();
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
	assert_eq!(body_of(resp).await, Bytes::from_static(b"not found"));
}

#[tokio::test]
async fn other_paths_reach_wrapped_app() {
	let state = HealthState::new();
	state.mark_ready();
	let h = harness(EndpointConfig::default(), 10);
	let service = h.service.with_app(Arc::new(HealthApp::new(state)));

	let resp = service.handle(Request::get("/readyz").body(Full::new(Bytes::new())).unwrap()).await.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(body_of(resp).await, Bytes::from_static(b"ready"));

	let resp = service
		.handle(Request::get("/message-bus/_diagnostics").body(Full::new(Bytes::new())).unwrap())
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn broadcast_requires_opt_in() {
	let h = harness(EndpointConfig::default(), 10);
	let req = Request::post(routes::BROADCAST)
		.body(Full::new(Bytes::from_static(b"channel=/b&data=hi")))
		.unwrap();
	assert_eq!(h.service.handle(req).await.unwrap().status(), StatusCode::NOT_FOUND);
	assert_eq!(h.log.last_id("/b").await.unwrap(), 0);

	let h = harness(
		EndpointConfig {
			allow_broadcast: true,
			..EndpointConfig::default()
		},
		10,
	);
	let req = Request::post(routes::BROADCAST)
		.body(Full::new(Bytes::from_static(b"channel=/b&data=hi")))
		.unwrap();
	let resp = h.service.handle(req).await.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(body_of(resp).await, Bytes::from_static(b"sent"));

	let stored = h.log.backlog("/b", -1).await.unwrap();
	assert_eq!(stored.len(), 1);
	assert_eq!(stored[0].data, json!("hi"));
}

#[tokio::test]
async fn identity_headers_unlock_targeted_backlog() {
	let h = harness(hold_for(Duration::from_millis(50)), 10);
	let service = h.service.clone().with_auth(Arc::new(HeaderAuthResolver));
	let targets = MessageTargets {
		user_ids: Some(vec![7]),
		..MessageTargets::default()
	};
	h.log.publish("/private", json!("secret"), targets).await.unwrap();

	let anonymous = service.handle(poll_request("a", &[("/private", -1)], Some("dlp=t"))).await.unwrap();
	assert!(messages_of(anonymous).await.is_empty());

	let mut req = poll_request("b", &[("/private", -1)], Some("dlp=t"));
	req.headers_mut().insert(USER_ID_HEADER, "7".parse().unwrap());
	let owner = service.handle(req).await.unwrap();
	assert_eq!(messages_of(owner).await.len(), 1);
}

#[tokio::test]
async fn oversized_poll_body_is_rejected_without_holding() {
	let h = harness(
		EndpointConfig {
			max_body_bytes: 16,
			..EndpointConfig::default()
		},
		10,
	);
	let subs = [("/a-rather-long-channel-name", 0), ("/another-long-channel", 0)];
	let resp = timeout(Duration::from_millis(500), h.service.handle(poll_request("abc", &subs, None)))
		.await
		.expect("rejection must not hold")
		.unwrap();
	assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
	assert_eq!(h.service.manager().client_count(), 0);
}

/// Wrapped app reporting how many body bytes it read itself.
struct BodyLength;

#[async_trait::async_trait]
impl Fallback for BodyLength {
	async fn call(&self, req: AppRequest) -> BusResponse {
		let len = req.into_body().collect().await.map(|c| c.to_bytes().len()).unwrap_or(0);
		hyper::Response::new(Full::new(Bytes::from(len.to_string())))
	}
}

#[tokio::test]
async fn pass_through_body_is_not_limited() {
	let h = harness(
		EndpointConfig {
			max_body_bytes: 16,
			..EndpointConfig::default()
		},
		10,
	);
	let service = h.service.with_app(Arc::new(BodyLength));

	let req = Request::post("/upload").body(Full::new(Bytes::from(vec![b'x'; 1024]))).unwrap();
	let resp = service.handle(req).await.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(body_of(resp).await, Bytes::from_static(b"1024"));
}
