#![forbid(unsafe_code)]

use hyper::http::request::Parts;
use msgbus_domain::AuthContext;
use tracing::debug;

pub const USER_ID_HEADER: &str = "x-msgbus-user-id";
pub const SITE_ID_HEADER: &str = "x-msgbus-site-id";
pub const GROUP_IDS_HEADER: &str = "x-msgbus-group-ids";

/// Resolves the authorization context of a poll request.
pub trait AuthContextResolver: Send + Sync {
	fn resolve(&self, parts: &Parts) -> AuthContext;
}

/// Every client is anonymous; only unrestricted messages are visible.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousResolver;

impl AuthContextResolver for AnonymousResolver {
	fn resolve(&self, _parts: &Parts) -> AuthContext {
		AuthContext::anonymous()
	}
}

/// Reads identity from headers set by a trusted reverse proxy.
///
/// Only enable this when the proxy strips these headers from client requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderAuthResolver;

impl AuthContextResolver for HeaderAuthResolver {
	fn resolve(&self, parts: &Parts) -> AuthContext {
		let header = |name: &str| {
			parts
				.headers
				.get(name)
				.and_then(|v| v.to_str().ok())
				.map(str::trim)
				.filter(|v| !v.is_empty())
		};

		let user_id = header(USER_ID_HEADER).and_then(|v| v.parse::<i64>().ok());
		let site_id = header(SITE_ID_HEADER).map(str::to_string);
		let group_ids = header(GROUP_IDS_HEADER).map(|v| {
			v.split(',')
				.filter_map(|g| g.trim().parse::<i64>().ok())
				.collect::<Vec<_>>()
		});

		debug!(?user_id, ?site_id, ?group_ids, "resolved auth context from headers");

		AuthContext {
			user_id,
			site_id,
			group_ids,
		}
	}
}
