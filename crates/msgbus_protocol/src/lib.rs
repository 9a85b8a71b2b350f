#![forbid(unsafe_code)]

pub mod wire;

pub use wire::{
	CACHE_CONTROL, CONTENT_TYPE_JSON, DISABLE_LONG_POLL_PARAM, EMPTY_BATCH, WireError, decode_messages, encode_messages,
	encode_subscriptions, form_value, long_poll_disabled, parse_subscriptions,
};

/// Route layout of the message bus HTTP surface.
pub mod routes {
	/// Every bus route lives under this prefix; other paths pass through.
	pub const PREFIX: &str = "/message-bus/";

	/// Debug publish route (disabled unless explicitly allowed).
	pub const BROADCAST: &str = "/message-bus/broadcast";

	/// Diagnostics routes prefix.
	pub const DIAGNOSTICS_PREFIX: &str = "/message-bus/_diagnostics";

	/// Path of the poll route for `client_id`.
	pub fn poll_path(client_id: &str) -> String {
		format!("{PREFIX}{client_id}/poll")
	}

	/// Extract the client id segment from `/message-bus/{client_id}/...`.
	pub fn client_id_segment(path: &str) -> Option<&str> {
		path.strip_prefix(PREFIX)?
			.split('/')
			.next()
			.filter(|s| !s.is_empty())
	}
}
