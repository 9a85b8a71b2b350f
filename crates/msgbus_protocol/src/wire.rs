#![forbid(unsafe_code)]

use msgbus_domain::{Message, UNSEEN_ID, normalize_last_id};
use thiserror::Error;
use url::form_urlencoded;

/// `Cache-Control` sent with every poll response.
pub const CACHE_CONTROL: &str = "must-revalidate, private, max-age=0";

/// `Content-Type` sent with every poll response.
pub const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";

/// Body of a poll response with nothing to deliver.
pub const EMPTY_BATCH: &str = "[]";

/// Query flag forcing an immediate (non-held) response when set to `t`.
pub const DISABLE_LONG_POLL_PARAM: &str = "dlp";

#[derive(Debug, Error)]
pub enum WireError {
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("expected a JSON array of messages")]
	NotAnArray,
}

/// Serialize a batch as `[{global_id, message_id, channel, data}, ...]`.
pub fn encode_messages(messages: &[Message]) -> Result<String, WireError> {
	Ok(serde_json::to_string(messages)?)
}

/// Parse a poll response body.
pub fn decode_messages(body: &[u8]) -> Result<Vec<Message>, WireError> {
	let value: serde_json::Value = serde_json::from_slice(body)?;
	if !value.is_array() {
		return Err(WireError::NotAnArray);
	}
	Ok(serde_json::from_value(value)?)
}

/// Parse a form encoded `channel=last_id` body, preserving request order.
///
/// Cursors that do not parse as integers are treated as unseen.
pub fn parse_subscriptions(form: &[u8]) -> Vec<(String, i64)> {
	form_urlencoded::parse(form)
		.filter(|(channel, _)| !channel.is_empty())
		.map(|(channel, last_id)| {
			let last_id = last_id.trim().parse::<i64>().map(normalize_last_id).unwrap_or(UNSEEN_ID);
			(channel.into_owned(), last_id)
		})
		.collect()
}

/// Form encode `channel=last_id` pairs for a poll request body.
pub fn encode_subscriptions<'a>(subs: impl IntoIterator<Item = (&'a str, i64)>) -> String {
	let mut ser = form_urlencoded::Serializer::new(String::new());
	for (channel, last_id) in subs {
		ser.append_pair(channel, &last_id.to_string());
	}
	ser.finish()
}

/// First value of `key` in a form encoded string.
pub fn form_value(form: &[u8], key: &str) -> Option<String> {
	form_urlencoded::parse(form).find(|(k, _)| k == key).map(|(_, v)| v.into_owned())
}

/// True when the query string asks the server not to hold the connection.
pub fn long_poll_disabled(query: Option<&str>) -> bool {
	let Some(query) = query else {
		return false;
	};
	form_urlencoded::parse(query.as_bytes()).any(|(k, v)| k == DISABLE_LONG_POLL_PARAM && v == "t")
}
