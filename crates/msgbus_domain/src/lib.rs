#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pseudo-channel carrying `{channel: latest_id}` batches for cursor fast-forwarding.
pub const STATUS_CHANNEL: &str = "/__status";

/// Cursor value meaning "no message seen yet on this channel".
pub const UNSEEN_ID: i64 = -1;

/// Clamp a client supplied cursor into the valid range (`>= -1`).
#[inline]
pub fn normalize_last_id(last_id: i64) -> i64 {
	last_id.max(UNSEEN_ID)
}

/// Errors for parsing identifiers and channel specs from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseChannelError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Identifier of one polling client (one browser tab), stable across polls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
	/// Create a new random client id (32 lowercase hex chars).
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4().simple().to_string())
	}

	/// Validate a client id taken from a request path segment.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseChannelError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseChannelError::Empty);
		}
		if id.contains('/') {
			return Err(ParseChannelError::InvalidFormat(format!("client id must not contain '/': {id}")));
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ClientId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ClientId {
	type Err = ParseChannelError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ClientId::new(s.to_string())
	}
}

/// Channel selector used when removing subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelPattern {
	/// Matches exactly one channel name.
	Exact(String),
	/// Matches every channel starting with the prefix.
	PrefixWildcard(String),
}

impl ChannelPattern {
	/// Trailing marker turning a spec into a prefix match.
	pub const WILDCARD: char = '*';

	/// Parse a spec; a trailing `*` makes it a prefix wildcard.
	pub fn parse(spec: &str) -> Result<Self, ParseChannelError> {
		if spec.is_empty() {
			return Err(ParseChannelError::Empty);
		}

		match spec.strip_suffix(Self::WILDCARD) {
			Some(prefix) => Ok(Self::PrefixWildcard(prefix.to_string())),
			None => Ok(Self::Exact(spec.to_string())),
		}
	}

	pub fn matches(&self, channel: &str) -> bool {
		match self {
			ChannelPattern::Exact(name) => name == channel,
			ChannelPattern::PrefixWildcard(prefix) => channel.starts_with(prefix.as_str()),
		}
	}
}

impl fmt::Display for ChannelPattern {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ChannelPattern::Exact(name) => f.write_str(name),
			ChannelPattern::PrefixWildcard(prefix) => write!(f, "{prefix}{}", Self::WILDCARD),
		}
	}
}

impl FromStr for ChannelPattern {
	type Err = ParseChannelError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelPattern::parse(s)
	}
}

/// Authorization context of a polling client, resolved per request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
	pub user_id: Option<i64>,
	pub site_id: Option<String>,
	pub group_ids: Option<Vec<i64>>,
}

impl AuthContext {
	pub fn anonymous() -> Self {
		Self::default()
	}
}

/// Audience restriction attached to a published message.
///
/// An unrestricted message is visible to every client. Otherwise the client must match one of the
/// listed users or share a group, and the site (when set) must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageTargets {
	pub user_ids: Option<Vec<i64>>,
	pub group_ids: Option<Vec<i64>>,
	pub site_id: Option<String>,
}

impl MessageTargets {
	pub fn is_unrestricted(&self) -> bool {
		self.user_ids.is_none() && self.group_ids.is_none() && self.site_id.is_none()
	}

	pub fn allows(&self, auth: &AuthContext) -> bool {
		if let Some(site) = self.site_id.as_deref()
			&& auth.site_id.as_deref() != Some(site)
		{
			return false;
		}

		if self.user_ids.is_none() && self.group_ids.is_none() {
			return true;
		}

		let user_match = match (&self.user_ids, auth.user_id) {
			(Some(users), Some(id)) => users.contains(&id),
			_ => false,
		};

		let group_match = match (&self.group_ids, &auth.group_ids) {
			(Some(targets), Some(mine)) => mine.iter().any(|g| targets.contains(g)),
			_ => false,
		};

		user_match || group_match
	}
}

/// A message as stored in a channel log and delivered to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
	pub global_id: i64,
	pub message_id: i64,
	pub channel: String,
	pub data: serde_json::Value,

	/// Server-side visibility, never sent on the wire.
	#[serde(skip)]
	pub targets: MessageTargets,
}

impl Message {
	pub fn new(global_id: i64, message_id: i64, channel: impl Into<String>, data: serde_json::Value) -> Self {
		Self {
			global_id,
			message_id,
			channel: channel.into(),
			data,
			targets: MessageTargets::default(),
		}
	}

	/// Build a `/__status` message from `channel -> latest_id` pairs.
	pub fn status(latest: BTreeMap<String, i64>) -> Self {
		let data = latest
			.into_iter()
			.map(|(channel, id)| (channel, serde_json::Value::from(id)))
			.collect::<serde_json::Map<_, _>>();
		Self::new(UNSEEN_ID, UNSEEN_ID, STATUS_CHANNEL, serde_json::Value::Object(data))
	}

	pub fn is_status(&self) -> bool {
		self.channel == STATUS_CHANNEL
	}

	/// Cursor carried by a status message for `channel`, if any.
	pub fn status_id_for(&self, channel: &str) -> Option<i64> {
		if !self.is_status() {
			return None;
		}
		self.data.get(channel).and_then(serde_json::Value::as_i64)
	}

	/// `channel -> latest_id` pairs of a status message (empty for regular messages).
	pub fn status_entries(&self) -> BTreeMap<String, i64> {
		if !self.is_status() {
			return BTreeMap::new();
		}

		self.data
			.as_object()
			.map(|obj| obj.iter().filter_map(|(k, v)| v.as_i64().map(|id| (k.clone(), id))).collect())
			.unwrap_or_default()
	}

	pub fn is_visible_to(&self, auth: &AuthContext) -> bool {
		self.targets.allows(auth)
	}
}
