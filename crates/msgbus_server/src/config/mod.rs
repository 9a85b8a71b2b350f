#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::endpoint::DEFAULT_MAX_BODY_BYTES;

/// Default config path: `~/.msgbus/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".msgbus").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Server config.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub long_polling: LongPollingSettings,
	pub bus: BusSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Resolve identity from `X-Msgbus-*` headers set by a trusted proxy.
	pub trust_identity_headers: bool,
	/// Body limit for poll and broadcast requests.
	pub max_body_bytes: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			trust_identity_headers: false,
			max_body_bytes: DEFAULT_MAX_BODY_BYTES,
		}
	}
}

#[derive(Debug, Clone)]
pub struct LongPollingSettings {
	pub enabled: bool,
	pub interval: Duration,
	pub max_active_clients: usize,
}

impl Default for LongPollingSettings {
	fn default() -> Self {
		Self {
			enabled: true,
			interval: Duration::from_millis(25_000),
			max_active_clients: 1000,
		}
	}
}

#[derive(Debug, Clone)]
pub struct BusSettings {
	/// Expose the debug publish route.
	pub allow_broadcast: bool,
	/// Messages retained per channel.
	pub per_channel_capacity: usize,
	/// Publish notification buffer feeding the dispatcher.
	pub notify_capacity: usize,
}

impl Default for BusSettings {
	fn default() -> Self {
		Self {
			allow_broadcast: false,
			per_channel_capacity: 1000,
			notify_capacity: 1024,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	long_polling: FileLongPollingSettings,

	#[serde(default)]
	bus: FileBusSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	trust_identity_headers: Option<bool>,
	max_body_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLongPollingSettings {
	enabled: Option<bool>,
	interval_ms: Option<u64>,
	max_active_clients: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBusSettings {
	allow_broadcast: Option<bool>,
	per_channel_capacity: Option<usize>,
	notify_capacity: Option<usize>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let lp_default = LongPollingSettings::default();
		let bus_default = BusSettings::default();

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				trust_identity_headers: file.server.trust_identity_headers.unwrap_or(false),
				max_body_bytes: file
					.server
					.max_body_bytes
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_MAX_BODY_BYTES),
			},
			long_polling: LongPollingSettings {
				enabled: file.long_polling.enabled.unwrap_or(lp_default.enabled),
				interval: file
					.long_polling
					.interval_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(lp_default.interval),
				max_active_clients: file
					.long_polling
					.max_active_clients
					.unwrap_or(lp_default.max_active_clients),
			},
			bus: BusSettings {
				allow_broadcast: file.bus.allow_broadcast.unwrap_or(bus_default.allow_broadcast),
				per_channel_capacity: file
					.bus
					.per_channel_capacity
					.filter(|v| *v > 0)
					.unwrap_or(bus_default.per_channel_capacity),
				notify_capacity: file
					.bus
					.notify_capacity
					.filter(|v| *v > 0)
					.unwrap_or(bus_default.notify_capacity),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, var: impl Fn(&str) -> Option<String>) {
	if let Some(v) = var("MSGBUS_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Some(v) = var("MSGBUS_TRUST_IDENTITY_HEADERS")
		&& let Some(trust) = parse_env_bool(&v)
	{
		cfg.server.trust_identity_headers = trust;
		info!(trust, "server config: trust_identity_headers overridden by env");
	}

	if let Some(v) = var("MSGBUS_MAX_BODY_BYTES")
		&& let Ok(max) = v.trim().parse::<usize>()
		&& max > 0
	{
		cfg.server.max_body_bytes = max;
		info!(max, "server config: max_body_bytes overridden by env");
	}

	if let Some(v) = var("MSGBUS_LONG_POLLING_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.long_polling.enabled = enabled;
		info!(enabled, "long polling: enabled overridden by env");
	}

	if let Some(v) = var("MSGBUS_LONG_POLLING_INTERVAL_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		if ms == 0 {
			warn!("long polling: MSGBUS_LONG_POLLING_INTERVAL_MS must be positive; ignoring");
		} else {
			cfg.long_polling.interval = Duration::from_millis(ms);
			info!(ms, "long polling: interval overridden by env");
		}
	}

	if let Some(v) = var("MSGBUS_MAX_ACTIVE_CLIENTS")
		&& let Ok(max) = v.trim().parse::<usize>()
	{
		cfg.long_polling.max_active_clients = max;
		info!(max, "long polling: max_active_clients overridden by env");
	}

	if let Some(v) = var("MSGBUS_ALLOW_BROADCAST")
		&& let Some(allow) = parse_env_bool(&v)
	{
		cfg.bus.allow_broadcast = allow;
		info!(allow, "bus config: allow_broadcast overridden by env");
	}

	if let Some(v) = var("MSGBUS_PER_CHANNEL_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.bus.per_channel_capacity = capacity;
		info!(capacity, "bus config: per_channel_capacity overridden by env");
	}

	if cfg.bus.allow_broadcast {
		warn!("bus config: unauthenticated broadcast route is enabled");
	}
}
