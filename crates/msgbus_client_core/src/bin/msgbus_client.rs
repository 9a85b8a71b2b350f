#![forbid(unsafe_code)]

use std::time::Duration;

use msgbus_client_core::{DEFAULT_BASE_URL, MessageBusClient, PollerConfig};
use tracing::info;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: msgbus_client [--connect http://host:port] [--channel name]... [--no-long-poll]\n\
\n\
Options:\n\
	--connect       Server base URL (alias: --endpoint) (default: {DEFAULT_BASE_URL})\n\
	--channel       Channel to subscribe to (repeatable; default: /test)\n\
	--last-id       Cursor applied to every channel (default: -1, full backlog)\n\
	--no-long-poll  Send every poll with dlp=t\n\
	--interval-ms   Delay between empty polls (default: 60000)\n\
	--help          Show this help\n\
\n\
Examples:\n\
	msgbus_client --connect http://127.0.0.1:18300 --channel /test\n\
	msgbus_client --channel /chat/a --channel /chat/b --last-id 0\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,msgbus_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	cfg: PollerConfig,
	channels: Vec<String>,
	last_id: i64,
}

fn parse_args() -> Args {
	let mut cfg = PollerConfig::default();
	let mut channels: Vec<String> = Vec::new();
	let mut last_id = -1;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected http://host:port)");
					usage_and_exit();
				}
				cfg.base_url = v;
			}
			"--channel" => {
				let c = it.next().unwrap_or_else(|| usage_and_exit());
				if c.trim().is_empty() {
					eprintln!("--channel must be non-empty");
					usage_and_exit();
				}
				channels.push(c);
			}
			"--last-id" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				last_id = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --last-id value: {v}");
					usage_and_exit()
				});
			}
			"--interval-ms" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let ms: u64 = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --interval-ms value: {v}");
					usage_and_exit()
				});
				cfg.callback_interval = Duration::from_millis(ms);
			}
			"--no-long-poll" => cfg.enable_long_polling = false,
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	if channels.is_empty() {
		channels.push("/test".to_string());
	}

	Args { cfg, channels, last_id }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let client = MessageBusClient::new(args.cfg)?;
	info!(
		client_id = %client.client_id(),
		base_url = %client.config().base_url,
		channels = ?args.channels,
		"subscribing"
	);

	for channel in &args.channels {
		let name = channel.clone();
		client.subscribe(channel.clone(), move |data| println!("[{name}] {data}"), Some(args.last_id))?;
	}

	tokio::signal::ctrl_c().await?;
	info!("interrupted; stopping");
	client.stop();

	Ok(())
}
