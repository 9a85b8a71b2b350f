#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use msgbus_server::config::{ServerConfig, default_config_path, load_server_config_from_path};
use msgbus_server::server::auth::{AnonymousResolver, AuthContextResolver, HeaderAuthResolver};
use msgbus_server::server::health::{HealthApp, HealthState};
use msgbus_server::{
	ChannelLog, ChannelLogConfig, ConnectionManager, ConnectionManagerConfig, DispatcherConfig, EndpointConfig,
	InMemoryChannelLog, MessageBusService, serve, spawn_dispatcher,
};
use msgbus_util::endpoint::HttpEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_BIND: &str = "http://127.0.0.1:18300";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: msgbus_server [--bind http://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: {DEFAULT_BIND})\n\
\t         Format: http://host:port\n\
\t--config  Config file (default: ~/.msgbus/config.toml)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: std::net::SocketAddr,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut bind_endpoint = DEFAULT_BIND.to_string();
	let mut config = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected http://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let endpoint = HttpEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let bind = endpoint.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args { bind, config }
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,msgbus_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("msgbus_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn build_service(cfg: &ServerConfig, health: HealthState) -> MessageBusService {
	let log = Arc::new(InMemoryChannelLog::new(ChannelLogConfig {
		per_channel_capacity: cfg.bus.per_channel_capacity,
		notify_capacity: cfg.bus.notify_capacity,
	}));

	let manager = ConnectionManager::new(ConnectionManagerConfig {
		max_active_clients: cfg.long_polling.max_active_clients,
		debug_logs: false,
	});

	let _dispatcher = spawn_dispatcher(log.as_ref(), manager.clone(), DispatcherConfig::default());

	let auth: Arc<dyn AuthContextResolver> = if cfg.server.trust_identity_headers {
		info!("auth: resolving identity from trusted proxy headers");
		Arc::new(HeaderAuthResolver)
	} else {
		Arc::new(AnonymousResolver)
	};

	let endpoint_cfg = EndpointConfig {
		long_polling_enabled: cfg.long_polling.enabled,
		long_polling_interval: cfg.long_polling.interval,
		allow_broadcast: cfg.bus.allow_broadcast,
		max_body_bytes: cfg.server.max_body_bytes,
	};

	let log: Arc<dyn ChannelLog> = log;
	MessageBusService::new(endpoint_cfg, log, manager)
		.with_auth(auth)
		.with_app(Arc::new(HealthApp::new(health)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => default_config_path()?,
	};
	let server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	let service = build_service(&server_cfg, health_state.clone());

	let listener = TcpListener::bind(args.bind).await?;
	info!(
		bind = %args.bind,
		long_polling = server_cfg.long_polling.enabled,
		interval_ms = server_cfg.long_polling.interval.as_millis() as u64,
		max_active_clients = server_cfg.long_polling.max_active_clients,
		"msgbus_server: listening"
	);

	health_state.mark_ready();

	serve(listener, service).await
}
