#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use axum::routing::get;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::bus::{BroadcastBus, BusConfig, LocalBus, RedisBus};
use crate::server::gateway::AppState;
use crate::server::health::HealthState;
use crate::server::presence::{InMemoryPresence, PresenceDirectory, RedisPresence};
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::router::{RouterConfig, spawn_bus_router};
use crate::server::status::StatusTracker;
use crate::server::store::ChatStore;
use crate::server::typing::{InMemoryTypingTracker, RedisTypingTracker, TypingTracker};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind    Bind address (default: 127.0.0.1:8203)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind = "127.0.0.1:8203".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				bind = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind.parse().unwrap_or_else(|e| {
		eprintln!("invalid bind address {bind}: {e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("parley_server");
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let Some(auth_secret) = cfg.server.auth_hmac_secret.clone() else {
		return Err(anyhow::anyhow!(
			"auth_hmac_secret must be configured (config [server] or PARLEY_AUTH_HMAC_SECRET)"
		));
	};

	let database_url = cfg.persistence.database_url.clone().unwrap_or_else(|| {
		warn!("no database_url configured; using an in-memory sqlite store");
		"sqlite::memory:".to_string()
	});
	let store = ChatStore::connect(&database_url).await?;
	let status = StatusTracker::new(&store);

	let (presence, typing, bus): (Arc<dyn PresenceDirectory>, Arc<dyn TypingTracker>, Arc<dyn BroadcastBus>) =
		match cfg.redis.url.as_deref() {
			Some(url) => {
				let client = redis::Client::open(url).context("open redis client")?;
				let shared = client
					.get_multiplexed_async_connection()
					.await
					.context("connect redis")?;
				info!("redis connected; cross-process presence and bus enabled");

				(
					Arc::new(RedisPresence::new(shared.clone(), cfg.delivery.presence_ttl_secs)),
					Arc::new(RedisTypingTracker::new(shared.clone())),
					Arc::new(RedisBus::start(client, shared, BusConfig::default())),
				)
			}
			None => (
				Arc::new(InMemoryPresence::new(cfg.delivery.presence_ttl_secs)),
				Arc::new(InMemoryTypingTracker::new()),
				Arc::new(LocalBus::new(BusConfig::default())),
			),
		};

	let room_hub = RoomHub::new(RoomHubConfig::default());
	let _router_task = spawn_bus_router(&bus, room_hub.clone(), Arc::clone(&typing), RouterConfig::default());

	let health = HealthState::new();
	let app = Arc::new(AppState {
		settings: cfg.delivery.clone(),
		auth_secret,
		store,
		status,
		presence,
		typing,
		bus: Arc::clone(&bus),
		room_hub,
		health: health.clone(),
	});

	let router = Router::new()
		.route("/ws", get(crate::server::gateway::ws_handler))
		.route("/healthz", get(crate::server::health::healthz))
		.route("/readyz", get(crate::server::health::readyz))
		.with_state(Arc::clone(&app));

	let listener = tokio::net::TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;
	info!(%bind_addr, "parley_server listening");

	health.mark_ready();

	axum::serve(listener, router)
		.with_graceful_shutdown(async {
			let _ = tokio::signal::ctrl_c().await;
			info!("shutdown signal received");
		})
		.await
		.context("serve")?;

	bus.shutdown().await;

	Ok(())
}
