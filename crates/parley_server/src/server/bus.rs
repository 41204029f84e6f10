#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use futures::StreamExt as _;
use parley_domain::BusChannel;
use parley_protocol::bus::BusEvent;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Default capacity of the local fan-in channel fed by the subscribers.
pub const DEFAULT_BUS_FANIN_CAPACITY: usize = 8_192;

/// Broadcast bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
	pub fanin_capacity: usize,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
}

impl Default for BusConfig {
	fn default() -> Self {
		Self {
			fanin_capacity: DEFAULT_BUS_FANIN_CAPACITY,
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
		}
	}
}

/// Cross-process publish/subscribe fan-out.
///
/// Publishing is fire-and-forget; no subscriber acknowledgment exists and
/// events published while a process's subscription is down are lost for
/// that process. Receivers must tolerate duplicates.
#[async_trait::async_trait]
pub trait BroadcastBus: Send + Sync {
	/// Publish one event to its channel.
	async fn publish(&self, event: BusEvent) -> anyhow::Result<()>;

	/// Subscribe to the local fan-in of everything the process receives,
	/// including its own publishes.
	fn subscribe(&self) -> broadcast::Receiver<BusEvent>;

	/// Drain subscriptions on shutdown.
	async fn shutdown(&self) {}
}

/// In-process bus for tests and single-process deployments: a publish is
/// immediately visible on the local fan-in.
pub struct LocalBus {
	events_tx: broadcast::Sender<BusEvent>,
}

impl LocalBus {
	pub fn new(cfg: BusConfig) -> Self {
		let (events_tx, _) = broadcast::channel(cfg.fanin_capacity);
		Self { events_tx }
	}
}

#[async_trait::async_trait]
impl BroadcastBus for LocalBus {
	async fn publish(&self, event: BusEvent) -> anyhow::Result<()> {
		metrics::counter!("parley_server_bus_published_total").increment(1);
		// No receivers is fine: nobody is connected locally.
		let _ = self.events_tx.send(event);
		Ok(())
	}

	fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
		self.events_tx.subscribe()
	}
}

/// Redis pub/sub bus. One long-lived pattern subscription per channel
/// family, opened at startup regardless of which chats are active locally.
pub struct RedisBus {
	publisher: redis::aio::MultiplexedConnection,
	events_tx: broadcast::Sender<BusEvent>,
	subscriber_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RedisBus {
	/// Start the bus: publishing shares the given multiplexed connection
	/// (cloned per publish, no lock), and one dedicated subscriber
	/// connection per family is spawned.
	pub fn start(client: redis::Client, publisher: redis::aio::MultiplexedConnection, cfg: BusConfig) -> Self {
		let (events_tx, _) = broadcast::channel(cfg.fanin_capacity);

		let message_task = spawn_subscriber(
			client.clone(),
			vec![BusChannel::MESSAGE_PATTERN.to_string()],
			events_tx.clone(),
			cfg.clone(),
			"chat",
		);
		let typing_task = spawn_subscriber(
			client,
			vec![
				BusChannel::TYPING_PATTERN.to_string(),
				BusChannel::STOP_TYPING_PATTERN.to_string(),
			],
			events_tx.clone(),
			cfg,
			"typing",
		);

		Self {
			publisher,
			events_tx,
			subscriber_tasks: vec![message_task, typing_task],
		}
	}
}

#[async_trait::async_trait]
impl BroadcastBus for RedisBus {
	async fn publish(&self, event: BusEvent) -> anyhow::Result<()> {
		let channel = event.channel().format();
		let payload = event.encode_payload().context("encode bus payload")?;

		let mut conn = self.publisher.clone();
		redis::cmd("PUBLISH")
			.arg(&channel)
			.arg(payload)
			.query_async::<_, ()>(&mut conn)
			.await
			.with_context(|| format!("publish to {channel}"))?;

		metrics::counter!("parley_server_bus_published_total").increment(1);
		Ok(())
	}

	fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
		self.events_tx.subscribe()
	}

	async fn shutdown(&self) {
		for task in &self.subscriber_tasks {
			task.abort();
		}
		info!("bus subscriptions drained");
	}
}

/// Run one pattern subscription until aborted, reconnecting with backoff.
/// Events published while the subscription is down are lost for this
/// process; delivery-status recovery happens via the backlog drain, not
/// here.
fn spawn_subscriber(
	client: redis::Client,
	patterns: Vec<String>,
	events_tx: broadcast::Sender<BusEvent>,
	cfg: BusConfig,
	family: &'static str,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut delay = cfg.reconnect_min_delay;

		loop {
			match run_subscription(&client, &patterns, &events_tx).await {
				Ok(()) => {
					warn!(family, "bus subscription ended; resubscribing");
					delay = cfg.reconnect_min_delay;
				}
				Err(e) => {
					warn!(family, error = %e, "bus subscription failed; resubscribing");
				}
			}

			metrics::counter!("parley_server_bus_reconnects_total").increment(1);
			tokio::time::sleep(delay).await;
			delay = (delay * 2).min(cfg.reconnect_max_delay);
		}
	})
}

async fn run_subscription(
	client: &redis::Client,
	patterns: &[String],
	events_tx: &broadcast::Sender<BusEvent>,
) -> anyhow::Result<()> {
	let mut pubsub = client.get_async_pubsub().await.context("open subscriber connection")?;
	for pattern in patterns {
		pubsub.psubscribe(pattern).await.with_context(|| format!("psubscribe {pattern}"))?;
	}

	info!(patterns = ?patterns, "bus subscription established");

	let mut stream = pubsub.on_message();
	while let Some(msg) = stream.next().await {
		let channel = msg.get_channel_name().to_string();
		let payload: String = match msg.get_payload() {
			Ok(p) => p,
			Err(e) => {
				warn!(%channel, error = %e, "bus payload was not a string");
				continue;
			}
		};

		match BusEvent::decode(&channel, &payload) {
			Ok(event) => {
				metrics::counter!("parley_server_bus_received_total").increment(1);
				let _ = events_tx.send(event);
			}
			Err(e) => {
				metrics::counter!("parley_server_bus_decode_errors_total").increment(1);
				debug!(%channel, error = %e, "dropping undecodable bus payload");
			}
		}
	}

	Ok(())
}
