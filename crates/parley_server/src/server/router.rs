#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_protocol::bus::BusEvent;
use parley_protocol::{DeliveryEnvelope, MessageData, ServerEvent, TypingSignal};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::server::bus::BroadcastBus;
use crate::server::room_hub::RoomHub;
use crate::server::typing::TypingTracker;

/// Settings for the bus router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
	pub debug_log_events: bool,

	pub log_upstream_lag: bool,
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self {
			debug_log_events: false,
			log_upstream_lag: true,
		}
	}
}

/// Router that consumes the bus fan-in and re-emits each event to the
/// local members of its chat room, excluding the origin connection. This
/// is the only delivery path to recipients; the sender's own connection
/// is answered directly by its handler and never re-delivered to.
pub struct BusRouter {
	cfg: RouterConfig,
	room_hub: RoomHub,
	typing: Arc<dyn TypingTracker>,
	events_rx: broadcast::Receiver<BusEvent>,
}

impl BusRouter {
	pub fn new(
		events_rx: broadcast::Receiver<BusEvent>,
		room_hub: RoomHub,
		typing: Arc<dyn TypingTracker>,
		cfg: RouterConfig,
	) -> Self {
		Self {
			cfg,
			room_hub,
			typing,
			events_rx,
		}
	}

	/// Run the routing loop until the upstream fan-in is closed.
	pub async fn run(mut self) {
		info!("bus router started");

		loop {
			let event = match self.events_rx.recv().await {
				Ok(ev) => ev,
				Err(broadcast::error::RecvError::Lagged(n)) => {
					if self.cfg.log_upstream_lag {
						warn!(lagged = n, "bus router lagged on fan-in; some events were dropped before routing");
					}
					continue;
				}
				Err(broadcast::error::RecvError::Closed) => {
					info!("bus router exiting (fan-in closed)");
					break;
				}
			};

			self.route_one(event).await;
		}
	}

	async fn route_one(&self, event: BusEvent) {
		match event {
			BusEvent::Message(env) => {
				if self.cfg.debug_log_events {
					debug!(chat = %env.chat_id, origin = %env.origin, "routing message to local room");
				}

				let out = ServerEvent::delivery(
					env.is_group,
					DeliveryEnvelope::success(
						"New message received",
						MessageData {
							chat_id: env.chat_id.clone(),
							message: env.message,
						},
					),
				);
				self.room_hub.emit_to_room(&env.chat_id, &out, Some(env.origin));
			}
			BusEvent::Typing(env) => {
				let out = ServerEvent::Typing(TypingSignal {
					chat_id: env.chat_id.clone(),
					from_user_id: env.from_user_id.clone(),
				});
				self.room_hub.emit_to_room(&env.chat_id, &out, Some(env.origin));

				// Refresh the sender's claim so the TTL backstop keeps
				// pace with an actively-typing user.
				if let Some(ttl) = env.ttl_secs
					&& let Err(e) = self.typing.mark(&env.from_user_id, env.origin, &env.chat_id, ttl).await
				{
					warn!(chat = %env.chat_id, error = %e, "typing claim refresh failed");
				}
			}
			BusEvent::StopTyping(env) => {
				let out = ServerEvent::StopTyping(TypingSignal {
					chat_id: env.chat_id.clone(),
					from_user_id: env.from_user_id.clone(),
				});
				self.room_hub.emit_to_room(&env.chat_id, &out, Some(env.origin));

				if let Err(e) = self.typing.clear(&env.from_user_id, env.origin, &env.chat_id).await {
					warn!(chat = %env.chat_id, error = %e, "typing claim clear failed");
				}
			}
		}
	}
}

/// Spawn a background task that routes bus events into the room hub.
pub fn spawn_bus_router(
	bus: &Arc<dyn BroadcastBus>,
	room_hub: RoomHub,
	typing: Arc<dyn TypingTracker>,
	cfg: RouterConfig,
) -> tokio::task::JoinHandle<()> {
	let router = BusRouter::new(bus.subscribe(), room_hub, typing, cfg);

	tokio::spawn(async move {
		router.run().await;
	})
}
