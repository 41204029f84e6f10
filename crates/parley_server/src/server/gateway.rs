#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt as _, StreamExt as _};
use parley_domain::{ChatId, ConnectionId, MessageId, UserId};
use parley_protocol::bus::{BusEvent, MessageEnvelope, TypingEnvelope};
use parley_protocol::{ClientEvent, DeliveryEnvelope, MessageData, PrivateMessage, ServerEvent, TypingSignal};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::DeliverySettings;
use crate::server::bus::BroadcastBus;
use crate::server::error::DeliveryError;
use crate::server::health::HealthState;
use crate::server::presence::PresenceDirectory;
use crate::server::room_hub::RoomHub;
use crate::server::status::StatusTracker;
use crate::server::store::ChatStore;
use crate::server::typing::TypingTracker;
use crate::util::secret::SecretString;
use crate::util::time::unix_ms_now;

/// Everything a connection handler needs, constructed once at startup and
/// shared. No ambient globals: the clients are injected here and nowhere
/// else.
pub struct AppState {
	pub settings: DeliverySettings,
	pub auth_secret: SecretString,
	pub store: ChatStore,
	pub status: StatusTracker,
	pub presence: Arc<dyn PresenceDirectory>,
	pub typing: Arc<dyn TypingTracker>,
	pub bus: Arc<dyn BroadcastBus>,
	pub room_hub: RoomHub,
	pub health: HealthState,
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
	/// Bearer credential, carried out-of-band of the event stream.
	token: Option<String>,
}

/// WebSocket upgrade endpoint. Authentication completes before the
/// connection is admitted: a bad or missing token is refused here and
/// never reaches presence registration or any room.
pub async fn ws_handler(
	State(app): State<Arc<AppState>>,
	Query(query): Query<ConnectQuery>,
	ws: WebSocketUpgrade,
) -> Response {
	let Some(token) = query.token.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
		metrics::counter!("parley_server_unauthenticated_total").increment(1);
		return (StatusCode::UNAUTHORIZED, "missing token").into_response();
	};

	let claims = match crate::server::auth::verify_access_token(token, app.auth_secret.expose()) {
		Ok(claims) => claims,
		Err(e) => {
			metrics::counter!("parley_server_unauthenticated_total").increment(1);
			let err = DeliveryError::Unauthenticated(e.to_string());
			warn!(error = %err, "connection refused");
			return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
		}
	};

	let identity = match claims.identity() {
		Ok(identity) => identity,
		Err(e) => {
			metrics::counter!("parley_server_unauthenticated_total").increment(1);
			warn!(error = %e, "connection refused: unusable token subject");
			return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
		}
	};

	ws.on_upgrade(move |socket| handle_socket(app, socket, identity))
}

async fn handle_socket(app: Arc<AppState>, socket: WebSocket, user: UserId) {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::counter!("parley_server_connections_total").increment(1);
	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let conn = ConnectionId::new_v4();
	info!(%conn, user = %user, "connection established");

	let (tx, mut rx) = mpsc::channel::<ServerEvent>(app.settings.outbound_queue_capacity);
	let (mut sink, mut stream) = socket.split();

	let writer = tokio::spawn(async move {
		while let Some(event) = rx.recv().await {
			let json = match event.to_json() {
				Ok(json) => json,
				Err(e) => {
					warn!(error = %e, "failed to encode outbound event");
					continue;
				}
			};

			if sink.send(Message::Text(json.into())).await.is_err() {
				break;
			}
		}
	});

	let session = Session::connect(Arc::clone(&app), user, conn, tx).await;

	while let Some(msg) = stream.next().await {
		match msg {
			Ok(Message::Text(text)) => match ClientEvent::from_json(text.as_str()) {
				Ok(event) => session.handle_event(event).await,
				Err(e) => {
					debug!(%conn, error = %e, "ignoring undecodable client event");
				}
			},
			Ok(Message::Close(_)) => break,
			Ok(_) => {}
			Err(e) => {
				debug!(%conn, error = %e, "connection read failed");
				break;
			}
		}
	}

	session.disconnect().await;
	writer.abort();
}

/// Per-connection context: the authenticated identity plus the connection
/// locator, carried explicitly through every handler invocation.
pub(crate) struct Session {
	app: Arc<AppState>,
	user: UserId,
	conn: ConnectionId,
}

impl Session {
	/// Admit an authenticated connection: register its outbound queue,
	/// record presence, join the rooms of its persisted chats and drain
	/// the undelivered backlog.
	pub(crate) async fn connect(
		app: Arc<AppState>,
		user: UserId,
		conn: ConnectionId,
		tx: mpsc::Sender<ServerEvent>,
	) -> Self {
		app.room_hub.register(conn, tx);

		// Presence is best-effort: delivery does not depend on it.
		if let Err(e) = app.presence.set_online(&user, conn).await {
			warn!(user = %user, error = %e, "presence registration failed; continuing");
		}

		match app.store.chat_ids_for_user(&user).await {
			Ok(chats) => {
				for chat in &chats {
					app.room_hub.join(chat, conn);
				}
				debug!(user = %user, rooms = chats.len(), "joined persisted chat rooms");
			}
			Err(e) => {
				warn!(user = %user, error = %e, "failed to load chat memberships; joining no rooms");
			}
		}

		let session = Self { app, user, conn };
		session.drain_backlog().await;
		session
	}

	/// Emit every SENT message owed to this user to the fresh connection,
	/// then batch-advance exactly those entries to DELIVERED. The sole
	/// recovery path for messages sent while the user was offline.
	async fn drain_backlog(&self) {
		let entries = match self.app.status.sent_backlog(&self.user).await {
			Ok(entries) => entries,
			Err(e) => {
				warn!(user = %self.user, error = %e, "backlog query failed; will retry on next connect");
				return;
			}
		};

		if entries.is_empty() {
			return;
		}

		let mut queued: Vec<MessageId> = Vec::with_capacity(entries.len());
		for entry in entries {
			let event = ServerEvent::delivery(
				entry.is_group,
				DeliveryEnvelope::success(
					"Unread message",
					MessageData {
						chat_id: entry.message.chat_id.clone(),
						message: entry.message.to_body(),
					},
				),
			);

			if self.app.room_hub.send_to(self.conn, event) {
				queued.push(entry.message.id);
			}
		}

		metrics::counter!("parley_server_backlog_drained_total").increment(queued.len() as u64);

		if let Err(e) = self.app.status.mark_backlog_delivered(&self.user, &queued).await {
			warn!(user = %self.user, error = %e, "backlog status update failed");
		}
	}

	/// Dispatch one inbound event.
	pub(crate) async fn handle_event(&self, event: ClientEvent) {
		match event {
			ClientEvent::PrivateMessage(payload) => self.handle_private_message(payload).await,
			ClientEvent::Typing(signal) => self.handle_typing(signal, false).await,
			ClientEvent::StopTyping(signal) => self.handle_typing(signal, true).await,
		}
	}

	async fn handle_private_message(&self, payload: PrivateMessage) {
		let chat = match self.app.store.find_or_create_private_chat(&self.user, &payload.to_user_id).await {
			Ok(chat) => chat,
			Err(e) => {
				warn!(user = %self.user, error = %e, "private chat resolution failed");
				self.send_failure("Failed to send message");
				return;
			}
		};

		// The sender's room membership is lazily populated on first send.
		self.app.room_hub.join(&chat.id, self.conn);

		let created = match self
			.app
			.store
			.create_message(&chat, &self.user, payload.kind, &payload.content, payload.reply_to_id.as_ref())
			.await
		{
			Ok(created) => created,
			Err(e) => {
				warn!(user = %self.user, chat = %chat.id, error = %e, "message persistence failed");
				self.send_failure("Failed to send message");
				return;
			}
		};

		// The sender's confirmation is this ack; the broadcast below
		// excludes its connection.
		let ack = ServerEvent::delivery(
			chat.is_group,
			DeliveryEnvelope::success(
				"Message sent successfully",
				MessageData {
					chat_id: chat.id.clone(),
					message: created.message.to_body(),
				},
			),
		);
		self.app.room_hub.send_to(self.conn, ack);

		// Resolve recipient presence before publishing so a locally-held
		// recipient is in the room by the time the router re-emits.
		let mut present: Vec<&UserId> = Vec::with_capacity(created.recipients.len());
		for recipient in &created.recipients {
			match self.app.presence.locator(recipient).await {
				Ok(Some(locator)) => {
					if self.app.room_hub.is_local(locator) {
						self.app.room_hub.join(&chat.id, locator);
					}
					present.push(recipient);
				}
				Ok(None) => {}
				Err(e) => {
					warn!(user = %recipient, error = %e, "presence lookup failed; leaving status SENT");
				}
			}
		}

		let publish = BusEvent::Message(MessageEnvelope {
			chat_id: chat.id.clone(),
			message: created.message.to_body(),
			is_group: chat.is_group,
			origin: self.conn,
		});
		if let Err(e) = self.app.bus.publish(publish).await {
			// Fire-and-forget: the message is persisted and SENT, so the
			// recipient recovers it through the backlog drain.
			warn!(chat = %chat.id, error = %e, "message publish failed");
			return;
		}

		for recipient in present {
			if let Err(e) = self.app.status.mark_delivered(&created.message.id, recipient).await {
				warn!(message = %created.message.id, error = %e, "delivered transition failed");
			}
		}
	}

	async fn handle_typing(&self, signal: TypingSignal, stop: bool) {
		// A connection may only signal typing as itself.
		if signal.from_user_id != self.user {
			return;
		}

		let envelope = TypingEnvelope {
			chat_id: signal.chat_id.clone(),
			from_user_id: signal.from_user_id,
			origin: self.conn,
			timestamp_ms: unix_ms_now(),
			ttl_secs: if stop { None } else { Some(self.app.settings.typing_signal_ttl_secs) },
		};

		let event = if stop {
			BusEvent::StopTyping(envelope)
		} else {
			BusEvent::Typing(envelope)
		};

		// Typing is ephemeral; every failure below degrades silently.
		if let Err(e) = self.app.bus.publish(event).await {
			warn!(chat = %signal.chat_id, error = %e, "typing publish failed");
		}

		let result = if stop {
			self.app.typing.clear(&self.user, self.conn, &signal.chat_id).await
		} else {
			self.app
				.typing
				.mark(&self.user, self.conn, &signal.chat_id, self.app.settings.typing_claim_ttl_secs)
				.await
		};
		if let Err(e) = result {
			warn!(chat = %signal.chat_id, error = %e, "typing claim update failed");
		}
	}

	/// Tear down the connection: presence, typing claims, room
	/// membership. Observers of every chat with an active typing claim
	/// receive exactly one stop signal.
	pub(crate) async fn disconnect(&self) {
		if let Err(e) = self.app.presence.set_offline(&self.user).await {
			warn!(user = %self.user, error = %e, "presence removal failed");
		}

		match self.app.typing.drain(&self.user, self.conn).await {
			Ok(chats) => {
				for chat in chats {
					let envelope = TypingEnvelope {
						chat_id: chat.clone(),
						from_user_id: self.user.clone(),
						origin: self.conn,
						timestamp_ms: unix_ms_now(),
						ttl_secs: None,
					};
					if let Err(e) = self.app.bus.publish(BusEvent::StopTyping(envelope)).await {
						warn!(chat = %chat, error = %e, "synthesized stop-typing publish failed");
					}
				}
			}
			Err(e) => {
				warn!(user = %self.user, error = %e, "typing drain failed; claims will lapse by TTL");
			}
		}

		self.app.room_hub.deregister(self.conn);
		info!(conn = %self.conn, user = %self.user, "connection closed");
	}

	fn send_failure(&self, status: &str) {
		let event = ServerEvent::PrivateMessage(DeliveryEnvelope::failure(status));
		self.app.room_hub.send_to(self.conn, event);
	}

	#[cfg(test)]
	pub(crate) fn conn_id(&self) -> ConnectionId {
		self.conn
	}
}

/// Join a chat room on behalf of a connection; used by collaborators
/// (e.g. REST-triggered group sends) that deliver through the bus.
#[allow(dead_code)]
pub fn join_room(app: &AppState, chat: &ChatId, conn: ConnectionId) -> bool {
	app.room_hub.join(chat, conn)
}
