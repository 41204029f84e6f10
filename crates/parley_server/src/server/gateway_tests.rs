#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{ChatId, ConnectionId, DeliveryState, MessageId, MessageKind, UserId};
use parley_protocol::bus::{BusEvent, MessageEnvelope};
use parley_protocol::{ClientEvent, MessageBody, PrivateMessage, ServerEvent, TypingSignal};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::DeliverySettings;
use crate::server::bus::{BroadcastBus, BusConfig, LocalBus};
use crate::server::gateway::{AppState, Session};
use crate::server::health::HealthState;
use crate::server::presence::{InMemoryPresence, PresenceDirectory};
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::router::{RouterConfig, spawn_bus_router};
use crate::server::status::StatusTracker;
use crate::server::store::ChatStore;
use crate::server::typing::{InMemoryTypingTracker, TypingTracker};
use crate::util::secret::SecretString;

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn chat(id: &str) -> ChatId {
	ChatId::new(id).expect("valid ChatId")
}

async fn test_app() -> Arc<AppState> {
	let store = ChatStore::connect("sqlite::memory:").await.expect("in-memory store");
	let status = StatusTracker::new(&store);
	let presence: Arc<dyn PresenceDirectory> = Arc::new(InMemoryPresence::new(3600));
	let typing: Arc<dyn TypingTracker> = Arc::new(InMemoryTypingTracker::new());
	let bus: Arc<dyn BroadcastBus> = Arc::new(LocalBus::new(BusConfig::default()));
	let room_hub = RoomHub::new(RoomHubConfig::default());

	spawn_bus_router(&bus, room_hub.clone(), Arc::clone(&typing), RouterConfig::default());

	Arc::new(AppState {
		settings: DeliverySettings::default(),
		auth_secret: SecretString::new("test-secret"),
		store,
		status,
		presence,
		typing,
		bus,
		room_hub,
		health: HealthState::new(),
	})
}

async fn connect(app: &Arc<AppState>, id: &str) -> (Session, mpsc::Receiver<ServerEvent>) {
	let (tx, rx) = mpsc::channel(64);
	let session = Session::connect(Arc::clone(app), user(id), ConnectionId::new_v4(), tx).await;
	(session, rx)
}

async fn expect_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
	timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("expected an event within timeout")
		.expect("channel open")
}

fn send_payload(to: &str, content: &str) -> ClientEvent {
	ClientEvent::PrivateMessage(PrivateMessage {
		to_user_id: user(to),
		content: content.to_string(),
		kind: MessageKind::Text,
		reply_to_id: None,
	})
}

fn ack_message_id(event: ServerEvent) -> MessageId {
	match event {
		ServerEvent::PrivateMessage(env) => {
			assert!(env.ok, "expected a success ack, got: {env:?}");
			assert_eq!(env.status, "Message sent successfully");
			env.data.expect("ack carries the message").message.id
		}
		other => panic!("expected a private-message ack, got: {other:?}"),
	}
}

#[tokio::test]
async fn live_send_acks_sender_and_delivers_to_present_recipient() {
	let app = test_app().await;
	let (session_a, mut rx_a) = connect(&app, "u-a").await;
	let (_session_b, mut rx_b) = connect(&app, "u-b").await;

	session_a.handle_event(send_payload("u-b", "hello")).await;

	let message_id = ack_message_id(expect_event(&mut rx_a).await);

	match expect_event(&mut rx_b).await {
		ServerEvent::PrivateMessage(env) => {
			assert!(env.ok);
			assert_eq!(env.status, "New message received");
			let data = env.data.expect("delivery carries the message");
			assert_eq!(data.message.id, message_id);
			assert_eq!(data.message.content, "hello");
		}
		other => panic!("expected a private-message delivery, got: {other:?}"),
	}

	// The sender's connection gets its ack only, never an echo.
	assert!(
		timeout(Duration::from_millis(50), rx_a.recv()).await.is_err(),
		"sender received an echo of its own message"
	);

	let statuses = app.status.statuses_for_message(&message_id).await.expect("statuses");
	assert_eq!(statuses, vec![(user("u-b"), DeliveryState::Delivered)]);
}

#[tokio::test]
async fn offline_recipient_is_recovered_by_backlog_drain_on_connect() {
	let app = test_app().await;
	let (session_a, mut rx_a) = connect(&app, "u-a").await;

	session_a.handle_event(send_payload("u-b", "while you were out")).await;
	let message_id = ack_message_id(expect_event(&mut rx_a).await);

	// Recipient was offline: the entry stays SENT.
	let statuses = app.status.statuses_for_message(&message_id).await.expect("statuses");
	assert_eq!(statuses, vec![(user("u-b"), DeliveryState::Sent)]);

	let (_session_b, mut rx_b) = connect(&app, "u-b").await;

	match expect_event(&mut rx_b).await {
		ServerEvent::PrivateMessage(env) => {
			assert!(env.ok);
			assert_eq!(env.status, "Unread message");
			assert_eq!(env.data.expect("backlog carries the message").message.id, message_id);
		}
		other => panic!("expected a backlog delivery, got: {other:?}"),
	}

	let statuses = app.status.statuses_for_message(&message_id).await.expect("statuses");
	assert_eq!(statuses, vec![(user("u-b"), DeliveryState::Delivered)]);
}

#[tokio::test]
async fn second_resolve_reuses_the_same_chat() {
	let app = test_app().await;
	let (session_a, mut rx_a) = connect(&app, "u-a").await;

	session_a.handle_event(send_payload("u-b", "first")).await;
	let first = match expect_event(&mut rx_a).await {
		ServerEvent::PrivateMessage(env) => env.data.expect("data").chat_id,
		other => panic!("expected ack, got: {other:?}"),
	};

	session_a.handle_event(send_payload("u-b", "second")).await;
	let second = match expect_event(&mut rx_a).await {
		ServerEvent::PrivateMessage(env) => env.data.expect("data").chat_id,
		other => panic!("expected ack, got: {other:?}"),
	};

	assert_eq!(first, second);
}

#[tokio::test]
async fn disconnect_synthesizes_one_stop_signal_per_claimed_chat() {
	let app = test_app().await;
	let (session_a, _rx_a) = connect(&app, "u-a").await;

	session_a
		.handle_event(ClientEvent::Typing(TypingSignal {
			chat_id: chat("c-1"),
			from_user_id: user("u-a"),
		}))
		.await;
	session_a
		.handle_event(ClientEvent::Typing(TypingSignal {
			chat_id: chat("c-2"),
			from_user_id: user("u-a"),
		}))
		.await;

	let mut bus_rx = app.bus.subscribe();
	session_a.disconnect().await;

	let mut stopped: Vec<ChatId> = Vec::new();
	for _ in 0..2 {
		let event = timeout(Duration::from_millis(500), bus_rx.recv())
			.await
			.expect("expected a stop signal")
			.expect("bus open");
		match event {
			BusEvent::StopTyping(env) => {
				assert_eq!(env.origin, session_a.conn_id());
				assert_eq!(env.from_user_id, user("u-a"));
				stopped.push(env.chat_id);
			}
			other => panic!("expected StopTyping, got: {other:?}"),
		}
	}
	stopped.sort_by(|a, b| a.as_str().cmp(b.as_str()));
	assert_eq!(stopped, vec![chat("c-1"), chat("c-2")]);

	// Exactly one signal per chat, and the claim set is gone.
	assert!(timeout(Duration::from_millis(50), bus_rx.recv()).await.is_err());
	assert!(
		app.typing
			.drain(&user("u-a"), session_a.conn_id())
			.await
			.expect("drain")
			.is_empty()
	);

	// Presence is cleaned up with the connection.
	assert_eq!(app.presence.locator(&user("u-a")).await.expect("locator"), None);
}

#[tokio::test]
async fn typing_with_foreign_identity_is_dropped() {
	let app = test_app().await;
	let (session_a, _rx_a) = connect(&app, "u-a").await;

	let mut bus_rx = app.bus.subscribe();
	session_a
		.handle_event(ClientEvent::Typing(TypingSignal {
			chat_id: chat("c-1"),
			from_user_id: user("u-impostor"),
		}))
		.await;

	assert!(
		timeout(Duration::from_millis(50), bus_rx.recv()).await.is_err(),
		"mismatched typing identity must not be published"
	);
	assert!(
		app.typing
			.drain(&user("u-a"), session_a.conn_id())
			.await
			.expect("drain")
			.is_empty()
	);
}

#[tokio::test]
async fn bus_fans_out_to_other_processes_and_suppresses_the_origin() {
	// Two room hubs with their own routers stand in for two server
	// processes sharing one bus.
	let bus: Arc<dyn BroadcastBus> = Arc::new(LocalBus::new(BusConfig::default()));
	let typing: Arc<dyn TypingTracker> = Arc::new(InMemoryTypingTracker::new());

	let hub_one = RoomHub::new(RoomHubConfig::default());
	let hub_two = RoomHub::new(RoomHubConfig::default());
	spawn_bus_router(&bus, hub_one.clone(), Arc::clone(&typing), RouterConfig::default());
	spawn_bus_router(&bus, hub_two.clone(), Arc::clone(&typing), RouterConfig::default());

	let chat_id = chat("c-shared");

	let origin = ConnectionId::new_v4();
	let (origin_tx, mut origin_rx) = mpsc::channel(16);
	hub_one.register(origin, origin_tx);
	hub_one.join(&chat_id, origin);

	let remote = ConnectionId::new_v4();
	let (remote_tx, mut remote_rx) = mpsc::channel(16);
	hub_two.register(remote, remote_tx);
	hub_two.join(&chat_id, remote);

	let message = MessageBody {
		id: MessageId::generate(),
		chat_id: chat_id.clone(),
		sender_id: user("u-a"),
		kind: MessageKind::Text,
		content: "across processes".to_string(),
		reply_to_id: None,
		created_at: chrono::Utc::now(),
	};

	bus.publish(BusEvent::Message(MessageEnvelope {
		chat_id: chat_id.clone(),
		message,
		is_group: false,
		origin,
	}))
	.await
	.expect("publish");

	match expect_event(&mut remote_rx).await {
		ServerEvent::PrivateMessage(env) => {
			assert!(env.ok);
			assert_eq!(env.data.expect("delivery carries the message").chat_id, chat_id);
		}
		other => panic!("expected a private-message delivery, got: {other:?}"),
	}

	assert!(
		timeout(Duration::from_millis(50), origin_rx.recv()).await.is_err(),
		"origin process re-delivered to the originating connection"
	);
}

#[tokio::test]
async fn typing_reaches_chat_members_but_not_the_typist() {
	let app = test_app().await;
	let (session_a, mut rx_a) = connect(&app, "u-a").await;
	let (_session_b, mut rx_b) = connect(&app, "u-b").await;

	// Establish the chat and the recipient's room membership.
	session_a.handle_event(send_payload("u-b", "hello")).await;
	let chat_id = match expect_event(&mut rx_a).await {
		ServerEvent::PrivateMessage(env) => env.data.expect("data").chat_id,
		other => panic!("expected ack, got: {other:?}"),
	};
	let _delivery = expect_event(&mut rx_b).await;

	session_a
		.handle_event(ClientEvent::Typing(TypingSignal {
			chat_id: chat_id.clone(),
			from_user_id: user("u-a"),
		}))
		.await;

	match expect_event(&mut rx_b).await {
		ServerEvent::Typing(signal) => {
			assert_eq!(signal.chat_id, chat_id);
			assert_eq!(signal.from_user_id, user("u-a"));
		}
		other => panic!("expected typing signal, got: {other:?}"),
	}

	assert!(
		timeout(Duration::from_millis(50), rx_a.recv()).await.is_err(),
		"typist received an echo of its own typing signal"
	);
}
