#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parley_domain::{ChatId, ConnectionId};
use parley_protocol::ServerEvent;
use tokio::sync::mpsc;
use tracing::debug;

/// Local (per-process) room membership: which of this process's
/// connections are joined to which chat. Membership is lazily populated:
/// a connection joins a chat once it has sent or received a message there,
/// or at connect time for its persisted chats.
///
/// Reads (the bus router) and writes (connect/first-send handlers) run
/// concurrently, so the maps are sharded rather than a single mutex
/// serializing unrelated chats.
#[derive(Clone)]
pub struct RoomHub {
	inner: Arc<Inner>,
	cfg: RoomHubConfig,
}

/// Configuration for `RoomHub`.
#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	pub debug_logs: bool,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self { debug_logs: false }
	}
}

struct Inner {
	connections: DashMap<ConnectionId, ConnectionEntry>,
	rooms: DashMap<ChatId, HashSet<ConnectionId>>,
}

struct ConnectionEntry {
	tx: mpsc::Sender<ServerEvent>,
	rooms: HashSet<ChatId>,
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Inner {
				connections: DashMap::new(),
				rooms: DashMap::new(),
			}),
			cfg,
		}
	}

	/// Register a connection's outbound queue. Must precede any `join`.
	pub fn register(&self, conn: ConnectionId, tx: mpsc::Sender<ServerEvent>) {
		self.inner.connections.insert(
			conn,
			ConnectionEntry {
				tx,
				rooms: HashSet::new(),
			},
		);
	}

	/// Remove a connection and its memberships.
	pub fn deregister(&self, conn: ConnectionId) {
		let Some((_, entry)) = self.inner.connections.remove(&conn) else {
			return;
		};

		for chat in entry.rooms {
			if let Some(mut members) = self.inner.rooms.get_mut(&chat) {
				members.remove(&conn);
				if members.is_empty() {
					drop(members);
					self.inner.rooms.remove_if(&chat, |_, m| m.is_empty());
				}
			}
		}
	}

	/// Whether the connection is held by this process.
	pub fn is_local(&self, conn: ConnectionId) -> bool {
		self.inner.connections.contains_key(&conn)
	}

	/// Join a connection to a chat room. Returns false for connections
	/// this process does not hold.
	pub fn join(&self, chat: &ChatId, conn: ConnectionId) -> bool {
		{
			let Some(mut entry) = self.inner.connections.get_mut(&conn) else {
				return false;
			};
			entry.rooms.insert(chat.clone());
		}

		self.inner.rooms.entry(chat.clone()).or_default().insert(conn);

		if self.cfg.debug_logs {
			debug!(chat = %chat, conn = %conn, "room hub: joined");
		}
		true
	}

	/// Send an event directly to one connection's queue.
	pub fn send_to(&self, conn: ConnectionId, event: ServerEvent) -> bool {
		let Some(entry) = self.inner.connections.get(&conn) else {
			return false;
		};
		match entry.tx.try_send(event) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("parley_server_room_drops_total").increment(1);
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}

	/// Emit an event to every local member of a chat except the origin
	/// connection. Returns the number of queues the event reached.
	pub fn emit_to_room(&self, chat: &ChatId, event: &ServerEvent, except: Option<ConnectionId>) -> usize {
		let members: Vec<ConnectionId> = match self.inner.rooms.get(chat) {
			Some(members) => members.iter().copied().collect(),
			None => return 0,
		};

		let mut delivered = 0usize;
		let mut closed: Vec<ConnectionId> = Vec::new();

		for conn in members {
			if Some(conn) == except {
				continue;
			}

			let Some(entry) = self.inner.connections.get(&conn) else {
				closed.push(conn);
				continue;
			};

			match entry.tx.try_send(event.clone()) {
				Ok(()) => delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => {
					metrics::counter!("parley_server_room_drops_total").increment(1);
					if self.cfg.debug_logs {
						debug!(chat = %chat, conn = %conn, "room hub: dropped event on full queue");
					}
				}
				Err(mpsc::error::TrySendError::Closed(_)) => closed.push(conn),
			}
		}

		for conn in closed {
			self.deregister(conn);
		}

		metrics::counter!("parley_server_room_emits_total").increment(delivered as u64);
		delivered
	}

	/// Number of local members in a chat room.
	pub fn room_size(&self, chat: &ChatId) -> usize {
		self.inner.rooms.get(chat).map(|m| m.len()).unwrap_or(0)
	}
}
