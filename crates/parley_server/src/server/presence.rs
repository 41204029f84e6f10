#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context as _;
use parley_domain::{ConnectionId, UserId};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Shared registry mapping a user to the connection that can currently
/// reach them. Best-effort: callers on the message path log and continue
/// when it is unavailable.
#[async_trait::async_trait]
pub trait PresenceDirectory: Send + Sync {
	/// Unconditional upsert with TTL; a new connection overwrites any
	/// prior locator.
	async fn set_online(&self, user: &UserId, conn: ConnectionId) -> anyhow::Result<()>;

	/// Last-known locator for the user, absent if offline or expired.
	async fn locator(&self, user: &UserId) -> anyhow::Result<Option<ConnectionId>>;

	/// Unconditional delete, called on disconnect of the owning
	/// connection.
	async fn set_offline(&self, user: &UserId) -> anyhow::Result<()>;
}

fn presence_key(user: &UserId) -> String {
	format!("online:{user}")
}

/// Redis-backed presence. The multiplexed connection is cloned per
/// operation; clones share one pipelined connection and need no lock, so
/// handlers never hold a mutex across these awaits.
pub struct RedisPresence {
	conn: redis::aio::MultiplexedConnection,
	ttl_secs: u64,
}

impl RedisPresence {
	pub fn new(conn: redis::aio::MultiplexedConnection, ttl_secs: u64) -> Self {
		Self { conn, ttl_secs }
	}
}

#[async_trait::async_trait]
impl PresenceDirectory for RedisPresence {
	async fn set_online(&self, user: &UserId, conn_id: ConnectionId) -> anyhow::Result<()> {
		let mut conn = self.conn.clone();
		redis::cmd("SETEX")
			.arg(presence_key(user))
			.arg(self.ttl_secs)
			.arg(conn_id.to_string())
			.query_async::<_, ()>(&mut conn)
			.await
			.context("presence SETEX")?;
		Ok(())
	}

	async fn locator(&self, user: &UserId) -> anyhow::Result<Option<ConnectionId>> {
		let mut conn = self.conn.clone();
		let value: Option<String> = redis::cmd("GET")
			.arg(presence_key(user))
			.query_async::<_, Option<String>>(&mut conn)
			.await
			.context("presence GET")?;

		match value {
			Some(raw) => {
				// A malformed locator is treated as absence, not an error:
				// the record only steers the live-DELIVERED shortcut.
				Ok(ConnectionId::from_str(&raw).ok())
			}
			None => Ok(None),
		}
	}

	async fn set_offline(&self, user: &UserId) -> anyhow::Result<()> {
		let mut conn = self.conn.clone();
		let _: () = redis::cmd("DEL")
			.arg(presence_key(user))
			.query_async::<_, ()>(&mut conn)
			.await
			.context("presence DEL")?;
		Ok(())
	}
}

/// In-memory presence for tests and single-process deployments.
pub struct InMemoryPresence {
	entries: Mutex<HashMap<UserId, (ConnectionId, Instant)>>,
	ttl: Duration,
}

impl InMemoryPresence {
	pub fn new(ttl_secs: u64) -> Self {
		Self {
			entries: Mutex::new(HashMap::new()),
			ttl: Duration::from_secs(ttl_secs),
		}
	}
}

#[async_trait::async_trait]
impl PresenceDirectory for InMemoryPresence {
	async fn set_online(&self, user: &UserId, conn_id: ConnectionId) -> anyhow::Result<()> {
		let mut entries = self.entries.lock().await;
		entries.insert(user.clone(), (conn_id, Instant::now() + self.ttl));
		Ok(())
	}

	async fn locator(&self, user: &UserId) -> anyhow::Result<Option<ConnectionId>> {
		let mut entries = self.entries.lock().await;
		match entries.get(user) {
			Some((conn_id, deadline)) if *deadline > Instant::now() => Ok(Some(*conn_id)),
			Some(_) => {
				entries.remove(user);
				Ok(None)
			}
			None => Ok(None),
		}
	}

	async fn set_offline(&self, user: &UserId) -> anyhow::Result<()> {
		let mut entries = self.entries.lock().await;
		entries.remove(user);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn newest_connection_overwrites_and_ttl_expires() {
		let presence = InMemoryPresence::new(60);
		let user = UserId::new("u-1").unwrap();

		let first = ConnectionId::new_v4();
		let second = ConnectionId::new_v4();

		presence.set_online(&user, first).await.unwrap();
		presence.set_online(&user, second).await.unwrap();
		assert_eq!(presence.locator(&user).await.unwrap(), Some(second));

		tokio::time::advance(Duration::from_secs(61)).await;
		assert_eq!(presence.locator(&user).await.unwrap(), None);
	}

	#[tokio::test]
	async fn set_offline_removes_record() {
		let presence = InMemoryPresence::new(60);
		let user = UserId::new("u-1").unwrap();

		presence.set_online(&user, ConnectionId::new_v4()).await.unwrap();
		presence.set_offline(&user).await.unwrap();
		assert_eq!(presence.locator(&user).await.unwrap(), None);
	}
}
