#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Context as _;
use parley_domain::{ChatId, ConnectionId, UserId};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Tracks, per (user, connection), the set of chats with an active typing
/// claim. The set is TTL-bound so a client that vanishes without notice
/// cannot leave observers believing it is still typing forever; the
/// disconnect drain is the prompt path, the TTL the backstop.
#[async_trait::async_trait]
pub trait TypingTracker: Send + Sync {
	/// Add a claim and reset the whole set's expiry to `ttl_secs`. The
	/// refresh happens on every call, not just on creation, so a
	/// continuously-typing user never lapses mid-session.
	async fn mark(&self, user: &UserId, conn: ConnectionId, chat: &ChatId, ttl_secs: u64) -> anyhow::Result<()>;

	/// Remove a single claim. The set's expiry is left untouched.
	async fn clear(&self, user: &UserId, conn: ConnectionId, chat: &ChatId) -> anyhow::Result<()>;

	/// Read all claims for the connection, then delete the set. The
	/// caller publishes one stop signal per returned chat.
	async fn drain(&self, user: &UserId, conn: ConnectionId) -> anyhow::Result<Vec<ChatId>>;
}

fn claims_key(user: &UserId, conn: ConnectionId) -> String {
	format!("typing:claims:{user}:{conn}")
}

/// Redis-backed typing claims. The multiplexed connection is cloned per
/// operation; no lock is held across the awaits.
pub struct RedisTypingTracker {
	conn: redis::aio::MultiplexedConnection,
}

impl RedisTypingTracker {
	pub fn new(conn: redis::aio::MultiplexedConnection) -> Self {
		Self { conn }
	}
}

#[async_trait::async_trait]
impl TypingTracker for RedisTypingTracker {
	async fn mark(&self, user: &UserId, conn_id: ConnectionId, chat: &ChatId, ttl_secs: u64) -> anyhow::Result<()> {
		let key = claims_key(user, conn_id);
		let mut conn = self.conn.clone();
		redis::cmd("SADD")
			.arg(&key)
			.arg(chat.as_str())
			.query_async::<_, ()>(&mut conn)
			.await
			.context("typing SADD")?;
		redis::cmd("EXPIRE")
			.arg(&key)
			.arg(ttl_secs)
			.query_async::<_, ()>(&mut conn)
			.await
			.context("typing EXPIRE")?;
		Ok(())
	}

	async fn clear(&self, user: &UserId, conn_id: ConnectionId, chat: &ChatId) -> anyhow::Result<()> {
		let mut conn = self.conn.clone();
		redis::cmd("SREM")
			.arg(claims_key(user, conn_id))
			.arg(chat.as_str())
			.query_async::<_, ()>(&mut conn)
			.await
			.context("typing SREM")?;
		Ok(())
	}

	async fn drain(&self, user: &UserId, conn_id: ConnectionId) -> anyhow::Result<Vec<ChatId>> {
		let key = claims_key(user, conn_id);
		let mut conn = self.conn.clone();
		let members: Vec<String> = redis::cmd("SMEMBERS")
			.arg(&key)
			.query_async::<_, Vec<String>>(&mut conn)
			.await
			.context("typing SMEMBERS")?;
		let _: () = redis::cmd("DEL")
			.arg(&key)
			.query_async::<_, ()>(&mut conn)
			.await
			.context("typing DEL")?;

		Ok(members.into_iter().filter_map(|m| ChatId::new(m).ok()).collect())
	}
}

/// In-memory typing claims for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryTypingTracker {
	sets: Mutex<HashMap<String, (HashSet<ChatId>, Instant)>>,
}

impl InMemoryTypingTracker {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl TypingTracker for InMemoryTypingTracker {
	async fn mark(&self, user: &UserId, conn_id: ConnectionId, chat: &ChatId, ttl_secs: u64) -> anyhow::Result<()> {
		let mut sets = self.sets.lock().await;
		let deadline = Instant::now() + Duration::from_secs(ttl_secs);
		let entry = sets
			.entry(claims_key(user, conn_id))
			.or_insert_with(|| (HashSet::new(), deadline));

		if entry.1 <= Instant::now() {
			entry.0.clear();
		}
		entry.0.insert(chat.clone());
		entry.1 = deadline;
		Ok(())
	}

	async fn clear(&self, user: &UserId, conn_id: ConnectionId, chat: &ChatId) -> anyhow::Result<()> {
		let mut sets = self.sets.lock().await;
		if let Some((chats, _)) = sets.get_mut(&claims_key(user, conn_id)) {
			chats.remove(chat);
		}
		Ok(())
	}

	async fn drain(&self, user: &UserId, conn_id: ConnectionId) -> anyhow::Result<Vec<ChatId>> {
		let mut sets = self.sets.lock().await;
		match sets.remove(&claims_key(user, conn_id)) {
			Some((chats, deadline)) if deadline > Instant::now() => Ok(chats.into_iter().collect()),
			_ => Ok(Vec::new()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn claim_expires_without_refresh_or_stop() {
		let tracker = InMemoryTypingTracker::new();
		let user = UserId::new("u-1").unwrap();
		let conn = ConnectionId::new_v4();
		let chat = ChatId::new("c-1").unwrap();

		tracker.mark(&user, conn, &chat, 10).await.unwrap();
		tokio::time::advance(Duration::from_secs(11)).await;
		assert!(tracker.drain(&user, conn).await.unwrap().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn every_mark_refreshes_the_expiry() {
		let tracker = InMemoryTypingTracker::new();
		let user = UserId::new("u-1").unwrap();
		let conn = ConnectionId::new_v4();
		let chat = ChatId::new("c-1").unwrap();

		tracker.mark(&user, conn, &chat, 10).await.unwrap();
		tokio::time::advance(Duration::from_secs(8)).await;
		tracker.mark(&user, conn, &chat, 10).await.unwrap();
		tokio::time::advance(Duration::from_secs(8)).await;

		// 16s after the first mark, still alive thanks to the refresh.
		let drained = tracker.drain(&user, conn).await.unwrap();
		assert_eq!(drained, vec![chat]);
	}

	#[tokio::test]
	async fn clear_removes_single_claim_and_drain_empties_the_set() {
		let tracker = InMemoryTypingTracker::new();
		let user = UserId::new("u-1").unwrap();
		let conn = ConnectionId::new_v4();
		let chat_a = ChatId::new("c-a").unwrap();
		let chat_b = ChatId::new("c-b").unwrap();

		tracker.mark(&user, conn, &chat_a, 10).await.unwrap();
		tracker.mark(&user, conn, &chat_b, 10).await.unwrap();
		tracker.clear(&user, conn, &chat_a).await.unwrap();

		let mut drained = tracker.drain(&user, conn).await.unwrap();
		drained.sort_by(|a, b| a.as_str().cmp(b.as_str()));
		assert_eq!(drained, vec![chat_b]);

		// Second drain observes the deleted set.
		assert!(tracker.drain(&user, conn).await.unwrap().is_empty());
	}
}
