#![forbid(unsafe_code)]

use std::str::FromStr as _;

use anyhow::anyhow;
use parley_domain::{DeliveryState, MessageId, UserId};

use crate::server::error::DeliveryError;
use crate::server::store::{ChatStore, MessageRecord, StoreBackend, message_record_from_row};
use crate::util::time::unix_ms_now;

/// One undelivered message owed to a reconnecting user.
#[derive(Debug, Clone)]
pub struct BacklogEntry {
	pub message: MessageRecord,
	pub is_group: bool,
}

/// Per-(message, recipient) delivery-state machine.
///
/// Entries are seeded SENT by `ChatStore::create_message`; this tracker
/// only advances them. The SENT→DELIVERED update is keyed on
/// (message, user) and guarded on the current state, so the live-broadcast
/// path and the backlog-drain path can race without double effect.
#[derive(Clone)]
pub struct StatusTracker {
	backend: StoreBackend,
}

impl StatusTracker {
	pub fn new(store: &ChatStore) -> Self {
		Self {
			backend: store.backend(),
		}
	}

	/// Advance one entry to DELIVERED. A no-op if it already is.
	pub async fn mark_delivered(&self, message: &MessageId, user: &UserId) -> Result<(), DeliveryError> {
		let now = unix_ms_now();

		let updated = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query(
					"UPDATE message_status SET status = ?, updated_at = ? \
					WHERE message_id = ? AND user_id = ? AND status = ?",
				)
				.bind(DeliveryState::Delivered.as_str())
				.bind(now)
				.bind(message.as_str())
				.bind(user.as_str())
				.bind(DeliveryState::Sent.as_str())
				.execute(pool)
				.await?
				.rows_affected()
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query(
					"UPDATE message_status SET status = $1, updated_at = $2 \
					WHERE message_id = $3 AND user_id = $4 AND status = $5",
				)
				.bind(DeliveryState::Delivered.as_str())
				.bind(now)
				.bind(message.as_str())
				.bind(user.as_str())
				.bind(DeliveryState::Sent.as_str())
				.execute(pool)
				.await?
				.rows_affected()
			}
		};

		if updated > 0 {
			metrics::counter!("parley_server_status_delivered_total").increment(updated);
		}
		Ok(())
	}

	/// All messages still SENT for the user, oldest first. This is the
	/// sole recovery path for messages sent while the user was offline.
	pub async fn sent_backlog(&self, user: &UserId) -> Result<Vec<BacklogEntry>, DeliveryError> {
		const SQLITE_SQL: &str = "SELECT m.id, m.chat_id, m.sender_id, m.kind, m.content, m.reply_to_id, m.created_at, c.is_group \
			FROM message_status s \
			JOIN messages m ON m.id = s.message_id \
			JOIN chats c ON c.id = m.chat_id \
			WHERE s.user_id = ? AND s.status = ? \
			ORDER BY m.created_at ASC";
		const POSTGRES_SQL: &str = "SELECT m.id, m.chat_id, m.sender_id, m.kind, m.content, m.reply_to_id, m.created_at, c.is_group \
			FROM message_status s \
			JOIN messages m ON m.id = s.message_id \
			JOIN chats c ON c.id = m.chat_id \
			WHERE s.user_id = $1 AND s.status = $2 \
			ORDER BY m.created_at ASC";

		type Row = (String, String, String, String, String, Option<String>, i64, bool);

		let rows: Vec<Row> = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as(SQLITE_SQL)
					.bind(user.as_str())
					.bind(DeliveryState::Sent.as_str())
					.fetch_all(pool)
					.await?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as(POSTGRES_SQL)
					.bind(user.as_str())
					.bind(DeliveryState::Sent.as_str())
					.fetch_all(pool)
					.await?
			}
		};

		rows.into_iter()
			.map(|(id, chat_id, sender_id, kind, content, reply_to_id, created_at, is_group)| {
				Ok(BacklogEntry {
					message: message_record_from_row(id, chat_id, sender_id, kind, content, reply_to_id, created_at)?,
					is_group,
				})
			})
			.collect()
	}

	/// Batch-advance the drained backlog to DELIVERED. Scoped to the
	/// message ids actually emitted, so entries created mid-drain keep
	/// their SENT state.
	pub async fn mark_backlog_delivered(&self, user: &UserId, messages: &[MessageId]) -> Result<u64, DeliveryError> {
		if messages.is_empty() {
			return Ok(0);
		}

		let now = unix_ms_now();

		let updated = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let placeholders = vec!["?"; messages.len()].join(", ");
				let sql = format!(
					"UPDATE message_status SET status = ?, updated_at = ? \
					WHERE user_id = ? AND status = ? AND message_id IN ({placeholders})"
				);

				let mut query = sqlx::query(&sql)
					.bind(DeliveryState::Delivered.as_str())
					.bind(now)
					.bind(user.as_str())
					.bind(DeliveryState::Sent.as_str());
				for message in messages {
					query = query.bind(message.as_str());
				}
				query.execute(pool).await?.rows_affected()
			}
			StoreBackend::Postgres(pool) => {
				let ids: Vec<String> = messages.iter().map(|m| m.as_str().to_string()).collect();
				sqlx::query(
					"UPDATE message_status SET status = $1, updated_at = $2 \
					WHERE user_id = $3 AND status = $4 AND message_id = ANY($5)",
				)
				.bind(DeliveryState::Delivered.as_str())
				.bind(now)
				.bind(user.as_str())
				.bind(DeliveryState::Sent.as_str())
				.bind(ids)
				.execute(pool)
				.await?
				.rows_affected()
			}
		};

		if updated > 0 {
			metrics::counter!("parley_server_status_delivered_total").increment(updated);
		}
		Ok(updated)
	}

	/// Current states for one message, recipient by recipient.
	pub async fn statuses_for_message(&self, message: &MessageId) -> Result<Vec<(UserId, DeliveryState)>, DeliveryError> {
		let rows: Vec<(String, String)> = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT user_id, status FROM message_status WHERE message_id = ?")
					.bind(message.as_str())
					.fetch_all(pool)
					.await?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as("SELECT user_id, status FROM message_status WHERE message_id = $1")
					.bind(message.as_str())
					.fetch_all(pool)
					.await?
			}
		};

		rows.into_iter()
			.map(|(user, status)| {
				let user = UserId::new(user).map_err(|e| DeliveryError::Unavailable(anyhow!(e)))?;
				let status = DeliveryState::from_str(&status).map_err(|e| DeliveryError::Unavailable(anyhow!(e)))?;
				Ok((user, status))
			})
			.collect()
	}
}
