#![forbid(unsafe_code)]

use std::str::FromStr as _;

use anyhow::{Context as _, anyhow};
use parley_domain::{ChatId, MessageId, MessageKind, ParticipantKey, UserId};
use parley_protocol::MessageBody;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::debug;

use crate::server::error::DeliveryError;
use crate::util::time::unix_ms_now;

const SQLITE_SCHEMA: &str = include_str!("../../migrations/sqlite.sql");
const POSTGRES_SCHEMA: &str = include_str!("../../migrations/postgres.sql");

/// Relational backend shared by the chat store and the status tracker.
#[derive(Clone)]
pub(crate) enum StoreBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

/// A persisted chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRecord {
	pub id: ChatId,
	pub is_group: bool,
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
	pub id: MessageId,
	pub chat_id: ChatId,
	pub sender_id: UserId,
	pub kind: MessageKind,
	pub content: String,
	pub reply_to_id: Option<MessageId>,
	pub created_at_ms: i64,
}

impl MessageRecord {
	/// Wire representation of the message.
	pub fn to_body(&self) -> MessageBody {
		MessageBody {
			id: self.id.clone(),
			chat_id: self.chat_id.clone(),
			sender_id: self.sender_id.clone(),
			kind: self.kind,
			content: self.content.clone(),
			reply_to_id: self.reply_to_id.clone(),
			created_at: chrono::DateTime::from_timestamp_millis(self.created_at_ms).unwrap_or_default(),
		}
	}
}

/// Result of persisting a message: the row plus the recipients whose
/// status entries were seeded alongside it.
#[derive(Debug, Clone)]
pub struct CreatedMessage {
	pub message: MessageRecord,
	pub recipients: Vec<UserId>,
}

/// Store for chats, memberships and messages.
#[derive(Clone)]
pub struct ChatStore {
	backend: StoreBackend,
}

impl ChatStore {
	/// Connect and apply the schema. Accepts `sqlite:` and `postgres:`
	/// URLs.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			// Every pooled connection to `:memory:` would get its own
			// database, so in-memory stores are pinned to one connection.
			let pool = if database_url.contains(":memory:") {
				SqlitePoolOptions::new()
					.max_connections(1)
					.connect(database_url)
					.await
					.context("connect sqlite")?
			} else {
				sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?
			};
			sqlx::raw_sql(SQLITE_SCHEMA)
				.execute(&pool)
				.await
				.context("apply sqlite schema")?;

			Ok(Self {
				backend: StoreBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::raw_sql(POSTGRES_SCHEMA)
				.execute(&pool)
				.await
				.context("apply postgres schema")?;

			Ok(Self {
				backend: StoreBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	pub(crate) fn backend(&self) -> StoreBackend {
		self.backend.clone()
	}

	/// Resolve the single private chat for an unordered pair of users,
	/// creating it if absent.
	///
	/// Races between concurrent creators are settled by the UNIQUE
	/// constraint on the participant key: the loser's insert fails with a
	/// uniqueness violation and falls back to re-reading the winner's
	/// row. No application-level lock is involved.
	pub async fn find_or_create_private_chat(&self, a: &UserId, b: &UserId) -> Result<ChatRecord, DeliveryError> {
		let key = ParticipantKey::for_pair(a, b);

		if let Some(chat) = self.private_chat_by_key(&key).await? {
			return Ok(chat);
		}

		match self.insert_private_chat(&key, a, b).await {
			Ok(chat) => Ok(chat),
			Err(e) if is_unique_violation(&e) => {
				debug!(key = %key, "private chat created concurrently; re-reading");
				self.private_chat_by_key(&key)
					.await?
					.ok_or_else(|| DeliveryError::Conflict(format!("chat for key {key} vanished after conflict")))
			}
			Err(e) => Err(e.into()),
		}
	}

	async fn private_chat_by_key(&self, key: &ParticipantKey) -> Result<Option<ChatRecord>, DeliveryError> {
		let row: Option<(String, bool)> = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, is_group FROM chats WHERE participant_key = ?")
					.bind(key.as_str())
					.fetch_optional(pool)
					.await?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, is_group FROM chats WHERE participant_key = $1")
					.bind(key.as_str())
					.fetch_optional(pool)
					.await?
			}
		};

		row.map(|(id, is_group)| chat_record(id, is_group)).transpose()
	}

	async fn insert_private_chat(&self, key: &ParticipantKey, a: &UserId, b: &UserId) -> Result<ChatRecord, sqlx::Error> {
		let id = ChatId::generate();
		let now = unix_ms_now();

		// Self-chat gets a single membership row.
		let mut members = vec![a];
		if b != a {
			members.push(b);
		}

		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				sqlx::query("INSERT INTO chats (id, is_group, participant_key, created_at) VALUES (?, ?, ?, ?)")
					.bind(id.as_str())
					.bind(false)
					.bind(key.as_str())
					.bind(now)
					.execute(&mut *tx)
					.await?;
				for member in members {
					sqlx::query("INSERT INTO chat_members (chat_id, user_id) VALUES (?, ?)")
						.bind(id.as_str())
						.bind(member.as_str())
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
			}
			StoreBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				sqlx::query("INSERT INTO chats (id, is_group, participant_key, created_at) VALUES ($1, $2, $3, $4)")
					.bind(id.as_str())
					.bind(false)
					.bind(key.as_str())
					.bind(now)
					.execute(&mut *tx)
					.await?;
				for member in members {
					sqlx::query("INSERT INTO chat_members (chat_id, user_id) VALUES ($1, $2)")
						.bind(id.as_str())
						.bind(member.as_str())
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
			}
		}

		Ok(ChatRecord { id, is_group: false })
	}

	/// Create a group chat with the given members. Invoked from REST
	/// request handlers, not the connection gateway.
	#[allow(dead_code)]
	pub async fn create_group_chat(&self, members: &[UserId]) -> Result<ChatRecord, DeliveryError> {
		let id = ChatId::generate();
		let now = unix_ms_now();

		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				sqlx::query("INSERT INTO chats (id, is_group, participant_key, created_at) VALUES (?, ?, NULL, ?)")
					.bind(id.as_str())
					.bind(true)
					.bind(now)
					.execute(&mut *tx)
					.await?;
				for member in members {
					sqlx::query("INSERT INTO chat_members (chat_id, user_id) VALUES (?, ?)")
						.bind(id.as_str())
						.bind(member.as_str())
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
			}
			StoreBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				sqlx::query("INSERT INTO chats (id, is_group, participant_key, created_at) VALUES ($1, $2, NULL, $3)")
					.bind(id.as_str())
					.bind(true)
					.bind(now)
					.execute(&mut *tx)
					.await?;
				for member in members {
					sqlx::query("INSERT INTO chat_members (chat_id, user_id) VALUES ($1, $2)")
						.bind(id.as_str())
						.bind(member.as_str())
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
			}
		}

		Ok(ChatRecord { id, is_group: true })
	}

	/// Look up a chat by id.
	#[allow(dead_code)]
	pub async fn chat_by_id(&self, chat: &ChatId) -> Result<Option<ChatRecord>, DeliveryError> {
		let row: Option<(String, bool)> = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, is_group FROM chats WHERE id = ?")
					.bind(chat.as_str())
					.fetch_optional(pool)
					.await?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, is_group FROM chats WHERE id = $1")
					.bind(chat.as_str())
					.fetch_optional(pool)
					.await?
			}
		};

		row.map(|(id, is_group)| chat_record(id, is_group)).transpose()
	}

	/// Member identities of a chat.
	pub async fn member_ids(&self, chat: &ChatId) -> Result<Vec<UserId>, DeliveryError> {
		let rows: Vec<(String,)> = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT user_id FROM chat_members WHERE chat_id = ?")
					.bind(chat.as_str())
					.fetch_all(pool)
					.await?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as("SELECT user_id FROM chat_members WHERE chat_id = $1")
					.bind(chat.as_str())
					.fetch_all(pool)
					.await?
			}
		};

		rows.into_iter()
			.map(|(id,)| UserId::new(id).map_err(|e| DeliveryError::Unavailable(anyhow!(e))))
			.collect()
	}

	/// All chats the user is a member of, used at connect time to join
	/// local rooms.
	pub async fn chat_ids_for_user(&self, user: &UserId) -> Result<Vec<ChatId>, DeliveryError> {
		let rows: Vec<(String,)> = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT chat_id FROM chat_members WHERE user_id = ?")
					.bind(user.as_str())
					.fetch_all(pool)
					.await?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as("SELECT chat_id FROM chat_members WHERE user_id = $1")
					.bind(user.as_str())
					.fetch_all(pool)
					.await?
			}
		};

		rows.into_iter()
			.map(|(id,)| ChatId::new(id).map_err(|e| DeliveryError::Unavailable(anyhow!(e))))
			.collect()
	}

	/// Persist a message and seed one SENT status entry per recipient
	/// (every member except the sender) in the same transaction, so no
	/// message can exist without its status rows.
	pub async fn create_message(
		&self,
		chat: &ChatRecord,
		sender: &UserId,
		kind: MessageKind,
		content: &str,
		reply_to: Option<&MessageId>,
	) -> Result<CreatedMessage, DeliveryError> {
		let id = MessageId::generate();
		let now = unix_ms_now();

		let members = self.member_ids(&chat.id).await?;
		let recipients: Vec<UserId> = members.into_iter().filter(|m| m != sender).collect();

		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				sqlx::query(
					"INSERT INTO messages (id, chat_id, sender_id, kind, content, reply_to_id, created_at) \
					VALUES (?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(id.as_str())
				.bind(chat.id.as_str())
				.bind(sender.as_str())
				.bind(kind.as_str())
				.bind(content)
				.bind(reply_to.map(|r| r.as_str()))
				.bind(now)
				.execute(&mut *tx)
				.await?;

				for recipient in &recipients {
					sqlx::query("INSERT INTO message_status (message_id, user_id, status, updated_at) VALUES (?, ?, ?, ?)")
						.bind(id.as_str())
						.bind(recipient.as_str())
						.bind(parley_domain::DeliveryState::Sent.as_str())
						.bind(now)
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
			}
			StoreBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				sqlx::query(
					"INSERT INTO messages (id, chat_id, sender_id, kind, content, reply_to_id, created_at) \
					VALUES ($1, $2, $3, $4, $5, $6, $7)",
				)
				.bind(id.as_str())
				.bind(chat.id.as_str())
				.bind(sender.as_str())
				.bind(kind.as_str())
				.bind(content)
				.bind(reply_to.map(|r| r.as_str()))
				.bind(now)
				.execute(&mut *tx)
				.await?;

				for recipient in &recipients {
					sqlx::query(
						"INSERT INTO message_status (message_id, user_id, status, updated_at) VALUES ($1, $2, $3, $4)",
					)
					.bind(id.as_str())
					.bind(recipient.as_str())
					.bind(parley_domain::DeliveryState::Sent.as_str())
					.bind(now)
					.execute(&mut *tx)
					.await?;
				}
				tx.commit().await?;
			}
		}

		metrics::counter!("parley_server_messages_persisted_total").increment(1);

		Ok(CreatedMessage {
			message: MessageRecord {
				id,
				chat_id: chat.id.clone(),
				sender_id: sender.clone(),
				kind,
				content: content.to_string(),
				reply_to_id: reply_to.cloned(),
				created_at_ms: now,
			},
			recipients,
		})
	}
}

fn chat_record(id: String, is_group: bool) -> Result<ChatRecord, DeliveryError> {
	Ok(ChatRecord {
		id: ChatId::new(id).map_err(|e| DeliveryError::Unavailable(anyhow!(e)))?,
		is_group,
	})
}

pub(crate) fn message_record_from_row(
	id: String,
	chat_id: String,
	sender_id: String,
	kind: String,
	content: String,
	reply_to_id: Option<String>,
	created_at_ms: i64,
) -> Result<MessageRecord, DeliveryError> {
	Ok(MessageRecord {
		id: MessageId::new(id).map_err(|e| DeliveryError::Unavailable(anyhow!(e)))?,
		chat_id: ChatId::new(chat_id).map_err(|e| DeliveryError::Unavailable(anyhow!(e)))?,
		sender_id: UserId::new(sender_id).map_err(|e| DeliveryError::Unavailable(anyhow!(e)))?,
		kind: MessageKind::from_str(&kind).map_err(|e| DeliveryError::Unavailable(anyhow!(e)))?,
		content,
		reply_to_id: reply_to_id.map(MessageId::new).transpose().map_err(|e| DeliveryError::Unavailable(anyhow!(e)))?,
		created_at_ms,
	})
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
	e.as_database_error().map(|d| d.is_unique_violation()).unwrap_or(false)
}
