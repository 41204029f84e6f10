#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown message kind: {0}")]
	UnknownKind(String),
	#[error("unknown delivery state: {0}")]
	UnknownState(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Opaque user identity, assigned by the account layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Persisted chat identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
	/// Create a non-empty `ChatId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Mint a fresh random chat id.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ChatId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChatId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChatId::new(s.to_string())
	}
}

/// Persisted message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
	/// Create a non-empty `MessageId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Mint a fresh random message id.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Process-local connection locator. Never persisted; a user reconnecting
/// always receives a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
	/// Create a new random connection id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ConnectionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat("expected a UUID connection id".into()))
	}
}

/// Kind of message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	Text,
	Image,
	File,
}

impl MessageKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::Text => "text",
			MessageKind::Image => "image",
			MessageKind::File => "file",
		}
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"text" => Ok(MessageKind::Text),
			"image" => Ok(MessageKind::Image),
			"file" => Ok(MessageKind::File),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Per-(message, recipient) delivery state.
///
/// `Sent` is seeded at message-creation time; `Delivered` is reached either
/// through the live broadcast path or the backlog drain on reconnect. The
/// transition is idempotent, so the two paths may race freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
	Sent,
	Delivered,
}

impl DeliveryState {
	/// Stable string identifier, as stored.
	pub const fn as_str(self) -> &'static str {
		match self {
			DeliveryState::Sent => "SENT",
			DeliveryState::Delivered => "DELIVERED",
		}
	}
}

impl fmt::Display for DeliveryState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for DeliveryState {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"" => Err(ParseIdError::Empty),
			"SENT" => Ok(DeliveryState::Sent),
			"DELIVERED" => Ok(DeliveryState::Delivered),
			other => Err(ParseIdError::UnknownState(other.to_string())),
		}
	}
}

/// Order-independent key identifying a private (non-group) conversation.
///
/// The two member identities are sorted lexicographically and joined with
/// `:`, so both orderings of the same pair produce the same key. A UNIQUE
/// constraint on this key in the backing store is what arbitrates
/// concurrent creation attempts across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantKey(String);

impl ParticipantKey {
	/// Compute the key for an unordered pair of users. Self-chat (both
	/// sides the same identity) is a valid pair.
	pub fn for_pair(a: &UserId, b: &UserId) -> Self {
		let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
		Self(format!("{}:{}", lo.as_str(), hi.as_str()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ParticipantKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Broadcast bus channel families, addressed by chat id.
///
/// Channel names are the cross-process contract: every process publishes
/// to them and pattern-subscribes to each family at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BusChannel {
	Message(ChatId),
	Typing(ChatId),
	StopTyping(ChatId),
}

impl BusChannel {
	pub const MESSAGE_PREFIX: &'static str = "chat:";
	pub const TYPING_PREFIX: &'static str = "typing:";
	pub const STOP_TYPING_PREFIX: &'static str = "stop-typing:";

	/// Subscription patterns, one per channel family.
	pub const MESSAGE_PATTERN: &'static str = "chat:*";
	pub const TYPING_PATTERN: &'static str = "typing:*";
	pub const STOP_TYPING_PATTERN: &'static str = "stop-typing:*";

	/// Format the channel name (e.g. `chat:<chat_id>`).
	pub fn format(&self) -> String {
		match self {
			BusChannel::Message(chat) => format!("{}{}", Self::MESSAGE_PREFIX, chat),
			BusChannel::Typing(chat) => format!("{}{}", Self::TYPING_PREFIX, chat),
			BusChannel::StopTyping(chat) => format!("{}{}", Self::STOP_TYPING_PREFIX, chat),
		}
	}

	/// Parse a channel name back into its family and chat id.
	///
	/// `stop-typing:` must be tried before `typing:` would be a concern if
	/// the prefixes overlapped; they do not, but the longest prefix is
	/// still matched first.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		if let Some(rest) = s.strip_prefix(Self::STOP_TYPING_PREFIX) {
			return Ok(BusChannel::StopTyping(ChatId::new(rest)?));
		}
		if let Some(rest) = s.strip_prefix(Self::TYPING_PREFIX) {
			return Ok(BusChannel::Typing(ChatId::new(rest)?));
		}
		if let Some(rest) = s.strip_prefix(Self::MESSAGE_PREFIX) {
			return Ok(BusChannel::Message(ChatId::new(rest)?));
		}

		Err(ParseIdError::InvalidFormat(format!("unknown channel: {s}")))
	}

	/// The chat the channel addresses.
	pub fn chat_id(&self) -> &ChatId {
		match self {
			BusChannel::Message(chat) | BusChannel::Typing(chat) | BusChannel::StopTyping(chat) => chat,
		}
	}
}

impl fmt::Display for BusChannel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.format())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn participant_key_is_order_independent() {
		let a = UserId::new("user-a").unwrap();
		let b = UserId::new("user-b").unwrap();
		assert_eq!(ParticipantKey::for_pair(&a, &b), ParticipantKey::for_pair(&b, &a));
		assert_eq!(ParticipantKey::for_pair(&a, &b).as_str(), "user-a:user-b");
	}

	#[test]
	fn participant_key_allows_self_pair() {
		let a = UserId::new("solo").unwrap();
		assert_eq!(ParticipantKey::for_pair(&a, &a).as_str(), "solo:solo");
	}

	#[test]
	fn bus_channel_format_parse_roundtrip() {
		let chat = ChatId::new("c-42").unwrap();
		for channel in [
			BusChannel::Message(chat.clone()),
			BusChannel::Typing(chat.clone()),
			BusChannel::StopTyping(chat.clone()),
		] {
			let parsed = BusChannel::parse(&channel.format()).unwrap();
			assert_eq!(parsed, channel);
			assert_eq!(parsed.chat_id(), &chat);
		}
	}

	#[test]
	fn bus_channel_rejects_unknown_and_empty() {
		assert!(BusChannel::parse("").is_err());
		assert!(BusChannel::parse("presence:u1").is_err());
		assert!(BusChannel::parse("chat:").is_err());
	}

	#[test]
	fn delivery_state_parse_and_display() {
		assert_eq!("SENT".parse::<DeliveryState>().unwrap(), DeliveryState::Sent);
		assert_eq!(DeliveryState::Delivered.to_string(), "DELIVERED");
		assert!("READ".parse::<DeliveryState>().is_err());
	}

	#[test]
	fn message_kind_parse_and_display() {
		assert_eq!("text".parse::<MessageKind>().unwrap(), MessageKind::Text);
		assert_eq!("IMAGE".parse::<MessageKind>().unwrap(), MessageKind::Image);
		assert_eq!(MessageKind::File.to_string(), "file");
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(UserId::new("").is_err());
		assert!(ChatId::new("   ").is_err());
		assert!(MessageId::new("").is_err());
		assert!("".parse::<ConnectionId>().is_err());
		assert!("not-a-uuid".parse::<ConnectionId>().is_err());
	}
}
