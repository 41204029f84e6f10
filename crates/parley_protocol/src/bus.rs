#![forbid(unsafe_code)]

use parley_domain::{BusChannel, ChatId, ConnectionId, ParseIdError, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::MessageBody;

/// Errors decoding bus payloads received from other processes.
#[derive(Debug, Error)]
pub enum BusCodecError {
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
	#[error("channel error: {0}")]
	Channel(#[from] ParseIdError),
}

/// Cross-process payload on `chat:<chat_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
	pub chat_id: ChatId,
	pub message: MessageBody,
	pub is_group: bool,
	/// Connection the message originated from; suppressed on re-emit so
	/// the sender never receives an echo of its own message.
	pub origin: ConnectionId,
}

/// Cross-process payload on `typing:<chat_id>` / `stop-typing:<chat_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEnvelope {
	pub chat_id: ChatId,
	pub from_user_id: UserId,
	pub origin: ConnectionId,
	pub timestamp_ms: i64,
	/// Present on typing starts: receiving processes refresh the sender's
	/// typing claim by this many seconds.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ttl_secs: Option<u64>,
}

/// A decoded event as carried by the broadcast bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
	Message(MessageEnvelope),
	Typing(TypingEnvelope),
	StopTyping(TypingEnvelope),
}

impl BusEvent {
	/// The channel this event publishes to.
	pub fn channel(&self) -> BusChannel {
		match self {
			BusEvent::Message(env) => BusChannel::Message(env.chat_id.clone()),
			BusEvent::Typing(env) => BusChannel::Typing(env.chat_id.clone()),
			BusEvent::StopTyping(env) => BusChannel::StopTyping(env.chat_id.clone()),
		}
	}

	/// The connection the event originated from.
	pub fn origin(&self) -> ConnectionId {
		match self {
			BusEvent::Message(env) => env.origin,
			BusEvent::Typing(env) | BusEvent::StopTyping(env) => env.origin,
		}
	}

	/// Encode the payload for publishing.
	pub fn encode_payload(&self) -> Result<String, BusCodecError> {
		let payload = match self {
			BusEvent::Message(env) => serde_json::to_string(env)?,
			BusEvent::Typing(env) | BusEvent::StopTyping(env) => serde_json::to_string(env)?,
		};
		Ok(payload)
	}

	/// Decode a `(channel, payload)` pair received from a subscription.
	pub fn decode(channel: &str, payload: &str) -> Result<Self, BusCodecError> {
		match BusChannel::parse(channel)? {
			BusChannel::Message(_) => Ok(BusEvent::Message(serde_json::from_str(payload)?)),
			BusChannel::Typing(_) => Ok(BusEvent::Typing(serde_json::from_str(payload)?)),
			BusChannel::StopTyping(_) => Ok(BusEvent::StopTyping(serde_json::from_str(payload)?)),
		}
	}
}
