#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use parley_domain::{ChatId, MessageId, MessageKind, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors decoding or encoding wire events.
#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// A message as carried on the wire and on the broadcast bus.
///
/// Field names stay camelCase on the wire; clients sort by `createdAt`,
/// not by arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
	pub id: MessageId,
	pub chat_id: ChatId,
	pub sender_id: UserId,
	pub kind: MessageKind,
	pub content: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reply_to_id: Option<MessageId>,
	pub created_at: DateTime<Utc>,
}

/// Payload of an inbound private-message send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateMessage {
	pub to_user_id: UserId,
	pub content: String,
	pub kind: MessageKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reply_to_id: Option<MessageId>,
}

/// Typing / stop-typing signal as seen by clients (both directions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
	pub chat_id: ChatId,
	pub from_user_id: UserId,
}

/// Events a client may send over the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
	#[serde(rename = "message:private")]
	PrivateMessage(PrivateMessage),
	#[serde(rename = "typing")]
	Typing(TypingSignal),
	#[serde(rename = "stop-typing")]
	StopTyping(TypingSignal),
}

impl ClientEvent {
	/// Decode a client event from its JSON wire form.
	pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
		Ok(serde_json::from_str(s)?)
	}
}

/// Chat payload inside a delivery envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
	pub chat_id: ChatId,
	pub message: MessageBody,
}

/// Response envelope for message delivery and send acks.
///
/// The same envelope shape answers the sender's own send (ack or failure)
/// and carries live/backlog deliveries to recipients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEnvelope {
	pub ok: bool,
	pub status: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<MessageData>,
}

impl DeliveryEnvelope {
	/// Successful envelope with a payload.
	pub fn success(status: impl Into<String>, data: MessageData) -> Self {
		Self {
			ok: true,
			status: status.into(),
			data: Some(data),
		}
	}

	/// Failure envelope, returned to the originating connection only.
	pub fn failure(status: impl Into<String>) -> Self {
		Self {
			ok: false,
			status: status.into(),
			data: None,
		}
	}
}

/// Events the server emits to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
	#[serde(rename = "message:private")]
	PrivateMessage(DeliveryEnvelope),
	#[serde(rename = "message:group")]
	GroupMessage(DeliveryEnvelope),
	#[serde(rename = "typing")]
	Typing(TypingSignal),
	#[serde(rename = "stop-typing")]
	StopTyping(TypingSignal),
}

impl ServerEvent {
	/// Delivery event for a chat, named by the chat's group flag.
	pub fn delivery(is_group: bool, envelope: DeliveryEnvelope) -> Self {
		if is_group {
			ServerEvent::GroupMessage(envelope)
		} else {
			ServerEvent::PrivateMessage(envelope)
		}
	}

	/// Encode to the JSON wire form.
	pub fn to_json(&self) -> Result<String, ProtocolError> {
		Ok(serde_json::to_string(self)?)
	}
}
