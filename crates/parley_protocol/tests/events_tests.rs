use chrono::{TimeZone, Utc};
use parley_domain::{ChatId, ConnectionId, MessageId, MessageKind, UserId};
use parley_protocol::bus::{BusEvent, MessageEnvelope, TypingEnvelope};
use parley_protocol::{ClientEvent, DeliveryEnvelope, MessageBody, MessageData, ServerEvent};
use proptest::prelude::*;

fn sample_message() -> MessageBody {
	MessageBody {
		id: MessageId::new("m-1").expect("valid MessageId"),
		chat_id: ChatId::new("c-1").expect("valid ChatId"),
		sender_id: UserId::new("u-sender").expect("valid UserId"),
		kind: MessageKind::Text,
		content: "hello".to_string(),
		reply_to_id: None,
		created_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
	}
}

#[test]
fn decodes_private_message_send() {
	let raw = r#"{
		"event": "message:private",
		"data": {"toUserId": "u-2", "content": "hi there", "kind": "text"}
	}"#;

	let ev = ClientEvent::from_json(raw).expect("decode client event");
	match ev {
		ClientEvent::PrivateMessage(msg) => {
			assert_eq!(msg.to_user_id.as_str(), "u-2");
			assert_eq!(msg.content, "hi there");
			assert_eq!(msg.kind, MessageKind::Text);
			assert!(msg.reply_to_id.is_none());
		}
		other => panic!("expected PrivateMessage, got: {other:?}"),
	}
}

#[test]
fn decodes_typing_and_stop_typing() {
	let raw = r#"{"event": "typing", "data": {"chatId": "c-7", "fromUserId": "u-1"}}"#;
	let ev = ClientEvent::from_json(raw).expect("decode typing");
	assert!(matches!(ev, ClientEvent::Typing(ref s) if s.chat_id.as_str() == "c-7"));

	let raw = r#"{"event": "stop-typing", "data": {"chatId": "c-7", "fromUserId": "u-1"}}"#;
	let ev = ClientEvent::from_json(raw).expect("decode stop-typing");
	assert!(matches!(ev, ClientEvent::StopTyping(ref s) if s.from_user_id.as_str() == "u-1"));
}

#[test]
fn rejects_unknown_event_name() {
	let raw = r#"{"event": "message:edit", "data": {}}"#;
	assert!(ClientEvent::from_json(raw).is_err());
}

#[test]
fn ack_envelope_wire_shape() {
	let message = sample_message();
	let ev = ServerEvent::PrivateMessage(DeliveryEnvelope::success(
		"success",
		MessageData {
			chat_id: message.chat_id.clone(),
			message,
		},
	));

	let json = ev.to_json().expect("encode");
	let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");

	assert_eq!(value["event"], "message:private");
	assert_eq!(value["data"]["ok"], true);
	assert_eq!(value["data"]["status"], "success");
	assert_eq!(value["data"]["data"]["chatId"], "c-1");
	assert_eq!(value["data"]["data"]["message"]["senderId"], "u-sender");
}

#[test]
fn failure_envelope_has_no_payload() {
	let ev = ServerEvent::PrivateMessage(DeliveryEnvelope::failure("failed to send message"));
	let json = ev.to_json().expect("encode");
	let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");

	assert_eq!(value["data"]["ok"], false);
	assert!(value["data"].get("data").is_none());
}

#[test]
fn delivery_event_name_follows_group_flag() {
	let message = sample_message();
	let data = MessageData {
		chat_id: message.chat_id.clone(),
		message,
	};

	let private = ServerEvent::delivery(false, DeliveryEnvelope::success("success", data.clone()));
	assert!(matches!(private, ServerEvent::PrivateMessage(_)));

	let group = ServerEvent::delivery(true, DeliveryEnvelope::success("success", data));
	assert!(matches!(group, ServerEvent::GroupMessage(_)));
}

#[test]
fn bus_message_envelope_roundtrip() {
	let event = BusEvent::Message(MessageEnvelope {
		chat_id: ChatId::new("c-1").unwrap(),
		message: sample_message(),
		is_group: false,
		origin: ConnectionId::new_v4(),
	});

	let channel = event.channel().format();
	assert_eq!(channel, "chat:c-1");

	let payload = event.encode_payload().expect("encode payload");
	let decoded = BusEvent::decode(&channel, &payload).expect("decode payload");
	assert_eq!(decoded, event);
}

#[test]
fn bus_decode_rejects_unknown_channel() {
	assert!(BusEvent::decode("presence:u1", "{}").is_err());
}

proptest! {
	#[test]
	fn bus_typing_envelope_roundtrip(content in "[a-z0-9-]{1,24}", ttl in proptest::option::of(1u64..600)) {
		let chat = ChatId::new(format!("c-{content}")).unwrap();
		let event = BusEvent::Typing(TypingEnvelope {
			chat_id: chat,
			from_user_id: UserId::new("u-1").unwrap(),
			origin: ConnectionId::new_v4(),
			timestamp_ms: 1_700_000_000_000,
			ttl_secs: ttl,
		});

		let channel = event.channel().format();
		let payload = event.encode_payload().unwrap();
		let decoded = BusEvent::decode(&channel, &payload).unwrap();
		prop_assert_eq!(decoded, event);
	}
}
