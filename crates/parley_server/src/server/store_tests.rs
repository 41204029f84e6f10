#![forbid(unsafe_code)]

use parley_domain::{DeliveryState, MessageKind, UserId};

use crate::server::status::StatusTracker;
use crate::server::store::ChatStore;

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

async fn mem_store() -> ChatStore {
	ChatStore::connect("sqlite::memory:").await.expect("in-memory store")
}

#[tokio::test]
async fn find_or_create_is_idempotent_per_pair() {
	let store = mem_store().await;
	let a = user("u-a");
	let b = user("u-b");

	let first = store.find_or_create_private_chat(&a, &b).await.expect("create");
	let second = store.find_or_create_private_chat(&a, &b).await.expect("get");
	assert_eq!(first.id, second.id);

	// Order of the pair must not matter.
	let reversed = store.find_or_create_private_chat(&b, &a).await.expect("get reversed");
	assert_eq!(first.id, reversed.id);
	assert!(!first.is_group);
}

#[tokio::test]
async fn concurrent_first_contact_resolves_to_one_chat() {
	let store = mem_store().await;
	let a = user("u-a");
	let b = user("u-b");

	let tasks = (0..8).map(|_| {
		let store = store.clone();
		let a = a.clone();
		let b = b.clone();
		tokio::spawn(async move { store.find_or_create_private_chat(&a, &b).await })
	});

	let results = futures::future::join_all(tasks).await;
	let ids: Vec<_> = results
		.into_iter()
		.map(|r| r.expect("task").expect("resolve").id)
		.collect();

	assert!(ids.windows(2).all(|w| w[0] == w[1]), "expected a single chat id, got: {ids:?}");
}

#[tokio::test]
async fn self_chat_has_a_single_membership() {
	let store = mem_store().await;
	let a = user("u-solo");

	let chat = store.find_or_create_private_chat(&a, &a).await.expect("self chat");
	let members = store.member_ids(&chat.id).await.expect("members");
	assert_eq!(members, vec![a.clone()]);

	// Messaging yourself leaves nothing undelivered.
	let created = store
		.create_message(&chat, &a, MessageKind::Text, "note to self", None)
		.await
		.expect("create message");
	assert!(created.recipients.is_empty());

	let tracker = StatusTracker::new(&store);
	assert!(tracker.statuses_for_message(&created.message.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn message_creation_seeds_one_sent_entry_per_recipient() {
	let store = mem_store().await;
	let tracker = StatusTracker::new(&store);
	let a = user("u-a");
	let b = user("u-b");

	let chat = store.find_or_create_private_chat(&a, &b).await.expect("chat");
	let created = store
		.create_message(&chat, &a, MessageKind::Text, "hello", None)
		.await
		.expect("create message");

	assert_eq!(created.recipients, vec![b.clone()]);

	let statuses = tracker.statuses_for_message(&created.message.id).await.expect("statuses");
	assert_eq!(statuses, vec![(b, DeliveryState::Sent)]);
}

#[tokio::test]
async fn group_message_seeds_all_members_except_sender() {
	let store = mem_store().await;
	let tracker = StatusTracker::new(&store);
	let a = user("u-a");
	let b = user("u-b");
	let c = user("u-c");

	let chat = store
		.create_group_chat(&[a.clone(), b.clone(), c.clone()])
		.await
		.expect("group chat");
	assert!(chat.is_group);

	let created = store
		.create_message(&chat, &a, MessageKind::Text, "hi all", None)
		.await
		.expect("create message");

	let mut statuses = tracker.statuses_for_message(&created.message.id).await.expect("statuses");
	statuses.sort_by(|x, y| x.0.as_str().cmp(y.0.as_str()));
	assert_eq!(statuses, vec![(b, DeliveryState::Sent), (c, DeliveryState::Sent)]);
}

#[tokio::test]
async fn delivered_transition_is_idempotent_across_both_paths() {
	let store = mem_store().await;
	let tracker = StatusTracker::new(&store);
	let a = user("u-a");
	let b = user("u-b");

	let chat = store.find_or_create_private_chat(&a, &b).await.expect("chat");
	let created = store
		.create_message(&chat, &a, MessageKind::Text, "hello", None)
		.await
		.expect("create message");

	// Live path first, then the backlog path racing in afterwards.
	tracker.mark_delivered(&created.message.id, &b).await.expect("live path");
	tracker.mark_delivered(&created.message.id, &b).await.expect("repeat is a no-op");

	let late = tracker
		.mark_backlog_delivered(&b, &[created.message.id.clone()])
		.await
		.expect("backlog path");
	assert_eq!(late, 0, "backlog path must not re-transition a delivered entry");

	let statuses = tracker.statuses_for_message(&created.message.id).await.expect("statuses");
	assert_eq!(statuses, vec![(b, DeliveryState::Delivered)]);
}

#[tokio::test]
async fn backlog_returns_sent_entries_oldest_first_then_empties() {
	let store = mem_store().await;
	let tracker = StatusTracker::new(&store);
	let a = user("u-a");
	let b = user("u-b");

	let chat = store.find_or_create_private_chat(&a, &b).await.expect("chat");
	let first = store
		.create_message(&chat, &a, MessageKind::Text, "first", None)
		.await
		.expect("first message");
	let second = store
		.create_message(&chat, &a, MessageKind::Text, "second", None)
		.await
		.expect("second message");

	let backlog = tracker.sent_backlog(&b).await.expect("backlog");
	assert_eq!(backlog.len(), 2);
	assert!(!backlog[0].is_group);
	assert_eq!(backlog[0].message.content, "first");
	assert_eq!(backlog[1].message.content, "second");

	let updated = tracker
		.mark_backlog_delivered(&b, &[first.message.id.clone(), second.message.id.clone()])
		.await
		.expect("batch update");
	assert_eq!(updated, 2);

	assert!(tracker.sent_backlog(&b).await.expect("drained backlog").is_empty());

	// The sender owes nothing.
	assert!(tracker.sent_backlog(&a).await.expect("sender backlog").is_empty());
}

#[tokio::test]
async fn backlog_update_is_scoped_to_the_drained_ids() {
	let store = mem_store().await;
	let tracker = StatusTracker::new(&store);
	let a = user("u-a");
	let b = user("u-b");

	let chat = store.find_or_create_private_chat(&a, &b).await.expect("chat");
	let drained = store
		.create_message(&chat, &a, MessageKind::Text, "drained", None)
		.await
		.expect("drained message");
	let fresh = store
		.create_message(&chat, &a, MessageKind::Text, "arrived mid-drain", None)
		.await
		.expect("fresh message");

	let updated = tracker
		.mark_backlog_delivered(&b, &[drained.message.id.clone()])
		.await
		.expect("scoped update");
	assert_eq!(updated, 1);

	let backlog = tracker.sent_backlog(&b).await.expect("remaining backlog");
	assert_eq!(backlog.len(), 1);
	assert_eq!(backlog[0].message.id, fresh.message.id);
}

#[tokio::test]
async fn chat_ids_for_user_cover_private_and_group_chats() {
	let store = mem_store().await;
	let a = user("u-a");
	let b = user("u-b");
	let c = user("u-c");

	let private = store.find_or_create_private_chat(&a, &b).await.expect("private");
	let group = store.create_group_chat(&[a.clone(), c.clone()]).await.expect("group");

	let mut chats = store.chat_ids_for_user(&a).await.expect("chats");
	chats.sort_by(|x, y| x.as_str().cmp(y.as_str()));
	let mut expected = vec![private.id.clone(), group.id.clone()];
	expected.sort_by(|x, y| x.as_str().cmp(y.as_str()));
	assert_eq!(chats, expected);

	assert_eq!(store.chat_ids_for_user(&b).await.expect("b chats"), vec![private.id]);
}
