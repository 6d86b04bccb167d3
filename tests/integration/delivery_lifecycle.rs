//! Integration tests for the delivery lifecycle.
//!
//! Drives `DeliveryEngine` over an in-memory store with paused Tokio time:
//! status progression, the simulated reply, conversation summaries,
//! concurrent sends, and deletes racing the lifecycle.
//!
//! Verification command: `cargo test --test delivery_lifecycle`

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use meshchat::clock::TokioClock;
use meshchat::delivery::{DeliveryEngine, DeliveryEvent, DeliveryTimings, SendError, reply_text};
use meshchat::ids::SequentialIds;
use meshchat::store::{EntityStore, FaultyStore, InMemoryStore, Operation, Query};
use meshchat_proto::conversation::{Conversation, NewConversation};
use meshchat_proto::ids::{ContactId, ConversationId, Fingerprint, Timestamp};
use meshchat_proto::message::{Endpoint, Message, MessageStatus, ValidationError};

// =============================================================================
// Test helpers
// =============================================================================

type Store = FaultyStore<InMemoryStore>;

struct Harness {
    store: Arc<Store>,
    engine: DeliveryEngine<Store>,
    events: mpsc::Receiver<DeliveryEvent>,
    conversation: ConversationId,
}

async fn harness() -> Harness {
    let store = Arc::new(FaultyStore::new(InMemoryStore::with_ids(Arc::new(
        SequentialIds::new(),
    ))));
    let clock = Arc::new(TokioClock::starting_at(Timestamp::from_millis(
        1_700_000_000_000,
    )));
    let (engine, events) =
        DeliveryEngine::new(Arc::clone(&store), clock, DeliveryTimings::default(), 64);
    let conversation = store
        .create::<Conversation>(NewConversation {
            contact_id: ContactId::new("whiskers"),
            last_message_time: None,
        })
        .await
        .unwrap();
    Harness {
        store,
        engine,
        events,
        conversation: conversation.id,
    }
}

fn peer() -> Fingerprint {
    Fingerprint::new("PEER-1")
}

async fn messages_in(store: &Store, conversation: &ConversationId) -> Vec<Message> {
    let id = conversation.clone();
    store
        .filter(Query::matching(move |m: &Message| m.conversation_id == id))
        .await
        .unwrap()
}

async fn status_of(store: &Store, message: &Message) -> Option<MessageStatus> {
    store
        .get::<Message>(&message.id)
        .await
        .unwrap()
        .map(|m| m.status)
}

async fn summary(store: &Store, conversation: &ConversationId) -> Conversation {
    store
        .get::<Conversation>(conversation)
        .await
        .unwrap()
        .unwrap()
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn hello_walks_through_every_status_and_gets_a_reply() {
    let h = harness().await;
    let sent = h.engine.submit(&h.conversation, "hello", &peer()).await.unwrap();
    assert_eq!(status_of(&h.store, &sent).await, Some(MessageStatus::Sending));

    sleep_ms(1_600).await;
    assert_eq!(status_of(&h.store, &sent).await, Some(MessageStatus::Sent));

    sleep_ms(2_000).await;
    assert_eq!(
        status_of(&h.store, &sent).await,
        Some(MessageStatus::Delivered)
    );

    sleep_ms(2_000).await;
    let all = messages_in(&h.store, &h.conversation).await;
    let reply = all
        .iter()
        .find(|m| m.from == Endpoint::Peer(peer()))
        .expect("reply stored");
    assert!(reply.text.contains("hello"));
    assert_eq!(reply.text, reply_text("hello"));
    assert_eq!(reply.to, Endpoint::Me);
    assert_eq!(reply.status, MessageStatus::Delivered);

    let conv = summary(&h.store, &h.conversation).await;
    assert_eq!(conv.last_message_text.as_deref(), Some(reply.text.as_str()));
    assert_eq!(conv.unread_count, 1);
    assert_eq!(h.engine.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn status_does_not_move_before_its_delay() {
    let h = harness().await;
    let sent = h.engine.submit(&h.conversation, "hello", &peer()).await.unwrap();

    sleep_ms(1_400).await;
    assert_eq!(status_of(&h.store, &sent).await, Some(MessageStatus::Sending));
    sleep_ms(2_000).await;
    assert_eq!(status_of(&h.store, &sent).await, Some(MessageStatus::Sent));
    sleep_ms(2_000).await;
    assert_eq!(messages_in(&h.store, &h.conversation).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_sends_each_get_their_own_reply() {
    let h = harness().await;
    let (peer_a, peer_b) = (peer(), peer());
    let (a, b) = tokio::join!(
        h.engine.submit(&h.conversation, "first", &peer_a),
        h.engine.submit(&h.conversation, "second", &peer_b),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.id, b.id);
    assert_eq!(h.engine.in_flight(), 2);

    sleep_ms(6_000).await;
    assert_eq!(status_of(&h.store, &a).await, Some(MessageStatus::Delivered));
    assert_eq!(status_of(&h.store, &b).await, Some(MessageStatus::Delivered));

    let replies: Vec<String> = messages_in(&h.store, &h.conversation)
        .await
        .into_iter()
        .filter(|m| !m.from.is_me())
        .map(|m| m.text)
        .collect();
    assert_eq!(replies.len(), 2);
    assert!(replies.contains(&reply_text("first")));
    assert!(replies.contains(&reply_text("second")));
    assert_eq!(summary(&h.store, &h.conversation).await.unread_count, 2);
}

#[tokio::test(start_paused = true)]
async fn events_follow_the_lifecycle() {
    let mut h = harness().await;
    let sent = h.engine.submit(&h.conversation, "hello", &peer()).await.unwrap();
    sleep_ms(6_000).await;

    let mut seen = Vec::new();
    while let Ok(event) = h.events.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen.len(), 4);
    for (event, status) in seen.iter().zip([
        MessageStatus::Sending,
        MessageStatus::Sent,
        MessageStatus::Delivered,
    ]) {
        assert_eq!(
            *event,
            DeliveryEvent::StatusChanged {
                message_id: sent.id.clone(),
                conversation_id: h.conversation.clone(),
                status,
            }
        );
    }
    assert!(matches!(
        &seen[3],
        DeliveryEvent::ReplyReceived { reply, .. } if reply.text == reply_text("hello")
    ));
}

// =============================================================================
// Rejections
// =============================================================================

#[tokio::test(start_paused = true)]
async fn empty_text_is_rejected_without_store_writes() {
    let h = harness().await;
    for text in ["", "   ", "\n\t"] {
        let result = h.engine.submit(&h.conversation, text, &peer()).await;
        assert!(matches!(
            result,
            Err(SendError::Validation(ValidationError::EmptyText))
        ));
    }
    assert_eq!(h.store.inner().count::<Message>(), 0);
    assert_eq!(summary(&h.store, &h.conversation).await.last_message_text, None);
    assert_eq!(h.engine.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_append_leaves_nothing_behind() {
    let h = harness().await;
    h.store.set_failing(Operation::Create, true);
    let result = h.engine.submit(&h.conversation, "hello", &peer()).await;
    assert!(matches!(result, Err(SendError::SendFailed(_))));

    h.store.set_failing(Operation::Create, false);
    sleep_ms(6_000).await;
    assert_eq!(h.store.inner().count::<Message>(), 0);
    assert_eq!(summary(&h.store, &h.conversation).await.last_message_text, None);
}

// =============================================================================
// Deletes racing the lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn deleted_message_is_never_resurrected() {
    let h = harness().await;
    let sent = h.engine.submit(&h.conversation, "hello", &peer()).await.unwrap();
    sleep_ms(500).await;
    assert!(h.store.delete::<Message>(&sent.id).await.unwrap());

    sleep_ms(6_000).await;
    assert_eq!(status_of(&h.store, &sent).await, None);
    assert_eq!(h.engine.in_flight(), 0);

    // The peer still answers while the conversation exists.
    let remaining = messages_in(&h.store, &h.conversation).await;
    assert_eq!(remaining.len(), 1);
    assert!(!remaining[0].from.is_me());
}

#[tokio::test(start_paused = true)]
async fn deleted_conversation_gets_no_reply() {
    let h = harness().await;
    let sent = h.engine.submit(&h.conversation, "hello", &peer()).await.unwrap();
    sleep_ms(2_000).await;
    assert!(h.store.delete::<Conversation>(&h.conversation).await.unwrap());

    sleep_ms(6_000).await;
    let left = messages_in(&h.store, &h.conversation).await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, sent.id);
    assert_eq!(left[0].status, MessageStatus::Delivered);
    assert!(
        h.store
            .get::<Conversation>(&h.conversation)
            .await
            .unwrap()
            .is_none()
    );
}

// =============================================================================
// Conversation summary
// =============================================================================

#[tokio::test(start_paused = true)]
async fn summary_time_never_trails_its_messages() {
    let h = harness().await;
    h.engine.submit(&h.conversation, "one", &peer()).await.unwrap();
    sleep_ms(700).await;
    h.engine.submit(&h.conversation, "two", &peer()).await.unwrap();
    sleep_ms(7_000).await;

    let conv = summary(&h.store, &h.conversation).await;
    let latest = conv.last_message_time.expect("summary set");
    let all = messages_in(&h.store, &h.conversation).await;
    assert_eq!(all.len(), 4);
    for message in &all {
        assert!(latest >= message.timestamp, "{} < {}", latest, message.timestamp);
    }

    let newest = all.iter().max_by_key(|m| m.timestamp).unwrap();
    assert_eq!(conv.last_message_text.as_deref(), Some(newest.text.as_str()));
    assert_eq!(newest.text, reply_text("two"));
}
