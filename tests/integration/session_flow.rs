//! Integration tests for the client session.
//!
//! Covers optimistic sends and deletes through `ChatView`, change
//! notification on the published view, background polling, and the
//! conversation list.
//!
//! Verification command: `cargo test --test session_flow`

use std::sync::Arc;
use std::time::Duration;

use meshchat::clock::TokioClock;
use meshchat::delivery::{DeliveryEvent, reply_text};
use meshchat::ids::{IdGenerator, SequentialIds};
use meshchat::reconcile::{MergeOutcome, ReplaceReason};
use meshchat::session::{ChatView, Session, SessionConfig, SessionError};
use meshchat::store::{EntityStore, FaultyStore, InMemoryStore, Operation};
use meshchat_proto::contact::{Contact, NewContact};
use meshchat_proto::conversation::Conversation;
use meshchat_proto::ids::{Fingerprint, MessageId, Timestamp};
use meshchat_proto::message::{Message, MessageStatus, ValidationError};
use tokio::sync::mpsc;

// =============================================================================
// Test helpers
// =============================================================================

type Store = FaultyStore<InMemoryStore>;

struct Harness {
    store: Arc<Store>,
    session: Session<Store>,
    _events: mpsc::Receiver<DeliveryEvent>,
}

fn harness() -> Harness {
    let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIds::new());
    let store = Arc::new(FaultyStore::new(InMemoryStore::with_ids(Arc::clone(&ids))));
    let (session, events) = Session::new(
        Arc::clone(&store),
        ids,
        Arc::new(TokioClock::starting_at(Timestamp::from_millis(
            1_700_000_000_000,
        ))),
        &SessionConfig::default(),
    );
    Harness {
        store,
        session,
        _events: events,
    }
}

async fn add_peer(session: &Session<Store>, username: &str, fingerprint: &str) -> Contact {
    session
        .add_contact(NewContact {
            username: username.into(),
            display_name: username.to_uppercase(),
            fingerprint: Fingerprint::new(fingerprint),
            avatar_url: None,
        })
        .await
        .unwrap()
}

async fn open_whiskers(h: &Harness) -> Arc<ChatView<Store>> {
    h.session.create_profile("me", None, None).await.unwrap();
    let whiskers = add_peer(&h.session, "whiskers", "PEER-1").await;
    h.session.open_chat(&whiskers.id).await.unwrap()
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// =============================================================================
// Optimistic send
// =============================================================================

#[tokio::test(start_paused = true)]
async fn send_swaps_placeholder_for_stored_message() {
    let h = harness();
    let chat = open_whiskers(&h).await;
    let rx = chat.subscribe();

    let sent = chat.send_and_track("  hello  ").await.unwrap();
    assert_eq!(sent.text, "hello");
    assert!(!sent.id.is_placeholder());
    assert!(rx.has_changed().unwrap());

    let view = chat.snapshot();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].id, sent.id);
    assert_eq!(view[0].status, MessageStatus::Sending);
    assert_eq!(chat.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn blank_send_leaves_view_untouched() {
    let h = harness();
    let chat = open_whiskers(&h).await;
    let rx = chat.subscribe();

    let err = chat.send_and_track("   ").await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Validation(ValidationError::EmptyText)
    ));
    assert!(!rx.has_changed().unwrap());
    assert!(chat.snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_send_removes_placeholder() {
    let h = harness();
    let chat = open_whiskers(&h).await;

    h.store.set_failing(Operation::Create, true);
    let err = chat.send_and_track("hello").await.unwrap_err();
    assert!(matches!(err, SessionError::SendFailed(_)));

    assert!(chat.snapshot().is_empty());
    assert_eq!(chat.pending_count(), 0);
    assert_eq!(h.store.inner().count::<Message>(), 0);
    assert_eq!(h.session.engine().in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn full_exchange_shows_reply_after_refresh() {
    let h = harness();
    let chat = open_whiskers(&h).await;
    chat.send_and_track("hello").await.unwrap();

    sleep_ms(6_000).await;
    let outcome = chat.refresh().await.unwrap();
    assert_eq!(outcome, MergeOutcome::Replaced(ReplaceReason::CountChanged));

    let view = chat.snapshot();
    assert_eq!(view.len(), 2);
    assert_eq!(view[0].status, MessageStatus::Delivered);
    assert_eq!(view[1].text, reply_text("hello"));
    assert!(!view[1].from.is_me());

    let listing = h.session.conversations(None).await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(
        listing[0].conversation.last_message_text.as_deref(),
        Some(reply_text("hello").as_str())
    );
}

// =============================================================================
// Optimistic delete
// =============================================================================

#[tokio::test(start_paused = true)]
async fn delete_removes_message_everywhere() {
    let h = harness();
    let chat = open_whiskers(&h).await;
    let sent = chat.send_and_track("hello").await.unwrap();

    chat.delete_message(&sent.id).await.unwrap();
    assert!(chat.snapshot().is_empty());
    assert!(h.store.get::<Message>(&sent.id).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_delete_restores_message() {
    let h = harness();
    let chat = open_whiskers(&h).await;
    let sent = chat.send_and_track("hello").await.unwrap();

    h.store.set_failing(Operation::Delete, true);
    let err = chat.delete_message(&sent.id).await.unwrap_err();
    assert!(matches!(err, SessionError::Store(_)));

    let view = chat.snapshot();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].id, sent.id);
}

#[tokio::test(start_paused = true)]
async fn deleting_unknown_placeholder_is_harmless() {
    let h = harness();
    let chat = open_whiskers(&h).await;
    chat.send_and_track("hello").await.unwrap();

    chat.delete_message(&MessageId::placeholder(99)).await.unwrap();
    assert_eq!(chat.snapshot().len(), 1);
}

// =============================================================================
// Change notification and polling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn watchers_wake_only_on_replacement() {
    let h = harness();
    let chat = open_whiskers(&h).await;
    chat.send_and_track("hello").await.unwrap();
    let mut rx = chat.subscribe();

    assert_eq!(chat.refresh().await.unwrap(), MergeOutcome::Kept);
    assert!(!rx.has_changed().unwrap());

    sleep_ms(1_600).await;
    assert_eq!(
        chat.refresh().await.unwrap(),
        MergeOutcome::Replaced(ReplaceReason::TrailingStatusChanged)
    );
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update()[0].status, MessageStatus::Sent);
}

#[tokio::test(start_paused = true)]
async fn poller_picks_up_lifecycle_changes() {
    let h = harness();
    let chat = open_whiskers(&h).await;
    let poller = chat.spawn_poller(Duration::from_secs(1));
    let sent = chat.send_and_track("hello").await.unwrap();

    // Delivered at +3.5s, next poll at +4s.
    sleep_ms(4_200).await;
    let view = chat.snapshot();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].id, sent.id);
    assert_eq!(view[0].status, MessageStatus::Delivered);

    // Reply at +5.5s, next poll at +6s.
    sleep_ms(2_000).await;
    assert_eq!(chat.snapshot().len(), 2);
    poller.abort();
}

#[tokio::test(start_paused = true)]
async fn zero_poll_interval_still_polls() {
    let h = harness();
    let chat = open_whiskers(&h).await;
    let poller = chat.spawn_poller(Duration::ZERO);
    chat.send_and_track("hello").await.unwrap();

    sleep_ms(1_600).await;
    assert!(!poller.is_finished());
    assert_eq!(chat.snapshot()[0].status, MessageStatus::Sent);
    poller.abort();
    h.session.shutdown();
}

// =============================================================================
// Conversation list
// =============================================================================

#[tokio::test(start_paused = true)]
async fn deleted_conversation_leaves_the_list() {
    let h = harness();
    let c1 = open_whiskers(&h).await;
    let felix = add_peer(&h.session, "felix", "PEER-2").await;
    let c2 = h.session.open_chat(&felix.id).await.unwrap();

    c1.send_and_track("hi whiskers").await.unwrap();
    for n in 0..5 {
        c2.send_and_track(&format!("hi felix {n}")).await.unwrap();
    }
    h.session.shutdown();

    let mut listing = h.session.conversations(None).await.unwrap();
    assert_eq!(listing.len(), 2);
    h.session
        .delete_conversation(c2.conversation_id(), &mut listing)
        .await
        .unwrap();
    assert_eq!(listing.len(), 1);

    let fresh = h.session.conversations(None).await.unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(&fresh[0].conversation.id, c1.conversation_id());
    assert!(
        h.store
            .get::<Conversation>(c2.conversation_id())
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test(start_paused = true)]
async fn listing_survives_deleted_contact() {
    let h = harness();
    let chat = open_whiskers(&h).await;
    let whiskers = chat.conversation().contact_id.clone();
    assert!(h.session.delete_contact(&whiskers).await.unwrap());

    let listing = h.session.conversations(None).await.unwrap();
    assert_eq!(listing.len(), 1);
    assert!(listing[0].contact.is_none());
    assert!(h.session.conversations(Some("whiskers")).await.unwrap().is_empty());
}
