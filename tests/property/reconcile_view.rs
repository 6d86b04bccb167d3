//! Property tests for `merge_view`.
//!
//! 1. An unchanged snapshot hands back the very same view.
//! 2. Any change in message count replaces the view with the snapshot.
//! 3. A replaced view is exactly the snapshot followed by pending sends.
//! 4. Whether kept or replaced, the result has the snapshot's length.

use std::sync::Arc;

use meshchat::reconcile::{MergeOutcome, MessageView, ReplaceReason, merge_view};
use meshchat_proto::ids::{ConversationId, Fingerprint, MessageId, Timestamp};
use meshchat_proto::message::{Endpoint, Message, MessageStatus};
use proptest::prelude::*;

fn arb_status() -> impl Strategy<Value = MessageStatus> {
    prop_oneof![
        Just(MessageStatus::Sending),
        Just(MessageStatus::Sent),
        Just(MessageStatus::Delivered),
        Just(MessageStatus::Failed),
    ]
}

fn arb_message() -> impl Strategy<Value = Message> {
    (any::<u32>(), "[a-z ]{1,16}", arb_status(), any::<bool>(), 0u64..1_000_000).prop_map(
        |(n, text, status, mine, at)| {
            let peer = Endpoint::Peer(Fingerprint::new("PEER-1"));
            let (from, to) = if mine {
                (Endpoint::Me, peer)
            } else {
                (peer, Endpoint::Me)
            };
            Message {
                id: MessageId::new(n.to_string()),
                conversation_id: ConversationId::new("c1"),
                text,
                from,
                to,
                status,
                timestamp: Timestamp::from_millis(at),
            }
        },
    )
}

fn arb_messages(max: usize) -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec(arb_message(), 0..max).prop_map(|mut messages| {
        messages.sort_by_key(|m| m.timestamp);
        messages
    })
}

proptest! {
    #[test]
    fn unchanged_snapshot_is_kept(messages in arb_messages(24)) {
        let local = MessageView::from(messages.clone());
        let merged = merge_view(&local, messages, &[]);
        prop_assert_eq!(merged.outcome, MergeOutcome::Kept);
        prop_assert!(Arc::ptr_eq(&merged.view, &local));
    }

    #[test]
    fn count_change_always_replaces(
        local in arb_messages(24),
        fresh in arb_messages(24),
    ) {
        prop_assume!(local.len() != fresh.len());
        let local = MessageView::from(local);
        let merged = merge_view(&local, fresh.clone(), &[]);
        prop_assert_eq!(merged.outcome, MergeOutcome::Replaced(ReplaceReason::CountChanged));
        prop_assert_eq!(&merged.view[..], &fresh[..]);
    }

    #[test]
    fn replaced_view_is_snapshot_then_pending(
        local in arb_messages(12),
        fresh in arb_messages(12),
        pending_count in 1usize..4,
    ) {
        let pending: Vec<Message> = (1..=pending_count as u64)
            .map(|seq| Message {
                id: MessageId::placeholder(seq),
                conversation_id: ConversationId::new("c1"),
                text: format!("pending {seq}"),
                from: Endpoint::Me,
                to: Endpoint::Peer(Fingerprint::new("PEER-1")),
                status: MessageStatus::Sending,
                timestamp: Timestamp::from_millis(2_000_000),
            })
            .collect();
        let local = MessageView::from(local);
        let merged = merge_view(&local, fresh.clone(), &pending);
        if merged.outcome.is_replaced() {
            let mut expected = fresh;
            expected.extend(pending);
            prop_assert_eq!(&merged.view[..], &expected[..]);
        } else {
            prop_assert!(Arc::ptr_eq(&merged.view, &local));
        }
    }

    #[test]
    fn result_length_tracks_snapshot(
        local in arb_messages(16),
        fresh in arb_messages(16),
    ) {
        let local = MessageView::from(local);
        let expected = fresh.len();
        let merged = merge_view(&local, fresh, &[]);
        prop_assert_eq!(merged.view.len(), expected);
    }
}
