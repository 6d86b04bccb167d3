//! Property tests for the message status lifecycle.
//!
//! Random sequences of attempted transitions are filtered through
//! `can_advance_to`; whatever gets through must still describe a forward
//! walk that stops for good at a terminal status.

use meshchat_proto::message::MessageStatus;
use proptest::prelude::*;

fn arb_status() -> impl Strategy<Value = MessageStatus> {
    prop_oneof![
        Just(MessageStatus::Sending),
        Just(MessageStatus::Sent),
        Just(MessageStatus::Delivered),
        Just(MessageStatus::Failed),
    ]
}

fn rank(status: MessageStatus) -> u8 {
    match status {
        MessageStatus::Sending => 0,
        MessageStatus::Sent => 1,
        MessageStatus::Delivered => 2,
        MessageStatus::Failed => 3,
    }
}

/// Applies every legal attempt in order and returns the visited statuses.
fn walk(attempts: &[MessageStatus]) -> Vec<MessageStatus> {
    let mut visited = vec![MessageStatus::Sending];
    for &next in attempts {
        let current = *visited.last().unwrap();
        if current.can_advance_to(next) {
            visited.push(next);
        }
    }
    visited
}

proptest! {
    #[test]
    fn status_never_moves_backwards(attempts in prop::collection::vec(arb_status(), 0..32)) {
        let visited = walk(&attempts);
        for pair in visited.windows(2) {
            prop_assert!(rank(pair[0]) < rank(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_status_is_final(attempts in prop::collection::vec(arb_status(), 0..32)) {
        let visited = walk(&attempts);
        if let Some(pos) = visited.iter().position(|s| s.is_terminal()) {
            prop_assert_eq!(pos, visited.len() - 1);
        }
    }

    #[test]
    fn walk_never_skips_a_state(attempts in prop::collection::vec(arb_status(), 0..32)) {
        let visited = walk(&attempts);
        for pair in visited.windows(2) {
            if pair[1] != MessageStatus::Failed {
                prop_assert_eq!(rank(pair[1]), rank(pair[0]) + 1);
            }
        }
    }

    #[test]
    fn failed_is_reachable_from_any_non_terminal(from in arb_status()) {
        prop_assert_eq!(from.can_advance_to(MessageStatus::Failed), !from.is_terminal());
    }
}

#[test]
fn happy_path_reaches_delivered() {
    let visited = walk(&[MessageStatus::Sent, MessageStatus::Delivered]);
    assert_eq!(
        visited,
        [
            MessageStatus::Sending,
            MessageStatus::Sent,
            MessageStatus::Delivered
        ]
    );
}

#[test]
fn delivered_cannot_fail() {
    let visited = walk(&[
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Failed,
    ]);
    assert_eq!(visited.last(), Some(&MessageStatus::Delivered));
}
