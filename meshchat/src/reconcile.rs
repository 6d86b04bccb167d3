//! Poll-driven reconciliation of a locally held message view.
//!
//! The merge is deliberately coarse. A fresh snapshot replaces the local
//! view wholesale when the message count differs, when the set of pending
//! placeholders changed, or when the trailing message's status changed.
//! Otherwise the existing view is handed back untouched, so callers that
//! compare by pointer see no change.
//!
//! A pending placeholder is dropped from the merge once the snapshot holds
//! its stored copy: an outbound message with the same text, stamped no
//! earlier, that the local view has not shown yet. Each stored message
//! stands in for at most one placeholder.
//!
//! Known limitation: an add and a delete landing between two polls leave
//! the count unchanged and go unnoticed until something else changes.

use std::sync::Arc;

use meshchat_proto::ids::{ConversationId, MessageId};
use meshchat_proto::message::Message;

use crate::store::{Direction, EntityStore, Query, StoreError};

/// Most recent messages fetched per conversation unless configured.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Shared, immutable message list ordered by timestamp ascending.
pub type MessageView = Arc<[Message]>;

/// Why a view was replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceReason {
    /// The snapshot holds a different number of messages.
    CountChanged,
    /// A placeholder was added or settled.
    PlaceholdersSettled,
    /// The newest message's status moved.
    TrailingStatusChanged,
}

/// What a merge did with the local view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The local view was kept as is.
    Kept,
    /// The local view was replaced.
    Replaced(ReplaceReason),
}

impl MergeOutcome {
    /// Returns `true` if the view was replaced.
    #[must_use]
    pub const fn is_replaced(self) -> bool {
        matches!(self, Self::Replaced(_))
    }
}

/// Result of [`merge_view`].
#[derive(Debug, Clone)]
pub struct Reconciled {
    /// The view to show next. Pointer-equal to the input when kept.
    pub view: MessageView,
    /// What happened.
    pub outcome: MergeOutcome,
}

fn placeholder_ids(view: &[Message]) -> impl Iterator<Item = &MessageId> + '_ {
    view.iter().filter(|m| m.is_placeholder()).map(|m| &m.id)
}

fn classify(local: &[Message], fresh: &[Message]) -> MergeOutcome {
    if local.len() != fresh.len() {
        return MergeOutcome::Replaced(ReplaceReason::CountChanged);
    }
    if !placeholder_ids(local).eq(placeholder_ids(fresh)) {
        return MergeOutcome::Replaced(ReplaceReason::PlaceholdersSettled);
    }
    match (local.last(), fresh.last()) {
        (Some(mine), Some(theirs)) if mine.status != theirs.status => {
            MergeOutcome::Replaced(ReplaceReason::TrailingStatusChanged)
        }
        _ => MergeOutcome::Kept,
    }
}

fn stands_in_for(stored: &Message, placeholder: &Message) -> bool {
    !stored.is_placeholder()
        && stored.is_outbound()
        && stored.text == placeholder.text
        && stored.timestamp >= placeholder.timestamp
}

/// Merges an authoritative snapshot into a local view.
///
/// `pending` placeholders, not yet confirmed by the store, are appended
/// after the authoritative messages unless the snapshot already carries
/// their stored copy.
#[must_use]
pub fn merge_view(
    local: &MessageView,
    authoritative: Vec<Message>,
    pending: &[Message],
) -> Reconciled {
    let mut fresh = authoritative;
    let mut claimed = vec![false; fresh.len()];
    let mut unconfirmed = Vec::new();
    for placeholder in pending {
        let copy = (0..fresh.len()).find(|&i| {
            !claimed[i]
                && stands_in_for(&fresh[i], placeholder)
                && !local.iter().any(|m| m.id == fresh[i].id)
        });
        match copy {
            Some(i) => claimed[i] = true,
            None => unconfirmed.push(placeholder.clone()),
        }
    }
    fresh.extend(unconfirmed);

    let outcome = classify(local, &fresh);
    let view = if outcome.is_replaced() {
        MessageView::from(fresh)
    } else {
        Arc::clone(local)
    };
    Reconciled { view, outcome }
}

/// Fetches bounded history and merges it into local views.
pub struct Reconciler<S> {
    store: Arc<S>,
    history_limit: usize,
}

impl<S: EntityStore> Reconciler<S> {
    /// Creates a reconciler with the default history limit.
    pub const fn new(store: Arc<S>) -> Self {
        Self {
            store,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Sets how many of the most recent messages are fetched.
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Fetches the newest `history_limit` messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store read fails.
    pub async fn fetch(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        let id = conversation_id.clone();
        let query = Query::matching(move |m: &Message| m.conversation_id == id)
            .order_by(|m| m.timestamp, Direction::Descending)
            .limit(self.history_limit);
        let mut newest_first = self.store.filter::<Message>(query).await?;
        newest_first.reverse();
        Ok(newest_first)
    }

    /// Returns the view to show for `conversation_id` given the caller's
    /// current `local` view.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store read fails. The caller keeps its
    /// view in that case.
    pub async fn reconcile(
        &self,
        conversation_id: &ConversationId,
        local: &MessageView,
    ) -> Result<MessageView, StoreError> {
        let authoritative = self.fetch(conversation_id).await?;
        let merged = merge_view(local, authoritative, &[]);
        tracing::trace!(%conversation_id, outcome = ?merged.outcome, "reconciled");
        Ok(merged.view)
    }
}
