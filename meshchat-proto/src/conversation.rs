//! Conversation records and their denormalized summary fields.

use serde::{Deserialize, Serialize};

use crate::ids::{ContactId, ConversationId, Timestamp};

/// A one-to-one conversation with a contact.
///
/// `last_message_text` and `last_message_time` cache the newest message so
/// that the conversation list never has to scan the message log. They may
/// briefly lag behind the log between a message write and the next summary
/// update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Unique identifier.
    pub id: ConversationId,
    /// The contact this conversation is with (lookup only).
    pub contact_id: ContactId,
    /// Text of the newest known message.
    pub last_message_text: Option<String>,
    /// Timestamp of the newest known message.
    pub last_message_time: Option<Timestamp>,
    /// Number of inbound messages not yet seen by the user.
    pub unread_count: u32,
}

impl Conversation {
    /// Returns `true` if a message stamped `at` is at least as new as the
    /// current summary, i.e. it may overwrite it.
    #[must_use]
    pub fn accepts_summary_at(&self, at: Timestamp) -> bool {
        self.last_message_time.is_none_or(|current| at >= current)
    }
}

/// Fields of a conversation before the store assigns it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    /// The contact this conversation is with.
    pub contact_id: ContactId,
    /// Initial summary timestamp (creation time sorts new chats to the top).
    pub last_message_time: Option<Timestamp>,
}

impl NewConversation {
    /// Finalizes the draft with an assigned id.
    #[must_use]
    pub fn with_id(self, id: ConversationId) -> Conversation {
        Conversation {
            id,
            contact_id: self.contact_id,
            last_message_text: None,
            last_message_time: self.last_message_time,
            unread_count: 0,
        }
    }
}

/// Partial update for a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationPatch {
    /// New summary text.
    pub last_message_text: Option<String>,
    /// New summary timestamp.
    pub last_message_time: Option<Timestamp>,
    /// New unread counter.
    pub unread_count: Option<u32>,
}

impl ConversationPatch {
    /// Patch that points the summary at a message.
    pub fn summary(text: impl Into<String>, at: Timestamp) -> Self {
        Self {
            last_message_text: Some(text.into()),
            last_message_time: Some(at),
            unread_count: None,
        }
    }

    /// Patch that resets the unread counter.
    #[must_use]
    pub const fn mark_read() -> Self {
        Self {
            last_message_text: None,
            last_message_time: None,
            unread_count: Some(0),
        }
    }

    /// Adds an unread counter value to this patch.
    #[must_use]
    pub fn with_unread(mut self, unread_count: u32) -> Self {
        self.unread_count = Some(unread_count);
        self
    }

    /// Returns `true` if applying the patch would change nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.last_message_text.is_none()
            && self.last_message_time.is_none()
            && self.unread_count.is_none()
    }

    /// Applies the patch to a conversation in place.
    pub fn apply(self, conversation: &mut Conversation) {
        if let Some(text) = self.last_message_text {
            conversation.last_message_text = Some(text);
        }
        if let Some(at) = self.last_message_time {
            conversation.last_message_time = Some(at);
        }
        if let Some(unread) = self.unread_count {
            conversation.unread_count = unread;
        }
    }
}
