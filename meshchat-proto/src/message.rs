//! Message records and their delivery lifecycle.
//!
//! A [`Message`] is immutable after creation except for its
//! [`MessageStatus`], which only ever moves forward:
//!
//! ```text
//! sending -> sent -> delivered
//!    \         \
//!     `---------`--> failed   (terminal)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, Fingerprint, MessageId, Timestamp};

/// Maximum allowed message text size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Sentinel used on the wire for the local user.
pub const LOCAL_ENDPOINT: &str = "me";

/// One end of a message: the local user or a remote identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Endpoint {
    /// The local user (serialized as `"me"`).
    Me,
    /// A remote peer identified by its fingerprint.
    Peer(Fingerprint),
}

impl Endpoint {
    /// Returns `true` for the local user.
    #[must_use]
    pub const fn is_me(&self) -> bool {
        matches!(self, Self::Me)
    }
}

impl From<String> for Endpoint {
    fn from(raw: String) -> Self {
        if raw == LOCAL_ENDPOINT {
            Self::Me
        } else {
            Self::Peer(Fingerprint::new(raw))
        }
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        match endpoint {
            Endpoint::Me => LOCAL_ENDPOINT.to_string(),
            Endpoint::Peer(fingerprint) => fingerprint.as_str().to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Me => f.write_str(LOCAL_ENDPOINT),
            Self::Peer(fingerprint) => write!(f, "{fingerprint}"),
        }
    }
}

/// Delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Stored locally, not yet handed to the network.
    Sending,
    /// Handed to the network, awaiting delivery confirmation.
    Sent,
    /// Delivery confirmed by the recipient.
    Delivered,
    /// Delivery gave up. Terminal.
    Failed,
}

impl MessageStatus {
    /// Position of this status along the forward walk.
    const fn rank(self) -> u8 {
        match self {
            Self::Sending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Failed => 3,
        }
    }

    /// Returns `true` if no transition can leave this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// Returns `true` if moving from `self` to `next` is a legal single step.
    ///
    /// Legal steps are `sending -> sent`, `sent -> delivered`, and any
    /// non-terminal status to `failed`. Skipping a state, staying put, or
    /// moving backwards is rejected.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed => true,
            Self::Sending => false,
            Self::Sent | Self::Delivered => next.rank() == self.rank() + 1,
        }
    }

    /// Display symbol for a status indicator.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Sending => "\u{22ef}",
            Self::Sent => "\u{2713}",
            Self::Delivered => "\u{2713}\u{2713}",
            Self::Failed => "\u{2717}",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A chat message as held by the entity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier, immutable.
    pub id: MessageId,
    /// Owning conversation, immutable.
    pub conversation_id: ConversationId,
    /// Message body, immutable.
    pub text: String,
    /// Author of the message.
    pub from: Endpoint,
    /// Recipient of the message.
    pub to: Endpoint,
    /// Current delivery status.
    pub status: MessageStatus,
    /// Creation time, used for ordering within a conversation.
    pub timestamp: Timestamp,
}

impl Message {
    /// Returns `true` if this is an unconfirmed optimistic placeholder.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.id.is_placeholder()
    }

    /// Returns `true` if the local user wrote this message.
    #[must_use]
    pub const fn is_outbound(&self) -> bool {
        self.from.is_me()
    }
}

/// Fields of a message before the store assigns it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Message body.
    pub text: String,
    /// Author.
    pub from: Endpoint,
    /// Recipient.
    pub to: Endpoint,
    /// Initial status.
    pub status: MessageStatus,
    /// Creation time.
    pub timestamp: Timestamp,
}

impl NewMessage {
    /// Finalizes the draft with an assigned id.
    #[must_use]
    pub fn with_id(self, id: MessageId) -> Message {
        Message {
            id,
            conversation_id: self.conversation_id,
            text: self.text,
            from: self.from,
            to: self.to,
            status: self.status,
            timestamp: self.timestamp,
        }
    }
}

/// Partial update for a message. Only the status is mutable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePatch {
    /// New delivery status, if changing.
    pub status: Option<MessageStatus>,
}

impl MessagePatch {
    /// Patch that sets the status.
    #[must_use]
    pub const fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
        }
    }

    /// Applies the patch to a message in place.
    pub fn apply(self, message: &mut Message) {
        if let Some(status) = self.status {
            message.status = status;
        }
    }
}

/// Error returned when a request is rejected before touching the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message text is empty or whitespace only.
    #[error("message text is empty")]
    EmptyText,
    /// Message text exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the text in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// No counterpart fingerprint was supplied.
    #[error("message has no recipient")]
    MissingCounterpart,
    /// The target conversation does not exist.
    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),
    /// The target contact does not exist.
    #[error("contact not found: {0}")]
    ContactNotFound(String),
    /// No profile has the given username.
    #[error("profile not found: {0}")]
    ProfileNotFound(String),
    /// A contact with the same username or fingerprint already exists.
    #[error("contact already exists: {0}")]
    DuplicateContact(String),
    /// A profile with the same username already exists.
    #[error("username already exists: {0}")]
    DuplicateUsername(String),
    /// A username was required but blank.
    #[error("username is empty")]
    EmptyUsername,
}

/// Validates outgoing message text and returns it trimmed.
///
/// # Errors
///
/// Returns [`ValidationError::EmptyText`] if the text is blank, or
/// [`ValidationError::TooLarge`] if it exceeds [`MAX_MESSAGE_SIZE`].
pub fn validate_text(text: &str) -> Result<&str, ValidationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyText);
    }
    let size = trimmed.len();
    if size > MAX_MESSAGE_SIZE {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(trimmed)
}
