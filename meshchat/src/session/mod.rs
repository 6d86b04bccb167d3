//! Client session: the operations a chat UI invokes.
//!
//! [`Session`] owns the delivery engine and the reconciler and exposes
//! profile, contact, and conversation management on top of the store.
//! Opening a conversation yields a [`ChatView`] that carries the
//! optimistic send/delete protocol for that conversation.
//!
//! Conversation uniqueness per contact is not enforced by the store. It is
//! kept by find-or-create plus a cleanup pass that collapses duplicates to
//! the oldest record.

mod chat;

use std::sync::Arc;

use meshchat_proto::contact::{
    Contact, ContactPatch, NewContact, NewProfile, Profile, ProfilePatch,
};
use meshchat_proto::conversation::{Conversation, ConversationPatch, NewConversation};
use meshchat_proto::ids::{ContactId, ConversationId, Fingerprint, ProfileId};
use meshchat_proto::message::ValidationError;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::delivery::{DeliveryEngine, DeliveryEvent, DeliveryTimings, SendError};
use crate::ids::IdGenerator;
use crate::reconcile::{DEFAULT_HISTORY_LIMIT, Reconciler};
use crate::store::{Direction, EntityStore, Query, StoreError};

pub use chat::{ChatView, MIN_POLL_INTERVAL};

/// Errors surfaced to the caller of a session operation.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The request was rejected before touching the store.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The message could not be stored.
    #[error("send failed: {0}")]
    SendFailed(#[source] StoreError),

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SendError> for SessionError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Validation(e) => Self::Validation(e),
            SendError::SendFailed(e) => Self::SendFailed(e),
            SendError::Store(e) => Self::Store(e),
        }
    }
}

/// Tunables for a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lifecycle step delays.
    pub timings: DeliveryTimings,
    /// Most recent messages loaded into a chat view.
    pub history_limit: usize,
    /// Capacity of the delivery event channel.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timings: DeliveryTimings::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            event_buffer: 64,
        }
    }
}

/// A conversation joined with its contact, for list display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// The conversation record.
    #[serde(flatten)]
    pub conversation: Conversation,
    /// The contact, if it still exists.
    pub contact: Option<Contact>,
}

/// Entry point for a chat client.
pub struct Session<S> {
    store: Arc<S>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    engine: DeliveryEngine<S>,
    reconciler: Arc<Reconciler<S>>,
    active_profile: Mutex<Option<ProfileId>>,
}

impl<S: EntityStore + 'static> Session<S> {
    /// Creates a session over `store`.
    ///
    /// Returns the session and the receiver for delivery lifecycle events.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        config: &SessionConfig,
    ) -> (Self, mpsc::Receiver<DeliveryEvent>) {
        let (engine, events) = DeliveryEngine::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.timings,
            config.event_buffer,
        );
        let reconciler = Reconciler::new(Arc::clone(&store)).with_history_limit(config.history_limit);
        let session = Self {
            store,
            ids,
            clock,
            engine,
            reconciler: Arc::new(reconciler),
            active_profile: Mutex::new(None),
        };
        (session, events)
    }

    /// The delivery engine backing this session.
    pub const fn engine(&self) -> &DeliveryEngine<S> {
        &self.engine
    }

    /// The reconciler backing this session.
    pub fn reconciler(&self) -> &Reconciler<S> {
        &self.reconciler
    }

    /// Aborts all running delivery lifecycles.
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }

    // -- Profiles ---------------------------------------------------------

    /// Creates the local user's profile and makes it active.
    ///
    /// A blank display name falls back to the username; a missing
    /// fingerprint is generated.
    ///
    /// # Errors
    ///
    /// [`ValidationError::EmptyUsername`] or
    /// [`ValidationError::DuplicateUsername`], or a store failure.
    pub async fn create_profile(
        &self,
        username: &str,
        display_name: Option<&str>,
        fingerprint: Option<Fingerprint>,
    ) -> Result<Profile, SessionError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ValidationError::EmptyUsername.into());
        }
        let existing = self.store.list::<Profile>().await?;
        if existing.iter().any(|p| p.username == username) {
            return Err(ValidationError::DuplicateUsername(username.to_string()).into());
        }

        let display_name = display_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(username);
        let fingerprint = fingerprint
            .filter(|fp| !fp.is_empty())
            .unwrap_or_else(|| self.ids.fingerprint());
        let profile = self
            .store
            .create::<Profile>(NewProfile {
                username: username.to_string(),
                display_name: display_name.to_string(),
                fingerprint,
            })
            .await?;

        *self.active_profile.lock() = Some(profile.id.clone());
        tracing::info!(profile_id = %profile.id, fingerprint = %profile.fingerprint, "profile created");
        Ok(profile)
    }

    /// Makes an existing profile active by username.
    ///
    /// # Errors
    ///
    /// [`ValidationError::ProfileNotFound`] if no profile has that
    /// username, or a store failure.
    pub async fn select_profile(&self, username: &str) -> Result<Profile, SessionError> {
        let username = username.trim().trim_start_matches('@').to_string();
        let wanted = username.clone();
        let profile = self
            .store
            .filter(Query::matching(move |p: &Profile| p.username == wanted).limit(1))
            .await?
            .pop()
            .ok_or(ValidationError::ProfileNotFound(username))?;
        *self.active_profile.lock() = Some(profile.id.clone());
        Ok(profile)
    }

    /// The active profile, if one was created or selected and still exists.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] if the lookup fails.
    pub async fn active_profile(&self) -> Result<Option<Profile>, SessionError> {
        let Some(id) = self.active_profile.lock().clone() else {
            return Ok(None);
        };
        Ok(self.store.get::<Profile>(&id).await?)
    }

    /// Renames the active profile.
    ///
    /// # Errors
    ///
    /// [`ValidationError::EmptyUsername`] for a blank name,
    /// [`ValidationError::ProfileNotFound`] if no profile is active or it was
    /// removed, or a store failure.
    pub async fn update_profile(&self, display_name: &str) -> Result<Profile, SessionError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(ValidationError::EmptyUsername.into());
        }
        let Some(id) = self.active_profile.lock().clone() else {
            return Err(ValidationError::ProfileNotFound("(none active)".to_string()).into());
        };
        let patch = ProfilePatch {
            display_name: Some(display_name.to_string()),
        };
        self.store
            .update::<Profile>(&id, patch)
            .await?
            .ok_or_else(|| ValidationError::ProfileNotFound(id.to_string()).into())
    }

    /// Looks up a profile by fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] if the lookup fails.
    pub async fn profile_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Profile>, SessionError> {
        let fingerprint = fingerprint.clone();
        let mut found = self
            .store
            .filter(Query::matching(move |p: &Profile| p.fingerprint == fingerprint).limit(1))
            .await?;
        Ok(found.pop())
    }

    // -- Contacts ---------------------------------------------------------

    /// Adds a contact.
    ///
    /// # Errors
    ///
    /// [`ValidationError::EmptyUsername`] for a blank username,
    /// [`ValidationError::DuplicateContact`] if the username or fingerprint
    /// is taken, or a store failure.
    pub async fn add_contact(&self, draft: NewContact) -> Result<Contact, SessionError> {
        if draft.username.trim().is_empty() {
            return Err(ValidationError::EmptyUsername.into());
        }
        if draft.fingerprint.is_empty() {
            return Err(ValidationError::MissingCounterpart.into());
        }
        let existing = self.store.list::<Contact>().await?;
        if let Some(dup) = existing
            .iter()
            .find(|c| c.username == draft.username || c.fingerprint == draft.fingerprint)
        {
            return Err(ValidationError::DuplicateContact(dup.username.clone()).into());
        }
        let contact = self.store.create::<Contact>(draft).await?;
        tracing::info!(contact_id = %contact.id, username = %contact.username, "contact added");
        Ok(contact)
    }

    /// Every contact, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] if the read fails.
    pub async fn contacts(&self) -> Result<Vec<Contact>, SessionError> {
        Ok(self.store.list::<Contact>().await?)
    }

    /// Blocks or unblocks a contact.
    ///
    /// # Errors
    ///
    /// [`ValidationError::ContactNotFound`] if the contact does not exist,
    /// or a store failure.
    pub async fn set_blocked(&self, id: &ContactId, blocked: bool) -> Result<Contact, SessionError> {
        let patch = ContactPatch {
            blocked: Some(blocked),
            ..ContactPatch::default()
        };
        self.store
            .update::<Contact>(id, patch)
            .await?
            .ok_or_else(|| ValidationError::ContactNotFound(id.to_string()).into())
    }

    /// Deletes a contact. Its conversations are left in place.
    ///
    /// Returns `false` if the contact did not exist.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] if the delete fails.
    pub async fn delete_contact(&self, id: &ContactId) -> Result<bool, SessionError> {
        Ok(self.store.delete::<Contact>(id).await?)
    }

    // -- Conversations ----------------------------------------------------

    /// Conversations joined with their contacts, newest activity first.
    ///
    /// With a non-blank `search`, only conversations whose contact matches
    /// it by display name or username are returned.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] if a read fails.
    pub async fn conversations(
        &self,
        search: Option<&str>,
    ) -> Result<Vec<ConversationSummary>, SessionError> {
        let conversations = self
            .store
            .filter(Query::<Conversation>::all().order_by(
                |c| c.last_message_time,
                Direction::Descending,
            ))
            .await?;
        let contacts = self.store.list::<Contact>().await?;
        let needle = search.map(str::trim).filter(|s| !s.is_empty());

        Ok(conversations
            .into_iter()
            .map(|conversation| {
                let contact = contacts
                    .iter()
                    .find(|c| c.id == conversation.contact_id)
                    .cloned();
                ConversationSummary {
                    conversation,
                    contact,
                }
            })
            .filter(|summary| {
                needle.is_none_or(|needle| {
                    summary
                        .contact
                        .as_ref()
                        .is_some_and(|c| c.matches_search(needle))
                })
            })
            .collect())
    }

    /// Opens the conversation with a contact, creating it if needed.
    ///
    /// Resets the unread counter and loads the most recent history.
    ///
    /// # Errors
    ///
    /// [`ValidationError::ContactNotFound`] if the contact does not exist,
    /// or a store failure.
    pub async fn open_chat(&self, contact_id: &ContactId) -> Result<Arc<ChatView<S>>, SessionError> {
        let contact = self
            .store
            .get::<Contact>(contact_id)
            .await?
            .ok_or_else(|| ValidationError::ContactNotFound(contact_id.to_string()))?;

        let mut conversation = self.find_or_create_conversation(&contact.id).await?;
        if conversation.unread_count > 0
            && let Some(read) = self
                .store
                .update::<Conversation>(&conversation.id, ConversationPatch::mark_read())
                .await?
        {
            conversation = read;
        }

        let history = self.reconciler.fetch(&conversation.id).await?;
        tracing::debug!(
            conversation_id = %conversation.id,
            messages = history.len(),
            "chat opened"
        );
        Ok(Arc::new(ChatView::new(
            conversation,
            contact.fingerprint,
            Arc::clone(&self.store),
            self.engine.clone(),
            Arc::clone(&self.reconciler),
            Arc::clone(&self.clock),
            history,
        )))
    }

    /// Deletes a conversation, removing it from `listing` first.
    ///
    /// Messages of the conversation are not touched. If the store delete
    /// fails, `listing` is re-fetched so the conversation reappears.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] if the delete fails.
    pub async fn delete_conversation(
        &self,
        id: &ConversationId,
        listing: &mut Vec<ConversationSummary>,
    ) -> Result<(), SessionError> {
        listing.retain(|summary| summary.conversation.id != *id);
        match self.store.delete::<Conversation>(id).await {
            Ok(found) => {
                tracing::info!(conversation_id = %id, found, "conversation deleted");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(conversation_id = %id, error = %err, "delete failed, restoring list");
                match self.conversations(None).await {
                    Ok(fresh) => *listing = fresh,
                    Err(refresh_err) => {
                        tracing::warn!(error = %refresh_err, "restore after failed delete failed");
                    }
                }
                Err(err.into())
            }
        }
    }

    async fn find_or_create_conversation(
        &self,
        contact_id: &ContactId,
    ) -> Result<Conversation, SessionError> {
        if let Some(existing) = self.conversations_with(contact_id).await?.into_iter().next() {
            return Ok(existing);
        }

        let created = self
            .store
            .create::<Conversation>(NewConversation {
                contact_id: contact_id.clone(),
                last_message_time: Some(self.clock.now()),
            })
            .await?;

        // Another opener may have raced us; everyone converges on the oldest
        // record, even if it is not the one this call created.
        let mut survivors = self.conversations_with(contact_id).await?.into_iter();
        let Some(keeper) = survivors.next() else {
            return Ok(created);
        };
        for duplicate in survivors {
            tracing::debug!(
                conversation_id = %duplicate.id,
                kept = %keeper.id,
                "removing duplicate conversation"
            );
            self.store.delete::<Conversation>(&duplicate.id).await?;
        }
        Ok(keeper)
    }

    async fn conversations_with(
        &self,
        contact_id: &ContactId,
    ) -> Result<Vec<Conversation>, StoreError> {
        let contact_id = contact_id.clone();
        self.store
            .filter(Query::matching(move |c: &Conversation| {
                c.contact_id == contact_id
            }))
            .await
    }
}
