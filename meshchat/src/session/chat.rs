//! One open conversation: optimistic sends, deletes, and polling.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use meshchat_proto::conversation::Conversation;
use meshchat_proto::ids::{ConversationId, Fingerprint, MessageId};
use meshchat_proto::message::{Endpoint, Message, MessageStatus, validate_text};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::SessionError;
use crate::clock::Clock;
use crate::delivery::DeliveryEngine;
use crate::reconcile::{MergeOutcome, MessageView, Reconciler, merge_view};
use crate::store::{EntityStore, StoreError};

/// Shortest interval [`ChatView::spawn_poller`] will poll at.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// The caller's live view of one conversation.
///
/// The view is published through a [`watch`] channel. Subscribers are only
/// woken when the view is actually replaced, never for a poll that found
/// nothing new.
///
/// Lock order: the watch value first, then `pending`.
pub struct ChatView<S> {
    conversation: Conversation,
    counterpart: Fingerprint,
    store: Arc<S>,
    engine: DeliveryEngine<S>,
    reconciler: Arc<Reconciler<S>>,
    clock: Arc<dyn Clock>,
    view: watch::Sender<MessageView>,
    pending: Mutex<Vec<Message>>,
    next_placeholder: AtomicU64,
}

impl<S: EntityStore + 'static> ChatView<S> {
    pub(crate) fn new(
        conversation: Conversation,
        counterpart: Fingerprint,
        store: Arc<S>,
        engine: DeliveryEngine<S>,
        reconciler: Arc<Reconciler<S>>,
        clock: Arc<dyn Clock>,
        initial: Vec<Message>,
    ) -> Self {
        let (view, _) = watch::channel(MessageView::from(initial));
        Self {
            conversation,
            counterpart,
            store,
            engine,
            reconciler,
            clock,
            view,
            pending: Mutex::new(Vec::new()),
            next_placeholder: AtomicU64::new(1),
        }
    }

    /// The conversation as it was when the chat was opened.
    pub const fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Identifier of the open conversation.
    pub const fn conversation_id(&self) -> &ConversationId {
        &self.conversation.id
    }

    /// Fingerprint of the contact on the other end.
    pub const fn counterpart(&self) -> &Fingerprint {
        &self.counterpart
    }

    /// The current view.
    #[must_use]
    pub fn snapshot(&self) -> MessageView {
        MessageView::clone(&self.view.borrow())
    }

    /// Subscribes to view replacements.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<MessageView> {
        self.view.subscribe()
    }

    /// Sends `text` with an optimistic placeholder.
    ///
    /// The placeholder shows up in the view immediately. On success the view
    /// is reconciled right away so the placeholder gives way to the stored
    /// message; on failure the placeholder is removed again and nothing is
    /// left behind.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Validation`] for blank or oversized text. The view
    ///   is not touched.
    /// - [`SessionError::SendFailed`] or [`SessionError::Store`] if the
    ///   store rejected the send.
    pub async fn send_and_track(&self, text: &str) -> Result<Message, SessionError> {
        let text = validate_text(text)?;
        let seq = self.next_placeholder.fetch_add(1, Ordering::Relaxed);
        let placeholder = Message {
            id: MessageId::placeholder(seq),
            conversation_id: self.conversation.id.clone(),
            text: text.to_string(),
            from: Endpoint::Me,
            to: Endpoint::Peer(self.counterpart.clone()),
            status: MessageStatus::Sending,
            timestamp: self.clock.now(),
        };
        let placeholder_id = placeholder.id.clone();

        self.view.send_modify(|view| {
            self.pending.lock().push(placeholder.clone());
            let mut next = view.to_vec();
            next.push(placeholder);
            *view = next.into();
        });

        match self
            .engine
            .submit(&self.conversation.id, text, &self.counterpart)
            .await
        {
            Ok(message) => {
                if let Err(err) = self.reconcile(Some(&placeholder_id)).await {
                    self.settle(&placeholder_id);
                    tracing::warn!(
                        conversation_id = %self.conversation.id,
                        error = %err,
                        "refresh after send failed, swapping placeholder locally"
                    );
                    self.replace_local(&placeholder_id, message.clone());
                }
                Ok(message)
            }
            Err(err) => {
                tracing::warn!(
                    conversation_id = %self.conversation.id,
                    error = %err,
                    "send failed, dropping placeholder"
                );
                self.settle(&placeholder_id);
                self.remove_local(&placeholder_id);
                Err(err.into())
            }
        }
    }

    /// Deletes a message, removing it from the view first.
    ///
    /// A placeholder only exists locally and is simply dropped. If the store
    /// delete fails, the view is re-fetched so the message reappears.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] if the store delete failed.
    pub async fn delete_message(&self, id: &MessageId) -> Result<(), SessionError> {
        if id.is_placeholder() {
            self.settle(id);
            self.remove_local(id);
            return Ok(());
        }

        self.remove_local(id);
        match self.store.delete::<Message>(id).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::debug!(message_id = %id, "message already gone");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(message_id = %id, error = %err, "delete failed, restoring view");
                if let Err(refresh_err) = self.refresh().await {
                    tracing::warn!(error = %refresh_err, "restore after failed delete failed");
                }
                Err(err.into())
            }
        }
    }

    /// Runs one reconciliation pass against the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the fetch fails. The view is unchanged.
    pub async fn refresh(&self) -> Result<MergeOutcome, StoreError> {
        self.reconcile(None).await
    }

    /// Fetches and merges, first settling `confirmed` under the same lock
    /// so no reader sees the placeholder and its stored copy together.
    async fn reconcile(&self, confirmed: Option<&MessageId>) -> Result<MergeOutcome, StoreError> {
        let authoritative = self.reconciler.fetch(&self.conversation.id).await?;
        let mut outcome = MergeOutcome::Kept;
        self.view.send_if_modified(|view| {
            let mut pending = self.pending.lock();
            if let Some(id) = confirmed {
                pending.retain(|m| m.id != *id);
            }
            let merged = merge_view(view, authoritative, &pending);
            outcome = merged.outcome;
            *view = merged.view;
            outcome.is_replaced()
        });
        if let MergeOutcome::Replaced(reason) = outcome {
            tracing::debug!(conversation_id = %self.conversation.id, ?reason, "view replaced");
        }
        Ok(outcome)
    }

    /// Spawns a task that calls [`refresh`](Self::refresh) every `interval`.
    ///
    /// Intervals shorter than [`MIN_POLL_INTERVAL`] are raised to it. Runs
    /// until the returned handle is aborted or the runtime shuts down.
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let chat = Arc::clone(self);
        let interval = interval.max(MIN_POLL_INTERVAL);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if let Err(err) = chat.refresh().await {
                    tracing::warn!(
                        conversation_id = %chat.conversation.id,
                        error = %err,
                        "poll failed"
                    );
                }
            }
        })
    }

    /// Number of sends still waiting for the store.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn settle(&self, placeholder: &MessageId) {
        self.pending.lock().retain(|m| m.id != *placeholder);
    }

    fn remove_local(&self, id: &MessageId) {
        self.view.send_if_modified(|view| {
            if !view.iter().any(|m| m.id == *id) {
                return false;
            }
            *view = view.iter().filter(|m| m.id != *id).cloned().collect();
            true
        });
    }

    fn replace_local(&self, id: &MessageId, message: Message) {
        self.view.send_if_modified(|view| {
            let Some(pos) = view.iter().position(|m| m.id == *id) else {
                return false;
            };
            let mut next = view.to_vec();
            next[pos] = message;
            *view = next.into();
            true
        });
    }
}
