//! Delivery engine: owns the status lifecycle of outbound messages.
//!
//! [`DeliveryEngine::submit`] stores a message as `sending`, points the
//! conversation summary at it, and spawns one driver task per message.
//! The driver walks the message through
//!
//! ```text
//! +T1          sending -> sent
//! +T1+T2       sent -> delivered
//! +T1+T2+T3    simulated peer reply
//! ```
//!
//! Drivers are tracked by message id. Deleting a message or conversation
//! does not cancel its driver; each step re-reads the store and turns into
//! a no-op when its target is gone.

pub mod steps;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meshchat_proto::conversation::Conversation;
use meshchat_proto::ids::{ConversationId, Fingerprint, MessageId};
use meshchat_proto::message::{
    Endpoint, Message, MessageStatus, NewMessage, ValidationError, validate_text,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::store::{EntityStore, StoreError};

pub use steps::{DeliveryJob, DeliveryStep, SkipReason, StepOutcome, StepRunner, reply_text};

/// Delays between lifecycle steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTimings {
    /// Submission to `sent` (T1).
    pub sent_after: Duration,
    /// `sent` to `delivered` (T2).
    pub delivered_after: Duration,
    /// `delivered` to the simulated reply (T3).
    pub reply_after: Duration,
}

impl Default for DeliveryTimings {
    fn default() -> Self {
        Self {
            sent_after: Duration::from_millis(1_500),
            delivered_after: Duration::from_millis(2_000),
            reply_after: Duration::from_millis(2_000),
        }
    }
}

/// Errors returned by [`DeliveryEngine::submit`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The request was rejected before touching the store.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The message could not be appended; nothing was scheduled.
    #[error("send failed: {0}")]
    SendFailed(#[source] StoreError),

    /// A read needed to validate the request failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lifecycle notifications, emitted best effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// A message reached a new status.
    StatusChanged {
        /// The message.
        message_id: MessageId,
        /// Its conversation.
        conversation_id: ConversationId,
        /// The status it reached.
        status: MessageStatus,
    },
    /// The simulated peer replied.
    ReplyReceived {
        /// The conversation the reply landed in.
        conversation_id: ConversationId,
        /// The stored reply.
        reply: Message,
    },
}

type InFlight = Arc<Mutex<HashMap<MessageId, JoinHandle<()>>>>;

/// Submits outbound messages and drives their lifecycle in the background.
pub struct DeliveryEngine<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    runner: Arc<StepRunner<S>>,
    in_flight: InFlight,
    events: mpsc::Sender<DeliveryEvent>,
}

impl<S> Clone for DeliveryEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            runner: Arc::clone(&self.runner),
            in_flight: Arc::clone(&self.in_flight),
            events: self.events.clone(),
        }
    }
}

impl<S: EntityStore + 'static> DeliveryEngine<S> {
    /// Creates an engine over `store`.
    ///
    /// Returns the engine and a receiver for [`DeliveryEvent`]s. Events
    /// are dropped when the receiver falls `event_buffer` behind.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        timings: DeliveryTimings,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<DeliveryEvent>) {
        let (tx, rx) = mpsc::channel(event_buffer.max(1));
        let runner = StepRunner::new(Arc::clone(&store), Arc::clone(&clock), timings, tx.clone());
        let engine = Self {
            store,
            clock,
            runner: Arc::new(runner),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            events: tx,
        };
        (engine, rx)
    }

    /// Stores a new outbound message and schedules its lifecycle.
    ///
    /// The returned message has status `sending`. The conversation summary
    /// already points at it when this returns.
    ///
    /// # Errors
    ///
    /// - [`SendError::Validation`] for blank or oversized text, a missing
    ///   counterpart, or an unknown conversation. Nothing is written.
    /// - [`SendError::SendFailed`] if the append fails. Nothing is scheduled.
    /// - [`SendError::Store`] if the conversation lookup fails.
    pub async fn submit(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        counterpart: &Fingerprint,
    ) -> Result<Message, SendError> {
        let text = validate_text(text)?;
        if counterpart.is_empty() {
            return Err(ValidationError::MissingCounterpart.into());
        }
        let conversation = self
            .store
            .get::<Conversation>(conversation_id)
            .await?
            .ok_or_else(|| ValidationError::ConversationNotFound(conversation_id.clone()))?;

        let draft = NewMessage {
            conversation_id: conversation.id,
            text: text.to_string(),
            from: Endpoint::Me,
            to: Endpoint::Peer(counterpart.clone()),
            status: MessageStatus::Sending,
            timestamp: self.clock.now(),
        };
        let message = self
            .store
            .create::<Message>(draft)
            .await
            .map_err(SendError::SendFailed)?;
        let started = Instant::now();

        if let Err(err) = steps::refresh_summary(&*self.store, &message, false).await {
            tracing::warn!(
                conversation_id = %message.conversation_id,
                error = %err,
                "summary update after send failed"
            );
        }
        let _ = self.events.try_send(DeliveryEvent::StatusChanged {
            message_id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            status: MessageStatus::Sending,
        });

        self.schedule(DeliveryJob {
            message_id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            text: message.text.clone(),
            counterpart: counterpart.clone(),
            started,
        });
        tracing::info!(
            message_id = %message.id,
            conversation_id = %message.conversation_id,
            "message submitted"
        );
        Ok(message)
    }

    /// Number of messages whose lifecycle is still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Aborts every running lifecycle. Messages keep their current status.
    pub fn shutdown(&self) {
        let drained: Vec<(MessageId, JoinHandle<()>)> = self.in_flight.lock().drain().collect();
        for (message_id, handle) in drained {
            tracing::debug!(%message_id, "aborting delivery");
            handle.abort();
        }
    }

    fn schedule(&self, job: DeliveryJob) {
        let runner = Arc::clone(&self.runner);
        let registry = Arc::clone(&self.in_flight);
        let message_id = job.message_id.clone();

        // Held across the spawn: the task's removal must not precede its insertion.
        let mut in_flight = self.in_flight.lock();
        let handle = tokio::spawn(async move {
            runner.drive(&job).await;
            registry.lock().remove(&job.message_id);
        });
        in_flight.insert(message_id, handle);
    }
}
