//! Idempotent step functions that drive one message through its lifecycle.
//!
//! Every step re-reads the current state before acting. A message or
//! conversation deleted in the meantime turns the step into a no-op, and a
//! status that has already moved on is never walked back.

use std::sync::Arc;
use std::time::Duration;

use meshchat_proto::conversation::{Conversation, ConversationPatch};
use meshchat_proto::ids::{ConversationId, Fingerprint, MessageId};
use meshchat_proto::message::{Endpoint, Message, MessagePatch, MessageStatus, NewMessage};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{DeliveryEvent, DeliveryTimings};
use crate::clock::Clock;
use crate::store::{EntityStore, StoreError};

/// Text of the simulated peer reply to `original`.
#[must_use]
pub fn reply_text(original: &str) -> String {
    format!("Meow! I received: \"{original}\"")
}

/// One scheduled action in a message's lifecycle, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStep {
    /// `sending -> sent`.
    MarkSent,
    /// `sent -> delivered`.
    MarkDelivered,
    /// Create the simulated inbound reply.
    SynthesizeReply,
}

impl DeliveryStep {
    /// Every step, in the order it runs.
    pub const PLAN: [Self; 3] = [Self::MarkSent, Self::MarkDelivered, Self::SynthesizeReply];

    /// Delay from submission at which this step fires.
    #[must_use]
    pub fn offset(self, timings: &DeliveryTimings) -> Duration {
        match self {
            Self::MarkSent => timings.sent_after,
            Self::MarkDelivered => timings.sent_after + timings.delivered_after,
            Self::SynthesizeReply => {
                timings.sent_after + timings.delivered_after + timings.reply_after
            }
        }
    }
}

/// Why a step did nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The message was deleted before the step fired.
    MessageGone,
    /// The owning conversation was deleted before the step fired.
    ConversationGone,
    /// The stored status does not allow this transition.
    NotAdvanceable(MessageStatus),
    /// The reply could not be stored and was dropped.
    ReplyDropped,
}

/// Result of running one [`DeliveryStep`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step changed the store.
    Applied,
    /// The step was a benign no-op.
    Skipped(SkipReason),
    /// The store failed mid-transition; the lifecycle ends here.
    Aborted(StoreError),
}

/// Everything a driver task needs to know about the message it drives.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    /// The outbound message.
    pub message_id: MessageId,
    /// Its conversation.
    pub conversation_id: ConversationId,
    /// Its text, echoed by the reply.
    pub text: String,
    /// The peer that replies.
    pub counterpart: Fingerprint,
    /// Submission instant all step offsets are measured from.
    pub started: Instant,
}

/// Points the conversation summary at `message` when it is at least as new
/// as the summary last read, and optionally bumps the unread counter.
///
/// The read and the write are separate store calls, so a newer summary
/// written in between can still be overwritten. The timestamp check only
/// narrows that window.
///
/// Returns `Ok(false)` when the conversation is gone or nothing changed.
pub(crate) async fn refresh_summary<S: EntityStore>(
    store: &S,
    message: &Message,
    count_unread: bool,
) -> Result<bool, StoreError> {
    let Some(conversation) = store
        .get::<Conversation>(&message.conversation_id)
        .await?
    else {
        tracing::debug!(
            conversation_id = %message.conversation_id,
            "conversation gone, summary not updated"
        );
        return Ok(false);
    };

    let mut patch = ConversationPatch::default();
    if conversation.accepts_summary_at(message.timestamp) {
        patch = ConversationPatch::summary(message.text.clone(), message.timestamp);
    } else {
        tracing::debug!(
            conversation_id = %conversation.id,
            message_id = %message.id,
            "newer summary already present"
        );
    }
    if count_unread {
        patch = patch.with_unread(conversation.unread_count.saturating_add(1));
    }
    if patch.is_empty() {
        return Ok(false);
    }

    Ok(store
        .update::<Conversation>(&conversation.id, patch)
        .await?
        .is_some())
}

/// Runs delivery steps against a store and reports what happened.
pub struct StepRunner<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    timings: DeliveryTimings,
    events: mpsc::Sender<DeliveryEvent>,
}

impl<S: EntityStore> StepRunner<S> {
    pub(crate) fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        timings: DeliveryTimings,
        events: mpsc::Sender<DeliveryEvent>,
    ) -> Self {
        Self {
            store,
            clock,
            timings,
            events,
        }
    }

    /// Runs the whole plan for `job`, sleeping until each step is due.
    pub async fn drive(&self, job: &DeliveryJob) {
        for step in DeliveryStep::PLAN {
            tokio::time::sleep_until(job.started + step.offset(&self.timings)).await;
            match self.run(step, job).await {
                StepOutcome::Applied => {
                    tracing::debug!(message_id = %job.message_id, ?step, "step applied");
                }
                StepOutcome::Skipped(reason) => {
                    tracing::debug!(
                        message_id = %job.message_id,
                        ?step,
                        ?reason,
                        "step skipped"
                    );
                }
                StepOutcome::Aborted(err) => {
                    tracing::warn!(
                        message_id = %job.message_id,
                        ?step,
                        error = %err,
                        "store failed during delivery, marking message failed"
                    );
                    self.mark_failed(job).await;
                    return;
                }
            }
        }
        tracing::info!(message_id = %job.message_id, "delivery lifecycle complete");
    }

    /// Runs a single step now.
    pub async fn run(&self, step: DeliveryStep, job: &DeliveryJob) -> StepOutcome {
        match step {
            DeliveryStep::MarkSent => self.advance(job, MessageStatus::Sent).await,
            DeliveryStep::MarkDelivered => self.advance(job, MessageStatus::Delivered).await,
            DeliveryStep::SynthesizeReply => self.synthesize_reply(job).await,
        }
    }

    async fn advance(&self, job: &DeliveryJob, next: MessageStatus) -> StepOutcome {
        let current = match self.store.get::<Message>(&job.message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => return StepOutcome::Skipped(SkipReason::MessageGone),
            Err(err) => return StepOutcome::Aborted(err),
        };
        if !current.status.can_advance_to(next) {
            return StepOutcome::Skipped(SkipReason::NotAdvanceable(current.status));
        }

        match self
            .store
            .update::<Message>(&job.message_id, MessagePatch::status(next))
            .await
        {
            Ok(Some(_)) => {
                self.emit(DeliveryEvent::StatusChanged {
                    message_id: job.message_id.clone(),
                    conversation_id: job.conversation_id.clone(),
                    status: next,
                });
                StepOutcome::Applied
            }
            Ok(None) => StepOutcome::Skipped(SkipReason::MessageGone),
            Err(err) => StepOutcome::Aborted(err),
        }
    }

    async fn synthesize_reply(&self, job: &DeliveryJob) -> StepOutcome {
        match self.store.get::<Conversation>(&job.conversation_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return StepOutcome::Skipped(SkipReason::ConversationGone),
            Err(err) => {
                tracing::warn!(
                    conversation_id = %job.conversation_id,
                    error = %err,
                    "could not check conversation, reply dropped"
                );
                return StepOutcome::Skipped(SkipReason::ReplyDropped);
            }
        }

        let draft = NewMessage {
            conversation_id: job.conversation_id.clone(),
            text: reply_text(&job.text),
            from: Endpoint::Peer(job.counterpart.clone()),
            to: Endpoint::Me,
            status: MessageStatus::Delivered,
            timestamp: self.clock.now(),
        };
        let reply = match self.store.create::<Message>(draft).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(
                    conversation_id = %job.conversation_id,
                    error = %err,
                    "reply could not be stored, dropped"
                );
                return StepOutcome::Skipped(SkipReason::ReplyDropped);
            }
        };

        if let Err(err) = refresh_summary(&*self.store, &reply, true).await {
            tracing::warn!(
                conversation_id = %job.conversation_id,
                error = %err,
                "summary update after reply failed"
            );
        }
        self.emit(DeliveryEvent::ReplyReceived {
            conversation_id: job.conversation_id.clone(),
            reply,
        });
        StepOutcome::Applied
    }

    /// Best effort: moves the message to `failed` if it still can.
    async fn mark_failed(&self, job: &DeliveryJob) {
        let status = match self.store.get::<Message>(&job.message_id).await {
            Ok(Some(message)) => message.status,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(message_id = %job.message_id, error = %err, "could not mark failed");
                return;
            }
        };
        if !status.can_advance_to(MessageStatus::Failed) {
            return;
        }
        match self
            .store
            .update::<Message>(&job.message_id, MessagePatch::status(MessageStatus::Failed))
            .await
        {
            Ok(Some(_)) => self.emit(DeliveryEvent::StatusChanged {
                message_id: job.message_id.clone(),
                conversation_id: job.conversation_id.clone(),
                status: MessageStatus::Failed,
            }),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(message_id = %job.message_id, error = %err, "could not mark failed");
            }
        }
    }

    fn emit(&self, event: DeliveryEvent) {
        // Best effort: a full or closed channel drops the event.
        let _ = self.events.try_send(event);
    }
}
