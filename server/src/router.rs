//! Moves one inbound platform event through filtering, context assembly,
//! generation, delivery and recording.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::assignment::AssignmentManager;
use crate::context::ContextAssembler;
use crate::delivery::OutboundDelivery;
use crate::error::PipelineError;
use crate::idempotency::IdempotencyGuard;
use crate::keyed_lock::KeyedLocks;
use crate::platform::PlatformApi;
use crate::realtime::{BroadcastHub, RealtimeEvent};
use crate::reply::ReplyGenerator;
use crate::store::{ConversationStore, PageDirectory, ParticipantStore};
use crate::types::{now_iso, Channel, ConversationRecord, InboundEvent, PageConfig, ReplyAttempt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A reply was generated and delivered.
    Replied { delivery_id: String, wants_human: bool },
    /// Recorded and broadcast only; a human owns the conversation or the bot is stopped.
    RecordedOnly,
    /// An operator or a stop took over while the reply was being generated.
    /// The reply was discarded.
    TakenOver,
}

pub struct RouterDeps {
    pub guard: IdempotencyGuard,
    pub pages: Arc<dyn PageDirectory>,
    pub participants: Arc<dyn ParticipantStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub platform: Arc<dyn PlatformApi>,
    pub assembler: ContextAssembler,
    pub generator: ReplyGenerator,
    pub delivery: Arc<OutboundDelivery>,
    pub assignments: Arc<AssignmentManager>,
    pub hub: Arc<BroadcastHub>,
    /// Bounds admission: page lookup, sender filters, the duplicate check,
    /// profile and parent lookups and recording the inbound message.
    pub admission_timeout: Duration,
}

/// An event that passed every filter and whose inbound record is stored.
struct Admitted {
    event: InboundEvent,
    page: PageConfig,
    parent_text: Option<String>,
}

pub struct EventRouter {
    deps: RouterDeps,
    generation_locks: KeyedLocks,
}

impl EventRouter {
    pub fn new(deps: RouterDeps) -> Self {
        Self {
            deps,
            generation_locks: KeyedLocks::new(),
        }
    }

    /// Runs the event on its own task. Failures are logged, never retried.
    pub fn spawn(self: &Arc<Self>, event: InboundEvent) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let result = router.process(&event).await;
            log_outcome(&event, &result);
        })
    }

    /// Admission runs under one deadline. Once the inbound message is
    /// recorded, retrieval, the model and delivery are each bounded by their
    /// own timeouts, so a slow model still ends in the channel fallback.
    pub async fn process(&self, event: &InboundEvent) -> Result<Outcome, PipelineError> {
        let admitted = tokio::time::timeout(self.deps.admission_timeout, self.admit(event))
            .await
            .unwrap_or(Err(PipelineError::Timeout))?;
        self.respond(admitted).await
    }

    async fn admit(&self, event: &InboundEvent) -> Result<Admitted, PipelineError> {
        let deps = &self.deps;
        let Some(page) = deps.pages.page_by_platform_id(&event.page_id).await? else {
            return Err(PipelineError::UnknownPage(event.page_id.clone()));
        };

        self.filter_sender(event, &page).await?;
        if !deps.guard.accept(&event.event_id).await? {
            return Err(PipelineError::DuplicateEvent);
        }
        if !page.channels.enabled(event.channel) {
            return Err(PipelineError::ChannelDisabled(event.channel.as_str()));
        }

        let mut event = event.clone();
        if event.participant_name.trim().is_empty() {
            event.participant_name = self.lookup_display_name(&event, &page).await;
        }
        let parent_text = self.parent_comment_text(&event, &page).await;

        let inbound = ConversationRecord::inbound(&event);
        deps.conversations.append(&inbound).await?;
        deps.hub.broadcast(
            &page.tenant_id,
            RealtimeEvent::NewMessage,
            message_payload(&inbound, &event.participant_name),
        );

        Ok(Admitted {
            event,
            page,
            parent_text,
        })
    }

    async fn respond(&self, admitted: Admitted) -> Result<Outcome, PipelineError> {
        let deps = &self.deps;
        let Admitted {
            event,
            page,
            parent_text,
        } = admitted;

        let key = event.participant_key();
        let _generation = self.generation_locks.lock(&key.lock_key()).await;

        let state = deps.participants.load_or_create(&key).await?;
        if state.suppresses_bot() {
            debug!(
                event_id = %event.event_id,
                participant = %event.participant_id,
                page = %event.page_id,
                awaiting_human = state.awaiting_human,
                bot_stopped = state.bot_stopped,
                "bot suppressed, recorded only"
            );
            return Ok(Outcome::RecordedOnly);
        }
        let mut seen_version = state.version;

        let context = deps
            .assembler
            .assemble(&event, &page, parent_text.as_deref())
            .await;
        let reply = deps.generator.generate(&context, event.channel, &page).await;

        if reply.wants_human && event.channel == Channel::Message {
            match deps.assignments.request_handoff(&page, &key).await {
                Ok(transition) => seen_version = transition.state.version,
                Err(err) => warn!(
                    event_id = %event.event_id,
                    participant = %event.participant_id,
                    page = %event.page_id,
                    error = %err,
                    "failed to flag conversation for a human"
                ),
            }
        }

        let mut attempt = ReplyAttempt {
            event_id: event.event_id.clone(),
            participant_id: event.participant_id.clone(),
            page_id: event.page_id.clone(),
            channel: event.channel,
            delivered: false,
            delivery_id: None,
            wants_human: reply.wants_human,
            used_fallback: reply.used_fallback,
            error: reply.error.as_ref().map(ToString::to_string),
            created_at: now_iso(),
        };

        let sent = deps
            .assignments
            .run_as_bot(&key, seen_version, || {
                deps.delivery.deliver_reply(&event, &reply.text, &page)
            })
            .await?;
        let delivery_id = match sent {
            Some(Ok(delivery_id)) => delivery_id,
            Some(Err(err)) => {
                attempt.error = Some(err.to_string());
                self.record_attempt(&attempt).await;
                return Err(err.into());
            }
            None => {
                attempt.error = Some("conversation taken over before delivery".to_string());
                self.record_attempt(&attempt).await;
                return Ok(Outcome::TakenOver);
            }
        };

        let outbound = ConversationRecord::bot_reply(&event, &reply.text, &delivery_id);
        deps.conversations.append(&outbound).await?;
        attempt.delivered = true;
        attempt.delivery_id = Some(delivery_id.clone());
        self.record_attempt(&attempt).await;
        deps.hub.broadcast(
            &page.tenant_id,
            RealtimeEvent::NewMessage,
            message_payload(&outbound, &event.participant_name),
        );

        Ok(Outcome::Replied {
            delivery_id,
            wants_human: reply.wants_human,
        })
    }

    async fn filter_sender(
        &self,
        event: &InboundEvent,
        page: &PageConfig,
    ) -> Result<(), PipelineError> {
        if event.participant_id == page.page_id {
            return Err(PipelineError::FilteredSender("page_echo"));
        }
        let name = event.participant_name.trim();
        if !name.is_empty() && name == page.page_name.trim() {
            return Err(PipelineError::FilteredSender("page_name"));
        }
        if page.access_token.trim().is_empty() {
            return Ok(());
        }
        match self
            .deps
            .platform
            .is_author_of_page(&event.event_id, &page.page_id, &page.access_token)
            .await
        {
            Ok(true) => Err(PipelineError::FilteredSender("page_author")),
            Ok(false) => Ok(()),
            Err(err) => {
                warn!(
                    event_id = %event.event_id,
                    page = %event.page_id,
                    error = %err,
                    "author check failed, continuing"
                );
                Ok(())
            }
        }
    }

    async fn lookup_display_name(&self, event: &InboundEvent, page: &PageConfig) -> String {
        if page.access_token.trim().is_empty() {
            return String::new();
        }
        match self
            .deps
            .platform
            .get_user_profile(&event.participant_id, &page.access_token)
            .await
        {
            Ok(profile) => profile.name,
            Err(err) => {
                warn!(
                    event_id = %event.event_id,
                    participant = %event.participant_id,
                    error = %err,
                    "profile lookup failed"
                );
                String::new()
            }
        }
    }

    async fn parent_comment_text(&self, event: &InboundEvent, page: &PageConfig) -> Option<String> {
        if !event.is_comment_reply() || page.access_token.trim().is_empty() {
            return None;
        }
        let parent_id = event.parent_id.as_deref()?;
        match self
            .deps
            .platform
            .get_comment_text(parent_id, &page.access_token)
            .await
        {
            Ok(text) if !text.is_empty() => Some(text),
            Ok(_) => None,
            Err(err) => {
                warn!(
                    event_id = %event.event_id,
                    parent = %parent_id,
                    error = %err,
                    "parent comment unavailable"
                );
                None
            }
        }
    }

    async fn record_attempt(&self, attempt: &ReplyAttempt) {
        if let Err(err) = self.deps.conversations.record_reply_attempt(attempt).await {
            warn!(event_id = %attempt.event_id, error = %err, "failed to record reply attempt");
        }
    }
}

fn message_payload(record: &ConversationRecord, participant_name: &str) -> Value {
    let mut payload = serde_json::to_value(record).unwrap_or(Value::Null);
    if let Some(object) = payload.as_object_mut() {
        object.insert(
            "participantName".to_string(),
            Value::String(participant_name.to_string()),
        );
    }
    payload
}

fn log_outcome(event: &InboundEvent, result: &Result<Outcome, PipelineError>) {
    match result {
        Ok(Outcome::Replied {
            delivery_id,
            wants_human,
        }) => info!(
            event_id = %event.event_id,
            participant = %event.participant_id,
            page = %event.page_id,
            delivery_id = %delivery_id,
            wants_human,
            "event replied"
        ),
        Ok(Outcome::RecordedOnly) => info!(
            event_id = %event.event_id,
            participant = %event.participant_id,
            page = %event.page_id,
            "event recorded without reply"
        ),
        Ok(Outcome::TakenOver) => info!(
            event_id = %event.event_id,
            participant = %event.participant_id,
            page = %event.page_id,
            "reply discarded, conversation taken over"
        ),
        Err(err @ (PipelineError::DuplicateEvent | PipelineError::FilteredSender(_))) => debug!(
            event_id = %event.event_id,
            participant = %event.participant_id,
            page = %event.page_id,
            reason = %err,
            "event dropped"
        ),
        Err(err) => warn!(
            event_id = %event.event_id,
            participant = %event.participant_id,
            page = %event.page_id,
            error = %err,
            "event failed"
        ),
    }
}
