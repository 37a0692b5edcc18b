//! Ownership of a participant conversation between the bot and operators.
//!
//! Every transition runs under a per-participant lock and is committed with a
//! version compare-and-set, so two server processes sharing one database
//! cannot overwrite each other's assignment.

use std::{future::Future, sync::Arc};

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::delivery::OutboundDelivery;
use crate::error::{AssignmentError, StoreError};
use crate::keyed_lock::KeyedLocks;
use crate::realtime::{BroadcastHub, RealtimeEvent};
use crate::store::{ConversationStore, PageDirectory, ParticipantStore};
use crate::types::{
    now_iso, ConversationRecord, OperatorIdentity, PageConfig, ParticipantKey, ParticipantState,
};

const CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct Transition {
    pub state: ParticipantState,
    /// False when the request matched the current state and nothing was written.
    pub changed: bool,
}

pub struct AssignmentManager {
    participants: Arc<dyn ParticipantStore>,
    conversations: Arc<dyn ConversationStore>,
    pages: Arc<dyn PageDirectory>,
    delivery: Arc<OutboundDelivery>,
    hub: Arc<BroadcastHub>,
    locks: KeyedLocks,
}

impl AssignmentManager {
    pub fn new(
        participants: Arc<dyn ParticipantStore>,
        conversations: Arc<dyn ConversationStore>,
        pages: Arc<dyn PageDirectory>,
        delivery: Arc<OutboundDelivery>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            participants,
            conversations,
            pages,
            delivery,
            hub,
            locks: KeyedLocks::new(),
        }
    }

    /// Looks up the page and, when `tenant_id` is given, checks it belongs to that tenant.
    pub async fn resolve_page(
        &self,
        page_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<PageConfig, AssignmentError> {
        let page = self
            .pages
            .page_by_platform_id(page_id)
            .await?
            .ok_or_else(|| AssignmentError::UnknownPage(page_id.to_string()))?;
        match tenant_id {
            Some(tenant) if tenant != page.tenant_id => {
                Err(AssignmentError::UnknownPage(page_id.to_string()))
            }
            _ => Ok(page),
        }
    }

    pub async fn current(&self, key: &ParticipantKey) -> Result<ParticipantState, AssignmentError> {
        Ok(self.participants.load_or_create(key).await?)
    }

    /// Runs `send` under the participant's state lock so no operator can claim
    /// the conversation mid-delivery. Returns `None` without calling `send` when
    /// the state moved past `seen_version` into one that silences the bot.
    pub async fn run_as_bot<T, F, Fut>(
        &self,
        key: &ParticipantKey,
        seen_version: i64,
        send: F,
    ) -> Result<Option<T>, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.locks.lock(&key.lock_key()).await;
        let state = self.participants.load_or_create(key).await?;
        if state.version != seen_version && state.suppresses_bot() {
            info!(
                page = %key.page_id,
                participant = %key.participant_id,
                operator = ?state.assigned_operator_id,
                bot_stopped = state.bot_stopped,
                "conversation taken over before the bot reply went out"
            );
            return Ok(None);
        }
        Ok(Some(send().await))
    }

    /// Bot-controlled to awaiting-human. Already waiting is a no-op.
    pub async fn request_handoff(
        &self,
        page: &PageConfig,
        key: &ParticipantKey,
    ) -> Result<Transition, AssignmentError> {
        let transition = self
            .transition(key, |state| {
                if state.awaiting_human {
                    return Ok(None);
                }
                let mut next = state.clone();
                next.awaiting_human = true;
                next.assigned_operator_id = None;
                next.assigned_operator_name = None;
                next.assigned_at = None;
                Ok(Some(next))
            })
            .await?;
        if transition.changed {
            info!(
                tenant = %page.tenant_id,
                page = %key.page_id,
                participant = %key.participant_id,
                "human hand-off requested"
            );
            self.hub.broadcast(
                &page.tenant_id,
                RealtimeEvent::AgentRequested,
                state_payload(&transition.state, "requested", None),
            );
        }
        Ok(transition)
    }

    /// Claims the conversation for `operator`. Taking over a bot-controlled
    /// participant is allowed; another operator's claim is not.
    pub async fn assign(
        &self,
        page: &PageConfig,
        key: &ParticipantKey,
        operator: &OperatorIdentity,
    ) -> Result<Transition, AssignmentError> {
        let transition = self.claim(key, operator).await?;
        if transition.changed {
            self.announce_assignment(page, &transition.state, "assigned", operator);
        }
        Ok(transition)
    }

    /// Releases the claim. The participant stays in the waiting queue.
    pub async fn unassign(
        &self,
        page: &PageConfig,
        key: &ParticipantKey,
        operator: &OperatorIdentity,
    ) -> Result<Transition, AssignmentError> {
        let transition = self
            .transition(key, |state| {
                if state.assigned_operator_id.as_deref() != Some(operator.id.as_str()) {
                    return Err(AssignmentError::NotAssignedToCaller);
                }
                let mut next = state.clone();
                next.assigned_operator_id = None;
                next.assigned_operator_name = None;
                next.assigned_at = None;
                Ok(Some(next))
            })
            .await?;
        self.announce_assignment(page, &transition.state, "unassigned", operator);
        Ok(transition)
    }

    /// Hands the conversation back to the bot.
    pub async fn resolve(
        &self,
        page: &PageConfig,
        key: &ParticipantKey,
        operator: &OperatorIdentity,
    ) -> Result<Transition, AssignmentError> {
        let transition = self
            .transition(key, |state| {
                if !state.awaiting_human && state.assigned_operator_id.is_none() {
                    return Ok(None);
                }
                let mut next = state.clone();
                next.awaiting_human = false;
                next.assigned_operator_id = None;
                next.assigned_operator_name = None;
                next.assigned_at = None;
                Ok(Some(next))
            })
            .await?;
        if transition.changed {
            self.announce_assignment(page, &transition.state, "resolved", operator);
        }
        Ok(transition)
    }

    pub async fn set_stop_status(
        &self,
        page: &PageConfig,
        key: &ParticipantKey,
        stopped: bool,
        operator: &OperatorIdentity,
    ) -> Result<Transition, AssignmentError> {
        let transition = self
            .transition(key, |state| {
                if state.bot_stopped == stopped {
                    return Ok(None);
                }
                let mut next = state.clone();
                next.bot_stopped = stopped;
                Ok(Some(next))
            })
            .await?;
        if transition.changed {
            self.hub.broadcast(
                &page.tenant_id,
                RealtimeEvent::CustomerStopStatusChanged,
                state_payload(
                    &transition.state,
                    if stopped { "stopped" } else { "resumed" },
                    Some(operator),
                ),
            );
        }
        Ok(transition)
    }

    /// Claims the conversation if nobody holds it, then delivers and records
    /// the operator's chat message.
    pub async fn send_as_operator(
        &self,
        page: &PageConfig,
        key: &ParticipantKey,
        text: &str,
        operator: &OperatorIdentity,
    ) -> Result<ConversationRecord, AssignmentError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AssignmentError::InvalidRequest("text is required".to_string()));
        }

        let transition = self.claim(key, operator).await?;
        if transition.changed {
            self.announce_assignment(page, &transition.state, "assigned", operator);
        }

        let delivery_id = self
            .delivery
            .deliver_operator_message(key, text, page)
            .await?;
        let record = ConversationRecord::operator_message(key, operator, text, &delivery_id);
        self.conversations.append(&record).await?;
        self.hub
            .broadcast(&page.tenant_id, RealtimeEvent::NewMessage, &record);
        Ok(record)
    }

    async fn claim(
        &self,
        key: &ParticipantKey,
        operator: &OperatorIdentity,
    ) -> Result<Transition, AssignmentError> {
        if operator.id.trim().is_empty() {
            return Err(AssignmentError::InvalidRequest(
                "operatorId is required".to_string(),
            ));
        }
        self.transition(key, |state| {
            match state.assigned_operator_id.as_deref() {
                Some(holder) if holder == operator.id => return Ok(None),
                Some(holder) => return Err(AssignmentError::AlreadyAssigned(holder.to_string())),
                None => {}
            }
            let mut next = state.clone();
            next.awaiting_human = true;
            next.assigned_operator_id = Some(operator.id.clone());
            next.assigned_operator_name = Some(operator.name.clone());
            next.assigned_at = Some(now_iso());
            Ok(Some(next))
        })
        .await
    }

    /// Applies `decide` to the latest state and commits the result with a
    /// version compare-and-set. `Ok(None)` from `decide` means no change.
    async fn transition<F>(
        &self,
        key: &ParticipantKey,
        decide: F,
    ) -> Result<Transition, AssignmentError>
    where
        F: Fn(&ParticipantState) -> Result<Option<ParticipantState>, AssignmentError>,
    {
        let _guard = self.locks.lock(&key.lock_key()).await;
        for _ in 0..CAS_ATTEMPTS {
            let current = self.participants.load_or_create(key).await?;
            let Some(mut next) = decide(&current)? else {
                return Ok(Transition {
                    state: current,
                    changed: false,
                });
            };
            next.version = current.version + 1;
            next.updated_at = now_iso();
            if self
                .participants
                .compare_and_swap(&next, current.version)
                .await?
            {
                return Ok(Transition {
                    state: next,
                    changed: true,
                });
            }
        }
        warn!(
            page = %key.page_id,
            participant = %key.participant_id,
            "participant state kept changing underneath us"
        );
        Err(AssignmentError::Conflict)
    }

    fn announce_assignment(
        &self,
        page: &PageConfig,
        state: &ParticipantState,
        action: &str,
        operator: &OperatorIdentity,
    ) {
        info!(
            tenant = %page.tenant_id,
            page = %state.page_id,
            participant = %state.participant_id,
            operator = %operator.id,
            action,
            "assignment changed"
        );
        self.hub.broadcast(
            &page.tenant_id,
            RealtimeEvent::AgentAssignmentChanged,
            state_payload(state, action, Some(operator)),
        );
    }
}

pub fn state_payload(
    state: &ParticipantState,
    action: &str,
    actor: Option<&OperatorIdentity>,
) -> Value {
    json!({
        "participantId": state.participant_id,
        "pageId": state.page_id,
        "awaitingHuman": state.awaiting_human,
        "assignedOperatorId": state.assigned_operator_id,
        "assignedOperatorName": state.assigned_operator_name,
        "assignedAt": state.assigned_at,
        "botStopped": state.bot_stopped,
        "version": state.version,
        "action": action,
        "actor": actor,
        "updatedAt": state.updated_at,
    })
}
