use std::sync::Arc;

use tracing::warn;

use crate::llm::{ChatRole, ChatTurn};
use crate::prompting::{render_context, ContextPromptContext};
use crate::retrieval::RetrievalService;
use crate::store::ConversationStore;
use crate::types::{
    AuthorKind, Channel, ConversationRecord, InboundEvent, PageConfig, Passage, RetrievalSettings,
};

pub struct AssembledContext {
    /// Passages, parent comment and the current message. History travels
    /// separately as chat turns.
    pub text: String,
    /// Prior records for the participant, oldest first, excluding the current event.
    pub history: Vec<ConversationRecord>,
    pub passages: Vec<Passage>,
    /// History or retrieval failed and the text was built without it.
    pub partial: bool,
}

pub struct ContextAssembler {
    conversations: Arc<dyn ConversationStore>,
    retrieval: Arc<dyn RetrievalService>,
    history_limit: usize,
    top_k: usize,
}

impl ContextAssembler {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        retrieval: Arc<dyn RetrievalService>,
        history_limit: usize,
        top_k: usize,
    ) -> Self {
        Self {
            conversations,
            retrieval,
            history_limit,
            top_k,
        }
    }

    pub async fn assemble(
        &self,
        event: &InboundEvent,
        page: &PageConfig,
        parent_text: Option<&str>,
    ) -> AssembledContext {
        let mut partial = false;
        let key = event.participant_key();

        let history = match self
            .conversations
            .recent(&key, self.history_limit.saturating_add(1))
            .await
        {
            Ok(records) => {
                let prior = records
                    .into_iter()
                    .filter(|record| record.event_id.as_deref() != Some(event.event_id.as_str()))
                    .collect::<Vec<_>>();
                let skip = prior.len().saturating_sub(self.history_limit);
                prior.into_iter().skip(skip).collect::<Vec<_>>()
            }
            Err(err) => {
                warn!(
                    event_id = %event.event_id,
                    participant = %event.participant_id,
                    page = %event.page_id,
                    error = %err,
                    "history unavailable, continuing without it"
                );
                partial = true;
                Vec::new()
            }
        };

        let passages = if retrieval_enabled(&page.retrieval, event.channel) && self.top_k > 0 {
            match self
                .retrieval
                .search(
                    &event.text,
                    &page.tenant_id,
                    &page.page_id,
                    event.channel,
                    self.top_k,
                )
                .await
            {
                Ok(passages) => passages,
                Err(err) => {
                    warn!(
                        event_id = %event.event_id,
                        page = %event.page_id,
                        error = %err,
                        "retrieval failed, continuing without passages"
                    );
                    partial = true;
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let text = render_context(&ContextPromptContext {
            message: &event.text,
            participant_name: &event.participant_name,
            passages: &passages,
            parent_text,
        });

        AssembledContext {
            text,
            history,
            passages,
            partial,
        }
    }
}

/// Retrieval runs when the page flags the channel explicitly or an active
/// knowledge link covers it. Pages without per-channel flags use any active link.
pub fn retrieval_enabled(settings: &RetrievalSettings, channel: Channel) -> bool {
    let Some(flags) = settings.channel_flags else {
        return settings.knowledge_links.iter().any(|link| link.active);
    };
    if flags.enabled(channel) {
        return true;
    }
    settings.knowledge_links.iter().any(|link| {
        link.active && (link.channels.is_empty() || link.channels.contains(&channel))
    })
}

/// Operator messages are attributed inline so the model can tell them from its own.
pub fn history_turn(record: &ConversationRecord) -> ChatTurn {
    let text = record.text.trim();
    match record.author {
        AuthorKind::Participant => ChatTurn {
            role: ChatRole::User,
            content: text.to_string(),
        },
        AuthorKind::Bot => ChatTurn {
            role: ChatRole::Assistant,
            content: text.to_string(),
        },
        AuthorKind::HumanOperator => {
            let speaker = match record.operator_name.as_deref().map(str::trim) {
                Some(name) if !name.is_empty() => format!("Agent ({name})"),
                _ => "Agent".to_string(),
            };
            ChatTurn {
                role: ChatRole::Assistant,
                content: format!("{speaker}: {text}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RetrievalError, StoreError};
    use crate::store::MemoryConversationStore;
    use crate::types::{
        now_iso, ChannelFlags, KnowledgeLink, OperatorIdentity, ParticipantKey, ReplyAttempt,
    };
    use async_trait::async_trait;

    struct FixedRetrieval(Vec<Passage>);

    #[async_trait]
    impl RetrievalService for FixedRetrieval {
        async fn search(
            &self,
            _query: &str,
            _tenant_id: &str,
            _page_id: &str,
            _channel: Channel,
            top_k: usize,
        ) -> Result<Vec<Passage>, RetrievalError> {
            Ok(self.0.iter().take(top_k).cloned().collect())
        }
    }

    struct FailingRetrieval;

    #[async_trait]
    impl RetrievalService for FailingRetrieval {
        async fn search(
            &self,
            _query: &str,
            _tenant_id: &str,
            _page_id: &str,
            _channel: Channel,
            _top_k: usize,
        ) -> Result<Vec<Passage>, RetrievalError> {
            Err(RetrievalError::Timeout)
        }
    }

    struct BrokenHistory;

    #[async_trait]
    impl ConversationStore for BrokenHistory {
        async fn append(&self, _record: &ConversationRecord) -> Result<(), StoreError> {
            Ok(())
        }

        async fn recent(
            &self,
            _key: &ParticipantKey,
            _limit: usize,
        ) -> Result<Vec<ConversationRecord>, StoreError> {
            Err(StoreError::Corrupt("boom".to_string()))
        }

        async fn records_for_event(
            &self,
            _event_id: &str,
        ) -> Result<Vec<ConversationRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn record_reply_attempt(&self, _attempt: &ReplyAttempt) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn event(id: &str, text: &str) -> InboundEvent {
        InboundEvent {
            event_id: id.to_string(),
            channel: Channel::Message,
            participant_id: "u1".to_string(),
            participant_name: "Ana".to_string(),
            page_id: "p1".to_string(),
            text: text.to_string(),
            parent_id: None,
            post_id: None,
            timestamp: now_iso(),
        }
    }

    fn page_with_links(flags: Option<ChannelFlags>, links: Vec<KnowledgeLink>) -> PageConfig {
        let mut page: PageConfig =
            serde_json::from_str(r#"{"tenantId":"t1","pageId":"p1"}"#).expect("page");
        page.retrieval = RetrievalSettings {
            channel_flags: flags,
            knowledge_links: links,
        };
        page
    }

    fn link(active: bool, channels: Vec<Channel>) -> KnowledgeLink {
        KnowledgeLink {
            source_id: "kb".to_string(),
            active,
            channels,
        }
    }

    fn passage(text: &str) -> Passage {
        Passage {
            source_id: "kb".to_string(),
            title: String::new(),
            text: text.to_string(),
            score: 1.0,
        }
    }

    #[test]
    fn legacy_pages_use_any_active_link() {
        let settings = RetrievalSettings {
            channel_flags: None,
            knowledge_links: vec![link(true, vec![Channel::Comment])],
        };
        assert!(retrieval_enabled(&settings, Channel::Message));
        let inactive = RetrievalSettings {
            channel_flags: None,
            knowledge_links: vec![link(false, vec![])],
        };
        assert!(!retrieval_enabled(&inactive, Channel::Message));
    }

    #[test]
    fn scoped_links_must_cover_channel() {
        let flags = Some(ChannelFlags::default());
        let settings = RetrievalSettings {
            channel_flags: flags,
            knowledge_links: vec![link(true, vec![Channel::Comment])],
        };
        assert!(retrieval_enabled(&settings, Channel::Comment));
        assert!(!retrieval_enabled(&settings, Channel::Message));

        let explicit = RetrievalSettings {
            channel_flags: Some(ChannelFlags {
                message: true,
                comment: false,
            }),
            knowledge_links: Vec::new(),
        };
        assert!(retrieval_enabled(&explicit, Channel::Message));
    }

    #[tokio::test]
    async fn history_excludes_current_event_and_keeps_last_n() {
        let store = Arc::new(MemoryConversationStore::new());
        for index in 0..4 {
            store
                .append(&ConversationRecord::inbound(&event(
                    &format!("m{index}"),
                    &format!("msg {index}"),
                )))
                .await
                .expect("append");
        }
        let current = event("m4", "latest");
        store
            .append(&ConversationRecord::inbound(&current))
            .await
            .expect("append");

        let assembler = ContextAssembler::new(store, Arc::new(FixedRetrieval(Vec::new())), 2, 3);
        let page = page_with_links(None, Vec::new());
        let context = assembler.assemble(&current, &page, None).await;

        let texts = context.history.iter().map(|r| r.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["msg 2", "msg 3"]);
        assert!(context.passages.is_empty());
        assert!(!context.partial);
        assert_eq!(context.text, "Customer (Ana): latest");
    }

    #[test]
    fn history_turns_follow_the_author() {
        let key = ParticipantKey::new("u1", "p1");
        let inbound = ConversationRecord::inbound(&event("m1", " hi "));
        let bot = ConversationRecord::bot_reply(&event("m1", "hi"), "Hello!", "d1");
        let operator = ConversationRecord::operator_message(
            &key,
            &OperatorIdentity::new("op-a", ""),
            "Taking over.",
            "d2",
        );

        assert_eq!(history_turn(&inbound).role, ChatRole::User);
        assert_eq!(history_turn(&inbound).content, "hi");
        assert_eq!(history_turn(&bot).role, ChatRole::Assistant);
        assert_eq!(history_turn(&operator).content, "Agent: Taking over.");
    }

    #[tokio::test]
    async fn passages_are_included_when_enabled() {
        let assembler = ContextAssembler::new(
            Arc::new(MemoryConversationStore::new()),
            Arc::new(FixedRetrieval(vec![passage("We ship in 2 days.")])),
            5,
            4,
        );
        let page = page_with_links(None, vec![link(true, Vec::new())]);
        let context = assembler
            .assemble(&event("m1", "shipping time?"), &page, None)
            .await;
        assert_eq!(context.passages.len(), 1);
        assert!(context.text.contains("We ship in 2 days."));
    }

    #[tokio::test]
    async fn failures_degrade_to_partial_context() {
        let assembler =
            ContextAssembler::new(Arc::new(BrokenHistory), Arc::new(FailingRetrieval), 5, 4);
        let page = page_with_links(None, vec![link(true, Vec::new())]);
        let context = assembler.assemble(&event("m1", "hello"), &page, None).await;
        assert!(context.partial);
        assert!(context.history.is_empty());
        assert!(context.passages.is_empty());
        assert!(context.text.contains("hello"));
    }
}
