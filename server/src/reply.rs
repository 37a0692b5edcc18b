use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::context::{history_turn, AssembledContext};
use crate::error::ModelError;
use crate::llm::{CompletionRequest, LanguageModel};
use crate::prompting::{render_system_prompt, SystemPromptContext};
use crate::types::{Channel, PageConfig};

pub const COMMENT_FALLBACK: &str = "Thank you for your comment!";
pub const CHAT_FALLBACK: &str =
    "I apologize, but I'm having trouble processing your message right now.";
pub const HUMAN_NOTICE: &str = "A human agent will be with you shortly.";

static HANDOFF_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[\s*handoff\s*\]").expect("hand-off marker pattern is valid")
});

#[derive(Debug)]
pub struct GeneratedReply {
    pub text: String,
    pub wants_human: bool,
    pub used_fallback: bool,
    pub error: Option<ModelError>,
}

impl GeneratedReply {
    fn fallback(channel: Channel, error: ModelError) -> Self {
        Self {
            text: fallback_text(channel).to_string(),
            wants_human: false,
            used_fallback: true,
            error: Some(error),
        }
    }
}

pub fn fallback_text(channel: Channel) -> &'static str {
    match channel {
        Channel::Comment => COMMENT_FALLBACK,
        Channel::Message => CHAT_FALLBACK,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDecision {
    pub reply: String,
    pub handover: Option<bool>,
}

pub struct ReplyGenerator {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl ReplyGenerator {
    /// `timeout` bounds the whole model call, whatever client sits behind it.
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    /// Never fails: model errors and timeouts become the channel fallback
    /// with the error attached.
    pub async fn generate(
        &self,
        context: &AssembledContext,
        channel: Channel,
        page: &PageConfig,
    ) -> GeneratedReply {
        let system_prompt = render_system_prompt(&SystemPromptContext {
            page_name: &page.page_name,
            custom_prompt: &page.model.system_prompt,
            language: &page.model.language,
            channel,
        });
        let request = CompletionRequest {
            api_key: page.model.api_key.clone(),
            model: page.model.model.clone(),
            system_prompt,
            context: context.text.clone(),
            history: context.history.iter().map(history_turn).collect(),
            max_tokens: page.model.max_tokens,
        };

        let completion = tokio::time::timeout(self.timeout, self.model.complete(request))
            .await
            .unwrap_or(Err(ModelError::Timeout));
        let raw = match completion {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    page = %page.page_id,
                    channel = channel.as_str(),
                    history = context.history.len(),
                    error = %err,
                    "model call failed, using fallback reply"
                );
                return GeneratedReply::fallback(channel, err);
            }
        };

        let decision = parse_model_decision(&raw);
        let (text, marked) = strip_handoff_marker(&decision.reply);
        let wants_human = decision.handover.unwrap_or(false) || marked;

        match channel {
            Channel::Comment => {
                if text.is_empty() {
                    return GeneratedReply::fallback(channel, ModelError::EmptyReply);
                }
                GeneratedReply {
                    text,
                    wants_human: false,
                    used_fallback: false,
                    error: None,
                }
            }
            Channel::Message => {
                if !wants_human {
                    if text.is_empty() {
                        return GeneratedReply::fallback(channel, ModelError::EmptyReply);
                    }
                    return GeneratedReply {
                        text,
                        wants_human: false,
                        used_fallback: false,
                        error: None,
                    };
                }
                let text = if text.is_empty() {
                    HUMAN_NOTICE.to_string()
                } else {
                    format!("{text}\n\n{HUMAN_NOTICE}")
                };
                GeneratedReply {
                    text,
                    wants_human: true,
                    used_fallback: false,
                    error: None,
                }
            }
        }
    }
}

/// Accepts `{"reply", "handover"}` JSON, optionally fenced or wrapped in prose.
/// Anything else is taken verbatim as the reply with no structured signal.
pub fn parse_model_decision(raw: &str) -> ModelDecision {
    let trimmed = raw.trim();

    let mut candidates = vec![trimmed.to_string()];
    if trimmed.starts_with("```") {
        let stripped = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
        if !stripped.is_empty() {
            candidates.push(stripped);
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            candidates.push(trimmed[start..=end].to_string());
        }
    }

    for candidate in candidates {
        let Ok(parsed) = serde_json::from_str::<Value>(&candidate) else {
            continue;
        };
        let Some(reply) = parsed.get("reply").and_then(Value::as_str) else {
            continue;
        };
        let handover = parsed
            .get("handover")
            .or_else(|| parsed.get("handoff"))
            .and_then(Value::as_bool);
        return ModelDecision {
            reply: reply.trim().to_string(),
            handover,
        };
    }

    ModelDecision {
        reply: trimmed.to_string(),
        handover: None,
    }
}

/// Removes every hand-off marker. Returns the cleaned text and whether one was found.
pub fn strip_handoff_marker(text: &str) -> (String, bool) {
    if !HANDOFF_MARKER.is_match(text) {
        return (text.trim().to_string(), false);
    }
    let cleaned = HANDOFF_MARKER.replace_all(text, " ");
    let collapsed = cleaned
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    (collapsed.trim().to_string(), true)
}
