use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Timestamps are stored as fixed-width RFC 3339 strings so they sort lexically.
pub fn now_iso() -> String {
    iso(Utc::now())
}

pub fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Message,
    Comment,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Comment => "comment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "message" | "messages" | "chat" | "messenger" => Some(Self::Message),
            "comment" | "comments" | "feed" => Some(Self::Comment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub event_id: String,
    pub channel: Channel,
    pub participant_id: String,
    #[serde(default)]
    pub participant_name: String,
    pub page_id: String,
    pub text: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub post_id: Option<String>,
    pub timestamp: String,
}

impl InboundEvent {
    pub fn participant_key(&self) -> ParticipantKey {
        ParticipantKey::new(&self.participant_id, &self.page_id)
    }

    /// A comment whose parent is another comment rather than the post itself.
    pub fn is_comment_reply(&self) -> bool {
        if self.channel != Channel::Comment {
            return false;
        }
        match (self.parent_id.as_deref(), self.post_id.as_deref()) {
            (Some(parent), Some(post)) => !parent.is_empty() && parent != post,
            (Some(parent), None) => !parent.is_empty(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantKey {
    pub participant_id: String,
    pub page_id: String,
}

impl ParticipantKey {
    pub fn new(participant_id: &str, page_id: &str) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            page_id: page_id.to_string(),
        }
    }

    pub fn lock_key(&self) -> String {
        format!("{}:{}", self.page_id, self.participant_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorKind {
    Participant,
    Bot,
    HumanOperator,
}

impl AuthorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Participant => "participant",
            Self::Bot => "bot",
            Self::HumanOperator => "human_operator",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "participant" => Some(Self::Participant),
            "bot" => Some(Self::Bot),
            "human_operator" => Some(Self::HumanOperator),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorIdentity {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl OperatorIdentity {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: String,
    pub participant_id: String,
    pub page_id: String,
    pub channel: Channel,
    pub direction: Direction,
    pub author: AuthorKind,
    pub text: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
}

impl ConversationRecord {
    pub fn inbound(event: &InboundEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            participant_id: event.participant_id.clone(),
            page_id: event.page_id.clone(),
            channel: event.channel,
            direction: Direction::Inbound,
            author: AuthorKind::Participant,
            text: event.text.trim().to_string(),
            created_at: now_iso(),
            operator_id: None,
            operator_name: None,
            event_id: Some(event.event_id.clone()),
            delivery_id: None,
        }
    }

    pub fn bot_reply(event: &InboundEvent, text: &str, delivery_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            participant_id: event.participant_id.clone(),
            page_id: event.page_id.clone(),
            channel: event.channel,
            direction: Direction::Outbound,
            author: AuthorKind::Bot,
            text: text.to_string(),
            created_at: now_iso(),
            operator_id: None,
            operator_name: None,
            event_id: Some(event.event_id.clone()),
            delivery_id: Some(delivery_id.to_string()),
        }
    }

    pub fn operator_message(
        key: &ParticipantKey,
        operator: &OperatorIdentity,
        text: &str,
        delivery_id: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            participant_id: key.participant_id.clone(),
            page_id: key.page_id.clone(),
            channel: Channel::Message,
            direction: Direction::Outbound,
            author: AuthorKind::HumanOperator,
            text: text.to_string(),
            created_at: now_iso(),
            operator_id: Some(operator.id.clone()),
            operator_name: Some(operator.name.clone()),
            event_id: None,
            delivery_id: Some(delivery_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantState {
    pub participant_id: String,
    pub page_id: String,
    pub awaiting_human: bool,
    pub assigned_operator_id: Option<String>,
    #[serde(default)]
    pub assigned_operator_name: Option<String>,
    pub assigned_at: Option<String>,
    #[serde(default)]
    pub bot_stopped: bool,
    pub version: i64,
    pub updated_at: String,
}

impl ParticipantState {
    pub fn new(key: &ParticipantKey) -> Self {
        Self {
            participant_id: key.participant_id.clone(),
            page_id: key.page_id.clone(),
            awaiting_human: false,
            assigned_operator_id: None,
            assigned_operator_name: None,
            assigned_at: None,
            bot_stopped: false,
            version: 0,
            updated_at: now_iso(),
        }
    }

    pub fn key(&self) -> ParticipantKey {
        ParticipantKey::new(&self.participant_id, &self.page_id)
    }

    /// The bot must stay quiet for this participant.
    pub fn suppresses_bot(&self) -> bool {
        self.awaiting_human || self.bot_stopped
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEventMarker {
    pub event_id: String,
    pub processed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyAttempt {
    pub event_id: String,
    pub participant_id: String,
    pub page_id: String,
    pub channel: Channel,
    pub delivered: bool,
    pub delivery_id: Option<String>,
    pub wants_human: bool,
    pub used_fallback: bool,
    pub error: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelFlags {
    #[serde(default)]
    pub message: bool,
    #[serde(default)]
    pub comment: bool,
}

impl ChannelFlags {
    pub fn all() -> Self {
        Self {
            message: true,
            comment: true,
        }
    }

    pub fn enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Message => self.message,
            Channel::Comment => self.comment,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeLink {
    pub source_id: String,
    #[serde(default)]
    pub active: bool,
    /// Empty means the link was created before per-channel scoping existed.
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalSettings {
    #[serde(default)]
    pub channel_flags: Option<ChannelFlags>,
    #[serde(default)]
    pub knowledge_links: Vec<KnowledgeLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSettings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub language: String,
}

fn default_max_tokens() -> u32 {
    512
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: String::new(),
            system_prompt: String::new(),
            max_tokens: default_max_tokens(),
            language: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageConfig {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub page_id: String,
    #[serde(default)]
    pub page_name: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub channels: ChannelFlags,
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    #[serde(default)]
    pub model: ModelSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Passage {
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSendBody {
    pub operator_id: String,
    #[serde(default)]
    pub operator_name: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorActionBody {
    pub operator_id: String,
    #[serde(default)]
    pub operator_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopStatusBody {
    pub operator_id: String,
    #[serde(default)]
    pub operator_name: String,
    pub stopped: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardConnectQuery {
    pub tenant_id: String,
    pub operator_id: String,
    #[serde(default)]
    pub operator_name: String,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}
