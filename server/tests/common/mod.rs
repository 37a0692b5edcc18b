#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pagebot_server::app::{build_router, AppState, Services};
use pagebot_server::config::AppConfig;
use pagebot_server::error::{ModelError, PlatformError};
use pagebot_server::llm::{CompletionRequest, LanguageModel};
use pagebot_server::platform::{PlatformApi, ReplyTarget};
use pagebot_server::retrieval::DisabledRetrieval;
use pagebot_server::store::{
    MemoryConversationStore, MemoryPageDirectory, MemoryParticipantStore,
    MemoryProcessedEventStore,
};
use pagebot_server::types::{now_iso, Channel, ChannelFlags, InboundEvent, PageConfig, UserProfile};
use serde_json::Value;
use tokio::sync::mpsc;

pub const TENANT: &str = "T1";
pub const PAGE: &str = "P1";
pub const PAGE_NAME: &str = "Corner Bakery";

#[derive(Default)]
pub struct FakePlatform {
    pub posts: Mutex<Vec<(ReplyTarget, String)>>,
    pub profile_name: Mutex<String>,
    pub parent_text: Mutex<String>,
    pub page_authored: Mutex<Vec<String>>,
    pub fail_posts: Mutex<bool>,
}

impl FakePlatform {
    pub fn posts(&self) -> Vec<(ReplyTarget, String)> {
        self.posts.lock().expect("posts").clone()
    }
}

#[async_trait]
impl PlatformApi for FakePlatform {
    async fn get_user_profile(
        &self,
        user_id: &str,
        _access_token: &str,
    ) -> Result<UserProfile, PlatformError> {
        Ok(UserProfile {
            id: user_id.to_string(),
            name: self.profile_name.lock().expect("profile").clone(),
        })
    }

    async fn post_reply(
        &self,
        target: &ReplyTarget,
        text: &str,
        _access_token: &str,
    ) -> Result<String, PlatformError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if *self.fail_posts.lock().expect("flag") {
            return Err(PlatformError::Status {
                status: 500,
                body: "down".to_string(),
            });
        }
        let mut posts = self.posts.lock().expect("posts");
        posts.push((target.clone(), text.to_string()));
        Ok(format!("delivery-{}", posts.len()))
    }

    async fn is_author_of_page(
        &self,
        object_id: &str,
        _page_id: &str,
        _access_token: &str,
    ) -> Result<bool, PlatformError> {
        Ok(self
            .page_authored
            .lock()
            .expect("authored")
            .iter()
            .any(|id| id == object_id))
    }

    async fn get_comment_text(
        &self,
        _comment_id: &str,
        _access_token: &str,
    ) -> Result<String, PlatformError> {
        Ok(self.parent_text.lock().expect("parent").clone())
    }
}

/// Answers every request with `reply` after `delay`, or fails when `reply` is `None`.
pub struct FakeModel {
    pub reply: Mutex<Option<String>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
    pub delay: Duration,
}

impl FakeModel {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Mutex::new(Some(reply.to_string())),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests").len()
    }
}

#[async_trait]
impl LanguageModel for FakeModel {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ModelError> {
        self.requests.lock().expect("requests").push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply
            .lock()
            .expect("reply")
            .clone()
            .ok_or_else(|| ModelError::Status {
                status: 503,
                body: "overloaded".to_string(),
            })
    }
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub platform: Arc<FakePlatform>,
    pub model: Arc<FakeModel>,
    pub conversations: Arc<MemoryConversationStore>,
    pub participants: Arc<MemoryParticipantStore>,
    pub pages: Arc<MemoryPageDirectory>,
}

pub fn page_config() -> PageConfig {
    let mut page: PageConfig = serde_json::from_str("{}").expect("page");
    page.tenant_id = TENANT.to_string();
    page.page_id = PAGE.to_string();
    page.page_name = PAGE_NAME.to_string();
    page.access_token = "page-token".to_string();
    page.channels = ChannelFlags::all();
    page
}

pub fn harness(model: FakeModel) -> Harness {
    harness_with_page(model, page_config())
}

pub fn harness_with_page(model: FakeModel, page: PageConfig) -> Harness {
    build_harness(model, page, AppConfig::default())
}

pub fn harness_with_config(model: FakeModel, config: AppConfig) -> Harness {
    build_harness(model, page_config(), config)
}

fn build_harness(model: FakeModel, page: PageConfig, config: AppConfig) -> Harness {
    let platform = Arc::new(FakePlatform::default());
    let model = Arc::new(model);
    let conversations = Arc::new(MemoryConversationStore::new());
    let participants = Arc::new(MemoryParticipantStore::new());
    let pages = Arc::new(MemoryPageDirectory::new());
    pages.insert(page);

    let state = AppState::new(
        config,
        Services {
            pages: pages.clone(),
            participants: participants.clone(),
            conversations: conversations.clone(),
            processed_events: Arc::new(MemoryProcessedEventStore::new()),
            platform: platform.clone(),
            model: model.clone(),
            retrieval: Arc::new(DisabledRetrieval),
        },
    );

    Harness {
        state,
        platform,
        model,
        conversations,
        participants,
        pages,
    }
}

pub fn chat_event(event_id: &str, participant_id: &str, text: &str) -> InboundEvent {
    InboundEvent {
        event_id: event_id.to_string(),
        channel: Channel::Message,
        participant_id: participant_id.to_string(),
        participant_name: "Ana".to_string(),
        page_id: PAGE.to_string(),
        text: text.to_string(),
        parent_id: None,
        post_id: None,
        timestamp: now_iso(),
    }
}

pub fn comment_event(comment_id: &str, participant_id: &str, text: &str) -> InboundEvent {
    InboundEvent {
        event_id: comment_id.to_string(),
        channel: Channel::Comment,
        participant_id: participant_id.to_string(),
        participant_name: "Bruno".to_string(),
        page_id: PAGE.to_string(),
        text: text.to_string(),
        parent_id: Some("post_1".to_string()),
        post_id: Some("post_1".to_string()),
        timestamp: now_iso(),
    }
}

/// Serves the full HTTP surface on an ephemeral port. Returns `host:port`.
pub async fn serve(h: &Harness) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = build_router(h.state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr.to_string()
}

/// Polls `check` for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Everything queued on a dashboard connection so far, parsed.
pub fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(raw) = rx.try_recv() {
        frames.push(serde_json::from_str(&raw).expect("frame json"));
    }
    frames
}

pub fn event_names(frames: &[Value]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|frame| frame["event"].as_str().map(str::to_string))
        .collect()
}
