use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::assignment::AssignmentManager;
use crate::config::{AppConfig, StorageBackend};
use crate::context::ContextAssembler;
use crate::delivery::OutboundDelivery;
use crate::error::{AssignmentError, StartupError};
use crate::idempotency::IdempotencyGuard;
use crate::llm::{LanguageModel, OpenAiChatModel};
use crate::platform::{GraphApiClient, PlatformApi};
use crate::realtime::BroadcastHub;
use crate::reply::ReplyGenerator;
use crate::retrieval::{DisabledRetrieval, HttpRetrieval, RetrievalService};
use crate::router::{EventRouter, RouterDeps};
use crate::store::{
    ConversationStore, MemoryConversationStore, MemoryPageDirectory, MemoryParticipantStore,
    MemoryProcessedEventStore, PageDirectory, ParticipantStore, PgConversationStore,
    PgPageDirectory, PgParticipantStore, PgProcessedEventStore, ProcessedEventStore,
};
use crate::types::{
    now_iso, OperatorActionBody, OperatorIdentity, OperatorSendBody, PageConfig, ParticipantKey,
    StopStatusBody,
};
use crate::webhook::{webhook_event, webhook_verify};
use crate::ws::ws_handler;

const MARKER_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// External collaborators and persistence, injected so tests can swap in fakes.
pub struct Services {
    pub pages: Arc<dyn PageDirectory>,
    pub participants: Arc<dyn ParticipantStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub processed_events: Arc<dyn ProcessedEventStore>,
    pub platform: Arc<dyn PlatformApi>,
    pub model: Arc<dyn LanguageModel>,
    pub retrieval: Arc<dyn RetrievalService>,
}

pub struct AppState {
    pub config: AppConfig,
    pub hub: Arc<BroadcastHub>,
    pub idempotency: IdempotencyGuard,
    pub router: Arc<EventRouter>,
    pub assignments: Arc<AssignmentManager>,
}

impl AppState {
    pub fn new(config: AppConfig, services: Services) -> Arc<Self> {
        let hub = Arc::new(BroadcastHub::new(config.ws_queue_capacity));
        let idempotency =
            IdempotencyGuard::new(services.processed_events.clone(), config.processed_event_ttl);
        let delivery = Arc::new(OutboundDelivery::new(services.platform.clone()));
        let assignments = Arc::new(AssignmentManager::new(
            services.participants.clone(),
            services.conversations.clone(),
            services.pages.clone(),
            delivery.clone(),
            hub.clone(),
        ));
        let router = Arc::new(EventRouter::new(RouterDeps {
            guard: idempotency.clone(),
            pages: services.pages.clone(),
            participants: services.participants.clone(),
            conversations: services.conversations.clone(),
            platform: services.platform.clone(),
            assembler: ContextAssembler::new(
                services.conversations.clone(),
                services.retrieval.clone(),
                config.history_limit,
                config.retrieval_top_k,
            ),
            generator: ReplyGenerator::new(services.model.clone(), config.model_timeout),
            delivery,
            assignments: assignments.clone(),
            hub: hub.clone(),
            admission_timeout: config.admission_timeout,
        }));

        Arc::new(Self {
            config,
            hub,
            idempotency,
            router,
            assignments,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(webhook_verify).post(webhook_event))
        .route(
            "/api/pages/{page_id}/participants/{participant_id}/messages",
            post(post_operator_message),
        )
        .route(
            "/api/pages/{page_id}/participants/{participant_id}/assign",
            post(post_assign),
        )
        .route(
            "/api/pages/{page_id}/participants/{participant_id}/unassign",
            post(post_unassign),
        )
        .route(
            "/api/pages/{page_id}/participants/{participant_id}/resolve",
            post(post_resolve),
        )
        .route(
            "/api/pages/{page_id}/participants/{participant_id}/stop",
            post(post_stop_status),
        )
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn post_operator_message(
    Path((page_id, participant_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<OperatorSendBody>,
) -> Result<impl IntoResponse, AssignmentError> {
    let page = state.assignments.resolve_page(&page_id, None).await?;
    let key = ParticipantKey::new(&participant_id, &page_id);
    let operator = OperatorIdentity::new(body.operator_id.trim(), body.operator_name.trim());
    let record = state
        .assignments
        .send_as_operator(&page, &key, &body.text, &operator)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn post_assign(
    Path((page_id, participant_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<OperatorActionBody>,
) -> Result<Json<Value>, AssignmentError> {
    let (page, key, operator) = action_target(&state, &page_id, &participant_id, &body).await?;
    let transition = state.assignments.assign(&page, &key, &operator).await?;
    Ok(Json(json!({ "state": transition.state, "changed": transition.changed })))
}

async fn post_unassign(
    Path((page_id, participant_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<OperatorActionBody>,
) -> Result<Json<Value>, AssignmentError> {
    let (page, key, operator) = action_target(&state, &page_id, &participant_id, &body).await?;
    let transition = state.assignments.unassign(&page, &key, &operator).await?;
    Ok(Json(json!({ "state": transition.state, "changed": transition.changed })))
}

async fn post_resolve(
    Path((page_id, participant_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<OperatorActionBody>,
) -> Result<Json<Value>, AssignmentError> {
    let (page, key, operator) = action_target(&state, &page_id, &participant_id, &body).await?;
    let transition = state.assignments.resolve(&page, &key, &operator).await?;
    Ok(Json(json!({ "state": transition.state, "changed": transition.changed })))
}

async fn post_stop_status(
    Path((page_id, participant_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<StopStatusBody>,
) -> Result<Json<Value>, AssignmentError> {
    let action = OperatorActionBody {
        operator_id: body.operator_id,
        operator_name: body.operator_name,
    };
    let (page, key, operator) = action_target(&state, &page_id, &participant_id, &action).await?;
    let transition = state
        .assignments
        .set_stop_status(&page, &key, body.stopped, &operator)
        .await?;
    Ok(Json(json!({ "state": transition.state, "changed": transition.changed })))
}

async fn action_target(
    state: &Arc<AppState>,
    page_id: &str,
    participant_id: &str,
    body: &OperatorActionBody,
) -> Result<(PageConfig, ParticipantKey, OperatorIdentity), AssignmentError> {
    if body.operator_id.trim().is_empty() {
        return Err(AssignmentError::InvalidRequest(
            "operatorId is required".to_string(),
        ));
    }
    let page = state.assignments.resolve_page(page_id, None).await?;
    Ok((
        page,
        ParticipantKey::new(participant_id, page_id),
        OperatorIdentity::new(body.operator_id.trim(), body.operator_name.trim()),
    ))
}

async fn build_services(config: &AppConfig) -> Result<Services, StartupError> {
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let platform: Arc<dyn PlatformApi> = Arc::new(GraphApiClient::new(
        http.clone(),
        &config.graph_api_base,
        config.platform_timeout,
        config.profile_timeout,
    ));
    let model: Arc<dyn LanguageModel> = Arc::new(OpenAiChatModel::new(
        http.clone(),
        &config.openai_api_base,
        &config.openai_api_key,
        &config.openai_chat_model,
        config.model_timeout,
    ));
    let retrieval: Arc<dyn RetrievalService> = if config.retrieval_url.is_empty() {
        Arc::new(DisabledRetrieval)
    } else {
        Arc::new(HttpRetrieval::new(
            http,
            &config.retrieval_url,
            config.retrieval_timeout,
        ))
    };

    match config.storage {
        StorageBackend::Postgres => {
            let db = PgPoolOptions::new()
                .max_connections(10)
                .connect(&config.database_url)
                .await?;
            sqlx::migrate!("./migrations").run(&db).await?;
            Ok(Services {
                pages: Arc::new(PgPageDirectory::new(db.clone())),
                participants: Arc::new(PgParticipantStore::new(db.clone())),
                conversations: Arc::new(PgConversationStore::new(db.clone())),
                processed_events: Arc::new(PgProcessedEventStore::new(db)),
                platform,
                model,
                retrieval,
            })
        }
        StorageBackend::Memory => {
            let pages = MemoryPageDirectory::new();
            if !config.pages_file.is_empty() {
                let raw = tokio::fs::read_to_string(&config.pages_file)
                    .await
                    .map_err(|err| StartupError::PagesFile(err.to_string()))?;
                let configs = serde_json::from_str::<Vec<PageConfig>>(&raw)
                    .map_err(|err| StartupError::PagesFile(err.to_string()))?;
                for page in configs {
                    pages.insert(page);
                }
            }
            Ok(Services {
                pages: Arc::new(pages),
                participants: Arc::new(MemoryParticipantStore::new()),
                conversations: Arc::new(MemoryConversationStore::new()),
                processed_events: Arc::new(MemoryProcessedEventStore::new()),
                platform,
                model,
                retrieval,
            })
        }
    }
}

pub async fn run() -> Result<(), StartupError> {
    let _ = dotenvy::dotenv();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let config = AppConfig::from_env();
    let port = config.port;
    let services = build_services(&config).await?;
    let state = AppState::new(config, services);
    state.idempotency.spawn_sweeper(MARKER_SWEEP_INTERVAL);

    let app = build_router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(%addr, "page bot server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
