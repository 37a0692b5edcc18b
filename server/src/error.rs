use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("model api key not configured")]
    MissingApiKey,
    #[error("model request failed: {0}")]
    Request(String),
    #[error("model returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model response had empty content")]
    EmptyReply,
    #[error("model call timed out")]
    Timeout,
}

#[derive(thiserror::Error, Debug)]
pub enum RetrievalError {
    #[error("retrieval service not configured")]
    NotConfigured,
    #[error("retrieval request failed: {0}")]
    Request(String),
    #[error("retrieval service returned {0}")]
    Status(u16),
    #[error("retrieval call timed out")]
    Timeout,
}

#[derive(thiserror::Error, Debug)]
pub enum PlatformError {
    #[error("platform request failed: {0}")]
    Request(String),
    #[error("platform returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("platform response missing {0}")]
    MissingField(&'static str),
    #[error("platform call timed out")]
    Timeout,
}

#[derive(thiserror::Error, Debug)]
pub enum DeliveryError {
    #[error("nothing to deliver")]
    EmptyText,
    #[error("page has no access token")]
    MissingCredential,
    #[error("comment reply has no target comment")]
    MissingTarget,
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Terminal reasons an inbound event stops moving through the pipeline.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("duplicate event")]
    DuplicateEvent,
    #[error("filtered sender: {0}")]
    FilteredSender(&'static str),
    #[error("channel {0} disabled for page")]
    ChannelDisabled(&'static str),
    #[error("unknown page {0}")]
    UnknownPage(String),
    #[error("delivery failed: {0}")]
    DeliveryFailed(#[from] DeliveryError),
    #[error("pipeline timed out")]
    Timeout,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(thiserror::Error, Debug)]
pub enum AssignmentError {
    #[error("conversation already assigned to {0}")]
    AlreadyAssigned(String),
    #[error("conversation is not assigned to the caller")]
    NotAssignedToCaller,
    #[error("concurrent update, try again")]
    Conflict,
    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("unknown page {0}")]
    UnknownPage(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AssignmentError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyAssigned(_) => "already_assigned",
            Self::NotAssignedToCaller => "not_assigned_to_caller",
            Self::Conflict => "conflict",
            Self::Delivery(_) => "delivery_failed",
            Self::UnknownPage(_) => "unknown_page",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Store(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::AlreadyAssigned(_) | Self::Conflict => StatusCode::CONFLICT,
            Self::NotAssignedToCaller => StatusCode::FORBIDDEN,
            Self::Delivery(_) => StatusCode::BAD_GATEWAY,
            Self::UnknownPage(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AssignmentError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Store(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        (
            self.status(),
            Json(json!({ "error": message, "code": self.code() })),
        )
            .into_response()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StartupError {
    #[error("failed to connect to postgres: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to run migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("failed to load pages file: {0}")]
    PagesFile(String),
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("failed to bind or serve: {0}")]
    Io(#[from] std::io::Error),
}
