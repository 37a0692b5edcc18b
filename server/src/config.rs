use std::{env, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub storage: StorageBackend,
    pub database_url: String,
    /// JSON array of page configs loaded at startup with `STORAGE=memory`.
    pub pages_file: String,
    pub graph_api_base: String,
    pub openai_api_base: String,
    pub openai_api_key: String,
    pub openai_chat_model: String,
    pub retrieval_url: String,
    pub webhook_verify_token: String,
    pub history_limit: usize,
    pub retrieval_top_k: usize,
    pub processed_event_ttl: Duration,
    pub platform_timeout: Duration,
    pub profile_timeout: Duration,
    pub retrieval_timeout: Duration,
    pub model_timeout: Duration,
    /// Deadline for admitting an event, up to and including recording the
    /// inbound message. Generation and delivery run under their own timeouts.
    pub admission_timeout: Duration,
    pub ws_ping_interval: Duration,
    pub ws_read_timeout: Duration,
    pub ws_queue_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            storage: StorageBackend::Memory,
            database_url: String::new(),
            pages_file: String::new(),
            graph_api_base: "https://graph.facebook.com/v21.0".to_string(),
            openai_api_base: "https://api.openai.com/v1".to_string(),
            openai_api_key: String::new(),
            openai_chat_model: "gpt-4.1".to_string(),
            retrieval_url: String::new(),
            webhook_verify_token: String::new(),
            history_limit: 5,
            retrieval_top_k: 4,
            processed_event_ttl: Duration::from_secs(24 * 60 * 60),
            platform_timeout: Duration::from_secs(20),
            profile_timeout: Duration::from_secs(10),
            retrieval_timeout: Duration::from_secs(15),
            model_timeout: Duration::from_secs(60),
            admission_timeout: Duration::from_secs(60),
            ws_ping_interval: Duration::from_secs(25),
            ws_read_timeout: Duration::from_secs(60),
            ws_queue_capacity: 256,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let storage = match env_text("STORAGE").to_ascii_lowercase().as_str() {
            "memory" => StorageBackend::Memory,
            _ => StorageBackend::Postgres,
        };
        Self {
            port: env_parse("PORT").unwrap_or(defaults.port),
            storage,
            database_url: resolve_database_url(),
            pages_file: env_text("PAGES_FILE"),
            graph_api_base: env_or("GRAPH_API_BASE", &defaults.graph_api_base),
            openai_api_base: env_or("OPENAI_API_BASE", &defaults.openai_api_base),
            openai_api_key: env_text("OPENAI_API_KEY"),
            openai_chat_model: env_or("OPENAI_CHAT_MODEL", &defaults.openai_chat_model),
            retrieval_url: env_text("RETRIEVAL_URL"),
            webhook_verify_token: env_text("WEBHOOK_VERIFY_TOKEN"),
            history_limit: env_parse("HISTORY_LIMIT").unwrap_or(defaults.history_limit),
            retrieval_top_k: env_parse("RETRIEVAL_TOP_K").unwrap_or(defaults.retrieval_top_k),
            processed_event_ttl: env_secs("PROCESSED_EVENT_TTL_SECS")
                .unwrap_or(defaults.processed_event_ttl),
            platform_timeout: env_secs("PLATFORM_TIMEOUT_SECS")
                .unwrap_or(defaults.platform_timeout),
            profile_timeout: env_secs("PROFILE_TIMEOUT_SECS").unwrap_or(defaults.profile_timeout),
            retrieval_timeout: env_secs("RETRIEVAL_TIMEOUT_SECS")
                .unwrap_or(defaults.retrieval_timeout),
            model_timeout: env_secs("MODEL_TIMEOUT_SECS").unwrap_or(defaults.model_timeout),
            admission_timeout: env_secs("ADMISSION_TIMEOUT_SECS")
                .unwrap_or(defaults.admission_timeout),
            ws_ping_interval: env_secs("WS_PING_INTERVAL_SECS")
                .unwrap_or(defaults.ws_ping_interval),
            ws_read_timeout: env_secs("WS_READ_TIMEOUT_SECS").unwrap_or(defaults.ws_read_timeout),
            ws_queue_capacity: env_parse("WS_QUEUE_CAPACITY")
                .filter(|capacity: &usize| *capacity > 0)
                .unwrap_or(defaults.ws_queue_capacity),
        }
    }
}

fn env_text(key: &str) -> String {
    env::var(key).unwrap_or_default().trim().to_string()
}

fn env_or(key: &str, fallback: &str) -> String {
    let value = env_text(key);
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.trim_end_matches('/').to_string()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

fn resolve_database_url() -> String {
    let url = env_text("DATABASE_URL");
    if !url.is_empty() {
        return url;
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "pagebot".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
