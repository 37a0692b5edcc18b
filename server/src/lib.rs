pub mod app;
pub mod assignment;
pub mod config;
pub mod context;
pub mod delivery;
pub mod error;
pub mod idempotency;
pub mod keyed_lock;
pub mod llm;
pub mod platform;
pub mod prompting;
pub mod realtime;
pub mod reply;
pub mod retrieval;
pub mod router;
pub mod store;
pub mod types;
pub mod webhook;
pub mod ws;
