//! Persistence seams for the pipeline.
//!
//! Every store has a Postgres implementation used in production and an
//! in-memory implementation used by tests and `STORAGE=memory`.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{ConversationRecord, PageConfig, ParticipantKey, ParticipantState, ReplyAttempt};

pub use memory::{
    MemoryConversationStore, MemoryPageDirectory, MemoryParticipantStore,
    MemoryProcessedEventStore,
};
pub use postgres::{
    PgConversationStore, PgPageDirectory, PgParticipantStore, PgProcessedEventStore,
};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append(&self, record: &ConversationRecord) -> Result<(), StoreError>;

    /// The last `limit` records for the participant on the page, oldest first.
    async fn recent(
        &self,
        key: &ParticipantKey,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>, StoreError>;

    async fn records_for_event(&self, event_id: &str)
        -> Result<Vec<ConversationRecord>, StoreError>;

    async fn record_reply_attempt(&self, attempt: &ReplyAttempt) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ParticipantStore: Send + Sync {
    async fn get(&self, key: &ParticipantKey) -> Result<Option<ParticipantState>, StoreError>;

    async fn load_or_create(&self, key: &ParticipantKey) -> Result<ParticipantState, StoreError>;

    /// Writes `next` only when the stored row is still at `expected_version`.
    async fn compare_and_swap(
        &self,
        next: &ParticipantState,
        expected_version: i64,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    /// Inserts a marker unless a live one exists. Returns true for the winner.
    async fn insert_if_absent(
        &self,
        event_id: &str,
        processed_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait PageDirectory: Send + Sync {
    async fn page_by_platform_id(&self, page_id: &str) -> Result<Option<PageConfig>, StoreError>;
}
