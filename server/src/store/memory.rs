use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::RwLock;

use super::{ConversationStore, PageDirectory, ParticipantStore, ProcessedEventStore};
use crate::error::StoreError;
use crate::types::{
    ConversationRecord, PageConfig, ParticipantKey, ParticipantState, ProcessedEventMarker,
    ReplyAttempt,
};

#[derive(Default)]
pub struct MemoryConversationStore {
    records: RwLock<Vec<ConversationRecord>>,
    attempts: RwLock<Vec<ReplyAttempt>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<ConversationRecord> {
        self.records.read().await.clone()
    }

    pub async fn attempts(&self) -> Vec<ReplyAttempt> {
        self.attempts.read().await.clone()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn append(&self, record: &ConversationRecord) -> Result<(), StoreError> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn recent(
        &self,
        key: &ParticipantKey,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        let records = self.records.read().await;
        let mut matching = records
            .iter()
            .filter(|r| r.participant_id == key.participant_id && r.page_id == key.page_id)
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let start = matching.len().saturating_sub(limit);
        Ok(matching.split_off(start))
    }

    async fn records_for_event(
        &self,
        event_id: &str,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.event_id.as_deref() == Some(event_id))
            .cloned()
            .collect())
    }

    async fn record_reply_attempt(&self, attempt: &ReplyAttempt) -> Result<(), StoreError> {
        self.attempts.write().await.push(attempt.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryParticipantStore {
    states: DashMap<ParticipantKey, ParticipantState>,
}

impl MemoryParticipantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ParticipantStore for MemoryParticipantStore {
    async fn get(&self, key: &ParticipantKey) -> Result<Option<ParticipantState>, StoreError> {
        Ok(self.states.get(key).map(|entry| entry.value().clone()))
    }

    async fn load_or_create(&self, key: &ParticipantKey) -> Result<ParticipantState, StoreError> {
        let entry = self
            .states
            .entry(key.clone())
            .or_insert_with(|| ParticipantState::new(key));
        Ok(entry.value().clone())
    }

    async fn compare_and_swap(
        &self,
        next: &ParticipantState,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        match self.states.entry(next.key()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().version != expected_version {
                    return Ok(false);
                }
                occupied.insert(next.clone());
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Ok(false);
                }
                vacant.insert(next.clone());
                Ok(true)
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryProcessedEventStore {
    markers: DashMap<String, ProcessedEventMarker>,
}

impl MemoryProcessedEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

#[async_trait]
impl ProcessedEventStore for MemoryProcessedEventStore {
    async fn insert_if_absent(
        &self,
        event_id: &str,
        processed_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let marker = ProcessedEventMarker {
            event_id: event_id.to_string(),
            processed_at,
            expires_at,
        };
        match self.markers.entry(event_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > processed_at {
                    return Ok(false);
                }
                occupied.insert(marker);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(marker);
                Ok(true)
            }
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let before = self.markers.len();
        self.markers.retain(|_, marker| marker.expires_at > now);
        Ok(before.saturating_sub(self.markers.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemoryPageDirectory {
    pages: DashMap<String, PageConfig>,
}

impl MemoryPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config: PageConfig) {
        self.pages.insert(config.page_id.clone(), config);
    }
}

#[async_trait]
impl PageDirectory for MemoryPageDirectory {
    async fn page_by_platform_id(&self, page_id: &str) -> Result<Option<PageConfig>, StoreError> {
        Ok(self.pages.get(page_id).map(|entry| entry.value().clone()))
    }
}
