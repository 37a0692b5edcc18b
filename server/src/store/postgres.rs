use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};

use super::{ConversationStore, PageDirectory, ParticipantStore, ProcessedEventStore};
use crate::error::StoreError;
use crate::types::{
    iso, AuthorKind, Channel, ConversationRecord, Direction, PageConfig, ParticipantKey,
    ParticipantState, ReplyAttempt,
};

fn parse_record_row(row: PgRow) -> Result<ConversationRecord, StoreError> {
    let channel: String = row.try_get("channel")?;
    let direction: String = row.try_get("direction")?;
    let author: String = row.try_get("author")?;
    Ok(ConversationRecord {
        id: row.try_get("id")?,
        participant_id: row.try_get("participant_id")?,
        page_id: row.try_get("page_id")?,
        channel: Channel::parse(&channel)
            .ok_or_else(|| StoreError::Corrupt(format!("channel '{channel}'")))?,
        direction: Direction::parse(&direction)
            .ok_or_else(|| StoreError::Corrupt(format!("direction '{direction}'")))?,
        author: AuthorKind::parse(&author)
            .ok_or_else(|| StoreError::Corrupt(format!("author '{author}'")))?,
        text: row.try_get("text")?,
        created_at: row.try_get("created_at")?,
        operator_id: row.try_get("operator_id")?,
        operator_name: row.try_get("operator_name")?,
        event_id: row.try_get("event_id")?,
        delivery_id: row.try_get("delivery_id")?,
    })
}

fn parse_participant_row(row: PgRow) -> Result<ParticipantState, StoreError> {
    Ok(ParticipantState {
        participant_id: row.try_get("participant_id")?,
        page_id: row.try_get("page_id")?,
        awaiting_human: row.try_get("awaiting_human")?,
        assigned_operator_id: row.try_get("assigned_operator_id")?,
        assigned_operator_name: row.try_get("assigned_operator_name")?,
        assigned_at: row.try_get("assigned_at")?,
        bot_stopped: row.try_get("bot_stopped")?,
        version: row.try_get("version")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const RECORD_COLUMNS: &str = "id, participant_id, page_id, channel, direction, author, text, \
     created_at, operator_id, operator_name, event_id, delivery_id";

const PARTICIPANT_COLUMNS: &str = "participant_id, page_id, awaiting_human, assigned_operator_id, \
     assigned_operator_name, assigned_at, bot_stopped, version, updated_at";

pub struct PgConversationStore {
    db: PgPool,
}

impl PgConversationStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn append(&self, record: &ConversationRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO conversation_records (
                id, participant_id, page_id, channel, direction, author, text, created_at,
                operator_id, operator_name, event_id, delivery_id
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&record.participant_id)
        .bind(&record.page_id)
        .bind(record.channel.as_str())
        .bind(record.direction.as_str())
        .bind(record.author.as_str())
        .bind(&record.text)
        .bind(&record.created_at)
        .bind(&record.operator_id)
        .bind(&record.operator_name)
        .bind(&record.event_id)
        .bind(&record.delivery_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn recent(
        &self,
        key: &ParticipantKey,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM conversation_records \
             WHERE page_id = $1 AND participant_id = $2 \
             ORDER BY created_at DESC LIMIT $3"
        ))
        .bind(&key.page_id)
        .bind(&key.participant_id)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;
        let mut records = rows
            .into_iter()
            .map(parse_record_row)
            .collect::<Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }

    async fn records_for_event(
        &self,
        event_id: &str,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM conversation_records \
             WHERE event_id = $1 ORDER BY created_at ASC"
        ))
        .bind(event_id)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(parse_record_row).collect()
    }

    async fn record_reply_attempt(&self, attempt: &ReplyAttempt) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reply_attempts (
                event_id, participant_id, page_id, channel, delivered, delivery_id,
                wants_human, used_fallback, error, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            "#,
        )
        .bind(&attempt.event_id)
        .bind(&attempt.participant_id)
        .bind(&attempt.page_id)
        .bind(attempt.channel.as_str())
        .bind(attempt.delivered)
        .bind(&attempt.delivery_id)
        .bind(attempt.wants_human)
        .bind(attempt.used_fallback)
        .bind(&attempt.error)
        .bind(&attempt.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

pub struct PgParticipantStore {
    db: PgPool,
}

impl PgParticipantStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ParticipantStore for PgParticipantStore {
    async fn get(&self, key: &ParticipantKey) -> Result<Option<ParticipantState>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participant_states \
             WHERE participant_id = $1 AND page_id = $2"
        ))
        .bind(&key.participant_id)
        .bind(&key.page_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(parse_participant_row).transpose()
    }

    async fn load_or_create(&self, key: &ParticipantKey) -> Result<ParticipantState, StoreError> {
        let fresh = ParticipantState::new(key);
        sqlx::query(
            "INSERT INTO participant_states (participant_id, page_id, updated_at) \
             VALUES ($1, $2, $3) ON CONFLICT (participant_id, page_id) DO NOTHING",
        )
        .bind(&fresh.participant_id)
        .bind(&fresh.page_id)
        .bind(&fresh.updated_at)
        .execute(&self.db)
        .await?;
        Ok(self.get(key).await?.unwrap_or(fresh))
    }

    async fn compare_and_swap(
        &self,
        next: &ParticipantState,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE participant_states SET
                awaiting_human = $1,
                assigned_operator_id = $2,
                assigned_operator_name = $3,
                assigned_at = $4,
                bot_stopped = $5,
                version = $6,
                updated_at = $7
            WHERE participant_id = $8 AND page_id = $9 AND version = $10
            "#,
        )
        .bind(next.awaiting_human)
        .bind(&next.assigned_operator_id)
        .bind(&next.assigned_operator_name)
        .bind(&next.assigned_at)
        .bind(next.bot_stopped)
        .bind(next.version)
        .bind(&next.updated_at)
        .bind(&next.participant_id)
        .bind(&next.page_id)
        .bind(expected_version)
        .execute(&self.db)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }
}

pub struct PgProcessedEventStore {
    db: PgPool,
}

impl PgProcessedEventStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ProcessedEventStore for PgProcessedEventStore {
    async fn insert_if_absent(
        &self,
        event_id: &str,
        processed_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // An expired marker is overwritten; a live one makes the conflict a no-op.
        let affected = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, processed_at, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO UPDATE SET
                processed_at = EXCLUDED.processed_at,
                expires_at = EXCLUDED.expires_at
            WHERE processed_events.expires_at <= EXCLUDED.processed_at
            "#,
        )
        .bind(event_id)
        .bind(iso(processed_at))
        .bind(iso(expires_at))
        .execute(&self.db)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let affected = sqlx::query("DELETE FROM processed_events WHERE expires_at <= $1")
            .bind(iso(now))
            .execute(&self.db)
            .await?
            .rows_affected();
        Ok(affected)
    }
}

pub struct PgPageDirectory {
    db: PgPool,
}

impl PgPageDirectory {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PageDirectory for PgPageDirectory {
    async fn page_by_platform_id(&self, page_id: &str) -> Result<Option<PageConfig>, StoreError> {
        let row = sqlx::query("SELECT tenant_id, config FROM pages WHERE page_id = $1")
            .bind(page_id)
            .fetch_optional(&self.db)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let tenant_id: String = row.try_get("tenant_id")?;
        let Json(mut config) = row.try_get::<Json<PageConfig>, _>("config")?;
        config.tenant_id = tenant_id;
        config.page_id = page_id.to_string();
        Ok(Some(config))
    }
}
