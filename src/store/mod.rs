//! Durable record of users and messages.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// A relayed chat message. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub sender: String,
    pub receiver: String,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Durable presence of one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub id: String,
    pub online: bool,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_seen: Option<OffsetDateTime>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persists a message and returns it exactly as stored, id included.
    async fn save_message(
        &self,
        sender: &str,
        receiver: &str,
        text: &str,
        created_at: OffsetDateTime,
    ) -> Result<Message, StoreError>;

    async fn set_online(&self, identity: &str, online: bool) -> Result<(), StoreError>;

    async fn set_last_seen(&self, identity: &str, at: OffsetDateTime) -> Result<(), StoreError>;

    /// Conversation between `a` and `b` in either direction, oldest first.
    async fn messages_between(&self, a: &str, b: &str) -> Result<Vec<Message>, StoreError>;

    /// Every message, newest first.
    async fn all_messages(&self) -> Result<Vec<Message>, StoreError>;

    async fn users(&self) -> Result<Vec<UserPresence>, StoreError>;
}

/// Drops sub-millisecond precision, which the store does not keep.
pub fn truncate_to_millis(ts: OffsetDateTime) -> OffsetDateTime {
    ts.replace_nanosecond(ts.nanosecond() / 1_000_000 * 1_000_000)
        .unwrap_or(ts)
}

pub(crate) fn to_millis(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_millis(ms: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map_err(|e| StoreError::CorruptRow(format!("timestamp {ms}: {e}")))
}
