use async_trait::async_trait;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::{ChatStore, Message, StoreError, UserPresence, from_millis, to_millis, truncate_to_millis};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        is_online INTEGER NOT NULL DEFAULT 0,
        last_seen INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        sender TEXT NOT NULL,
        receiver TEXT NOT NULL,
        text TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS messages_pair ON messages (sender, receiver, created_at)",
];

type MessageRow = (String, String, String, String, i64);

/// SQLite-backed [`ChatStore`]. Timestamps are unix milliseconds.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        info!(url, max_connections, "sqlite pool ready");
        Self::from_pool(pool).await
    }

    /// Private database living as long as the store. Every connection to
    /// `sqlite::memory:` is a separate database, so the pool pins one.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }
}

fn message_from_row((id, sender, receiver, text, created_at): MessageRow) -> Result<Message, StoreError> {
    Ok(Message {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::CorruptRow(format!("message id {id}: {e}")))?,
        sender,
        receiver,
        text,
        created_at: from_millis(created_at)?,
    })
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn save_message(
        &self,
        sender: &str,
        receiver: &str,
        text: &str,
        created_at: OffsetDateTime,
    ) -> Result<Message, StoreError> {
        let id = Uuid::now_v7();
        let created_at = truncate_to_millis(created_at);
        sqlx::query("INSERT INTO messages (id,sender,receiver,text,created_at) VALUES (?,?,?,?,?)")
            .bind(id.to_string())
            .bind(sender)
            .bind(receiver)
            .bind(text)
            .bind(to_millis(created_at))
            .execute(&self.pool)
            .await?;

        Ok(Message {
            id,
            sender: sender.to_owned(),
            receiver: receiver.to_owned(),
            text: text.to_owned(),
            created_at,
        })
    }

    async fn set_online(&self, identity: &str, online: bool) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (id,is_online) VALUES (?,?) \
             ON CONFLICT(id) DO UPDATE SET is_online=excluded.is_online",
        )
        .bind(identity)
        .bind(online)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_last_seen(&self, identity: &str, at: OffsetDateTime) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (id,last_seen) VALUES (?,?) \
             ON CONFLICT(id) DO UPDATE SET last_seen=excluded.last_seen",
        )
        .bind(identity)
        .bind(to_millis(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn messages_between(&self, a: &str, b: &str) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id,sender,receiver,text,created_at FROM messages \
             WHERE (sender=? AND receiver=?) OR (sender=? AND receiver=?) \
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn all_messages(&self) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id,sender,receiver,text,created_at FROM messages ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn users(&self) -> Result<Vec<UserPresence>, StoreError> {
        let rows: Vec<(String, bool, Option<i64>)> =
            sqlx::query_as("SELECT id,is_online,last_seen FROM users ORDER BY id")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(id, online, last_seen)| -> Result<UserPresence, StoreError> {
                Ok(UserPresence {
                    id,
                    online,
                    last_seen: last_seen.map(from_millis).transpose()?,
                })
            })
            .collect()
    }
}
