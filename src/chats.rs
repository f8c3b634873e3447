//! Chat-session persistence over SQLite.
//!
//! Sessions belong to a `user_id` and hold an ordered list of user/assistant
//! messages. The store is a thin layer over the pool; question answering
//! happens elsewhere and only the resulting turns are persisted here.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Title assigned until the first message arrives.
const DEFAULT_TITLE: &str = "Nuevo chat";
/// Titles are derived from the first message, truncated to this many chars.
const TITLE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatDetail {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ChatStore {
    pool: SqlitePool,
}

impl ChatStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a session, optionally seeded with a first user message (which
    /// also becomes the title).
    pub async fn create(&self, user_id: &str, first_message: Option<&str>) -> Result<ChatDetail> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let title = match first_message {
            Some(msg) => truncate_title(msg),
            None => DEFAULT_TITLE.to_string(),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO chat_sessions (id, user_id, title, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(&title)
        .bind(now.timestamp())
        .bind(now.timestamp())
        .execute(&mut *tx)
        .await?;

        if let Some(msg) = first_message {
            Self::insert_message(&mut tx, &id, 0, "user", msg, now).await?;
        }
        tx.commit().await?;

        self.get(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Chat session vanished after insert"))
    }

    /// Session summaries for a user, most recently updated first.
    pub async fn list(&self, user_id: &str) -> Result<Vec<ChatSummary>> {
        let rows = sqlx::query(
            "SELECT id, title, created_at, updated_at FROM chat_sessions WHERE user_id = ? ORDER BY updated_at DESC, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ChatSummary {
                id: row.get("id"),
                title: row.get("title"),
                created_at: from_unix(row.get("created_at")),
                updated_at: from_unix(row.get("updated_at")),
            })
            .collect())
    }

    /// Full session with messages, or `None` if the id is unknown.
    pub async fn get(&self, id: &str) -> Result<Option<ChatDetail>> {
        let session = sqlx::query(
            "SELECT id, user_id, title, created_at, updated_at FROM chat_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(session) = session else {
            return Ok(None);
        };

        let rows = sqlx::query(
            "SELECT role, content, ts FROM chat_messages WHERE session_id = ? ORDER BY seq",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .into_iter()
            .map(|row| ChatMessage {
                role: row.get("role"),
                content: row.get("content"),
                ts: from_unix(row.get("ts")),
            })
            .collect();

        Ok(Some(ChatDetail {
            id: session.get("id"),
            user_id: session.get("user_id"),
            title: session.get("title"),
            messages,
            created_at: from_unix(session.get("created_at")),
            updated_at: from_unix(session.get("updated_at")),
        }))
    }

    /// Append a user question and its assistant answer to an existing
    /// session owned by `user_id`. Returns `false` when no such session.
    ///
    /// The whole exchange runs in one transaction so concurrent appends to
    /// the same session cannot race on `seq`.
    pub async fn append_exchange(
        &self,
        id: &str,
        user_id: &str,
        question: &str,
        answer: &str,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Opening with a write both checks ownership and takes the write
        // lock, so the seq read below cannot interleave with another append.
        let touched = sqlx::query(
            "UPDATE chat_sessions SET updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(now.timestamp())
        .bind(id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            return Ok(false);
        }

        let next_seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM chat_messages WHERE session_id = ?",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        Self::insert_message(&mut tx, id, next_seq, "user", question, now).await?;
        Self::insert_message(&mut tx, id, next_seq + 1, "assistant", answer, now).await?;

        // A session created without a first message inherits its title from
        // the first question asked in it.
        sqlx::query("UPDATE chat_sessions SET title = ? WHERE id = ? AND title = ?")
            .bind(truncate_title(question))
            .bind(id)
            .bind(DEFAULT_TITLE)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Delete a session and its messages. Returns `false` when not found.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_message(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        session_id: &str,
        seq: i64,
        role: &str,
        content: &str,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_messages (id, session_id, seq, role, content, ts) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(seq)
        .bind(role)
        .bind(content)
        .bind(ts.timestamp())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn truncate_title(message: &str) -> String {
    let title: String = message.chars().take(TITLE_MAX_CHARS).collect();
    if title.trim().is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title
    }
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
