//! Durable signal log shared by replicas.
//!
//! Each replica polls for rows after the last id it has seen and ignores
//! rows it wrote itself.

use crate::codec::{from_millis, to_millis};
use crate::error::Result;
use crate::Store;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
struct SignalRow {
    id: i64,
    kind: String,
    payload: String,
    origin: String,
    created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalRecord {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    /// Replica id of the writer.
    pub origin: String,
    pub created_at: DateTime<Utc>,
}

impl From<SignalRow> for SignalRecord {
    fn from(row: SignalRow) -> Self {
        Self {
            id: row.id,
            kind: row.kind,
            payload: row.payload,
            origin: row.origin,
            created_at: from_millis(row.created_at),
        }
    }
}

impl Store {
    pub async fn insert_signal(&self, kind: &str, payload: &str, origin: &str) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO signals (kind, payload, origin, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(kind)
        .bind(payload)
        .bind(origin)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    /// Signals with an id greater than `after`, oldest first.
    pub async fn list_signals_after(&self, after: i64) -> Result<Vec<SignalRecord>> {
        let rows: Vec<SignalRow> = sqlx::query_as("SELECT * FROM signals WHERE id > ? ORDER BY id")
            .bind(after)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(SignalRecord::from).collect())
    }

    /// Highest signal id, or 0 when the log is empty.
    pub async fn max_signal_id(&self) -> Result<i64> {
        let id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM signals")
            .fetch_one(&self.pool)
            .await?;
        Ok(id.unwrap_or(0))
    }
}
