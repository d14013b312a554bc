//! SQLite store for changeflow.
//!
//! The store is the sole source of truth. Each entity module adds an
//! `impl Store` block with typed reads and writes; composites that must
//! commit together (grant completion, rollout creation, database transfer)
//! run inside a single transaction and never touch the pool while the
//! transaction is open.

pub mod catalog;
pub mod codec;
pub mod comment;
pub mod error;
pub mod grant;
pub mod issue;
pub mod plan;
pub mod project;
pub mod rollout;
mod schema;
pub mod signal;

pub use codec::{now_millis, sha256_hex};
pub use comment::NewIssueComment;
pub use error::{DbError, Result};
pub use grant::{AccessGrantFind, NewAccessGrant};
pub use issue::{IssueFind, NewIssue, TaskKind};
pub use plan::{NewPlan, NewPlanCheckRun, PlanFind};
pub use rollout::{NewTask, NewTaskRun};
pub use signal::SignalRecord;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const WORKSPACE_KEY_SETTING: &str = "workspace_secret_key";

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    secret_key: Vec<u8>,
}

impl Store {
    /// Opens (creating if needed) the database file and applies the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        // SQLite admits one writer; one connection serialises all access.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        for statement in schema::SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        let secret_key = load_or_create_key(&pool).await?;

        info!(path = %path.display(), "Database opened");
        Ok(Self { pool, secret_key })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn secret_key(&self) -> &[u8] {
        &self.secret_key
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn load_or_create_key(pool: &SqlitePool) -> Result<Vec<u8>> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT value FROM settings WHERE name = ?")
            .bind(WORKSPACE_KEY_SETTING)
            .fetch_optional(pool)
            .await?;
    if let Some(key) = existing {
        return Ok(key.into_bytes());
    }
    let seed = format!(
        "{}:{}:{:?}",
        std::process::id(),
        now_millis(),
        std::time::SystemTime::now()
    );
    let key = sha256_hex(&seed);
    sqlx::query("INSERT OR IGNORE INTO settings (name, value) VALUES (?, ?)")
        .bind(WORKSPACE_KEY_SETTING)
        .bind(&key)
        .execute(pool)
        .await?;
    let stored: String = sqlx::query_scalar("SELECT value FROM settings WHERE name = ?")
        .bind(WORKSPACE_KEY_SETTING)
        .fetch_one(pool)
        .await?;
    Ok(stored.into_bytes())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub async fn open_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.db")).await.unwrap();
        (store, dir)
    }
}
