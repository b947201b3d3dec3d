//! # SQLite Session Store
//!
//! This module provides [`SqliteSessionStore`], a [`SessionStore`] backed by
//! an SQLite database. Each task has exactly one row holding its serialized
//! [`SessionState`]; a save is a single upsert statement, so a record is
//! either fully replaced or left untouched.
//!
//! Finalized rows are protected in the statement itself: the update branch
//! of the upsert only applies while the stored status is `running`.
//!
//! ## Example
//!
//! ```rust,no_run
//! # use tower_handoff::sqlite_session::SqliteSessionStore;
//! # use tower_handoff::sessions::SessionStore;
//! # async fn run() -> tower_handoff::Result<()> {
//! let store = SqliteSessionStore::new("sessions.db").await?;
//! for id in store.list().await? {
//!     println!("{}", id);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! For tests, [`SqliteSessionStore::new_in_memory`] keeps everything in a
//! single in-memory connection.
//!
//! [`SessionStore`]: crate::sessions::SessionStore

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;

use crate::error::{HandoffError, Result};
use crate::sessions::{SessionState, SessionStore};
use crate::task::TaskId;

/// A [`SessionStore`] that keeps one row per task in SQLite.
pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
}

impl SqliteSessionStore {
    /// Opens (creating if missing) the database at `db_path` and runs
    /// migrations.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory store, useful for testing.
    ///
    /// The pool is limited to one long-lived connection: every SQLite
    /// in-memory connection is its own database.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS handoff_sessions (
                task_id TEXT PRIMARY KEY NOT NULL,
                status TEXT NOT NULL,
                current_handler TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_handoff_sessions_status
            ON handoff_sessions(status)
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, task_id: &TaskId) -> Result<Option<SessionState>> {
        let row = sqlx::query("SELECT state FROM handoff_sessions WHERE task_id = ?")
            .bind(task_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let data: String = row.get("state");
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, state: &SessionState) -> Result<()> {
        let data = serde_json::to_string(state)?;
        let done = sqlx::query(
            r#"
            INSERT INTO handoff_sessions (task_id, status, current_handler, state, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
                status = excluded.status,
                current_handler = excluded.current_handler,
                state = excluded.state,
                updated_at = excluded.updated_at
            WHERE handoff_sessions.status = 'running'
            "#,
        )
        .bind(state.task_id.as_str())
        .bind(state.status.as_str())
        .bind(state.current_handler.as_str())
        .bind(data)
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(HandoffError::Session(format!(
                "session {} is finalized and cannot be overwritten",
                state.task_id
            )));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TaskId>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT task_id FROM handoff_sessions ORDER BY task_id ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(TaskId).collect())
    }
}

impl std::fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSessionStore").finish_non_exhaustive()
    }
}
