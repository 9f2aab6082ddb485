//! SQLite-backed session store.
//!
//! Stores each session record as a JSON blob keyed by session id. Upserts
//! are single statements, so a save is atomic at the database level. Loads
//! apply the same validation as the file store: a record that fails to
//! parse or validate reads as absent.

use std::task::{Context, Poll};

use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tower::{BoxError, Service};
use tracing::error;

use crate::error::Result;
use crate::session::Session;
use crate::store::{ArchiveSession, LoadSession, SaveSession, SessionStoreHandle};

const MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    record     TEXT NOT NULL,
    archived   INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
)
"#;

type StoreFuture<T> = BoxFuture<'static, std::result::Result<T, BoxError>>;

/// Session store backed by a SQLite database file.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        sqlx::query(MIGRATION).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. Pinned to one connection because each
    /// pooled connection would otherwise see its own empty database.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query(MIGRATION).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn handle(&self) -> SessionStoreHandle {
        SessionStoreHandle::from_store(self.clone())
    }
}

impl Service<LoadSession> for SqliteSessionStore {
    type Response = Option<Session>;
    type Error = BoxError;
    type Future = StoreFuture<Option<Session>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: LoadSession) -> Self::Future {
        let pool = self.pool.clone();
        Box::pin(async move {
            let row = sqlx::query("SELECT record FROM sessions WHERE session_id = ?")
                .bind(req.session_id.as_str())
                .fetch_optional(&pool)
                .await?;
            let Some(row) = row else { return Ok(None) };
            let record: String = row.get("record");
            let session: Session = match serde_json::from_str(&record) {
                Ok(s) => s,
                Err(e) => {
                    error!(session_id = %req.session_id, error = %e, "corrupt session record; treating as absent");
                    return Ok(None);
                }
            };
            match session.validate() {
                Ok(()) => Ok(Some(session)),
                Err(reason) => {
                    error!(session_id = %req.session_id, %reason, "stored session failed validation; treating as absent");
                    Ok(None)
                }
            }
        })
    }
}

impl Service<SaveSession> for SqliteSessionStore {
    type Response = ();
    type Error = BoxError;
    type Future = StoreFuture<()>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: SaveSession) -> Self::Future {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = serde_json::to_string(&req.session)?;
            sqlx::query(
                "INSERT INTO sessions (session_id, record, archived, updated_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(session_id) DO UPDATE SET
                     record = excluded.record,
                     archived = excluded.archived,
                     updated_at = excluded.updated_at",
            )
            .bind(req.session.session_id.as_str())
            .bind(&record)
            .bind(req.session.archived as i64)
            .bind(req.session.updated_at.to_rfc3339())
            .execute(&pool)
            .await?;
            Ok(())
        })
    }
}

impl Service<ArchiveSession> for SqliteSessionStore {
    type Response = ();
    type Error = BoxError;
    type Future = StoreFuture<()>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ArchiveSession) -> Self::Future {
        let pool = self.pool.clone();
        Box::pin(async move {
            let mut tx = pool.begin().await?;
            let row = sqlx::query("SELECT record FROM sessions WHERE session_id = ?")
                .bind(req.session_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else {
                tx.commit().await?;
                return Ok(());
            };
            let record: String = row.get("record");
            let mut session: Session = serde_json::from_str(&record)?;
            session.archived = true;
            session.touch();
            sqlx::query(
                "UPDATE sessions SET record = ?, archived = 1, updated_at = ? WHERE session_id = ?",
            )
            .bind(serde_json::to_string(&session)?)
            .bind(session.updated_at.to_rfc3339())
            .bind(req.session_id.as_str())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;

    fn session(id: &str) -> Session {
        let mut s = Session::new(SessionId::from(id));
        s.push_agent("triage");
        s
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let store = SqliteSessionStore::new_in_memory().await.unwrap();
        let mut handle = store.handle();
        handle.save(session("s1")).await.unwrap();
        let loaded = handle.load(SessionId::from("s1")).await.unwrap().unwrap();
        assert_eq!(loaded.current_agent.as_deref(), Some("triage"));
    }

    #[tokio::test]
    async fn upsert_replaces_existing_record() {
        let store = SqliteSessionStore::new_in_memory().await.unwrap();
        let mut handle = store.handle();
        let mut s = session("s2");
        handle.save(s.clone()).await.unwrap();
        s.push_agent("security_specialist");
        handle.save(s).await.unwrap();
        let loaded = handle.load(SessionId::from("s2")).await.unwrap().unwrap();
        assert_eq!(loaded.handoff_chain.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_record_reads_as_absent() {
        let store = SqliteSessionStore::new_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO sessions (session_id, record, archived, updated_at) VALUES (?, ?, 0, ?)",
        )
        .bind("bad")
        .bind("{ not json")
        .bind("2026-01-01T00:00:00Z")
        .execute(&store.pool)
        .await
        .unwrap();
        let mut handle = store.handle();
        assert!(handle.load(SessionId::from("bad")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn archive_marks_record_and_tolerates_missing() {
        let store = SqliteSessionStore::new_in_memory().await.unwrap();
        let mut handle = store.handle();
        handle.save(session("s3")).await.unwrap();
        handle.archive(SessionId::from("s3")).await.unwrap();
        let loaded = handle.load(SessionId::from("s3")).await.unwrap().unwrap();
        assert!(loaded.archived);

        handle.archive(SessionId::from("missing")).await.unwrap();
    }
}
