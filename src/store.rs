//! Session persistence.
//!
//! What this module provides
//! - Store request types (`LoadSession`, `SaveSession`, `ArchiveSession`)
//!   and two backends: an in-memory store for tests/embedding and a
//!   file-per-session JSON store with atomic writes
//! - `SessionStoreHandle`, the boxed handle the orchestrator holds so it
//!   never cares which backend is behind it
//!
//! Implementation strategy
//! - Each backend implements `tower::Service` once per request type, so
//!   stores compose with layers the same way agents do
//! - File writes are temp-file + rename on the same filesystem, which makes
//!   a crash leave either the old record or the new one, never a torn file
//! - Loads validate the record; a corrupt or schema-mismatched record is
//!   logged and reported as absent, so callers recover with a fresh session
//! - Writes to the same session are serialized through a per-id async lock;
//!   lock entries are evicted once released, so the table only holds
//!   in-flight sessions
//!
//! Testing strategy
//! - In-memory store covers the Service plumbing; file-store behavior
//!   (atomicity, corrupt records, stray temp files) lives in
//!   `tests/store_atomicity.rs` against `tempfile` directories

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt};
use tracing::error;
use uuid::Uuid;

use crate::session::{Session, SessionId};

/// Request: load a session by id. Resolves to `None` when the record is
/// missing or fails validation.
#[derive(Debug, Clone)]
pub struct LoadSession {
    pub session_id: SessionId,
}

/// Request: persist a session record.
#[derive(Debug, Clone)]
pub struct SaveSession {
    pub session: Session,
}

/// Request: mark a session archived. A no-op when the session does not
/// exist.
#[derive(Debug, Clone)]
pub struct ArchiveSession {
    pub session_id: SessionId,
}

type StoreFuture<T> = BoxFuture<'static, Result<T, BoxError>>;

type LockTable = Arc<Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>>;

/// Per-session async locks. An entry is evicted when the last outstanding
/// handle for its session drops, so the map stays proportional to the
/// number of in-flight sessions rather than every session ever seen.
#[derive(Clone, Default)]
pub(crate) struct SessionLockMap {
    locks: LockTable,
}

impl SessionLockMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the lock handle for `id`.
    pub(crate) fn acquire(&self, id: &SessionId) -> SessionLock {
        let lock = self
            .locks
            .lock()
            .unwrap()
            .entry(id.clone())
            .or_default()
            .clone();
        SessionLock {
            map: Arc::clone(&self.locks),
            id: id.clone(),
            lock,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

/// Handle to one session's lock.
pub(crate) struct SessionLock {
    map: LockTable,
    id: SessionId,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl SessionLock {
    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap();
        if let Some(entry) = map.get(&self.id) {
            // One count held by the map entry, one by this handle; anything
            // above that means another handle is still live.
            if Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(entry) <= 2 {
                map.remove(&self.id);
            }
        }
    }
}

/// Boxed store handle held by the orchestrator.
#[derive(Clone)]
pub struct SessionStoreHandle {
    load: BoxCloneService<LoadSession, Option<Session>, BoxError>,
    save: BoxCloneService<SaveSession, (), BoxError>,
    archive: BoxCloneService<ArchiveSession, (), BoxError>,
}

impl SessionStoreHandle {
    /// Box any backend that serves all three request types.
    pub fn from_store<S>(store: S) -> Self
    where
        S: Service<LoadSession, Response = Option<Session>, Error = BoxError>
            + Service<SaveSession, Response = (), Error = BoxError>
            + Service<ArchiveSession, Response = (), Error = BoxError>
            + Clone
            + Send
            + 'static,
        <S as Service<LoadSession>>::Future: Send,
        <S as Service<SaveSession>>::Future: Send,
        <S as Service<ArchiveSession>>::Future: Send,
    {
        Self {
            load: BoxCloneService::new(store.clone()),
            save: BoxCloneService::new(store.clone()),
            archive: BoxCloneService::new(store),
        }
    }

    pub async fn load(&mut self, session_id: SessionId) -> Result<Option<Session>, BoxError> {
        let mut svc = self.load.clone();
        svc.ready().await?.call(LoadSession { session_id }).await
    }

    pub async fn save(&mut self, session: Session) -> Result<(), BoxError> {
        let mut svc = self.save.clone();
        svc.ready().await?.call(SaveSession { session }).await
    }

    pub async fn archive(&mut self, session_id: SessionId) -> Result<(), BoxError> {
        let mut svc = self.archive.clone();
        svc.ready()
            .await?
            .call(ArchiveSession { session_id })
            .await
    }
}

/// In-memory store backed by a shared map. Suited to tests and embedded
/// use; contents vanish with the process.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<Mutex<HashMap<SessionId, Session>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> SessionStoreHandle {
        SessionStoreHandle::from_store(self.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }
}

impl Service<LoadSession> for InMemorySessionStore {
    type Response = Option<Session>;
    type Error = BoxError;
    type Future = StoreFuture<Option<Session>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: LoadSession) -> Self::Future {
        let sessions = self.sessions.clone();
        Box::pin(async move {
            let found = sessions.lock().unwrap().get(&req.session_id).cloned();
            match found {
                Some(s) => match s.validate() {
                    Ok(()) => Ok(Some(s)),
                    Err(reason) => {
                        error!(session_id = %req.session_id, %reason, "stored session failed validation; treating as absent");
                        Ok(None)
                    }
                },
                None => Ok(None),
            }
        })
    }
}

impl Service<SaveSession> for InMemorySessionStore {
    type Response = ();
    type Error = BoxError;
    type Future = StoreFuture<()>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: SaveSession) -> Self::Future {
        let sessions = self.sessions.clone();
        Box::pin(async move {
            sessions
                .lock()
                .unwrap()
                .insert(req.session.session_id.clone(), req.session);
            Ok(())
        })
    }
}

impl Service<ArchiveSession> for InMemorySessionStore {
    type Response = ();
    type Error = BoxError;
    type Future = StoreFuture<()>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ArchiveSession) -> Self::Future {
        let sessions = self.sessions.clone();
        Box::pin(async move {
            if let Some(s) = sessions.lock().unwrap().get_mut(&req.session_id) {
                s.archived = true;
                s.touch();
            }
            Ok(())
        })
    }
}

/// File-per-session JSON store.
///
/// Each session lives at `<dir>/<sanitized-id>.json`. Saves write a unique
/// temp file in the same directory and rename it over the target, so
/// readers never observe a partial record.
#[derive(Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
    locks: SessionLockMap,
}

impl FileSessionStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: SessionLockMap::new(),
        })
    }

    pub fn handle(&self) -> SessionStoreHandle {
        SessionStoreHandle::from_store(self.clone())
    }

    fn path_for(&self, id: &SessionId) -> PathBuf {
        let sanitized: String = id
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        self.dir.join(format!("{sanitized}.json"))
    }

    async fn write_atomic(&self, session: &Session) -> Result<(), BoxError> {
        let target = self.path_for(&session.session_id);
        let tmp = self
            .dir
            .join(format!("{}.tmp-{}", uuid_stem(&target), Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&tmp, &bytes).await?;
        match tokio::fs::rename(&tmp, &target).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e.into())
            }
        }
    }
}

fn uuid_stem(target: &std::path::Path) -> String {
    target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "session".to_string())
}

impl Service<LoadSession> for FileSessionStore {
    type Response = Option<Session>;
    type Error = BoxError;
    type Future = StoreFuture<Option<Session>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: LoadSession) -> Self::Future {
        let store = self.clone();
        Box::pin(async move {
            let path = store.path_for(&req.session_id);
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let session: Session = match serde_json::from_slice(&bytes) {
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

impl Service<SaveSession> for FileSessionStore {
    type Response = ();
    type Error = BoxError;
    type Future = StoreFuture<()>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: SaveSession) -> Self::Future {
        let store = self.clone();
        Box::pin(async move {
            let lock = store.locks.acquire(&req.session.session_id);
            let _guard = lock.lock().await;
            store.write_atomic(&req.session).await
        })
    }
}

impl Service<ArchiveSession> for FileSessionStore {
    type Response = ();
    type Error = BoxError;
    type Future = StoreFuture<()>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ArchiveSession) -> Self::Future {
        let mut loader = self.clone();
        let store = self.clone();
        Box::pin(async move {
            let lock = store.locks.acquire(&req.session_id);
            let _guard = lock.lock().await;
            let loaded = ServiceExt::<LoadSession>::ready(&mut loader)
                .await?
                .call(LoadSession {
                    session_id: req.session_id,
                })
                .await?;
            match loaded {
                Some(mut session) => {
                    session.archived = true;
                    session.touch();
                    store.write_atomic(&session).await
                }
                None => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> Session {
        let mut s = Session::new(SessionId::from(id));
        s.push_agent("triage");
        s
    }

    #[tokio::test]
    async fn in_memory_roundtrip() {
        let mut handle = InMemorySessionStore::new().handle();
        handle.save(session("s1")).await.unwrap();
        let loaded = handle.load(SessionId::from("s1")).await.unwrap().unwrap();
        assert_eq!(loaded.current_agent.as_deref(), Some("triage"));
    }

    #[tokio::test]
    async fn in_memory_missing_is_none() {
        let mut handle = InMemorySessionStore::new().handle();
        assert!(handle.load(SessionId::from("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn in_memory_invalid_record_reads_as_absent() {
        let store = InMemorySessionStore::new();
        let mut bad = session("s2");
        bad.current_agent = Some("someone_else".to_string());
        store
            .sessions
            .lock()
            .unwrap()
            .insert(bad.session_id.clone(), bad);
        let mut handle = store.handle();
        assert!(handle.load(SessionId::from("s2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn in_memory_archive_is_idempotent() {
        let store = InMemorySessionStore::new();
        let mut handle = store.handle();
        handle.save(session("s3")).await.unwrap();
        handle.archive(SessionId::from("s3")).await.unwrap();
        handle.archive(SessionId::from("s3")).await.unwrap();
        let loaded = handle.load(SessionId::from("s3")).await.unwrap().unwrap();
        assert!(loaded.archived);

        // Archiving a missing session is a no-op, not an error.
        handle.archive(SessionId::from("missing")).await.unwrap();
    }

    #[tokio::test]
    async fn lock_map_evicts_released_sessions() {
        let map = SessionLockMap::new();
        let a = map.acquire(&SessionId::from("s1"));
        let b = map.acquire(&SessionId::from("s1"));
        let c = map.acquire(&SessionId::from("s2"));
        assert_eq!(map.len(), 2);

        drop(a);
        assert_eq!(map.len(), 2);
        drop(b);
        assert_eq!(map.len(), 1);
        drop(c);
        assert_eq!(map.len(), 0);

        // A fresh handle after eviction still serializes normally.
        let d = map.acquire(&SessionId::from("s1"));
        let _guard = d.lock().await;
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn file_store_releases_session_locks_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        let mut handle = store.handle();
        for i in 0..8 {
            handle.save(session(&format!("conv-{i}"))).await.unwrap();
        }
        handle.archive(SessionId::from("conv-0")).await.unwrap();
        assert_eq!(store.locks.len(), 0);
    }

    #[test]
    fn path_sanitization_strips_separators() {
        let dir = std::env::temp_dir();
        let store = FileSessionStore::new(&dir).unwrap();
        let path = store.path_for(&SessionId::from("../../etc/passwd"));
        assert_eq!(path.parent().unwrap(), dir.as_path());
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "..-..-etc-passwd.json"
        );
    }
}
