use super::backend::{CatalogBackend, Credentials, Session};
use crate::error::{CatalogError, CatalogResult};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Semaphore, SemaphorePermit};

/// Snapshot of pool accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Upper bound on concurrently lent sessions
    pub max_size: usize,
    /// Sessions currently connected (idle or lent)
    pub open: usize,
    /// Sessions waiting in the pool
    pub idle: usize,
    /// Sessions currently lent out
    pub in_use: usize,
    /// Total successful `acquire` calls
    pub acquisitions: usize,
    /// Total returns (explicit or by drop)
    pub releases: usize,
    /// Total `connect` calls issued to the backend
    pub connects: usize,
}

/// Bounded pool of authenticated sessions
///
/// The pool sits between every catalog operation and the backend. A caller
/// holds one session per in-flight operation; the session goes back to the
/// pool when the guard is released or dropped, so error paths return it too.
/// Sessions are created lazily up to `max_size`.
pub struct SessionPool {
    backend: Arc<dyn CatalogBackend>,
    credentials: Credentials,
    idle: Mutex<Vec<Session>>,
    permits: Semaphore,
    max_size: usize,
    open: AtomicUsize,
    acquisitions: AtomicUsize,
    releases: AtomicUsize,
    connects: AtomicUsize,
    closed: AtomicBool,
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("backend", &"<dyn CatalogBackend>")
            .field("user", &self.credentials.username)
            .field("zone", &self.credentials.zone)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SessionPool {
    /// Create an empty pool that lends at most `max_size` sessions at once
    pub fn new(backend: Arc<dyn CatalogBackend>, credentials: Credentials, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            backend,
            credentials,
            idle: Mutex::new(Vec::with_capacity(max_size)),
            permits: Semaphore::new(max_size),
            max_size,
            open: AtomicUsize::new(0),
            acquisitions: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn zone(&self) -> &str {
        &self.credentials.zone
    }

    pub fn backend(&self) -> &Arc<dyn CatalogBackend> {
        &self.backend
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Borrow a session, waiting while every session is lent out
    ///
    /// # Errors
    ///
    /// `PoolClosed` if the pool is closed before or while waiting, or a
    /// `connect` remote error if a new session had to be opened and failed.
    pub async fn acquire(&self) -> CatalogResult<PooledSession<'_>> {
        if self.is_closed() {
            return Err(CatalogError::PoolClosed);
        }
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CatalogError::PoolClosed)?;

        let reused = self.lock_idle().pop();
        let session = match reused {
            Some(session) => session,
            None => self.connect_new().await?,
        };

        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        Ok(PooledSession {
            pool: self,
            session: Some(session),
            _permit: permit,
        })
    }

    /// Open one session up front so bad credentials surface immediately
    pub async fn warm_up(&self) -> CatalogResult<()> {
        let session = self.acquire().await?;
        session.release();
        Ok(())
    }

    /// Close the pool and disconnect every idle session
    ///
    /// Sessions still lent out are dropped without a disconnect when their
    /// guards go away.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();

        let drained: Vec<Session> = self.lock_idle().drain(..).collect();
        for session in drained {
            let id = session.id();
            if let Err(e) = self.backend.disconnect(session).await {
                tracing::warn!(session = id, error = %e, "failed to disconnect session");
            }
            self.open.fetch_sub(1, Ordering::Relaxed);
        }
        tracing::info!(
            user = %self.credentials.username,
            zone = %self.credentials.zone,
            "session pool closed"
        );
    }

    pub fn stats(&self) -> PoolStats {
        let open = self.open.load(Ordering::Relaxed);
        let idle = self.lock_idle().len();
        PoolStats {
            max_size: self.max_size,
            open,
            idle,
            in_use: open.saturating_sub(idle),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
        }
    }

    async fn connect_new(&self) -> CatalogResult<Session> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        let session = self
            .backend
            .connect(&self.credentials)
            .await
            .map_err(|e| CatalogError::remote("connect", self.credentials.host.as_str(), e))?;
        self.open.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = session.id(), "opened catalog session");
        Ok(session)
    }

    fn give_back(&self, session: Session) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        if self.is_closed() {
            self.open.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!(
                session = session.id(),
                "session returned after pool closed, dropping without disconnect"
            );
            return;
        }
        self.lock_idle().push(session);
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<Session>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A session on loan from a [`SessionPool`]
///
/// Returned to the pool exactly once: by `release` or on drop.
pub struct PooledSession<'a> {
    pool: &'a SessionPool,
    session: Option<Session>,
    // Dropped after `Drop::drop` has pushed the session back
    _permit: SemaphorePermit<'a>,
}

impl PooledSession<'_> {
    pub fn session(&self) -> &Session {
        // Only `Drop` takes the session out
        self.session
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled session used after release"))
    }

    pub fn backend(&self) -> &dyn CatalogBackend {
        self.pool.backend.as_ref()
    }

    pub fn release(self) {}
}

impl fmt::Debug for PooledSession<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("session", &self.session)
            .finish()
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.give_back(session);
        }
    }
}
