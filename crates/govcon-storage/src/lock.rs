//! Fleet-wide mutual exclusion keyed by 64-bit integers.
//!
//! The Postgres implementation holds a session-level advisory lock on a
//! dedicated pooled connection for the lifetime of the guard. A guard that is
//! dropped without `release` closes that connection instead of returning it to
//! the pool, so the server frees the lock with the session.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::{debug, warn};

const ACQUIRE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey(pub i64);

impl LockKey {
    pub const INGESTION: LockKey = LockKey(1);
    pub const BACKFILL: LockKey = LockKey(2);

    /// Per-notice key: first 8 bytes of SHA-256 read big-endian, sign bit cleared.
    pub fn for_notice(notice_id: &str) -> Self {
        let digest = Sha256::digest(notice_id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        LockKey(i64::from_be_bytes(prefix) & i64::MAX)
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait LockLease: Send {
    async fn release(&mut self) -> anyhow::Result<()>;
    /// Called from `Drop`; must not block.
    fn abandon(&mut self);
}

#[must_use = "dropping a guard without release abandons the lock"]
pub struct LockGuard {
    key: LockKey,
    lease: Option<Box<dyn LockLease>>,
}

impl LockGuard {
    pub fn new(key: LockKey, lease: Box<dyn LockLease>) -> Self {
        Self {
            key,
            lease: Some(lease),
        }
    }

    pub fn key(&self) -> LockKey {
        self.key
    }

    pub async fn release(mut self) -> anyhow::Result<()> {
        match self.lease.take() {
            Some(mut lease) => lease.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(mut lease) = self.lease.take() {
            warn!(key = %self.key, "lock guard dropped without release");
            lease.abandon();
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

#[async_trait]
pub trait DistributedMutex: Send + Sync {
    /// Returns `None` when another holder owns the key.
    async fn try_acquire(&self, key: LockKey) -> anyhow::Result<Option<LockGuard>>;

    async fn acquire(&self, key: LockKey) -> anyhow::Result<LockGuard> {
        loop {
            if let Some(guard) = self.try_acquire(key).await? {
                return Ok(guard);
            }
            tokio::time::sleep(ACQUIRE_POLL).await;
        }
    }
}

/// Runs `f` under `key`. Returns `Ok(None)` without running it when the key is held elsewhere.
pub async fn with_lock<T, F, Fut>(mutex: &dyn DistributedMutex, key: LockKey, f: F) -> anyhow::Result<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let Some(guard) = mutex.try_acquire(key).await? else {
        debug!(%key, "lock busy");
        return Ok(None);
    };
    let result = f().await;
    let released = guard.release().await;
    let value = result?;
    released?;
    Ok(Some(value))
}

#[derive(Debug, Clone)]
pub struct PgAdvisoryMutex {
    pool: PgPool,
}

impl PgAdvisoryMutex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedMutex for PgAdvisoryMutex {
    async fn try_acquire(&self, key: LockKey) -> anyhow::Result<Option<LockGuard>> {
        let mut conn = self.pool.acquire().await.context("acquiring lock connection")?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key.0)
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("pg_try_advisory_lock({key})"))?;

        if !acquired {
            return Ok(None);
        }
        Ok(Some(LockGuard::new(key, Box::new(PgLease { key, conn: Some(conn) }))))
    }
}

struct PgLease {
    key: LockKey,
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl LockLease for PgLease {
    async fn release(&mut self) -> anyhow::Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let unlocked: Result<bool, sqlx::Error> = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(self.key.0)
            .fetch_one(&mut *conn)
            .await;
        match unlocked {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(key = %self.key, "advisory lock was not held at release");
                Ok(())
            }
            Err(err) => {
                // The session may still hold the lock; never hand it back to the pool.
                drop(conn.detach());
                Err(err).with_context(|| format!("pg_advisory_unlock({})", self.key))
            }
        }
    }

    fn abandon(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

/// Process-local mutex with the same contract, for tests and single-node runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryMutex {
    held: Arc<Mutex<HashSet<LockKey>>>,
}

impl MemoryMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: LockKey) -> bool {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).contains(&key)
    }
}

#[async_trait]
impl DistributedMutex for MemoryMutex {
    async fn try_acquire(&self, key: LockKey) -> anyhow::Result<Option<LockGuard>> {
        let inserted = self.held.lock().unwrap_or_else(PoisonError::into_inner).insert(key);
        if !inserted {
            return Ok(None);
        }
        let lease = MemoryLease {
            key,
            held: Some(self.held.clone()),
        };
        Ok(Some(LockGuard::new(key, Box::new(lease))))
    }
}

struct MemoryLease {
    key: LockKey,
    held: Option<Arc<Mutex<HashSet<LockKey>>>>,
}

impl MemoryLease {
    fn free(&mut self) {
        if let Some(held) = self.held.take() {
            held.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
        }
    }
}

#[async_trait]
impl LockLease for MemoryLease {
    async fn release(&mut self) -> anyhow::Result<()> {
        self.free();
        Ok(())
    }

    fn abandon(&mut self) {
        self.free();
    }
}
