//! Distributed locking.
//!
//! An exclusive `Locker` with TTL-bounded leases, and an `RWLocker`
//! adding the usual reader/writer distinction. Both may be backed by a
//! single process (`LocalLocker`, used here and in tests) or by a
//! network service (Redis, etcd, ...) behind the same trait so the
//! Coordinator never knows which is active.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use displaydoc::Display;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

#[cfg(test)]
mod tests;

pub type LockResult<T> = Result<T, Error>;

/// A locking error.
#[derive(Debug, Display)]
pub enum Error {
    /// Timed out waiting to acquire lock "{key}".
    Timeout { key: String },

    /// Lock "{key}" is held by another holder.
    Unavailable { key: String },
}

/// A held lock, releasable by dropping or by explicit `unlock`.
pub struct LockGuard {
    key: String,
    token: Uuid,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// An exclusive, TTL-bounded distributed lock.
#[async_trait::async_trait]
pub trait Locker: Send + Sync + std::fmt::Debug {
    /// Acquires an exclusive lock, blocking (with internal retries) up
    /// to an implementation-defined bound.
    async fn lock(&self, key: &str, ttl: Duration) -> LockResult<LockGuard>;

    /// Attempts to acquire an exclusive lock without blocking.
    async fn try_lock(&self, key: &str, ttl: Duration) -> LockResult<Option<LockGuard>>;

    /// Releases a lock. Idempotent; safe to call on an expired lease.
    async fn unlock(&self, guard: LockGuard) -> LockResult<()>;
}

/// A reader/writer distributed lock.
#[async_trait::async_trait]
pub trait RWLocker: Locker {
    async fn rlock(&self, key: &str, ttl: Duration) -> LockResult<LockGuard>;
    async fn runlock(&self, guard: LockGuard) -> LockResult<()>;
}

#[derive(Debug, Clone)]
struct Lease {
    token: Uuid,
    expires_at: Instant,
    readers: u32,
}

/// Single-process lock table.
///
/// Lazily expires stale leases on every call instead of running a
/// background sweeper: a sweeper isn't load-bearing here since every
/// lock acquisition already has to consult the table.
#[derive(Debug, Default)]
pub struct LocalLocker {
    leases: Mutex<HashMap<String, Lease>>,
}

impl LocalLocker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn try_acquire_exclusive(&self, key: &str, ttl: Duration) -> Option<Uuid> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();

        if let Some(existing) = leases.get(key) {
            if existing.expires_at > now {
                return None;
            }
        }

        let token = Uuid::new_v4();
        leases.insert(
            key.to_string(),
            Lease {
                token,
                expires_at: now + ttl,
                readers: 0,
            },
        );
        Some(token)
    }
}

#[async_trait::async_trait]
impl Locker for LocalLocker {
    async fn lock(&self, key: &str, ttl: Duration) -> LockResult<LockGuard> {
        // Mirrors the Coordinator's own poll cadence (200ms) so a
        // caller blocked here surfaces at roughly the same rate as a
        // caller blocked waiting on another instance.
        let deadline = Instant::now() + Duration::from_secs(30);

        loop {
            if let Some(token) = self.try_acquire_exclusive(key, ttl).await {
                return Ok(LockGuard {
                    key: key.to_string(),
                    token,
                });
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    key: key.to_string(),
                });
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> LockResult<Option<LockGuard>> {
        Ok(self
            .try_acquire_exclusive(key, ttl)
            .await
            .map(|token| LockGuard {
                key: key.to_string(),
                token,
            }))
    }

    async fn unlock(&self, guard: LockGuard) -> LockResult<()> {
        let mut leases = self.leases.lock().await;
        if let Some(existing) = leases.get(&guard.key) {
            if existing.token == guard.token {
                leases.remove(&guard.key);
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RWLocker for LocalLocker {
    async fn rlock(&self, key: &str, ttl: Duration) -> LockResult<LockGuard> {
        // Readers never block each other; they only contend with a
        // held exclusive writer lease.
        let mut leases = self.leases.lock().await;
        let now = Instant::now();

        let lease = leases.entry(key.to_string()).or_insert_with(|| Lease {
            token: Uuid::new_v4(),
            expires_at: now + ttl,
            readers: 0,
        });

        if lease.expires_at <= now {
            *lease = Lease {
                token: Uuid::new_v4(),
                expires_at: now + ttl,
                readers: 0,
            };
        }

        lease.readers += 1;
        lease.expires_at = lease.expires_at.max(now + ttl);

        Ok(LockGuard {
            key: key.to_string(),
            token: lease.token,
        })
    }

    async fn runlock(&self, guard: LockGuard) -> LockResult<()> {
        let mut leases = self.leases.lock().await;
        if let Some(existing) = leases.get_mut(&guard.key) {
            if existing.token == guard.token && existing.readers > 0 {
                existing.readers -= 1;
            }
        }
        Ok(())
    }
}
