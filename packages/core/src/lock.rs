//! TTL-bound distributed locks on top of a [`KvStore`].
//!
//! The protocol stores a single integer per key: the unix second after which
//! the lock may be taken over. It never blocks and never deadlocks:
//!
//! 1. `set_if_absent(key, now + ttl + 1)`; on success set a physical expiry of
//!    `ttl + 1 + margin` seconds and take the lock.
//! 2. Otherwise read the stored expiry; while `now <= expiry` the lock is held
//!    by someone else.
//! 3. A stale expiry is swapped for a fresh one. Only the caller that swapped
//!    out a still-stale value owns the lock; a caller that swapped out a fresh
//!    value lost the race to another acquirer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::CoordinationConfig;
use crate::error::StoreError;
use crate::kv::KvStore;

/// Which of the two lock flavors a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// Guards against enqueueing the same logical job twice.
    Queue,
    /// Guards against running the same logical job concurrently.
    Worker,
}

impl LockKind {
    /// Key prefix under which locks of this kind are stored.
    pub fn prefix(self) -> &'static str {
        match self {
            LockKind::Queue => "lock:",
            LockKind::Worker => "workerslock:",
        }
    }

    /// Full store key for a derived lock identity.
    pub fn store_key(self, identity: &str) -> String {
        format!("{}{}", self.prefix(), identity)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LockKind::Queue => "queue",
            LockKind::Worker => "worker",
        }
    }
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acquires and releases named locks against a shared store.
pub struct LockManager<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    hard_expiry_margin_secs: u64,
}

impl<S> Clone for LockManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            hard_expiry_margin_secs: self.hard_expiry_margin_secs,
        }
    }
}

impl<S: KvStore> LockManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: &CoordinationConfig) -> Self {
        Self {
            store,
            clock,
            hard_expiry_margin_secs: config.hard_expiry_margin_secs,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Try to take `key` for `ttl_secs` seconds without waiting.
    ///
    /// Returns `Ok(false)` when another holder's lock is still valid.
    pub async fn try_acquire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let from_now = ttl_secs as i64 + 1;
        let expires_at = now + from_now;
        let hard_expiry = from_now as u64 + self.hard_expiry_margin_secs;

        if self.store.set_if_absent(key, expires_at).await? {
            self.store.expire(key, hard_expiry).await?;
            tracing::debug!(key, expires_at, "lock acquired");
            return Ok(true);
        }

        // A missing value reads as 0, so a key deleted between the two calls
        // is treated as stale and contested through the swap below.
        let current = self.store.get(key).await?.unwrap_or(0);
        if now <= current {
            tracing::debug!(key, held_until = current, "lock held elsewhere");
            return Ok(false);
        }

        let previous = self
            .store
            .swap_and_get_previous(key, expires_at)
            .await?
            .unwrap_or(0);
        if now > previous {
            self.store.expire(key, hard_expiry).await?;
            tracing::debug!(key, expires_at, stale = previous, "stale lock taken over");
            Ok(true)
        } else {
            tracing::debug!(key, held_until = previous, "lost lock takeover race");
            Ok(false)
        }
    }

    /// Release `key` unconditionally. Releasing a free key is a no-op.
    pub async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(key).await?;
        tracing::debug!(key, "lock released");
        Ok(())
    }

    /// Whether `key` currently holds a valid lock.
    pub async fn is_held(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .store
            .get(key)
            .await?
            .is_some_and(|expires_at| now <= expires_at))
    }
}
