//! Key-value store contract used for distributed coordination.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// Atomic primitives the lock protocol needs from a shared store.
///
/// Every operation must be atomic on its own; the protocol never relies on
/// multi-key transactions. Keys that passed their physical expiry behave as
/// absent.
pub trait KvStore: Send + Sync + 'static {
    /// Create `key` with `value` only if it does not exist.
    fn set_if_absent(
        &self,
        key: &str,
        value: i64,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Read the current value of `key`.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send;

    /// Replace the value of `key`, returning the value it held before.
    ///
    /// Like Redis `GETSET`, this creates the key when missing and clears any
    /// physical expiry previously set on it.
    fn swap_and_get_previous(
        &self,
        key: &str,
        value: i64,
    ) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send;

    /// Physically expire `key` after `secs` seconds.
    fn expire(&self, key: &str, secs: u64) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<i64>,
}

impl Entry {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-process store for tests and single-process deployments.
///
/// Each operation holds the map's mutex for its whole duration, which gives
/// the same per-command atomicity a real store provides.
#[derive(Clone)]
pub struct MemoryKvStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKvStore")
            .field("entries", &"<Mutex<HashMap<String, Entry>>>")
            .finish()
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose physical expiry follows the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Seconds until `key` physically expires, if it has an expiry.
    pub fn ttl(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let now = self.clock.now();
        let entries = self.lock()?;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at - now))
    }

    /// Number of live keys.
    pub fn len(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        Ok(self.lock()?.values().filter(|e| e.is_live(now)).count())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".into()))
    }

    fn live_entry(
        entries: &mut HashMap<String, Entry>,
        key: &str,
        now: i64,
    ) -> Option<Entry> {
        match entries.get(key).copied() {
            Some(entry) if entry.is_live(now) => Some(entry),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

impl KvStore for MemoryKvStore {
    async fn set_if_absent(&self, key: &str, value: i64) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        if Self::live_entry(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        Ok(Self::live_entry(&mut entries, key, now).map(|e| e.value))
    }

    async fn swap_and_get_previous(&self, key: &str, value: i64) -> Result<Option<i64>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        let previous = Self::live_entry(&mut entries, key, now).map(|e| e.value);
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(previous)
    }

    async fn expire(&self, key: &str, secs: u64) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        if Self::live_entry(&mut entries, key, now).is_some()
            && let Some(entry) = entries.get_mut(key)
        {
            entry.expires_at = Some(now + secs as i64);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
