//! SurrealDB implementation of the coordination key-value store.

use std::sync::Arc;

use coord_core::{Clock, KvStore, StoreError, SystemClock};
use serde::{Deserialize, Serialize};

use crate::schema::{init_schema, validate_table};
use crate::{Database, DbConfig, DbError, connect};

/// Lock record as stored in the lock table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    #[serde(default)]
    value: i64,
    #[serde(default)]
    expires_at: Option<i64>,
}

impl LockRecord {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

fn backend(err: surrealdb::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Key-value store backed by one SurrealDB record per key.
///
/// Record creation on an existing id fails atomically, which provides
/// create-if-absent; `UPSERT … RETURN BEFORE` provides swap-and-get.
#[derive(Clone)]
pub struct SurrealKvStore {
    db: Database,
    table: String,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SurrealKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrealKvStore")
            .field("table", &self.table)
            .finish()
    }
}

impl SurrealKvStore {
    /// Wrap an existing connection. The lock table schema is created if needed.
    pub async fn new(db: Database, table: impl Into<String>) -> Result<Self, DbError> {
        let table = table.into();
        validate_table(&table)?;
        init_schema(&db, &table).await?;
        Ok(Self {
            db,
            table,
            clock: Arc::new(SystemClock),
        })
    }

    /// Connect using `config` and prepare the lock table.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        let db = connect(config).await?;
        Self::new(db, config.lock_table.clone()).await
    }

    /// Use a different clock for expiry bookkeeping.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn fetch(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        let record: Option<LockRecord> = self
            .db
            .select((self.table.as_str(), key.to_string()))
            .await
            .map_err(backend)?;
        Ok(record)
    }

    /// Remove `key` if its physical expiry has passed.
    async fn purge_if_expired(&self, key: &str) -> Result<(), StoreError> {
        self.db
            .query("DELETE type::thing($tb, $key) WHERE expires_at != NONE AND expires_at <= $now")
            .bind(("tb", self.table.clone()))
            .bind(("key", key.to_string()))
            .bind(("now", self.clock.now()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    /// Delete every physically expired lock. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let mut response = self
            .db
            .query("DELETE type::table($tb) WHERE expires_at != NONE AND expires_at <= $now RETURN BEFORE")
            .bind(("tb", self.table.clone()))
            .bind(("now", self.clock.now()))
            .await
            .map_err(backend)?;
        let removed: Vec<LockRecord> = response.take(0).map_err(backend)?;
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), table = %self.table, "purged expired locks");
        }
        Ok(removed.len())
    }
}

impl KvStore for SurrealKvStore {
    async fn set_if_absent(&self, key: &str, value: i64) -> Result<bool, StoreError> {
        self.purge_if_expired(key).await?;

        let created: Result<Option<LockRecord>, surrealdb::Error> = self
            .db
            .create((self.table.as_str(), key.to_string()))
            .content(LockRecord {
                value,
                expires_at: None,
            })
            .await;

        match created {
            Ok(record) => Ok(record.is_some()),
            // Creation fails when the record already exists.
            Err(err) => match self.fetch(key).await? {
                Some(_) => Ok(false),
                None => Err(backend(err)),
            },
        }
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let now = self.clock.now();
        match self.fetch(key).await? {
            Some(record) if record.is_live(now) => Ok(Some(record.value)),
            Some(_) => {
                self.purge_if_expired(key).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn swap_and_get_previous(&self, key: &str, value: i64) -> Result<Option<i64>, StoreError> {
        let now = self.clock.now();
        let mut response = self
            .db
            .query("UPSERT type::thing($tb, $key) SET value = $value, expires_at = NONE RETURN BEFORE")
            .bind(("tb", self.table.clone()))
            .bind(("key", key.to_string()))
            .bind(("value", value))
            .await
            .map_err(backend)?;
        let previous: Option<LockRecord> = response.take(0).map_err(backend)?;
        Ok(previous
            .filter(|record| record.is_live(now))
            .map(|record| record.value))
    }

    async fn expire(&self, key: &str, secs: u64) -> Result<(), StoreError> {
        let expires_at = self.clock.now() + secs as i64;
        self.db
            .query("UPDATE type::thing($tb, $key) SET expires_at = $expires_at")
            .bind(("tb", self.table.clone()))
            .bind(("key", key.to_string()))
            .bind(("expires_at", expires_at))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _: Option<LockRecord> = self
            .db
            .delete((self.table.as_str(), key.to_string()))
            .await
            .map_err(backend)?;
        Ok(())
    }
}
