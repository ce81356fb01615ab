use std::sync::Arc;

use coord_core::ManualClock;
use db::{DbConfig, DbError, SurrealKvStore};

pub const START: i64 = 1_700_000_000;

/// Fresh in-memory store in its own database, driven by a manual clock.
pub async fn setup_store() -> Result<(SurrealKvStore, Arc<ManualClock>), DbError> {
    let clock = Arc::new(ManualClock::new(START));
    let config = DbConfig::memory().with_database(format!("test_{}", ulid::Ulid::new()));
    let store = SurrealKvStore::connect(&config)
        .await?
        .with_clock(clock.clone());
    Ok((store, clock))
}
