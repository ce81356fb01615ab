//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the lock table schema.
///
/// Each record is keyed by the lock key and holds the logical expiry in
/// `value` plus an optional physical expiry, both in unix seconds.
pub async fn init_schema(db: &Database, table: &str) -> Result<(), DbError> {
    validate_table(table)?;

    tracing::info!("Initializing lock table schema: {}", table);

    db.query(lock_schema(table)).await?.check()?;

    tracing::info!("Lock table schema initialized");

    Ok(())
}

/// Table names are interpolated into SurrealQL, so only identifiers pass.
pub(crate) fn validate_table(table: &str) -> Result<(), DbError> {
    let valid = !table.is_empty()
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(DbError::InvalidTable(table.to_string()))
    }
}

fn lock_schema(table: &str) -> String {
    format!(
        r#"
-- Lock records for distributed coordination
DEFINE TABLE IF NOT EXISTS {table} SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS value ON {table} TYPE int;
DEFINE FIELD IF NOT EXISTS expires_at ON {table} TYPE option<int>;

-- Index for sweeping physically expired locks
DEFINE INDEX IF NOT EXISTS {table}_expires_at ON {table} FIELDS expires_at;
"#
    )
}
