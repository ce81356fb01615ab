//! Database connection management.

use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect as connect_any};
use surrealdb::opt::auth::Root;
use thiserror::Error;

/// Database connection handle.
pub type Database = Surreal<Any>;

/// Default table holding coordination locks.
pub const DEFAULT_LOCK_TABLE: &str = "coord_lock";

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Connection mode: "mem://", "file://path", "rocksdb://path", ...
    pub endpoint: String,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
    /// Table the lock records live in
    pub lock_table: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "coordination".to_string(),
            database: "main".to_string(),
            credentials: None,
            lock_table: DEFAULT_LOCK_TABLE.to_string(),
        }
    }
}

impl DbConfig {
    /// Create a config for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create a config for file-based persistence.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("file://{}", path.into()),
            ..Default::default()
        }
    }

    /// Create a config for RocksDB persistence (requires rocksdb feature).
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("rocksdb://{}", path.into()),
            ..Default::default()
        }
    }

    /// Build a config from environment variables.
    ///
    /// - `COORD_DB_ENDPOINT` (default: `mem://`)
    /// - `COORD_DB_NAMESPACE` (default: `coordination`)
    /// - `COORD_DB_DATABASE` (default: `main`)
    /// - `COORD_DB_USER` / `COORD_DB_PASS` (optional root credentials)
    /// - `COORD_DB_LOCK_TABLE` (default: `coord_lock`)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let credentials = match (var("COORD_DB_USER"), var("COORD_DB_PASS")) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };

        Self {
            endpoint: var("COORD_DB_ENDPOINT").unwrap_or(defaults.endpoint),
            namespace: var("COORD_DB_NAMESPACE").unwrap_or(defaults.namespace),
            database: var("COORD_DB_DATABASE").unwrap_or(defaults.database),
            credentials,
            lock_table: var("COORD_DB_LOCK_TABLE").unwrap_or(defaults.lock_table),
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set root credentials for authentication.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Set the lock table name.
    pub fn with_lock_table(mut self, table: impl Into<String>) -> Self {
        self.lock_table = table.into();
        self
    }
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(#[from] surrealdb::Error),
    #[error("Invalid table name: {0}")]
    InvalidTable(String),
}

/// Open a connection and select the configured namespace and database.
pub async fn connect(config: &DbConfig) -> Result<Database, DbError> {
    tracing::info!("Connecting to database: {}", config.endpoint);

    let db = connect_any(&config.endpoint).await?;

    // Authenticate if credentials provided
    if let Some((username, password)) = &config.credentials {
        db.signin(Root { username, password }).await?;
    }

    db.use_ns(&config.namespace).use_db(&config.database).await?;

    tracing::info!(
        "Connected to database: {}/{}",
        config.namespace,
        config.database
    );

    Ok(db)
}
