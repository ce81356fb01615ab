//! SurrealDB integration for the job coordination layer.
//!
//! This crate provides database connectivity and a [`coord_core::KvStore`]
//! implementation so locks can be shared between processes.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod kv_store;
mod schema;

pub use connection::{DEFAULT_LOCK_TABLE, Database, DbConfig, DbError, connect};
pub use kv_store::SurrealKvStore;
pub use schema::init_schema;
