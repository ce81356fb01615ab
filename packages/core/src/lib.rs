//! Core domain types for the job coordination layer.
//!
//! This crate contains the pieces shared by every package:
//! - Distributed TTL locks over a key-value store contract
//! - Lock identity derivation from job options
//! - The delayed method-invocation payload
//! - The weighted queue registry workers poll in order
//! - Configuration, clocks and lifecycle events

mod clock;
mod config;
mod error;
mod events;
mod kv;
mod lock;
mod lock_key;
pub mod naming;
mod payload;
mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CoordinationConfig, DEFAULT_HARD_EXPIRY_MARGIN_SECS, DEFAULT_LOCK_TTL_SECS,
    DEFAULT_QUEUE_WEIGHT, DEFAULT_REQUEUE_DELAY_SECS, WorkerEnv,
};
pub use error::{ConfigError, DispatchError, JobError, StoreError};
pub use events::CoordEvent;
pub use kv::{KvStore, MemoryKvStore};
pub use lock::{LockKind, LockManager};
pub use lock_key::{ALL_ATTRIBUTES, LockKeySpec};
pub use payload::{
    DEFAULT_QUEUE, DelayOptions, DelayTarget, Delayable, DelayedJobPayload, Envelope,
    FULL_QUEUE_KEY, JobId, JobOptions, RUN_AT_KEY, RunAt, encode,
};
pub use registry::{AppQueues, ExternalQueues, QueueEntry, QueueRegistry, QueueSource, StaticQueues};
