//! Queue and worker lock strategies and the hooks that apply them.

use std::ops::ControlFlow;
use std::sync::Arc;

use coord_core::{
    ConfigError, JobError, JobOptions, KvStore, LockKeySpec, LockKind, LockManager,
};
use serde_json::Value;

use crate::hooks::{
    EnqueueContext, HookFuture, JobHook, PerformContext, PerformGuard, PerformHalt,
};

/// Option naming the lock namespace of a dynamically locked payload.
pub const LOCK_NAMESPACE_KEY: &str = "lock_namespace";
/// Option naming the class of a dynamically locked payload.
pub const CLASS_NAME_KEY: &str = "class_name";

/// Derives the lock identity a job holds, if it locks at all.
pub trait LockStrategy: Send + Sync + 'static {
    fn kind(&self) -> LockKind;

    /// Lock identity for `options`, or `None` when this job does not lock.
    fn identity(&self, options: &JobOptions) -> Option<String>;

    /// Full store key for `options`.
    fn store_key(&self, options: &JobOptions) -> Option<String> {
        self.identity(options).map(|id| self.kind().store_key(&id))
    }
}

/// Lock on attributes declared with the worker.
#[derive(Debug, Clone)]
pub struct DeclaredLock {
    kind: LockKind,
    spec: LockKeySpec,
}

impl DeclaredLock {
    /// Fails when no attribute is given; use `["all"]` to lock on everything.
    pub fn new<I, A>(kind: LockKind, namespace: impl Into<String>, attributes: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        let spec = LockKeySpec::new(namespace, attributes);
        if spec.attributes.is_empty() {
            return Err(ConfigError::MissingLockAttributes(format!("{}_lock", kind)));
        }
        Ok(Self { kind, spec })
    }

    pub fn spec(&self) -> &LockKeySpec {
        &self.spec
    }
}

impl LockStrategy for DeclaredLock {
    fn kind(&self) -> LockKind {
        self.kind
    }

    fn identity(&self, options: &JobOptions) -> Option<String> {
        Some(self.spec.derive(options))
    }
}

/// Lock whose attributes travel in the payload itself.
///
/// The attribute list is read from the `queue_lock` / `worker_lock` option
/// (a name or a list of names); the namespace from `lock_namespace`, falling
/// back to `class_name`.
#[derive(Debug, Clone, Copy)]
pub struct PayloadLock {
    kind: LockKind,
}

impl PayloadLock {
    pub fn new(kind: LockKind) -> Self {
        Self { kind }
    }

    fn option_key(&self) -> &'static str {
        match self.kind {
            LockKind::Queue => "queue_lock",
            LockKind::Worker => "worker_lock",
        }
    }
}

impl LockStrategy for PayloadLock {
    fn kind(&self) -> LockKind {
        self.kind
    }

    fn identity(&self, options: &JobOptions) -> Option<String> {
        let attributes: Vec<String> = match options.get(self.option_key())? {
            Value::String(name) => vec![name.clone()],
            Value::Array(names) => names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => return None,
        };

        let namespace = [LOCK_NAMESPACE_KEY, CLASS_NAME_KEY]
            .iter()
            .find_map(|key| options.get(*key).and_then(Value::as_str))
            .unwrap_or_default();

        Some(LockKeySpec::new(namespace, attributes).derive(options))
    }
}

/// Vetoes duplicate enqueues; releases when the job starts.
pub struct QueueLockHook<S> {
    strategy: Arc<dyn LockStrategy>,
    locks: LockManager<S>,
    ttl_secs: u64,
}

impl<S: KvStore> QueueLockHook<S> {
    pub fn new(strategy: Arc<dyn LockStrategy>, locks: LockManager<S>, ttl_secs: u64) -> Self {
        Self {
            strategy,
            locks,
            ttl_secs,
        }
    }
}

impl<S: KvStore> JobHook for QueueLockHook<S> {
    fn name(&self) -> &str {
        "queue_lock"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn before_enqueue<'a>(&'a self, ctx: &'a EnqueueContext) -> HookFuture<'a, Result<bool, JobError>> {
        Box::pin(async move {
            let Some(key) = self.strategy.store_key(&ctx.options) else {
                return Ok(true);
            };
            let acquired = self.locks.try_acquire(&key, self.ttl_secs).await?;
            if !acquired {
                tracing::info!(worker = %ctx.worker, queue = %ctx.queue, %key, "already queued, skipping enqueue");
            }
            Ok(acquired)
        })
    }

    fn before_perform<'a>(
        &'a self,
        ctx: &'a mut PerformContext,
    ) -> HookFuture<'a, Result<ControlFlow<PerformHalt>, JobError>> {
        Box::pin(async move {
            if let Some(key) = self.strategy.store_key(ctx.options()) {
                self.locks.release(&key).await?;
            }
            Ok(ControlFlow::Continue(()))
        })
    }
}

/// Keeps a job from running twice at once.
///
/// A job that finds the lock taken is requeued shortly after instead of
/// failing. The guard releasing the lock is held from the moment it is
/// acquired, so a later hook halting the perform frees it too. The failure
/// hook releases it once more.
pub struct WorkerLockHook<S> {
    strategy: Arc<dyn LockStrategy>,
    locks: LockManager<S>,
    ttl_secs: u64,
    requeue_delay_secs: u64,
}

impl<S: KvStore> WorkerLockHook<S> {
    pub fn new(
        strategy: Arc<dyn LockStrategy>,
        locks: LockManager<S>,
        ttl_secs: u64,
        requeue_delay_secs: u64,
    ) -> Self {
        Self {
            strategy,
            locks,
            ttl_secs,
            requeue_delay_secs,
        }
    }
}

impl<S: KvStore> JobHook for WorkerLockHook<S> {
    fn name(&self) -> &str {
        "worker_lock"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn before_perform<'a>(
        &'a self,
        ctx: &'a mut PerformContext,
    ) -> HookFuture<'a, Result<ControlFlow<PerformHalt>, JobError>> {
        Box::pin(async move {
            let Some(key) = self.strategy.store_key(ctx.options()) else {
                return Ok(ControlFlow::Continue(()));
            };
            if self.locks.try_acquire(&key, self.ttl_secs).await? {
                let locks = self.locks.clone();
                ctx.hold(PerformGuard::new("worker_lock", async move {
                    locks.release(&key).await?;
                    Ok(())
                }));
                return Ok(ControlFlow::Continue(()));
            }

            tracing::debug!(job_id = %ctx.envelope.id, %key, "worker lock busy, requeueing");
            Ok(ControlFlow::Break(PerformHalt::Requeue {
                run_at: ctx.now + self.requeue_delay_secs as i64,
                lock: Some(LockKind::Worker),
            }))
        })
    }

    fn on_failure<'a>(
        &'a self,
        ctx: &'a mut PerformContext,
        _error: &'a JobError,
    ) -> HookFuture<'a, Result<(), JobError>> {
        Box::pin(async move {
            if let Some(key) = self.strategy.store_key(ctx.options()) {
                self.locks.release(&key).await?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(value: Value) -> JobOptions {
        match value {
            Value::Object(map) => map,
            _ => JobOptions::new(),
        }
    }

    #[test]
    fn declared_lock_requires_attributes() {
        let err = DeclaredLock::new(LockKind::Worker, "Billing::Sync", Vec::<String>::new());
        match err {
            Err(e) => assert_eq!(e.to_string(), "worker_lock: what should i lock on?"),
            Ok(_) => panic!("expected a configuration error"),
        }
    }

    #[test]
    fn declared_lock_keys_on_declared_attributes() -> Result<(), ConfigError> {
        let lock = DeclaredLock::new(LockKind::Queue, "Billing::Sync", ["account_id"])?;
        let a = options(json!({"account_id": 42, "full_queue": "billing_default"}));
        let b = options(json!({"account_id": 42, "full_queue": "billing_low"}));
        let c = options(json!({"account_id": 43}));

        assert_eq!(lock.identity(&a), lock.identity(&b));
        assert_ne!(lock.identity(&a), lock.identity(&c));
        assert!(lock.store_key(&a).is_some_and(|k| k.starts_with("lock:")));
        Ok(())
    }

    #[test]
    fn payload_lock_reads_attributes_from_options() {
        let lock = PayloadLock::new(LockKind::Worker);
        let locked = options(json!({
            "class_name": "Account",
            "id": "7",
            "worker_lock": "account_id",
            "account_id": "7"
        }));
        let unlocked = options(json!({"class_name": "Account", "id": "7"}));

        let expected = LockKeySpec::new("Account", ["account_id"]).derive(&locked);
        assert_eq!(lock.identity(&locked), Some(expected));
        assert_eq!(lock.identity(&unlocked), None);
    }

    #[test]
    fn payload_lock_prefers_lock_namespace() {
        let lock = PayloadLock::new(LockKind::Queue);
        let opts = options(json!({
            "class_name": "Account",
            "lock_namespace": "accounts",
            "queue_lock": ["account_id"],
            "account_id": "7"
        }));

        let expected = LockKeySpec::new("accounts", ["account_id"]).derive(&opts);
        assert_eq!(lock.identity(&opts), Some(expected));
    }
}
