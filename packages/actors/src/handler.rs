//! Worker configuration, job handler trait and registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use coord_core::{
    ConfigError, DEFAULT_QUEUE, JobError, JobOptions, LockKind, QueueRegistry, QueueSource, naming,
};

use crate::locks::{DeclaredLock, LockStrategy, PayloadLock};
use crate::retry::RetryPolicy;

/// How a job that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Performed,
    /// Nothing to do, e.g. the target record no longer exists.
    Skipped { reason: String },
}

/// Result type for job handlers.
pub type HandlerResult = Result<Completion, JobError>;

/// Future type for async job handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Where a worker's lock attributes come from.
#[derive(Clone)]
pub enum LockSource {
    /// Attributes declared with the worker.
    Attributes(Vec<String>),
    /// Attributes named inside each payload.
    Payload,
    Custom(Arc<dyn LockStrategy>),
}

impl std::fmt::Debug for LockSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockSource::Attributes(attrs) => f.debug_tuple("Attributes").field(attrs).finish(),
            LockSource::Payload => f.write_str("Payload"),
            LockSource::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Static description of a worker type.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name jobs are enqueued under, e.g. `Billing::SyncInvoices`.
    pub name: String,
    pub app_key: String,
    pub queue: String,
    /// Queue name used as-is instead of `<app_key>_<queue>`.
    pub full_queue: Option<String>,
    pub lock_namespace: Option<String>,
    pub queue_lock: Option<LockSource>,
    pub worker_lock: Option<LockSource>,
    pub queue_lock_ttl_secs: Option<u64>,
    pub worker_lock_ttl_secs: Option<u64>,
    pub requeue_delay_secs: Option<u64>,
    pub retry: RetryPolicy,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            app_key: naming::namespace_from_class(&name),
            name,
            queue: DEFAULT_QUEUE.to_string(),
            full_queue: None,
            lock_namespace: None,
            queue_lock: None,
            worker_lock: None,
            queue_lock_ttl_secs: None,
            worker_lock_ttl_secs: None,
            requeue_delay_secs: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Register under an application key; it is normalized.
    pub fn application(mut self, app_key: &str) -> Self {
        self.app_key = naming::normalize(app_key);
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn full_queue(mut self, queue: impl Into<String>) -> Self {
        self.full_queue = Some(queue.into());
        self
    }

    pub fn lock_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.lock_namespace = Some(namespace.into());
        self
    }

    /// Allow only one queued job per value of `attributes`.
    pub fn queue_lock<I, A>(mut self, attributes: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.queue_lock = Some(declared(LockKind::Queue, attributes)?);
        Ok(self)
    }

    /// Allow only one running job per value of `attributes`.
    pub fn worker_lock<I, A>(mut self, attributes: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.worker_lock = Some(declared(LockKind::Worker, attributes)?);
        Ok(self)
    }

    /// Take both lock definitions from each payload.
    pub fn payload_locks(mut self) -> Self {
        self.queue_lock = Some(LockSource::Payload);
        self.worker_lock = Some(LockSource::Payload);
        self
    }

    pub fn with_lock_strategy(mut self, strategy: Arc<dyn LockStrategy>) -> Self {
        match strategy.kind() {
            LockKind::Queue => self.queue_lock = Some(LockSource::Custom(strategy)),
            LockKind::Worker => self.worker_lock = Some(LockSource::Custom(strategy)),
        }
        self
    }

    pub fn queue_lock_ttl(mut self, secs: u64) -> Self {
        self.queue_lock_ttl_secs = Some(secs);
        self
    }

    pub fn worker_lock_ttl(mut self, secs: u64) -> Self {
        self.worker_lock_ttl_secs = Some(secs);
        self
    }

    pub fn requeue_delay(mut self, secs: u64) -> Self {
        self.requeue_delay_secs = Some(secs);
        self
    }

    pub fn retry_backoff(mut self, backoff_secs: Vec<u64>) -> Self {
        self.retry = RetryPolicy::backoff(backoff_secs);
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry = RetryPolicy::disabled();
        self
    }

    /// Queue jobs of this worker go to unless told otherwise.
    pub fn queue_name(&self) -> String {
        self.full_queue
            .clone()
            .unwrap_or_else(|| naming::full_queue_name(&self.app_key, &self.queue))
    }

    /// Namespace declared locks are derived under.
    pub fn lock_namespace_or_name(&self) -> &str {
        self.lock_namespace.as_deref().unwrap_or(&self.name)
    }

    /// Resolve the lock strategy of `kind`, if this worker locks.
    pub fn lock_strategy(&self, kind: LockKind) -> Option<Arc<dyn LockStrategy>> {
        let source = match kind {
            LockKind::Queue => self.queue_lock.as_ref()?,
            LockKind::Worker => self.worker_lock.as_ref()?,
        };
        match source {
            LockSource::Attributes(attributes) => {
                DeclaredLock::new(kind, self.lock_namespace_or_name(), attributes.iter().cloned())
                    .ok()
                    .map(|lock| Arc::new(lock) as Arc<dyn LockStrategy>)
            }
            LockSource::Payload => Some(Arc::new(PayloadLock::new(kind))),
            LockSource::Custom(strategy) => Some(strategy.clone()),
        }
    }
}

fn declared<I, A>(kind: LockKind, attributes: I) -> Result<LockSource, ConfigError>
where
    I: IntoIterator<Item = A>,
    A: Into<String>,
{
    let attributes: Vec<String> = attributes.into_iter().map(Into::into).collect();
    if attributes.is_empty() {
        return Err(ConfigError::MissingLockAttributes(format!("{}_lock", kind)));
    }
    Ok(LockSource::Attributes(attributes))
}

/// Trait for job handlers.
///
/// Implement this trait to define how jobs of one worker type are processed.
pub trait JobHandler: Send + Sync + 'static {
    fn config(&self) -> &WorkerConfig;

    /// Process a job and return the result.
    fn perform(&self, options: &JobOptions) -> HandlerFuture;
}

/// A simple function-based job handler.
pub struct FnHandler<F>
where
    F: Fn(&JobOptions) -> HandlerFuture + Send + Sync + 'static,
{
    config: WorkerConfig,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&JobOptions) -> HandlerFuture + Send + Sync + 'static,
{
    pub fn new(config: WorkerConfig, handler: F) -> Self {
        Self { config, handler }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&JobOptions) -> HandlerFuture + Send + Sync + 'static,
{
    fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn perform(&self, options: &JobOptions) -> HandlerFuture {
        (self.handler)(options)
    }
}

/// Exposes a handler's queue to the queue registry.
struct HandlerQueue(Arc<dyn JobHandler>);

impl QueueSource for HandlerQueue {
    fn worker_name(&self) -> &str {
        &self.0.config().name
    }

    fn queue_name(&self) -> String {
        self.0.config().queue_name()
    }
}

/// Registry for job handlers.
///
/// Registering a handler also registers its worker with the queue registry
/// so polling workers check its queue.
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    queues: Arc<QueueRegistry>,
}

impl Default for JobHandlerRegistry {
    fn default() -> Self {
        Self::new(Arc::new(QueueRegistry::default()))
    }
}

impl JobHandlerRegistry {
    pub fn new(queues: Arc<QueueRegistry>) -> Self {
        Self {
            handlers: HashMap::new(),
            queues,
        }
    }

    /// Register a handler under its worker name.
    pub fn register<H: JobHandler>(&mut self, handler: H) -> Arc<dyn JobHandler> {
        let handler: Arc<dyn JobHandler> = Arc::new(handler);
        let name = handler.config().name.clone();
        self.queues
            .register_worker(Arc::new(HandlerQueue(handler.clone())));
        self.handlers.insert(name, handler.clone());
        handler
    }

    /// Get the handler for a worker name.
    pub fn get(&self, worker: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(worker).cloned()
    }

    pub fn has_handler(&self, worker: &str) -> bool {
        self.handlers.contains_key(worker)
    }

    pub fn worker_names(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    pub fn queues(&self) -> &Arc<QueueRegistry> {
        &self.queues
    }
}

/// Helper macro for creating job handlers from async blocks.
#[macro_export]
macro_rules! job_handler {
    ($config:expr, |$options:ident| $body:expr) => {
        $crate::FnHandler::new($config, |$options: &$crate::JobOptions| {
            let $options = $options.clone();
            Box::pin(async move { $body })
        })
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_name_defaults_to_class_namespace() {
        assert_eq!(WorkerConfig::new("Billing::Sync").queue_name(), "billing_default");
        assert_eq!(WorkerConfig::new("Sync").queue_name(), "worker_default");
        assert_eq!(
            WorkerConfig::new("Sync")
                .application("My App")
                .queue("low")
                .queue_name(),
            "my_app_low"
        );
        assert_eq!(
            WorkerConfig::new("Sync").full_queue("exact").queue_name(),
            "exact"
        );
    }

    #[test]
    fn lock_declarations_need_attributes() {
        let err = WorkerConfig::new("Sync").worker_lock(Vec::<String>::new());
        assert!(matches!(err, Err(ConfigError::MissingLockAttributes(_))));
    }

    #[test]
    fn declared_locks_use_lock_namespace_when_set() -> Result<(), ConfigError> {
        let config = WorkerConfig::new("Billing::Sync")
            .queue_lock(["account_id"])?
            .lock_namespace("billing");
        let mut options = JobOptions::new();
        options.insert("account_id".into(), 42.into());

        let strategy = config.lock_strategy(LockKind::Queue);
        let expected = coord_core::LockKeySpec::new("billing", ["account_id"]).derive(&options);
        assert_eq!(strategy.and_then(|s| s.identity(&options)), Some(expected));
        assert!(config.lock_strategy(LockKind::Worker).is_none());
        Ok(())
    }

    #[test]
    fn registering_a_handler_registers_its_queue() {
        let queues = Arc::new(QueueRegistry::default());
        let mut registry = JobHandlerRegistry::new(queues.clone());
        registry.register(FnHandler::new(
            WorkerConfig::new("Billing::Sync").queue("high"),
            |_: &JobOptions| -> HandlerFuture { Box::pin(async { Ok(Completion::Performed) }) },
        ));

        assert!(registry.has_handler("Billing::Sync"));
        assert!(queues.contains("billing_high"));
        assert_eq!(queues.worker_names(), ["Billing::Sync"]);
    }
}
