//! Deferred method invocation.
//!
//! A call such as `Account(7).recalculate(2024)` is captured as a
//! [`DelayedJobPayload`], queued to the `delay_execution` worker and later
//! replayed against a receiver resolved through the [`DelayRegistry`].

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use coord_core::{
    DelayOptions, DelayTarget, Delayable, DelayedJobPayload, DispatchError, JobOptions, KvStore,
    RunAt, WorkerEnv, encode,
};
use serde_json::Value;

use crate::client::{EnqueueOutcome, JobClient};
use crate::engine::QueueEngine;
use crate::error::ClientError;
use crate::handler::{Completion, HandlerFuture, JobHandler, WorkerConfig};

/// Worker name deferred calls are enqueued under.
pub const DELAY_EXECUTION_WORKER: &str = "delay_execution";

pub type InvokeFuture = Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send>>;

pub type FindFuture =
    Pin<Box<dyn Future<Output = Result<Option<Arc<dyn Receiver>>, DispatchError>> + Send>>;

type FinderFn = Arc<dyn Fn(String) -> FindFuture + Send + Sync>;

/// Something a deferred call can be dispatched to: a class or a record.
pub trait Receiver: Send + Sync + 'static {
    fn responds_to(&self, method: &str) -> bool;

    /// Call `method` with positional `args`.
    fn invoke(&self, method: &str, args: Vec<Value>) -> InvokeFuture;
}

/// Record lookup conventions, in the order they are preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FinderKind {
    /// Returns nothing when the record is missing.
    FindBy,
    /// Legacy form of `FindBy`.
    FindById,
    /// Missing records are an error.
    Find,
}

/// A class deferred calls may target.
pub struct DelayClass {
    name: String,
    class_receiver: Option<Arc<dyn Receiver>>,
    instance_methods: BTreeSet<String>,
    finders: Vec<(FinderKind, FinderFn)>,
}

impl std::fmt::Debug for DelayClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayClass")
            .field("name", &self.name)
            .field("instance_methods", &self.instance_methods)
            .field(
                "finders",
                &self.finders.iter().map(|(kind, _)| kind).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl DelayClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_receiver: None,
            instance_methods: BTreeSet::new(),
            finders: Vec::new(),
        }
    }

    /// Receiver for calls made on the class itself.
    pub fn class_methods(mut self, receiver: Arc<dyn Receiver>) -> Self {
        self.class_receiver = Some(receiver);
        self
    }

    /// Methods records of this class respond to.
    pub fn instance_methods<I, M>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        self.instance_methods
            .extend(methods.into_iter().map(Into::into));
        self
    }

    pub fn find_by<F, Fut>(self, finder: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Arc<dyn Receiver>>, DispatchError>> + Send + 'static,
    {
        self.with_finder(FinderKind::FindBy, finder)
    }

    pub fn find_by_id<F, Fut>(self, finder: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Arc<dyn Receiver>>, DispatchError>> + Send + 'static,
    {
        self.with_finder(FinderKind::FindById, finder)
    }

    pub fn find<F, Fut>(self, finder: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Arc<dyn Receiver>>, DispatchError>> + Send + 'static,
    {
        self.with_finder(FinderKind::Find, finder)
    }

    fn with_finder<F, Fut>(mut self, kind: FinderKind, finder: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Arc<dyn Receiver>>, DispatchError>> + Send + 'static,
    {
        let finder: FinderFn = Arc::new(move |id| Box::pin(finder(id)) as FindFuture);
        self.finders.retain(|(k, _)| *k != kind);
        self.finders.push((kind, finder));
        self.finders.sort_by_key(|(k, _)| *k);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the class or its records define `method`.
    pub fn declares(&self, method: &str) -> bool {
        self.instance_methods.contains(method)
            || self
                .class_receiver
                .as_ref()
                .is_some_and(|r| r.responds_to(method))
    }

    /// The lookup convention this class supports, by preference.
    pub fn finder_kind(&self) -> Option<FinderKind> {
        self.finders.first().map(|(kind, _)| *kind)
    }

    /// Resolve the receiver for `id`; `Ok(None)` when a nilable finder
    /// found nothing.
    async fn resolve(&self, id: Option<&str>) -> Result<Option<Arc<dyn Receiver>>, DispatchError> {
        let Some(id) = id else {
            return self
                .class_receiver
                .clone()
                .map(Some)
                .ok_or_else(|| DispatchError::UnknownMethod {
                    class: self.name.clone(),
                    method: "class methods".to_string(),
                });
        };

        let Some((kind, finder)) = self.finders.first() else {
            return Err(DispatchError::UnknownMethod {
                class: self.name.clone(),
                method: "find".to_string(),
            });
        };

        match (kind, finder(id.to_string()).await?) {
            (_, Some(record)) => Ok(Some(record)),
            (FinderKind::Find, None) => Err(DispatchError::RecordNotFound {
                class: self.name.clone(),
                id: id.to_string(),
            }),
            (FinderKind::FindBy | FinderKind::FindById, None) => Ok(None),
        }
    }
}

/// Result of replaying a deferred call.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeOutcome {
    Invoked(Value),
    /// The target record no longer exists; nothing ran.
    Skipped { class: String, id: String },
}

/// Classes deferred calls may target, by name.
#[derive(Debug, Default)]
pub struct DelayRegistry {
    classes: HashMap<String, Arc<DelayClass>>,
}

impl DelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: DelayClass) -> Arc<DelayClass> {
        let class = Arc::new(class);
        self.classes.insert(class.name.clone(), class.clone());
        class
    }

    pub fn get(&self, class_name: &str) -> Option<Arc<DelayClass>> {
        self.classes.get(class_name).cloned()
    }

    pub fn class_names(&self) -> Vec<&str> {
        self.classes.keys().map(|s| s.as_str()).collect()
    }

    /// Fail unless `class_name` defines `method`. Meant for setup time.
    pub fn check_deferrable(&self, class_name: &str, method: &str) -> Result<(), DispatchError> {
        let class = self
            .get(class_name)
            .ok_or_else(|| DispatchError::UnknownClass(class_name.to_string()))?;
        if class.declares(method) {
            Ok(())
        } else {
            Err(DispatchError::UnsupportedDeferredMethod {
                class: class_name.to_string(),
                method: method.to_string(),
            })
        }
    }

    /// Resolve the payload's receiver and call its method.
    ///
    /// A record missing from a nilable finder is skipped with a warning
    /// rather than treated as an error.
    pub async fn decode_and_invoke(&self, payload: &DelayedJobPayload) -> Result<InvokeOutcome, DispatchError> {
        let class = self
            .get(&payload.class_name)
            .ok_or_else(|| DispatchError::UnknownClass(payload.class_name.clone()))?;

        let Some(receiver) = class.resolve(payload.id.as_deref()).await? else {
            let id = payload.id.clone().unwrap_or_default();
            tracing::warn!(
                class = %payload.class_name,
                %id,
                method = %payload.method_name,
                "record not found, skipping delayed call"
            );
            return Ok(InvokeOutcome::Skipped {
                class: payload.class_name.clone(),
                id,
            });
        };

        if !receiver.responds_to(&payload.method_name) {
            return Err(DispatchError::UnknownMethod {
                class: payload.class_name.clone(),
                method: payload.method_name.clone(),
            });
        }

        tracing::debug!(class = %payload.class_name, method = %payload.method_name, "invoking delayed call");
        let value = receiver
            .invoke(&payload.method_name, payload.args.clone())
            .await?;
        Ok(InvokeOutcome::Invoked(value))
    }
}

/// Worker replaying deferred calls. Locks come from each payload.
pub struct DelayExecutionHandler {
    config: WorkerConfig,
    registry: Arc<DelayRegistry>,
}

impl DelayExecutionHandler {
    pub fn new(registry: Arc<DelayRegistry>) -> Self {
        Self {
            config: WorkerConfig::new(DELAY_EXECUTION_WORKER).payload_locks(),
            registry,
        }
    }

    /// Adjust the worker configuration, e.g. its retry policy.
    pub fn with_config(mut self, configure: impl FnOnce(WorkerConfig) -> WorkerConfig) -> Self {
        self.config = configure(self.config).payload_locks();
        self
    }
}

impl JobHandler for DelayExecutionHandler {
    fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn perform(&self, options: &JobOptions) -> HandlerFuture {
        let registry = self.registry.clone();
        let payload = DelayedJobPayload::from_options(options)
            .map_err(|e| DispatchError::InvalidPayload(e.to_string()));
        Box::pin(async move {
            match registry.decode_and_invoke(&payload?).await? {
                InvokeOutcome::Invoked(_) => Ok(Completion::Performed),
                InvokeOutcome::Skipped { class, id } => Ok(Completion::Skipped {
                    reason: format!("{class} with id={id} not found"),
                }),
            }
        })
    }
}

/// What happened to a deferred call.
#[derive(Debug, Clone)]
pub enum DelayOutcome {
    Queued(EnqueueOutcome),
    /// Ran in-process right away.
    Invoked(InvokeOutcome),
}

/// Entry point for deferring calls.
pub struct Delayer<S, E> {
    client: JobClient<S, E>,
    registry: Arc<DelayRegistry>,
    env: WorkerEnv,
}

impl<S, E> Clone for Delayer<S, E> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            registry: self.registry.clone(),
            env: self.env,
        }
    }
}

impl<S: KvStore, E: QueueEngine> Delayer<S, E> {
    pub fn new(client: JobClient<S, E>, registry: Arc<DelayRegistry>, env: WorkerEnv) -> Self {
        Self {
            client,
            registry,
            env,
        }
    }

    pub fn registry(&self) -> &Arc<DelayRegistry> {
        &self.registry
    }

    /// Proxy deferring calls on `target`.
    pub fn delay(&self, target: DelayTarget, options: DelayOptions) -> InvocationProxy<'_, S, E> {
        InvocationProxy {
            delayer: self,
            target,
            options,
        }
    }

    /// Proxy deferring calls on a record.
    pub fn delay_record<T: Delayable + ?Sized>(
        &self,
        record: &T,
        options: DelayOptions,
    ) -> InvocationProxy<'_, S, E> {
        self.delay(record.delay_target(), options)
    }

    /// Declare `class_name#method` as always deferred.
    ///
    /// Fails immediately when the class does not define the method.
    pub fn async_method(
        &self,
        class_name: &str,
        method: &str,
        options: DelayOptions,
    ) -> Result<AsyncMethod<S, E>, DispatchError> {
        self.registry.check_deferrable(class_name, method)?;
        Ok(AsyncMethod {
            delayer: self.clone(),
            class_name: class_name.to_string(),
            method: method.to_string(),
            options,
        })
    }

    /// Whether a call with `options` goes through the queue.
    ///
    /// Outside a worker everything is queued. Inside one, only forced calls
    /// and calls scheduled in the future are.
    pub fn should_queue(&self, options: &DelayOptions) -> bool {
        if options.synchronous {
            return false;
        }
        let now = self.client.clock().now();
        !self.env.is_worker
            || match options.run_at {
                RunAt::Force => true,
                RunAt::At(ts) => ts > now,
                RunAt::Now => false,
            }
    }
}

/// Captures one deferred call on a target.
pub struct InvocationProxy<'a, S, E> {
    delayer: &'a Delayer<S, E>,
    target: DelayTarget,
    options: DelayOptions,
}

impl<S: KvStore, E: QueueEngine> InvocationProxy<'_, S, E> {
    pub fn target(&self) -> &DelayTarget {
        &self.target
    }

    /// Queue `method(args…)` or run it in-process.
    pub async fn call(self, method: &str, args: Vec<Value>) -> Result<DelayOutcome, ClientError> {
        let payload = encode(&self.target, method, args, &self.options);

        if self.delayer.should_queue(&self.options) {
            let outcome = self.delayer.client.enqueue_delayed(&payload).await?;
            return Ok(DelayOutcome::Queued(outcome));
        }

        let outcome = self.delayer.registry.decode_and_invoke(&payload).await?;
        Ok(DelayOutcome::Invoked(outcome))
    }
}

/// A method declared as deferred with [`Delayer::async_method`].
pub struct AsyncMethod<S, E> {
    delayer: Delayer<S, E>,
    class_name: String,
    method: String,
    options: DelayOptions,
}

impl<S: KvStore, E: QueueEngine> AsyncMethod<S, E> {
    /// Call the method on the record with `id`.
    pub async fn call_on(&self, id: impl Into<String>, args: Vec<Value>) -> Result<DelayOutcome, ClientError> {
        let target = DelayTarget::instance(self.class_name.clone(), id);
        self.delayer
            .delay(target, self.options.clone())
            .call(&self.method, args)
            .await
    }

    /// Call the method on the class itself.
    pub async fn call(&self, args: Vec<Value>) -> Result<DelayOutcome, ClientError> {
        let target = DelayTarget::class(self.class_name.clone());
        self.delayer
            .delay(target, self.options.clone())
            .call(&self.method, args)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl Receiver for Echo {
        fn responds_to(&self, method: &str) -> bool {
            method == "echo"
        }

        fn invoke(&self, _method: &str, args: Vec<Value>) -> InvokeFuture {
            Box::pin(async move { Ok(Value::Array(args)) })
        }
    }

    fn found(_id: String) -> FindFuture {
        Box::pin(async { Ok(Some(Arc::new(Echo) as Arc<dyn Receiver>)) })
    }

    fn not_found(_id: String) -> FindFuture {
        Box::pin(async { Ok(None) })
    }

    fn payload(class: &str, id: Option<&str>, method: &str) -> DelayedJobPayload {
        let target = match id {
            Some(id) => DelayTarget::instance(class, id),
            None => DelayTarget::class(class),
        };
        encode(&target, method, vec![json!(1), json!("two")], &DelayOptions::new())
    }

    #[tokio::test]
    async fn class_calls_use_the_class_receiver() -> Result<(), DispatchError> {
        let mut registry = DelayRegistry::new();
        registry.register(DelayClass::new("Reports").class_methods(Arc::new(Echo)));

        let outcome = registry.decode_and_invoke(&payload("Reports", None, "echo")).await?;
        assert_eq!(outcome, InvokeOutcome::Invoked(json!([1, "two"])));
        Ok(())
    }

    #[tokio::test]
    async fn raising_finder_reports_missing_records() {
        let mut registry = DelayRegistry::new();
        registry.register(DelayClass::new("Account").find(not_found));

        let result = registry.decode_and_invoke(&payload("Account", Some("9"), "echo")).await;
        assert!(matches!(result, Err(DispatchError::RecordNotFound { ref id, .. }) if id == "9"));
    }

    #[tokio::test]
    async fn nilable_finder_is_preferred_over_raising_one() -> Result<(), DispatchError> {
        let mut registry = DelayRegistry::new();
        let class = registry.register(DelayClass::new("Account").find(found).find_by_id(not_found));
        assert_eq!(class.finder_kind(), Some(FinderKind::FindById));

        let outcome = registry.decode_and_invoke(&payload("Account", Some("9"), "echo")).await?;
        assert_eq!(
            outcome,
            InvokeOutcome::Skipped {
                class: "Account".into(),
                id: "9".into()
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn unknown_classes_and_methods_are_errors() {
        let mut registry = DelayRegistry::new();
        registry.register(DelayClass::new("Account").find_by(found));
        registry.register(DelayClass::new("Orphan"));

        let unknown = registry.decode_and_invoke(&payload("Ghost", Some("1"), "echo")).await;
        assert!(matches!(unknown, Err(DispatchError::UnknownClass(_))));

        let method = registry.decode_and_invoke(&payload("Account", Some("1"), "nope")).await;
        assert!(matches!(method, Err(DispatchError::UnknownMethod { .. })));

        let no_finder = registry.decode_and_invoke(&payload("Orphan", Some("1"), "echo")).await;
        assert!(matches!(
            no_finder,
            Err(DispatchError::UnknownMethod { ref method, .. }) if method == "find"
        ));
    }

    #[test]
    fn deferrable_methods_are_checked_against_declarations() {
        let mut registry = DelayRegistry::new();
        registry.register(
            DelayClass::new("Account")
                .class_methods(Arc::new(Echo))
                .instance_methods(["recalculate"]),
        );

        assert!(registry.check_deferrable("Account", "recalculate").is_ok());
        assert!(registry.check_deferrable("Account", "echo").is_ok());
        assert!(matches!(
            registry.check_deferrable("Account", "explode"),
            Err(DispatchError::UnsupportedDeferredMethod { .. })
        ));
    }
}
