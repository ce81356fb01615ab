//! Job payload types: the generic options map, the queued envelope and the
//! delayed method-invocation payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::naming;

/// String-keyed options map every job carries through the queue engine.
pub type JobOptions = serde_json::Map<String, Value>;

/// Option key holding the resolved queue a job was enqueued to.
pub const FULL_QUEUE_KEY: &str = "full_queue";
/// Option key holding the scheduled run time (unix seconds).
pub const RUN_AT_KEY: &str = "run_at";
/// Queue used when a caller does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Unique identifier for a queued job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the queue engine stores: a worker name plus its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: JobId,
    /// Name of the registered worker that performs this job.
    pub worker: String,
    pub options: JobOptions,
    /// Number of failed attempts that led to this submission.
    #[serde(default)]
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(worker: impl Into<String>, options: JobOptions) -> Self {
        Self {
            id: JobId::new(),
            worker: worker.into(),
            options,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// The queue recorded in the options at enqueue time.
    pub fn full_queue(&self) -> Option<&str> {
        self.options.get(FULL_QUEUE_KEY).and_then(Value::as_str)
    }
}

/// Receiver of a deferred call: a class itself or one of its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayTarget {
    Class(String),
    Instance { class_name: String, id: String },
}

impl DelayTarget {
    pub fn class(name: impl Into<String>) -> Self {
        DelayTarget::Class(name.into())
    }

    pub fn instance(class_name: impl Into<String>, id: impl Into<String>) -> Self {
        DelayTarget::Instance {
            class_name: class_name.into(),
            id: id.into(),
        }
    }

    pub fn class_name(&self) -> &str {
        match self {
            DelayTarget::Class(name) => name,
            DelayTarget::Instance { class_name, .. } => class_name,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            DelayTarget::Class(_) => None,
            DelayTarget::Instance { id, .. } => Some(id),
        }
    }
}

/// Records that can be the receiver of a deferred call.
pub trait Delayable {
    fn class_name(&self) -> &str;

    /// Generic identifier of the record.
    fn id(&self) -> String;

    /// Dedicated identifier used for deferred calls, preferred over `id`.
    fn delay_id(&self) -> Option<String> {
        None
    }

    fn delay_target(&self) -> DelayTarget {
        DelayTarget::instance(
            self.class_name(),
            self.delay_id().unwrap_or_else(|| self.id()),
        )
    }
}

/// When a deferred call should run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunAt {
    /// Normal dispatch: queued from clients, inline inside workers.
    #[default]
    Now,
    /// No earlier than the given unix timestamp.
    At(i64),
    /// Always go through the queue, even inside a worker.
    Force,
}

/// Options of a deferred call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelayOptions {
    pub run_at: RunAt,
    /// Invoke in-process instead of queueing.
    pub synchronous: bool,
    pub queue_namespace: Option<String>,
    pub queue: Option<String>,
    pub lock_namespace: Option<String>,
    /// Attribute the queue lock is keyed on.
    pub queue_lock_key: Option<String>,
    /// Attribute the worker lock is keyed on.
    pub worker_lock_key: Option<String>,
}

impl DelayOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_at(mut self, timestamp: i64) -> Self {
        self.run_at = RunAt::At(timestamp);
        self
    }

    pub fn force(mut self) -> Self {
        self.run_at = RunAt::Force;
        self
    }

    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn queue_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.queue_namespace = Some(namespace.into());
        self
    }

    pub fn lock_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.lock_namespace = Some(namespace.into());
        self
    }

    pub fn queue_lock(mut self, attribute: impl Into<String>) -> Self {
        self.queue_lock_key = Some(attribute.into());
        self
    }

    pub fn worker_lock(mut self, attribute: impl Into<String>) -> Self {
        self.worker_lock_key = Some(attribute.into());
        self
    }
}

/// Flat payload describing one deferred method call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedJobPayload {
    pub class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method_name: String,
    #[serde(default, deserialize_with = "nullable_args")]
    pub args: Vec<Value>,
    pub queue_namespace: String,
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_namespace: Option<String>,
    /// Name of the attribute field the queue lock is keyed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_lock: Option<String>,
    /// Name of the attribute field the worker lock is keyed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_lock: Option<String>,
    /// Lock attribute fields and any options added along the way.
    #[serde(flatten)]
    pub extra: JobOptions,
}

fn nullable_args<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Build the payload for `target.method_name(args…)`.
///
/// `run_at` is only recorded for a concrete timestamp. A requested lock key
/// names an attribute field which receives the record id.
pub fn encode(
    target: &DelayTarget,
    method_name: &str,
    args: Vec<Value>,
    options: &DelayOptions,
) -> DelayedJobPayload {
    let class_name = target.class_name().to_string();
    let id = target.id().map(str::to_string);
    let queue_namespace = options
        .queue_namespace
        .clone()
        .unwrap_or_else(|| naming::namespace_from_class(&class_name));

    let mut payload = DelayedJobPayload {
        class_name,
        id,
        method_name: method_name.to_string(),
        args,
        queue_namespace,
        queue: options
            .queue
            .clone()
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
        run_at: match options.run_at {
            RunAt::At(ts) => Some(ts),
            RunAt::Now | RunAt::Force => None,
        },
        lock_namespace: options.lock_namespace.clone(),
        queue_lock: options.queue_lock_key.clone(),
        worker_lock: options.worker_lock_key.clone(),
        extra: JobOptions::new(),
    };

    for attribute in [&options.queue_lock_key, &options.worker_lock_key]
        .into_iter()
        .flatten()
    {
        payload.set_attribute(attribute, payload.id.clone().map(Value::String));
    }

    payload
}

impl DelayedJobPayload {
    /// Decode a payload from job options.
    pub fn from_options(options: &JobOptions) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(options.clone()))
    }

    /// Encode into the options map stored by the queue engine.
    pub fn to_options(&self) -> Result<JobOptions, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            // A struct always serializes to an object.
            _ => Ok(JobOptions::new()),
        }
    }

    /// Set a dynamic attribute field. Known fields are never shadowed.
    pub fn set_attribute(&mut self, name: &str, value: Option<Value>) {
        const KNOWN: [&str; 10] = [
            "class_name",
            "id",
            "method_name",
            "args",
            "queue_namespace",
            "queue",
            "run_at",
            "lock_namespace",
            "queue_lock",
            "worker_lock",
        ];
        if KNOWN.contains(&name) {
            return;
        }
        self.extra
            .insert(name.to_string(), value.unwrap_or(Value::Null));
    }

    /// Whether the call targets the class rather than a record.
    pub fn targets_class(&self) -> bool {
        self.id.is_none()
    }

    /// Full name of the queue this payload asks for.
    pub fn full_queue(&self) -> String {
        naming::full_queue_name(&self.queue_namespace, &self.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Account {
        id: u64,
        slug: Option<String>,
    }

    impl Delayable for Account {
        fn class_name(&self) -> &str {
            "Billing::Account"
        }

        fn id(&self) -> String {
            self.id.to_string()
        }

        fn delay_id(&self) -> Option<String> {
            self.slug.clone()
        }
    }

    #[test]
    fn encodes_class_target_without_id() {
        let payload = encode(
            &DelayTarget::class("Reports"),
            "rebuild",
            vec![json!(1), json!("x")],
            &DelayOptions::new(),
        );
        assert_eq!(payload.class_name, "Reports");
        assert_eq!(payload.id, None);
        assert_eq!(payload.args, vec![json!(1), json!("x")]);
        assert_eq!(payload.queue_namespace, "worker");
        assert_eq!(payload.queue, "default");
        assert_eq!(payload.run_at, None);
        assert!(payload.targets_class());
    }

    #[test]
    fn instance_target_prefers_delay_id() {
        let with_slug = Account {
            id: 7,
            slug: Some("acme".into()),
        };
        let without_slug = Account { id: 7, slug: None };
        assert_eq!(with_slug.delay_target().id(), Some("acme"));
        assert_eq!(without_slug.delay_target().id(), Some("7"));

        let payload = encode(
            &without_slug.delay_target(),
            "sync",
            vec![],
            &DelayOptions::new(),
        );
        assert_eq!(payload.queue_namespace, "billing");
        assert_eq!(payload.full_queue(), "billing_default");
    }

    #[test]
    fn run_at_only_recorded_for_timestamps() {
        let target = DelayTarget::class("Reports");
        let at = encode(&target, "go", vec![], &DelayOptions::new().run_at(1_700_000_000));
        let forced = encode(&target, "go", vec![], &DelayOptions::new().force());
        assert_eq!(at.run_at, Some(1_700_000_000));
        assert_eq!(forced.run_at, None);
    }

    #[test]
    fn lock_keys_copy_the_id_into_attribute_fields() -> Result<(), serde_json::Error> {
        let payload = encode(
            &DelayTarget::instance("Account", "42"),
            "sync",
            vec![],
            &DelayOptions::new()
                .queue_lock("account_id")
                .worker_lock("account_id")
                .lock_namespace("accounts"),
        );
        let options = payload.to_options()?;
        assert_eq!(options.get("queue_lock"), Some(&json!("account_id")));
        assert_eq!(options.get("worker_lock"), Some(&json!("account_id")));
        assert_eq!(options.get("account_id"), Some(&json!("42")));
        assert_eq!(options.get("lock_namespace"), Some(&json!("accounts")));
        Ok(())
    }

    #[test]
    fn payload_survives_the_options_map() -> Result<(), serde_json::Error> {
        let mut payload = encode(
            &DelayTarget::instance("Account", "42"),
            "sync",
            vec![json!({"deep": [1, 2]}), json!(null)],
            &DelayOptions::new().queue("low").queue_lock("account_id"),
        );
        payload
            .extra
            .insert(FULL_QUEUE_KEY.to_string(), json!("worker_low"));

        let wire = serde_json::to_string(&payload.to_options()?)?;
        let options: JobOptions = serde_json::from_str(&wire)?;
        assert_eq!(DelayedJobPayload::from_options(&options)?, payload);
        Ok(())
    }

    #[test]
    fn missing_or_null_args_decode_as_empty() -> Result<(), serde_json::Error> {
        let base = json!({
            "class_name": "Reports",
            "method_name": "rebuild",
            "queue_namespace": "worker",
            "queue": "default",
        });
        let Value::Object(mut options) = base else {
            unreachable!()
        };
        assert!(DelayedJobPayload::from_options(&options)?.args.is_empty());

        options.insert("args".into(), Value::Null);
        assert!(DelayedJobPayload::from_options(&options)?.args.is_empty());
        Ok(())
    }
}
