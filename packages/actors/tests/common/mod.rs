#![allow(dead_code)]

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::{Arc, Mutex};

use actors::{
    ActorQueueEngine, DelayClass, DelayRegistry, InvokeFuture, JobClient, JobHandlerRegistry,
    Receiver,
};
use coord_core::{
    CoordinationConfig, DispatchError, JobId, JobOptions, KvStore, LockManager, ManualClock,
    MemoryKvStore,
};
use db::{DbConfig, SurrealKvStore};
use serde_json::Value;

pub const START: i64 = 1_700_000_000;

/// A job client over a fresh queue actor, driven by a manual clock.
pub struct Harness<S> {
    pub client: JobClient<S, ActorQueueEngine>,
    pub clock: Arc<ManualClock>,
    pub engine: ActorQueueEngine,
}

pub async fn harness(handlers: JobHandlerRegistry) -> Result<Harness<MemoryKvStore>, Box<dyn Error>> {
    let clock = Arc::new(ManualClock::new(START));
    let store = Arc::new(MemoryKvStore::with_clock(clock.clone()));
    build(store, clock, handlers).await
}

pub async fn surreal_harness(handlers: JobHandlerRegistry) -> Result<Harness<SurrealKvStore>, Box<dyn Error>> {
    let clock = Arc::new(ManualClock::new(START));
    let config = DbConfig::memory().with_database(format!("test_{}", JobId::new()));
    let store = SurrealKvStore::connect(&config)
        .await?
        .with_clock(clock.clone());
    build(Arc::new(store), clock, handlers).await
}

async fn build<S: KvStore>(
    store: Arc<S>,
    clock: Arc<ManualClock>,
    handlers: JobHandlerRegistry,
) -> Result<Harness<S>, Box<dyn Error>> {
    let config = CoordinationConfig::default();
    let (engine, _handle) = ActorQueueEngine::spawn(clock.clone()).await?;
    let locks = LockManager::new(store, clock.clone(), &config);
    let client = JobClient::new(Arc::new(engine.clone()), locks, Arc::new(handlers), config);
    Ok(Harness {
        client,
        clock,
        engine,
    })
}

pub fn options(value: Value) -> JobOptions {
    match value {
        Value::Object(map) => map,
        _ => JobOptions::new(),
    }
}

/// Every call made on an account record, as `(id, method, args)`.
pub type Calls = Arc<Mutex<Vec<(String, String, Vec<Value>)>>>;

struct AccountRecord {
    id: String,
    calls: Calls,
}

impl Receiver for AccountRecord {
    fn responds_to(&self, method: &str) -> bool {
        method == "recalculate"
    }

    fn invoke(&self, method: &str, args: Vec<Value>) -> InvokeFuture {
        let calls = self.calls.clone();
        let entry = (self.id.clone(), method.to_string(), args);
        Box::pin(async move {
            calls.lock().unwrap().push(entry);
            Ok(Value::Bool(true))
        })
    }
}

/// Accounts that exist unless their id is `missing`.
pub fn accounts(calls: &Calls) -> DelayClass {
    let calls = calls.clone();
    DelayClass::new("Billing::Account")
        .instance_methods(["recalculate"])
        .find_by(move |id: String| {
            let calls = calls.clone();
            async move {
                if id == "missing" {
                    return Ok::<_, DispatchError>(None);
                }
                Ok(Some(Arc::new(AccountRecord { id, calls }) as Arc<dyn Receiver>))
            }
        })
}

pub fn delay_registry(calls: &Calls) -> Arc<DelayRegistry> {
    let mut registry = DelayRegistry::new();
    registry.register(accounts(calls));
    Arc::new(registry)
}

pub fn recorded(calls: &Calls) -> Vec<(String, String, Vec<Value>)> {
    calls.lock().unwrap().clone()
}

/// Count of each event kind seen so far, by serialized tag.
pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<coord_core::CoordEvent>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    while let Ok(event) = rx.try_recv() {
        let tag = serde_json::to_value(&event)
            .ok()
            .and_then(|v| v.get("event").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        *counts.entry(tag).or_insert(0) += 1;
    }
    counts
}
