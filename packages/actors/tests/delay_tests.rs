#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::{Arc, Mutex};

use actors::{
    DelayExecutionHandler, DelayOutcome, Delayer, EnqueueOutcome, InvokeOutcome, JobHandlerRegistry,
    PerformOutcome, QueueEngine, WorkerConfig,
};
use coord_core::{DelayOptions, DelayTarget, Delayable, DispatchError, MemoryKvStore, WorkerEnv};
use serde_json::{Value, json};

type TestDelayer = Delayer<MemoryKvStore, actors::ActorQueueEngine>;

type Setup = (common::Harness<MemoryKvStore>, TestDelayer, common::Calls);

async fn setup(env: WorkerEnv) -> Result<Setup, Box<dyn Error>> {
    setup_with(env, |config| config).await
}

async fn setup_with(
    env: WorkerEnv,
    configure: impl FnOnce(WorkerConfig) -> WorkerConfig,
) -> Result<Setup, Box<dyn Error>> {
    let calls: common::Calls = Arc::new(Mutex::new(Vec::new()));
    let registry = common::delay_registry(&calls);

    let mut handlers = JobHandlerRegistry::default();
    handlers.register(DelayExecutionHandler::new(registry.clone()).with_config(configure));
    handlers.queues().register_queue("billing_default", None);

    let h = common::harness(handlers).await?;
    let delayer = Delayer::new(h.client.clone(), registry, env);
    Ok((h, delayer, calls))
}

struct Account {
    id: u64,
}

impl Delayable for Account {
    fn class_name(&self) -> &str {
        "Billing::Account"
    }

    fn id(&self) -> String {
        self.id.to_string()
    }
}

#[tokio::test]
async fn test_queued_call_is_invoked_exactly_once() -> Result<(), Box<dyn Error>> {
    let (h, delayer, calls) = setup(WorkerEnv::client()).await?;
    let args = vec![json!(2024), json!({"full": true, "tags": ["a", "b"]}), Value::Null];

    let outcome = delayer
        .delay_record(&Account { id: 7 }, DelayOptions::new())
        .call("recalculate", args.clone())
        .await?;
    assert!(matches!(
        outcome,
        DelayOutcome::Queued(EnqueueOutcome::Enqueued { ref queue, .. }) if queue == "billing_default"
    ));
    assert!(common::recorded(&calls).is_empty());

    let job = h.engine.pop("billing_default").await?.ok_or("job missing")?;
    assert_eq!(job.worker, "delay_execution");
    assert!(matches!(h.client.perform(job).await?, PerformOutcome::Completed));

    assert_eq!(
        common::recorded(&calls),
        vec![("7".to_string(), "recalculate".to_string(), args)]
    );
    assert_eq!(h.engine.len("billing_default").await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_record_is_skipped_without_failure() -> Result<(), Box<dyn Error>> {
    let (h, delayer, calls) = setup(WorkerEnv::client()).await?;
    let mut events = h.client.subscribe();

    delayer
        .delay(
            DelayTarget::instance("Billing::Account", "missing"),
            DelayOptions::new(),
        )
        .call("recalculate", vec![])
        .await?;
    let job = h.engine.pop("billing_default").await?.ok_or("job missing")?;

    let outcome = h.client.perform(job).await?;
    assert!(matches!(outcome, PerformOutcome::Skipped { .. }));
    assert!(common::recorded(&calls).is_empty());

    let counts = common::drain_events(&mut events);
    assert_eq!(counts.get("job_skipped"), Some(&1));
    assert_eq!(counts.get("job_failed"), None);
    Ok(())
}

#[tokio::test]
async fn test_worker_locked_delayed_calls_requeue_on_contention() -> Result<(), Box<dyn Error>> {
    let (h, delayer, calls) = setup(WorkerEnv::client()).await?;
    let options = DelayOptions::new().worker_lock("account_id");

    for _ in 0..2 {
        delayer
            .delay(DelayTarget::instance("Billing::Account", "7"), options.clone())
            .call("recalculate", vec![])
            .await?;
    }
    let first = h.engine.pop("billing_default").await?.ok_or("first job missing")?;
    let second = h.engine.pop("billing_default").await?.ok_or("second job missing")?;

    // Hold the lock the first job would take.
    let lock = actors::PayloadLock::new(coord_core::LockKind::Worker);
    let key = actors::LockStrategy::store_key(&lock, &first.options).ok_or("no lock key")?;
    assert!(h.client.locks().try_acquire(&key, 60).await?);

    let outcome = h.client.perform(second).await?;
    assert!(matches!(outcome, PerformOutcome::Requeued { .. }));
    assert!(common::recorded(&calls).is_empty());

    h.client.locks().release(&key).await?;
    assert!(matches!(h.client.perform(first).await?, PerformOutcome::Completed));
    assert_eq!(common::recorded(&calls).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_queue_locked_delayed_calls_are_vetoed_until_ttl() -> Result<(), Box<dyn Error>> {
    let (h, delayer, calls) =
        setup_with(WorkerEnv::client(), |config| config.queue_lock_ttl(60)).await?;
    let options = DelayOptions::new().queue_lock("account_id");
    let account = DelayTarget::instance("Billing::Account", "42");

    let first = delayer
        .delay(account.clone(), options.clone())
        .call("recalculate", vec![])
        .await?;
    assert!(matches!(first, DelayOutcome::Queued(EnqueueOutcome::Enqueued { .. })));

    let second = delayer
        .delay(account.clone(), options.clone())
        .call("recalculate", vec![])
        .await?;
    assert!(matches!(
        second,
        DelayOutcome::Queued(EnqueueOutcome::Vetoed { ref hook }) if hook == "queue_lock"
    ));
    assert_eq!(h.engine.len("billing_default").await?, 1);

    // Another account holds its own lock.
    let other = delayer
        .delay(DelayTarget::instance("Billing::Account", "43"), options.clone())
        .call("recalculate", vec![])
        .await?;
    assert!(matches!(other, DelayOutcome::Queued(EnqueueOutcome::Enqueued { .. })));
    assert_eq!(h.engine.len("billing_default").await?, 2);

    h.clock.advance(62);
    let third = delayer
        .delay(account, options)
        .call("recalculate", vec![])
        .await?;
    assert!(matches!(third, DelayOutcome::Queued(EnqueueOutcome::Enqueued { .. })));
    assert_eq!(h.engine.len("billing_default").await?, 3);
    assert!(common::recorded(&calls).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_calls_inside_a_worker_run_inline_unless_scheduled() -> Result<(), Box<dyn Error>> {
    let (h, delayer, calls) = setup(WorkerEnv::worker()).await?;
    let target = DelayTarget::instance("Billing::Account", "7");

    let inline = delayer
        .delay(target.clone(), DelayOptions::new())
        .call("recalculate", vec![json!(1)])
        .await?;
    assert!(matches!(
        inline,
        DelayOutcome::Invoked(InvokeOutcome::Invoked(Value::Bool(true)))
    ));
    assert_eq!(common::recorded(&calls).len(), 1);
    assert_eq!(h.engine.len("billing_default").await?, 0);

    let later = delayer
        .delay(target.clone(), DelayOptions::new().run_at(common::START + 60))
        .call("recalculate", vec![])
        .await?;
    assert!(matches!(
        later,
        DelayOutcome::Queued(EnqueueOutcome::Enqueued { run_at: Some(at), .. }) if at == common::START + 60
    ));

    let forced = delayer
        .delay(target.clone(), DelayOptions::new().force())
        .call("recalculate", vec![])
        .await?;
    assert!(matches!(
        forced,
        DelayOutcome::Queued(EnqueueOutcome::Enqueued { run_at: None, .. })
    ));

    // A past run_at inside a worker is simply due now.
    let past = delayer
        .delay(target, DelayOptions::new().run_at(common::START - 5))
        .call("recalculate", vec![])
        .await?;
    assert!(matches!(past, DelayOutcome::Invoked(_)));

    assert_eq!(common::recorded(&calls).len(), 2);
    assert_eq!(h.engine.len("billing_default").await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_synchronous_calls_never_touch_the_queue() -> Result<(), Box<dyn Error>> {
    let (h, delayer, calls) = setup(WorkerEnv::client()).await?;

    let outcome = delayer
        .delay(
            DelayTarget::instance("Billing::Account", "3"),
            DelayOptions::new().synchronous(),
        )
        .call("recalculate", vec![json!("now")])
        .await?;

    assert!(matches!(outcome, DelayOutcome::Invoked(_)));
    assert_eq!(common::recorded(&calls).len(), 1);
    assert_eq!(h.engine.len("billing_default").await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_async_method_checks_the_method_at_setup() -> Result<(), Box<dyn Error>> {
    let (h, delayer, calls) = setup(WorkerEnv::client()).await?;

    let undefined = delayer.async_method("Billing::Account", "explode", DelayOptions::new());
    assert!(matches!(
        undefined,
        Err(DispatchError::UnsupportedDeferredMethod { ref method, .. }) if method == "explode"
    ));
    assert!(matches!(
        delayer.async_method("Nope", "recalculate", DelayOptions::new()),
        Err(DispatchError::UnknownClass(_))
    ));

    let recalculate = delayer.async_method(
        "Billing::Account",
        "recalculate",
        DelayOptions::new().queue("low"),
    )?;
    let outcome = recalculate.call_on("11", vec![json!(5)]).await?;
    assert!(matches!(
        outcome,
        DelayOutcome::Queued(EnqueueOutcome::Enqueued { ref queue, .. }) if queue == "billing_low"
    ));

    let job = h.engine.pop("billing_low").await?.ok_or("job missing")?;
    assert!(matches!(h.client.perform(job).await?, PerformOutcome::Completed));
    assert_eq!(
        common::recorded(&calls),
        vec![("11".to_string(), "recalculate".to_string(), vec![json!(5)])]
    );
    Ok(())
}

#[tokio::test]
async fn test_unknown_method_fails_the_job() -> Result<(), Box<dyn Error>> {
    let (h, delayer, calls) = setup(WorkerEnv::client()).await?;

    delayer
        .delay(DelayTarget::instance("Billing::Account", "7"), DelayOptions::new())
        .call("vanish", vec![])
        .await?;
    let job = h.engine.pop("billing_default").await?.ok_or("job missing")?;

    let outcome = h.client.perform(job).await?;
    assert!(matches!(outcome, PerformOutcome::Failed { .. }));
    assert!(common::recorded(&calls).is_empty());
    Ok(())
}
