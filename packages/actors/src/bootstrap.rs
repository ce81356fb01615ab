//! Wiring of a complete in-process runtime.

use std::sync::Arc;
use std::time::Duration;

use coord_core::{Clock, CoordinationConfig, KvStore, LockManager};
use ractor::ActorRef;
use tokio::task::JoinHandle;

use crate::client::JobClient;
use crate::handler::JobHandlerRegistry;
use crate::messages::SupervisorMessage;
use crate::queue_actor::ActorQueueEngine;
use crate::supervisor::start_supervisor;

/// A running queue actor, job client and supervised workers.
pub struct Runtime<S> {
    pub client: JobClient<S, ActorQueueEngine>,
    pub supervisor: ActorRef<SupervisorMessage>,
    engine: ActorQueueEngine,
    handles: Vec<JoinHandle<()>>,
}

impl<S: KvStore> Runtime<S> {
    pub fn engine(&self) -> &ActorQueueEngine {
        &self.engine
    }

    /// Stop the workers and the queue actor and wait for them to exit.
    pub async fn shutdown(self) {
        let _ = self.supervisor.send_message(SupervisorMessage::Shutdown);
        self.engine.shutdown();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!("actor task ended abnormally: {}", e);
            }
        }
    }
}

/// Spawn the queue actor, a job client over `store` and `workers` workers.
pub async fn start_runtime<S: KvStore>(
    store: Arc<S>,
    handlers: Arc<JobHandlerRegistry>,
    config: CoordinationConfig,
    workers: usize,
    clock: Arc<dyn Clock>,
) -> Result<Runtime<S>, ractor::SpawnErr> {
    let (engine, engine_handle) = ActorQueueEngine::spawn(clock.clone()).await?;

    let locks = LockManager::new(store, clock, &config);
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let client = JobClient::new(Arc::new(engine.clone()), locks, handlers, config);

    let (supervisor, supervisor_handle) =
        start_supervisor(client.clone(), workers, poll_interval).await?;

    tracing::info!(workers, "job runtime started");
    Ok(Runtime {
        client,
        supervisor,
        engine,
        handles: vec![supervisor_handle, engine_handle],
    })
}
