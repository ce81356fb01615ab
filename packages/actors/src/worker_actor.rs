//! Worker actor polling queues and performing jobs.

use std::marker::PhantomData;
use std::time::Duration;

use chrono::Utc;
use coord_core::{CoordEvent, JobId, KvStore};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::client::{JobClient, PerformOutcome};
use crate::engine::QueueEngine;
use crate::error::ClientError;
use crate::messages::{WorkerMessage, WorkerStatus};

/// State for the worker actor.
pub struct WorkerActorState<S, E> {
    /// Unique worker ID.
    pub worker_id: String,
    pub client: JobClient<S, E>,
    /// Job being performed, if any.
    pub current_job: Option<JobId>,
    pub processed: u64,
    pub failed: u64,
    /// Whether the worker should continue running.
    pub running: bool,
    /// Pause between polls that found nothing.
    pub poll_interval: Duration,
}

impl<S, E> WorkerActorState<S, E> {
    pub fn new(worker_id: impl Into<String>, client: JobClient<S, E>, poll_interval: Duration) -> Self {
        Self {
            worker_id: worker_id.into(),
            client,
            poll_interval,
            current_job: None,
            processed: 0,
            failed: 0,
            running: true,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.current_job.is_none()
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            worker_id: self.worker_id.clone(),
            current_job: self.current_job,
            processed: self.processed,
            failed: self.failed,
        }
    }
}

impl<S: KvStore, E: QueueEngine> WorkerActorState<S, E> {
    /// Check the queues in priority order and perform the first job found.
    ///
    /// Returns whether a job was performed.
    pub async fn poll_once(&mut self) -> Result<bool, ClientError> {
        for queue in self.client.queues().effective_queues() {
            let Some(envelope) = self.client.engine().pop(&queue).await? else {
                continue;
            };

            self.current_job = Some(envelope.id);
            let outcome = self.client.perform(envelope).await;
            self.current_job = None;
            self.processed += 1;

            match outcome {
                Ok(PerformOutcome::Failed { .. }) => self.failed += 1,
                Ok(_) => {}
                Err(e) => {
                    self.failed += 1;
                    tracing::error!(worker_id = %self.worker_id, %queue, "perform errored: {}", e);
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    fn heartbeat(&self) {
        let _ = self.client.event_sender().send(CoordEvent::WorkerHeartbeat {
            worker_id: self.worker_id.clone(),
            current_job: self.current_job,
            timestamp: Utc::now(),
        });
    }
}

/// Worker actor arguments.
pub struct WorkerArgs<S, E> {
    pub worker_id: String,
    pub client: JobClient<S, E>,
    pub poll_interval: Duration,
}

/// Worker actor that executes jobs.
pub struct WorkerActor<S, E> {
    _marker: PhantomData<fn() -> (S, E)>,
}

impl<S, E> WorkerActor<S, E> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<S, E> Default for WorkerActor<S, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: KvStore, E: QueueEngine> Actor for WorkerActor<S, E> {
    type Msg = WorkerMessage;
    type State = WorkerActorState<S, E>;
    type Arguments = WorkerArgs<S, E>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.worker_id);

        schedule_poll(&myself, args.poll_interval);

        Ok(WorkerActorState::new(args.worker_id, args.client, args.poll_interval))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                if !state.running {
                    myself.stop(None);
                    return Ok(());
                }

                let performed = match state.poll_once().await {
                    Ok(performed) => performed,
                    Err(e) => {
                        tracing::warn!(worker_id = %state.worker_id, "poll failed: {}", e);
                        false
                    }
                };
                state.heartbeat();

                // Only one poll is ever pending; a busy queue is drained
                // without waiting.
                let delay = if performed { Duration::ZERO } else { state.poll_interval };
                schedule_poll(&myself, delay);
            }

            WorkerMessage::Status { reply } => {
                let _ = reply.send(state.status());
            }

            WorkerMessage::Shutdown => {
                tracing::info!("Shutting down worker: {}", state.worker_id);
                state.running = false;
                myself.stop(None);
            }
        }

        Ok(())
    }
}

/// Send one `Poll` to the worker after `delay`.
fn schedule_poll(worker: &ActorRef<WorkerMessage>, delay: Duration) {
    let worker = worker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if worker.send_message(WorkerMessage::Poll).is_err() {
            tracing::debug!("worker stopped before its next poll");
        }
    });
}
