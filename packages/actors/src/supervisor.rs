//! Supervisor actor owning the polling workers.

use std::marker::PhantomData;
use std::time::Duration;

use coord_core::{CoordEvent, KvStore};
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::sync::broadcast;

use crate::client::JobClient;
use crate::engine::QueueEngine;
use crate::messages::{SupervisorMessage, WorkerMessage};
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// State for the supervisor actor.
pub struct SupervisorState {
    /// Worker actors, in spawn order.
    pub workers: Vec<ActorRef<WorkerMessage>>,
    /// Event broadcaster shared with the job client.
    pub event_tx: broadcast::Sender<CoordEvent>,
}

/// Supervisor arguments.
pub struct SupervisorArgs<S, E> {
    pub client: JobClient<S, E>,
    /// Number of polling workers to spawn.
    pub workers: usize,
    pub poll_interval: Duration,
}

/// Supervisor actor that spawns and watches the workers.
pub struct Supervisor<S, E> {
    _marker: PhantomData<fn() -> (S, E)>,
}

impl<S, E> Supervisor<S, E> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<S, E> Default for Supervisor<S, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: KvStore, E: QueueEngine> Actor for Supervisor<S, E> {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs<S, E>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting job supervisor with {} workers", args.workers);

        let mut workers = Vec::with_capacity(args.workers);
        for n in 1..=args.workers {
            let worker_args = WorkerArgs {
                worker_id: format!("worker-{}", n),
                client: args.client.clone(),
                poll_interval: args.poll_interval,
            };
            let (worker, _handle) =
                Actor::spawn_linked(None, WorkerActor::new(), worker_args, myself.get_cell())
                    .await
                    .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;
            workers.push(worker);
        }

        Ok(SupervisorState {
            workers,
            event_tx: args.client.event_sender().clone(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::ListWorkers { reply } => {
                let _ = reply.send(state.workers.clone());
            }

            SupervisorMessage::Subscribe { sender } => {
                // Merge event streams - forward from our channel to subscriber's
                let mut rx = state.event_tx.subscribe();
                tokio::spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        if sender.send(event).is_err() {
                            break;
                        }
                    }
                });
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down supervisor");
                for worker in &state.workers {
                    let _ = worker.send_message(WorkerMessage::Shutdown);
                }
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                tracing::debug!("Worker {} terminated: {:?}", cell.get_id(), reason);
                state.workers.retain(|w| w.get_id() != cell.get_id());
            }
            SupervisionEvent::ActorFailed(cell, error) => {
                tracing::warn!("Worker {} failed: {}", cell.get_id(), error);
                state.workers.retain(|w| w.get_id() != cell.get_id());
            }
            _ => {}
        }
        Ok(())
    }
}

/// Start a supervisor polling with `workers` workers.
pub async fn start_supervisor<S: KvStore, E: QueueEngine>(
    client: JobClient<S, E>,
    workers: usize,
    poll_interval: Duration,
) -> Result<(ActorRef<SupervisorMessage>, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
    let args = SupervisorArgs {
        client,
        workers,
        poll_interval,
    };
    Actor::spawn(None, Supervisor::new(), args).await
}
