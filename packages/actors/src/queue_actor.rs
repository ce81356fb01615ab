//! In-memory queue engine run as an actor.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use coord_core::{Clock, Envelope};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef, MessagingErr};

use crate::engine::QueueEngine;
use crate::error::EngineError;
use crate::messages::QueueMessage;

/// A job waiting for its due time (earliest first, then submission order).
#[derive(Debug, Clone)]
struct ScheduledJob {
    run_at: i64,
    seq: u64,
    envelope: Envelope,
}

impl PartialEq for ScheduledJob {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl Eq for ScheduledJob {}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: reverse so the earliest run_at pops first.
        match other.run_at.cmp(&self.run_at) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            other => other,
        }
    }
}

#[derive(Debug, Default)]
struct NamedQueue {
    ready: VecDeque<Envelope>,
    scheduled: BinaryHeap<ScheduledJob>,
}

impl NamedQueue {
    /// Move every job whose time has come onto the ready list.
    fn promote_due(&mut self, now: i64) {
        while self.scheduled.peek().is_some_and(|job| job.run_at <= now) {
            if let Some(job) = self.scheduled.pop() {
                self.ready.push_back(job.envelope);
            }
        }
    }

    fn len(&self) -> usize {
        self.ready.len() + self.scheduled.len()
    }
}

/// Queues by name with due-time scheduling.
pub struct ScheduledQueues {
    queues: HashMap<String, NamedQueue>,
    clock: Arc<dyn Clock>,
    seq: u64,
}

impl ScheduledQueues {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: HashMap::new(),
            clock,
            seq: 0,
        }
    }

    pub fn push(&mut self, queue: &str, envelope: Envelope) {
        self.queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(envelope);
    }

    pub fn enqueue_at(&mut self, queue: &str, run_at: i64, envelope: Envelope) {
        self.seq += 1;
        let job = ScheduledJob {
            run_at,
            seq: self.seq,
            envelope,
        };
        self.queues
            .entry(queue.to_string())
            .or_default()
            .scheduled
            .push(job);
    }

    pub fn pop(&mut self, queue: &str) -> Option<Envelope> {
        let now = self.clock.now();
        let named = self.queues.get_mut(queue)?;
        named.promote_due(now);
        named.ready.pop_front()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, NamedQueue::len)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(|q| q.len() == 0)
    }
}

/// Queue actor owning every named queue of the process.
pub struct QueueActor;

impl Actor for QueueActor {
    type Msg = QueueMessage;
    type State = ScheduledQueues;
    type Arguments = Arc<dyn Clock>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        clock: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting queue actor");
        Ok(ScheduledQueues::new(clock))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            QueueMessage::Push {
                queue,
                envelope,
                reply,
            } => {
                state.push(&queue, *envelope);
                let _ = reply.send(());
            }

            QueueMessage::EnqueueAt {
                queue,
                run_at,
                envelope,
                reply,
            } => {
                state.enqueue_at(&queue, run_at, *envelope);
                let _ = reply.send(());
            }

            QueueMessage::Pop { queue, reply } => {
                let _ = reply.send(state.pop(&queue));
            }

            QueueMessage::Len { queue, reply } => {
                let _ = reply.send(state.len(&queue));
            }

            QueueMessage::Shutdown => {
                tracing::info!("Shutting down queue actor");
                myself.stop(None);
            }
        }

        Ok(())
    }
}

/// [`QueueEngine`] backed by a [`QueueActor`].
#[derive(Clone)]
pub struct ActorQueueEngine {
    actor: ActorRef<QueueMessage>,
    timeout: Duration,
}

impl ActorQueueEngine {
    pub fn new(actor: ActorRef<QueueMessage>) -> Self {
        Self {
            actor,
            timeout: Duration::from_secs(5),
        }
    }

    /// Spawn a fresh queue actor and wrap it.
    pub async fn spawn(
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
        let (actor, handle) = Actor::spawn(None, QueueActor, clock).await?;
        Ok((Self::new(actor), handle))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn actor(&self) -> &ActorRef<QueueMessage> {
        &self.actor
    }

    pub fn shutdown(&self) {
        let _ = self.actor.send_message(QueueMessage::Shutdown);
    }

    async fn call<T, F>(&self, msg_builder: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(ractor::RpcReplyPort<T>) -> QueueMessage,
    {
        let result = ractor::rpc::call(&self.actor, msg_builder, Some(self.timeout))
            .await
            .map_err(|e: MessagingErr<QueueMessage>| EngineError::Messaging(e.to_string()))?;
        match result {
            CallResult::Success(value) => Ok(value),
            CallResult::Timeout => Err(EngineError::Timeout),
            CallResult::SenderError => {
                Err(EngineError::Unavailable("queue actor dropped the reply".into()))
            }
        }
    }
}

impl QueueEngine for ActorQueueEngine {
    async fn push(&self, queue: &str, envelope: Envelope) -> Result<(), EngineError> {
        self.call(|reply| QueueMessage::Push {
            queue: queue.to_string(),
            envelope: Box::new(envelope),
            reply,
        })
        .await
    }

    async fn pop(&self, queue: &str) -> Result<Option<Envelope>, EngineError> {
        self.call(|reply| QueueMessage::Pop {
            queue: queue.to_string(),
            reply,
        })
        .await
    }

    async fn enqueue_at(&self, queue: &str, run_at: i64, envelope: Envelope) -> Result<(), EngineError> {
        self.call(|reply| QueueMessage::EnqueueAt {
            queue: queue.to_string(),
            run_at,
            envelope: Box::new(envelope),
            reply,
        })
        .await
    }

    async fn len(&self, queue: &str) -> Result<usize, EngineError> {
        self.call(|reply| QueueMessage::Len {
            queue: queue.to_string(),
            reply,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord_core::{JobOptions, ManualClock};

    fn envelope(worker: &str) -> Envelope {
        Envelope::new(worker, JobOptions::new())
    }

    #[test]
    fn ready_jobs_pop_in_fifo_order() {
        let mut queues = ScheduledQueues::new(Arc::new(ManualClock::new(100)));
        queues.push("q", envelope("first"));
        queues.push("q", envelope("second"));

        assert_eq!(queues.pop("q").map(|e| e.worker), Some("first".to_string()));
        assert_eq!(queues.pop("q").map(|e| e.worker), Some("second".to_string()));
        assert!(queues.pop("q").is_none());
        assert!(queues.pop("unknown").is_none());
    }

    #[test]
    fn scheduled_jobs_wait_for_their_time() {
        let clock = Arc::new(ManualClock::new(100));
        let mut queues = ScheduledQueues::new(clock.clone());
        queues.enqueue_at("q", 105, envelope("later"));
        queues.enqueue_at("q", 101, envelope("sooner"));

        assert_eq!(queues.len("q"), 2);
        assert!(queues.pop("q").is_none());

        clock.advance(1);
        assert_eq!(queues.pop("q").map(|e| e.worker), Some("sooner".to_string()));
        assert!(queues.pop("q").is_none());

        clock.advance(4);
        assert_eq!(queues.pop("q").map(|e| e.worker), Some("later".to_string()));
        assert!(queues.is_empty());
    }

    #[tokio::test]
    async fn actor_engine_round_trips_jobs() -> Result<(), Box<dyn std::error::Error>> {
        let clock = Arc::new(ManualClock::new(100));
        let (engine, _handle) = ActorQueueEngine::spawn(clock.clone()).await?;

        engine.push("q", envelope("now")).await?;
        engine.enqueue_at("q", 110, envelope("later")).await?;
        assert_eq!(engine.len("q").await?, 2);

        assert_eq!(engine.pop("q").await?.map(|e| e.worker), Some("now".to_string()));
        assert!(engine.pop("q").await?.is_none());

        clock.set(110);
        assert_eq!(engine.pop("q").await?.map(|e| e.worker), Some("later".to_string()));

        engine.shutdown();
        Ok(())
    }
}
