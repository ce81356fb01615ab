//! Weighted queue registry producing the polling order of workers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_QUEUE_WEIGHT;
use crate::naming;

/// A declared queue and its optional weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl QueueEntry {
    pub fn new(name: impl Into<String>, weight: Option<u32>) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// A registered worker whose queue is resolved when the order is computed.
pub trait QueueSource: Send + Sync {
    fn worker_name(&self) -> &str;

    /// The queue this worker currently consumes from.
    fn queue_name(&self) -> String;
}

/// Queues contributed by collaborators outside this registry, such as an
/// event-routing layer.
pub trait ExternalQueues: Send + Sync {
    fn queues(&self) -> Vec<QueueEntry>;
}

/// Fixed list of externally routed queues.
#[derive(Debug, Clone, Default)]
pub struct StaticQueues(pub Vec<QueueEntry>);

impl ExternalQueues for StaticQueues {
    fn queues(&self) -> Vec<QueueEntry> {
        self.0.clone()
    }
}

/// Merge `weight` into `map[name]`, keeping the highest declared weight.
fn merge_weight(map: &mut HashMap<String, Option<u32>>, name: &str, weight: Option<u32>) {
    let slot = map.entry(name.to_string()).or_insert(None);
    if let Some(weight) = weight
        && slot.is_none_or(|current| weight > current)
    {
        *slot = Some(weight);
    }
}

/// Registrations are plain data, so a lock poisoned by a panicking writer is
/// recovered rather than dropping the declaration.
fn write_recovering<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!(registry = what, "queue registry lock poisoned, recovering");
        poisoned.into_inner()
    })
}

fn read_recovering<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!(registry = what, "queue registry lock poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Collects workers and queue declarations for the life of a process.
pub struct QueueRegistry {
    default_weight: u32,
    workers: RwLock<BTreeMap<String, Arc<dyn QueueSource>>>,
    queues: RwLock<HashMap<String, Option<u32>>>,
    external: RwLock<Vec<Arc<dyn ExternalQueues>>>,
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("default_weight", &self.default_weight)
            .field("workers", &self.worker_names())
            .field("queues", &*read_recovering(&self.queues, "queues"))
            .finish()
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_WEIGHT)
    }
}

impl QueueRegistry {
    pub fn new(default_weight: u32) -> Self {
        Self {
            default_weight,
            workers: RwLock::new(BTreeMap::new()),
            queues: RwLock::new(HashMap::new()),
            external: RwLock::new(Vec::new()),
        }
    }

    pub fn default_weight(&self) -> u32 {
        self.default_weight
    }

    /// Record that a worker participates; its queue is resolved lazily.
    pub fn register_worker(&self, worker: Arc<dyn QueueSource>) {
        let name = worker.worker_name().to_string();
        write_recovering(&self.workers, "workers").insert(name, worker);
    }

    /// Declare a queue. Repeated declarations keep the highest weight.
    pub fn register_queue(&self, name: impl AsRef<str>, weight: Option<u32>) {
        let mut queues = write_recovering(&self.queues, "queues");
        merge_weight(&mut queues, name.as_ref(), weight);
    }

    /// Add a source of externally routed queues.
    pub fn register_external(&self, source: Arc<dyn ExternalQueues>) {
        write_recovering(&self.external, "external").push(source);
    }

    /// Scoped handle declaring queues under an application key.
    pub fn app(&self, app_key: &str) -> AppQueues<'_> {
        AppQueues {
            registry: self,
            app_key: naming::normalize(app_key),
        }
    }

    pub fn worker_names(&self) -> Vec<String> {
        read_recovering(&self.workers, "workers")
            .keys()
            .cloned()
            .collect()
    }

    /// Effective weight of a declared queue.
    pub fn weight(&self, name: &str) -> u32 {
        read_recovering(&self.queues, "queues")
            .get(name)
            .copied()
            .flatten()
            .unwrap_or(self.default_weight)
    }

    /// Every queue name with its effective weight, without ordering.
    pub fn weighted_queues(&self) -> HashMap<String, u32> {
        let mut merged: HashMap<String, Option<u32>> =
            read_recovering(&self.queues, "queues").clone();

        let workers: Vec<Arc<dyn QueueSource>> = read_recovering(&self.workers, "workers")
            .values()
            .cloned()
            .collect();
        for worker in workers {
            merge_weight(&mut merged, &worker.queue_name(), None);
        }

        let external: Vec<Arc<dyn ExternalQueues>> =
            read_recovering(&self.external, "external").clone();
        for source in external {
            for entry in source.queues() {
                merge_weight(&mut merged, &entry.name, entry.weight);
            }
        }

        merged
            .into_iter()
            .map(|(name, weight)| (name, weight.unwrap_or(self.default_weight)))
            .collect()
    }

    /// Queue names in the order a polling worker should check them.
    ///
    /// Names are shuffled on every call and then stably sorted by weight,
    /// highest first, so equal-weight queues rotate fairly.
    pub fn effective_queues(&self) -> Vec<String> {
        let weights = self.weighted_queues();
        let mut names: Vec<String> = weights.keys().cloned().collect();
        names.shuffle(&mut rand::rng());
        names.sort_by(|a, b| weights[b].cmp(&weights[a]));
        names
    }

    /// Whether any polling worker would check `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.weighted_queues().contains_key(name)
    }

    /// Forget every registration.
    pub fn clear(&self) {
        write_recovering(&self.workers, "workers").clear();
        write_recovering(&self.queues, "queues").clear();
        write_recovering(&self.external, "external").clear();
    }
}

/// Queue declarations scoped to one application key.
pub struct AppQueues<'a> {
    registry: &'a QueueRegistry,
    app_key: String,
}

impl AppQueues<'_> {
    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    /// Declare `<app_key>_<name>`.
    pub fn queue(&self, name: &str, weight: Option<u32>) -> &Self {
        self.registry
            .register_queue(naming::full_queue_name(&self.app_key, name), weight);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedWorker {
        name: String,
        queue: String,
    }

    impl QueueSource for FixedWorker {
        fn worker_name(&self) -> &str {
            &self.name
        }

        fn queue_name(&self) -> String {
            self.queue.clone()
        }
    }

    #[test]
    fn highest_declared_weight_wins() {
        let registry = QueueRegistry::default();
        registry.register_queue("q1", Some(50));
        registry.register_queue("q1", Some(200));
        registry.register_queue("q1", Some(75));
        registry.register_queue("q1", None);
        registry.register_queue("q2", None);

        assert_eq!(registry.weight("q1"), 200);
        assert_eq!(registry.weight("q2"), 100);
        assert_eq!(registry.weight("unknown"), 100);
    }

    #[test]
    fn ordering_follows_weight_across_shuffles() {
        let registry = QueueRegistry::default();
        registry.register_queue("c", Some(50));
        registry.register_queue("a", Some(200));
        registry.register_queue("b", None);

        for _ in 0..50 {
            assert_eq!(registry.effective_queues(), vec!["a", "b", "c"]);
        }
    }

    #[test]
    fn equal_weights_are_all_listed() {
        let registry = QueueRegistry::default();
        for name in ["x", "y", "z"] {
            registry.register_queue(name, None);
        }
        let mut seen = registry.effective_queues();
        seen.sort();
        assert_eq!(seen, vec!["x", "y", "z"]);
    }

    #[test]
    fn workers_and_external_sources_contribute_queues() {
        let registry = QueueRegistry::default();
        registry.register_worker(Arc::new(FixedWorker {
            name: "Sync".into(),
            queue: "billing_default".into(),
        }));
        registry.register_queue("billing_default", Some(300));
        registry.register_external(Arc::new(StaticQueues(vec![
            QueueEntry::new("bus_incoming", Some(1)),
            QueueEntry::new("app_events", None),
        ])));

        let order = registry.effective_queues();
        assert_eq!(order.first().map(String::as_str), Some("billing_default"));
        assert_eq!(order.last().map(String::as_str), Some("bus_incoming"));
        assert_eq!(order.len(), 3);
        assert!(registry.contains("app_events"));
        assert_eq!(registry.worker_names(), vec!["Sync"]);
    }

    #[test]
    fn worker_queue_does_not_override_declared_weight() {
        let registry = QueueRegistry::default();
        registry.register_queue("slow", Some(10));
        registry.register_worker(Arc::new(FixedWorker {
            name: "Slow".into(),
            queue: "slow".into(),
        }));
        assert_eq!(registry.weighted_queues().get("slow"), Some(&10));
    }

    #[test]
    fn app_scope_prefixes_queue_names() {
        let registry = QueueRegistry::default();
        registry
            .app("My App")
            .queue("low", Some(5))
            .queue("high", Some(500));
        assert_eq!(registry.effective_queues(), vec!["my_app_high", "my_app_low"]);
    }

    #[test]
    fn clear_resets_registrations() {
        let registry = QueueRegistry::default();
        registry.register_queue("q", None);
        registry.clear();
        assert!(registry.effective_queues().is_empty());
    }

    #[test]
    fn poisoned_registry_keeps_accepting_declarations() {
        let registry = Arc::new(QueueRegistry::default());
        let poisoner = registry.clone();
        let result = std::thread::spawn(move || {
            let _queues = poisoner.queues.write().unwrap();
            panic!("declaration panicked while holding the lock");
        })
        .join();
        assert!(result.is_err());
        assert!(registry.queues.is_poisoned());

        registry.register_queue("billing_default", Some(50));
        assert!(registry.contains("billing_default"));
        assert_eq!(registry.weight("billing_default"), 50);
    }
}
