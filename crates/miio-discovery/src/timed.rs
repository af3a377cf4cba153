//! Timed registry: periodic re-search and stale eviction

use crate::{BasicDiscovery, DiscoveryEvent, Service};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::debug;

/// The active half of a timed registry: how to go looking for services
#[async_trait]
pub trait Searcher: Send + Sync + 'static {
    /// Issue one search pass. Must not fail; failures are the searcher's
    /// to log and swallow.
    async fn search(&self);
}

/// Timing knobs for [`TimedDiscovery`]
#[derive(Debug, Clone)]
pub struct TimedConfig {
    /// How often to re-run the searcher
    pub search_interval: Duration,
    /// How often to sweep for stale services
    pub sweep_interval: Duration,
    /// Services unseen for longer than this are evicted
    pub max_stale: Duration,
}

impl Default for TimedConfig {
    fn default() -> Self {
        Self {
            search_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            max_stale: Duration::from_secs(60),
        }
    }
}

/// A registry that searches on a schedule and evicts services that have
/// not been sighted recently
///
/// `start` runs the searcher once immediately, then on every
/// `search_interval` tick; a second task sweeps every `sweep_interval`.
/// Both are plain background tasks: they never keep a shutdown waiting
/// and die with the registry. `start`/`stop` are idempotent.
pub struct TimedDiscovery<S: Service> {
    registry: BasicDiscovery<S>,
    timestamps: Arc<Mutex<HashMap<String, Instant>>>,
    searcher: Arc<dyn Searcher>,
    config: TimedConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Service> TimedDiscovery<S> {
    pub fn new(searcher: impl Searcher, config: TimedConfig) -> Self {
        Self {
            registry: BasicDiscovery::new(),
            timestamps: Arc::new(Mutex::new(HashMap::new())),
            searcher: Arc::new(searcher),
            config,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the search and sweep schedules
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let searcher = Arc::clone(&self.searcher);
        let search_interval = self.config.search_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(search_interval);
            loop {
                ticker.tick().await;
                searcher.search().await;
            }
        }));

        let registry = self.registry.clone();
        let timestamps = Arc::clone(&self.timestamps);
        let sweep_interval = self.config.sweep_interval;
        let max_stale = self.config.max_stale;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                sweep(&registry, &timestamps, max_stale);
            }
        }));
    }

    /// Stop the schedules; the registry contents stay intact
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Whether the schedules are running
    pub fn is_started(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// Register or refresh a service, stamping its sighting time
    pub fn add_service(&self, service: S) {
        self.timestamps.lock().insert(service.id(), Instant::now());
        self.registry.add_service(service);
    }

    /// Remove a service and its sighting timestamp
    pub fn remove_service(&self, id: &str) -> Option<S> {
        self.timestamps.lock().remove(id);
        self.registry.remove_service(id)
    }

    /// When the service was last sighted
    pub fn last_seen(&self, id: &str) -> Option<Instant> {
        self.timestamps.lock().get(id).copied()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent<S>> {
        self.registry.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<S> {
        self.registry.get(id)
    }

    pub fn services(&self) -> Vec<S> {
        self.registry.services()
    }
}

impl<S: Service> Drop for TimedDiscovery<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweep<S: Service>(
    registry: &BasicDiscovery<S>,
    timestamps: &Mutex<HashMap<String, Instant>>,
    max_stale: Duration,
) {
    let stale: Vec<String> = {
        let timestamps = timestamps.lock();
        timestamps
            .iter()
            .filter(|(_, seen)| seen.elapsed() > max_stale)
            .map(|(id, _)| id.clone())
            .collect()
    };
    for id in stale {
        debug!("evicting stale service {id}");
        timestamps.lock().remove(&id);
        registry.remove_service(&id);
    }
}
