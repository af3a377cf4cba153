//! Mapping pipeline over another registry

use crate::{BasicDiscovery, DiscoveryEvent, Service};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Default)]
struct MapState {
    /// Per-parent-id version counter; a mapper result older than the
    /// current version is dropped
    versions: HashMap<String, u64>,
    /// parent id -> id the mapped value registered under
    mapped_ids: HashMap<String, String>,
}

/// Pipes a parent registry through an asynchronous mapper
///
/// Every `available`/`update` from the parent bumps a per-id version and
/// runs the mapper; results that lose the race to a newer sighting are
/// dropped. Mapper failures are swallowed; the next parent event retries.
/// Parent unavailability clears the version and the mapped record and is
/// forwarded downstream.
pub struct MappedDiscovery<T: Service> {
    registry: BasicDiscovery<T>,
    state: Arc<Mutex<MapState>>,
    pump: JoinHandle<()>,
}

impl<T: Service> MappedDiscovery<T> {
    pub fn new<S, F, Fut, E>(parent: broadcast::Receiver<DiscoveryEvent<S>>, mapper: F) -> Self
    where
        S: Service,
        F: Fn(S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let registry = BasicDiscovery::new();
        let state = Arc::new(Mutex::new(MapState::default()));
        let pump = tokio::spawn(pump_events(
            parent,
            Arc::new(mapper),
            registry.clone(),
            Arc::clone(&state),
        ));
        Self {
            registry,
            state,
            pump,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent<T>> {
        self.registry.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.registry.get(id)
    }

    pub fn services(&self) -> Vec<T> {
        self.registry.services()
    }

    /// Current mapping version for a parent id (testing/diagnostics)
    pub fn version_of(&self, parent_id: &str) -> Option<u64> {
        self.state.lock().versions.get(parent_id).copied()
    }
}

impl<T: Service> Drop for MappedDiscovery<T> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_events<S, T, F, Fut, E>(
    mut parent: broadcast::Receiver<DiscoveryEvent<S>>,
    mapper: Arc<F>,
    registry: BasicDiscovery<T>,
    state: Arc<Mutex<MapState>>,
) where
    S: Service,
    T: Service,
    F: Fn(S) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    loop {
        match parent.recv().await {
            Ok(DiscoveryEvent::Available(service)) | Ok(DiscoveryEvent::Updated(service)) => {
                let parent_id = service.id();
                let version = {
                    let mut st = state.lock();
                    let v = st.versions.entry(parent_id.clone()).or_insert(0);
                    *v += 1;
                    *v
                };
                let mapper = Arc::clone(&mapper);
                let registry = registry.clone();
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    match mapper(service).await {
                        Ok(mapped) => {
                            let current = {
                                let mut st = state.lock();
                                if st.versions.get(&parent_id) == Some(&version) {
                                    st.mapped_ids.insert(parent_id.clone(), mapped.id());
                                    true
                                } else {
                                    false
                                }
                            };
                            if current {
                                registry.add_service(mapped);
                            } else {
                                debug!("dropping stale mapping for {parent_id}");
                            }
                        }
                        Err(e) => {
                            debug!("mapper failed for {parent_id}: {e}; next sighting will retry")
                        }
                    }
                });
            }
            Ok(DiscoveryEvent::Unavailable(service)) => {
                let parent_id = service.id();
                let mapped_id = {
                    let mut st = state.lock();
                    st.versions.remove(&parent_id);
                    st.mapped_ids.remove(&parent_id)
                };
                if let Some(id) = mapped_id {
                    registry.remove_service(&id);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("mapped discovery lagged behind its parent, skipped {n} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Mapped {
        id: String,
        label: String,
    }

    impl Service for Mapped {
        fn id(&self) -> String {
            self.id.clone()
        }
    }

    #[tokio::test]
    async fn maps_available_services() {
        let parent: BasicDiscovery<String> = BasicDiscovery::new();
        let mapped = MappedDiscovery::new(parent.subscribe(), |s: String| async move {
            Ok::<_, std::io::Error>(Mapped {
                id: s.clone(),
                label: format!("mapped-{s}"),
            })
        });
        let mut events = mapped.subscribe();

        parent.add_service("a".to_string());

        match events.recv().await.unwrap() {
            DiscoveryEvent::Available(m) => assert_eq!(m.label, "mapped-a"),
            other => panic!("expected available, got {:?}", other),
        }
        assert!(mapped.get("a").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_mapper_results_are_dropped() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = Arc::new(AtomicU32::new(0));
        let parent: BasicDiscovery<String> = BasicDiscovery::new();

        // First mapping is slow, the re-sighting resolves fast.
        let calls_in_mapper = Arc::clone(&calls);
        let mapped = MappedDiscovery::new(parent.subscribe(), move |s: String| {
            let call = calls_in_mapper.fetch_add(1, Ordering::SeqCst);
            async move {
                let delay = if call == 0 { 100 } else { 1 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok::<_, std::io::Error>(Mapped {
                    id: s,
                    label: format!("v{}", call + 1),
                })
            }
        });
        let mut events = mapped.subscribe();

        parent.add_service("svc".to_string());
        tokio::time::sleep(Duration::from_millis(5)).await;
        parent.add_service("svc".to_string());

        // The second (fast) mapping wins; the slow first result arrives
        // later but belongs to a superseded version and is dropped.
        match events.recv().await.unwrap() {
            DiscoveryEvent::Available(m) => assert_eq!(m.label, "v2"),
            other => panic!("expected available, got {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            events.try_recv().is_err(),
            "stale mapping must not produce a second event"
        );
        assert_eq!(mapped.get("svc").unwrap().label, "v2");
    }

    #[tokio::test]
    async fn mapper_rejections_are_swallowed_and_retried() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let attempts = Arc::new(AtomicU32::new(0));
        let parent: BasicDiscovery<String> = BasicDiscovery::new();

        let attempts_in_mapper = Arc::clone(&attempts);
        let mapped = MappedDiscovery::new(parent.subscribe(), move |s: String| {
            let attempts = Arc::clone(&attempts_in_mapper);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(std::io::Error::other("mapper exploded"))
                } else {
                    Ok(Mapped {
                        id: s,
                        label: "ok".to_string(),
                    })
                }
            }
        });
        let mut events = mapped.subscribe();

        parent.add_service("x".to_string());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(mapped.get("x").is_none(), "failed mapping registers nothing");

        parent.add_service("x".to_string());
        match events.recv().await.unwrap() {
            DiscoveryEvent::Available(m) => assert_eq!(m.label, "ok"),
            other => panic!("expected available after retry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unavailability_is_forwarded_and_state_cleared() {
        let parent: BasicDiscovery<String> = BasicDiscovery::new();
        let mapped = MappedDiscovery::new(parent.subscribe(), |s: String| async move {
            Ok::<_, std::io::Error>(Mapped {
                id: s,
                label: "v".to_string(),
            })
        });
        let mut events = mapped.subscribe();

        parent.add_service("gone".to_string());
        assert!(matches!(
            events.recv().await.unwrap(),
            DiscoveryEvent::Available(_)
        ));

        parent.remove_service("gone");
        assert!(matches!(
            events.recv().await.unwrap(),
            DiscoveryEvent::Unavailable(_)
        ));
        assert!(mapped.get("gone").is_none());
        assert_eq!(mapped.version_of("gone"), None);
    }
}
