//! Basic service registry

use crate::{DiscoveryEvent, Service};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the event channel; slow subscribers see `Lagged`
const EVENT_CAPACITY: usize = 64;

/// A registry of services keyed by id, emitting availability events
///
/// `add_service` emits [`DiscoveryEvent::Available`] on first sighting and
/// [`DiscoveryEvent::Updated`] on subsequent ones; `remove_service` emits
/// [`DiscoveryEvent::Unavailable`] when the service was present.
///
/// Handles are cheap clones sharing the same registry.
pub struct BasicDiscovery<S: Service> {
    services: Arc<Mutex<HashMap<String, S>>>,
    events: broadcast::Sender<DiscoveryEvent<S>>,
}

impl<S: Service> Clone for BasicDiscovery<S> {
    fn clone(&self) -> Self {
        Self {
            services: Arc::clone(&self.services),
            events: self.events.clone(),
        }
    }
}

impl<S: Service> BasicDiscovery<S> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            services: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent<S>> {
        self.events.subscribe()
    }

    /// Register or refresh a service
    pub fn add_service(&self, service: S) {
        let id = service.id();
        let first = self.services.lock().insert(id, service.clone()).is_none();
        let event = if first {
            DiscoveryEvent::Available(service)
        } else {
            DiscoveryEvent::Updated(service)
        };
        let _ = self.events.send(event);
    }

    /// Remove a service, returning it when present
    pub fn remove_service(&self, id: &str) -> Option<S> {
        let removed = self.services.lock().remove(id);
        if let Some(service) = &removed {
            let _ = self.events.send(DiscoveryEvent::Unavailable(service.clone()));
        }
        removed
    }

    /// Look up a service by id
    pub fn get(&self, id: &str) -> Option<S> {
        self.services.lock().get(id).cloned()
    }

    /// Snapshot of all registered services
    pub fn services(&self) -> Vec<S> {
        self.services.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.services.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.lock().is_empty()
    }
}

impl<S: Service> Default for BasicDiscovery<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_sighting_is_available_then_updated() {
        let registry: BasicDiscovery<String> = BasicDiscovery::new();
        let mut events = registry.subscribe();

        registry.add_service("vacuum-1".to_string());
        registry.add_service("vacuum-1".to_string());

        assert!(matches!(
            events.recv().await.unwrap(),
            DiscoveryEvent::Available(_)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            DiscoveryEvent::Updated(_)
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_emits_unavailable_when_present() {
        let registry: BasicDiscovery<String> = BasicDiscovery::new();
        registry.add_service("light-1".to_string());

        let mut events = registry.subscribe();
        assert!(registry.remove_service("light-1").is_some());
        assert!(registry.remove_service("light-1").is_none());

        match events.recv().await.unwrap() {
            DiscoveryEvent::Unavailable(id) => assert_eq!(id, "light-1"),
            other => panic!("expected unavailable, got {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn string_services_are_their_own_id() {
        let registry: BasicDiscovery<String> = BasicDiscovery::new();
        registry.add_service("plain-value".to_string());
        assert_eq!(registry.get("plain-value").as_deref(), Some("plain-value"));
    }
}
