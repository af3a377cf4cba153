//! miIO Discovery
//!
//! Event-driven service registries, composable into discovery pipelines:
//! - [`BasicDiscovery`]: a plain registry emitting availability events
//! - [`TimedDiscovery`]: periodic re-search and stale eviction on top of it
//! - [`MappedDiscovery`]: an asynchronous mapping stage over another registry

pub mod basic;
pub mod mapped;
pub mod timed;

pub use basic::BasicDiscovery;
pub use mapped::MappedDiscovery;
pub use timed::{Searcher, TimedConfig, TimedDiscovery};

/// Identity extraction for registry entries
///
/// The registry keys services by this id; a bare `String` is its own id.
pub trait Service: Clone + Send + Sync + 'static {
    /// Stable registry id
    fn id(&self) -> String;
}

impl Service for String {
    fn id(&self) -> String {
        self.clone()
    }
}

/// Registry events delivered to subscribers
#[derive(Debug, Clone)]
pub enum DiscoveryEvent<S> {
    /// First sighting of a service
    Available(S),
    /// Re-sighting of a known service, possibly with updated details
    Updated(S),
    /// Service removed or gone stale
    Unavailable(S),
}

impl<S: Service> DiscoveryEvent<S> {
    /// Id of the service this event concerns
    pub fn service_id(&self) -> String {
        match self {
            DiscoveryEvent::Available(s)
            | DiscoveryEvent::Updated(s)
            | DiscoveryEvent::Unavailable(s) => s.id(),
        }
    }
}
