//! LAN browser: timed discovery fed by the network manager
//!
//! A [`Browser`] runs the generic timed registry with the manager's
//! broadcast search as its searcher, and turns the manager's `device`
//! events into registry sightings. It holds a manager reference while it
//! exists, so the shared socket stays open.

use crate::device::DeviceInfo;
use crate::manager::{ManagerRef, NetEvent, NetworkManager};
use async_trait::async_trait;
use miio_core::Result;
use miio_discovery::{DiscoveryEvent, Searcher, Service, TimedConfig, TimedDiscovery};
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// A device as seen by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSighting {
    pub id: u32,
    pub address: IpAddr,
    pub port: u16,
    pub model: Option<String>,
    pub has_token: bool,
}

impl Service for DeviceSighting {
    fn id(&self) -> String {
        self.id.to_string()
    }
}

impl DeviceSighting {
    fn of(id: u32, device: &DeviceInfo) -> Self {
        Self {
            id,
            address: device.address(),
            port: device.port(),
            model: device.model(),
            has_token: device.has_token(),
        }
    }
}

struct ManagerSearcher(Weak<NetworkManager>);

#[async_trait]
impl Searcher for ManagerSearcher {
    async fn search(&self) {
        if let Some(manager) = self.0.upgrade() {
            manager.search().await;
        }
    }
}

/// Discovery pipeline for miIO devices on the local network
pub struct Browser {
    discovery: Arc<TimedDiscovery<DeviceSighting>>,
    feed_task: JoinHandle<()>,
    _reference: ManagerRef,
}

impl Browser {
    pub fn new(manager: &Arc<NetworkManager>) -> Result<Self> {
        Self::with_config(manager, TimedConfig::default())
    }

    pub fn with_config(manager: &Arc<NetworkManager>, config: TimedConfig) -> Result<Self> {
        let reference = manager.acquire()?;
        let discovery = Arc::new(TimedDiscovery::new(
            ManagerSearcher(Arc::downgrade(manager)),
            config,
        ));
        let feed_task = tokio::spawn(feed(manager.subscribe(), Arc::downgrade(&discovery)));
        Ok(Self {
            discovery,
            feed_task,
            _reference: reference,
        })
    }

    /// Begin the search and sweep schedules
    pub fn start(&self) {
        self.discovery.start();
    }

    pub fn stop(&self) {
        self.discovery.stop();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent<DeviceSighting>> {
        self.discovery.subscribe()
    }

    /// Snapshot of current sightings
    pub fn devices(&self) -> Vec<DeviceSighting> {
        self.discovery.services()
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self.feed_task.abort();
    }
}

async fn feed(
    mut events: broadcast::Receiver<NetEvent>,
    discovery: Weak<TimedDiscovery<DeviceSighting>>,
) {
    loop {
        match events.recv().await {
            Ok(NetEvent::Device(device)) => {
                let Some(discovery) = discovery.upgrade() else {
                    break;
                };
                if let Some(id) = device.id() {
                    discovery.add_service(DeviceSighting::of(id, &device));
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
