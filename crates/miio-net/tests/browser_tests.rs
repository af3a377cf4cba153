//! Browser Tests (miio-net)
//!
//! Tests for the manager-fed discovery pipeline:
//! - Sightings appear after a search pass reaches a device
//! - The browser holds a manager reference for its lifetime

use miio_discovery::TimedConfig;
use miio_net::{Browser, ManagerConfig, NetworkManager};
use miio_test_utils::{wait_for, FakeDevice, FakeDeviceConfig};
use std::time::Duration;

fn quick_config() -> TimedConfig {
    TimedConfig {
        search_interval: Duration::from_millis(100),
        sweep_interval: Duration::from_secs(60),
        max_stale: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn browser_sights_devices_answering_the_search() {
    let config = FakeDeviceConfig::default();
    let fake = FakeDevice::start(config.clone()).await;

    // Point the "broadcast" straight at the fake so the search pass
    // reaches it over loopback.
    let manager = NetworkManager::with_config(ManagerConfig {
        broadcast_target: fake.addr(),
        ..Default::default()
    });

    let browser = Browser::with_config(&manager, quick_config()).expect("browser");
    browser.start();

    let found = wait_for(|| !browser.devices().is_empty(), Duration::from_secs(5)).await;
    assert!(found, "the fake device should be sighted");

    let sighting = &browser.devices()[0];
    assert_eq!(sighting.id, config.device_id);
    assert_eq!(sighting.address, fake.address());
    assert!(sighting.has_token, "the revealed token should be adopted");

    // Enrichment runs before the device event fires.
    assert_eq!(sighting.model.as_deref(), Some("rockrobo.vacuum.v1"));

    browser.stop();
}

#[tokio::test]
async fn browser_holds_a_manager_reference() {
    let fake = FakeDevice::start(FakeDeviceConfig::default()).await;
    let manager = NetworkManager::with_config(ManagerConfig {
        broadcast_target: fake.addr(),
        ..Default::default()
    });

    let browser = Browser::with_config(&manager, quick_config()).expect("browser");
    assert_eq!(manager.references(), 1);
    assert!(manager.has_socket());

    drop(browser);
    assert_eq!(manager.references(), 0);
    assert!(!manager.has_socket(), "dropping the browser frees the socket");
}

#[tokio::test]
async fn repeated_sightings_update_instead_of_duplicating() {
    let config = FakeDeviceConfig::default();
    let fake = FakeDevice::start(config.clone()).await;
    let manager = NetworkManager::with_config(ManagerConfig {
        broadcast_target: fake.addr(),
        ..Default::default()
    });

    let browser = Browser::with_config(&manager, quick_config()).expect("browser");
    browser.start();

    assert!(wait_for(|| !browser.devices().is_empty(), Duration::from_secs(5)).await);
    // Let a few more search passes land.
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(
        browser.devices().len(),
        1,
        "re-advertisements must update the one sighting"
    );
}
