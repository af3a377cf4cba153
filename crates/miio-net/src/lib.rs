//! miIO network layer
//!
//! The shared socket owner, the per-device call engine, and the browser
//! that feeds discovery:
//! - [`NetworkManager`]: refcounted UDP socket, broadcast search, inbound
//!   dispatch, failure recovery
//! - [`DeviceInfo`] / [`Device`]: handshake, request ids, call retries,
//!   enrichment
//! - [`Browser`]: timed LAN discovery built on the manager
//!
//! # Example
//!
//! ```no_run
//! use miio_net::{ConnectOptions, NetworkManager};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> miio_core::Result<()> {
//!     let manager = NetworkManager::new();
//!     let options = ConnectOptions::new("192.168.1.8".parse().unwrap())
//!         .token_hex("00112233445566778899aabbccddeeff")?;
//!     let device = manager.connect(options).await?;
//!     let status = device
//!         .call("get_status", json!([]), Default::default())
//!         .await?;
//!     println!("{status}");
//!     Ok(())
//! }
//! ```

pub mod browser;
pub mod device;
pub mod manager;
pub mod models;
pub mod token_store;

pub use browser::{Browser, DeviceSighting};
pub use device::{CallOptions, Device, DeviceInfo};
pub use manager::{ConnectOptions, ManagerConfig, ManagerRef, NetEvent, NetworkManager};
pub use models::{DeviceKind, ModelRegistry};
pub use token_store::{MemoryTokenStore, TokenStore};

pub use miio_core::{Error, Result, Token};
