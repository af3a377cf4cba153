//! Network manager
//!
//! Owns the one UDP socket shared by every device and by discovery,
//! demultiplexes inbound frames to per-device records, broadcasts
//! discovery handshakes, and recovers from transient socket failures.
//!
//! Socket ownership is refcounted: the first [`NetworkManager::acquire`]
//! binds the socket, dropping the last [`ManagerRef`] closes it. During a
//! reset the socket accessor refuses with `ENOTCONN`, which the call
//! engine classifies as transient and turns into a retry.

use crate::device::{Device, DeviceInfo, FrameOutcome};
use crate::models::{DeviceKind, ModelRegistry};
use crate::token_store::{MemoryTokenStore, TokenStore};
use miio_core::packet::{Header, Packet};
use miio_core::{neterr, Error, Result, Token, PORT};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay between the two broadcasts of a search pass
const SEARCH_REPEAT_DELAY: Duration = Duration::from_millis(500);

/// How long a socket reset keeps the accessor closed
const RESET_COOLDOWN: Duration = Duration::from_millis(250);

/// Poll cadence while recovery discovery waits for the socket
const RECOVERY_POLL: Duration = Duration::from_millis(50);

/// How long recovery discovery keeps waiting before giving up
const RECOVERY_DEFER_MAX: Duration = Duration::from_millis(300);

/// Minimum spacing between recovery searches
const RECOVERY_RATE_LIMIT: Duration = Duration::from_secs(1);

/// Delay before recreating a socket that closed outside a reset
const SOCKET_RECREATE_DELAY: Duration = Duration::from_secs(1);

/// Pause between connect attempts, covering the reset cooldown
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Receive buffer size
const RECV_BUFFER_SIZE: usize = 65536;

/// Event channel capacity
const EVENT_CAPACITY: usize = 64;

/// Events emitted by the manager
#[derive(Debug, Clone)]
pub enum NetEvent {
    /// A device became known or re-advertised itself
    Device(Arc<DeviceInfo>),
    /// The socket was reset after a failure
    SocketReset { reason: String },
    /// A recovery discovery search was issued
    RecoverySearch { reason: String },
}

/// Manager configuration
pub struct ManagerConfig {
    /// Where search broadcasts go
    pub broadcast_target: SocketAddr,
    /// Token lookup for devices that withhold theirs
    pub token_store: Arc<dyn TokenStore>,
    /// Model string resolution for connected devices
    pub models: ModelRegistry,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            broadcast_target: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), PORT),
            token_store: Arc::new(MemoryTokenStore::new()),
            models: ModelRegistry::with_defaults(),
        }
    }
}

/// Options for connecting to a device by address
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub address: IpAddr,
    pub port: u16,
    pub token: Option<Token>,
    /// Extra attempts after a transient connect failure
    pub connection_retries: u32,
}

impl ConnectOptions {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            port: PORT,
            token: None,
            connection_retries: 1,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// Token as a 32-character hex string
    pub fn token_hex(mut self, token: &str) -> Result<Self> {
        self.token = Some(token.parse()?);
        Ok(self)
    }

    pub fn connection_retries(mut self, retries: u32) -> Self {
        self.connection_retries = retries;
        self
    }
}

struct State {
    socket: Option<Arc<UdpSocket>>,
    recv_task: Option<JoinHandle<()>>,
    addresses: HashMap<IpAddr, Arc<DeviceInfo>>,
    devices: HashMap<u32, Arc<DeviceInfo>>,
    references: usize,
    reset_in_progress: bool,
    recovery_pending: bool,
    last_recovery: Option<Instant>,
}

/// Owner of the shared UDP socket and the device maps
pub struct NetworkManager {
    config: ManagerConfig,
    state: Mutex<State>,
    events: broadcast::Sender<NetEvent>,
    weak_self: Weak<NetworkManager>,
}

impl NetworkManager {
    pub fn new() -> Arc<Self> {
        Self::with_config(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|weak| Self {
            config,
            state: Mutex::new(State {
                socket: None,
                recv_task: None,
                addresses: HashMap::new(),
                devices: HashMap::new(),
                references: 0,
                reset_in_progress: false,
                recovery_pending: false,
                last_recovery: None,
            }),
            events,
            weak_self: weak.clone(),
        })
    }

    /// The process-wide manager instance
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<NetworkManager>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(NetworkManager::new))
    }

    /// Subscribe to manager events
    pub fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.events.subscribe()
    }

    pub fn token_store(&self) -> Arc<dyn TokenStore> {
        Arc::clone(&self.config.token_store)
    }

    // ------------------------------------------------------------------
    // Socket lifecycle
    // ------------------------------------------------------------------

    /// Take a reference on the shared socket, binding it on 0 -> 1
    pub fn acquire(&self) -> Result<ManagerRef> {
        let manager = self
            .weak_self
            .upgrade()
            .ok_or_else(|| Error::socket_code("ENOTCONN"))?;
        let mut st = self.state.lock();
        st.references += 1;
        if st.references == 1 && st.socket.is_none() && !st.reset_in_progress {
            if let Err(e) = self.create_socket_locked(&mut st) {
                st.references -= 1;
                return Err(e);
            }
        }
        Ok(ManagerRef {
            manager,
            released: AtomicBool::new(false),
        })
    }

    fn release_ref(&self) {
        let mut st = self.state.lock();
        st.references = st.references.saturating_sub(1);
        if st.references == 0 {
            info!("last reference released, closing socket");
            if let Some(task) = st.recv_task.take() {
                task.abort();
            }
            st.socket = None;
        }
    }

    /// Current reference count
    pub fn references(&self) -> usize {
        self.state.lock().references
    }

    /// Whether a socket is currently bound
    pub fn has_socket(&self) -> bool {
        self.state.lock().socket.is_some()
    }

    /// The shared socket; refuses with `ENOTCONN` while absent or resetting
    pub(crate) fn socket(&self) -> Result<Arc<UdpSocket>> {
        let st = self.state.lock();
        if st.reset_in_progress {
            return Err(Error::socket_code("ENOTCONN"));
        }
        st.socket
            .clone()
            .ok_or_else(|| Error::socket_code("ENOTCONN"))
    }

    fn create_socket_locked(&self, st: &mut State) -> Result<()> {
        let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).map_err(Error::socket)?;
        socket.set_broadcast(true).map_err(Error::socket)?;
        socket.set_nonblocking(true).map_err(Error::socket)?;
        let socket = Arc::new(UdpSocket::from_std(socket).map_err(Error::socket)?);
        if let Ok(addr) = socket.local_addr() {
            info!("socket bound to {addr}");
        }
        st.recv_task = Some(self.spawn_recv_loop(Arc::clone(&socket)));
        st.socket = Some(socket);
        Ok(())
    }

    fn spawn_recv_loop(&self, socket: Arc<UdpSocket>) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.dispatch(&buf[..len], from);
                    }
                    Err(e) => {
                        let Some(manager) = weak.upgrade() else { break };
                        let code = neterr::io_code(&e);
                        if neterr::is_transient_code(&code) {
                            warn!("socket receive failed ({code}), resetting");
                            manager.reset_socket(&format!("socket receive error: {code}"));
                        } else {
                            error!("socket receive failed: {e}");
                            manager.schedule_socket_recreate();
                        }
                        break;
                    }
                }
            }
        })
    }

    /// Recreate the socket after an unexpected close, if anyone still
    /// holds a reference
    fn schedule_socket_recreate(&self) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SOCKET_RECREATE_DELAY).await;
            let Some(manager) = weak.upgrade() else { return };
            let mut st = manager.state.lock();
            if st.references > 0 && st.socket.is_none() && !st.reset_in_progress {
                if let Err(e) = manager.create_socket_locked(&mut st) {
                    warn!("socket recreation failed: {e}");
                }
            }
        });
    }

    /// Close the socket and reopen it after a cooldown
    ///
    /// Single-flighted: a reset already in progress makes this a no-op.
    /// Close errors are irrelevant; the socket is dropped either way.
    pub fn reset_socket(&self, reason: &str) {
        {
            let mut st = self.state.lock();
            if st.reset_in_progress {
                return;
            }
            st.reset_in_progress = true;
            info!("resetting socket: {reason}");
            if let Some(task) = st.recv_task.take() {
                task.abort();
            }
            st.socket = None;
        }
        let _ = self.events.send(NetEvent::SocketReset {
            reason: reason.to_string(),
        });

        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESET_COOLDOWN).await;
            let Some(manager) = weak.upgrade() else { return };
            let mut st = manager.state.lock();
            st.reset_in_progress = false;
            if st.references > 0 && st.socket.is_none() {
                if let Err(e) = manager.create_socket_locked(&mut st) {
                    warn!("socket recreation after reset failed: {e}");
                }
            }
        });
    }

    /// Ask for an out-of-schedule discovery broadcast after a recoverable
    /// error
    ///
    /// Defers while a reset is in progress or no socket exists (polling
    /// for up to ~300 ms), cancels if all references are dropped, and
    /// issues at most one recovery search per second.
    pub fn request_recovery_discovery(&self, reason: &str) {
        {
            let mut st = self.state.lock();
            if st.recovery_pending {
                return;
            }
            if let Some(last) = st.last_recovery {
                if last.elapsed() < RECOVERY_RATE_LIMIT {
                    debug!("recovery discovery rate-limited ({reason})");
                    return;
                }
            }
            st.recovery_pending = true;
        }

        let reason = reason.to_string();
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let mut waited = Duration::ZERO;
            loop {
                let Some(manager) = weak.upgrade() else { return };
                let ready = {
                    let mut st = manager.state.lock();
                    if st.references == 0 {
                        debug!("recovery discovery cancelled, no references left");
                        st.recovery_pending = false;
                        return;
                    }
                    !st.reset_in_progress && st.socket.is_some()
                };

                if ready {
                    {
                        let mut st = manager.state.lock();
                        st.recovery_pending = false;
                        st.last_recovery = Some(Instant::now());
                    }
                    info!("issuing recovery discovery: {reason}");
                    let _ = manager
                        .events
                        .send(NetEvent::RecoverySearch {
                            reason: reason.clone(),
                        });
                    manager.search().await;
                    return;
                }

                if waited >= RECOVERY_DEFER_MAX {
                    debug!("recovery discovery abandoned, socket still unavailable");
                    manager.state.lock().recovery_pending = false;
                    return;
                }
                drop(manager);
                tokio::time::sleep(RECOVERY_POLL).await;
                waited += RECOVERY_POLL;
            }
        });
    }

    // ------------------------------------------------------------------
    // Discovery broadcast
    // ------------------------------------------------------------------

    /// Broadcast a handshake to every device on the LAN, twice 500 ms
    /// apart
    ///
    /// Never fails: transient problems schedule a socket reset, anything
    /// else only reaches the debug log.
    pub async fn search(&self) {
        debug!("broadcasting device search");
        self.send_search_broadcast().await;

        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SEARCH_REPEAT_DELAY).await;
            if let Some(manager) = weak.upgrade() {
                manager.send_search_broadcast().await;
            }
        });
    }

    async fn send_search_broadcast(&self) {
        let socket = match self.socket() {
            Ok(socket) => socket,
            Err(e) => {
                if e.is_transient() {
                    self.reset_socket(&format!("discovery socket unavailable: {}", e.code()));
                } else {
                    debug!("discovery socket unavailable: {e}");
                }
                return;
            }
        };
        if let Err(e) = socket
            .send_to(&Packet::handshake_frame(), self.config.broadcast_target)
            .await
        {
            let code = neterr::io_code(&e);
            if neterr::is_transient_code(&code) {
                warn!("discovery broadcast failed ({code}), resetting socket");
                self.reset_socket(&format!("discovery broadcast error: {code}"));
            } else {
                debug!("discovery broadcast error: {e}");
            }
        }
    }

    // ------------------------------------------------------------------
    // Device resolution
    // ------------------------------------------------------------------

    /// Resolve a device by id, falling back to the remote address, and
    /// rebind the maps when its identity moved
    pub fn find_device(&self, id: u32, remote: Option<SocketAddr>) -> Option<Arc<DeviceInfo>> {
        let mut st = self.state.lock();
        let existing = st
            .devices
            .get(&id)
            .cloned()
            .or_else(|| remote.and_then(|r| st.addresses.get(&r.ip()).cloned()));

        match existing {
            Some(device) => {
                let (previous_id, previous_addr) = device.identity();
                device.update_identity(id, remote);

                if previous_id != Some(id) {
                    if let Some(old) = previous_id {
                        st.devices.remove(&old);
                    }
                    st.devices.insert(id, Arc::clone(&device));
                }
                if let Some(remote) = remote {
                    if previous_addr != remote.ip() {
                        st.addresses.remove(&previous_addr);
                        st.addresses.insert(remote.ip(), Arc::clone(&device));
                    }
                }
                Some(device)
            }
            None => {
                let remote = remote?;
                let device = Arc::new(DeviceInfo::new(self.weak_self.clone(), remote));
                device.update_identity(id, Some(remote));
                debug!("new device {id} at {remote}");
                st.devices.insert(id, Arc::clone(&device));
                st.addresses.insert(remote.ip(), Arc::clone(&device));
                Some(device)
            }
        }
    }

    /// Snapshot of all id-known devices
    pub fn devices(&self) -> Vec<Arc<DeviceInfo>> {
        self.state.lock().devices.values().cloned().collect()
    }

    /// Obtain or create a record for an address, handshake, and enrich
    pub async fn find_device_via_address(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<DeviceInfo>> {
        let device = {
            let mut st = self.state.lock();
            match st.addresses.get(&options.address) {
                Some(device) => Arc::clone(device),
                None => {
                    let device = Arc::new(DeviceInfo::new(
                        self.weak_self.clone(),
                        SocketAddr::new(options.address, options.port),
                    ));
                    st.addresses.insert(options.address, Arc::clone(&device));
                    device
                }
            }
        };

        if let Some(token) = options.token {
            device.set_manual_token(token);
        }

        match device.handshake().await {
            Ok(()) => {}
            Err(Error::MissingToken) => {
                // Enrichment decides whether a stored token rescues this.
                debug!(
                    "handshake revealed no token for {}, deferring to enrichment",
                    options.address
                );
            }
            Err(e) => {
                // The reply may have been routed to a record already known
                // under this id; adopt it when the address now resolves
                // elsewhere.
                let adopted = {
                    let st = self.state.lock();
                    st.addresses
                        .get(&options.address)
                        .filter(|d| !Arc::ptr_eq(*d, &device))
                        .cloned()
                };
                match adopted {
                    Some(device) => {
                        device.enrich().await?;
                        return Ok(device);
                    }
                    None => return Err(e),
                }
            }
        }

        let device = {
            let mut st = self.state.lock();
            match device.id() {
                Some(id) => match st.devices.get(&id) {
                    Some(existing) if !Arc::ptr_eq(existing, &device) => {
                        let existing = Arc::clone(existing);
                        st.addresses.insert(options.address, Arc::clone(&existing));
                        existing
                    }
                    _ => {
                        st.devices.insert(id, Arc::clone(&device));
                        device
                    }
                },
                None => device,
            }
        };

        device.enrich().await?;
        Ok(device)
    }

    /// Connect to a device by address, retrying transient failures
    ///
    /// The returned [`Device`] holds a manager reference; the socket
    /// stays open for as long as the handle lives.
    pub async fn connect(&self, options: ConnectOptions) -> Result<Device> {
        let reference = self.acquire()?;
        let mut attempt = 0u32;
        loop {
            match self.find_device_via_address(&options).await {
                Ok(info) => {
                    let kind = info
                        .model()
                        .map(|m| self.config.models.resolve(&m))
                        .unwrap_or(DeviceKind::Generic);
                    return Ok(Device::new(info, kind, reference));
                }
                Err(e)
                    if attempt < options.connection_retries
                        && neterr::is_transient_for_connect(&e) =>
                {
                    let reason = format!("connect retry after transient error: {}", e.code());
                    warn!("{reason}");
                    self.reset_socket(&reason);
                    self.request_recovery_discovery(&reason);
                    attempt += 1;
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    fn dispatch(&self, raw: &[u8], from: SocketAddr) {
        let header = match Header::parse(raw) {
            Ok(header) => header,
            Err(e) => {
                debug!("dropping undecodable frame from {from}: {e}");
                return;
            }
        };
        let Some(device_id) = header.device_id() else {
            debug!("dropping frame without device id from {from}");
            return;
        };
        let Some(device) = self.find_device(device_id, Some(from)) else {
            return;
        };

        match device.handle_frame(raw) {
            Ok(FrameOutcome::Handshake) => {
                // Handshake replies double as advertisements: enrich on
                // first contact, then let observers know either way.
                let events = self.events.clone();
                tokio::spawn(async move {
                    if !device.is_enriched() {
                        if let Err(e) = device.enrich().await {
                            debug!("enrichment of {device_id} failed: {e}");
                        }
                    }
                    let _ = events.send(NetEvent::Device(device));
                });
            }
            Ok(FrameOutcome::Data) => {}
            Err(e) => debug!("dropping frame from {from}: {e}"),
        }
    }
}

/// A live claim on the shared socket
///
/// `release` is idempotent and also runs on drop; the last release closes
/// the socket.
pub struct ManagerRef {
    manager: Arc<NetworkManager>,
    released: AtomicBool,
}

impl ManagerRef {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.manager.release_ref();
        }
    }

    pub fn manager(&self) -> &Arc<NetworkManager> {
        &self.manager
    }
}

impl Drop for ManagerRef {
    fn drop(&mut self) {
        self.release();
    }
}
