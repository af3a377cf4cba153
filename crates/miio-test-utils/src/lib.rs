//! Common test helpers for miIO tests
//!
//! Provides:
//! - A scriptable fake device speaking the real wire protocol
//! - Port allocation helpers
//! - Condition-based waiting (no hardcoded sleeps)

use miio_core::packet::{self, Header, Inbound, Packet};
use miio_core::{json, Token};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Find an available UDP port for testing
pub fn find_available_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F>(mut check: F, max_wait: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check() {
            return true;
        }
        tokio::time::sleep(DEFAULT_CHECK_INTERVAL).await;
    }
    false
}

/// Behavior knobs for a [`FakeDevice`]
#[derive(Clone)]
pub struct FakeDeviceConfig {
    pub device_id: u32,
    pub token: Token,
    /// Put the token in the handshake reply checksum field
    pub reveal_token: bool,
    /// Drop this many handshake requests before answering
    pub ignore_handshakes: u32,
    /// Drop this many data requests before answering (still recorded)
    pub ignore_requests: u32,
    /// Device errors to send, one per request, before behaving
    pub error_replies: Vec<(i64, String)>,
    /// Model reported by `miIO.info`
    pub model: String,
    /// Canned results per method; unknown methods answer `["ok"]`
    pub replies: HashMap<String, Value>,
}

impl Default for FakeDeviceConfig {
    fn default() -> Self {
        Self {
            device_id: 0x00AA_1234,
            token: Token::from_bytes([0x31; 16]),
            reveal_token: true,
            ignore_handshakes: 0,
            ignore_requests: 0,
            error_replies: Vec::new(),
            model: "rockrobo.vacuum.v1".to_string(),
            replies: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct FakeState {
    handshakes_seen: u32,
    requests: Vec<(u64, String)>,
    ignore_handshakes: u32,
    ignore_requests: u32,
    errors: VecDeque<(i64, String)>,
}

/// A UDP server speaking the miIO wire protocol
///
/// Answers handshakes with this device's id and (optionally) token, and
/// data requests with canned results or scripted errors. Drops itself
/// cleanly when the handle goes away.
pub struct FakeDevice {
    addr: SocketAddr,
    state: Arc<Mutex<FakeState>>,
    task: JoinHandle<()>,
}

impl FakeDevice {
    pub async fn start(config: FakeDeviceConfig) -> FakeDevice {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("bind fake device socket");
        let addr = socket.local_addr().expect("fake device local addr");
        let state = Arc::new(Mutex::new(FakeState {
            errors: config.error_replies.iter().cloned().collect(),
            ignore_handshakes: config.ignore_handshakes,
            ignore_requests: config.ignore_requests,
            ..FakeState::default()
        }));
        let task = tokio::spawn(serve(socket, config, Arc::clone(&state)));
        FakeDevice { addr, state, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn address(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Handshake requests received so far (including ignored ones)
    pub fn handshakes_seen(&self) -> u32 {
        self.state.lock().handshakes_seen
    }

    /// Request ids received so far, in arrival order
    pub fn request_ids(&self) -> Vec<u64> {
        self.state.lock().requests.iter().map(|(id, _)| *id).collect()
    }

    /// Method names received so far, in arrival order
    pub fn methods_seen(&self) -> Vec<String> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Request ids received for one method, in arrival order
    pub fn request_ids_for(&self, method: &str) -> Vec<u64> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(_, m)| m == method)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drop the next `count` handshake requests
    pub fn set_ignore_handshakes(&self, count: u32) {
        self.state.lock().ignore_handshakes = count;
    }

    /// Drop the next `count` data requests (still recorded)
    pub fn set_ignore_requests(&self, count: u32) {
        self.state.lock().ignore_requests = count;
    }

    /// Queue a device error for the next answered request
    pub fn push_error(&self, code: i64, message: &str) {
        self.state.lock().errors.push_back((code, message.to_string()));
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(socket: UdpSocket, config: FakeDeviceConfig, state: Arc<Mutex<FakeState>>) {
    let started = Instant::now();
    let mut codec = Packet::with_token(config.token);
    let mut buf = vec![0u8; 65536];

    loop {
        let Ok((len, from)) = socket.recv_from(&mut buf).await else {
            break;
        };
        let raw = &buf[..len];
        let Ok(header) = Header::parse(raw) else {
            continue;
        };
        // A coarse device clock: some base plus seconds since start.
        let stamp = 1_000 + started.elapsed().as_secs() as u32;

        if header.is_handshake() {
            let ignore = {
                let mut st = state.lock();
                st.handshakes_seen += 1;
                if st.ignore_handshakes > 0 {
                    st.ignore_handshakes -= 1;
                    true
                } else {
                    false
                }
            };
            if ignore {
                debug!("fake device ignoring handshake");
                continue;
            }
            let token = config.reveal_token.then_some(&config.token);
            let reply = packet::handshake_reply(config.device_id, stamp, token);
            let _ = socket.send_to(&reply, from).await;
            continue;
        }

        let Ok(Inbound::Data { payload, .. }) = codec.parse(raw) else {
            continue;
        };
        let Ok(request) = json::parse_lenient(&payload) else {
            continue;
        };
        let id = request.get("id").and_then(Value::as_u64).unwrap_or(0);
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let (drop_request, error) = {
            let mut st = state.lock();
            st.requests.push((id, method.clone()));
            if st.ignore_requests > 0 {
                st.ignore_requests -= 1;
                (true, None)
            } else {
                (false, st.errors.pop_front())
            }
        };
        if drop_request {
            debug!("fake device dropping request {id}");
            continue;
        }

        let body = match error {
            Some((code, message)) => json!({
                "id": id,
                "error": { "code": code, "message": message },
            }),
            None => {
                let result = if method == "miIO.info" {
                    json!({
                        "model": config.model,
                        "fw_ver": "3.5.8",
                        "hw_ver": "MW300",
                    })
                } else {
                    config
                        .replies
                        .get(&method)
                        .cloned()
                        .unwrap_or_else(|| json!(["ok"]))
                };
                json!({ "id": id, "result": result })
            }
        };

        let frame = packet::encode_data_frame(
            config.device_id,
            stamp,
            &config.token,
            body.to_string().as_bytes(),
        );
        let _ = socket.send_to(&frame, from).await;
    }
}
