//! Per-device record and call engine
//!
//! A [`DeviceInfo`] is created by the network manager on first sighting
//! (inbound frame or outbound connect) and lives as long as the manager.
//! It owns the device's packet codec state, the pending-call map, and the
//! request-id space, and implements the handshake and retry state
//! machines around [`DeviceInfo::call`].

use crate::manager::NetworkManager;
use miio_core::packet::{Inbound, Packet};
use miio_core::{json, neterr, Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// Deadline for a handshake exchange
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for a single call attempt
const CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Retry backoff: min(BASE * 2^attempt, MAX) + uniform jitter
const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_MAX_MS: u64 = 8_000;
const BACKOFF_JITTER_MS: u64 = 1_000;

/// Request ids live in [1, 9999]
const ID_WRAP: u16 = 10_000;

/// Id distance between a failed attempt and its retry, so a stale late
/// reply cannot match the new attempt
const RETRY_ID_BUMP: u16 = 100;

/// Options for a single call
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Subdevice id, for calls routed through a gateway
    pub sid: Option<String>,
    /// Retry budget; transport retries and device-requested resends both
    /// consume from it
    pub retries: u32,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            sid: None,
            retries: 5,
        }
    }
}

/// Structured error from a device reply
#[derive(Debug, Clone)]
pub struct DeviceError {
    pub code: i64,
    pub message: String,
}

impl DeviceError {
    /// Errors the device wants the client to resend after re-handshaking
    fn is_retryable(&self) -> bool {
        if self.code == -9999 || self.code == -30001 {
            return true;
        }
        let message = self.message.to_ascii_lowercase();
        message.contains("invalid stamp") || message.contains("invalid_stmp")
    }
}

type CallReply = std::result::Result<Value, DeviceError>;

#[derive(Debug, Clone)]
enum HandshakeFailure {
    Timeout,
    MissingToken,
    Socket(String),
}

type HandshakeOutcome = std::result::Result<(), HandshakeFailure>;

#[derive(Debug, Clone)]
enum EnrichFailure {
    MissingToken,
    ConnectionFailure(String),
}

type EnrichOutcome = std::result::Result<(), EnrichFailure>;

/// What kind of frame `handle_frame` consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameOutcome {
    Handshake,
    Data,
}

struct DeviceState {
    id: Option<u32>,
    address: IpAddr,
    port: u16,
    packet: Packet,
    auto_token: bool,
    token_changed: bool,
    model: Option<String>,
    enriched: bool,
    pending: HashMap<u16, oneshot::Sender<CallReply>>,
    last_id: u16,
    handshake_tx: Option<watch::Sender<Option<HandshakeOutcome>>>,
    enrich_tx: Option<watch::Sender<Option<EnrichOutcome>>>,
}

impl DeviceState {
    /// Assign the next request id: +1 for a fresh call, +100 when
    /// retrying, wrapping from 10000 back to 1
    fn next_request_id(&mut self, retry: bool) -> u16 {
        let bump = if retry { RETRY_ID_BUMP } else { 1 };
        let mut id = self.last_id + bump;
        if id >= ID_WRAP {
            id = 1;
        }
        self.last_id = id;
        id
    }
}

/// Per-device record: identity, codec state, and the call engine
pub struct DeviceInfo {
    manager: Weak<NetworkManager>,
    state: Mutex<DeviceState>,
}

impl fmt::Debug for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("DeviceInfo")
            .field("id", &st.id)
            .field("address", &st.address)
            .field("port", &st.port)
            .field("model", &st.model)
            .finish()
    }
}

impl DeviceInfo {
    pub(crate) fn new(manager: Weak<NetworkManager>, remote: SocketAddr) -> Self {
        Self {
            manager,
            state: Mutex::new(DeviceState {
                id: None,
                address: remote.ip(),
                port: remote.port(),
                packet: Packet::new(),
                auto_token: false,
                token_changed: false,
                model: None,
                enriched: false,
                pending: HashMap::new(),
                last_id: 0,
                handshake_tx: None,
                enrich_tx: None,
            }),
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.state.lock().id
    }

    pub fn address(&self) -> IpAddr {
        self.state.lock().address
    }

    pub fn port(&self) -> u16 {
        self.state.lock().port
    }

    pub fn remote_addr(&self) -> SocketAddr {
        let st = self.state.lock();
        SocketAddr::new(st.address, st.port)
    }

    pub fn model(&self) -> Option<String> {
        self.state.lock().model.clone()
    }

    pub fn has_token(&self) -> bool {
        self.state.lock().packet.token().is_some()
    }

    pub fn is_enriched(&self) -> bool {
        self.state.lock().enriched
    }

    /// Force the next call to complete a handshake first
    pub fn mark_handshake_required(&self) {
        self.state.lock().packet.mark_handshake_required();
    }

    /// Install a manually supplied token
    pub fn set_manual_token(&self, token: miio_core::Token) {
        let mut st = self.state.lock();
        st.token_changed = st.packet.token() != Some(token);
        st.packet.set_token(token);
        st.auto_token = false;
    }

    pub(crate) fn identity(&self) -> (Option<u32>, IpAddr) {
        let st = self.state.lock();
        (st.id, st.address)
    }

    pub(crate) fn update_identity(&self, id: u32, remote: Option<SocketAddr>) {
        let mut st = self.state.lock();
        st.id = Some(id);
        st.packet.set_device_id(id);
        if let Some(remote) = remote {
            st.address = remote.ip();
            st.port = remote.port();
        }
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    /// Ensure the device has a fresh stamp and token
    ///
    /// Resolves immediately when no handshake is needed; otherwise joins
    /// the in-flight exchange or starts one. Exactly one outcome is
    /// delivered per exchange, within a 5 second deadline.
    pub async fn handshake(&self) -> Result<()> {
        let (rx, initiate) = {
            let mut st = self.state.lock();
            if !st.packet.needs_handshake() {
                return Ok(());
            }
            match &st.handshake_tx {
                Some(tx) => (tx.subscribe(), false),
                None => {
                    let (tx, rx) = watch::channel(None);
                    st.handshake_tx = Some(tx);
                    (rx, true)
                }
            }
        };

        if initiate {
            debug!("starting handshake with {}", self.remote_addr());
            if let Err(code) = self.send_handshake().await {
                self.finish_handshake(Err(HandshakeFailure::Socket(code)));
            }
        }

        let mut rx = rx;
        let outcome =
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, rx.wait_for(|o| o.is_some())).await {
                Ok(Ok(value)) => value.clone().expect("checked by wait_for"),
                Ok(Err(_)) => Err(HandshakeFailure::Timeout),
                Err(_) => {
                    // Deadline hit; resolve for any other waiters too.
                    self.finish_handshake(Err(HandshakeFailure::Timeout));
                    Err(HandshakeFailure::Timeout)
                }
            };

        match outcome {
            Ok(()) => Ok(()),
            Err(HandshakeFailure::Timeout) => Err(Error::Timeout),
            Err(HandshakeFailure::MissingToken) => Err(Error::MissingToken),
            Err(HandshakeFailure::Socket(code)) => Err(Error::Socket { code, source: None }),
        }
    }

    async fn send_handshake(&self) -> std::result::Result<(), String> {
        let target = self.remote_addr();
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| "ENOTCONN".to_string())?;
        let socket = manager.socket().map_err(|e| e.code().to_string())?;
        socket
            .send_to(&Packet::handshake_frame(), target)
            .await
            .map_err(|e| neterr::io_code(&e))?;
        Ok(())
    }

    fn finish_handshake(&self, outcome: HandshakeOutcome) {
        let tx = self.state.lock().handshake_tx.take();
        if let Some(tx) = tx {
            let _ = tx.send(Some(outcome));
        }
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    /// Decode an inbound frame addressed to this device and resolve
    /// whatever is waiting on it
    pub(crate) fn handle_frame(&self, raw: &[u8]) -> Result<FrameOutcome> {
        let mut st = self.state.lock();
        match st.packet.parse(raw)? {
            Inbound::Handshake {
                device_id,
                adopted_token,
            } => {
                st.id = Some(device_id);
                if adopted_token.is_some() {
                    debug!("adopted auto-token from handshake reply of {device_id}");
                    st.auto_token = true;
                    st.token_changed = true;
                }
                let outcome = if st.packet.token().is_some() {
                    Ok(())
                } else {
                    Err(HandshakeFailure::MissingToken)
                };
                let tx = st.handshake_tx.take();
                drop(st);
                if let Some(tx) = tx {
                    let _ = tx.send(Some(outcome));
                }
                Ok(FrameOutcome::Handshake)
            }
            Inbound::Data { payload, .. } => {
                drop(st);
                let value = json::parse_lenient(&payload)?;
                let id = value.get("id").and_then(Value::as_u64).unwrap_or(0) as u16;
                let reply = match value.get("error") {
                    Some(err) => Err(DeviceError {
                        code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
                        message: err
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    }),
                    None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                };
                match self.state.lock().pending.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!("reply for unknown or stale id {id}"),
                }
                Ok(FrameOutcome::Data)
            }
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Invoke a JSON-RPC method on the device
    ///
    /// Retries transparently on transient transport failures, handshake
    /// timeouts, per-attempt reply timeouts, and device-requested resends
    /// (invalid stamp), consuming from the shared retry budget with
    /// exponential backoff. Returns the decoded `result` field.
    pub async fn call(&self, method: &str, params: Value, options: CallOptions) -> Result<Value> {
        let mut remaining = options.retries;
        let mut attempt: u32 = 0;
        let mut retrying = false;

        loop {
            let id = self.state.lock().next_request_id(retrying);

            // Make sure a stamp and token are in place first.
            if let Err(e) = self.handshake().await {
                match &e {
                    Error::Timeout => {
                        self.backoff_retry(&mut remaining, &mut attempt, "handshake timeout")
                            .await?;
                        retrying = true;
                        continue;
                    }
                    _ if e.is_transient() => {
                        let reason = format!("handshake network error: {}", e.code());
                        self.recover(&reason);
                        self.backoff_retry(&mut remaining, &mut attempt, &reason)
                            .await?;
                        retrying = true;
                        continue;
                    }
                    _ => return Err(e),
                }
            }

            let mut request = json!({
                "id": id,
                "method": method,
                "params": params.clone(),
            });
            if let Some(sid) = &options.sid {
                request["sid"] = json!(sid);
            }
            let body = serde_json::to_vec(&request)
                .map_err(|e| Error::Decode(e.to_string()))?;

            // Frame and register the pending slot atomically.
            let (frame, rx) = {
                let mut st = self.state.lock();
                let frame = st.packet.frame(&body)?;
                let (tx, rx) = oneshot::channel();
                st.pending.insert(id, tx);
                (frame, rx)
            };

            debug!("call {method} id={id} attempt={attempt}");
            if let Err(failure) = self.send_frame(&frame).await {
                self.state.lock().pending.remove(&id);
                let (surface, code) = match &failure {
                    SendFailure::Throw(code) => ("socket send throw", code.clone()),
                    SendFailure::Send(code) => ("socket send error", code.clone()),
                };
                if neterr::is_transient_code(&code) {
                    let reason = format!("{surface}: {code}");
                    self.recover(&reason);
                    self.backoff_retry(&mut remaining, &mut attempt, &reason)
                        .await?;
                    retrying = true;
                    continue;
                }
                return Err(Error::Socket { code, source: None });
            }

            match tokio::time::timeout(CALL_TIMEOUT, rx).await {
                Ok(Ok(Ok(result))) => return Ok(result),
                Ok(Ok(Err(device_error))) => {
                    if device_error.is_retryable() {
                        debug!(
                            "device requested resend (code {}): {}",
                            device_error.code, device_error.message
                        );
                        self.state.lock().packet.mark_handshake_required();
                        self.backoff_retry(
                            &mut remaining,
                            &mut attempt,
                            "device rejected stamp",
                        )
                        .await?;
                        retrying = true;
                        continue;
                    }
                    return Err(map_device_error(method, device_error));
                }
                Ok(Err(_)) | Err(_) => {
                    // No reply in time; drop the slot before retrying so a
                    // late reply cannot match a newer attempt.
                    self.state.lock().pending.remove(&id);
                    self.backoff_retry(&mut remaining, &mut attempt, "call timeout")
                        .await?;
                    retrying = true;
                    continue;
                }
            }
        }
    }

    async fn send_frame(&self, frame: &[u8]) -> std::result::Result<(), SendFailure> {
        let target = self.remote_addr();
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| SendFailure::Throw("ENOTCONN".to_string()))?;
        let socket = manager
            .socket()
            .map_err(|e| SendFailure::Throw(e.code().to_string()))?;
        socket
            .send_to(frame, target)
            .await
            .map_err(|e| SendFailure::Send(neterr::io_code(&e)))?;
        Ok(())
    }

    /// Consume one retry from the budget and sleep out the backoff
    async fn backoff_retry(
        &self,
        remaining: &mut u32,
        attempt: &mut u32,
        reason: &str,
    ) -> Result<()> {
        if *remaining == 0 {
            warn!("retries exhausted ({reason})");
            return Err(Error::Timeout);
        }
        *remaining -= 1;

        let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << (*attempt).min(16));
        let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
        let backoff = exp.min(BACKOFF_MAX_MS) + jitter;
        debug!("retrying in {backoff}ms ({reason})");
        tokio::time::sleep(Duration::from_millis(backoff)).await;
        *attempt += 1;
        Ok(())
    }

    /// Reset the shared socket and ask for a rediscovery pass
    fn recover(&self, reason: &str) {
        if let Some(manager) = self.manager.upgrade() {
            manager.reset_socket(reason);
            manager.request_recovery_discovery(reason);
        }
    }

    // ------------------------------------------------------------------
    // Enrichment
    // ------------------------------------------------------------------

    /// Fetch `miIO.info` to learn the device model
    ///
    /// Loads a token from the store first when none is held. At most one
    /// enrichment runs per device; concurrent callers share its outcome.
    pub async fn enrich(&self) -> Result<()> {
        let (rx, initiate) = {
            let mut st = self.state.lock();
            if st.enriched && !st.token_changed {
                return Ok(());
            }
            match &st.enrich_tx {
                Some(tx) => (tx.subscribe(), false),
                None => {
                    let (tx, rx) = watch::channel(None);
                    st.enrich_tx = Some(tx);
                    (rx, true)
                }
            }
        };

        if initiate {
            let outcome = self.run_enrich().await;
            let tx = self.state.lock().enrich_tx.take();
            if let Some(tx) = tx {
                let _ = tx.send(Some(outcome.clone()));
            }
            return enrich_result(outcome);
        }

        let mut rx = rx;
        let result = match rx.wait_for(|o| o.is_some()).await {
            Ok(value) => enrich_result(value.clone().expect("checked by wait_for")),
            Err(_) => Err(Error::ConnectionFailure("enrichment aborted".to_string())),
        };
        result
    }

    async fn run_enrich(&self) -> EnrichOutcome {
        let (has_token, id) = {
            let st = self.state.lock();
            (st.packet.token().is_some(), st.id)
        };

        if !has_token {
            if let (Some(id), Some(manager)) = (id, self.manager.upgrade()) {
                if let Some(token) = manager.token_store().get(id).await {
                    debug!("loaded stored token for device {id}");
                    let mut st = self.state.lock();
                    st.packet.set_token(token);
                    st.auto_token = false;
                }
            }
        }

        let token_in_use = self.state.lock().packet.token().is_some();
        match self
            .call("miIO.info", json!([]), CallOptions::default())
            .await
        {
            Ok(info) => {
                let (store_update, id) = {
                    let mut st = self.state.lock();
                    st.model = info
                        .get("model")
                        .and_then(Value::as_str)
                        .map(str::to_owned);
                    st.enriched = true;
                    st.token_changed = false;
                    (
                        st.auto_token.then_some(st.packet.token()).flatten(),
                        st.id,
                    )
                };
                if let (Some(token), Some(id), Some(manager)) =
                    (store_update, id, self.manager.upgrade())
                {
                    manager.token_store().update(id, token).await;
                }
                Ok(())
            }
            Err(Error::MissingToken) => Err(EnrichFailure::MissingToken),
            Err(e) if token_in_use => Err(EnrichFailure::ConnectionFailure(e.to_string())),
            Err(_) => Err(EnrichFailure::MissingToken),
        }
    }
}

enum SendFailure {
    /// The socket accessor refused synchronously
    Throw(String),
    /// The send itself failed
    Send(String),
}

fn enrich_result(outcome: EnrichOutcome) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(EnrichFailure::MissingToken) => Err(Error::MissingToken),
        Err(EnrichFailure::ConnectionFailure(msg)) => Err(Error::ConnectionFailure(msg)),
    }
}

/// Render device errors per the protocol's quirks
fn map_device_error(method: &str, error: DeviceError) -> Error {
    let message = match error.code {
        -5001 if error.message == "invalid_arg" => "Invalid argument".to_string(),
        -5005 if error.message == "params error" => "Invalid argument".to_string(),
        -10000 => format!("Method `{method}` is not supported"),
        _ => error.message,
    };
    Error::Device {
        code: error.code,
        message,
    }
}

/// Connected device handle
///
/// Owns a reference to the network manager, so the socket stays alive as
/// long as the handle does.
pub struct Device {
    info: Arc<DeviceInfo>,
    kind: crate::models::DeviceKind,
    _reference: crate::manager::ManagerRef,
}

impl Device {
    pub(crate) fn new(
        info: Arc<DeviceInfo>,
        kind: crate::models::DeviceKind,
        reference: crate::manager::ManagerRef,
    ) -> Self {
        Self {
            info,
            kind,
            _reference: reference,
        }
    }

    pub fn info(&self) -> &Arc<DeviceInfo> {
        &self.info
    }

    pub fn kind(&self) -> crate::models::DeviceKind {
        self.kind
    }

    pub fn id(&self) -> Option<u32> {
        self.info.id()
    }

    pub fn model(&self) -> Option<String> {
        self.info.model()
    }

    /// Invoke a method on the device
    pub async fn call(&self, method: &str, params: Value, options: CallOptions) -> Result<Value> {
        self.info.call(method, params, options).await
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_last_id(last_id: u16) -> DeviceState {
        DeviceState {
            id: None,
            address: IpAddr::from([127, 0, 0, 1]),
            port: 54321,
            packet: Packet::new(),
            auto_token: false,
            token_changed: false,
            model: None,
            enriched: false,
            pending: HashMap::new(),
            last_id,
            handshake_tx: None,
            enrich_tx: None,
        }
    }

    #[test]
    fn fresh_ids_increment_by_one() {
        let mut st = state_with_last_id(0);
        assert_eq!(st.next_request_id(false), 1);
        assert_eq!(st.next_request_id(false), 2);
    }

    #[test]
    fn retry_ids_jump_by_one_hundred() {
        let mut st = state_with_last_id(41);
        assert_eq!(st.next_request_id(true), 141);
    }

    #[test]
    fn ids_wrap_from_ten_thousand_to_one() {
        let mut st = state_with_last_id(9_999);
        assert_eq!(st.next_request_id(false), 1);

        let mut st = state_with_last_id(9_950);
        assert_eq!(st.next_request_id(true), 1);
    }

    #[test]
    fn ids_stay_in_range_across_many_assignments() {
        let mut st = state_with_last_id(0);
        for i in 0..25_000 {
            let id = st.next_request_id(i % 3 == 0);
            assert!((1..ID_WRAP).contains(&id), "id {id} escaped [1, 9999]");
        }
    }

    #[test]
    fn device_error_mapping_table() {
        let err = map_device_error(
            "set_power",
            DeviceError {
                code: -5001,
                message: "invalid_arg".to_string(),
            },
        );
        assert_eq!(err.to_string(), "Invalid argument");

        let err = map_device_error(
            "set_power",
            DeviceError {
                code: -5001,
                message: "something else".to_string(),
            },
        );
        assert_eq!(err.to_string(), "something else");

        let err = map_device_error(
            "set_power",
            DeviceError {
                code: -5005,
                message: "params error".to_string(),
            },
        );
        assert_eq!(err.to_string(), "Invalid argument");

        let err = map_device_error(
            "get_status",
            DeviceError {
                code: -10000,
                message: "unsupported".to_string(),
            },
        );
        assert_eq!(err.to_string(), "Method `get_status` is not supported");

        let err = map_device_error(
            "x",
            DeviceError {
                code: -42,
                message: "custom failure".to_string(),
            },
        );
        assert_eq!(err.to_string(), "custom failure");
        assert_eq!(err.device_code(), Some(-42));
    }

    #[test]
    fn retryable_device_errors() {
        for (code, message) in [
            (-9999, "user ack timeout"),
            (-30001, "resend"),
            (-1, "Invalid Stamp detected"),
            (-1, "err: invalid_stmp"),
        ] {
            let error = DeviceError {
                code,
                message: message.to_string(),
            };
            assert!(error.is_retryable(), "{code}/{message} should be retryable");
        }
        assert!(!DeviceError {
            code: -5001,
            message: "invalid_arg".to_string()
        }
        .is_retryable());
    }
}
