//! Token persistence seam
//!
//! Enrichment consults the store when a device has no token yet, and
//! auto-tokens learned during handshakes are written back. Persistent
//! stores live outside this crate; [`MemoryTokenStore`] is the in-process
//! default.

use async_trait::async_trait;
use miio_core::Token;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Lookup and update of device tokens, keyed by device id
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, device_id: u32) -> Option<Token>;
    async fn update(&self, device_id: u32, token: Token);
}

/// In-memory token store
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<u32, Token>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(device_id: u32, token: Token) -> Self {
        let store = Self::new();
        store.tokens.lock().insert(device_id, token);
        store
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, device_id: u32) -> Option<Token> {
        self.tokens.lock().get(&device_id).copied()
    }

    async fn update(&self, device_id: u32, token: Token) {
        self.tokens.lock().insert(device_id, token);
    }
}
