//! Device tokens
//!
//! Every provisioned miIO device holds a 16-byte token that keys the
//! payload encryption. Tokens are usually written as 32 hex characters.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Token length in bytes
pub const TOKEN_LEN: usize = 16;

/// A 16-byte device token
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    /// Wrap raw token bytes
    pub fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Token(bytes)
    }

    /// Wrap a raw slice, which must be exactly 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; TOKEN_LEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidToken(format!("expected 16 bytes, got {}", bytes.len())))?;
        Ok(Token(bytes))
    }

    /// Raw token bytes
    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Devices that refuse to reveal their token fill the handshake
    /// checksum field with all-ones or all-zeros
    pub fn is_withheld(&self) -> bool {
        self.0.iter().all(|b| *b == 0xff) || self.0.iter().all(|b| *b == 0x00)
    }
}

impl FromStr for Token {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidToken(e.to_string()))?;
        Token::from_slice(&bytes)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", hex::encode(self.0))
    }
}
