//! Error types for the miIO client

use crate::neterr;
use thiserror::Error;

/// Result type alias for miIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// miIO error types
#[derive(Error, Debug)]
pub enum Error {
    /// A call or handshake ran out of time or retries
    #[error("Call to device timed out")]
    Timeout,

    /// No token is available for the device
    #[error("missing token")]
    MissingToken,

    /// Device could not be reached although a token was in use
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// Structured error returned by the device
    #[error("{message}")]
    Device { code: i64, message: String },

    /// Socket-level failure carrying a canonical symbolic code
    #[error("socket error: {code}")]
    Socket {
        code: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Invalid magic word in frame header
    #[error("invalid magic: expected 0x2131, got 0x{0:04x}")]
    InvalidMagic(u16),

    /// Frame shorter than the fixed header
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// Frame checksum did not verify against the current token
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Payload could not be decrypted or parsed
    #[error("decode error: {0}")]
    Decode(String),

    /// Token was not 16 bytes / 32 hex characters
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Data frame requested before a completed handshake
    #[error("handshake required")]
    HandshakeRequired,
}

impl Error {
    /// Canonical symbolic code, as surfaced to callers
    pub fn code(&self) -> &str {
        match self {
            Error::Timeout => "timeout",
            Error::MissingToken => "missing-token",
            Error::ConnectionFailure(_) => "connection-failure",
            Error::Device { .. } => "device-error",
            Error::Socket { code, .. } => code,
            Error::InvalidMagic(_) => "invalid-magic",
            Error::FrameTooShort(_) => "frame-too-short",
            Error::ChecksumMismatch => "checksum-mismatch",
            Error::Decode(_) => "decode-error",
            Error::InvalidToken(_) => "invalid-token",
            Error::HandshakeRequired => "handshake-required",
        }
    }

    /// Device error code, for structured device replies
    pub fn device_code(&self) -> Option<i64> {
        match self {
            Error::Device { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Wrap an I/O error, deriving its canonical code
    pub fn socket(err: std::io::Error) -> Self {
        let code = neterr::io_code(&err);
        Error::Socket {
            code,
            source: Some(err),
        }
    }

    /// Socket error from a bare symbolic code
    pub fn socket_code(code: &str) -> Self {
        Error::Socket {
            code: neterr::canonicalize(code),
            source: None,
        }
    }

    /// Whether this failure is worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        neterr::is_transient_code(self.code()) || neterr::chain_mentions_outage(self)
    }
}
