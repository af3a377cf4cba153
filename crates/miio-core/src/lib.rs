//! miIO Core
//!
//! Core types, encoding, and protocol primitives for the miIO LAN control
//! protocol spoken by Xiaomi-ecosystem smart-home devices.
//!
//! This crate provides:
//! - Packet framing, stamping, and token-based encryption ([`Packet`])
//! - Device tokens ([`Token`])
//! - The error taxonomy ([`Error`]) and transient-error classifier ([`neterr`])
//! - Lenient JSON decoding for device replies ([`json`])

pub mod error;
pub mod json;
pub mod neterr;
pub mod packet;
pub mod token;

pub use error::{Error, Result};
pub use packet::{Header, Inbound, Packet};
pub use token::Token;

use std::time::Duration;

/// UDP port miIO devices listen on
pub const PORT: u16 = 54321;

/// Magic word opening every frame
pub const MAGIC: u16 = 0x2131;

/// Size of the fixed frame header
pub const HEADER_SIZE: usize = 32;

/// A held stamp older than this forces a fresh handshake
pub const STAMP_MAX_AGE: Duration = Duration::from_secs(120);
