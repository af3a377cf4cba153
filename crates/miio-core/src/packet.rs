//! miIO packet framing and encryption
//!
//! Wire format (32-byte header, all fields big-endian):
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Bytes 0-1:   Magic (0x2131)                              │
//! │ Bytes 2-3:   Length (header + payload)                   │
//! │ Bytes 4-7:   Reserved (0xFFFFFFFF in handshake frames)   │
//! │ Bytes 8-11:  Device id                                   │
//! │ Bytes 12-15: Stamp (seconds, device clock)               │
//! │ Bytes 16-31: MD5 checksum                                │
//! ├──────────────────────────────────────────────────────────┤
//! │ Payload: AES-128-CBC/PKCS7 encrypted JSON                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Handshake frames are a bare header: requests fill the trailing fields
//! with 0xFF, replies carry the device id and stamp, and the checksum
//! field holds the device token when the device is willing to reveal it.
//!
//! Key derivation: `key = MD5(token)`, `iv = MD5(key || token)`. The data
//! checksum is `MD5(header[0..16] || token || ciphertext)`, i.e. the frame
//! with the checksum field replaced by the token.

use crate::error::{Error, Result};
use crate::token::Token;
use crate::{HEADER_SIZE, MAGIC, STAMP_MAX_AGE};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use std::time::Instant;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Device id value meaning "no device", used in handshake requests
const NO_DEVICE: u32 = 0xFFFF_FFFF;

/// Parsed frame header
#[derive(Debug, Clone, Copy)]
pub struct Header {
    length: u16,
    device_id: u32,
    stamp: u32,
    checksum: [u8; 16],
}

impl Header {
    /// Parse the fixed header, validating magic and length
    pub fn parse(raw: &[u8]) -> Result<Header> {
        if raw.len() < HEADER_SIZE {
            return Err(Error::FrameTooShort(raw.len()));
        }
        let mut buf = raw;
        let magic = buf.get_u16();
        if magic != MAGIC {
            return Err(Error::InvalidMagic(magic));
        }
        let length = buf.get_u16();
        if length as usize != raw.len() {
            return Err(Error::Decode(format!(
                "length field {} does not match frame size {}",
                length,
                raw.len()
            )));
        }
        let _reserved = buf.get_u32();
        let device_id = buf.get_u32();
        let stamp = buf.get_u32();
        let mut checksum = [0u8; 16];
        buf.copy_to_slice(&mut checksum);
        Ok(Header {
            length,
            device_id,
            stamp,
            checksum,
        })
    }

    /// Device id, if the frame carries one
    pub fn device_id(&self) -> Option<u32> {
        (self.device_id != NO_DEVICE).then_some(self.device_id)
    }

    /// Stamp field (device clock, seconds)
    pub fn stamp(&self) -> u32 {
        self.stamp
    }

    /// Handshake frames are a bare header with no payload
    pub fn is_handshake(&self) -> bool {
        self.length as usize == HEADER_SIZE
    }

    /// Raw checksum field
    pub fn checksum(&self) -> &[u8; 16] {
        &self.checksum
    }
}

/// Per-device packet codec state
///
/// Tracks the token, the device id, and the last device stamp together
/// with its local receipt time, so outbound frames carry a stamp the
/// device will accept.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    device_id: Option<u32>,
    token: Option<Token>,
    stamp: Option<u32>,
    stamp_received_at: Option<Instant>,
    handshake_forced: bool,
}

/// A successfully decoded inbound frame
#[derive(Debug)]
pub enum Inbound {
    /// Handshake reply. `adopted_token` is set when the device revealed a
    /// token and none was held before.
    Handshake {
        device_id: u32,
        adopted_token: Option<Token>,
    },
    /// Data reply with the decrypted payload
    Data { device_id: u32, payload: Bytes },
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: Token) -> Self {
        Packet {
            token: Some(token),
            ..Self::default()
        }
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn set_token(&mut self, token: Token) {
        self.token = Some(token);
    }

    pub fn device_id(&self) -> Option<u32> {
        self.device_id
    }

    pub fn set_device_id(&mut self, id: u32) {
        self.device_id = Some(id);
    }

    /// Whether a handshake must complete before data frames can be built
    pub fn needs_handshake(&self) -> bool {
        if self.handshake_forced || self.token.is_none() || self.stamp.is_none() {
            return true;
        }
        match self.stamp_received_at {
            Some(at) => at.elapsed() > STAMP_MAX_AGE,
            None => true,
        }
    }

    /// Force the next data frame to be preceded by a handshake
    pub fn mark_handshake_required(&mut self) {
        self.handshake_forced = true;
    }

    /// The stampless broadcast/handshake request frame
    pub fn handshake_frame() -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u16(MAGIC);
        buf.put_u16(HEADER_SIZE as u16);
        buf.put_u32(NO_DEVICE);
        buf.put_u32(NO_DEVICE);
        buf.put_u32(NO_DEVICE);
        buf.put_slice(&[0xff; 16]);
        buf.freeze()
    }

    /// Build an encrypted data frame around `payload`
    pub fn frame(&self, payload: &[u8]) -> Result<Bytes> {
        let token = self.token.ok_or(Error::MissingToken)?;
        let (device_id, stamp) = match (self.device_id, self.stamp) {
            (Some(id), Some(stamp)) => (id, stamp),
            _ => return Err(Error::HandshakeRequired),
        };
        let elapsed = self
            .stamp_received_at
            .map(|at| at.elapsed().as_secs() as u32)
            .unwrap_or(0);
        Ok(encode_data_frame(
            device_id,
            stamp.wrapping_add(elapsed),
            &token,
            payload,
        ))
    }

    /// Decode an inbound frame, updating stamp and token state
    pub fn parse(&mut self, raw: &[u8]) -> Result<Inbound> {
        let header = Header::parse(raw)?;
        let device_id = header
            .device_id()
            .ok_or_else(|| Error::Decode("frame carries no device id".into()))?;

        if header.is_handshake() {
            let adopted = self.handle_handshake_reply(&header);
            return Ok(Inbound::Handshake {
                device_id,
                adopted_token: adopted,
            });
        }

        let token = self.token.ok_or(Error::MissingToken)?;
        let ciphertext = &raw[HEADER_SIZE..];
        let expected = data_checksum(&raw[..16], &token, ciphertext);
        if &expected != header.checksum() {
            return Err(Error::ChecksumMismatch);
        }
        let payload = decrypt(&token, ciphertext)?;

        self.device_id = Some(device_id);
        if header.stamp() > 0 {
            self.stamp = Some(header.stamp());
            self.stamp_received_at = Some(Instant::now());
        }

        Ok(Inbound::Data {
            device_id,
            payload: Bytes::from(payload),
        })
    }

    /// Record a handshake reply: device id, stamp, and (when revealed and
    /// none is held) the device token. Returns the newly adopted token.
    pub fn handle_handshake_reply(&mut self, header: &Header) -> Option<Token> {
        self.device_id = header.device_id();
        self.stamp = Some(header.stamp());
        self.stamp_received_at = Some(Instant::now());
        self.handshake_forced = false;

        let revealed = Token::from_bytes(*header.checksum());
        if self.token.is_none() && !revealed.is_withheld() {
            self.token = Some(revealed);
            return Some(revealed);
        }
        None
    }
}

/// Build a handshake reply frame (device side)
pub fn handshake_reply(device_id: u32, stamp: u32, token: Option<&Token>) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE);
    buf.put_u16(MAGIC);
    buf.put_u16(HEADER_SIZE as u16);
    buf.put_u32(0);
    buf.put_u32(device_id);
    buf.put_u32(stamp);
    match token {
        Some(token) => buf.put_slice(token.as_bytes()),
        None => buf.put_slice(&[0xff; 16]),
    }
    buf.freeze()
}

/// Build an encrypted data frame from explicit parts
pub fn encode_data_frame(device_id: u32, stamp: u32, token: &Token, payload: &[u8]) -> Bytes {
    let ciphertext = encrypt(token, payload);
    let length = (HEADER_SIZE + ciphertext.len()) as u16;

    let mut buf = BytesMut::with_capacity(length as usize);
    buf.put_u16(MAGIC);
    buf.put_u16(length);
    buf.put_u32(0);
    buf.put_u32(device_id);
    buf.put_u32(stamp);
    let checksum = data_checksum(&buf[..16], token, &ciphertext);
    buf.put_slice(&checksum);
    buf.put_slice(&ciphertext);
    buf.freeze()
}

fn derive_key_iv(token: &Token) -> ([u8; 16], [u8; 16]) {
    let key: [u8; 16] = Md5::digest(token.as_bytes()).into();
    let mut hasher = Md5::new();
    hasher.update(key);
    hasher.update(token.as_bytes());
    let iv: [u8; 16] = hasher.finalize().into();
    (key, iv)
}

fn encrypt(token: &Token, plaintext: &[u8]) -> Vec<u8> {
    let (key, iv) = derive_key_iv(token);
    Aes128CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

fn decrypt(token: &Token, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let (key, iv) = derive_key_iv(token);
    Aes128CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Decode("payload decryption failed".into()))
}

/// Checksum over the frame with the checksum field replaced by the token
fn data_checksum(header_prefix: &[u8], token: &Token, ciphertext: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(header_prefix);
    hasher.update(token.as_bytes());
    hasher.update(ciphertext);
    hasher.finalize().into()
}
