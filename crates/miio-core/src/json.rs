//! Lenient JSON decoding for device replies
//!
//! Device firmware embeds raw control characters in reply strings and
//! terminates some payloads with a NUL byte, both of which strict JSON
//! rejects. Replies are sanitized before parsing: the trailing NUL is
//! trimmed and control characters (keeping tab) are stripped.

use crate::error::{Error, Result};
use serde_json::Value;

/// Parse a device reply payload, tolerating embedded control characters
pub fn parse_lenient(data: &[u8]) -> Result<Value> {
    let text = String::from_utf8_lossy(data);
    let text = text.trim_end_matches('\0');
    let cleaned: String = text.chars().filter(|c| !is_stripped(*c)).collect();
    serde_json::from_str(&cleaned).map_err(|e| Error::Decode(e.to_string()))
}

/// U+0000–U+001F except tab, plus U+007F–U+009F
fn is_stripped(c: char) -> bool {
    (c <= '\u{001f}' && c != '\t') || ('\u{007f}'..='\u{009f}').contains(&c)
}
