//! Transient-error classification
//!
//! Canonicalizes arbitrary I/O failures into a stable symbolic code and
//! decides whether a failure is worth retrying. Codes are stored uppercase,
//! with `timeout` as the one well-known lowercase sentinel.

use std::error::Error as StdError;
use std::io;

/// The lowercase sentinel kept as-is by canonicalization
const TIMEOUT: &str = "timeout";

/// Message fragment some stacks produce instead of a code when the whole
/// network stack is down
const OUTAGE_FRAGMENT: &str = "network communication is unavailable";

/// Codes worth retrying with backoff
const TRANSIENT: &[&str] = &[
    TIMEOUT,
    "ENOTCONN",
    "EHOSTUNREACH",
    "EHOSTDOWN",
    "ENETUNREACH",
    "ENETDOWN",
    "ENETRESET",
    "EAGAIN",
    "EINTR",
    "EALREADY",
    "EINPROGRESS",
    "EWOULDBLOCK",
    "ENOBUFS",
    "EADDRNOTAVAIL",
    "ECONNREFUSED",
    "ECONNRESET",
    "ECONNABORTED",
    "EPIPE",
    "EBADF",
    "EIO",
    "ECANCELED",
    "ETIMEDOUT",
    "EAI_AGAIN",
    "EAI_FAIL",
    "EAI_SYSTEM",
    "EAI_NONAME",
    "EAI_NODATA",
    "ENOTFOUND",
    "ERR_SOCKET_DGRAM_NOT_RUNNING",
    "ERR_SOCKET_CLOSED",
];

/// Canonicalize a symbolic code: uppercase unless it is the well-known
/// lowercase `timeout` sentinel. Idempotent.
pub fn canonicalize(code: &str) -> String {
    if code == TIMEOUT {
        code.to_string()
    } else {
        code.to_ascii_uppercase()
    }
}

/// Symbolic code for an `io::ErrorKind`, where one is known
fn kind_code(kind: io::ErrorKind) -> Option<&'static str> {
    use io::ErrorKind::*;
    match kind {
        NotConnected => Some("ENOTCONN"),
        HostUnreachable => Some("EHOSTUNREACH"),
        NetworkUnreachable => Some("ENETUNREACH"),
        NetworkDown => Some("ENETDOWN"),
        WouldBlock => Some("EWOULDBLOCK"),
        Interrupted => Some("EINTR"),
        AddrNotAvailable => Some("EADDRNOTAVAIL"),
        AddrInUse => Some("EADDRINUSE"),
        ConnectionRefused => Some("ECONNREFUSED"),
        ConnectionReset => Some("ECONNRESET"),
        ConnectionAborted => Some("ECONNABORTED"),
        BrokenPipe => Some("EPIPE"),
        TimedOut => Some("ETIMEDOUT"),
        PermissionDenied => Some("EACCES"),
        NotFound => Some("ENOENT"),
        OutOfMemory => Some("ENOMEM"),
        _ => None,
    }
}

/// Translate an OS error number into a symbolic code
pub fn errno_code(errno: i32) -> Option<&'static str> {
    kind_code(io::Error::from_raw_os_error(errno).kind())
}

/// Canonical symbolic code for an `io::Error`
///
/// Prefers the OS error number, falls back to the kind, and for kinds
/// without a well-known name uses the uppercased kind debug name as a
/// passthrough code.
pub fn io_code(err: &io::Error) -> String {
    if let Some(errno) = err.raw_os_error() {
        if let Some(code) = errno_code(errno) {
            return code.to_string();
        }
    }
    match kind_code(err.kind()) {
        Some(code) => code.to_string(),
        None => canonicalize(&format!("{:?}", err.kind())),
    }
}

/// Whether a symbolic code is in the transient set
pub fn is_transient_code(code: &str) -> bool {
    let code = canonicalize(code);
    TRANSIENT.iter().any(|c| *c == code)
}

/// Whether the error, or anything in its source chain, mentions the
/// network-outage message fragment (case-insensitive)
pub fn chain_mentions_outage(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if e.to_string().to_ascii_lowercase().contains(OUTAGE_FRAGMENT) {
            return true;
        }
        current = e.source();
    }
    false
}

/// Full classification over an arbitrary error value
///
/// Checks the error's own code when it carries one, recurses one level
/// into the cause for a code-bearing source, and finally probes the whole
/// chain for the outage message.
pub fn is_transient(err: &(dyn StdError + 'static)) -> bool {
    if code_of(err).map(|c| is_transient_code(&c)).unwrap_or(false) {
        return true;
    }
    if let Some(cause) = err.source() {
        if code_of(cause).map(|c| is_transient_code(&c)).unwrap_or(false) {
            return true;
        }
    }
    chain_mentions_outage(err)
}

/// The connect path additionally retries `connection-failure`
pub fn is_transient_for_connect(err: &crate::Error) -> bool {
    matches!(err, crate::Error::ConnectionFailure(_)) || err.is_transient()
}

fn code_of(err: &(dyn StdError + 'static)) -> Option<String> {
    if let Some(e) = err.downcast_ref::<crate::Error>() {
        Some(e.code().to_string())
    } else {
        err.downcast_ref::<io::Error>().map(io_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn canonicalize_uppercases_codes() {
        assert_eq!(canonicalize("eintr"), "EINTR");
        assert_eq!(canonicalize("econnreset"), "ECONNRESET");
    }

    #[test]
    fn canonicalize_keeps_timeout_lowercase() {
        assert_eq!(canonicalize("timeout"), "timeout");
    }

    #[test]
    fn canonicalize_is_idempotent() {
        for code in ["eintr", "timeout", "EHOSTUNREACH", "weird-code"] {
            let once = canonicalize(code);
            assert_eq!(canonicalize(&once), once, "double canonicalize of {code}");
        }
    }

    #[test]
    fn lowercase_well_known_code_is_transient() {
        // eintr -> EINTR, which is in the transient set
        assert!(is_transient_code("eintr"));
        assert_eq!(canonicalize("eintr"), "EINTR");
    }

    #[test]
    fn transient_set_membership() {
        for code in ["timeout", "ENOTCONN", "ECONNRESET", "EHOSTUNREACH", "EBADF"] {
            assert!(is_transient_code(code), "{code} should be transient");
        }
        for code in ["EACCES", "ENOENT", "missing-token", "device-error"] {
            assert!(!is_transient_code(code), "{code} should not be transient");
        }
    }

    #[test]
    fn io_error_kinds_map_to_codes() {
        let err = io::Error::new(ErrorKind::ConnectionReset, "reset");
        assert_eq!(io_code(&err), "ECONNRESET");

        let err = io::Error::new(ErrorKind::NotConnected, "gone");
        assert_eq!(io_code(&err), "ENOTCONN");
        assert!(is_transient(&err));
    }

    #[test]
    fn outage_message_is_transient_even_when_nested() {
        let inner = io::Error::new(
            ErrorKind::Other,
            "NETWORK COMMUNICATION IS UNAVAILABLE while reconnecting",
        );
        let outer = io::Error::new(ErrorKind::Other, inner);
        assert!(chain_mentions_outage(&outer));
        assert!(is_transient(&outer));
    }

    #[test]
    fn plain_message_without_code_is_not_transient() {
        let err = io::Error::new(ErrorKind::Other, "some other failure");
        assert!(!is_transient(&err));
    }

    #[test]
    fn connect_classifier_accepts_connection_failure() {
        let err = crate::Error::ConnectionFailure("device unreachable".to_string());
        assert!(!err.is_transient());
        assert!(is_transient_for_connect(&err));
    }
}
