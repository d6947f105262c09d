//! Application protocol classification for the single-port proxy.
//!
//! This library decides, from the first bytes of a connection, which
//! application protocol the client speaks:
//! - TLS handshake records (`0x16 0x03 ..`) are HTTPS
//! - a known HTTP method token followed by a space is HTTP
//! - an XML prolog or an XMPP stream header is Jabber
//! - anything else is Unknown
//!
//! Classification is a pure function over a byte prefix. It never owns or
//! consumes the bytes; callers peek at the stream, classify, and only then
//! decide how to consume what they buffered.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Maximum number of bytes the detector ever needs to look at.
pub const PEEK_LEN: usize = 32;

/// TLS record content type for handshake messages.
const TLS_HANDSHAKE: u8 = 0x16;

/// Major version byte shared by SSL 3.0 and every TLS version.
const TLS_MAJOR_VERSION: u8 = 0x03;

/// HTTP method tokens recognised at the start of a connection.
pub const HTTP_METHODS: [&[u8]; 9] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"CONNECT ",
    b"PATCH ",
    b"TRACE ",
];

/// Prefixes that open an XMPP (Jabber) client stream.
pub const JABBER_PREFIXES: [&[u8]; 3] = [b"<?xml", b"<stream:stream", b"<stream"];

/// Protocol detected on a connection.
///
/// Derived once per connection from the peeked prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolTag {
    /// Plain HTTP/1.x request.
    Http,
    /// TLS handshake (HTTPS or any other TLS protocol).
    Https,
    /// XMPP client stream.
    Jabber,
    /// No rule matched.
    Unknown,
}

impl ProtocolTag {
    /// All tags, in a stable order.
    pub const ALL: [ProtocolTag; 4] = [
        ProtocolTag::Http,
        ProtocolTag::Https,
        ProtocolTag::Jabber,
        ProtocolTag::Unknown,
    ];

    /// Lowercase label for metrics and structured logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProtocolTag::Http => "http",
            ProtocolTag::Https => "https",
            ProtocolTag::Jabber => "jabber",
            ProtocolTag::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolTag::Http => "HTTP",
            ProtocolTag::Https => "HTTPS",
            ProtocolTag::Jabber => "Jabber",
            ProtocolTag::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Detection errors.
#[derive(Debug, Error)]
pub enum DetectionError {
    /// The stream ended before a single byte arrived.
    #[error("insufficient data: stream closed before any bytes were received")]
    InsufficientData,

    /// The client did not send enough bytes within the detection window.
    #[error("protocol detection timed out after {0:?}")]
    Timeout(Duration),

    /// Reading the prefix failed.
    #[error("failed to peek bytes: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of classifying a (possibly incomplete) prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The prefix already determines the protocol; more bytes cannot change it.
    Decided(ProtocolTag),
    /// A longer prefix could still change the outcome.
    NeedMore,
}

/// Classify a prefix that may still grow.
///
/// Rules are evaluated in priority order (TLS, HTTP, Jabber) and the first
/// match wins. `NeedMore` is returned only while the prefix is shorter than
/// [`PEEK_LEN`] and could still become one of the recognised prefixes.
pub fn classify(data: &[u8]) -> Classification {
    if data.is_empty() {
        return Classification::NeedMore;
    }

    if data[0] == TLS_HANDSHAKE {
        match data.get(1) {
            // A lone handshake byte is not enough to call it TLS.
            None => return Classification::NeedMore,
            Some(&TLS_MAJOR_VERSION) => return Classification::Decided(ProtocolTag::Https),
            Some(_) => {}
        }
    }

    if HTTP_METHODS.iter().any(|method| data.starts_with(method)) {
        return Classification::Decided(ProtocolTag::Http);
    }

    if JABBER_PREFIXES.iter().any(|prefix| data.starts_with(prefix)) {
        return Classification::Decided(ProtocolTag::Jabber);
    }

    if data.len() < PEEK_LEN && could_still_match(data) {
        Classification::NeedMore
    } else {
        Classification::Decided(ProtocolTag::Unknown)
    }
}

/// Classify a prefix that will not grow any further (end of stream, or
/// a complete in-memory buffer).
pub fn classify_final(data: &[u8]) -> Result<ProtocolTag, DetectionError> {
    if data.is_empty() {
        return Err(DetectionError::InsufficientData);
    }

    match classify(data) {
        Classification::Decided(tag) => Ok(tag),
        Classification::NeedMore => Ok(ProtocolTag::Unknown),
    }
}

/// True if `data` is a strict prefix of some recognised token.
fn could_still_match(data: &[u8]) -> bool {
    HTTP_METHODS
        .iter()
        .chain(JABBER_PREFIXES.iter())
        .any(|token| token.len() > data.len() && token.starts_with(data))
}
