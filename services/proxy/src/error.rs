//! Error types for the proxy core.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use portmux_protocol::ProtocolTag;
use thiserror::Error;

pub use portmux_protocol::DetectionError;

/// Upstream dial failures.
#[derive(Debug, Error)]
pub enum DialError {
    /// Network other than tcp, tcp4 or tcp6. No I/O was attempted.
    #[error("unsupported network type: {0} (must be tcp, tcp4, or tcp6)")]
    UnsupportedNetwork(String),

    /// Address is not a `host:port` pair.
    #[error("invalid upstream address: {0}")]
    InvalidAddress(String),

    /// The cancellation signal fired before the dial completed.
    #[error("dial to {address} cancelled")]
    DialCancelled { address: String },

    /// Direct connect or relay CONNECT failed.
    #[error("upstream {address} unreachable: {reason}")]
    UpstreamUnreachable { address: String, reason: String },

    /// The SOCKS5 relay rejected our credentials or offered no usable method.
    #[error("SOCKS5 relay {relay} rejected authentication")]
    RelayAuthFailed { relay: String },
}

/// HTTP request head parse failures.
#[derive(Debug, Error)]
pub enum ParseError {
    /// httparse rejected the head.
    #[error("malformed HTTP request: {0}")]
    Malformed(String),

    /// The head did not terminate within the size limit.
    #[error("HTTP request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    /// The client closed the connection mid-head.
    #[error("connection closed before the request head was complete")]
    Incomplete,

    /// Neither the request target nor a Host header names a destination.
    #[error("request does not name a target host")]
    MissingHost,
}

/// Terminal failure of one proxied connection.
///
/// Never propagates beyond the task that owns the session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol detection failed: {0}")]
    Detection(#[from] DetectionError),

    #[error("no upstream can be inferred for protocol {0}")]
    UnroutableProtocol(ProtocolTag),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Stable reason code used for metrics labels and logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SessionError::Detection(DetectionError::InsufficientData) => "insufficient_data",
            SessionError::Detection(DetectionError::Timeout(_)) => "detect_timeout",
            SessionError::Detection(DetectionError::Io(_)) => "detect_io_error",
            SessionError::UnroutableProtocol(_) => "unroutable_protocol",
            SessionError::Parse(_) => "parse_failed",
            SessionError::Dial(DialError::UnsupportedNetwork(_)) => "unsupported_network",
            SessionError::Dial(DialError::InvalidAddress(_)) => "invalid_address",
            SessionError::Dial(DialError::DialCancelled { .. }) => "dial_cancelled",
            SessionError::Dial(DialError::UpstreamUnreachable { .. }) => "upstream_unreachable",
            SessionError::Dial(DialError::RelayAuthFailed { .. }) => "relay_auth_failed",
            SessionError::Io(_) => "io_error",
        }
    }
}

/// Certificate management failures.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Key or certificate generation failed.
    #[error("certificate generation failed: {0}")]
    GenerationFailed(String),

    /// A certificate or key could not be read or parsed.
    #[error("failed to load {}: {reason}", path.display())]
    LoadFailed { path: PathBuf, reason: String },

    /// The on-disk cache could not be written.
    #[error("failed to persist {}: {reason}", path.display())]
    PersistFailed { path: PathBuf, reason: String },

    /// Rotation requested for a certificate loaded from custom files.
    #[error("certificate rotation only available with auto-generation")]
    RotationUnavailable,

    /// Rotation requested after shutdown.
    #[error("certificate manager is shut down")]
    ManagerClosed,
}

/// Drain did not finish within the allotted window.
///
/// Sessions still running are left to finish on their own.
#[derive(Debug, Error)]
#[error("shutdown timed out after {waited:?} with {pending} session(s) still running")]
pub struct ShutdownTimeout {
    pub waited: Duration,
    pub pending: usize,
}
