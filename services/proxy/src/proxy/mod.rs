//! Single-port proxy: protocol detection, routing and relay.
//!
//! ## Architecture
//!
//! ```text
//! Client -> ProxyServer -> detect -> ConnectionRouter -> UpstreamDialer -> Upstream
//!                                          |                  (direct or SOCKS5)
//!                                     HTTP head parse
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use portmux_proxy::proxy::{ConnectionRouter, ListenerConfig, ProxyServer, RouterConfig};
//!
//! let router = ConnectionRouter::new(RouterConfig::default(), UpstreamDialer::direct(), metrics.clone());
//! let server = ProxyServer::bind(ListenerConfig::new("0.0.0.0:8443".parse()?), router, metrics).await?;
//! let handle = server.start()?;
//! handle.shutdown(Duration::from_secs(30)).await?;
//! ```

pub mod http;
mod listener;
pub mod peek;
mod relay;
mod router;

pub use http::{parse_request_head, RequestHead};
pub use listener::{
    ListenerConfig, ProxyServer, ServerHandle, ServerState, ServerStatus,
    DEFAULT_ACCEPT_POLL_INTERVAL, DEFAULT_MAX_CONNECTIONS,
};
pub use peek::{detect, detect_with_timeout, PeekableStream};
pub use relay::{relay, RelayStats};
pub use router::{
    ConnectionRouter, RouterConfig, SessionSummary, DEFAULT_DETECT_TIMEOUT,
    DEFAULT_HTTPS_UPSTREAM, DEFAULT_JABBER_UPSTREAM,
};
