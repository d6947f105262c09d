//! portmux: a single-port proxy that sniffs each connection's protocol
//! and forwards it upstream, directly or through a SOCKS5 relay.
//!
//! - [`proxy`]: listener, detection, routing and relay
//! - [`dialer`]: direct and SOCKS5 upstream connections
//! - [`tls`]: self-signed certificate generation, caching and rotation
//! - [`metrics`] and [`admin`]: counters and the `/metrics` + `/health` endpoint

pub mod admin;
pub mod config;
pub mod dialer;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod tls;

pub use config::{Cli, Config, ConfigError};
pub use dialer::{Network, Socks5Config, UpstreamDialer};
pub use error::{CertificateError, DialError, ParseError, SessionError, ShutdownTimeout};
pub use metrics::{MetricsSink, NoopMetrics, ProxyMetrics, RelayEvent};
pub use portmux_protocol::{DetectionError, ProtocolTag};
pub use proxy::{ConnectionRouter, ListenerConfig, ProxyServer, RouterConfig, ServerHandle, ServerState};
pub use tls::{CertificateConfig, CertificateManager};
