//! Per-connection routing.
//!
//! A session runs strictly in order: detect the protocol, pick and dial
//! the upstream, then relay. Detection is the only bounded phase; once a
//! protocol is known the session runs for as long as both peers keep it
//! open.
//!
//! | Protocol | Upstream                                  |
//! |----------|-------------------------------------------|
//! | HTTP     | CONNECT target, or absolute URI / `Host`  |
//! | HTTPS    | fixed `https_upstream`                    |
//! | Jabber   | fixed `jabber_upstream`                   |
//! | Unknown  | none, the connection is closed            |

use std::sync::Arc;
use std::time::Duration;

use portmux_protocol::ProtocolTag;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::http::{read_request_head, DEFAULT_MAX_REQUEST_HEAD};
use super::peek::{detect_with_timeout, PeekableStream};
use super::relay::{relay, RelayStats};
use crate::dialer::UpstreamDialer;
use crate::error::{DialError, SessionError};
use crate::metrics::{Direction, MetricsSink, RelayEvent};

/// Default bound on protocol detection.
pub const DEFAULT_DETECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on upstream dials.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_HTTPS_UPSTREAM: &str = "web.whatsapp.com:443";
pub const DEFAULT_JABBER_UPSTREAM: &str = "e1.whatsapp.net:5222";

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const CONNECT_FAILED: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: 12\r\n\
Connection: close\r\n\
\r\n\
Bad Gateway\n";

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Bound on reading enough bytes to classify the protocol.
    pub detect_timeout: Duration,
    /// Bound on each upstream dial.
    pub dial_timeout: Duration,
    /// Destination for every HTTPS connection.
    pub https_upstream: String,
    /// Destination for every Jabber connection.
    pub jabber_upstream: String,
    /// Largest HTTP request head accepted.
    pub max_request_head: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            detect_timeout: DEFAULT_DETECT_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            https_upstream: DEFAULT_HTTPS_UPSTREAM.to_string(),
            jabber_upstream: DEFAULT_JABBER_UPSTREAM.to_string(),
            max_request_head: DEFAULT_MAX_REQUEST_HEAD,
        }
    }
}

/// Outcome of a session that reached the relay phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub protocol: ProtocolTag,
    pub upstream: String,
    pub stats: RelayStats,
}

/// Drives one client connection from detection to relay completion.
#[derive(Clone)]
pub struct ConnectionRouter {
    config: Arc<RouterConfig>,
    dialer: UpstreamDialer,
    metrics: Arc<dyn MetricsSink>,
}

impl ConnectionRouter {
    pub fn new(config: RouterConfig, dialer: UpstreamDialer, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            config: Arc::new(config),
            dialer,
            metrics,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Handle `client` until both relay directions finish or the session
    /// fails. Errors end this session only and are reported to metrics
    /// exactly once.
    pub async fn handle<S>(&self, client: S) -> Result<SessionSummary, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.metrics.record(RelayEvent::ConnectionOpened);

        let result = self.run_session(client).await;
        match &result {
            Ok(summary) => {
                debug!(
                    protocol = %summary.protocol,
                    upstream = %summary.upstream,
                    bytes_to_upstream = summary.stats.client_to_upstream,
                    bytes_to_client = summary.stats.upstream_to_client,
                    "Session finished"
                );
            }
            Err(e) => {
                self.metrics.record(RelayEvent::ErrorOccurred {
                    reason: e.reason_code(),
                });
                match e {
                    SessionError::Dial(_) => warn!(error = %e, "Session failed"),
                    _ => debug!(error = %e, reason = e.reason_code(), "Session failed"),
                }
            }
        }

        self.metrics.record(RelayEvent::ConnectionClosed);
        result
    }

    async fn run_session<S>(&self, client: S) -> Result<SessionSummary, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut stream = PeekableStream::new(client);

        let protocol = detect_with_timeout(&mut stream, self.config.detect_timeout).await?;
        self.metrics.record(RelayEvent::ProtocolClassified(protocol));
        debug!(protocol = %protocol, "Protocol detected");

        let (upstream, stats) = match protocol {
            ProtocolTag::Http => self.route_http(stream).await?,
            ProtocolTag::Https => {
                let target = self.config.https_upstream.clone();
                self.route_fixed(stream, target).await?
            }
            ProtocolTag::Jabber => {
                let target = self.config.jabber_upstream.clone();
                self.route_fixed(stream, target).await?
            }
            ProtocolTag::Unknown => return Err(SessionError::UnroutableProtocol(protocol)),
        };

        self.metrics.record(RelayEvent::BytesTransferred {
            direction: Direction::ClientToUpstream,
            bytes: stats.client_to_upstream,
        });
        self.metrics.record(RelayEvent::BytesTransferred {
            direction: Direction::UpstreamToClient,
            bytes: stats.upstream_to_client,
        });

        Ok(SessionSummary {
            protocol,
            upstream,
            stats,
        })
    }

    async fn route_http<S>(
        &self,
        mut stream: PeekableStream<S>,
    ) -> Result<(String, RelayStats), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let head = read_request_head(&mut stream, self.config.max_request_head).await?;
        let target = head.upstream_addr()?;
        info!(method = %head.method, target = %target, "HTTP request");

        if head.is_connect() {
            let upstream = match self.dial(&target).await {
                Ok(upstream) => upstream,
                Err(e) => {
                    let _ = stream.write_all(CONNECT_FAILED).await;
                    return Err(e.into());
                }
            };

            stream.write_all(CONNECT_ESTABLISHED).await?;
            // The CONNECT head is ours; anything after it belongs to the tunnel.
            stream.consume(head.head_len);
            let stats = splice(stream, upstream).await?;
            return Ok((target, stats));
        }

        let upstream = match self.dial(&target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let _ = stream.write_all(BAD_GATEWAY).await;
                return Err(e.into());
            }
        };

        // The head is still buffered and goes out verbatim.
        let stats = splice(stream, upstream).await?;
        Ok((target, stats))
    }

    async fn route_fixed<S>(
        &self,
        stream: PeekableStream<S>,
        target: String,
    ) -> Result<(String, RelayStats), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let upstream = self.dial(&target).await?;
        let stats = splice(stream, upstream).await?;
        Ok((target, stats))
    }

    async fn dial(&self, target: &str) -> Result<TcpStream, DialError> {
        let upstream = self
            .dialer
            .dial_timeout("tcp", target, self.config.dial_timeout)
            .await?;
        debug!(target = %target, relay = ?self.dialer.relay_addr(), "Upstream connected");
        Ok(upstream)
    }
}

/// Flush everything still buffered to `upstream`, then relay.
async fn splice<S>(
    stream: PeekableStream<S>,
    mut upstream: TcpStream,
) -> Result<RelayStats, SessionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (client, pending) = stream.into_parts();
    if !pending.is_empty() {
        upstream.write_all(&pending).await?;
    }

    let mut stats = relay(client, upstream).await;
    stats.client_to_upstream += pending.len() as u64;
    Ok(stats)
}
