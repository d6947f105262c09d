//! Upstream dialing, direct or through a SOCKS5 relay.
//!
//! Every dial races against a cancellation future. The race is biased
//! toward cancellation, so a signal that has already fired wins before any
//! I/O is started, and a dial stuck in a slow relay handshake is abandoned
//! as soon as the signal fires.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::error::DialError;

/// Default timeout for `dial` and the connectivity probe.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Endpoint used by [`UpstreamDialer::check_connectivity`].
pub const DEFAULT_PROBE_ADDR: &str = "google.com:80";

/// Transport network for a dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// Any address family.
    Tcp,
    /// IPv4 only.
    Tcp4,
    /// IPv6 only.
    Tcp6,
}

impl Network {
    fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl FromStr for Network {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(DialError::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        })
    }
}

/// Username/password for SOCKS5 subnegotiation.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// SOCKS5 relay parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Config {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    /// Used by `dial` and the connectivity probe.
    pub timeout: Duration,
}

impl Socks5Config {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Parse `socks5://[user:pass@]host:port`.
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSocks5Url {
            url: redact_url(url),
            reason: reason.to_string(),
        };

        let rest = url
            .strip_prefix("socks5://")
            .or_else(|| url.strip_prefix("socks5h://"))
            .ok_or_else(|| invalid("scheme must be socks5://"))?;

        let (userinfo, hostport) = match rest.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, rest),
        };

        let (host, port) = split_host_port(hostport).map_err(|_| invalid("expected host:port"))?;
        let mut config = Socks5Config::new(host, port);

        if let Some(userinfo) = userinfo {
            let (username, password) = userinfo
                .split_once(':')
                .ok_or_else(|| invalid("credentials must be user:pass"))?;
            if username.is_empty() {
                return Err(invalid("username must not be empty"));
            }
            config = config.with_credentials(username, password);
        }

        Ok(config)
    }

    /// `host:port` of the relay, bracketing IPv6 literals.
    pub fn addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

/// Outbound connection factory.
#[derive(Debug, Clone)]
pub struct UpstreamDialer {
    relay: Option<Socks5Config>,
    default_timeout: Duration,
    probe_addr: String,
}

impl Default for UpstreamDialer {
    fn default() -> Self {
        Self::direct()
    }
}

impl UpstreamDialer {
    /// Dialer that connects straight to targets.
    pub fn direct() -> Self {
        Self {
            relay: None,
            default_timeout: DEFAULT_DIAL_TIMEOUT,
            probe_addr: DEFAULT_PROBE_ADDR.to_string(),
        }
    }

    /// Dialer that tunnels every connection through `relay`.
    pub fn via_socks5(relay: Socks5Config) -> Self {
        Self {
            default_timeout: relay.timeout,
            relay: Some(relay),
            probe_addr: DEFAULT_PROBE_ADDR.to_string(),
        }
    }

    pub fn with_probe_addr(mut self, addr: impl Into<String>) -> Self {
        self.probe_addr = addr.into();
        self
    }

    /// Relay address, if one is configured.
    pub fn relay_addr(&self) -> Option<String> {
        self.relay.as_ref().map(Socks5Config::addr)
    }

    /// True when the relay uses username/password authentication.
    pub fn has_auth(&self) -> bool {
        self.relay
            .as_ref()
            .is_some_and(|relay| relay.credentials.is_some())
    }

    /// Dial with the configured default timeout.
    pub async fn dial(&self, network: &str, address: &str) -> Result<TcpStream, DialError> {
        self.dial_timeout(network, address, self.default_timeout).await
    }

    /// Dial, giving up with `DialCancelled` once `timeout` elapses.
    pub async fn dial_timeout(
        &self,
        network: &str,
        address: &str,
        timeout: Duration,
    ) -> Result<TcpStream, DialError> {
        let network: Network = network.parse()?;
        if timeout.is_zero() {
            return Err(DialError::DialCancelled {
                address: address.to_string(),
            });
        }
        self.dial_network(network, address, tokio::time::sleep(timeout))
            .await
    }

    /// Dial, abandoning the attempt as soon as `cancel` completes.
    pub async fn dial_with_cancel<F>(
        &self,
        network: &str,
        address: &str,
        cancel: F,
    ) -> Result<TcpStream, DialError>
    where
        F: Future<Output = ()>,
    {
        let network: Network = network.parse()?;
        self.dial_network(network, address, cancel).await
    }

    async fn dial_network<F>(
        &self,
        network: Network,
        address: &str,
        cancel: F,
    ) -> Result<TcpStream, DialError>
    where
        F: Future<Output = ()>,
    {
        let (host, port) = split_host_port(address)?;

        tokio::select! {
            biased;
            _ = cancel => {
                debug!(address = %address, "Dial cancelled");
                Err(DialError::DialCancelled { address: address.to_string() })
            }
            result = self.connect(network, &host, port, address) => result,
        }
    }

    async fn connect(
        &self,
        network: Network,
        host: &str,
        port: u16,
        address: &str,
    ) -> Result<TcpStream, DialError> {
        match &self.relay {
            Some(relay) => connect_via_relay(relay, host, port, address).await,
            None => connect_direct(network, host, port, address).await,
        }
    }

    /// Dial the probe endpoint and drop the connection.
    pub async fn check_connectivity(&self) -> Result<(), DialError> {
        let stream = self.dial("tcp", &self.probe_addr).await?;
        debug!(
            probe = %self.probe_addr,
            relay = ?self.relay_addr(),
            "Connectivity check succeeded"
        );
        drop(stream);
        Ok(())
    }
}

async fn connect_direct(
    network: Network,
    host: &str,
    port: u16,
    address: &str,
) -> Result<TcpStream, DialError> {
    let unreachable = |reason: String| DialError::UpstreamUnreachable {
        address: address.to_string(),
        reason,
    };

    let addrs = lookup_host((host, port))
        .await
        .map_err(|e| unreachable(format!("resolve failed: {e}")))?;

    let mut last_error = None;
    for addr in addrs.filter(|addr| network.accepts(addr)) {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(unreachable(match last_error {
        Some(e) => e.to_string(),
        None => format!("no {network} addresses for {host}"),
    }))
}

async fn connect_via_relay(
    relay: &Socks5Config,
    host: &str,
    port: u16,
    address: &str,
) -> Result<TcpStream, DialError> {
    let relay_addr = relay.addr();

    // Hostnames go out unresolved; the relay resolves them.
    let result = match &relay.credentials {
        Some(credentials) => {
            Socks5Stream::connect_with_password(
                relay_addr.as_str(),
                (host, port),
                &credentials.username,
                &credentials.password,
            )
            .await
        }
        None => Socks5Stream::connect(relay_addr.as_str(), (host, port)).await,
    };

    match result {
        Ok(stream) => {
            let stream = stream.into_inner();
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Err(
            tokio_socks::Error::PasswordAuthFailure(_)
            | tokio_socks::Error::NoAcceptableAuthMethods
            | tokio_socks::Error::InvalidAuthValues(_),
        ) => {
            warn!(relay = %relay_addr, "SOCKS5 relay rejected authentication");
            Err(DialError::RelayAuthFailed { relay: relay_addr })
        }
        Err(e) => Err(DialError::UpstreamUnreachable {
            address: address.to_string(),
            reason: format!("via SOCKS5 relay {relay_addr}: {e}"),
        }),
    }
}

/// Split `host:port`, unwrapping bracketed IPv6 literals.
pub fn split_host_port(address: &str) -> Result<(String, u16), DialError> {
    let invalid = || DialError::InvalidAddress(address.to_string());

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        (host, port)
    } else {
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        if host.contains(':') {
            return Err(invalid());
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

/// Join host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://<redacted>@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
