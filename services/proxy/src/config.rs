//! Proxy configuration.
//!
//! Sources, lowest precedence first: built-in defaults, the TOML file
//! (`--config`, else `./portmux.toml` when present), then command-line
//! flags and their `PORTMUX_*` environment variables.

use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use directories::UserDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::dialer::{split_host_port, Socks5Config, UpstreamDialer};
use crate::proxy::{ListenerConfig, RouterConfig};
use crate::tls::{CertificateConfig, GenerationParams};

/// Config file picked up from the working directory when `--config` is
/// not given.
pub const DEFAULT_CONFIG_FILE: &str = "portmux.toml";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

const MAX_VALIDITY_DAYS: u32 = 3650;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid SOCKS5 URL {url}: {reason}")]
    InvalidSocks5Url { url: String, reason: String },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Single-port protocol-sniffing proxy.
#[derive(Debug, Default, Parser)]
#[command(name = "portmux")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long, env = "PORTMUX_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(short, long, env = "PORTMUX_PORT")]
    pub port: Option<u16>,

    /// Address to bind to.
    #[arg(long, env = "PORTMUX_BIND", value_name = "ADDR")]
    pub bind: Option<String>,

    /// Upstream SOCKS5 relay (socks5://[user:pass@]host:port).
    #[arg(long, env = "PORTMUX_SOCKS5_PROXY", value_name = "URL")]
    pub socks5_proxy: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "PORTMUX_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Port for the admin endpoint.
    #[arg(long, env = "PORTMUX_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Do not start the admin endpoint.
    #[arg(long, env = "PORTMUX_DISABLE_METRICS")]
    pub disable_metrics: bool,
}

/// Full proxy configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub socks5: Socks5Section,
    pub ssl: SslConfig,
    pub upstream: UpstreamConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Upper bound on one accept wait before shutdown is re-checked.
    #[serde(default = "default_accept_poll_interval_ms")]
    pub accept_poll_interval_ms: u64,

    /// Drain window on shutdown.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_port() -> u16 {
    8443
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_accept_poll_interval_ms() -> u64 {
    1000
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_addr: default_bind_addr(),
            max_connections: default_max_connections(),
            accept_poll_interval_ms: default_accept_poll_interval_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// Upstream SOCKS5 relay.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Socks5Section {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_socks5_host")]
    pub host: String,

    #[serde(default = "default_socks5_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Handshake and connect timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_socks5_host() -> String {
    "127.0.0.1".to_string()
}

fn default_socks5_port() -> u16 {
    1080
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for Socks5Section {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_socks5_host(),
            port: default_socks5_port(),
            username: None,
            password: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for Socks5Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socks5Section")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// TLS certificate settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SslConfig {
    /// Generate and cache a self-signed certificate.
    #[serde(default = "default_true")]
    pub auto_generate: bool,

    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    #[serde(default)]
    pub key_file: Option<PathBuf>,

    #[serde(default = "default_dns_names")]
    pub dns_names: Vec<String>,

    #[serde(default = "default_ip_addresses")]
    pub ip_addresses: Vec<String>,

    #[serde(default = "default_validity_days")]
    pub validity_days: u32,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_true")]
    pub rotation_enabled: bool,

    #[serde(default = "default_rotation_check_interval_secs")]
    pub rotation_check_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_dns_names() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_ip_addresses() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}

fn default_validity_days() -> u32 {
    365
}

/// `~/.portmux/certs`, or relative to the working directory when no home
/// directory is known.
fn default_cache_dir() -> PathBuf {
    UserDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_default()
        .join(".portmux")
        .join("certs")
}

fn default_rotation_check_interval_secs() -> u64 {
    24 * 60 * 60
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            auto_generate: true,
            cert_file: None,
            key_file: None,
            dns_names: default_dns_names(),
            ip_addresses: default_ip_addresses(),
            validity_days: default_validity_days(),
            cache_dir: default_cache_dir(),
            rotation_enabled: true,
            rotation_check_interval_secs: default_rotation_check_interval_secs(),
        }
    }
}

/// Fixed upstreams and per-session timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    #[serde(default = "default_https_upstream")]
    pub https: String,

    #[serde(default = "default_jabber_upstream")]
    pub jabber: String,

    #[serde(default = "default_timeout_secs")]
    pub detect_timeout_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub dial_timeout_secs: u64,
}

fn default_https_upstream() -> String {
    crate::proxy::DEFAULT_HTTPS_UPSTREAM.to_string()
}

fn default_jabber_upstream() -> String {
    crate::proxy::DEFAULT_JABBER_UPSTREAM.to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            https: default_https_upstream(),
            jabber: default_jabber_upstream(),
            detect_timeout_secs: default_timeout_secs(),
            dial_timeout_secs: default_timeout_secs(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Admin endpoint (`/metrics`, `/health`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,

    #[serde(default = "default_metrics_bind_addr")]
    pub bind_addr: String,
}

fn default_metrics_port() -> u16 {
    8199
}

fn default_metrics_bind_addr() -> String {
    "127.0.0.1".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            bind_addr: default_metrics_bind_addr(),
        }
    }
}

impl Config {
    /// Load from `path`, or from `./portmux.toml` if it exists, or use
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    Self::from_file(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents, path)
    }

    /// Parse TOML. `path` only labels errors.
    pub fn from_toml(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the file named by `cli`, apply its overrides and validate.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = Self::load(cli.config.as_deref())?;
        config.apply_cli(cli)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) -> Result<(), ConfigError> {
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(bind) = &cli.bind {
            self.server.bind_addr = bind.clone();
        }
        if let Some(url) = &cli.socks5_proxy {
            let relay = Socks5Config::from_url(url)?;
            self.socks5.enabled = true;
            self.socks5.host = relay.host;
            self.socks5.port = relay.port;
            self.socks5.username = relay.credentials.as_ref().map(|c| c.username.clone());
            self.socks5.password = relay.credentials.map(|c| c.password);
        }
        if let Some(level) = &cli.log_level {
            self.logging.level = level.clone();
        }
        if let Some(port) = cli.metrics_port {
            self.metrics.port = port;
        }
        if cli.disable_metrics {
            self.metrics.enabled = false;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::invalid("server.port", "must be between 1 and 65535"));
        }
        parse_ip("server.bind_addr", &self.server.bind_addr)?;
        if self.server.max_connections == 0 {
            return Err(ConfigError::invalid("server.max_connections", "must be at least 1"));
        }
        if self.server.accept_poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "server.accept_poll_interval_ms",
                "must be greater than 0",
            ));
        }

        if self.socks5.enabled {
            if self.socks5.host.trim().is_empty() {
                return Err(ConfigError::invalid("socks5.host", "must not be empty"));
            }
            if self.socks5.port == 0 {
                return Err(ConfigError::invalid("socks5.port", "must be between 1 and 65535"));
            }
            if self.socks5.timeout_secs == 0 {
                return Err(ConfigError::invalid("socks5.timeout_secs", "must be greater than 0"));
            }
            if self.socks5.password.is_some() && self.socks5.username.is_none() {
                return Err(ConfigError::invalid("socks5.username", "required when a password is set"));
            }
        }

        if !self.ssl.auto_generate && (self.ssl.cert_file.is_none() || self.ssl.key_file.is_none()) {
            return Err(ConfigError::invalid(
                "ssl.cert_file",
                "cert_file and key_file are required when auto_generate is false",
            ));
        }
        for ip in &self.ssl.ip_addresses {
            parse_ip("ssl.ip_addresses", ip)?;
        }
        if !(1..=MAX_VALIDITY_DAYS).contains(&self.ssl.validity_days) {
            return Err(ConfigError::invalid(
                "ssl.validity_days",
                format!("must be between 1 and {MAX_VALIDITY_DAYS}"),
            ));
        }
        if self.ssl.rotation_enabled && self.ssl.rotation_check_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "ssl.rotation_check_interval_secs",
                "must be greater than 0",
            ));
        }

        for (field, address) in [
            ("upstream.https", &self.upstream.https),
            ("upstream.jabber", &self.upstream.jabber),
        ] {
            split_host_port(address).map_err(|e| ConfigError::invalid(field, e.to_string()))?;
        }
        if self.upstream.detect_timeout_secs == 0 || self.upstream.dial_timeout_secs == 0 {
            return Err(ConfigError::invalid("upstream", "timeouts must be greater than 0"));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("must be one of {}", LOG_LEVELS.join(", ")),
            ));
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(ConfigError::invalid("metrics.port", "must be between 1 and 65535"));
            }
            parse_ip("metrics.bind_addr", &self.metrics.bind_addr)?;
            if self.metrics.port == self.server.port {
                return Err(ConfigError::invalid(
                    "metrics.port",
                    "must differ from server.port",
                ));
            }
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = parse_ip("server.bind_addr", &self.server.bind_addr)?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// Admin endpoint address, `None` when disabled.
    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        if !self.metrics.enabled {
            return Ok(None);
        }
        let ip = parse_ip("metrics.bind_addr", &self.metrics.bind_addr)?;
        Ok(Some(SocketAddr::new(ip, self.metrics.port)))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    pub fn listener_config(&self) -> Result<ListenerConfig, ConfigError> {
        let mut listener = ListenerConfig::new(self.listen_addr()?);
        listener.max_connections = self.server.max_connections;
        listener.accept_poll_interval = Duration::from_millis(self.server.accept_poll_interval_ms);
        Ok(listener)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            detect_timeout: Duration::from_secs(self.upstream.detect_timeout_secs),
            dial_timeout: Duration::from_secs(self.upstream.dial_timeout_secs),
            https_upstream: self.upstream.https.clone(),
            jabber_upstream: self.upstream.jabber.clone(),
            ..RouterConfig::default()
        }
    }

    /// Relay settings, `None` when dialing directly.
    pub fn socks5_config(&self) -> Option<Socks5Config> {
        if !self.socks5.enabled {
            return None;
        }

        let mut relay = Socks5Config::new(self.socks5.host.clone(), self.socks5.port)
            .with_timeout(Duration::from_secs(self.socks5.timeout_secs));
        if let Some(username) = &self.socks5.username {
            relay = relay.with_credentials(
                username.clone(),
                self.socks5.password.clone().unwrap_or_default(),
            );
        }
        Some(relay)
    }

    pub fn dialer(&self) -> UpstreamDialer {
        match self.socks5_config() {
            Some(relay) => UpstreamDialer::via_socks5(relay),
            None => UpstreamDialer::direct(),
        }
    }

    pub fn certificate_config(&self) -> Result<CertificateConfig, ConfigError> {
        let config = if self.ssl.auto_generate {
            let ip_addresses = self
                .ssl
                .ip_addresses
                .iter()
                .map(|ip| parse_ip("ssl.ip_addresses", ip))
                .collect::<Result<Vec<_>, _>>()?;

            CertificateConfig::generate(
                GenerationParams {
                    dns_names: self.ssl.dns_names.clone(),
                    ip_addresses,
                    validity_days: self.ssl.validity_days,
                },
                self.ssl.cache_dir.clone(),
            )
        } else {
            match (&self.ssl.cert_file, &self.ssl.key_file) {
                (Some(cert), Some(key)) => CertificateConfig::files(cert, key),
                _ => {
                    return Err(ConfigError::invalid(
                        "ssl.cert_file",
                        "cert_file and key_file are required when auto_generate is false",
                    ))
                }
            }
        };

        let rotation = (self.ssl.auto_generate && self.ssl.rotation_enabled)
            .then(|| Duration::from_secs(self.ssl.rotation_check_interval_secs));
        Ok(config.with_rotation_interval(rotation))
    }
}

fn parse_ip(field: &'static str, value: &str) -> Result<IpAddr, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(field, format!("{value:?} is not an IP address")))
}
