//! Relay telemetry.
//!
//! The proxy core reports what happens to each connection as a stream of
//! [`RelayEvent`]s pushed into a [`MetricsSink`]. It never reads metrics
//! state back. [`ProxyMetrics`] is the production sink: plain atomic
//! counters, rendered in Prometheus text format for the admin endpoint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use portmux_protocol::ProtocolTag;
use time::OffsetDateTime;

/// Relaxed is sufficient for independent counters.
const METRIC_ORDERING: Ordering = Ordering::Relaxed;

/// Direction of a relay copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes read from the client and written upstream.
    ClientToUpstream,
    /// Bytes read from the upstream and written to the client.
    UpstreamToClient,
}

/// One-way telemetry event emitted by the proxy core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    ConnectionOpened,
    ConnectionClosed,
    /// Dropped at accept time because the connection limit was reached.
    ConnectionRejected,
    ProtocolClassified(ProtocolTag),
    BytesTransferred { direction: Direction, bytes: u64 },
    /// Terminal session failure, labelled with a stable reason code.
    ErrorOccurred { reason: &'static str },
}

/// Receiver for relay telemetry.
pub trait MetricsSink: Send + Sync + 'static {
    fn record(&self, event: RelayEvent);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: RelayEvent) {}
}

/// Atomic counters for the running proxy.
#[derive(Debug)]
pub struct ProxyMetrics {
    started_at: Instant,
    /// Total connections accepted.
    connections_total: AtomicU64,
    /// Connections currently being handled.
    connections_active: AtomicU64,
    /// Sessions that ended with an error.
    connections_failed: AtomicU64,
    /// Connections refused because of the connection limit.
    connections_rejected: AtomicU64,
    /// Classified connections, indexed like [`ProtocolTag::ALL`].
    protocols: [AtomicU64; 4],
    /// Upstream to client.
    bytes_sent: AtomicU64,
    /// Client to upstream.
    bytes_received: AtomicU64,
    errors: Mutex<BTreeMap<&'static str, u64>>,
}

/// Point-in-time copy of [`ProxyMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_failed: u64,
    pub connections_rejected: u64,
    pub http: u64,
    pub https: u64,
    pub jabber: u64,
    pub unknown: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: BTreeMap<&'static str, u64>,
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_failed: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            protocols: Default::default(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            errors: Mutex::new(BTreeMap::new()),
        }
    }

    fn protocol_index(tag: ProtocolTag) -> usize {
        match tag {
            ProtocolTag::Http => 0,
            ProtocolTag::Https => 1,
            ProtocolTag::Jabber => 2,
            ProtocolTag::Unknown => 3,
        }
    }

    /// Seconds since the metrics were created.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let errors = match self.errors.lock() {
            Ok(errors) => errors.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        MetricsSnapshot {
            connections_total: self.connections_total.load(METRIC_ORDERING),
            connections_active: self.connections_active.load(METRIC_ORDERING),
            connections_failed: self.connections_failed.load(METRIC_ORDERING),
            connections_rejected: self.connections_rejected.load(METRIC_ORDERING),
            http: self.protocols[0].load(METRIC_ORDERING),
            https: self.protocols[1].load(METRIC_ORDERING),
            jabber: self.protocols[2].load(METRIC_ORDERING),
            unknown: self.protocols[3].load(METRIC_ORDERING),
            bytes_sent: self.bytes_sent.load(METRIC_ORDERING),
            bytes_received: self.bytes_received.load(METRIC_ORDERING),
            errors,
        }
    }

    /// Format metrics in Prometheus text exposition format.
    ///
    /// `certificate_not_after` adds an expiry gauge (unix seconds) when a
    /// managed certificate is active.
    pub fn render(&self, certificate_not_after: Option<OffsetDateTime>) -> String {
        let s = self.snapshot();
        let mut output = String::with_capacity(2048);

        counter(
            &mut output,
            "portmux_connections_total",
            "Total connections accepted",
            s.connections_total,
        );
        gauge(
            &mut output,
            "portmux_connections_active",
            "Current active connections",
            s.connections_active as i64,
        );
        counter(
            &mut output,
            "portmux_connections_failed_total",
            "Sessions terminated by an error",
            s.connections_failed,
        );
        counter(
            &mut output,
            "portmux_connections_rejected_total",
            "Connections rejected due to the connection limit",
            s.connections_rejected,
        );

        output.push_str("# HELP portmux_protocol_connections_total Connections by detected protocol\n");
        output.push_str("# TYPE portmux_protocol_connections_total counter\n");
        for (label, value) in [
            (ProtocolTag::Http, s.http),
            (ProtocolTag::Https, s.https),
            (ProtocolTag::Jabber, s.jabber),
            (ProtocolTag::Unknown, s.unknown),
        ] {
            output.push_str(&format!(
                "portmux_protocol_connections_total{{protocol=\"{}\"}} {}\n",
                label.as_label(),
                value
            ));
        }

        counter(
            &mut output,
            "portmux_bytes_sent_total",
            "Bytes relayed from upstreams to clients",
            s.bytes_sent,
        );
        counter(
            &mut output,
            "portmux_bytes_received_total",
            "Bytes relayed from clients to upstreams",
            s.bytes_received,
        );

        output.push_str("# HELP portmux_errors_total Session errors by reason\n");
        output.push_str("# TYPE portmux_errors_total counter\n");
        for (reason, value) in &s.errors {
            output.push_str(&format!(
                "portmux_errors_total{{reason=\"{}\"}} {}\n",
                reason, value
            ));
        }

        gauge(
            &mut output,
            "portmux_uptime_seconds",
            "Seconds since the proxy started",
            self.uptime_secs() as i64,
        );

        if let Some(not_after) = certificate_not_after {
            gauge(
                &mut output,
                "portmux_certificate_expiry_timestamp_seconds",
                "Unix time at which the active certificate expires",
                not_after.unix_timestamp(),
            );
        }

        output
    }
}

impl MetricsSink for ProxyMetrics {
    fn record(&self, event: RelayEvent) {
        match event {
            RelayEvent::ConnectionOpened => {
                self.connections_total.fetch_add(1, METRIC_ORDERING);
                self.connections_active.fetch_add(1, METRIC_ORDERING);
            }
            RelayEvent::ConnectionClosed => {
                // Saturate so a stray close can never wrap the gauge.
                let _ = self.connections_active.fetch_update(
                    METRIC_ORDERING,
                    METRIC_ORDERING,
                    |active| Some(active.saturating_sub(1)),
                );
            }
            RelayEvent::ConnectionRejected => {
                self.connections_rejected.fetch_add(1, METRIC_ORDERING);
            }
            RelayEvent::ProtocolClassified(tag) => {
                self.protocols[Self::protocol_index(tag)].fetch_add(1, METRIC_ORDERING);
            }
            RelayEvent::BytesTransferred { direction, bytes } => match direction {
                Direction::ClientToUpstream => {
                    self.bytes_received.fetch_add(bytes, METRIC_ORDERING);
                }
                Direction::UpstreamToClient => {
                    self.bytes_sent.fetch_add(bytes, METRIC_ORDERING);
                }
            },
            RelayEvent::ErrorOccurred { reason } => {
                self.connections_failed.fetch_add(1, METRIC_ORDERING);
                let mut errors = match self.errors.lock() {
                    Ok(errors) => errors,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *errors.entry(reason).or_insert(0) += 1;
            }
        }
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} counter\n"));
    output.push_str(&format!("{name} {value}\n"));
}

fn gauge(output: &mut String, name: &str, help: &str, value: i64) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} gauge\n"));
    output.push_str(&format!("{name} {value}\n"));
}
