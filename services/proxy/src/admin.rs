//! Admin HTTP endpoint.
//!
//! - `GET /metrics`: Prometheus text exposition
//! - `GET /health`: JSON status, 503 once the server is draining

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::metrics::ProxyMetrics;
use crate::proxy::{ServerState, ServerStatus};
use crate::tls::CertificateManager;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok", "draining" or "stopped".
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_sessions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateStatus>,
}

/// Active certificate summary.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct CertificateStatus {
    pub subject: String,
    pub serial: String,
    /// Unix seconds.
    pub not_after: i64,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<String>,
}

#[derive(Clone)]
struct AdminState {
    metrics: Arc<ProxyMetrics>,
    certificates: Option<Arc<CertificateManager>>,
    status: ServerStatus,
}

/// Bound admin endpoint, served once the proxy starts.
pub struct AdminServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    metrics: Arc<ProxyMetrics>,
    certificates: Option<Arc<CertificateManager>>,
}

impl AdminServer {
    pub async fn bind(
        addr: SocketAddr,
        metrics: Arc<ProxyMetrics>,
        certificates: Option<Arc<CertificateManager>>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            metrics,
            certificates,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` turns true.
    pub(crate) fn serve(
        self,
        status: ServerStatus,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let app = routes(AdminState {
            metrics: self.metrics,
            certificates: self.certificates,
            status,
        });
        let listener = self.listener;
        let local_addr = self.local_addr;

        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await;

            match result {
                Ok(()) => info!(admin_addr = %local_addr, "Admin endpoint stopped"),
                Err(e) => error!(error = %e, "Admin endpoint failed"),
            }
        })
    }
}

fn routes(state: AdminState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state)
}

async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
    let not_after = state
        .certificates
        .as_ref()
        .and_then(|manager| manager.not_after());

    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.render(not_after),
    )
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let server_state = state.status.state();
    let certificate = state
        .certificates
        .as_ref()
        .and_then(|manager| manager.certificate_info())
        .map(|info| CertificateStatus {
            subject: info.subject,
            serial: info.serial,
            not_after: info.not_after.unix_timestamp(),
            dns_names: info.dns_names,
            ip_addresses: info.ip_addresses.iter().map(ToString::to_string).collect(),
        });

    let response = HealthResponse {
        status: match server_state {
            ServerState::Listening => "ok",
            other => other.as_str(),
        }
        .to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.metrics.uptime_secs(),
        active_sessions: state.status.active_sessions(),
        certificate,
    };

    let code = if server_state == ServerState::Listening {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
