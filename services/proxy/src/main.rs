//! portmux binary.
//!
//! Loads configuration, initializes the certificate manager, starts the
//! proxy (and admin endpoint) and drains on SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use portmux_proxy::admin::AdminServer;
use portmux_proxy::{
    logging, Cli, CertificateManager, Config, ConnectionRouter, MetricsSink, ProxyMetrics,
    ProxyServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_cli(&cli).context("Invalid configuration")?;

    logging::init(&config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting portmux");
    info!(
        listen_addr = %config.listen_addr()?,
        socks5_enabled = config.socks5.enabled,
        metrics_enabled = config.metrics.enabled,
        auto_generate_certs = config.ssl.auto_generate,
        "Configuration loaded"
    );

    let certificates = CertificateManager::new(config.certificate_config()?)
        .await
        .context("Failed to initialize TLS certificates")?;
    if let Some(info) = certificates.certificate_info() {
        info!(
            subject = %info.subject,
            serial = %info.serial,
            not_after = %info.not_after,
            dns_names = ?info.dns_names,
            "TLS certificate ready"
        );
    }

    let dialer = config.dialer();
    if let Some(relay) = dialer.relay_addr() {
        info!(relay = %relay, auth = dialer.has_auth(), "Using SOCKS5 relay");
        match dialer.check_connectivity().await {
            Ok(()) => info!(relay = %relay, "SOCKS5 relay connectivity verified"),
            Err(e) => warn!(relay = %relay, error = %e, "SOCKS5 relay connectivity check failed"),
        }
    }

    let metrics = Arc::new(ProxyMetrics::new());
    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let router = ConnectionRouter::new(config.router_config(), dialer, Arc::clone(&sink));

    let mut server = ProxyServer::bind(config.listener_config()?, router, sink)
        .await
        .context("Failed to bind proxy listener")?;

    if let Some(admin_addr) = config.metrics_addr()? {
        let admin = AdminServer::bind(admin_addr, Arc::clone(&metrics), Some(Arc::clone(&certificates)))
            .await
            .with_context(|| format!("Failed to bind admin endpoint on {admin_addr}"))?;
        server = server.with_admin(admin);
    }

    let handle = server.start().context("Failed to start proxy server")?;

    shutdown_signal().await;
    info!("Received shutdown signal");

    if let Err(e) = handle.shutdown(config.shutdown_timeout()).await {
        warn!(error = %e, "Graceful shutdown incomplete");
    }
    certificates.shutdown().await;

    info!("portmux stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
