//! TCP listener and server lifecycle.
//!
//! ```text
//! Stopped ──bind/start──> Listening ──shutdown──> Draining ──> Stopped
//! ```
//!
//! The accept loop waits on `accept` for at most `accept_poll_interval` and
//! re-checks the shutdown signal on every wake-up, so a quiet listener
//! still notices shutdown within one interval. Every accepted connection
//! holds one semaphore permit for its lifetime; drain is complete once all
//! permits are back.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use super::router::ConnectionRouter;
use crate::admin::AdminServer;
use crate::error::ShutdownTimeout;
use crate::metrics::{MetricsSink, RelayEvent};

/// Default maximum concurrent sessions.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Default upper bound on a single accept wait.
pub const DEFAULT_ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pause after a failed accept before retrying.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    /// Sessions over this limit are closed right after accept.
    pub max_connections: usize,
    /// How long one accept may block before the shutdown signal is
    /// checked again.
    pub accept_poll_interval: Duration,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            accept_poll_interval: DEFAULT_ACCEPT_POLL_INTERVAL,
        }
    }
}

/// Lifecycle state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Listening = 0,
    Draining = 1,
    Stopped = 2,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Listening,
            1 => ServerState::Draining,
            _ => ServerState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Listening => "listening",
            ServerState::Draining => "draining",
            ServerState::Stopped => "stopped",
        }
    }
}

/// Read-only view of a running server, shared with the admin endpoint.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    state: Arc<AtomicU8>,
    sessions: Arc<Semaphore>,
    capacity: usize,
}

impl ServerStatus {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(ServerState::Listening as u8)),
            sessions: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Sessions currently holding a permit.
    pub fn active_sessions(&self) -> usize {
        self.capacity
            .saturating_sub(self.sessions.available_permits())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A bound, not yet accepting, proxy server.
pub struct ProxyServer {
    config: ListenerConfig,
    listener: TcpListener,
    router: ConnectionRouter,
    metrics: Arc<dyn MetricsSink>,
    admin: Option<AdminServer>,
}

impl ProxyServer {
    /// Bind the listening socket.
    pub async fn bind(
        config: ListenerConfig,
        router: ConnectionRouter,
        metrics: Arc<dyn MetricsSink>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            config,
            listener,
            router,
            metrics,
            admin: None,
        })
    }

    /// Run `admin` alongside the proxy and stop it on shutdown.
    pub fn with_admin(mut self, admin: AdminServer) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start accepting connections.
    pub fn start(self) -> io::Result<ServerHandle> {
        let local_addr = self.listener.local_addr()?;
        // `acquire_many` takes a u32.
        let capacity = self.config.max_connections.clamp(1, u32::MAX as usize);
        let status = ServerStatus::new(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let admin = self.admin.map(|admin| {
            let admin_addr = admin.local_addr();
            let task = admin.serve(status.clone(), shutdown_rx.clone());
            info!(admin_addr = %admin_addr, "Admin endpoint started");
            task
        });

        let accept_loop = AcceptLoop {
            listener: self.listener,
            router: self.router,
            metrics: self.metrics,
            sessions: Arc::clone(&status.sessions),
            poll_interval: self.config.accept_poll_interval,
            shutdown: shutdown_rx,
        };
        let accept_task = tokio::spawn(accept_loop.run());

        info!(bind_addr = %local_addr, "Proxy server listening");

        Ok(ServerHandle {
            local_addr,
            status,
            shutdown_tx,
            accept_task,
            admin,
        })
    }
}

struct AcceptLoop {
    listener: TcpListener,
    router: ConnectionRouter,
    metrics: Arc<dyn MetricsSink>,
    sessions: Arc<Semaphore>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl AcceptLoop {
    /// Shutdown was signalled, or the handle was dropped without calling it.
    fn stopping(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    async fn run(self) {
        loop {
            if self.stopping() {
                break;
            }

            let (stream, peer_addr) =
                match tokio::time::timeout(self.poll_interval, self.listener.accept()).await {
                    // Poll interval elapsed; look at the shutdown signal again.
                    Err(_) => continue,
                    Ok(Ok(accepted)) => accepted,
                    Ok(Err(e)) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                };

            if self.stopping() {
                debug!(peer_addr = %peer_addr, "Connection dropped: shutting down");
                break;
            }

            let permit = match Arc::clone(&self.sessions).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.metrics.record(RelayEvent::ConnectionRejected);
                    warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
            }

            let router = self.router.clone();
            tokio::spawn(
                async move {
                    // Errors are logged and counted by the router.
                    let _ = router.handle(stream).await;
                    drop(permit);
                }
                .instrument(tracing::info_span!("connection", peer = %peer_addr)),
            );
        }

        info!("Accept loop stopped");
        // Dropping the listener closes the socket.
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    status: ServerStatus,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    admin: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        self.status.state()
    }

    pub fn status(&self) -> &ServerStatus {
        &self.status
    }

    /// Stop accepting, stop the admin endpoint and wait for in-flight
    /// sessions for at most `timeout`.
    ///
    /// Sessions still running when the timeout expires are left to finish
    /// on their own.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<(), ShutdownTimeout> {
        let deadline = Instant::now() + timeout;
        self.status.set_state(ServerState::Draining);
        let _ = self.shutdown_tx.send(true);
        info!(
            active_sessions = self.status.active_sessions(),
            timeout = ?timeout,
            "Shutting down proxy server"
        );

        if tokio::time::timeout_at(deadline, &mut self.accept_task)
            .await
            .is_err()
        {
            self.accept_task.abort();
        }

        if let Some(mut admin) = self.admin.take() {
            if tokio::time::timeout_at(deadline, &mut admin).await.is_err() {
                warn!("Admin endpoint did not stop in time");
                admin.abort();
            }
        }

        let capacity = self.status.capacity as u32;
        let drained = tokio::time::timeout_at(
            deadline,
            self.status.sessions.acquire_many(capacity),
        )
        .await;
        self.status.set_state(ServerState::Stopped);

        match drained {
            Ok(_) => {
                info!("Proxy server stopped");
                Ok(())
            }
            Err(_) => {
                let pending = self.status.active_sessions();
                warn!(pending = pending, "Shutdown timed out with sessions still running");
                Err(ShutdownTimeout {
                    waited: timeout,
                    pending,
                })
            }
        }
    }
}
