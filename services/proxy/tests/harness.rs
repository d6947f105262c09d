//! Test harness for portmux integration tests.
//!
//! Provides local upstreams (echo, HTTP, TLS with the managed
//! certificate), a minimal SOCKS5 relay and helpers to spawn the proxy.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use portmux_proxy::admin::AdminServer;
use portmux_proxy::{
    CertificateManager, ConnectionRouter, ListenerConfig, MetricsSink, ProxyMetrics, ProxyServer,
    RouterConfig, ServerHandle, UpstreamDialer,
};

static INIT_CRYPTO: Once = Once::new();

pub fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// Run an accept loop until the returned sender fires or is dropped.
fn spawn_accept_loop<F, Fut>(listener: TcpListener, mut on_accept: F) -> oneshot::Sender<()>
where
    F: FnMut(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            tokio::spawn(on_accept(stream));
                        }
                        Err(_) => break,
                    }
                }
                _ = &mut shutdown_rx => break,
            }
        }
    });
    shutdown_tx
}

pub struct TcpEchoUpstream {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    _shutdown_tx: oneshot::Sender<()>,
}

impl TcpEchoUpstream {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);
        let shutdown_tx = spawn_accept_loop(listener, move |mut stream| {
            conn_clone.fetch_add(1, Ordering::Relaxed);
            let bytes = Arc::clone(&bytes_clone);
            async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            bytes.fetch_add(n as u64, Ordering::Relaxed);
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            _shutdown_tx: shutdown_tx,
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

/// Answers every request with a fixed body and records the request bytes.
pub struct HttpUpstream {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<Vec<u8>>>>,
    _shutdown_tx: oneshot::Sender<()>,
}

impl HttpUpstream {
    pub async fn spawn(body: &'static str) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));

        let requests_clone = Arc::clone(&requests);
        let shutdown_tx = spawn_accept_loop(listener, move |mut stream| {
            let requests = Arc::clone(&requests_clone);
            async move {
                let mut received = Vec::new();
                let mut buf = [0u8; 1024];
                while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => received.extend_from_slice(&buf[..n]),
                    }
                }
                requests.lock().unwrap().push(received);

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        Ok(Self {
            addr,
            requests,
            _shutdown_tx: shutdown_tx,
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<Vec<u8>> {
        self.requests.lock().unwrap().last().cloned()
    }
}

/// TLS server presenting the manager's certificate; replies `marker` to
/// the first read.
pub struct ManagedTlsUpstream {
    pub addr: SocketAddr,
    _shutdown_tx: oneshot::Sender<()>,
}

impl ManagedTlsUpstream {
    pub async fn spawn(manager: &Arc<CertificateManager>, marker: &'static str) -> io::Result<Self> {
        init_crypto_provider();

        let config = manager.server_config().map_err(io::Error::other)?;
        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let shutdown_tx = spawn_accept_loop(listener, move |stream| {
            let acceptor = acceptor.clone();
            async move {
                if let Ok(mut tls_stream) = acceptor.accept(stream).await {
                    let mut buf = vec![0u8; 1024];
                    if tls_stream.read(&mut buf).await.is_ok() {
                        let _ = tls_stream.write_all(marker.as_bytes()).await;
                        let _ = tls_stream.shutdown().await;
                    }
                }
            }
        });

        Ok(Self {
            addr,
            _shutdown_tx: shutdown_tx,
        })
    }
}

/// Minimal SOCKS5 relay (CONNECT only), optionally requiring
/// username/password authentication.
pub struct Socks5Relay {
    pub addr: SocketAddr,
    /// `host:port` of every CONNECT request, as sent by the client.
    pub targets: Arc<Mutex<Vec<String>>>,
    _shutdown_tx: oneshot::Sender<()>,
}

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_PASSWORD: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;

impl Socks5Relay {
    pub async fn spawn(credentials: Option<(&'static str, &'static str)>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let targets = Arc::new(Mutex::new(Vec::new()));

        let targets_clone = Arc::clone(&targets);
        let shutdown_tx = spawn_accept_loop(listener, move |stream| {
            let targets = Arc::clone(&targets_clone);
            async move {
                let _ = serve_socks5(stream, credentials, targets).await;
            }
        });

        Ok(Self {
            addr,
            targets,
            _shutdown_tx: shutdown_tx,
        })
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }
}

async fn serve_socks5(
    mut client: TcpStream,
    credentials: Option<(&'static str, &'static str)>,
    targets: Arc<Mutex<Vec<String>>>,
) -> io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;

    match credentials {
        Some((username, password)) => {
            if !methods.contains(&METHOD_PASSWORD) {
                client.write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE]).await?;
                return Ok(());
            }
            client.write_all(&[SOCKS_VERSION, METHOD_PASSWORD]).await?;

            let mut header = [0u8; 2];
            client.read_exact(&mut header).await?;
            let mut user = vec![0u8; header[1] as usize];
            client.read_exact(&mut user).await?;
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut pass = vec![0u8; len[0] as usize];
            client.read_exact(&mut pass).await?;

            if user != username.as_bytes() || pass != password.as_bytes() {
                client.write_all(&[0x01, 0x01]).await?;
                return Ok(());
            }
            client.write_all(&[0x01, 0x00]).await?;
        }
        None => {
            if !methods.contains(&METHOD_NONE) {
                client.write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE]).await?;
                return Ok(());
            }
            client.write_all(&[SOCKS_VERSION, METHOD_NONE]).await?;
        }
    }

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            format!("[{}]", std::net::Ipv6Addr::from(ip))
        }
        _ => return Ok(()),
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    let target = format!("{host}:{}", u16::from_be_bytes(port));
    targets.lock().unwrap().push(target.clone());

    let mut upstream = match TcpStream::connect(&target).await {
        Ok(upstream) => upstream,
        Err(_) => {
            // Connection refused.
            client
                .write_all(&[SOCKS_VERSION, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            return Ok(());
        }
    };
    client
        .write_all(&[SOCKS_VERSION, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;

    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// A running proxy bound to an ephemeral loopback port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub metrics: Arc<ProxyMetrics>,
    pub admin_addr: Option<SocketAddr>,
    pub handle: ServerHandle,
}

impl TestProxy {
    pub async fn spawn(router_config: RouterConfig, dialer: UpstreamDialer) -> io::Result<Self> {
        Self::spawn_inner(router_config, dialer, None, false).await
    }

    pub async fn spawn_with_admin(
        router_config: RouterConfig,
        certificates: Option<Arc<CertificateManager>>,
    ) -> io::Result<Self> {
        Self::spawn_inner(router_config, UpstreamDialer::direct(), certificates, true).await
    }

    async fn spawn_inner(
        router_config: RouterConfig,
        dialer: UpstreamDialer,
        certificates: Option<Arc<CertificateManager>>,
        admin: bool,
    ) -> io::Result<Self> {
        let metrics = Arc::new(ProxyMetrics::new());
        let sink: Arc<dyn MetricsSink> = metrics.clone();
        let router = ConnectionRouter::new(router_config, dialer, Arc::clone(&sink));

        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        config.accept_poll_interval = Duration::from_millis(50);

        let mut server = ProxyServer::bind(config, router, sink).await?;
        let mut admin_addr = None;
        if admin {
            let admin_server = AdminServer::bind(
                "127.0.0.1:0".parse().unwrap(),
                Arc::clone(&metrics),
                certificates,
            )
            .await?;
            admin_addr = Some(admin_server.local_addr());
            server = server.with_admin(admin_server);
        }

        let handle = server.start()?;
        Ok(Self {
            addr: handle.local_addr(),
            metrics,
            admin_addr,
            handle,
        })
    }

    pub async fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect(self.addr).await
    }
}

/// Router settings with fixed upstreams pointed at local servers.
pub fn router_config(https: Option<SocketAddr>, jabber: Option<SocketAddr>) -> RouterConfig {
    let mut config = RouterConfig {
        detect_timeout: Duration::from_secs(5),
        dial_timeout: Duration::from_secs(5),
        ..RouterConfig::default()
    };
    if let Some(addr) = https {
        config.https_upstream = addr.to_string();
    }
    if let Some(addr) = jabber {
        config.jabber_upstream = addr.to_string();
    }
    config
}

/// A loopback address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// DER of the first certificate in a PEM chain.
pub fn first_cert_der(cert_pem: &str) -> Vec<u8> {
    let mut reader = io::BufReader::new(cert_pem.as_bytes());
    let der = rustls_pemfile::certs(&mut reader)
        .next()
        .expect("PEM contains a certificate")
        .expect("certificate PEM parses")
        .to_vec();
    der
}

/// TLS handshake over an already connected stream, trusting `cert_der`.
pub async fn tls_handshake(
    stream: TcpStream,
    server_name: &str,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    init_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(CertificateDer::from(cert_der.to_vec()))
        .map_err(io::Error::other)?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    connector.connect(server_name, stream).await
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
