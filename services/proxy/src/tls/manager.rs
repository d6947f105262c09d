//! Certificate lifecycle: initialize, serve, rotate.
//!
//! The active certificates live in an immutable snapshot behind an
//! `ArcSwap`. TLS lookups load the snapshot without locking; rotation
//! builds a new snapshot and publishes it with one pointer swap, so a
//! reader sees either the old entry or the new one, never a mix. Rotations
//! are serialized by an async mutex. Lookups never touch it.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration as StdDuration;

use arc_swap::ArcSwap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::cache::CertificateCache;
use super::entry::{CertificateEntry, CertificateInfo};
use super::generate::{generate_self_signed, GenerationParams};
use crate::error::CertificateError;

/// Cache key of the single certificate a server instance serves.
pub const DEFAULT_IDENTITY: &str = "default";

/// Certificates this close to expiry are replaced.
pub const EXPIRY_THRESHOLD: Duration = Duration::days(30);

/// Default interval between expiry checks.
pub const DEFAULT_ROTATION_INTERVAL: StdDuration = StdDuration::from_secs(24 * 60 * 60);

/// Where certificates come from.
#[derive(Debug, Clone)]
pub enum CertificateSource {
    /// Self-signed, cached under `cache_dir`.
    Generate {
        params: GenerationParams,
        cache_dir: PathBuf,
    },
    /// Operator-provided PEM files. Never rotated.
    Files { cert_path: PathBuf, key_path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct CertificateConfig {
    pub source: CertificateSource,
    pub identity: String,
    /// Expiry check interval. `None` disables background rotation.
    pub rotation_interval: Option<StdDuration>,
}

impl CertificateConfig {
    pub fn generate(params: GenerationParams, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: CertificateSource::Generate {
                params,
                cache_dir: cache_dir.into(),
            },
            identity: DEFAULT_IDENTITY.to_string(),
            rotation_interval: Some(DEFAULT_ROTATION_INTERVAL),
        }
    }

    pub fn files(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            source: CertificateSource::Files {
                cert_path: cert_path.into(),
                key_path: key_path.into(),
            },
            identity: DEFAULT_IDENTITY.to_string(),
            rotation_interval: None,
        }
    }

    pub fn with_rotation_interval(mut self, interval: Option<StdDuration>) -> Self {
        self.rotation_interval = interval;
        self
    }
}

/// Observable manager state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Active,
    Rotating,
    Closed,
}

impl ManagerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ManagerState::Active,
            1 => ManagerState::Rotating,
            _ => ManagerState::Closed,
        }
    }
}

type Snapshot = HashMap<String, Arc<CertificateEntry>>;

/// Owner of the server certificate.
pub struct CertificateManager {
    identity: String,
    source: CertificateSource,
    entries: ArcSwap<Snapshot>,
    rotation_lock: tokio::sync::Mutex<()>,
    state: AtomicU8,
    stop_tx: watch::Sender<bool>,
    rotation_task: Mutex<Option<JoinHandle<()>>>,
}

impl CertificateManager {
    /// Load or generate the initial certificate and start background
    /// rotation when configured.
    ///
    /// Fails if no certificate can be made active.
    pub async fn new(config: CertificateConfig) -> Result<Arc<Self>, CertificateError> {
        let entry = match &config.source {
            CertificateSource::Files {
                cert_path,
                key_path,
            } => {
                info!(cert_file = %cert_path.display(), "Loading custom certificate");
                Arc::new(load_files(&config.identity, cert_path.clone(), key_path.clone()).await?)
            }
            CertificateSource::Generate { params, cache_dir } => {
                initial_generated(&config.identity, params, cache_dir).await?
            }
        };

        info!(
            identity = %config.identity,
            serial = %entry.serial,
            not_after = %entry.not_after,
            "Certificate active"
        );

        let mut snapshot = Snapshot::new();
        snapshot.insert(config.identity.clone(), entry);
        let (stop_tx, _) = watch::channel(false);

        let manager = Arc::new(Self {
            identity: config.identity,
            source: config.source,
            entries: ArcSwap::from_pointee(snapshot),
            rotation_lock: tokio::sync::Mutex::new(()),
            state: AtomicU8::new(ManagerState::Active as u8),
            stop_tx,
            rotation_task: Mutex::new(None),
        });

        if let (Some(interval), CertificateSource::Generate { .. }) =
            (config.rotation_interval, &manager.source)
        {
            let handle = spawn_rotation_loop(&manager, interval);
            if let Ok(mut slot) = manager.rotation_task.lock() {
                *slot = Some(handle);
            }
        }

        Ok(manager)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The entry currently served for this manager's identity.
    pub fn active(&self) -> Option<Arc<CertificateEntry>> {
        self.entries.load().get(&self.identity).cloned()
    }

    pub fn certificate_info(&self) -> Option<CertificateInfo> {
        self.active().map(|entry| entry.info())
    }

    pub fn not_after(&self) -> Option<OffsetDateTime> {
        self.active().map(|entry| entry.not_after)
    }

    /// TLS 1.2+ server configuration that resolves certificates through
    /// this manager on every handshake.
    pub fn server_config(self: &Arc<Self>) -> Result<rustls::ServerConfig, rustls::Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let resolver: Arc<dyn ResolvesServerCert> = Arc::clone(self) as Arc<dyn ResolvesServerCert>;

        Ok(rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(resolver))
    }

    /// Replace the active certificate with a freshly generated one.
    ///
    /// The new entry is persisted before it is published. A failed write
    /// is logged and the new entry is published anyway.
    pub async fn rotate(&self) -> Result<Arc<CertificateEntry>, CertificateError> {
        let (params, cache_dir) = match &self.source {
            CertificateSource::Generate { params, cache_dir } => (params.clone(), cache_dir.clone()),
            CertificateSource::Files { .. } => return Err(CertificateError::RotationUnavailable),
        };

        let _guard = self.rotation_lock.lock().await;
        // Only an active manager may start rotating; a concurrent shutdown wins.
        if self
            .state
            .compare_exchange(
                ManagerState::Active as u8,
                ManagerState::Rotating as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(CertificateError::ManagerClosed);
        }

        info!(identity = %self.identity, "Rotating certificate");
        let result = generate_blocking(&self.identity, params).await;

        let entry = match result {
            Ok(entry) => Arc::new(entry),
            Err(e) => {
                self.finish_rotation();
                return Err(e);
            }
        };

        // Shutdown may have started while generating.
        if self.state() == ManagerState::Closed {
            return Err(CertificateError::ManagerClosed);
        }

        let cache = CertificateCache::new(cache_dir);
        if let Err(e) = persist_blocking(cache, Arc::clone(&entry)).await {
            warn!(error = %e, "Failed to cache rotated certificate");
        }

        if self.state() == ManagerState::Closed {
            return Err(CertificateError::ManagerClosed);
        }

        let mut next = Snapshot::clone(&self.entries.load());
        next.insert(self.identity.clone(), Arc::clone(&entry));
        self.entries.store(Arc::new(next));
        self.finish_rotation();

        info!(
            identity = %self.identity,
            serial = %entry.serial,
            not_after = %entry.not_after,
            "Certificate rotation complete"
        );

        Ok(entry)
    }

    fn finish_rotation(&self) {
        let _ = self.state.compare_exchange(
            ManagerState::Rotating as u8,
            ManagerState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Rotate if the active certificate expires within [`EXPIRY_THRESHOLD`].
    ///
    /// Returns whether a rotation happened.
    pub async fn rotate_if_expiring(&self) -> Result<bool, CertificateError> {
        let expiring = self
            .active()
            .is_none_or(|entry| entry.expires_within(EXPIRY_THRESHOLD, OffsetDateTime::now_utc()));
        if !expiring {
            return Ok(false);
        }

        info!(identity = %self.identity, "Certificate expiring soon");
        self.rotate().await.map(|_| true)
    }

    /// Stop background rotation. Lookups keep serving the active entry.
    ///
    /// Waits for a rotation already in progress; it will not publish.
    pub async fn shutdown(&self) {
        self.state.store(ManagerState::Closed as u8, Ordering::Release);
        let _ = self.stop_tx.send(true);

        let handle = match self.rotation_task.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // Drain any rotation started outside the loop.
        drop(self.rotation_lock.lock().await);
        info!(identity = %self.identity, "Certificate manager stopped");
    }
}

impl ResolvesServerCert for CertificateManager {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.active().map(|entry| entry.certified_key())
    }
}

impl fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateManager")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}

/// Check expiry every `interval` until stopped or the manager is dropped.
fn spawn_rotation_loop(manager: &Arc<CertificateManager>, interval: StdDuration) -> JoinHandle<()> {
    let weak: Weak<CertificateManager> = Arc::downgrade(manager);
    let mut stop_rx = manager.stop_tx.subscribe();

    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(manager) = weak.upgrade() else { break };
                    match manager.rotate_if_expiring().await {
                        Ok(_) => {}
                        Err(CertificateError::ManagerClosed) => break,
                        Err(e) => error!(error = %e, "Certificate rotation failed"),
                    }
                }
                _ = stop_rx.changed() => break,
            }
        }
    })
}

async fn initial_generated(
    identity: &str,
    params: &GenerationParams,
    cache_dir: &std::path::Path,
) -> Result<Arc<CertificateEntry>, CertificateError> {
    let cache = CertificateCache::new(cache_dir);

    match cache.load(identity) {
        Ok(Some(entry)) if !entry.expires_within(EXPIRY_THRESHOLD, OffsetDateTime::now_utc()) => {
            return Ok(Arc::new(entry));
        }
        Ok(Some(entry)) => {
            info!(not_after = %entry.not_after, "Cached certificate expiring soon, regenerating");
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Ignoring unreadable cached certificate"),
    }

    info!(identity = %identity, "Generating new self-signed certificate");
    let entry = Arc::new(generate_blocking(identity, params.clone()).await?);

    if let Err(e) = persist_blocking(cache, Arc::clone(&entry)).await {
        warn!(error = %e, "Failed to cache certificate");
    }

    Ok(entry)
}

async fn generate_blocking(
    identity: &str,
    params: GenerationParams,
) -> Result<CertificateEntry, CertificateError> {
    let identity = identity.to_string();
    tokio::task::spawn_blocking(move || generate_self_signed(&identity, &params))
        .await
        .map_err(|e| CertificateError::GenerationFailed(format!("generation task failed: {e}")))?
}

async fn persist_blocking(
    cache: CertificateCache,
    entry: Arc<CertificateEntry>,
) -> Result<(), CertificateError> {
    let dir = cache.dir().to_path_buf();
    tokio::task::spawn_blocking(move || cache.store(&entry))
        .await
        .map_err(|e| CertificateError::PersistFailed {
            path: dir,
            reason: format!("persist task failed: {e}"),
        })?
}

async fn load_files(
    identity: &str,
    cert_path: PathBuf,
    key_path: PathBuf,
) -> Result<CertificateEntry, CertificateError> {
    let identity = identity.to_string();
    tokio::task::spawn_blocking(move || {
        let read = |path: &PathBuf| {
            std::fs::read_to_string(path).map_err(|e| CertificateError::LoadFailed {
                path: path.clone(),
                reason: e.to_string(),
            })
        };
        let cert_pem = read(&cert_path)?;
        let key_pem = read(&key_path)?;
        CertificateEntry::from_pem(&identity, cert_pem, key_pem, &cert_path)
    })
    .await
    .map_err(|e| CertificateError::GenerationFailed(format!("load task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    use crate::tls::entry::serial_hex;

    fn generate_config(dir: &std::path::Path) -> CertificateConfig {
        CertificateConfig::generate(GenerationParams::default(), dir).with_rotation_interval(None)
    }

    #[tokio::test]
    async fn test_generates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(generate_config(dir.path())).await.unwrap();

        assert_eq!(manager.state(), ManagerState::Active);
        let active = manager.active().unwrap();
        assert_eq!(active.identity, DEFAULT_IDENTITY);
        assert!(dir.path().join("default.crt").exists());
        assert!(dir.path().join("default.key").exists());
    }

    #[tokio::test]
    async fn test_reuses_cached_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let first = CertificateManager::new(generate_config(dir.path())).await.unwrap();
        let second = CertificateManager::new(generate_config(dir.path())).await.unwrap();

        assert_eq!(
            first.active().unwrap().serial,
            second.active().unwrap().serial
        );
    }

    #[tokio::test]
    async fn test_regenerates_expiring_cache() {
        let dir = tempfile::tempdir().unwrap();
        let short = GenerationParams {
            validity_days: 10,
            ..GenerationParams::default()
        };
        let stale = generate_self_signed(DEFAULT_IDENTITY, &short).unwrap();
        CertificateCache::new(dir.path()).store(&stale).unwrap();

        let manager = CertificateManager::new(generate_config(dir.path())).await.unwrap();
        let active = manager.active().unwrap();
        assert_ne!(active.serial, stale.serial);
        assert!(!active.expires_within(EXPIRY_THRESHOLD, OffsetDateTime::now_utc()));
    }

    #[tokio::test]
    async fn test_rotations_have_distinct_serials() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(generate_config(dir.path())).await.unwrap();
        let initial = manager.active().unwrap().serial.clone();

        let first = manager.rotate().await.unwrap();
        let second = manager.rotate().await.unwrap();

        assert_ne!(first.serial, initial);
        assert_ne!(first.serial, second.serial);
        assert_eq!(manager.active().unwrap().serial, second.serial);
        assert_eq!(manager.state(), ManagerState::Active);

        let cached = CertificateCache::new(dir.path())
            .load(DEFAULT_IDENTITY)
            .unwrap()
            .unwrap();
        assert_eq!(cached.serial, second.serial);
    }

    /// Accepts any server certificate so handshakes can observe whichever
    /// entry the resolver served.
    #[derive(Debug)]
    struct AcceptAnyCert(Arc<rustls::crypto::CryptoProvider>);

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    fn any_cert_connector() -> TlsConnector {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .unwrap()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    /// Serial of the certificate presented in one in-memory handshake.
    async fn handshake_serial(acceptor: &TlsAcceptor, connector: &TlsConnector) -> String {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let acceptor = acceptor.clone();
        let server = tokio::spawn(async move { acceptor.accept(server).await.map(drop) });

        let name = ServerName::try_from("localhost").unwrap();
        let tls = connector.connect(name, client).await.unwrap();
        server.await.unwrap().unwrap();

        let (_, conn) = tls.get_ref();
        let leaf = conn.peer_certificates().unwrap()[0].clone();
        let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref()).unwrap();
        serial_hex(parsed.raw_serial())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_handshakes_during_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(generate_config(dir.path())).await.unwrap();
        let initial = manager.active().unwrap().serial.clone();
        let acceptor = TlsAcceptor::from(Arc::new(manager.server_config().unwrap()));
        let connector = any_cert_connector();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut clients = Vec::new();
        for _ in 0..4 {
            let acceptor = acceptor.clone();
            let connector = connector.clone();
            let stop = Arc::clone(&stop);
            clients.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while !stop.load(Ordering::Relaxed) {
                    seen.push(handshake_serial(&acceptor, &connector).await);
                }
                seen
            }));
        }

        let first = manager.rotate().await.unwrap();
        let second = manager.rotate().await.unwrap();
        stop.store(true, Ordering::Relaxed);

        let published = [initial, first.serial.clone(), second.serial.clone()];
        for client in clients {
            let seen = client.await.unwrap();
            assert!(!seen.is_empty());
            // Every handshake was served a complete, published entry.
            for serial in seen {
                assert!(published.contains(&serial), "unexpected serial {serial}");
            }
        }

        // New handshakes get the latest certificate.
        assert_eq!(handshake_serial(&acceptor, &connector).await, second.serial);
    }

    #[tokio::test]
    async fn test_shutdown_wins_over_pending_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(generate_config(dir.path())).await.unwrap();
        let serial = manager.active().unwrap().serial.clone();

        // Park a rotation behind the lock, then start shutting down.
        let guard = manager.rotation_lock.lock().await;
        let rotation = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.rotate().await }
        });
        tokio::task::yield_now().await;
        let shutdown = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.shutdown().await }
        });
        while manager.state() != ManagerState::Closed {
            tokio::task::yield_now().await;
        }
        drop(guard);

        assert!(matches!(
            rotation.await.unwrap(),
            Err(CertificateError::ManagerClosed)
        ));
        shutdown.await.unwrap();

        assert_eq!(manager.state(), ManagerState::Closed);
        assert_eq!(manager.active().unwrap().serial, serial);
        let cached = CertificateCache::new(dir.path())
            .load(DEFAULT_IDENTITY)
            .unwrap()
            .unwrap();
        assert_eq!(cached.serial, serial);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_rotations_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(generate_config(dir.path())).await.unwrap();

        let (a, b) = tokio::join!(manager.rotate(), manager.rotate());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.serial, b.serial);
        assert_eq!(manager.state(), ManagerState::Active);
        let active = manager.active().unwrap().serial.clone();
        assert!(active == a.serial || active == b.serial);
    }

    #[tokio::test]
    async fn test_persist_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("certs");
        let manager = CertificateManager::new(generate_config(&cache_dir)).await.unwrap();
        let before = manager.active().unwrap().serial.clone();

        // Replace the cache directory with a plain file.
        std::fs::remove_dir_all(&cache_dir).unwrap();
        std::fs::write(&cache_dir, b"not a directory").unwrap();

        let rotated = manager.rotate().await.unwrap();
        assert_ne!(rotated.serial, before);
        assert_eq!(manager.active().unwrap().serial, rotated.serial);
    }

    #[tokio::test]
    async fn test_custom_files() {
        let dir = tempfile::tempdir().unwrap();
        let entry = generate_self_signed("custom", &GenerationParams::default()).unwrap();
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");
        std::fs::write(&cert_path, &entry.cert_pem).unwrap();
        std::fs::write(&key_path, &entry.key_pem).unwrap();

        let manager = CertificateManager::new(CertificateConfig::files(&cert_path, &key_path))
            .await
            .unwrap();
        assert_eq!(manager.active().unwrap().serial, entry.serial);
        assert!(matches!(
            manager.rotate().await,
            Err(CertificateError::RotationUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_missing_custom_files_fail_construction() {
        let dir = tempfile::tempdir().unwrap();
        let result = CertificateManager::new(CertificateConfig::files(
            dir.path().join("missing.crt"),
            dir.path().join("missing.key"),
        ))
        .await;

        assert!(matches!(result, Err(CertificateError::LoadFailed { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_stops_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(
            CertificateConfig::generate(GenerationParams::default(), dir.path())
                .with_rotation_interval(Some(StdDuration::from_secs(3600))),
        )
        .await
        .unwrap();
        let serial = manager.active().unwrap().serial.clone();

        manager.shutdown().await;

        assert_eq!(manager.state(), ManagerState::Closed);
        assert!(matches!(
            manager.rotate().await,
            Err(CertificateError::ManagerClosed)
        ));
        assert_eq!(manager.active().unwrap().serial, serial);
    }

    #[tokio::test]
    async fn test_background_rotation_replaces_expiring_certificate() {
        let dir = tempfile::tempdir().unwrap();
        // Every generated certificate is inside the expiry window.
        let params = GenerationParams {
            validity_days: 10,
            ..GenerationParams::default()
        };
        let manager = CertificateManager::new(
            CertificateConfig::generate(params, dir.path())
                .with_rotation_interval(Some(StdDuration::from_millis(100))),
        )
        .await
        .unwrap();
        let initial = manager.active().unwrap().serial.clone();

        let deadline = Instant::now() + StdDuration::from_secs(30);
        while manager.active().unwrap().serial == initial {
            assert!(Instant::now() < deadline, "rotation loop never rotated");
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_config_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(generate_config(dir.path())).await.unwrap();

        assert!(manager.server_config().is_ok());

        let info = manager.certificate_info().unwrap();
        assert_eq!(info.subject, "Portmux Proxy Server");
        assert_eq!(info.dns_names, vec!["localhost".to_string()]);
        assert_eq!(Some(info.not_after), manager.not_after());
    }
}
