//! Bidirectional byte relay.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinError;
use tracing::debug;

/// Copy buffer size per direction.
const RELAY_BUFFER: usize = 16 * 1024;

/// Bytes moved in each direction by one relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Relay between `client` and `upstream` until both directions finish.
///
/// Each direction runs in its own task. End of stream on one side is
/// forwarded as a write shutdown on the other and the opposite direction
/// keeps running. An I/O error on either direction stops both. Relays are
/// not time limited.
pub async fn relay<C, U>(client: C, upstream: U) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let to_upstream_bytes = Arc::new(AtomicU64::new(0));
    let to_client_bytes = Arc::new(AtomicU64::new(0));

    let mut to_upstream = tokio::spawn(copy_half(
        client_read,
        upstream_write,
        Arc::clone(&to_upstream_bytes),
    ));
    let mut to_client = tokio::spawn(copy_half(
        upstream_read,
        client_write,
        Arc::clone(&to_client_bytes),
    ));

    tokio::select! {
        result = &mut to_upstream => {
            if failed("client->upstream", result) {
                to_client.abort();
            }
            let _ = to_client.await;
        }
        result = &mut to_client => {
            if failed("upstream->client", result) {
                to_upstream.abort();
            }
            let _ = to_upstream.await;
        }
    }

    RelayStats {
        client_to_upstream: to_upstream_bytes.load(Ordering::Relaxed),
        upstream_to_client: to_client_bytes.load(Ordering::Relaxed),
    }
}

/// Copy until end of stream, then shut down the write side.
async fn copy_half<R, W>(mut reader: R, mut writer: W, copied: Arc<AtomicU64>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    let result: io::Result<()> = async {
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            writer.write_all(&buf[..n]).await?;
            copied.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
    .await;

    // The peer may already be gone; only the copy result counts.
    let _ = writer.shutdown().await;
    result
}

fn failed(direction: &str, result: Result<io::Result<()>, JoinError>) -> bool {
    match result {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            debug!(direction = direction, error = %e, "Relay direction failed");
            true
        }
        Err(e) => {
            debug!(direction = direction, error = %e, "Relay task ended abnormally");
            true
        }
    }
}
