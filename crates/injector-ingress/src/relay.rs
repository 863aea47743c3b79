use crate::IngressError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

const BUFFER_SIZE: usize = 16384;

/// Running totals across all ingress relays
#[derive(Debug, Default)]
pub struct IngressCounters {
    connections: AtomicU64,
    bytes_to_upstream: AtomicU64,
    bytes_to_proxy: AtomicU64,
}

impl IngressCounters {
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn bytes_to_upstream(&self) -> u64 {
        self.bytes_to_upstream.load(Ordering::Relaxed)
    }

    pub fn bytes_to_proxy(&self) -> u64 {
        self.bytes_to_proxy.load(Ordering::Relaxed)
    }
}

/// Relay one accepted ingress connection to the upstream
///
/// Returns (bytes_to_upstream, bytes_to_proxy).
pub(crate) async fn relay(
    mut client: UnixStream,
    upstream: SocketAddr,
    counters: &IngressCounters,
) -> Result<(u64, u64), IngressError> {
    let mut remote = TcpStream::connect(upstream).await.map_err(|source| {
        IngressError::ConnectionFailed {
            address: upstream.to_string(),
            source,
        }
    })?;
    counters.connections.fetch_add(1, Ordering::Relaxed);

    let (mut client_read, mut client_write) = client.split();
    let (mut remote_read, mut remote_write) = remote.split();

    // A failed leg ends the relay; dropping both streams closes the other side
    let (up, down) = tokio::try_join!(
        pump(&mut client_read, &mut remote_write, &counters.bytes_to_upstream),
        pump(&mut remote_read, &mut client_write, &counters.bytes_to_proxy),
    )?;

    Ok((up, down))
}

/// Copy until EOF, then half-close the writer so the other direction can drain
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    total: &AtomicU64,
) -> Result<u64, IngressError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            debug!(bytes = copied, "Relay leg reached EOF");
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        copied += n as u64;
        total.fetch_add(n as u64, Ordering::Relaxed);
    }

    let _ = writer.shutdown().await;
    Ok(copied)
}
