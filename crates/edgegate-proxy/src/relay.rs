//! Bidirectional byte relay for upgraded sessions

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Relay bytes between a client and a backend until the session ends
///
/// One task per direction. The session ends when the backend stops sending,
/// when either direction fails, or when `cancel` fires; both tasks stop then.
/// A client that finishes sending only half-closes the backend, so output
/// still in flight reaches it.
pub async fn relay<C, B>(client: C, backend: B, cancel: CancellationToken) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let session = cancel.child_token();
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    let upstream = tokio::spawn(pump(client_read, backend_write, session.clone(), false));
    let downstream = tokio::spawn(pump(backend_read, client_write, session.clone(), true));

    let client_to_backend = upstream.await.unwrap_or(0);
    let backend_to_client = downstream.await.unwrap_or(0);

    let stats = RelayStats {
        client_to_backend,
        backend_to_client,
    };
    debug!(
        bytes_up = stats.client_to_backend,
        bytes_down = stats.backend_to_client,
        cancelled = cancel.is_cancelled(),
        "Relay finished"
    );
    stats
}

/// Copy one direction; `ends_session` stops the other direction on EOF too
async fn pump<R, W>(mut reader: R, mut writer: W, session: CancellationToken, ends_session: bool) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = session.cancelled() => return total,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Relay read ended: {}", e);
                    session.cancel();
                    return total;
                }
            },
        };

        let written = tokio::select! {
            _ = session.cancelled() => return total,
            written = writer.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            debug!("Relay write ended: {}", e);
            session.cancel();
            return total;
        }
        total += n as u64;
    }

    let _ = writer.shutdown().await;
    if ends_session {
        session.cancel();
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relays_both_directions() {
        let (client, mut client_peer) = duplex(1024);
        let (backend, mut backend_peer) = duplex(1024);
        let task = tokio::spawn(relay(client, backend, CancellationToken::new()));

        client_peer.write_all(b"ls -la\n").await.unwrap();
        let mut buf = [0u8; 7];
        backend_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls -la\n");

        backend_peer.write_all(b"total 0\n").await.unwrap();
        let mut buf = [0u8; 8];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"total 0\n");

        drop(backend_peer);
        let stats = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.client_to_backend, 7);
        assert_eq!(stats.backend_to_client, 8);
    }

    #[tokio::test]
    async fn test_client_half_close_keeps_output_flowing() {
        let (client, mut client_peer) = duplex(1024);
        let (backend, mut backend_peer) = duplex(1024);
        let task = tokio::spawn(relay(client, backend, CancellationToken::new()));

        client_peer.write_all(b"input").await.unwrap();
        client_peer.shutdown().await.unwrap();

        let mut received = Vec::new();
        backend_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"input");

        backend_peer.write_all(b"output").await.unwrap();
        let mut buf = [0u8; 6];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"output");

        drop(backend_peer);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_session() {
        let (client, _client_peer) = duplex(1024);
        let (backend, _backend_peer) = duplex(1024);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(relay(client, backend, cancel.clone()));

        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats, RelayStats::default());
    }

    #[tokio::test]
    async fn test_backend_close_ends_session_with_idle_client() {
        let (client, _client_peer) = duplex(1024);
        let (backend, backend_peer) = duplex(1024);
        let task = tokio::spawn(relay(client, backend, CancellationToken::new()));

        drop(backend_peer);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
