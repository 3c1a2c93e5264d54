//! Bidirectional byte relay with half-close propagation.
//!
//! Each direction copies until end-of-stream or error, then shuts down the
//! write side of its destination so the far peer sees end-of-stream while
//! the opposite direction keeps flowing. `relay` returns once both
//! directions are done.
//!
//! Half-close is `AsyncWriteExt::shutdown`. On `TcpStream` that is a
//! write-side shutdown; a transport whose shutdown is a full close gets a
//! full close instead.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

/// Copy buffer size per direction.
const BUFFER_SIZE: usize = 8192;

/// Transport conditions that end a forwarding direction without being
/// reported as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedTermination {
    /// Connection reset or aborted by the peer.
    PeerReset,
    /// Write to a socket whose peer already went away.
    BrokenPipe,
    /// Use of a socket that is no longer connected.
    ClosedHandle,
    /// End of stream reported as an error.
    EndOfStream,
    /// Connection refused.
    Refused,
    /// Host or network unreachable.
    Unreachable,
}

impl ExpectedTermination {
    /// Classify an IO error, `None` for anything outside the expected set.
    pub fn classify(err: &io::Error) -> Option<Self> {
        match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Some(Self::PeerReset)
            }
            io::ErrorKind::BrokenPipe => Some(Self::BrokenPipe),
            io::ErrorKind::NotConnected => Some(Self::ClosedHandle),
            io::ErrorKind::UnexpectedEof => Some(Self::EndOfStream),
            io::ErrorKind::ConnectionRefused => Some(Self::Refused),
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                Some(Self::Unreachable)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerReset => "peer_reset",
            Self::BrokenPipe => "broken_pipe",
            Self::ClosedHandle => "closed_handle",
            Self::EndOfStream => "end_of_stream",
            Self::Refused => "refused",
            Self::Unreachable => "unreachable",
        }
    }
}

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// How one direction finished.
#[derive(Debug)]
enum DirectionEnd {
    Eof,
    Idle,
    Failed(io::Error),
}

/// Relay bytes between `client` and `backend` until both directions finish.
///
/// With `idle_timeout` set, a direction whose read waits longer than the
/// timeout ends as if the source had closed.
pub async fn relay<C, B>(client: C, backend: B, idle_timeout: Option<Duration>) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    let (client_to_backend, backend_to_client) = tokio::join!(
        copy_half(client_read, backend_write, idle_timeout, "client_to_backend"),
        copy_half(backend_read, client_write, idle_timeout, "backend_to_client"),
    );

    RelayStats {
        client_to_backend,
        backend_to_client,
    }
}

async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    idle_timeout: Option<Duration>,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; BUFFER_SIZE];

    let end = loop {
        let read_result = if let Some(limit) = idle_timeout {
            match tokio::time::timeout(limit, reader.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => break DirectionEnd::Idle,
            }
        } else {
            reader.read(&mut buf).await
        };

        match read_result {
            Ok(0) => break DirectionEnd::Eof,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break DirectionEnd::Failed(e);
                }
                total += n as u64;
            }
            Err(e) => break DirectionEnd::Failed(e),
        }
    };

    match &end {
        DirectionEnd::Eof => debug!(direction, bytes = total, "End of stream"),
        DirectionEnd::Idle => debug!(direction, bytes = total, "Idle timeout reached"),
        DirectionEnd::Failed(e) => match ExpectedTermination::classify(e) {
            Some(kind) => debug!(
                direction,
                bytes = total,
                termination = kind.as_str(),
                "Forwarding ended"
            ),
            None => error!(direction, bytes = total, error = %e, "Unexpected forwarding error"),
        },
    }

    // Propagate the end to the other peer even after an unexpected error,
    // otherwise the opposite direction can wait forever.
    if let Err(e) = writer.shutdown().await {
        debug!(direction, error = %e, "Half-close failed");
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::duplex;

    #[rstest]
    #[case(io::ErrorKind::ConnectionReset, Some(ExpectedTermination::PeerReset))]
    #[case(io::ErrorKind::ConnectionAborted, Some(ExpectedTermination::PeerReset))]
    #[case(io::ErrorKind::BrokenPipe, Some(ExpectedTermination::BrokenPipe))]
    #[case(io::ErrorKind::NotConnected, Some(ExpectedTermination::ClosedHandle))]
    #[case(io::ErrorKind::UnexpectedEof, Some(ExpectedTermination::EndOfStream))]
    #[case(io::ErrorKind::ConnectionRefused, Some(ExpectedTermination::Refused))]
    #[case(io::ErrorKind::HostUnreachable, Some(ExpectedTermination::Unreachable))]
    #[case(io::ErrorKind::NetworkUnreachable, Some(ExpectedTermination::Unreachable))]
    #[case(io::ErrorKind::PermissionDenied, None)]
    #[case(io::ErrorKind::InvalidData, None)]
    #[case(io::ErrorKind::TimedOut, None)]
    fn test_classify(#[case] kind: io::ErrorKind, #[case] expected: Option<ExpectedTermination>) {
        let err = io::Error::new(kind, "test");
        assert_eq!(ExpectedTermination::classify(&err), expected);
    }

    #[tokio::test]
    async fn test_relay_both_directions_with_half_close() {
        let (client, mut client_peer) = duplex(64);
        let (backend, mut backend_peer) = duplex(64);

        let relay_task = tokio::spawn(relay(client, backend, None));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // Client stops sending; backend must observe end-of-stream while
        // still being able to answer.
        client_peer.shutdown().await.unwrap();
        let mut rest = Vec::new();
        backend_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        backend_peer.write_all(b"pong").await.unwrap();
        backend_peer.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client_peer.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");

        let stats = relay_task.await.unwrap();
        assert_eq!(stats.client_to_backend, 4);
        assert_eq!(stats.backend_to_client, 4);
    }

    #[tokio::test]
    async fn test_relay_large_transfer_is_unmodified() {
        let (client, mut client_peer) = duplex(1024);
        let (backend, mut backend_peer) = duplex(1024);

        let relay_task = tokio::spawn(relay(client, backend, None));

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            client_peer.write_all(&sent).await.unwrap();
            client_peer.shutdown().await.unwrap();
            client_peer
        });

        let mut received = Vec::new();
        backend_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);

        drop(backend_peer);
        drop(writer.await.unwrap());

        let stats = relay_task.await.unwrap();
        assert_eq!(stats.client_to_backend, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_relay_ends_when_peers_drop() {
        let (client, client_peer) = duplex(64);
        let (backend, backend_peer) = duplex(64);

        drop(client_peer);
        drop(backend_peer);

        let stats = relay(client, backend, None).await;
        assert_eq!(stats, RelayStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_idle_timeout() {
        let (client, _client_peer) = duplex(64);
        let (backend, _backend_peer) = duplex(64);

        let stats = relay(client, backend, Some(Duration::from_secs(30))).await;
        assert_eq!(stats, RelayStats::default());
    }
}
