//! Backend dialing and bounded writes.
//!
//! Every backend failure before forwarding starts (resolution, connect,
//! connect timeout, header write, handshake replay) surfaces as
//! `BackendUnreachable` so the connection can be dropped with one log line.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Deadline for each write sent to the backend before forwarding starts.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// An established backend connection that has not started forwarding yet.
#[derive(Debug)]
pub struct BackendConnection {
    stream: TcpStream,
    address: String,
    peer_addr: SocketAddr,
}

impl BackendConnection {
    /// Dial `address` (`host:port`), bounded by `connect_timeout`.
    ///
    /// Name resolution counts against the same timeout.
    pub async fn connect(address: &str, connect_timeout: Duration) -> Result<Self> {
        debug!(backend_addr = %address, "Connecting to backend");

        let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(GatewayError::backend(address, e)),
            Err(_) => {
                return Err(GatewayError::backend(
                    address,
                    io::Error::new(io::ErrorKind::TimedOut, "connect timeout"),
                ))
            }
        };

        let peer_addr = stream
            .peer_addr()
            .map_err(|e| GatewayError::backend(address, e))?;

        Ok(Self {
            stream,
            address: address.to_string(),
            peer_addr,
        })
    }

    /// The configured address this connection was dialed with.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The resolved remote address of the backend socket.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Write `bytes` in full within [`WRITE_DEADLINE`].
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.send_within(bytes, WRITE_DEADLINE).await
    }

    async fn send_within(&mut self, bytes: &[u8], deadline: Duration) -> Result<()> {
        match timeout(deadline, self.stream.write_all(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(GatewayError::backend(&self.address, e)),
            Err(_) => Err(GatewayError::backend(
                &self.address,
                io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded"),
            )),
        }
    }

    /// Hand the stream over for forwarding. No deadline applies after this.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_and_send() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut backend = BackendConnection::connect(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(backend.peer_addr(), addr);
        assert_eq!(backend.address(), addr.to_string());

        backend.send(b"hello").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_connect_refused_is_backend_unreachable() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = BackendConnection::connect(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "backend_unreachable");
    }

    #[tokio::test]
    async fn test_unresolvable_address_is_backend_unreachable() {
        let err = BackendConnection::connect("not a host:port", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BackendUnreachable { .. }));
    }
}
