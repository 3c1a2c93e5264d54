//! TCP listener and accept loop.
//!
//! Every accepted socket is dispatched to its own task; access gating
//! happens inside that task, not before dispatch. Stopping the listener
//! ends the accept loop and closes the listening socket; in-flight
//! connections drain on their own.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{error, info, warn, Instrument};

use super::connection;
use super::router::SharedConfigStore;

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections closed at accept because the ceiling was reached.
    pub connections_rejected: AtomicU64,
    /// Connections closed by an access list.
    pub connections_denied: AtomicU64,
    /// Malformed PROXY headers or handshakes.
    pub decode_failures: AtomicU64,
    /// Backend dial or pre-forwarding write failures.
    pub backend_failures: AtomicU64,
    /// Connections that reached the forwarding stage.
    pub backend_connected: AtomicU64,
    /// Bytes relayed from clients to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed from backends to clients.
    pub bytes_from_backend: AtomicU64,
}

/// The gateway's TCP listener.
pub struct Listener {
    /// The TCP listener, taken by `run` and dropped when it returns.
    listener: Mutex<Option<TcpListener>>,
    /// Address the listener was bound to.
    local_addr: SocketAddr,
    /// Live routing configuration.
    store: SharedConfigStore,
    /// Connection ceiling, `None` when unbounded.
    conn_semaphore: Option<Arc<Semaphore>>,
    /// Flips to `true` when the gateway is stopped.
    shutdown: watch::Receiver<bool>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind `bind_addr` and prepare the accept loop.
    pub(crate) async fn bind(
        bind_addr: &str,
        max_connections: Option<usize>,
        store: SharedConfigStore,
        shutdown: watch::Receiver<bool>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = ?max_connections,
            "Listener bound"
        );

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            store,
            conn_semaphore: max_connections.map(|limit| Arc::new(Semaphore::new(limit))),
            shutdown,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept connections until the gateway is stopped.
    ///
    /// Returns `Ok(())` on stop, after the listening socket is closed.
    /// Accept errors are logged and retried. A listener runs once; a second
    /// call fails.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.local_addr;
        let listener = self.listener.lock().await.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "listener already ran")
        })?;
        let mut shutdown = self.shutdown.clone();
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender also means nobody can restart us.
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let permit = match &self.conn_semaphore {
                            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                                Ok(permit) => Some(permit),
                                Err(_) => {
                                    self.stats
                                        .connections_rejected
                                        .fetch_add(1, Ordering::Relaxed);
                                    warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                                    continue;
                                }
                            },
                            None => None,
                        };

                        self.stats
                            .connections_accepted
                            .fetch_add(1, Ordering::Relaxed);
                        self.stats
                            .connections_active
                            .fetch_add(1, Ordering::Relaxed);

                        let store = Arc::clone(&self.store);
                        let stats = Arc::clone(&self.stats);

                        tokio::spawn(
                            async move {
                                connection::serve(stream, peer_addr, &store, &stats).await;

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                                drop(permit);
                            }
                            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        drop(listener);
        info!(bind_addr = %local_addr, "Listener stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use crate::proxy::router::ConfigStore;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn store() -> SharedConfigStore {
        Arc::new(ConfigStore::new(RoutingConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn test_listener_stats() {
        let stats = ListenerStats::default();
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.connections_denied.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_run_returns_on_stop() {
        let (tx, rx) = watch::channel(false);
        let listener = Arc::new(Listener::bind("127.0.0.1:0", None, store(), rx).await.unwrap());

        let task = tokio::spawn(Arc::clone(&listener).run());
        tx.send_replace(true);

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_stop_closes_listening_socket() {
        let (tx, rx) = watch::channel(false);
        let listener = Arc::new(Listener::bind("127.0.0.1:0", None, store(), rx).await.unwrap());
        let addr = listener.local_addr().unwrap();

        let task = tokio::spawn(Arc::clone(&listener).run());
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let err = TcpStream::connect(addr).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        // Stats survive the socket.
        assert_eq!(listener.stats().connections_accepted.load(Ordering::Relaxed), 0);
        assert!(Arc::clone(&listener).run().await.is_err());
    }

    #[tokio::test]
    async fn test_run_returns_immediately_when_already_stopped() {
        let (tx, rx) = watch::channel(false);
        let listener = Arc::new(Listener::bind("127.0.0.1:0", None, store(), rx).await.unwrap());
        tx.send_replace(true);

        let result = tokio::time::timeout(Duration::from_secs(5), listener.run()).await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_connections_over_ceiling_are_closed() {
        let (_tx, rx) = watch::channel(false);
        let listener = Arc::new(
            Listener::bind("127.0.0.1:0", Some(1), store(), rx)
                .await
                .unwrap(),
        );
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&listener).run());

        // Holds the only permit: it never sends a handshake.
        let _first = TcpStream::connect(addr).await.unwrap();
        while listener.stats().connections_active.load(Ordering::Relaxed) == 0 {
            tokio::task::yield_now().await;
        }

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0)) || read.is_err());
        assert_eq!(
            listener.stats().connections_rejected.load(Ordering::Relaxed),
            1
        );
    }
}
