//! Test harness for gateway integration tests.
//!
//! Provides helpers to spawn backends and a gateway on loopback, and a
//! scripted client that records everything the gateway sends back.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use craftgate_gateway::proxy::handshake::encode_handshake;
use craftgate_gateway::{
    ConfigError, DestinationRule, Gateway, Listener, ListenerStats, ProxyProtocolPolicy,
    RoutingConfig,
};

/// Sent by a recording backend as soon as it accepts.
pub const GREETING: &[u8] = b"welcome";

/// Sent by a recording backend after the client's end-of-stream.
#[allow(dead_code)]
pub const FAREWELL: &[u8] = b"bye";

const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let conn_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Backend that greets, records everything until end-of-stream, then says
/// goodbye and closes.
#[allow(dead_code)]
pub struct RecordingBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    records: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl RecordingBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let (record_tx, record_rx) = mpsc::unbounded_channel();
        let conn_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let record_tx = record_tx.clone();
                                tokio::spawn(async move {
                                    if stream.write_all(GREETING).await.is_err() {
                                        return;
                                    }
                                    let mut received = Vec::new();
                                    if stream.read_to_end(&mut received).await.is_err() {
                                        return;
                                    }
                                    let _ = record_tx.send(received);
                                    let _ = stream.write_all(FAREWELL).await;
                                    let _ = stream.shutdown().await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            records: Mutex::new(record_rx),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Bytes of the next connection to reach end-of-stream.
    pub async fn next_record(&self) -> Option<Vec<u8>> {
        let mut records = self.records.lock().await;
        tokio::time::timeout(IO_TIMEOUT, records.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for RecordingBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub struct GatewayHandle {
    pub listen_addr: SocketAddr,
    pub gateway: Gateway,
    listener: Arc<Listener>,
    accept_loop: Option<JoinHandle<io::Result<()>>>,
}

#[allow(dead_code)]
impl GatewayHandle {
    /// Start a gateway on an ephemeral loopback port.
    pub async fn spawn(mut config: RoutingConfig) -> io::Result<Self> {
        config.listen_addr = "127.0.0.1:0".to_string();
        let gateway =
            Gateway::new(config).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let listener = Arc::new(gateway.bind().await?);
        let listen_addr = listener.local_addr()?;
        let accept_loop = tokio::spawn(Arc::clone(&listener).run());

        Ok(Self {
            listen_addr,
            gateway,
            listener,
            accept_loop: Some(accept_loop),
        })
    }

    pub fn stats(&self) -> &ListenerStats {
        self.listener.stats()
    }

    pub fn update_config(&self, mut config: RoutingConfig) -> Result<(), ConfigError> {
        config.listen_addr = "127.0.0.1:0".to_string();
        self.gateway.update_config(config)
    }

    /// Stop the gateway and wait for the accept loop to return.
    pub async fn stop(&mut self) -> io::Result<()> {
        self.gateway.stop();
        match self.accept_loop.take() {
            Some(handle) => tokio::time::timeout(IO_TIMEOUT, handle)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "accept loop still running"))?
                .map_err(io::Error::other)?,
            None => Ok(()),
        }
    }

    /// Wait until `pick` on the stats reaches `expected`.
    pub async fn wait_for(&self, pick: impl Fn(&ListenerStats) -> &AtomicU64, expected: u64) {
        let waited = tokio::time::timeout(IO_TIMEOUT, async {
            while pick(self.stats()).load(Ordering::Relaxed) < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "stat never reached {}", expected);
    }
}

/// What a scripted client saw.
#[allow(dead_code)]
pub struct ClientRun {
    pub local_addr: SocketAddr,
    pub received: Vec<u8>,
    /// The gateway ended the stream with FIN rather than an error.
    pub clean_eof: bool,
}

/// Connect, send `bytes`, half-close, and read until the gateway closes.
///
/// Write errors are ignored: a gateway that rejects the client may close
/// before everything is sent.
pub async fn run_client(gateway: SocketAddr, bytes: &[u8]) -> io::Result<ClientRun> {
    let mut stream = TcpStream::connect(gateway).await?;
    let local_addr = stream.local_addr()?;

    let _ = stream.write_all(bytes).await;
    let _ = stream.shutdown().await;

    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    let clean_eof = tokio::time::timeout(IO_TIMEOUT, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => return true,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(_) => return false,
            }
        }
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "gateway never closed"))?;

    Ok(ClientRun {
        local_addr,
        received,
        clean_eof,
    })
}

/// Handshake a client would send for `host`.
pub fn handshake(host: &str) -> Vec<u8> {
    encode_handshake(763, host, 25565, 2)
}

pub fn make_rule(name: &str, addr: SocketAddr) -> DestinationRule {
    DestinationRule {
        name: name.to_string(),
        address: addr.to_string(),
        whitelist: None,
        proxy_protocol: None,
    }
}

#[allow(dead_code)]
pub fn make_config(servers: Vec<DestinationRule>, default: SocketAddr) -> RoutingConfig {
    RoutingConfig {
        timeout: Duration::from_secs(2),
        listen_addr: "127.0.0.1:0".to_string(),
        default: default.to_string(),
        max_connections: None,
        idle_timeout: None,
        whitelist: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
        proxy_protocol: ProxyProtocolPolicy::default(),
        servers,
    }
}
