//! Per-connection routing pipeline.
//!
//! One invocation per accepted socket, strictly in order:
//! global gate, optional PROXY header, handshake, destination lookup,
//! destination gate, backend dial, optional outbound header, handshake
//! replay, relay, close. Any failure ends this connection only.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::backend::BackendConnection;
use super::forward::{relay, RelayStats};
use super::handshake::read_handshake;
use super::listener::ListenerStats;
use super::proxy_protocol::{read_header, ProxyIdentity};
use super::router::{ConfigStore, Destination, RoutingDecision, RoutingSnapshot};
use crate::error::{GatewayError, Result};

/// How a connection ended without error.
#[derive(Debug)]
enum Outcome {
    Denied,
    Forwarded(RelayStats),
}

/// State resolved for one connection.
struct Session {
    snapshot: Arc<RoutingSnapshot>,
    /// Socket peer, or the client named by an inbound PROXY header.
    effective_peer: SocketAddr,
}

/// Route one accepted connection and log how it ended.
pub(crate) async fn serve(
    client: TcpStream,
    peer_addr: SocketAddr,
    store: &ConfigStore,
    stats: &ListenerStats,
) {
    match route_connection(client, peer_addr, store, stats).await {
        Ok(Outcome::Forwarded(relayed)) => {
            stats
                .bytes_to_backend
                .fetch_add(relayed.client_to_backend, Ordering::Relaxed);
            stats
                .bytes_from_backend
                .fetch_add(relayed.backend_to_client, Ordering::Relaxed);
            info!(
                bytes_to_backend = relayed.client_to_backend,
                bytes_from_backend = relayed.backend_to_client,
                "Connection closed"
            );
        }
        Ok(Outcome::Denied) => {
            stats.connections_denied.fetch_add(1, Ordering::Relaxed);
            info!(reason = "access_denied", "Connection closed");
        }
        Err(e) => {
            match &e {
                GatewayError::MalformedVarInt(_)
                | GatewayError::TruncatedFrame(_)
                | GatewayError::InvalidServerAddress(_)
                | GatewayError::OversizedFrame(_)
                | GatewayError::MalformedHeader(_) => {
                    stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(reason = e.reason_code(), error = %e, "Failed to decode client preamble");
                }
                GatewayError::BackendUnreachable { addr, .. } => {
                    stats.backend_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(backend_addr = %addr, error = %e, "Backend unreachable");
                }
                GatewayError::NoDestination(_) | GatewayError::UnsupportedAddressFamily { .. } => {
                    warn!(reason = e.reason_code(), error = %e, "Connection not routable");
                }
                GatewayError::Io(_) => {
                    debug!(error = %e, "Client IO error");
                }
            }
            info!(reason = e.reason_code(), "Connection closed");
        }
    }
}

async fn route_connection(
    client: TcpStream,
    peer_addr: SocketAddr,
    store: &ConfigStore,
    stats: &ListenerStats,
) -> Result<Outcome> {
    let mut session = Session {
        snapshot: store.snapshot(),
        effective_peer: peer_addr,
    };

    if !session.snapshot.allowed_globally(peer_addr.ip()) {
        debug!(client_ip = %peer_addr.ip(), "Denied by global access list");
        return Ok(Outcome::Denied);
    }

    let mut client = BufReader::new(client);

    if session
        .snapshot
        .config()
        .proxy_protocol
        .receive_from_downstream
    {
        if let Some(identity) = read_header(&mut client).await? {
            debug!(
                src_addr = %identity.src_addr,
                dst_addr = %identity.dst_addr,
                "PROXY header received"
            );
            session.effective_peer = identity.src_addr;
        }
    }

    let frame = read_handshake(&mut client).await?;

    let destination = match session.snapshot.route(&frame.server_address) {
        RoutingDecision::Matched { destination } | RoutingDecision::Fallback { destination } => {
            destination
        }
        RoutingDecision::NoMatch { reason } => return Err(GatewayError::NoDestination(reason)),
    };

    if !session
        .snapshot
        .allowed(session.effective_peer.ip(), &destination)
    {
        debug!(
            client_ip = %session.effective_peer.ip(),
            destination = destination.rule.as_deref().unwrap_or("default"),
            "Denied by destination access list"
        );
        return Ok(Outcome::Denied);
    }

    log_decision(&session, &frame.server_address, &destination);

    let mut backend =
        BackendConnection::connect(&destination.address, session.snapshot.config().timeout)
            .await?;

    if destination.proxy_protocol.send_to_upstream {
        let header = ProxyIdentity::new(session.effective_peer, backend.peer_addr()).encode_v1()?;
        backend.send(&header).await?;
        debug!(backend_addr = %backend.peer_addr(), "PROXY v1 header sent");
    }

    backend.send(frame.raw()).await?;
    stats.backend_connected.fetch_add(1, Ordering::Relaxed);

    // Bytes the client sent past the handshake are still in the read
    // buffer and go out first.
    let relayed = relay(
        client,
        backend.into_stream(),
        session.snapshot.config().idle_timeout,
    )
    .await;

    Ok(Outcome::Forwarded(relayed))
}

fn log_decision(session: &Session, server_address: &str, destination: &Destination) {
    info!(
        client_addr = %session.effective_peer,
        server_address = %server_address,
        destination = destination.rule.as_deref().unwrap_or("default"),
        backend_addr = %destination.address,
        send_proxy_header = destination.proxy_protocol.send_to_upstream,
        "Routing connection"
    );
}
