//! Protocol-aware L4 proxy.
//!
//! This module provides:
//! - Handshake frame and varint codec
//! - PROXY protocol v1/v2 parsing and v1 emission
//! - Hot-swappable routing snapshots
//! - Backend dialing with bounded writes
//! - Bidirectional relay with half-close
//! - The TCP accept loop
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> [PROXY header] -> Handshake -> Router -> Backend
//!                                                                  |
//!                                                    [PROXY v1 header] + handshake replay
//! ```

mod backend;
mod connection;
mod forward;
pub mod handshake;
mod listener;
pub mod proxy_protocol;
mod router;

pub use backend::{BackendConnection, WRITE_DEADLINE};
pub use forward::{relay, ExpectedTermination, RelayStats};
pub use handshake::{HandshakeFrame, MAX_HANDSHAKE_LEN};
pub use listener::{Listener, ListenerStats};
pub use proxy_protocol::ProxyIdentity;
pub use router::{
    ConfigStore, Destination, RoutingDecision, RoutingSnapshot, SharedConfigStore,
};
