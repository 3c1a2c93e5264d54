//! Routing snapshots and the config store.
//!
//! The store holds one compiled snapshot of the routing configuration.
//! Connections take a snapshot when they start and keep it until they
//! close, so a reload never changes the destination or policy of a
//! connection already in flight.
//!
//! - Destination lookup is an exact match on the handshake hostname
//! - The first rule with a given name wins
//! - Unmatched hostnames fall back to the default address
//! - Reloads are validated and compiled before they become visible

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use craftgate_networking::AccessPolicy;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ProxyProtocolPolicy, RoutingConfig};

/// Where a connection is sent and under which policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Name of the matched rule, `None` for the default address.
    pub rule: Option<String>,
    /// Backend `host:port`.
    pub address: String,
    /// Effective PROXY header policy.
    pub proxy_protocol: ProxyProtocolPolicy,
}

/// Result of a routing decision.
#[derive(Debug, Clone)]
pub enum RoutingDecision {
    /// A destination rule matched the hostname.
    Matched { destination: Destination },
    /// No rule matched, the default address applies.
    Fallback { destination: Destination },
    /// Nothing to route to.
    NoMatch { reason: String },
}

impl RoutingDecision {
    /// The destination, if there is one.
    pub fn destination(&self) -> Option<&Destination> {
        match self {
            RoutingDecision::Matched { destination } | RoutingDecision::Fallback { destination } => {
                Some(destination)
            }
            RoutingDecision::NoMatch { .. } => None,
        }
    }
}

/// Immutable configuration plus the access policy compiled from it.
#[derive(Debug)]
pub struct RoutingSnapshot {
    config: RoutingConfig,
    access: AccessPolicy,
}

impl RoutingSnapshot {
    /// Validate a configuration and compile its access lists.
    pub fn compile(config: RoutingConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let access = AccessPolicy::compile(
            &config.whitelist,
            config
                .servers
                .iter()
                .map(|rule| (rule.name.as_str(), rule.whitelist.as_deref())),
        );

        debug!(
            global_networks = access.global().len(),
            overrides = access.override_count(),
            "Compiled access policy"
        );

        Ok(Self { config, access })
    }

    /// The configuration this snapshot was compiled from.
    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Edge admission, checked against the socket peer before any bytes
    /// are read.
    pub fn allowed_globally(&self, addr: IpAddr) -> bool {
        self.access.allowed_globally(addr)
    }

    /// Policy check for a resolved destination.
    pub fn allowed(&self, addr: IpAddr, destination: &Destination) -> bool {
        self.access.allowed(addr, destination.rule.as_deref())
    }

    /// Resolve the hostname from a handshake to a destination.
    pub fn route(&self, server_address: &str) -> RoutingDecision {
        if let Some(rule) = self.config.rule(server_address) {
            return RoutingDecision::Matched {
                destination: Destination {
                    rule: Some(rule.name.clone()),
                    address: rule.address.clone(),
                    proxy_protocol: self.config.proxy_protocol_for(Some(&rule.name)),
                },
            };
        }

        if self.config.default.is_empty() {
            return RoutingDecision::NoMatch {
                reason: format!("No destination for hostname '{}'", server_address),
            };
        }

        RoutingDecision::Fallback {
            destination: Destination {
                rule: None,
                address: self.config.default.clone(),
                proxy_protocol: self.config.proxy_protocol,
            },
        }
    }
}

/// Holder of the live routing snapshot.
///
/// Uses ArcSwap so readers never block: `snapshot` is a pointer load and
/// `replace` is a single pointer swap. Old snapshots are dropped when the
/// last connection holding them closes.
pub struct ConfigStore {
    snapshot: ArcSwap<RoutingSnapshot>,
}

impl ConfigStore {
    /// Create a store from an initial configuration.
    pub fn new(config: RoutingConfig) -> Result<Self, ConfigError> {
        let snapshot = RoutingSnapshot::compile(config)?;
        Ok(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        })
    }

    /// The currently active snapshot.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot.load_full()
    }

    /// Validate, compile and publish a new configuration.
    ///
    /// On error the active snapshot is untouched.
    pub fn replace(&self, config: RoutingConfig) -> Result<(), ConfigError> {
        let next = RoutingSnapshot::compile(config)?;

        let current = self.snapshot.load();
        if current.config.listen_addr != next.config.listen_addr {
            warn!(
                active = %current.config.listen_addr,
                requested = %next.config.listen_addr,
                "listen_addr changes take effect on restart only"
            );
        }

        let server_count = next.config.servers.len();
        self.snapshot.store(Arc::new(next));

        info!(server_count = server_count, "Routing configuration replaced");
        Ok(())
    }
}

/// Shared config store reference.
pub type SharedConfigStore = Arc<ConfigStore>;
