//! Network access policy for the gateway.
//!
//! This library provides:
//! - Parsing of allow-list entries (bare addresses and CIDR ranges)
//! - Compiled access lists answering containment queries
//! - Global and per-destination access policy resolution
//!
//! Allow-list entries are compiled once per configuration load. Entries that
//! fail to parse are skipped, so stray comments or blank lines in an
//! operator-maintained list never make a configuration unloadable.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),
}

// ============================================================================
// Entry parsing
// ============================================================================

/// Parse a single allow-list entry.
///
/// Entries containing `/` are parsed as CIDR ranges (host bits are masked
/// off). Anything else must be a bare address, which is widened to a
/// host-exact network (`/32` for IPv4, `/128` for IPv6).
pub fn parse_entry(entry: &str) -> Result<IpNet, NetworkError> {
    let entry = entry.trim();

    if entry.contains('/') {
        let net: IpNet = entry
            .parse()
            .map_err(|_| NetworkError::InvalidPrefix(entry.to_string()))?;
        return Ok(net.trunc());
    }

    let addr: IpAddr = entry
        .parse()
        .map_err(|_| NetworkError::InvalidAddress(entry.to_string()))?;
    Ok(IpNet::from(addr))
}

// ============================================================================
// Access lists
// ============================================================================

/// A compiled allow-list: the union of a set of IP networks.
///
/// An empty list contains nothing, so it denies every address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessList {
    networks: Vec<IpNet>,
}

impl AccessList {
    /// Compile raw allow-list entries, skipping the ones that do not parse.
    pub fn compile<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let networks = entries
            .into_iter()
            .filter_map(|entry| {
                let entry = entry.as_ref().trim();
                if entry.is_empty() || entry.starts_with('#') {
                    return None;
                }
                parse_entry(entry).ok()
            })
            .collect();

        Self { networks }
    }

    /// Check whether an address falls inside any network of the list.
    ///
    /// IPv4-mapped IPv6 addresses (as reported by dual-stack sockets) are
    /// matched as the IPv4 address they carry.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        self.networks.iter().any(|net| net.contains(&addr))
    }

    /// Number of compiled networks.
    pub fn len(&self) -> usize {
        self.networks.len()
    }

    /// Returns true if no network compiled.
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

// ============================================================================
// Access policy
// ============================================================================

/// Global allow-list plus per-destination overrides.
///
/// A destination that declares its own list is governed by that list alone,
/// even when it compiled to nothing. Destinations without an override fall
/// back to the global list.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    global: AccessList,
    /// First occurrence of each destination name; `None` means "use global".
    overrides: HashMap<String, Option<AccessList>>,
}

impl AccessPolicy {
    /// Create a policy with only a global list.
    pub fn new(global: AccessList) -> Self {
        Self {
            global,
            overrides: HashMap::new(),
        }
    }

    /// Compile a policy from raw entries.
    ///
    /// `destinations` yields `(name, override)` pairs in configuration order.
    /// When a name repeats, the first occurrence wins, including one that
    /// declares no override: a later duplicate cannot supply a list for it.
    pub fn compile<'a, G, D>(global: G, destinations: D) -> Self
    where
        G: IntoIterator<Item = &'a String>,
        D: IntoIterator<Item = (&'a str, Option<&'a [String]>)>,
    {
        let mut policy = Self::new(AccessList::compile(global));
        for (name, entries) in destinations {
            policy
                .overrides
                .entry(name.to_string())
                .or_insert_with(|| entries.map(AccessList::compile));
        }
        policy
    }

    /// Add an override for a destination, unless the name is already known.
    pub fn with_override(mut self, destination: &str, list: AccessList) -> Self {
        self.overrides
            .entry(destination.to_string())
            .or_insert(Some(list));
        self
    }

    /// The global access list.
    pub fn global(&self) -> &AccessList {
        &self.global
    }

    /// The list that governs a destination.
    pub fn effective(&self, destination: Option<&str>) -> &AccessList {
        destination
            .and_then(|name| self.overrides.get(name))
            .and_then(Option::as_ref)
            .unwrap_or(&self.global)
    }

    /// Edge admission check against the global list.
    pub fn allowed_globally(&self, addr: IpAddr) -> bool {
        self.global.contains(addr)
    }

    /// Check an address against the list governing a destination.
    pub fn allowed(&self, addr: IpAddr, destination: Option<&str>) -> bool {
        self.effective(destination).contains(addr)
    }

    /// Number of destinations with an explicit override.
    pub fn override_count(&self) -> usize {
        self.overrides.values().filter(|list| list.is_some()).count()
    }
}
