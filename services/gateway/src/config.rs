//! Gateway routing configuration.
//!
//! A `RoutingConfig` is built wholesale from the YAML file and never mutated
//! after it is handed to the config store; reloads replace it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default backend dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("error reading config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file could not be written.
    #[error("error writing config file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML for this schema.
    #[error("error decoding config from YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The configuration parsed but violates an invariant.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// PROXY header handling toward each side of the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyProtocolPolicy {
    /// Prefix backend connections with a v1 header naming the client.
    #[serde(default)]
    pub send_to_upstream: bool,
    /// Expect a header (v1 or v2) ahead of every client handshake.
    #[serde(default)]
    pub receive_from_downstream: bool,
}

/// A named virtual host mapped to a backend address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationRule {
    /// Virtual hostname, matched exactly against the handshake.
    pub name: String,
    /// Backend `host:port`.
    pub address: String,
    /// Access-list override. Present but empty denies every client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<Vec<String>>,
    /// PROXY header policy override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_protocol: Option<ProxyProtocolPolicy>,
}

/// Complete routing and policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Backend dial timeout.
    #[serde(default = "default_dial_timeout", with = "duration_format")]
    pub timeout: Duration,

    /// Address the listener binds to.
    #[serde(default)]
    pub listen_addr: String,

    /// Backend used when no destination rule matches.
    #[serde(default)]
    pub default: String,

    /// Concurrency ceiling. `None` accepts without limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    /// Close forwarding connections idle for this long. `None` never reaps.
    #[serde(
        default,
        with = "duration_format::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub idle_timeout: Option<Duration>,

    /// Global allow-list entries (bare addresses or CIDR ranges).
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Global PROXY header policy.
    #[serde(default)]
    pub proxy_protocol: ProxyProtocolPolicy,

    /// Destination rules, in match order.
    #[serde(default)]
    pub servers: Vec<DestinationRule>,
}

fn default_dial_timeout() -> Duration {
    DEFAULT_DIAL_TIMEOUT
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DIAL_TIMEOUT,
            listen_addr: "0.0.0.0:25565".to_string(),
            default: "127.0.0.1:25577".to_string(),
            max_connections: None,
            idle_timeout: None,
            whitelist: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
            proxy_protocol: ProxyProtocolPolicy::default(),
            servers: vec![
                DestinationRule {
                    name: "lobby.example.com".to_string(),
                    address: "127.0.0.1:25578".to_string(),
                    whitelist: None,
                    proxy_protocol: None,
                },
                DestinationRule {
                    name: "survival.example.com".to_string(),
                    address: "127.0.0.1:25579".to_string(),
                    whitelist: None,
                    proxy_protocol: None,
                },
            ],
        }
    }
}

impl RoutingConfig {
    /// Parse a configuration from YAML and validate it.
    pub fn from_yaml(source: &str) -> Result<Self, ConfigError> {
        let config: RoutingConfig = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "listen address cannot be empty".to_string(),
            ));
        }
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one server must be defined".to_string(),
            ));
        }
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(ConfigError::Invalid(
                    "server name cannot be empty".to_string(),
                ));
            }
            if server.address.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "server address cannot be empty for server: {}",
                    server.name
                )));
            }
        }
        if self.default.is_empty() {
            return Err(ConfigError::Invalid(
                "default backend address cannot be empty".to_string(),
            ));
        }
        if self.max_connections == Some(0) {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// The PROXY header policy for a destination rule, or the global one.
    pub fn proxy_protocol_for(&self, destination: Option<&str>) -> ProxyProtocolPolicy {
        destination
            .and_then(|name| self.rule(name))
            .and_then(|rule| rule.proxy_protocol)
            .unwrap_or(self.proxy_protocol)
    }

    /// First destination rule with the given name.
    pub fn rule(&self, name: &str) -> Option<&DestinationRule> {
        self.servers.iter().find(|rule| rule.name == name)
    }
}

/// Durations as `"250ms"`, `"5s"`, `"2m"`, `"1h"`, or bare integer seconds.
mod duration_format {
    use std::time::Duration;

    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }

    pub(super) fn format_duration(value: Duration) -> String {
        if value.subsec_millis() != 0 || value.as_secs() == 0 {
            format!("{}ms", value.as_millis())
        } else {
            format!("{}s", value.as_secs())
        }
    }

    pub(super) fn parse_duration(s: &str) -> Option<Duration> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);
        let amount: u64 = digits.parse().ok()?;
        match unit.trim() {
            "ms" => Some(Duration::from_millis(amount)),
            "" | "s" => Some(Duration::from_secs(amount)),
            "m" => Some(Duration::from_secs(amount.checked_mul(60)?)),
            "h" => Some(Duration::from_secs(amount.checked_mul(3600)?)),
            _ => None,
        }
    }

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a duration such as \"5s\" or \"500ms\", or integer seconds")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration cannot be negative"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            parse_duration(v).ok_or_else(|| E::custom(format!("invalid duration: {:?}", v)))
        }
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(with = "super")] Duration);

            let value: Option<Wrapper> = Option::deserialize(deserializer)?;
            Ok(value.map(|Wrapper(duration)| duration))
        }
    }
}
