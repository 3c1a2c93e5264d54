pub mod config;
pub mod error;
pub mod gateway;
pub mod persistence;
pub mod process;
pub mod proxy;

pub use config::{ConfigError, DestinationRule, ProxyProtocolPolicy, RoutingConfig};
pub use error::GatewayError;
pub use gateway::Gateway;
pub use persistence::ConfigFile;
pub use process::{ControlEvent, ControlSignals, PidFile, ProcessError};
pub use proxy::{Listener, ListenerStats};
