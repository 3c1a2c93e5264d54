//! Gateway handle: owns the config store and the stop signal.

use std::io;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::config::{ConfigError, RoutingConfig};
use crate::proxy::{ConfigStore, Listener, RoutingSnapshot, SharedConfigStore};

/// A configured gateway.
///
/// `bind` creates the listener; `stop` ends its accept loop without
/// touching connections already in flight; `update_config` swaps the
/// routing snapshot for connections accepted afterwards.
pub struct Gateway {
    store: SharedConfigStore,
    shutdown: watch::Sender<bool>,
}

impl Gateway {
    /// Create a gateway from a validated configuration.
    pub fn new(config: RoutingConfig) -> Result<Self, ConfigError> {
        let store = Arc::new(ConfigStore::new(config)?);
        let (shutdown, _) = watch::channel(false);
        Ok(Self { store, shutdown })
    }

    /// Bind the configured listen address.
    ///
    /// `max_connections` is read here; later reloads do not resize the
    /// ceiling of an existing listener.
    pub async fn bind(&self) -> io::Result<Listener> {
        let snapshot = self.store.snapshot();
        let config = snapshot.config();
        Listener::bind(
            &config.listen_addr,
            config.max_connections,
            Arc::clone(&self.store),
            self.shutdown.subscribe(),
        )
        .await
    }

    /// Stop accepting connections.
    pub fn stop(&self) {
        info!("Gateway stop requested");
        self.shutdown.send_replace(true);
    }

    /// Publish a new routing configuration.
    ///
    /// Invalid configurations are rejected and the current one stays.
    pub fn update_config(&self, config: RoutingConfig) -> Result<(), ConfigError> {
        self.store.replace(config)
    }

    /// The routing snapshot new connections will use.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.store.snapshot()
    }
}
