//! Configuration file handling.
//!
//! - Load and validate the YAML file
//! - Write the default configuration atomically (temp file, then rename)
//!   when none exists yet

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::{ConfigError, RoutingConfig};

/// The gateway's configuration file.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    /// Path to the YAML file.
    path: PathBuf,
}

impl ConfigFile {
    /// Create a handle for the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read, parse and validate the file.
    pub fn load(&self) -> Result<RoutingConfig, ConfigError> {
        let content = fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.display().to_string(),
            source,
        })?;

        let config = RoutingConfig::from_yaml(&content)?;

        info!(
            path = %self.path.display(),
            server_count = config.servers.len(),
            listen_addr = %config.listen_addr,
            "Loaded configuration"
        );

        Ok(config)
    }

    /// Write the default configuration to disk atomically.
    pub fn write_default(&self) -> Result<RoutingConfig, ConfigError> {
        let config = RoutingConfig::default();
        self.save(&config)?;
        Ok(config)
    }

    /// Save `config` to disk atomically.
    ///
    /// Uses write-to-temp + rename pattern for atomicity.
    pub fn save(&self, config: &RoutingConfig) -> Result<(), ConfigError> {
        let write_error = |path: &Path, source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        };

        // Ensure parent directory exists
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| write_error(parent, e))?;
        }

        let content = config.to_yaml()?;

        // Write to temp file
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &content).map_err(|e| write_error(&tmp_path, e))?;

        // Atomic rename
        fs::rename(&tmp_path, &self.path).map_err(|e| write_error(&self.path, e))?;

        debug!(path = %self.path.display(), "Saved configuration to disk");

        Ok(())
    }
}
