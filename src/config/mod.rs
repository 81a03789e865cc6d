//! Configuration loading for the relay
//!
//! This module handles:
//! - Locating the config file (CLI argument, environment, default path)
//! - Parsing the TOML document
//! - Validating every entry before any connection is attempted
//! - Building the immutable device identity

mod identity;
mod settings;

pub use identity::{CertificatePair, DeviceIdentity};
pub use settings::{ReconnectSection, RelayConfig};

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Environment variable overriding the config path
pub const CONFIG_ENV: &str = "NEAI_RELAY_CONFIG";

/// Default config location for the packaged service
pub const DEFAULT_CONFIG_PATH: &str = "/etc/neai-relay/config.toml";

/// Resolve the config path: explicit argument, then environment, then default
pub fn resolve_path(arg: Option<String>) -> PathBuf {
    arg.or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Read and parse the config file. Validation is left to the caller.
pub fn load(path: &Path) -> Result<RelayConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}

/// Parse a config document
pub fn parse(text: &str) -> Result<RelayConfig, ConfigError> {
    RelayConfig::from_toml(text)
}
