//! Error taxonomy for the relay
//!
//! Low-level transport failures are translated into these types at the
//! owning component's boundary (sensor link, cloud channel) and never leak
//! into the dispatcher or the forwarder as raw transport errors.

use std::path::PathBuf;
use thiserror::Error;

/// Startup-fatal configuration problems
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config validation failed ({}):\n  - {}", count_errors(.0.len()), .0.join("\n  - "))]
    Invalid(Vec<String>),

    #[error("failed to read certificate {path}: {source}")]
    Certificate {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn count_errors(n: usize) -> String {
    if n == 1 {
        "1 error".to_string()
    } else {
        format!("{} errors", n)
    }
}

/// Reasons a BLE command write did not go out
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("sensor not connected")]
    NotConnected,

    #[error("write timed out after {0} ms")]
    Timeout(u64),

    #[error("write failed: {0}")]
    Write(String),
}

/// Errors surfaced by the sensor link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("link lost: {reason}")]
    LinkLost { reason: String },

    #[error("send failed: {0}")]
    Send(#[from] SendError),
}

impl SensorError {
    pub fn kind(&self) -> &'static str {
        match self {
            SensorError::Connection(_) => "ConnectionError",
            SensorError::LinkLost { .. } => "LinkLost",
            SensorError::Send(_) => "SendError",
        }
    }
}

/// Errors surfaced by the cloud channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("session lost: {reason}")]
    SessionLost { reason: String },

    #[error("publish failed: {0}")]
    Publish(String),
}

impl CloudError {
    pub fn kind(&self) -> &'static str {
        match self {
            CloudError::Auth(_) => "AuthError",
            CloudError::Network(_) => "NetworkError",
            CloudError::SessionLost { .. } => "SessionLost",
            CloudError::Publish(_) => "PublishError",
        }
    }

    /// Authentication failures count toward the fatal threshold
    pub fn is_auth(&self) -> bool {
        matches!(self, CloudError::Auth(_))
    }
}

/// Errors that terminate the service
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("authentication failed {attempts} times in a row: {reason}")]
    Authentication { attempts: u32, reason: String },
}

impl ServiceError {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Configuration(_) => "ConfigurationError",
            ServiceError::Authentication { .. } => "AuthError",
        }
    }

    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            ServiceError::Configuration(_) => 2,
            ServiceError::Authentication { .. } => 3,
        }
    }
}
