//! Device identity assembled from the validated configuration

use std::path::Path;

use super::RelayConfig;
use crate::error::ConfigError;

/// Client certificate material used for TLS authentication with the broker.
/// PEM bytes are read once at startup and never leave the cloud channel.
#[derive(Clone)]
pub struct CertificatePair {
    pub certificate_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
    pub ca_pem: Vec<u8>,
}

impl std::fmt::Debug for CertificatePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificatePair")
            .field("certificate_pem", &format_args!("{} bytes", self.certificate_pem.len()))
            .field("private_key_pem", &"<redacted>")
            .field("ca_pem", &format_args!("{} bytes", self.ca_pem.len()))
            .finish()
    }
}

/// Immutable identity of this gateway for the lifetime of the process
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub unique_id: String,
    pub cloud_project_id: String,
    pub environment: String,
    pub certificates: CertificatePair,
}

impl DeviceIdentity {
    /// Build the identity and load the certificate files
    pub fn from_config(config: &RelayConfig) -> Result<Self, ConfigError> {
        let certs = &config.cloud.certificates;
        let certificates = CertificatePair {
            certificate_pem: read_pem(&certs.certificate)?,
            private_key_pem: read_pem(&certs.private_key)?,
            ca_pem: read_pem(&certs.ca)?,
        };

        Ok(Self {
            unique_id: config.device.unique_id.trim().to_string(),
            cloud_project_id: config.device.cloud_project_id.trim().to_string(),
            environment: config.device.environment.trim().to_string(),
            certificates,
        })
    }

    /// Expand `{cpid}`, `{env}` and `{device_id}` in a topic or client id template
    pub fn expand(&self, template: &str) -> String {
        template
            .replace("{cpid}", &self.cloud_project_id)
            .replace("{env}", &self.environment)
            .replace("{device_id}", &self.unique_id)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Certificate {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{cert_files, test_identity, valid_config_toml};

    #[test]
    fn test_identity_loads_certificates() {
        let (cert, key) = cert_files("identity-load");
        let cfg = RelayConfig::from_toml(&valid_config_toml(&cert, &key)).unwrap();
        let identity = DeviceIdentity::from_config(&cfg).unwrap();

        assert_eq!(identity.unique_id, "proteus01");
        assert!(!identity.certificates.certificate_pem.is_empty());
        assert!(!identity.certificates.ca_pem.is_empty());
    }

    #[test]
    fn test_missing_certificate_is_config_error() {
        let (cert, key) = cert_files("identity-missing");
        let mut cfg = RelayConfig::from_toml(&valid_config_toml(&cert, &key)).unwrap();
        cfg.cloud.certificates.private_key = "/nonexistent/pk.pem".into();
        assert!(matches!(
            DeviceIdentity::from_config(&cfg),
            Err(ConfigError::Certificate { .. })
        ));
    }

    #[test]
    fn test_expand_templates() {
        let identity = test_identity("gw-7");
        assert_eq!(identity.expand("devices/{device_id}/telemetry"), "devices/gw-7/telemetry");
        assert_eq!(identity.expand("{cpid}-{device_id}"), "cpid-test-gw-7");
        assert_eq!(identity.expand("{env}/{cpid}"), "poc/cpid-test");
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let identity = test_identity("gw-7");
        let rendered = format!("{:?}", identity);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("PRIVATE KEY"));
    }
}
