//! TOML configuration structures and validation

use bluer::Uuid;
use neai_shared::{timing, MacAddress};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub sensor: SensorSection,
    #[serde(default)]
    pub cloud: CloudSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
}

/// Identity fields handed out at provisioning time
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceSection {
    #[serde(default)]
    pub unique_id: String,
    #[serde(default)]
    pub cloud_project_id: String,
    #[serde(default)]
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSection {
    /// BLE address of the sensor module
    pub mac_address: String,
    /// Local adapter name (e.g. "hci0"); default adapter when unset
    pub adapter: Option<String>,
    /// GATT characteristic carrying NEAI notifications and commands
    pub characteristic_uuid: Option<String>,
    pub scan_timeout_secs: u64,
    pub learning_delay_secs: u64,
    pub stale_after_secs: u64,
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            mac_address: String::new(),
            adapter: None,
            characteristic_uuid: None,
            scan_timeout_secs: 10,
            learning_delay_secs: timing::LEARNING_DELAY_MS / 1000,
            stale_after_secs: timing::SAMPLE_STALE_MS / 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudSection {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    /// MQTT client id template
    pub client_id: String,
    pub telemetry_topic: String,
    pub command_topic: String,
    pub ack_topic: String,
    /// Minimum spacing between telemetry publishes; 0 forwards as observed
    pub publish_interval_ms: u64,
    pub certificates: CertificateSection,
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8883,
            keep_alive_secs: 60,
            client_id: "{cpid}-{device_id}".into(),
            telemetry_topic: "devices/{device_id}/telemetry".into(),
            command_topic: "devices/{device_id}/commands".into(),
            ack_topic: "devices/{device_id}/acks".into(),
            publish_interval_ms: 0,
            certificates: CertificateSection::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CertificateSection {
    #[serde(default)]
    pub certificate: PathBuf,
    #[serde(default)]
    pub private_key: PathBuf,
    /// Broker CA bundle
    #[serde(default)]
    pub ca: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_auth_failures: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: timing::RECONNECT_INITIAL_MS,
            max_delay_ms: timing::RECONNECT_MAX_MS,
            max_auth_failures: timing::MAX_AUTH_FAILURES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub connect_secs: u64,
    pub publish_ms: u64,
    pub command_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect_secs: 15,
            publish_ms: timing::PUBLISH_TIMEOUT_MS,
            command_ms: timing::COMMAND_TIMEOUT_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl RelayConfig {
    /// Parse a config document. Does not validate.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Sensor address. Only meaningful after `validate` succeeded.
    pub fn mac_address(&self) -> Result<MacAddress, ConfigError> {
        self.sensor
            .mac_address
            .parse()
            .map_err(|e: neai_shared::MacAddressError| ConfigError::Invalid(vec![e.to_string()]))
    }

    /// Characteristic override, if one is configured
    pub fn characteristic_uuid(&self) -> Result<Option<Uuid>, ConfigError> {
        self.sensor
            .characteristic_uuid
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| {
                ConfigError::Invalid(vec![format!("sensor.characteristic_uuid: {e}")])
            })
    }

    pub fn learning_delay(&self) -> Duration {
        Duration::from_secs(self.sensor.learning_delay_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.sensor.stale_after_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.publish_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.command_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.cloud.publish_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl RelayConfig {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_device(&mut errors);
        self.validate_sensor(&mut errors);
        self.validate_cloud(&mut errors);
        self.validate_timing(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let d = &self.device;
        for (name, value) in [
            ("unique_id", &d.unique_id),
            ("cloud_project_id", &d.cloud_project_id),
            ("environment", &d.environment),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("device.{name} is empty"));
            }
        }
    }

    fn validate_sensor(&self, errors: &mut Vec<String>) {
        let s = &self.sensor;
        if s.mac_address.trim().is_empty() {
            errors.push("sensor.mac_address is not configured".into());
        } else if let Err(e) = s.mac_address.parse::<MacAddress>() {
            errors.push(format!("sensor.mac_address: {e}"));
        }

        if let Some(uuid) = &s.characteristic_uuid {
            if let Err(e) = Uuid::parse_str(uuid) {
                errors.push(format!("sensor.characteristic_uuid '{uuid}': {e}"));
            }
        }
        if s.scan_timeout_secs == 0 {
            errors.push("sensor.scan_timeout_secs must be positive".into());
        }
        if s.stale_after_secs == 0 {
            errors.push("sensor.stale_after_secs must be positive".into());
        }
    }

    fn validate_cloud(&self, errors: &mut Vec<String>) {
        let c = &self.cloud;
        if c.host.trim().is_empty() {
            errors.push("cloud.host is empty".into());
        }
        if c.port == 0 {
            errors.push("cloud.port must be non-zero".into());
        }
        for (name, topic) in [
            ("telemetry_topic", &c.telemetry_topic),
            ("command_topic", &c.command_topic),
            ("ack_topic", &c.ack_topic),
        ] {
            if topic.trim().is_empty() {
                errors.push(format!("cloud.{name} is empty"));
            } else if topic.contains('#') || topic.contains('+') {
                errors.push(format!("cloud.{name} '{topic}' must not contain wildcards"));
            }
        }

        let certs = &c.certificates;
        check_file("cloud.certificates.certificate", &certs.certificate, errors);
        check_file("cloud.certificates.private_key", &certs.private_key, errors);
        check_file("cloud.certificates.ca", &certs.ca, errors);
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let r = &self.reconnect;
        if r.initial_delay_ms == 0 {
            errors.push("reconnect.initial_delay_ms must be positive".into());
        }
        if r.max_delay_ms < r.initial_delay_ms {
            errors.push(format!(
                "reconnect.max_delay_ms ({}) is below initial_delay_ms ({})",
                r.max_delay_ms, r.initial_delay_ms
            ));
        }
        if r.max_auth_failures == 0 {
            errors.push("reconnect.max_auth_failures must be at least 1".into());
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("connect_secs", t.connect_secs),
            ("publish_ms", t.publish_ms),
            ("command_ms", t.command_ms),
        ] {
            if value == 0 {
                errors.push(format!("timeouts.{name} must be positive"));
            }
        }
    }
}

fn check_file(name: &str, path: &Path, errors: &mut Vec<String>) {
    if path.as_os_str().is_empty() {
        errors.push(format!("{name} is not configured"));
    } else if !path.is_file() {
        errors.push(format!("{name} {} does not exist", path.display()));
    }
}

// ===========================================================================
// Tests
// ===========================================================================
