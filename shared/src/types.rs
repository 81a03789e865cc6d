//! Domain types exchanged between the sensor link, the dispatcher and the cloud

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Commands accepted from the cloud
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Start a learning phase on the sensor
    ActivateLearning,
    /// Switch the sensor to anomaly detection
    ActivateAnomalyDetection,
    /// Stop anomaly detection
    StopAnomalyDetection,
    /// Wipe the sensor's learned baseline
    ResetKnowledge,
}

impl Command {
    pub const ALL: [Command; 4] = [
        Command::ActivateLearning,
        Command::ActivateAnomalyDetection,
        Command::StopAnomalyDetection,
        Command::ResetKnowledge,
    ];

    /// Name used on the cloud command channel
    pub fn name(self) -> &'static str {
        match self {
            Command::ActivateLearning => "learn",
            Command::ActivateAnomalyDetection => "start_ad",
            Command::StopAnomalyDetection => "stop_ad",
            Command::ResetKnowledge => "reset_knowledge",
        }
    }

    /// Parse a cloud command name. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "learn" => Some(Command::ActivateLearning),
            "start_ad" => Some(Command::ActivateAnomalyDetection),
            "stop_ad" => Some(Command::StopAnomalyDetection),
            "reset_knowledge" => Some(Command::ResetKnowledge),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opcodes written to the sensor's NEAI characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SensorCommand {
    Stop = 0x00,
    Learn = 0x01,
    Detect = 0x02,
    Reset = 0xFF,
}

impl SensorCommand {
    pub fn opcode(self) -> u8 {
        self as u8
    }
}

/// Sensor mode as tracked by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SensorMode {
    #[default]
    Idle,
    Learning,
    Detecting,
}

impl fmt::Display for SensorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorMode::Idle => write!(f, "Idle"),
            SensorMode::Learning => write!(f, "Learning"),
            SensorMode::Detecting => write!(f, "Detecting"),
        }
    }
}

/// Phase reported by the on-sensor engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeaiPhase {
    Idle,
    Learning,
    Detection,
    IdleTrained,
    Busy,
    None,
}

impl NeaiPhase {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => NeaiPhase::Idle,
            0x01 => NeaiPhase::Learning,
            0x02 => NeaiPhase::Detection,
            0x03 => NeaiPhase::IdleTrained,
            0x04 => NeaiPhase::Busy,
            _ => NeaiPhase::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NeaiPhase::Idle => "IDLE",
            NeaiPhase::Learning => "LEARNING",
            NeaiPhase::Detection => "DETECTION",
            NeaiPhase::IdleTrained => "IDLE_TRAINED",
            NeaiPhase::Busy => "BUSY",
            NeaiPhase::None => "NONE",
        }
    }
}

/// Engine state reported by the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeaiState {
    Ok,
    InitNotCalled,
    BoardError,
    KnowledgeError,
    NotEnoughLearning,
    MinimalLearningDone,
    UnknownError,
    None,
}

impl NeaiState {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => NeaiState::Ok,
            0x7B => NeaiState::InitNotCalled,
            0x7C => NeaiState::BoardError,
            0x7D => NeaiState::KnowledgeError,
            0x7E => NeaiState::NotEnoughLearning,
            0x7F => NeaiState::MinimalLearningDone,
            0x80 => NeaiState::UnknownError,
            _ => NeaiState::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NeaiState::Ok => "OK",
            NeaiState::InitNotCalled => "INIT_NOT_CALLED",
            NeaiState::BoardError => "BOARD_ERROR",
            NeaiState::KnowledgeError => "KNOWLEDGE_ERROR",
            NeaiState::NotEnoughLearning => "NOT_ENOUGH_LEARNING",
            NeaiState::MinimalLearningDone => "MINIMAL_LEARNING_DONE",
            NeaiState::UnknownError => "UNKNOWN_ERROR",
            NeaiState::None => "NONE",
        }
    }
}

/// Signal status reported in detection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NeaiStatus {
    #[default]
    Unknown,
    Normal,
    Anomaly,
}

impl NeaiStatus {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => NeaiStatus::Normal,
            0x01 => NeaiStatus::Anomaly,
            _ => NeaiStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NeaiStatus::Unknown => "UNKNOWN",
            NeaiStatus::Normal => "NORMAL",
            NeaiStatus::Anomaly => "ANOMALY",
        }
    }
}

/// One status sample read from the sensor
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    /// Timestamp carried in the sensor notification
    pub sensor_tick: u32,
    /// Gateway receive time (ms since Unix epoch)
    pub received_at_ms: u64,
    pub phase: NeaiPhase,
    pub state: NeaiState,
    /// Learning progress, 0..=100
    pub progress: u8,
    pub status: NeaiStatus,
    /// Similarity to the learned baseline, 0..=100
    pub similarity: u8,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid MAC address '{0}' (expected six colon-separated hex octets)")]
pub struct MacAddressError(pub String);

/// Bluetooth device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = MacAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || MacAddressError(s.to_string());
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(':');

        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(err());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }

        if parts.next().is_some() {
            return Err(err());
        }
        Ok(MacAddress(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}", a, b, c, d, e, g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse() {
        let mac: MacAddress = "c0:85:0A:39:6e:1F".parse().unwrap();
        assert_eq!(mac.octets(), [0xC0, 0x85, 0x0A, 0x39, 0x6E, 0x1F]);
        assert_eq!(mac.to_string(), "C0:85:0A:39:6E:1F");
    }

    #[test]
    fn test_mac_parse_rejects_malformed() {
        for bad in [
            "",
            "C0:85:0A:39:6E",
            "C0:85:0A:39:6E:1F:00",
            "C0-85-0A-39-6E-1F",
            "ZZ:85:0A:39:6E:1F",
            "C0:855:0A:39:6E:1",
            "+A:85:0A:39:6E:1F",
            "C0:85:0A:39:6E:-1",
        ] {
            assert!(bad.parse::<MacAddress>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_status_from_byte() {
        assert_eq!(NeaiStatus::from_byte(0x00), NeaiStatus::Normal);
        assert_eq!(NeaiStatus::from_byte(0x01), NeaiStatus::Anomaly);
        assert_eq!(NeaiStatus::from_byte(0xFF), NeaiStatus::Unknown);
        assert_eq!(NeaiStatus::from_byte(0x42), NeaiStatus::Unknown);
    }

    #[test]
    fn test_sensor_opcodes() {
        assert_eq!(SensorCommand::Stop.opcode(), 0x00);
        assert_eq!(SensorCommand::Learn.opcode(), 0x01);
        assert_eq!(SensorCommand::Detect.opcode(), 0x02);
        assert_eq!(SensorCommand::Reset.opcode(), 0xFF);
    }
}
