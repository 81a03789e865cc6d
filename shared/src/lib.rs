//! NEAI Relay Shared Protocol Types
//!
//! This crate provides the transport-independent pieces of the relay:
//! the command vocabulary, telemetry samples, the binary codec for the
//! sensor's GATT characteristic and the sensor mode state machine.

pub mod codec;
pub mod state_machine;
mod types;

use std::time::{SystemTime, UNIX_EPOCH};

pub use types::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing parameters shared by the relay components
pub mod timing {
    /// Client-side gate between ActivateLearning and ActivateAnomalyDetection.
    /// Mirrors the sensor firmware's own 10 s learning window.
    pub const LEARNING_DELAY_MS: u64 = 10_000;

    /// Silence on the sample stream after which the link counts as lost
    pub const SAMPLE_STALE_MS: u64 = 30_000;

    /// Initial reconnection delay
    pub const RECONNECT_INITIAL_MS: u64 = 1_000;

    /// Reconnection delay cap
    pub const RECONNECT_MAX_MS: u64 = 60_000;

    /// Consecutive authentication failures tolerated before giving up
    pub const MAX_AUTH_FAILURES: u32 = 3;

    /// Timeout for a single BLE command write
    pub const COMMAND_TIMEOUT_MS: u64 = 3_000;

    /// Timeout for a single telemetry publish
    pub const PUBLISH_TIMEOUT_MS: u64 = 2_000;
}

impl TelemetrySample {
    /// Create a sample stamped with the current gateway time
    pub fn new(
        sensor_tick: u32,
        phase: NeaiPhase,
        state: NeaiState,
        progress: u8,
        status: NeaiStatus,
        similarity: u8,
    ) -> Self {
        Self {
            sensor_tick,
            received_at_ms: now_ms(),
            phase,
            state,
            progress,
            status,
            similarity,
        }
    }

    /// True when both samples describe the same sensor reading,
    /// regardless of when the gateway received them.
    pub fn same_reading(&self, other: &TelemetrySample) -> bool {
        self.sensor_tick == other.sensor_tick
            && self.phase == other.phase
            && self.state == other.state
            && self.progress == other.progress
            && self.status == other.status
            && self.similarity == other.similarity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_creation() {
        let sample = TelemetrySample::new(
            42,
            NeaiPhase::Detection,
            NeaiState::Ok,
            100,
            NeaiStatus::Normal,
            97,
        );
        assert_eq!(sample.sensor_tick, 42);
        assert_eq!(sample.similarity, 97);
        assert!(sample.received_at_ms > 0);
    }

    #[test]
    fn test_same_reading_ignores_receive_time() {
        let a = TelemetrySample::new(7, NeaiPhase::Detection, NeaiState::Ok, 100, NeaiStatus::Anomaly, 12);
        let mut b = a.clone();
        b.received_at_ms += 5_000;
        assert!(a.same_reading(&b));

        b.sensor_tick = 8;
        assert!(!a.same_reading(&b));
    }

    #[test]
    fn test_command_names_round_trip() {
        for cmd in Command::ALL {
            assert_eq!(Command::from_name(cmd.name()), Some(cmd));
        }
        assert_eq!(Command::from_name("self_destruct"), None);
    }
}
