//! Telemetry path from the sensor link to the cloud channel

mod forwarder;

pub use forwarder::{SampleSlot, TelemetryForwarder};
