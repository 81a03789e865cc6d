use neai_shared::{Command, TelemetrySample};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Outbound telemetry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub(crate) struct TelemetryMessage {
    pub(crate) device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) timestamp: OffsetDateTime,
    pub(crate) sensor_tick: u32,
    #[serde(rename = "NEAI_phase")]
    pub(crate) phase: &'static str,
    #[serde(rename = "NEAI_state")]
    pub(crate) state: &'static str,
    #[serde(rename = "NEAI_progress_percentage")]
    pub(crate) progress: u8,
    #[serde(rename = "NEAI_status")]
    pub(crate) status: &'static str,
    #[serde(rename = "NEAI_similarity_percentage")]
    pub(crate) similarity: u8,
}

impl TelemetryMessage {
    pub(crate) fn new(device_id: &str, sample: &TelemetrySample) -> Self {
        let nanos = i128::from(sample.received_at_ms) * 1_000_000;
        let timestamp = OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        Self {
            device_id: device_id.to_string(),
            timestamp,
            sensor_tick: sample.sensor_tick,
            phase: sample.phase.as_str(),
            state: sample.state.as_str(),
            progress: sample.progress,
            status: sample.status.as_str(),
            similarity: sample.similarity,
        }
    }
}

// ---------------------------------------------------------------------------
// Command acknowledgements
// ---------------------------------------------------------------------------

/// Ack status: command applied (or already in effect)
pub const ACK_SUCCESS: u8 = 7;
/// Ack status: command rejected or not delivered to the sensor
pub const ACK_FAILED: u8 = 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandAck {
    pub ack: String,
    pub status: u8,
    pub message: String,
    pub device_id: String,
}

impl CommandAck {
    pub fn success(ack: &str, device_id: &str, message: impl Into<String>) -> Self {
        Self {
            ack: ack.to_string(),
            status: ACK_SUCCESS,
            message: message.into(),
            device_id: device_id.to_string(),
        }
    }

    pub fn failed(ack: &str, device_id: &str, message: impl Into<String>) -> Self {
        Self {
            ack: ack.to_string(),
            status: ACK_FAILED,
            message: message.into(),
            device_id: device_id.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound commands
// ---------------------------------------------------------------------------

/// A command as delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    pub command: Command,
    /// Correlation id; present when the cloud expects an acknowledgement
    pub ack_id: Option<String>,
}

impl InboundCommand {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            ack_id: None,
        }
    }

    pub fn with_ack(command: Command, ack_id: impl Into<String>) -> Self {
        Self {
            command,
            ack_id: Some(ack_id.into()),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("malformed command payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    cmd: Option<String>,
    #[serde(default)]
    ack: Option<String>,
    #[serde(default)]
    data: Option<Box<RawCommand>>,
}

impl RawCommand {
    /// Commands may arrive flat or wrapped in a `data` object
    fn flatten(self) -> (Option<String>, Option<String>) {
        match (self.cmd, self.data) {
            (Some(cmd), _) => (Some(cmd), self.ack),
            (None, Some(inner)) => {
                let (cmd, ack) = inner.flatten();
                (cmd, ack.or(self.ack))
            }
            (None, None) => (None, self.ack),
        }
    }
}

/// Parse an inbound command payload.
///
/// Accepts `{"cmd": "<name>", "ack": "<id>"}`, the same wrapped in `data`,
/// or a bare command name as plain text.
pub(crate) fn parse_command_payload(payload: &[u8]) -> Result<InboundCommand, PayloadError> {
    let text = String::from_utf8_lossy(payload);
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        let raw: RawCommand =
            serde_json::from_str(trimmed).map_err(|e| PayloadError::Malformed(e.to_string()))?;
        let (cmd, ack) = raw.flatten();
        let name = cmd.ok_or_else(|| PayloadError::Malformed("missing 'cmd'".into()))?;
        let command =
            Command::from_name(&name).ok_or_else(|| PayloadError::UnknownCommand(name.clone()))?;
        return Ok(match ack.filter(|a| !a.is_empty()) {
            Some(ack) => InboundCommand::with_ack(command, ack),
            None => InboundCommand::new(command),
        });
    }

    Command::from_name(trimmed)
        .map(InboundCommand::new)
        .ok_or_else(|| PayloadError::UnknownCommand(trimmed.to_string()))
}

// ===========================================================================
// Tests
// ===========================================================================
