//! Binary codec for the sensor's NEAI anomaly-detection characteristic
//!
//! Notifications from the sensor are framed as:
//! ```text
//! [ 4 bytes: sensor tick (u32, little-endian) ][ phase ][ state ][ progress ][ status ][ similarity ]
//! ```
//!
//! Commands written to the sensor are framed as:
//! ```text
//! [ 1 byte: opcode ][ 4 bytes: reserved, zero ]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{NeaiPhase, NeaiState, NeaiStatus, SensorCommand, TelemetrySample};

/// Length of the timestamp prefix on every notification
pub const TIMESTAMP_LEN: usize = 4;

/// Length of the NEAI payload following the timestamp
pub const PAYLOAD_LEN: usize = 5;

/// Total notification length
pub const NOTIFICATION_LEN: usize = TIMESTAMP_LEN + PAYLOAD_LEN;

/// Length of a command frame
pub const COMMAND_LEN: usize = 5;

/// Errors that can occur while decoding a notification
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Not enough data: need {needed} bytes, have {available}")]
    NotEnoughData { needed: usize, available: usize },

    #[error("{field} out of range: {value} (max 100)")]
    OutOfRange { field: &'static str, value: u8 },
}

/// Decode a notification into a telemetry sample
///
/// Trailing bytes beyond the NEAI payload are ignored.
pub fn decode_sample(data: &[u8]) -> Result<TelemetrySample, CodecError> {
    if data.len() < NOTIFICATION_LEN {
        return Err(CodecError::NotEnoughData {
            needed: NOTIFICATION_LEN,
            available: data.len(),
        });
    }

    let mut buf = data;
    let sensor_tick = buf.get_u32_le();
    let phase = NeaiPhase::from_byte(buf.get_u8());
    let state = NeaiState::from_byte(buf.get_u8());
    let progress = percentage("progress", buf.get_u8())?;
    let status = NeaiStatus::from_byte(buf.get_u8());
    let similarity = percentage("similarity", buf.get_u8())?;

    Ok(TelemetrySample::new(
        sensor_tick,
        phase,
        state,
        progress,
        status,
        similarity,
    ))
}

fn percentage(field: &'static str, value: u8) -> Result<u8, CodecError> {
    if value > 100 {
        return Err(CodecError::OutOfRange { field, value });
    }
    Ok(value)
}

/// Encode a command frame for the sensor
pub fn encode_command(command: SensorCommand) -> Bytes {
    let mut buf = BytesMut::with_capacity(COMMAND_LEN);
    buf.put_u8(command.opcode());
    buf.put_u32_le(0);
    buf.freeze()
}
