//! Cloud channel: authenticated broker session, telemetry publish and
//! inbound command delivery

mod channel;
mod message;
mod mqtt;

pub use channel::{
    CloudChannel, CloudConnection, CloudSession, CommandStream, MessagePublisher, SessionEvent,
    SessionTopics,
};
pub use message::{CommandAck, InboundCommand};
pub use mqtt::{MqttCloudChannel, MqttSettings};
