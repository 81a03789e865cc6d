//! Cloud channel abstraction for pluggable broker backends

use async_trait::async_trait;
use neai_shared::TelemetrySample;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use super::message::{CommandAck, InboundCommand, TelemetryMessage};
use crate::config::DeviceIdentity;
use crate::error::CloudError;

/// Events pushed by a backend into the command stream
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Command(InboundCommand),
    /// The broker session ended; the stream ends after this
    Lost { reason: String },
}

/// Raw publish access to an open broker session
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()>;

    /// Disconnect from the broker
    async fn close(&self);
}

/// Factory for broker sessions
#[async_trait]
pub trait CloudChannel: Send + Sync {
    /// Open an authenticated session for `identity`
    async fn open(&self, identity: &DeviceIdentity) -> Result<CloudConnection, CloudError>;

    /// Human-readable name for this backend
    fn name(&self) -> &'static str;
}

/// An open session plus its inbound command stream
pub struct CloudConnection {
    pub session: CloudSession,
    pub commands: CommandStream,
}

/// Topics resolved for one device
#[derive(Debug, Clone)]
pub struct SessionTopics {
    pub telemetry: String,
    pub ack: String,
}

/// Publishing side of a broker session. Clones share the connection.
#[derive(Clone)]
pub struct CloudSession {
    device_id: String,
    topics: SessionTopics,
    publisher: Arc<dyn MessagePublisher>,
    publish_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl CloudSession {
    pub fn new(
        device_id: impl Into<String>,
        topics: SessionTopics,
        publisher: Arc<dyn MessagePublisher>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            topics,
            publisher,
            publish_timeout,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Device id stamped on every outbound message
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Publish one telemetry sample tagged with this device's id.
    /// Best effort: nothing is queued for retry.
    pub async fn publish(&self, sample: &TelemetrySample) -> Result<(), CloudError> {
        let message = TelemetryMessage::new(&self.device_id, sample);
        let payload =
            serde_json::to_vec(&message).map_err(|e| CloudError::Publish(e.to_string()))?;
        self.send(&self.topics.telemetry, payload).await
    }

    /// Publish a command acknowledgement
    pub async fn acknowledge(&self, ack: &CommandAck) -> Result<(), CloudError> {
        let payload = serde_json::to_vec(ack).map_err(|e| CloudError::Publish(e.to_string()))?;
        self.send(&self.topics.ack, payload).await
    }

    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), CloudError> {
        if self.is_closed() {
            return Err(CloudError::SessionLost {
                reason: "session closed".into(),
            });
        }

        match timeout(self.publish_timeout, self.publisher.publish(topic, payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CloudError::Publish(e.to_string())),
            Err(_) => Err(CloudError::Publish(format!(
                "timed out after {} ms",
                self.publish_timeout.as_millis()
            ))),
        }
    }

    /// Release the broker session. Idempotent.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("[MQTT] Closing session for {}", self.device_id);
            self.publisher.close().await;
        }
    }
}

impl std::fmt::Debug for CloudSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudSession")
            .field("device_id", &self.device_id)
            .field("topics", &self.topics)
            .finish()
    }
}

/// Inbound commands in broker-delivery order.
///
/// Ends with `CloudError::SessionLost`; every later call returns the same.
pub struct CommandStream {
    rx: mpsc::Receiver<SessionEvent>,
    lost: Option<String>,
}

impl CommandStream {
    pub fn new(rx: mpsc::Receiver<SessionEvent>) -> Self {
        Self { rx, lost: None }
    }

    pub async fn next(&mut self) -> Result<InboundCommand, CloudError> {
        if let Some(reason) = &self.lost {
            return Err(CloudError::SessionLost {
                reason: reason.clone(),
            });
        }

        let reason = match self.rx.recv().await {
            Some(SessionEvent::Command(cmd)) => return Ok(cmd),
            Some(SessionEvent::Lost { reason }) => reason,
            None => "command channel closed".to_string(),
        };

        self.lost = Some(reason.clone());
        self.rx.close();
        Err(CloudError::SessionLost { reason })
    }
}
