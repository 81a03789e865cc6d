//! Sensor link abstraction for pluggable BLE backends

use async_trait::async_trait;
use bytes::Bytes;
use neai_shared::{codec, MacAddress, SensorCommand, TelemetrySample};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::debug;

use crate::error::{SendError, SensorError};

/// Connection state of a sensor handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events pushed by a backend into the sample stream
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A decoded sample
    Sample(TelemetrySample),
    /// The radio link dropped; the stream ends after this
    Lost { reason: String },
}

/// Raw write access to the sensor's command characteristic
#[async_trait]
pub trait CommandWriter: Send + Sync {
    /// Write one command frame
    async fn write(&self, frame: Bytes) -> anyhow::Result<()>;

    /// Tear down the BLE connection
    async fn disconnect(&self);
}

/// Factory for sensor connections
#[async_trait]
pub trait SensorLink: Send + Sync {
    /// Connect to the sensor at `address`
    async fn connect(&self, address: MacAddress) -> Result<SensorConnection, SensorError>;

    /// Human-readable name for this backend
    fn name(&self) -> &'static str;
}

/// A live connection: the command handle plus its sample stream
pub struct SensorConnection {
    pub handle: SensorHandle,
    pub samples: SampleStream,
}

/// Handle to one BLE peer. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SensorHandle {
    address: MacAddress,
    state: Arc<RwLock<LinkState>>,
    last_sample: Arc<RwLock<Option<TelemetrySample>>>,
    writer: Arc<dyn CommandWriter>,
    command_timeout: Duration,
}

impl SensorHandle {
    /// Create a handle in Connecting state; the backend marks it Connected
    /// once notifications are flowing.
    pub fn new(address: MacAddress, writer: Arc<dyn CommandWriter>, command_timeout: Duration) -> Self {
        Self {
            address,
            state: Arc::new(RwLock::new(LinkState::Connecting)),
            last_sample: Arc::new(RwLock::new(None)),
            writer,
            command_timeout,
        }
    }

    pub fn address(&self) -> MacAddress {
        self.address
    }

    pub async fn state(&self) -> LinkState {
        *self.state.read().await
    }

    pub async fn set_state(&self, state: LinkState) {
        *self.state.write().await = state;
    }

    /// Most recent sample seen on this link
    pub async fn last_sample(&self) -> Option<TelemetrySample> {
        self.last_sample.read().await.clone()
    }

    pub async fn record_sample(&self, sample: &TelemetrySample) {
        *self.last_sample.write().await = Some(sample.clone());
    }

    /// Write a command to the sensor.
    ///
    /// Success means the frame left the local radio; the sensor does not
    /// acknowledge commands.
    pub async fn send_command(&self, command: SensorCommand) -> Result<(), SensorError> {
        if self.state().await != LinkState::Connected {
            return Err(SendError::NotConnected.into());
        }

        let frame = codec::encode_command(command);
        debug!("[BLE] Writing {:?} to {}", command, self.address);

        match timeout(self.command_timeout, self.writer.write(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SendError::Write(e.to_string()).into()),
            Err(_) => Err(SendError::Timeout(self.command_timeout.as_millis() as u64).into()),
        }
    }

    /// Mark the handle disconnected and release the BLE connection
    pub async fn close(&self) {
        self.set_state(LinkState::Disconnected).await;
        self.writer.disconnect().await;
    }
}

impl std::fmt::Debug for SensorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorHandle")
            .field("address", &self.address)
            .finish()
    }
}

/// Lazy, non-restartable sequence of samples from one connection.
///
/// Ends with `SensorError::LinkLost`; every later call returns the same.
pub struct SampleStream {
    rx: mpsc::Receiver<LinkEvent>,
    lost: Option<String>,
}

impl SampleStream {
    pub fn new(rx: mpsc::Receiver<LinkEvent>) -> Self {
        Self { rx, lost: None }
    }

    /// Wait for the next sample
    pub async fn next(&mut self) -> Result<TelemetrySample, SensorError> {
        if let Some(reason) = &self.lost {
            return Err(SensorError::LinkLost {
                reason: reason.clone(),
            });
        }

        let reason = match self.rx.recv().await {
            Some(LinkEvent::Sample(sample)) => return Ok(sample),
            Some(LinkEvent::Lost { reason }) => reason,
            None => "sample channel closed".to_string(),
        };

        self.lost = Some(reason.clone());
        self.rx.close();
        Err(SensorError::LinkLost { reason })
    }
}
