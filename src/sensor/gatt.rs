//! BlueZ GATT backend for the sensor link

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Uuid};
use bytes::Bytes;
use futures::{pin_mut, StreamExt};
use neai_shared::{codec, MacAddress};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::link::{
    CommandWriter, LinkEvent, LinkState, SampleStream, SensorConnection, SensorHandle, SensorLink,
};
use crate::config::RelayConfig;
use crate::error::{ConfigError, SensorError};

/// NEAI anomaly-detection characteristic on ST BlueST firmware
pub const NEAI_AD_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00000019_0002_11e1_ac36_0002a5d5c51b);

/// Buffered notifications between the pump task and the consumer
const EVENT_BUFFER: usize = 32;

/// How often to re-check whether BlueZ finished service discovery
const SERVICES_POLL: Duration = Duration::from_millis(250);

/// Settings for the GATT backend
#[derive(Debug, Clone)]
pub struct GattConfig {
    /// Adapter name (e.g. "hci0"); default adapter when unset
    pub adapter: Option<String>,
    pub characteristic: Uuid,
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    /// Silence after which the link counts as lost
    pub stale_after: Duration,
    pub command_timeout: Duration,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            characteristic: NEAI_AD_CHARACTERISTIC,
            scan_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(15),
            stale_after: Duration::from_secs(30),
            command_timeout: Duration::from_secs(3),
        }
    }
}

impl GattConfig {
    pub fn from_config(config: &RelayConfig) -> Result<Self, ConfigError> {
        let characteristic = config
            .characteristic_uuid()?
            .unwrap_or(NEAI_AD_CHARACTERISTIC);

        Ok(Self {
            adapter: config.sensor.adapter.clone(),
            characteristic,
            scan_timeout: Duration::from_secs(config.sensor.scan_timeout_secs),
            connect_timeout: config.connect_timeout(),
            stale_after: config.stale_after(),
            command_timeout: config.command_timeout(),
        })
    }
}

/// Sensor link over BlueZ
pub struct GattSensorLink {
    config: GattConfig,
}

impl GattSensorLink {
    pub fn new(config: GattConfig) -> Self {
        Self { config }
    }

    /// Open a session and power on the configured adapter
    async fn adapter(&self) -> Result<Adapter> {
        let session = bluer::Session::new().await?;
        let adapter = match &self.config.adapter {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        adapter.set_powered(true).await?;
        Ok(adapter)
    }

    /// Make sure BlueZ knows the device, scanning for it if needed
    async fn find_device(&self, adapter: &Adapter, addr: Address) -> Result<Device> {
        if adapter.device_addresses().await?.contains(&addr) {
            return Ok(adapter.device(addr)?);
        }

        info!("[BLE] Scanning for {} ({}s)", addr, self.config.scan_timeout.as_secs());
        let discover = adapter.discover_devices().await?;
        pin_mut!(discover);

        let found = timeout(self.config.scan_timeout, async {
            while let Some(evt) = discover.next().await {
                if let AdapterEvent::DeviceAdded(seen) = evt {
                    if seen == addr {
                        return true;
                    }
                }
            }
            false
        })
        .await;

        match found {
            Ok(true) => Ok(adapter.device(addr)?),
            _ => Err(anyhow!("device {} not found during scan", addr)),
        }
    }

    async fn find_characteristic(&self, device: &Device) -> Result<Characteristic> {
        let resolved = timeout(self.config.connect_timeout, async {
            while !device.is_services_resolved().await? {
                sleep(SERVICES_POLL).await;
            }
            Ok::<_, bluer::Error>(())
        })
        .await;

        match resolved {
            Ok(result) => result?,
            Err(_) => return Err(anyhow!("service discovery timed out")),
        }

        for service in device.services().await? {
            for characteristic in service.characteristics().await? {
                if characteristic.uuid().await? == self.config.characteristic {
                    return Ok(characteristic);
                }
            }
        }

        Err(anyhow!("characteristic {} not found", self.config.characteristic))
    }

    async fn open(&self, address: MacAddress) -> Result<SensorConnection> {
        let addr = Address::new(address.octets());
        let adapter = self.adapter().await.context("adapter unavailable")?;
        let device = self.find_device(&adapter, addr).await?;

        if !device.is_connected().await? {
            info!("[BLE] Connecting to {}", addr);
            timeout(self.config.connect_timeout, device.connect())
                .await
                .map_err(|_| anyhow!("connect timed out"))??;
        }

        let characteristic = match self.find_characteristic(&device).await {
            Ok(c) => c,
            Err(e) => {
                let _ = device.disconnect().await;
                return Err(e);
            }
        };

        let writer = Arc::new(GattWriter {
            device: device.clone(),
            characteristic: characteristic.clone(),
        });
        let handle = SensorHandle::new(address, writer, self.config.command_timeout);

        handle.set_state(LinkState::Connected).await;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let pump_handle = handle.clone();
        let stale_after = self.config.stale_after;
        tokio::spawn(async move {
            let reason = match pump(device, characteristic, stale_after, &tx).await {
                Ok(reason) => reason,
                Err(e) => e.to_string(),
            };
            pump_handle.set_state(LinkState::Disconnected).await;
            let _ = tx.send(LinkEvent::Lost { reason }).await;
        });

        info!("[BLE] Connected to {}", addr);

        Ok(SensorConnection {
            handle,
            samples: SampleStream::new(rx),
        })
    }
}

#[async_trait]
impl SensorLink for GattSensorLink {
    async fn connect(&self, address: MacAddress) -> Result<SensorConnection, SensorError> {
        self.open(address)
            .await
            .map_err(|e| SensorError::Connection(format!("{:#}", e)))
    }

    fn name(&self) -> &'static str {
        "BlueZ GATT"
    }
}

/// Forward notifications until the link drops, the consumer goes away or
/// the sensor falls silent. Returns the reason the stream ended.
async fn pump(
    device: Device,
    characteristic: Characteristic,
    stale_after: Duration,
    tx: &mpsc::Sender<LinkEvent>,
) -> Result<String> {
    let notifications = characteristic.notify().await?;
    let events = device.events().await?;
    pin_mut!(notifications);
    pin_mut!(events);

    let mut deadline = Instant::now() + stale_after;

    loop {
        tokio::select! {
            data = notifications.next() => {
                let Some(data) = data else {
                    return Ok("notification stream ended".into());
                };
                deadline = Instant::now() + stale_after;

                match codec::decode_sample(&data) {
                    Ok(sample) => {
                        if tx.send(LinkEvent::Sample(sample)).await.is_err() {
                            return Ok("consumer dropped".into());
                        }
                    }
                    Err(e) => warn!("[BLE] Dropping malformed notification: {}", e),
                }
            }

            evt = events.next() => {
                match evt {
                    Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) => {
                        return Ok("device disconnected".into());
                    }
                    Some(_) => {}
                    None => return Ok("device event stream ended".into()),
                }
            }

            _ = tokio::time::sleep_until(deadline) => {
                debug!("[BLE] No notification for {:?}", stale_after);
                let _ = device.disconnect().await;
                return Ok(format!("no samples for {}s", stale_after.as_secs()));
            }
        }
    }
}

struct GattWriter {
    device: Device,
    characteristic: Characteristic,
}

#[async_trait]
impl CommandWriter for GattWriter {
    async fn write(&self, frame: Bytes) -> Result<()> {
        self.characteristic.write(&frame).await?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Err(e) = self.device.disconnect().await {
            debug!("[BLE] Disconnect failed: {}", e);
        }
    }
}
