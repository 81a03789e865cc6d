//! MQTT-over-TLS backend for the cloud channel

use anyhow::Result;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    TlsConfiguration, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::channel::{
    CloudChannel, CloudConnection, CloudSession, CommandStream, MessagePublisher, SessionEvent,
    SessionTopics,
};
use super::message::parse_command_payload;
use crate::config::{DeviceIdentity, RelayConfig};
use crate::error::CloudError;

/// Requests buffered between the client handle and the event loop
const REQUEST_CAPACITY: usize = 20;

/// Buffered inbound commands
const COMMAND_BUFFER: usize = 16;

/// Broker settings with topic templates still unexpanded
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub client_id: String,
    pub telemetry_topic: String,
    pub command_topic: String,
    pub ack_topic: String,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
}

impl MqttSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        let cloud = &config.cloud;
        Self {
            host: cloud.host.clone(),
            port: cloud.port,
            keep_alive: Duration::from_secs(cloud.keep_alive_secs),
            client_id: cloud.client_id.clone(),
            telemetry_topic: cloud.telemetry_topic.clone(),
            command_topic: cloud.command_topic.clone(),
            ack_topic: cloud.ack_topic.clone(),
            connect_timeout: config.connect_timeout(),
            publish_timeout: config.publish_timeout(),
        }
    }
}

/// Cloud channel backed by rumqttc
pub struct MqttCloudChannel {
    settings: MqttSettings,
}

impl MqttCloudChannel {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    fn options(&self, identity: &DeviceIdentity) -> MqttOptions {
        let client_id = identity.expand(&self.settings.client_id);
        let mut options = MqttOptions::new(client_id, &self.settings.host, self.settings.port);
        options.set_keep_alive(self.settings.keep_alive);
        options.set_clean_session(true);

        let certs = &identity.certificates;
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca: certs.ca_pem.clone(),
            alpn: None,
            client_auth: Some((certs.certificate_pem.clone(), certs.private_key_pem.clone())),
        }));
        options
    }
}

#[async_trait]
impl CloudChannel for MqttCloudChannel {
    async fn open(&self, identity: &DeviceIdentity) -> Result<CloudConnection, CloudError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(identity), REQUEST_CAPACITY);

        info!(
            "[MQTT] Connecting to {}:{} as {}",
            self.settings.host, self.settings.port, identity.unique_id
        );
        match timeout(self.settings.connect_timeout, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(CloudError::Network(format!(
                    "no CONNACK within {}s",
                    self.settings.connect_timeout.as_secs()
                )))
            }
        }

        let command_topic = identity.expand(&self.settings.command_topic);
        client
            .subscribe(command_topic.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| CloudError::Network(e.to_string()))?;

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(pump(eventloop, command_topic, tx));

        let topics = SessionTopics {
            telemetry: identity.expand(&self.settings.telemetry_topic),
            ack: identity.expand(&self.settings.ack_topic),
        };
        let publisher = Arc::new(MqttPublisher {
            client,
            telemetry_topic: topics.telemetry.clone(),
        });
        info!("[MQTT] Session open");

        Ok(CloudConnection {
            session: CloudSession::new(
                identity.unique_id.clone(),
                topics,
                publisher,
                self.settings.publish_timeout,
            ),
            commands: CommandStream::new(rx),
        })
    }

    fn name(&self) -> &'static str {
        "MQTT"
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), CloudError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(refused(code)),
                };
            }
            Ok(_) => {}
            Err(e) => return Err(classify(e)),
        }
    }
}

/// Drive the event loop and forward commands until the session drops
async fn pump(mut eventloop: EventLoop, command_topic: String, tx: mpsc::Sender<SessionEvent>) {
    let reason = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if p.topic != command_topic {
                    debug!("[MQTT] Ignoring message on {}", p.topic);
                    continue;
                }
                match parse_command_payload(&p.payload) {
                    Ok(cmd) => {
                        if tx.send(SessionEvent::Command(cmd)).await.is_err() {
                            break "consumer dropped".to_string();
                        }
                    }
                    Err(e) => warn!("[MQTT] Ignoring command: {}", e),
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => break "broker sent DISCONNECT".to_string(),
            Ok(_) => {}
            Err(e) => break classify(e).to_string(),
        }
    };

    let _ = tx.send(SessionEvent::Lost { reason }).await;
}

fn refused(code: ConnectReturnCode) -> CloudError {
    match code {
        ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword => {
            CloudError::Auth(format!("broker refused connection: {:?}", code))
        }
        _ => CloudError::Network(format!("broker refused connection: {:?}", code)),
    }
}

/// Translate rumqttc failures into the channel's error taxonomy
fn classify(err: ConnectionError) -> CloudError {
    match err {
        ConnectionError::ConnectionRefused(code) => refused(code),
        ConnectionError::Tls(e) => CloudError::Auth(format!("TLS: {}", e)),
        other => CloudError::Network(other.to_string()),
    }
}

struct MqttPublisher {
    client: AsyncClient,
    telemetry_topic: String,
}

#[async_trait]
impl MessagePublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        // Telemetry is a live view; acks must arrive
        let qos = if topic == self.telemetry_topic {
            QoS::AtMostOnce
        } else {
            QoS::AtLeastOnce
        };
        self.client.publish(topic, qos, false, payload).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("[MQTT] Disconnect failed: {}", e);
        }
    }
}
