//! Service supervisor - owns both links and restarts them independently

use neai_shared::{MacAddress, SensorMode, TelemetrySample};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info, warn};

use super::backoff::Backoff;
use crate::cloud::{CloudChannel, CloudConnection, CloudSession, InboundCommand};
use crate::command::CommandDispatcher;
use crate::config::{DeviceIdentity, RelayConfig};
use crate::error::ServiceError;
use crate::sensor::{SensorConnection, SensorHandle, SensorLink};
use crate::telemetry::{SampleSlot, TelemetryForwarder};

/// Commands buffered between the cloud stream and the dispatcher
const COMMAND_QUEUE: usize = 32;

/// How long shutdown waits for each task to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Process-wide context: validated config, device identity and the two
/// link factories. Passed explicitly to every loop it spawns.
pub struct Supervisor {
    config: RelayConfig,
    identity: DeviceIdentity,
    address: MacAddress,
    sensor_link: Arc<dyn SensorLink>,
    cloud: Arc<dyn CloudChannel>,
}

impl Supervisor {
    /// Validate the configuration and build the device identity.
    /// Nothing is connected until `run`.
    pub fn new(
        config: RelayConfig,
        sensor_link: Arc<dyn SensorLink>,
        cloud: Arc<dyn CloudChannel>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let address = config.mac_address()?;
        let identity = DeviceIdentity::from_config(&config)?;

        Ok(Self {
            config,
            identity,
            address,
            sensor_link,
            cloud,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Run until `shutdown` flips to true or a fatal error occurs.
    /// Both links are closed before returning.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServiceError> {
        info!(
            "[SUPERVISOR] Starting relay for {} (sensor {} via {}, cloud via {})",
            self.identity.unique_id,
            self.address,
            self.sensor_link.name(),
            self.cloud.name()
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let (sensor_tx, sensor_rx) = watch::channel::<Option<SensorHandle>>(None);
        let (session_tx, session_rx) = watch::channel::<Option<CloudSession>>(None);
        let (slot, slot_rx) = watch::channel::<Option<TelemetrySample>>(None);
        let (cmd_tx, cmd_rx) = mpsc::channel::<InboundCommand>(COMMAND_QUEUE);

        let dispatcher = CommandDispatcher::new(sensor_rx, self.config.learning_delay());
        let mode_rx = dispatcher.subscribe_mode();
        let forwarder =
            TelemetryForwarder::new(slot_rx, session_rx.clone(), self.config.publish_interval());

        let forwarder_stop = stop_rx.clone();
        let tasks = vec![
            tokio::spawn(dispatcher.run(cmd_rx, session_rx, stop_rx.clone())),
            tokio::spawn(async move {
                forwarder.run(forwarder_stop).await;
            }),
            tokio::spawn(sensor_loop(
                self.sensor_link.clone(),
                self.address,
                Backoff::from_config(&self.config.reconnect),
                sensor_tx,
                slot,
                stop_rx.clone(),
            )),
            tokio::spawn(log_mode_changes(mode_rx, stop_rx.clone())),
        ];

        let cloud = cloud_loop(
            self.cloud.clone(),
            &self.identity,
            Backoff::from_config(&self.config.reconnect),
            self.config.reconnect.max_auth_failures,
            session_tx,
            cmd_tx,
            stop_rx,
        );

        tokio::pin!(cloud);

        let finished = tokio::select! {
            result = &mut cloud => Some(result),
            _ = wait_for_shutdown(&mut shutdown) => None,
        };

        // The cloud loop closes its own session once it sees the stop flag
        let result = match finished {
            Some(result) => result,
            None => {
                info!("[SUPERVISOR] Shutdown requested");
                stop_tx.send_replace(true);
                match timeout(SHUTDOWN_GRACE, &mut cloud).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("[SUPERVISOR] Cloud session did not close within {:?}", SHUTDOWN_GRACE);
                        Ok(())
                    }
                }
            }
        };

        stop_tx.send_replace(true);
        for task in tasks {
            if timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("[SUPERVISOR] Task did not stop within {:?}", SHUTDOWN_GRACE);
            }
        }

        match &result {
            Ok(()) => info!("[SUPERVISOR] Stopped"),
            Err(e) => error!(kind = e.kind(), "[SUPERVISOR] Fatal: {}", e),
        }
        result
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Keep the sensor connected and feed its samples into the slot
async fn sensor_loop(
    link: Arc<dyn SensorLink>,
    address: MacAddress,
    mut backoff: Backoff,
    sensor_tx: watch::Sender<Option<SensorHandle>>,
    slot: SampleSlot,
    mut stop: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    while !*stop.borrow() {
        attempt += 1;
        let connected = tokio::select! {
            result = link.connect(address) => result,
            _ = stop.changed() => break,
        };

        match connected {
            Ok(SensorConnection {
                handle,
                mut samples,
            }) => {
                info!("[BLE] Sensor {} connected", handle.address());
                attempt = 0;
                sensor_tx.send_replace(Some(handle.clone()));
                let started = Instant::now();

                let lost = loop {
                    tokio::select! {
                        _ = stop.changed() => {
                            sensor_tx.send_replace(None);
                            handle.close().await;
                            return;
                        }
                        next = samples.next() => match next {
                            Ok(sample) => {
                                handle.record_sample(&sample).await;
                                slot.send_replace(Some(sample));
                            }
                            Err(e) => break e,
                        }
                    }
                };

                sensor_tx.send_replace(None);
                handle.close().await;
                backoff.connection_ended(started.elapsed());
                let last_tick = handle.last_sample().await.map(|s| s.sensor_tick);
                warn!(
                    kind = lost.kind(),
                    "[BLE] Sensor {}: {} (last sample {:?})", address, lost, last_tick
                );
            }
            Err(e) => {
                warn!(kind = e.kind(), attempt, "[BLE] Connect to {} failed: {}", address, e);
            }
        }

        let delay = backoff.next_delay();
        info!("[SUPERVISOR] Reconnecting sensor in {:?}", delay);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = stop.changed() => break,
        }
    }

    sensor_tx.send_replace(None);
}

/// Keep the cloud session open and feed inbound commands to the dispatcher.
/// Returns an error only when authentication keeps failing.
async fn cloud_loop(
    channel: Arc<dyn CloudChannel>,
    identity: &DeviceIdentity,
    mut backoff: Backoff,
    max_auth_failures: u32,
    session_tx: watch::Sender<Option<CloudSession>>,
    cmd_tx: mpsc::Sender<InboundCommand>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ServiceError> {
    let mut attempt: u32 = 0;
    let mut auth_failures: u32 = 0;

    while !*stop.borrow() {
        attempt += 1;
        let opened = tokio::select! {
            result = channel.open(identity) => result,
            _ = stop.changed() => break,
        };

        match opened {
            Ok(CloudConnection {
                session,
                mut commands,
            }) => {
                attempt = 0;
                auth_failures = 0;
                session_tx.send_replace(Some(session.clone()));
                let started = Instant::now();

                let lost = loop {
                    tokio::select! {
                        _ = stop.changed() => {
                            session_tx.send_replace(None);
                            session.close().await;
                            return Ok(());
                        }
                        next = commands.next() => match next {
                            Ok(cmd) => {
                                if cmd_tx.send(cmd).await.is_err() {
                                    session_tx.send_replace(None);
                                    session.close().await;
                                    return Ok(());
                                }
                            }
                            Err(e) => break e,
                        }
                    }
                };

                session_tx.send_replace(None);
                session.close().await;
                backoff.connection_ended(started.elapsed());
                warn!(kind = lost.kind(), "[MQTT] {}", lost);
            }
            Err(e) if e.is_auth() => {
                auth_failures += 1;
                error!(
                    kind = e.kind(),
                    attempt,
                    "[MQTT] Authentication failed ({}/{}): {}",
                    auth_failures,
                    max_auth_failures,
                    e
                );
                if auth_failures >= max_auth_failures {
                    return Err(ServiceError::Authentication {
                        attempts: auth_failures,
                        reason: e.to_string(),
                    });
                }
            }
            Err(e) => {
                warn!(kind = e.kind(), attempt, "[MQTT] Open failed: {}", e);
            }
        }

        let delay = backoff.next_delay();
        info!("[SUPERVISOR] Reopening cloud session in {:?}", delay);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = stop.changed() => break,
        }
    }

    session_tx.send_replace(None);
    Ok(())
}

async fn log_mode_changes(mut mode: watch::Receiver<SensorMode>, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = mode.changed() => {
                if changed.is_err() {
                    return;
                }
                info!("[SUPERVISOR] Sensor mode is now {}", *mode.borrow_and_update());
            }
            _ = stop.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CloudError, ConfigError};
    use crate::sensor::LinkEvent;
    use crate::test_support::{
        cert_files, sample, valid_config_toml, MockCloudChannel, MockSensorLink,
    };

    fn config(tag: &str) -> RelayConfig {
        let (cert, key) = cert_files(tag);
        RelayConfig::from_toml(&valid_config_toml(&cert, &key)).unwrap()
    }

    #[tokio::test]
    async fn test_missing_mac_fails_before_connecting() {
        let mut cfg = config("supervisor-nomac");
        cfg.sensor.mac_address = String::new();
        let sensor = Arc::new(MockSensorLink::new(vec![]));
        let cloud = Arc::new(MockCloudChannel::new());

        let err = Supervisor::new(cfg, sensor.clone(), cloud.clone())
            .err()
            .expect("config must be rejected");

        assert_eq!(err.kind(), "ConfigurationError");
        assert!(matches!(err, ServiceError::Configuration(ConfigError::Invalid(_))));
        assert_ne!(err.exit_code(), 0);
        assert_eq!(sensor.connect_count(), 0);
        assert_eq!(cloud.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resumes_without_duplicate() {
        let sensor = Arc::new(MockSensorLink::new(vec![
            vec![
                LinkEvent::Sample(sample(1, 91)),
                LinkEvent::Lost { reason: "device disconnected".into() },
            ],
            // Sensor re-reports its last value after reconnecting
            vec![LinkEvent::Sample(sample(1, 91)), LinkEvent::Sample(sample(2, 64))],
        ]));
        let cloud = Arc::new(MockCloudChannel::new());
        let supervisor = Supervisor::new(config("supervisor-reconnect"), sensor.clone(), cloud.clone()).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(supervisor.run(shutdown_rx));
        sleep(Duration::from_secs(5)).await;
        shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();

        assert_eq!(sensor.connect_count(), 2);
        let telemetry = cloud.telemetry().await;
        let ticks: Vec<u64> = telemetry.iter().map(|t| t["sensor_tick"].as_u64().unwrap()).collect();
        assert_eq!(ticks, vec![1, 2]);
        assert!(telemetry.iter().all(|t| t["device_id"] == "proteus01"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_auth_failure_is_fatal() {
        let sensor = Arc::new(MockSensorLink::new(vec![vec![LinkEvent::Sample(sample(1, 50))]]));
        let cloud = Arc::new(MockCloudChannel::failing(CloudError::Auth("certificate expired".into())));
        let supervisor = Supervisor::new(config("supervisor-auth"), sensor.clone(), cloud.clone()).unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let err = supervisor.run(shutdown_rx).await.unwrap_err();

        assert!(matches!(err, ServiceError::Authentication { attempts: 3, .. }));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(cloud.open_count(), 3);
        assert!(sensor.writer().disconnected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failures_are_retried() {
        let sensor = Arc::new(MockSensorLink::new(vec![]));
        let cloud = Arc::new(MockCloudChannel::failing(CloudError::Network("unreachable".into())));
        let supervisor = Supervisor::new(config("supervisor-network"), sensor, cloud.clone()).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(supervisor.run(shutdown_rx));
        // 1 + 2 + 4 + 8 seconds of backoff
        sleep(Duration::from_secs(16)).await;
        shutdown_tx.send_replace(true);

        assert!(task.await.unwrap().is_ok());
        assert_eq!(cloud.open_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_both_links() {
        let sensor = Arc::new(MockSensorLink::new(vec![vec![LinkEvent::Sample(sample(7, 99))]]));
        let cloud = Arc::new(MockCloudChannel::new());
        let supervisor = Supervisor::new(config("supervisor-shutdown"), sensor.clone(), cloud.clone()).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(supervisor.run(shutdown_rx));
        sleep(Duration::from_secs(1)).await;
        shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();

        assert!(sensor.writer().disconnected().await);
        assert_eq!(cloud.publisher().close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_is_reopened() {
        let sensor = Arc::new(MockSensorLink::new(vec![vec![LinkEvent::Sample(sample(1, 91))]]));
        let cloud = Arc::new(MockCloudChannel::new());
        let supervisor = Supervisor::new(config("supervisor-session-lost"), sensor.clone(), cloud.clone()).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(supervisor.run(shutdown_rx));
        sleep(Duration::from_secs(1)).await;
        assert_eq!(cloud.open_count(), 1);

        cloud.drop_session("keep-alive timeout").await;
        // Initial backoff is 1s
        sleep(Duration::from_secs(3)).await;
        assert_eq!(cloud.open_count(), 2);

        sensor.emit(LinkEvent::Sample(sample(2, 64)));
        sleep(Duration::from_secs(1)).await;
        shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();

        assert_eq!(sensor.connect_count(), 1);
        let ticks: Vec<u64> = cloud
            .telemetry()
            .await
            .iter()
            .map(|t| t["sensor_tick"].as_u64().unwrap())
            .collect();
        assert_eq!(ticks, vec![1, 2]);
        // The lost session and the reopened one
        assert_eq!(cloud.publisher().close_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_reach_the_sensor() {
        use neai_shared::{Command, SensorCommand};

        let sensor = Arc::new(MockSensorLink::new(vec![vec![]]));
        let cloud = Arc::new(MockCloudChannel::new());
        let supervisor = Supervisor::new(config("supervisor-commands"), sensor.clone(), cloud.clone()).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(supervisor.run(shutdown_rx));
        sleep(Duration::from_secs(1)).await;
        cloud
            .push_command(InboundCommand::with_ack(Command::ActivateLearning, "c-1"))
            .await;
        sleep(Duration::from_secs(1)).await;
        shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();

        assert_eq!(sensor.writer().frames().await, vec![vec![SensorCommand::Learn.opcode(), 0, 0, 0, 0]]);
        let acks = cloud.acks().await;
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0]["status"], 7);
    }
}
