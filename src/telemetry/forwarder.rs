//! Telemetry forwarder - republishes sensor samples to the cloud

use neai_shared::TelemetrySample;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cloud::CloudSession;

/// Write side of the single-sample slot between the sensor read loop and
/// the forwarder. Writing never waits; an unread sample is overwritten.
pub type SampleSlot = watch::Sender<Option<TelemetrySample>>;

/// Counters kept for the shutdown summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    pub published: u64,
    pub failed: u64,
    /// Skipped because the reading matched the last published one
    pub repeated: u64,
    /// Skipped because no cloud session was open
    pub offline: u64,
}

pub struct TelemetryForwarder {
    samples: watch::Receiver<Option<TelemetrySample>>,
    session: watch::Receiver<Option<CloudSession>>,
    interval: Duration,
    last_published: Option<TelemetrySample>,
    stats: ForwarderStats,
}

impl TelemetryForwarder {
    pub fn new(
        samples: watch::Receiver<Option<TelemetrySample>>,
        session: watch::Receiver<Option<CloudSession>>,
        interval: Duration,
    ) -> Self {
        Self {
            samples,
            session,
            interval,
            last_published: None,
            stats: ForwarderStats::default(),
        }
    }

    /// Forward one sample. Returns whether it was published.
    pub async fn forward(&mut self, sample: &TelemetrySample) -> bool {
        if let Some(last) = &self.last_published {
            if last.same_reading(sample) {
                debug!("[FORWARD] Reading {} already published", sample.sensor_tick);
                self.stats.repeated += 1;
                return false;
            }
        }

        let current = self.session.borrow().clone();
        let Some(session) = current else {
            debug!("[FORWARD] No cloud session, dropping sample {}", sample.sensor_tick);
            self.stats.offline += 1;
            return false;
        };

        match session.publish(sample).await {
            Ok(()) => {
                self.last_published = Some(sample.clone());
                self.stats.published += 1;
                true
            }
            Err(e) => {
                warn!(kind = e.kind(), "[FORWARD] Sample {} dropped: {}", sample.sensor_tick, e);
                self.stats.failed += 1;
                false
            }
        }
    }

    /// Publish the newest sample each time the slot changes. Samples that
    /// arrive while a publish is in flight collapse into the latest one.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ForwarderStats {
        info!("[FORWARD] Started");

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                changed = self.samples.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let latest = self.samples.borrow_and_update().clone();
                    if let Some(sample) = latest {
                        self.forward(&sample).await;
                        if !self.interval.is_zero() {
                            tokio::select! {
                                _ = sleep(self.interval) => {}
                                _ = shutdown.changed() => break,
                            }
                        }
                    }
                }
            }
        }

        info!(
            "[FORWARD] Stopped: {} published, {} failed, {} repeated, {} offline",
            self.stats.published, self.stats.failed, self.stats.repeated, self.stats.offline
        );
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample, test_session, RecordingPublisher};
    use std::sync::Arc;

    fn published_ticks(messages: &[(String, Vec<u8>)]) -> Vec<u64> {
        messages
            .iter()
            .map(|(_, payload)| {
                let json: serde_json::Value = serde_json::from_slice(payload).unwrap();
                json["sensor_tick"].as_u64().unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_forward_tags_and_skips_repeat() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (_session_tx, session_rx) = watch::channel(Some(test_session("gw-3", publisher.clone())));
        let (_slot, slot_rx) = watch::channel(None);
        let mut forwarder = TelemetryForwarder::new(slot_rx, session_rx, Duration::ZERO);

        let first = sample(1, 90);
        assert!(forwarder.forward(&first).await);

        // Same reading re-read after a reconnection
        let mut reread = first.clone();
        reread.received_at_ms += 30_000;
        assert!(!forwarder.forward(&reread).await);

        assert!(forwarder.forward(&sample(2, 88)).await);
        assert_eq!(forwarder.stats.published, 2);
        assert_eq!(forwarder.stats.repeated, 1);

        let messages = publisher.messages().await;
        assert_eq!(published_ticks(&messages), vec![1, 2]);
        for (_, payload) in &messages {
            let json: serde_json::Value = serde_json::from_slice(payload).unwrap();
            assert_eq!(json["device_id"], "gw-3");
        }
    }

    #[tokio::test]
    async fn test_no_session_drops_sample() {
        let (_session_tx, session_rx) = watch::channel(None);
        let (_slot, slot_rx) = watch::channel(None);
        let mut forwarder = TelemetryForwarder::new(slot_rx, session_rx, Duration::ZERO);

        assert!(!forwarder.forward(&sample(1, 50)).await);
        assert_eq!(forwarder.stats.offline, 1);
        assert!(forwarder.last_published.is_none());
    }

    #[tokio::test]
    async fn test_failed_publish_is_not_remembered() {
        let publisher = Arc::new(RecordingPublisher::failing());
        let (_session_tx, session_rx) = watch::channel(Some(test_session("gw-3", publisher)));
        let (_slot, slot_rx) = watch::channel(None);
        let mut forwarder = TelemetryForwarder::new(slot_rx, session_rx, Duration::ZERO);

        assert!(!forwarder.forward(&sample(1, 50)).await);
        assert!(forwarder.last_published.is_none());
        assert_eq!(forwarder.stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_publish_keeps_only_newest() {
        let publisher = Arc::new(RecordingPublisher::with_delay(Duration::from_millis(500)));
        let (_session_tx, session_rx) = watch::channel(Some(test_session("gw-3", publisher.clone())));
        let (slot, slot_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let forwarder = TelemetryForwarder::new(slot_rx, session_rx, Duration::ZERO);
        let task = tokio::spawn(forwarder.run(shutdown_rx));

        slot.send_replace(Some(sample(1, 90)));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Arrive while sample 1 is still publishing; the read path never waits
        slot.send_replace(Some(sample(2, 80)));
        slot.send_replace(Some(sample(3, 70)));

        tokio::time::sleep(Duration::from_secs(2)).await;
        shutdown_tx.send_replace(true);
        let stats = task.await.unwrap();

        assert_eq!(published_ticks(&publisher.messages().await), vec![1, 3]);
        assert_eq!(stats.published, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_interval_yields_to_shutdown() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (_session_tx, session_rx) = watch::channel(Some(test_session("gw-3", publisher.clone())));
        let (slot, slot_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let forwarder = TelemetryForwarder::new(slot_rx, session_rx, Duration::from_secs(60));
        let task = tokio::spawn(forwarder.run(shutdown_rx));

        slot.send_replace(Some(sample(1, 90)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown_tx.send_replace(true);

        let stats = tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .expect("forwarder must stop while throttled")
            .unwrap();
        assert_eq!(stats.published, 1);
    }
}
