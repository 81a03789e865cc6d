//! Command dispatcher - applies cloud commands to the sensor through the
//! mode state machine

use neai_shared::state_machine::{ModeStateMachine, RejectReason, Transition};
use neai_shared::{Command, SensorCommand, SensorMode};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::cloud::{CloudSession, CommandAck, InboundCommand};
use crate::error::{SendError, SensorError};
use crate::sensor::SensorHandle;

/// Number of recently processed ack ids remembered for redelivery detection
const RECENT_ACK_WINDOW: usize = 64;

/// What happened to one inbound command
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Sensor command written and mode advanced
    Applied { from: SensorMode, to: SensorMode },
    /// Command had no effect in the current mode
    Ignored { mode: SensorMode },
    /// Command not allowed in the current mode
    Rejected { mode: SensorMode, reason: RejectReason },
    /// BLE write failed; mode unchanged
    SendFailed { mode: SensorMode, error: SensorError },
    /// Redelivery of an already processed command
    Duplicate,
}

impl DispatchOutcome {
    /// Acknowledgement for the cloud, if the command asked for one
    pub fn ack(&self, command: &InboundCommand, device_id: &str) -> Option<CommandAck> {
        let id = command.ack_id.as_deref()?;
        let name = command.command.name();
        let ack = match self {
            DispatchOutcome::Applied { to, .. } => {
                CommandAck::success(id, device_id, format!("{} applied, mode {}", name, to))
            }
            DispatchOutcome::Ignored { mode } => {
                CommandAck::success(id, device_id, format!("{} already in effect ({})", name, mode))
            }
            DispatchOutcome::Rejected { reason, .. } => {
                CommandAck::failed(id, device_id, format!("{} rejected: {}", name, reason))
            }
            DispatchOutcome::SendFailed { error, .. } => {
                CommandAck::failed(id, device_id, format!("{} not delivered: {}", name, error))
            }
            DispatchOutcome::Duplicate => return None,
        };
        Some(ack)
    }
}

/// Owns the sensor mode. Commands are processed one at a time; a command's
/// BLE write completes or fails before the next one is evaluated.
pub struct CommandDispatcher {
    fsm: ModeStateMachine,
    sensor: watch::Receiver<Option<SensorHandle>>,
    recent_acks: VecDeque<String>,
    mode_tx: watch::Sender<SensorMode>,
    epoch: Instant,
    learning_deadline: Option<Instant>,
    learning_delay: Duration,
}

impl CommandDispatcher {
    pub fn new(sensor: watch::Receiver<Option<SensorHandle>>, learning_delay: Duration) -> Self {
        let (mode_tx, _) = watch::channel(SensorMode::Idle);
        Self {
            fsm: ModeStateMachine::with_learning_delay(learning_delay.as_millis() as u64),
            sensor,
            recent_acks: VecDeque::with_capacity(RECENT_ACK_WINDOW),
            mode_tx,
            epoch: Instant::now(),
            learning_deadline: None,
            learning_delay,
        }
    }

    pub fn mode(&self) -> SensorMode {
        self.fsm.mode()
    }

    /// Read-only view of mode changes
    pub fn subscribe_mode(&self) -> watch::Receiver<SensorMode> {
        self.mode_tx.subscribe()
    }

    /// Monotonic milliseconds since the dispatcher was created
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn is_duplicate(&self, command: &InboundCommand) -> bool {
        match &command.ack_id {
            Some(id) => self.recent_acks.iter().any(|seen| seen == id),
            None => false,
        }
    }

    fn remember(&mut self, command: &InboundCommand) {
        if let Some(id) = &command.ack_id {
            if self.recent_acks.len() == RECENT_ACK_WINDOW {
                self.recent_acks.pop_front();
            }
            self.recent_acks.push_back(id.clone());
        }
    }

    /// Evaluate one command and, if it calls for it, write to the sensor
    pub async fn dispatch(&mut self, command: &InboundCommand) -> DispatchOutcome {
        if self.is_duplicate(command) {
            debug!("[DISPATCH] Dropping redelivered {}", command.command);
            return DispatchOutcome::Duplicate;
        }

        let now = self.now_ms();
        let transition = self.fsm.evaluate(command.command, now);

        let outcome = match &transition {
            Transition::Send {
                command: sensor_cmd,
                from,
                next,
            } => match self.send(*sensor_cmd).await {
                Ok(()) => {
                    // Timed from delivery, not from evaluation
                    let delivered = self.now_ms();
                    self.fsm.commit(&transition, delivered);
                    self.on_committed(*sensor_cmd);
                    info!("[DISPATCH] {}: {} -> {}", command.command, from, next);
                    DispatchOutcome::Applied {
                        from: *from,
                        to: *next,
                    }
                }
                Err(error) => {
                    warn!(
                        kind = error.kind(),
                        "[DISPATCH] {} not delivered, mode stays {}: {}", command.command, from, error
                    );
                    return DispatchOutcome::SendFailed { mode: *from, error };
                }
            },
            Transition::Rejected { from, reason, .. } => {
                warn!("[DISPATCH] {} rejected in {}: {}", command.command, from, reason);
                DispatchOutcome::Rejected {
                    mode: *from,
                    reason: reason.clone(),
                }
            }
            Transition::Ignored { from, .. } => {
                debug!("[DISPATCH] {} ignored in {}", command.command, from);
                DispatchOutcome::Ignored { mode: *from }
            }
        };

        self.remember(command);
        outcome
    }

    async fn send(&self, command: SensorCommand) -> Result<(), SensorError> {
        let handle = self.sensor.borrow().clone();
        match handle {
            Some(handle) => handle.send_command(command).await,
            None => Err(SendError::NotConnected.into()),
        }
    }

    fn on_committed(&mut self, command: SensorCommand) {
        self.learning_deadline = match command {
            SensorCommand::Learn => Some(Instant::now() + self.learning_delay),
            _ => None,
        };
        self.mode_tx.send_replace(self.fsm.mode());
    }

    /// Process commands until the queue closes or shutdown is signalled.
    /// Acknowledgements go out on whichever cloud session is current.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<InboundCommand>,
        session: watch::Receiver<Option<CloudSession>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("[DISPATCH] Started in {}", self.mode());

        while !*shutdown.borrow() {
            let deadline = self.learning_deadline;
            let learning_elapsed = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    let outcome = self.dispatch(&cmd).await;
                    acknowledge(&session, &cmd, &outcome).await;
                }

                _ = learning_elapsed => {
                    self.learning_deadline = None;
                    if self.mode() == SensorMode::Learning {
                        info!(
                            "[DISPATCH] Learning window of {}s elapsed, {} now accepted",
                            self.learning_delay.as_secs(),
                            Command::ActivateAnomalyDetection
                        );
                    }
                }
            }
        }

        info!("[DISPATCH] Stopped in {}", self.mode());
    }
}

async fn acknowledge(
    session: &watch::Receiver<Option<CloudSession>>,
    command: &InboundCommand,
    outcome: &DispatchOutcome,
) {
    let current = session.borrow().clone();
    let Some(session) = current else {
        return;
    };
    let Some(ack) = outcome.ack(command, session.device_id()) else {
        return;
    };
    if let Err(e) = session.acknowledge(&ack).await {
        warn!(kind = e.kind(), "[DISPATCH] Ack for {} not sent: {}", command.command, e);
    }
}
