//! Sensor Mode State Machine
//!
//! Decides which cloud commands are valid in which sensor mode. Evaluation
//! is side-effect free; the caller commits a transition only after the
//! corresponding BLE command was written successfully, so a failed send
//! leaves the mode untouched.

use crate::{timing, Command, SensorCommand, SensorMode};

/// Why a command was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Learning started less than the learning delay ago
    LearningInProgress { remaining_ms: u64 },
    /// No completed learning phase since start-up or the last reset
    NoBaseline,
    /// Knowledge can only be reset from Idle
    NotQuiescent,
    /// Detection must be stopped before learning again
    DetectionActive,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::LearningInProgress { remaining_ms } => {
                write!(f, "learning in progress ({} ms remaining)", remaining_ms)
            }
            RejectReason::NoBaseline => write!(f, "no completed learning phase"),
            RejectReason::NotQuiescent => write!(f, "knowledge can only be reset from Idle"),
            RejectReason::DetectionActive => write!(f, "anomaly detection is active"),
        }
    }
}

/// Result of evaluating a command against the current mode
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Write `command` to the sensor, then commit `next`
    Send {
        command: SensorCommand,
        from: SensorMode,
        next: SensorMode,
    },
    /// Command is not allowed in the current mode
    Rejected {
        from: SensorMode,
        command: Command,
        reason: RejectReason,
    },
    /// Command is a no-op in the current mode (duplicate or irrelevant)
    Ignored { from: SensorMode, command: Command },
}

/// Client-side model of the sensor's operating mode
#[derive(Debug, Clone)]
pub struct ModeStateMachine {
    mode: SensorMode,
    learning_started_ms: Option<u64>,
    baseline_learned: bool,
    learning_delay_ms: u64,
}

impl Default for ModeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeStateMachine {
    /// Create a new state machine in Idle with the default learning delay
    pub fn new() -> Self {
        Self::with_learning_delay(timing::LEARNING_DELAY_MS)
    }

    pub fn with_learning_delay(learning_delay_ms: u64) -> Self {
        Self {
            mode: SensorMode::Idle,
            learning_started_ms: None,
            baseline_learned: false,
            learning_delay_ms,
        }
    }

    /// Get current mode
    pub fn mode(&self) -> SensorMode {
        self.mode
    }

    /// Whether a completed learning phase backs detection
    pub fn has_baseline(&self) -> bool {
        self.baseline_learned
    }

    /// Milliseconds left before the current learning phase counts as complete.
    /// `None` outside of Learning.
    pub fn learning_remaining_ms(&self, current_time_ms: u64) -> Option<u64> {
        if self.mode != SensorMode::Learning {
            return None;
        }
        let started = self.learning_started_ms?;
        let elapsed = current_time_ms.saturating_sub(started);
        Some(self.learning_delay_ms.saturating_sub(elapsed))
    }

    fn is_learning_complete(&self, current_time_ms: u64) -> bool {
        self.learning_remaining_ms(current_time_ms) == Some(0)
    }

    /// Evaluate a command without changing state
    pub fn evaluate(&self, command: Command, current_time_ms: u64) -> Transition {
        use Command::*;
        use SensorMode::*;

        let from = self.mode;
        let send = |sensor_cmd, next| Transition::Send {
            command: sensor_cmd,
            from,
            next,
        };
        let reject = |reason| Transition::Rejected {
            from,
            command,
            reason,
        };

        match (from, command) {
            (Idle, ActivateLearning) => send(SensorCommand::Learn, Learning),
            (Learning, ActivateLearning) => Transition::Ignored { from, command },
            (Detecting, ActivateLearning) => reject(RejectReason::DetectionActive),

            (Learning, ActivateAnomalyDetection) => {
                if self.is_learning_complete(current_time_ms) {
                    send(SensorCommand::Detect, Detecting)
                } else {
                    reject(RejectReason::LearningInProgress {
                        remaining_ms: self.learning_remaining_ms(current_time_ms).unwrap_or(0),
                    })
                }
            }
            (Idle, ActivateAnomalyDetection) if self.baseline_learned => {
                send(SensorCommand::Detect, Detecting)
            }
            (Idle, ActivateAnomalyDetection) => reject(RejectReason::NoBaseline),
            (Detecting, ActivateAnomalyDetection) => Transition::Ignored { from, command },

            (Detecting, StopAnomalyDetection) => send(SensorCommand::Stop, Idle),
            (Idle | Learning, StopAnomalyDetection) => Transition::Ignored { from, command },

            (Idle, ResetKnowledge) => send(SensorCommand::Reset, Idle),
            (Learning | Detecting, ResetKnowledge) => reject(RejectReason::NotQuiescent),
        }
    }

    /// Apply a transition whose sensor command was delivered.
    /// Non-`Send` transitions leave the state unchanged.
    pub fn commit(&mut self, transition: &Transition, current_time_ms: u64) {
        let Transition::Send { command, next, .. } = transition else {
            return;
        };

        match command {
            SensorCommand::Learn => {
                self.learning_started_ms = Some(current_time_ms);
            }
            SensorCommand::Detect => {
                if self.mode == SensorMode::Learning {
                    self.baseline_learned = true;
                }
                self.learning_started_ms = None;
            }
            SensorCommand::Stop => {}
            SensorCommand::Reset => {
                self.baseline_learned = false;
                self.learning_started_ms = None;
            }
        }

        self.mode = *next;
    }

    /// Evaluate and immediately commit. Convenience for callers without a
    /// side-effecting send step.
    pub fn process(&mut self, command: Command, current_time_ms: u64) -> Transition {
        let transition = self.evaluate(command, current_time_ms);
        self.commit(&transition, current_time_ms);
        transition
    }
}
