//! Best-effort bootstrap of a freshly opened sensor
//!
//! The sequence is data: a list of [`PlannedStep`]s, each with an attempt
//! count, a pause before the retry and a settling pause after the step. The
//! standard plan is
//!
//! ```text
//! calibration, pause, firmware version, pause, serial, pause, calibration
//! ```
//!
//! with one retry per step after 500 ms. A step that still fails is logged and
//! the plan moves on, so a flaky sensor yields a partially populated device
//! rather than none. The [`BootstrapReport`] records what failed.

use crate::Result;
use crate::device::Device;
use std::fmt;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Pause before a retry and between steps
pub const DEFAULT_PAUSE: Duration = Duration::from_millis(500);

/// Attempts per step: the first try plus one retry
pub const DEFAULT_ATTEMPTS: u32 = 2;

/// A single bootstrap read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootstrapStep {
    Calibration,
    FirmwareVersion,
    Serial,
}

impl BootstrapStep {
    fn run(self, device: &mut Device) -> Result<()> {
        match self {
            BootstrapStep::Calibration => device.read_calibration().map(|_| ()),
            BootstrapStep::FirmwareVersion => device.read_firmware_version().map(|_| ()),
            BootstrapStep::Serial => device.read_serial().map(|_| ()),
        }
    }
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapStep::Calibration => f.write_str("calibration"),
            BootstrapStep::FirmwareVersion => f.write_str("version"),
            BootstrapStep::Serial => f.write_str("serial"),
        }
    }
}

/// One step of a plan with its retry policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub step: BootstrapStep,
    /// Total attempts, at least one
    pub attempts: u32,
    /// Pause before each retry
    pub retry_pause: Duration,
    /// Pause after the step, whatever its outcome
    pub settle: Duration,
}

impl PlannedStep {
    fn execute(&self, device: &mut Device) -> StepOutcome {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!("Reading {} of {}", self.step, device.uuid());

            match self.step.run(device) {
                Ok(()) => return StepOutcome::succeeded(self.step, attempt),
                Err(e) if attempt >= attempts => {
                    warn!(
                        "Error getting {} with retry of the device {}: {}",
                        self.step,
                        device.uuid(),
                        e
                    );
                    return StepOutcome::failed(self.step, attempt, e.to_string());
                }
                Err(e) => {
                    debug!("Retrying reading {} of {} after: {}", self.step, device.uuid(), e);
                    thread::sleep(self.retry_pause);
                }
            }
        }
    }
}

/// Ordered bootstrap sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPlan {
    steps: Vec<PlannedStep>,
}

impl BootstrapPlan {
    pub fn new(steps: Vec<PlannedStep>) -> Self {
        Self { steps }
    }

    /// Calibration, firmware version, serial, calibration again
    pub fn standard(retry_pause: Duration, settle: Duration, attempts: u32) -> Self {
        let sequence = [
            BootstrapStep::Calibration,
            BootstrapStep::FirmwareVersion,
            BootstrapStep::Serial,
            BootstrapStep::Calibration,
        ];
        let last = sequence.len() - 1;

        let steps = sequence
            .into_iter()
            .enumerate()
            .map(|(index, step)| PlannedStep {
                step,
                attempts,
                retry_pause,
                settle: if index == last { Duration::ZERO } else { settle },
            })
            .collect();

        Self { steps }
    }

    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    /// Run every step in order; never aborts early
    pub fn run(&self, device: &mut Device) -> BootstrapReport {
        let mut report = BootstrapReport::default();

        for planned in &self.steps {
            report.outcomes.push(planned.execute(device));
            if !planned.settle.is_zero() {
                thread::sleep(planned.settle);
            }
        }

        report
    }
}

impl Default for BootstrapPlan {
    fn default() -> Self {
        Self::standard(DEFAULT_PAUSE, DEFAULT_PAUSE, DEFAULT_ATTEMPTS)
    }
}

/// Result of one planned step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: BootstrapStep,
    /// Attempts actually made
    pub attempts: u32,
    /// Last error, if every attempt failed
    pub error: Option<String>,
}

impl StepOutcome {
    fn succeeded(step: BootstrapStep, attempts: u32) -> Self {
        Self {
            step,
            attempts,
            error: None,
        }
    }

    fn failed(step: BootstrapStep, attempts: u32, error: String) -> Self {
        Self {
            step,
            attempts,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// What a bootstrap run achieved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    outcomes: Vec<StepOutcome>,
}

impl BootstrapReport {
    pub fn outcomes(&self) -> &[StepOutcome] {
        &self.outcomes
    }

    /// Steps that never succeeded in any attempt of the run
    pub fn failed_steps(&self) -> Vec<BootstrapStep> {
        let mut failed = Vec::new();
        for outcome in &self.outcomes {
            let recovered = self
                .outcomes
                .iter()
                .any(|o| o.step == outcome.step && o.is_success());
            if !recovered && !failed.contains(&outcome.step) {
                failed.push(outcome.step);
            }
        }
        failed
    }

    /// Whether every field the plan reads was populated
    pub fn is_complete(&self) -> bool {
        self.failed_steps().is_empty()
    }
}
