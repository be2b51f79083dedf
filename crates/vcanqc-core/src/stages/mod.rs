//! # Test Stages
//!
//! The stage state machines and the shared outcome/diagnostics types.
//!
//! Every stage follows the same contract: it takes the immutable
//! [`SessionContext`], exclusive access to the link and its own typed
//! configuration section, and returns a [`StageOutcome`]. Stage-local errors
//! (timeouts, parse errors, safety violations, interruption) never escape a
//! stage; they are folded into a FAIL outcome whose diagnostics say why.
//!
//! Stages that energize the board hold a [`crate::power::PowerGuard`] for as
//! long as voltage or current may be present.

pub mod burnout;
pub mod can;
pub mod current;
pub mod initial;
pub mod temperature;
pub mod voltage;

pub use burnout::{BurnoutConfig, BurnoutMode, BurnoutReport};
pub use can::{BusBringUp, CanConfig, CanPhaseReport, CanReport};
pub use current::{CurrentConfig, CurrentReport, CurrentSample};
pub use initial::{InitialCheckConfig, InitialCheckReport};
pub use temperature::{TemperatureConfig, TemperatureReport};
pub use voltage::{CodeReadings, CodeSample, PassReport, VoltageConfig, VoltageReport};

use crate::types::{QcError, SessionContext, SwitchState, TestStatus};
use serde::Serialize;

// =============================================================================
// OPERATOR
// =============================================================================

/// The person (or fixture) at the bench.
///
/// Only the voltage sweep needs one: the DIL switches are physical and must
/// be flipped between the OFF and ON passes.
pub trait Operator {
    /// Put the switch bank into `state` and return once it is there.
    fn set_switches(&mut self, state: SwitchState) -> Result<(), QcError>;
}

// =============================================================================
// OUTCOME
// =============================================================================

/// Stage-specific diagnostic payload, handed to the result sink as is.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostics {
    None,
    InitialCheck(InitialCheckReport),
    Voltage(VoltageReport),
    Current(CurrentReport),
    Can(CanReport),
    Temperature(TemperatureReport),
    Burnout(BurnoutReport),
    Error { message: String },
}

impl Diagnostics {
    pub fn error(err: &QcError) -> Self {
        Diagnostics::Error {
            message: err.to_string(),
        }
    }
}

/// What a stage returns to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    /// Whether the sequence may continue.
    pub passed: bool,
    /// Status recorded for this stage.
    pub status: TestStatus,
    pub diagnostics: Diagnostics,
}

impl StageOutcome {
    #[must_use]
    pub fn pass(diagnostics: Diagnostics) -> Self {
        Self {
            passed: true,
            status: TestStatus::Pass,
            diagnostics,
        }
    }

    #[must_use]
    pub fn fail(diagnostics: Diagnostics) -> Self {
        Self {
            passed: false,
            status: TestStatus::Fail,
            diagnostics,
        }
    }

    /// PASS or FAIL depending on `passed`.
    #[must_use]
    pub fn from_verdict(passed: bool, diagnostics: Diagnostics) -> Self {
        if passed {
            Self::pass(diagnostics)
        } else {
            Self::fail(diagnostics)
        }
    }
}

/// Record `err` in a report's error slot, keeping the first one.
pub(crate) fn note_error(slot: &mut Option<String>, err: &QcError) {
    if slot.is_none() {
        *slot = Some(err.to_string());
    }
}

/// True if `err` means the operator asked to stop.
pub(crate) fn is_interrupt(err: &QcError) -> bool {
    matches!(err, QcError::Interrupted)
}

/// Log-friendly one-liner for a session, used in stage banners.
pub(crate) fn session_tag(ctx: &SessionContext) -> String {
    format!("{}@{}", ctx.serial_number, ctx.master_id)
}
