//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the QC engine:
//! - Physical selectors (`SwitchState`, `Channel`)
//! - Stage identity and verdicts (`StageId`, `TestStatus`, `TestResult`)
//! - Safety limits (`SafetyRange`, `SafetyRanges`)
//! - The immutable run context (`SessionContext`)
//! - Error types (`QcError`)

use crate::stages::Diagnostics;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

// =============================================================================
// PHYSICAL SELECTORS
// =============================================================================

/// Position of the DIL switch bank on the board under test.
///
/// The same drive code maps to a different VCAN level depending on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchState {
    Off,
    On,
}

impl SwitchState {
    /// Both positions, in sweep order.
    pub const ALL: [SwitchState; 2] = [SwitchState::Off, SwitchState::On];

    #[must_use]
    pub fn is_on(self) -> bool {
        matches!(self, SwitchState::On)
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchState::Off => f.write_str("OFF"),
            SwitchState::On => f.write_str("ON"),
        }
    }
}

/// One of the two power channels. A is served by the master tester, B by the slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Channel {
    A,
    B,
}

impl Channel {
    pub const BOTH: [Channel; 2] = [Channel::A, Channel::B];

    /// Wire letter used in `READ_I2C_VOLTAGE_<ch>` and `I2C_VOLTAGE_<ch>:`.
    #[must_use]
    pub fn letter(self) -> char {
        match self {
            Channel::A => 'A',
            Channel::B => 'B',
        }
    }

    #[must_use]
    pub fn from_letter(c: char) -> Option<Self> {
        match c {
            'A' | 'a' => Some(Channel::A),
            'B' | 'b' => Some(Channel::B),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

// =============================================================================
// STAGE IDENTITY
// =============================================================================

/// Every stage the bench knows how to run.
///
/// This is the finite key of the dispatch table in [`crate::sequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    /// Setup & initial checks (also used, in short form, as the pre-check).
    InitialCheck,
    /// 256-code VCAN sweep with switches OFF then ON.
    Voltage,
    /// Current channel check at configured codes.
    Current,
    /// Master/slave temperature readout.
    Temperature,
    /// CAN and crosstalk test, short phase chained into long phase.
    Can,
    /// Soak at maximum safe voltage and current.
    Burnout,
    /// Long CAN run after the soak.
    CanPostBurnout,
}

impl StageId {
    pub const ALL: [StageId; 7] = [
        StageId::InitialCheck,
        StageId::Voltage,
        StageId::Current,
        StageId::Temperature,
        StageId::Can,
        StageId::Burnout,
        StageId::CanPostBurnout,
    ];

    /// Human-readable stage name, used as the log/report key.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            StageId::InitialCheck => "Initial Checks",
            StageId::Voltage => "Voltage Channels",
            StageId::Current => "Current Channels",
            StageId::Temperature => "Temperature Communication",
            StageId::Can => "CAN Communication",
            StageId::Burnout => "Burnout Test",
            StageId::CanPostBurnout => "CAN Communication (Post-Burnout)",
        }
    }

    /// Short identifier as used in config files and on the command line.
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            StageId::InitialCheck => "initial-check",
            StageId::Voltage => "voltage",
            StageId::Current => "current",
            StageId::Temperature => "temperature",
            StageId::Can => "can",
            StageId::Burnout => "burnout",
            StageId::CanPostBurnout => "can-post-burnout",
        }
    }

    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.key() == key)
    }

    /// Whether this stage drives voltage or current onto the board.
    #[must_use]
    pub fn energizes(&self) -> bool {
        matches!(
            self,
            StageId::Voltage
                | StageId::Current
                | StageId::Can
                | StageId::Burnout
                | StageId::CanPostBurnout
        )
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// VERDICTS
// =============================================================================

/// Final status of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Pass,
    Fail,
    /// Completed with a non-fatal defect (e.g. slave temperature sentinel).
    Partial,
    Skipped,
    /// Never started because its pre-check failed.
    Aborted,
}

impl TestStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pass => "PASS",
            TestStatus::Fail => "FAIL",
            TestStatus::Partial => "PARTIAL",
            TestStatus::Skipped => "SKIPPED",
            TestStatus::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a single attempted stage.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub stage: StageId,
    pub status: TestStatus,
    pub diagnostics: Diagnostics,
    /// Wall-clock completion time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl TestResult {
    #[must_use]
    pub fn new(stage: StageId, status: TestStatus, diagnostics: Diagnostics) -> Self {
        Self {
            stage,
            status,
            diagnostics,
            timestamp_ms: unix_millis(),
        }
    }

    /// True for the statuses that let a sequence continue.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self.status, TestStatus::Pass | TestStatus::Partial)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// SAFETY RANGES
// =============================================================================

/// Closed interval `[min, max]` for one measured quantity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyRange {
    pub min: f64,
    pub max: f64,
}

impl SafetyRange {
    #[must_use]
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Inclusive membership. NaN is never contained.
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        self.max - self.min
    }
}

impl fmt::Display for SafetyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:.3}, {:.3}]", self.min, self.max)
    }
}

/// The four limits every supervised reading is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyRanges {
    pub cic_voltage: SafetyRange,
    pub cic_current: SafetyRange,
    pub vcan_voltage: SafetyRange,
    pub vcan_current: SafetyRange,
}

// =============================================================================
// SESSION CONTEXT
// =============================================================================

/// Identity and limits of one test run. Built once, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct SessionContext {
    pub operator: String,
    pub serial_number: String,
    pub master_id: String,
    /// Lab supply voltage as reported by the tester, if it was queried.
    pub psu_voltage: Option<f64>,
    pub ranges: SafetyRanges,
}

impl SessionContext {
    #[must_use]
    pub fn new(
        operator: impl Into<String>,
        serial_number: impl Into<String>,
        master_id: impl Into<String>,
        ranges: SafetyRanges,
    ) -> Self {
        Self {
            operator: operator.into(),
            serial_number: serial_number.into(),
            master_id: master_id.into(),
            psu_voltage: None,
            ranges,
        }
    }

    #[must_use]
    pub fn with_psu_voltage(mut self, volts: f64) -> Self {
        self.psu_voltage = Some(volts);
        self
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the QC engine.
///
/// Only `Configuration` is fatal to a run; every other variant is caught by
/// the stage that hit it and turned into a FAIL or PARTIAL result.
#[derive(Debug, Error)]
pub enum QcError {
    /// No response line arrived before the deadline.
    #[error("Timeout after {timeout_ms} ms waiting for response to {command}")]
    ProtocolTimeout { command: String, timeout_ms: u64 },

    /// A line arrived but was not the expected response or could not be parsed.
    #[error("Protocol parse error: {0}")]
    ProtocolParse(String),

    /// A required configuration key is missing or malformed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A supervised reading left its safety range.
    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    /// The operator cancelled the run.
    #[error("Interrupted by user")]
    Interrupted,

    /// The transport failed.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for QcError {
    fn from(err: std::io::Error) -> Self {
        QcError::Io(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
