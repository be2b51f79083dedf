//! # vcanqc-core
//!
//! The QC engine for the CIC/VCAN power-delivery board - THE LOGIC.
//!
//! This crate talks to the embedded tester over a line-oriented serial
//! protocol, judges every reading against a calibrated tolerance model and
//! runs the test stages in a gated sequence.
//!
//! ## Layers
//!
//! - `protocol` / `link`: command and response codec over any [`Transport`]
//! - `tolerance`: code → expected voltage table, tolerance bands, ranges
//! - `stages`: one state machine per test, all returning a [`StageOutcome`]
//! - `sequence`: pre-check gating, abort-on-failure, result collection
//!
//! ## Architectural Constraints
//!
//! - Synchronous and single-threaded; every blocking point is cancellable
//! - No serial-port dependency; the binary supplies the transport
//! - Every energizing stage holds a [`PowerGuard`] until the board is at zero

// =============================================================================
// MODULES
// =============================================================================

pub mod cancel;
pub mod config;
pub mod link;
pub mod power;
pub mod protocol;
pub mod sequence;
pub mod sim;
pub mod stages;
pub mod tolerance;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use types::{
    Channel, QcError, SafetyRange, SafetyRanges, SessionContext, StageId, SwitchState, TestResult,
    TestStatus,
};

// =============================================================================
// RE-EXPORTS: Protocol and Link
// =============================================================================

pub use cancel::CancelToken;
pub use link::{ChannelReadings, DEFAULT_RESPONSE_TIMEOUT, SerialLink, Transport};
pub use power::PowerGuard;
pub use protocol::{AdcSnapshot, BurnoutParams, SerialCommand, SerialResponse};

// =============================================================================
// RE-EXPORTS: Evaluation
// =============================================================================

pub use config::{DEFAULT_SEQUENCE, QcConfig};
pub use tolerance::{
    Revision, ToleranceBand, ToleranceModel, ToleranceThresholds, VoltageCodeTable,
    range_from_nominal,
};

// =============================================================================
// RE-EXPORTS: Stages and Sequencing
// =============================================================================

pub use sequence::{
    ConfiguredStages, ResultSet, ResultSink, SequenceReport, SequenceState, SessionRequest,
    StageRunner, open_session, run_sequence, run_single,
};
pub use sim::SimulatedTester;
pub use stages::{Diagnostics, Operator, StageOutcome};
