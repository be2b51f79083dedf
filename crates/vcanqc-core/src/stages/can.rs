//! # CAN Test
//!
//! Firmware-driven CAN and crosstalk exchange between the two channels.
//!
//! The host asks for `n` messages with `RUN_CAN_TEST <n>` and then listens:
//! any number of `CAN_TEST_PROGRESS` lines, then one
//! `CAN_TEST_FINAL:PASS|FAIL:<detail>`, all within
//! `base_timeout + per_message · n`. Silence past the deadline is a FAIL.
//!
//! The regular stage chains a short phase into a long one (long only if
//! short passed); the post-burnout stage runs the long phase alone. An
//! optional bring-up sets and verifies the bus voltage before any message
//! is sent. The bus is powered down afterwards whatever happened.

use super::{Diagnostics, StageOutcome, is_interrupt, note_error, session_tag};
use crate::link::{SerialLink, Transport};
use crate::power::PowerGuard;
use crate::protocol::{SerialCommand, SerialResponse};
use crate::types::{QcError, SessionContext, StageId};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Full-scale bus voltage of the linear code estimate.
pub const BUS_V_MAX: f64 = 3.3;

/// Progress lines kept per phase.
const MAX_PROGRESS_LINES: usize = 64;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Bus voltage to establish before the first message.
#[derive(Debug, Clone, PartialEq)]
pub struct BusBringUp {
    pub code: u8,
    /// Level both `VCAN_DATA` readings must reach.
    pub target_v: f64,
    pub settle: Duration,
    pub tolerance_v: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanConfig {
    pub short_messages: u32,
    pub long_messages: u32,
    pub base_timeout: Duration,
    pub per_message: Duration,
    /// Pause between the short and the long phase.
    pub phase_gap: Duration,
    pub bring_up: Option<BusBringUp>,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            short_messages: 10,
            long_messages: 1000,
            base_timeout: Duration::from_secs(5),
            per_message: Duration::from_millis(100),
            phase_gap: Duration::from_secs(1),
            bring_up: None,
        }
    }
}

impl CanConfig {
    /// Deadline for a run of `messages`, saturating at `Duration::MAX`.
    #[must_use]
    pub fn timeout_for(&self, messages: u32) -> Duration {
        self.per_message
            .checked_mul(messages)
            .map_or(Duration::MAX, |per_run| self.base_timeout.saturating_add(per_run))
    }
}

/// Drive code for a bus voltage target.
///
/// The six level bits are a linear fraction of [`BUS_V_MAX`]; both
/// power-enable bits are set. Targets outside `(0, BUS_V_MAX]` give `0`.
#[must_use]
pub fn voltage_code_for_target(target_v: f64) -> u8 {
    if !(target_v > 0.0 && target_v <= BUS_V_MAX) {
        return 0;
    }
    let bits = ((target_v / BUS_V_MAX) * 63.0) as u8;
    (bits << 2) | 0x03
}

// =============================================================================
// REPORT
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct BringUpReport {
    pub code: u8,
    pub target_v: f64,
    pub v_a: Option<f64>,
    pub v_b: Option<f64>,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanPhaseReport {
    pub messages: u32,
    pub timeout_ms: u64,
    pub progress: Vec<String>,
    pub passed: bool,
    pub timed_out: bool,
    /// Detail text of the final line, or why there was none.
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CanReport {
    pub bring_up: Option<BringUpReport>,
    pub phases: Vec<CanPhaseReport>,
    pub error: Option<String>,
}

// =============================================================================
// STAGE
// =============================================================================

/// Short phase, then long phase if the short one passed.
pub fn run<T: Transport>(
    ctx: &SessionContext,
    link: &mut SerialLink<T>,
    cfg: &CanConfig,
) -> StageOutcome {
    run_phases(
        ctx,
        link,
        cfg,
        StageId::Can,
        &[cfg.short_messages, cfg.long_messages],
    )
}

/// Long phase only, after the soak.
pub fn run_post_burnout<T: Transport>(
    ctx: &SessionContext,
    link: &mut SerialLink<T>,
    cfg: &CanConfig,
) -> StageOutcome {
    run_phases(ctx, link, cfg, StageId::CanPostBurnout, &[cfg.long_messages])
}

/// Run `phases` in order, stopping at the first one that does not pass.
pub fn run_phases<T: Transport>(
    ctx: &SessionContext,
    link: &mut SerialLink<T>,
    cfg: &CanConfig,
    stage: StageId,
    phases: &[u32],
) -> StageOutcome {
    info!(session = %session_tag(ctx), stage = %stage, ?phases, "CAN test");
    let mut report = CanReport::default();

    if let Err(e) = execute(link, cfg, stage, phases, &mut report) {
        warn!(error = %e, "CAN test stopped");
        note_error(&mut report.error, &e);
    }

    let bring_up_ok = report.bring_up.as_ref().is_none_or(|b| b.ok);
    let passed = report.error.is_none()
        && bring_up_ok
        && report.phases.len() == phases.len()
        && report.phases.iter().all(|p| p.passed);
    info!(result = if passed { "PASS" } else { "FAIL" }, "CAN test complete");
    StageOutcome::from_verdict(passed, Diagnostics::Can(report))
}

fn execute<T: Transport>(
    link: &mut SerialLink<T>,
    cfg: &CanConfig,
    stage: StageId,
    phases: &[u32],
    report: &mut CanReport,
) -> Result<(), QcError> {
    let mut guard = PowerGuard::energize(link, stage);

    if let Some(bring_up) = &cfg.bring_up {
        let result = bring_up_bus(&mut *guard, bring_up)?;
        let ok = result.ok;
        report.bring_up = Some(result);
        if !ok {
            warn!(target_v = bring_up.target_v, "bus voltage did not settle within tolerance");
            return guard.release();
        }
    }

    for (i, &messages) in phases.iter().enumerate() {
        if i > 0 {
            guard.cancel_token().sleep(cfg.phase_gap)?;
        }
        info!(phase = i + 1, messages, "CAN phase");
        let phase = run_phase(&mut *guard, cfg, messages)?;
        let passed = phase.passed;
        report.phases.push(phase);
        if !passed {
            warn!(phase = i + 1, messages, "CAN phase failed");
            break;
        }
    }

    guard.release()
}

fn bring_up_bus<T: Transport>(
    link: &mut SerialLink<T>,
    bring_up: &BusBringUp,
) -> Result<BringUpReport, QcError> {
    info!(
        target_v = bring_up.target_v,
        code = %format!("{:#04x}", bring_up.code),
        "setting bus voltage"
    );
    link.drain()?;
    link.send(&SerialCommand::SetVcanVoltage(bring_up.code))?;
    link.cancel_token().sleep(bring_up.settle)?;

    let timeout = link.response_timeout();
    let (v_a, v_b) = match link.receive(timeout) {
        Ok(SerialResponse::VcanData { a, b }) => (Some(a), Some(b)),
        Ok(other) => {
            warn!(got = other.tag(), "no VCAN_DATA confirmation");
            (None, None)
        }
        Err(e) if is_interrupt(&e) => return Err(e),
        Err(e) => {
            warn!(error = %e, "no VCAN_DATA confirmation");
            (None, None)
        }
    };
    let within = |v: Option<f64>| v.is_some_and(|v| (v - bring_up.target_v).abs() <= bring_up.tolerance_v);
    Ok(BringUpReport {
        code: bring_up.code,
        target_v: bring_up.target_v,
        v_a,
        v_b,
        ok: within(v_a) && within(v_b),
    })
}

fn run_phase<T: Transport>(
    link: &mut SerialLink<T>,
    cfg: &CanConfig,
    messages: u32,
) -> Result<CanPhaseReport, QcError> {
    let timeout = cfg.timeout_for(messages);
    let mut phase = CanPhaseReport {
        messages,
        timeout_ms: timeout.as_millis() as u64,
        progress: Vec::new(),
        passed: false,
        timed_out: false,
        detail: String::new(),
    };

    link.drain()?;
    link.send(&SerialCommand::RunCanTest(messages))?;
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            phase.timed_out = true;
            break;
        }
        match link.receive(remaining) {
            Ok(SerialResponse::CanProgress(text)) => {
                debug!(progress = %text, "CAN progress");
                if phase.progress.len() < MAX_PROGRESS_LINES {
                    phase.progress.push(text);
                }
            }
            Ok(SerialResponse::CanFinal { passed, detail }) => {
                info!(passed, detail = %detail, "firmware verdict");
                phase.passed = passed;
                phase.detail = detail;
                return Ok(phase);
            }
            Ok(other) => debug!(got = other.tag(), "ignoring line during CAN test"),
            Err(QcError::ProtocolTimeout { .. }) => {
                phase.timed_out = true;
                break;
            }
            Err(QcError::ProtocolParse(msg)) => debug!(error = %msg, "ignoring malformed line"),
            Err(e) => return Err(e),
        }
    }

    warn!(
        messages,
        timeout_s = timeout.as_secs_f64(),
        "timeout, no final status from firmware"
    );
    phase.detail = format!(
        "timeout after {:.1} s waiting for CAN_TEST_FINAL",
        timeout.as_secs_f64()
    );
    Ok(phase)
}

// =============================================================================
// TESTS
// =============================================================================
