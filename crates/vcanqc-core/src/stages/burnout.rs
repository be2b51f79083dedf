//! # Burnout (Soak) Test
//!
//! Holds the board at its maximum safe voltage code and current DAC for the
//! configured duration while watching both channels.
//!
//! ## Modes
//!
//! | Mode | Who polls | Abort trigger |
//! |------|-----------|---------------|
//! | `Host` | this process, once per `poll_interval` | missing reading, any value outside the session VCAN ranges, interruption |
//! | `Firmware` | the tester, via `RUN_BURNOUT_TEST` | `BURNOUT_FINAL:FAIL`, no verdict within `duration + grace`, interruption |
//!
//! In both modes the power guard zeroes voltage and current as the very last
//! action; in firmware mode an unfinished run is first stopped with the
//! all-zero `RUN_BURNOUT_TEST`.

use super::{Diagnostics, StageOutcome, is_interrupt, note_error, session_tag};
use crate::link::{ChannelReadings, SerialLink, Transport};
use crate::power::PowerGuard;
use crate::protocol::{BurnoutParams, BurnoutVerdict, SerialCommand, SerialResponse};
use crate::types::{QcError, SafetyRanges, SessionContext, StageId};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Progress lines kept in the report.
const MAX_PROGRESS_LINES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BurnoutMode {
    Host,
    Firmware,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BurnoutConfig {
    pub mode: BurnoutMode,
    pub duration: Duration,
    pub poll_interval: Duration,
    pub max_voltage_code: u8,
    pub max_current_dac: u16,
    /// Gap between the voltage and the current command.
    pub step_gap: Duration,
    /// Wait after both are set, before the first poll.
    pub settle: Duration,
    /// Extra time the firmware gets beyond `duration` to report.
    pub firmware_grace: Duration,
}

impl Default for BurnoutConfig {
    fn default() -> Self {
        Self {
            mode: BurnoutMode::Host,
            duration: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            max_voltage_code: 0xff,
            max_current_dac: 4095,
            step_gap: Duration::from_millis(100),
            settle: Duration::from_secs(1),
            firmware_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BurnoutReport {
    pub mode: BurnoutMode,
    pub duration_s: f64,
    pub max_voltage_code: u8,
    pub max_current_dac: u16,
    pub polls: usize,
    pub elapsed_s: f64,
    pub last: Option<ChannelReadings>,
    pub completed: bool,
    pub abort_reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub progress: Vec<String>,
    pub error: Option<String>,
}

/// Names of the channel quantities outside the session VCAN ranges.
#[must_use]
pub fn violations(ranges: &SafetyRanges, r: &ChannelReadings) -> Vec<String> {
    let v = ranges.vcan_voltage;
    let i = ranges.vcan_current;
    let checks = [
        ("V_A", r.v_a, v),
        ("I_A", r.i_a, i),
        ("V_B", r.v_b, v),
        ("I_B", r.i_b, i),
    ];
    checks
        .into_iter()
        .filter(|(_, value, range)| !range.contains(*value))
        .map(|(name, value, range)| format!("{} {:.3} outside {}", name, value, range))
        .collect()
}

/// Run the soak in the configured mode.
pub fn run<T: Transport>(
    ctx: &SessionContext,
    link: &mut SerialLink<T>,
    cfg: &BurnoutConfig,
) -> StageOutcome {
    info!(
        session = %session_tag(ctx),
        mode = ?cfg.mode,
        duration_s = cfg.duration.as_secs_f64(),
        code = %format!("{:#04x}", cfg.max_voltage_code),
        dac = cfg.max_current_dac,
        "burnout test"
    );
    let mut report = BurnoutReport {
        mode: cfg.mode,
        duration_s: cfg.duration.as_secs_f64(),
        max_voltage_code: cfg.max_voltage_code,
        max_current_dac: cfg.max_current_dac,
        polls: 0,
        elapsed_s: 0.0,
        last: None,
        completed: false,
        abort_reason: None,
        progress: Vec::new(),
        error: None,
    };

    let start = Instant::now();
    let result = match cfg.mode {
        BurnoutMode::Host => soak_host(ctx, link, cfg, &mut report),
        BurnoutMode::Firmware => soak_firmware(ctx, link, cfg, &mut report),
    };
    report.elapsed_s = start.elapsed().as_secs_f64();

    if let Err(e) = result {
        if is_interrupt(&e) {
            warn!("burnout test interrupted by user");
        } else {
            error!(error = %e, "burnout test aborted");
        }
        note_error(&mut report.error, &e);
    }

    let passed = report.completed && report.abort_reason.is_none() && report.error.is_none();
    info!(
        polls = report.polls,
        elapsed_s = report.elapsed_s,
        result = if passed { "PASS" } else { "FAIL" },
        "burnout test complete"
    );
    StageOutcome::from_verdict(passed, Diagnostics::Burnout(report))
}

fn soak_host<T: Transport>(
    ctx: &SessionContext,
    link: &mut SerialLink<T>,
    cfg: &BurnoutConfig,
    report: &mut BurnoutReport,
) -> Result<(), QcError> {
    let mut guard = PowerGuard::energize(link, StageId::Burnout);

    guard.set_vcan_voltage(cfg.max_voltage_code)?;
    guard.cancel_token().sleep(cfg.step_gap)?;
    guard.set_current_dac(cfg.max_current_dac)?;
    guard.cancel_token().sleep(cfg.settle)?;

    let end = Instant::now() + cfg.duration;
    while Instant::now() < end {
        guard.cancel_token().check()?;
        let readings = match guard.read_all_channels() {
            Ok(r) => r,
            Err(e) if is_interrupt(&e) => return Err(e),
            Err(e) => {
                error!(error = %e, poll = report.polls + 1, "failed to read sensor values");
                report.abort_reason = Some(format!("sensor read failed: {}", e));
                return guard.release();
            }
        };
        report.polls += 1;
        report.last = Some(readings);

        let bad = violations(&ctx.ranges, &readings);
        if !bad.is_empty() {
            error!(
                poll = report.polls,
                violations = %bad.join("; "),
                "measurement left the safe range"
            );
            report.abort_reason = Some(bad.join("; "));
            return guard.release();
        }
        debug!(
            poll = report.polls,
            remaining_s = end.saturating_duration_since(Instant::now()).as_secs(),
            v_a = readings.v_a,
            i_a = readings.i_a,
            v_b = readings.v_b,
            i_b = readings.i_b,
            "in progress"
        );

        let remaining = end.saturating_duration_since(Instant::now());
        guard.cancel_token().sleep(cfg.poll_interval.min(remaining))?;
    }

    report.completed = true;
    info!("all readings remained in range");
    guard.release()
}

fn soak_firmware<T: Transport>(
    ctx: &SessionContext,
    link: &mut SerialLink<T>,
    cfg: &BurnoutConfig,
    report: &mut BurnoutReport,
) -> Result<(), QcError> {
    let v = ctx.ranges.vcan_voltage;
    let i = ctx.ranges.vcan_current;
    let params = BurnoutParams {
        // whole seconds on the wire; 0 would mean stop
        duration_s: (cfg.duration.as_secs_f64().ceil() as u64).max(1),
        max_voltage_code: cfg.max_voltage_code,
        max_current_dac: cfg.max_current_dac,
        v_min: v.min,
        v_max: v.max,
        i_min: i.min,
        i_max: i.max,
    };

    let mut guard = PowerGuard::energize(link, StageId::Burnout);
    guard.drain()?;
    guard.send(&SerialCommand::RunBurnoutTest(params))?;
    guard.before_shutdown(SerialCommand::RunBurnoutTest(BurnoutParams::STOP));

    let deadline = Instant::now() + cfg.duration + cfg.firmware_grace;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match guard.receive(remaining) {
            Ok(SerialResponse::BurnoutProgress(text)) => {
                report.polls += 1;
                debug!(progress = %text, "burnout progress");
                if report.progress.len() < MAX_PROGRESS_LINES {
                    report.progress.push(text);
                }
            }
            Ok(SerialResponse::BurnoutFinal(verdict)) => {
                guard.clear_before_shutdown();
                match verdict {
                    BurnoutVerdict::Complete => {
                        info!("firmware reports burnout complete, all values in range");
                        report.completed = true;
                    }
                    BurnoutVerdict::Fail(reason) => {
                        error!(reason = %reason, "firmware reported a failure");
                        report.abort_reason = Some(reason);
                    }
                }
                break;
            }
            Ok(other) => debug!(got = other.tag(), "ignoring line during burnout"),
            Err(QcError::ProtocolParse(msg)) => debug!(error = %msg, "ignoring malformed line"),
            Err(QcError::ProtocolTimeout { .. }) => {
                error!("no completion message from firmware");
                report.abort_reason = Some("timeout waiting for BURNOUT_FINAL".to_string());
                break;
            }
            Err(e) => return Err(e),
        }
    }

    guard.release()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SafetyRange;

    fn ranges() -> SafetyRanges {
        SafetyRanges {
            cic_voltage: SafetyRange::new(2.97, 3.63),
            cic_current: SafetyRange::new(0.05, 0.2),
            vcan_voltage: SafetyRange::new(3.0, 3.6),
            vcan_current: SafetyRange::new(0.0, 0.5),
        }
    }

    #[test]
    fn readings_inside_ranges_have_no_violations() {
        let r = ChannelReadings {
            v_a: 3.3,
            i_a: 0.3,
            v_b: 3.3,
            i_b: 0.3,
        };
        assert!(violations(&ranges(), &r).is_empty());
    }

    #[test]
    fn every_channel_quantity_is_checked() {
        let r = ChannelReadings {
            v_a: 4.0,
            i_a: 0.3,
            v_b: 3.3,
            i_b: 0.6,
        };
        let bad = violations(&ranges(), &r);
        assert_eq!(bad.len(), 2);
        assert!(bad[0].starts_with("V_A"));
        assert!(bad[1].starts_with("I_B"));
    }
}
