//! # Initial Check
//!
//! Repeated `CHECK_SPI_ADC` sampling against the session safety ranges.
//!
//! The full form runs as a stage of its own; the short form is the pre-check
//! the orchestrator runs before every other stage.

use super::{Diagnostics, StageOutcome, is_interrupt, note_error, session_tag};
use crate::link::{SerialLink, Transport};
use crate::protocol::AdcSnapshot;
use crate::types::{SafetyRanges, SessionContext};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Failure messages kept per check; later ones are only counted.
const MAX_FAILURE_NOTES: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct InitialCheckConfig {
    /// Sampling window of the full check.
    pub duration: Duration,
    /// Sampling window of the pre-check.
    pub pre_check_duration: Duration,
    pub poll_interval: Duration,
}

impl Default for InitialCheckConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5),
            pre_check_duration: Duration::from_secs(1),
            poll_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InitialCheckReport {
    pub pre_check: bool,
    pub ranges: SafetyRanges,
    pub samples: usize,
    pub failed_samples: usize,
    pub failures: Vec<String>,
    pub last: Option<AdcSnapshot>,
    pub error: Option<String>,
}

/// Full-length check, recorded as its own stage.
pub fn run<T: Transport>(
    ctx: &SessionContext,
    link: &mut SerialLink<T>,
    cfg: &InitialCheckConfig,
) -> StageOutcome {
    info!(session = %session_tag(ctx), duration_s = cfg.duration.as_secs_f64(), "initial check");
    check(ctx, link, cfg.duration, cfg.poll_interval, false)
}

/// Short-form check gating the next stage.
pub fn pre_check<T: Transport>(
    ctx: &SessionContext,
    link: &mut SerialLink<T>,
    cfg: &InitialCheckConfig,
) -> StageOutcome {
    check(ctx, link, cfg.pre_check_duration, cfg.poll_interval, true)
}

/// Names of the quantities in `snapshot` outside their range.
#[must_use]
pub fn out_of_range(ranges: &SafetyRanges, snapshot: &AdcSnapshot) -> Vec<&'static str> {
    let checks = [
        ("CIC V", ranges.cic_voltage.contains(snapshot.cic_v)),
        ("VCAN V", ranges.vcan_voltage.contains(snapshot.vcan_v)),
        ("CIC I", ranges.cic_current.contains(snapshot.cic_i)),
        ("VCAN I", ranges.vcan_current.contains(snapshot.vcan_i)),
    ];
    checks
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name)
        .collect()
}

fn check<T: Transport>(
    ctx: &SessionContext,
    link: &mut SerialLink<T>,
    duration: Duration,
    poll_interval: Duration,
    pre_check: bool,
) -> StageOutcome {
    let mut report = InitialCheckReport {
        pre_check,
        ranges: ctx.ranges,
        samples: 0,
        failed_samples: 0,
        failures: Vec::new(),
        last: None,
        error: None,
    };

    let start = Instant::now();
    loop {
        report.samples += 1;
        match link.read_adc() {
            Ok(snapshot) => {
                let bad = out_of_range(&ctx.ranges, &snapshot);
                if !bad.is_empty() {
                    report.failed_samples += 1;
                    push_note(&mut report.failures, format!("{} out of range", bad.join(", ")));
                    warn!(?snapshot, failing = %bad.join(", "), "readings out of range");
                }
                report.last = Some(snapshot);
            }
            Err(e) if is_interrupt(&e) => {
                note_error(&mut report.error, &e);
                break;
            }
            Err(e) => {
                report.failed_samples += 1;
                push_note(&mut report.failures, format!("invalid response: {}", e));
                warn!(error = %e, "invalid response from device");
            }
        }

        if start.elapsed() >= duration {
            break;
        }
        if let Err(e) = link.cancel_token().sleep(poll_interval) {
            note_error(&mut report.error, &e);
            break;
        }
    }

    let passed = report.failed_samples == 0 && report.error.is_none();
    if !pre_check {
        info!(
            samples = report.samples,
            failed = report.failed_samples,
            result = if passed { "PASS" } else { "FAIL" },
            "initial check complete"
        );
    } else if !passed {
        warn!(failed = report.failed_samples, "pre-check failed");
    }
    StageOutcome::from_verdict(passed, Diagnostics::InitialCheck(report))
}

fn push_note(notes: &mut Vec<String>, note: String) {
    if notes.len() < MAX_FAILURE_NOTES {
        notes.push(note);
    }
}

// =============================================================================
// TESTS
// =============================================================================
