//! # Current Check
//!
//! For each configured voltage code: confirm the rail is stable, command the
//! current sink, let it settle, and require both channels' measured current
//! to fall inside the configured band.
//!
//! An unstable rail or a missing acknowledgement fails only that iteration.
//! A reading above the session's VCAN current limit is a safety violation
//! and ends the stage at once. Current and voltage return to zero on every
//! exit path.

use super::voltage::CodeReadings;
use super::{Diagnostics, StageOutcome, is_interrupt, note_error, session_tag};
use crate::link::{SerialLink, Transport};
use crate::power::PowerGuard;
use crate::tolerance::{ToleranceBand, VoltageCodeTable};
use crate::types::{Channel, QcError, SafetyRange, SessionContext, StageId, SwitchState};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// Full-scale count of the 12-bit current DAC.
pub const DAC_FULL_SCALE: u16 = 4095;

#[derive(Debug, Clone, PartialEq)]
pub struct CurrentConfig {
    pub r_ref_ohms: f64,
    pub v_ref_dac_volts: f64,
    pub voltage_codes: Vec<u8>,
    /// Switch position the codes are evaluated with.
    pub switches: SwitchState,
    pub target_current_a: f64,
    /// Accepted measured current on both channels.
    pub current_band: SafetyRange,
    pub settle: Duration,
    /// Absolute tolerance of the pre-current voltage check, all four readings.
    pub voltage_tolerance_v: f64,
}

/// DAC count for a target current: `round(clamp(I · R · 4095 / V, 0, 4095))`.
#[must_use]
pub fn dac_for_current(current_a: f64, r_ref_ohms: f64, v_ref_dac_volts: f64) -> u16 {
    let full = f64::from(DAC_FULL_SCALE);
    let raw = current_a * r_ref_ohms * full / v_ref_dac_volts;
    if raw.is_nan() {
        return 0;
    }
    raw.clamp(0.0, full).round() as u16
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentSample {
    pub code: u8,
    pub expected_v: f64,
    pub voltage: CodeReadings,
    pub voltage_ok: bool,
    pub current_ack: bool,
    pub i_a: Option<f64>,
    pub i_b: Option<f64>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl CurrentSample {
    fn new(code: u8, expected_v: f64) -> Self {
        Self {
            code,
            expected_v,
            voltage: CodeReadings::default(),
            voltage_ok: false,
            current_ack: false,
            i_a: None,
            i_b: None,
            passed: false,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentReport {
    pub target_current_a: f64,
    pub dac: u16,
    pub band: SafetyRange,
    pub samples: Vec<CurrentSample>,
    pub error: Option<String>,
}

impl CurrentReport {
    #[must_use]
    pub fn failed(&self) -> usize {
        self.samples.iter().filter(|s| !s.passed).count()
    }
}

/// Run the current check over every configured code.
pub fn run<T: Transport>(
    ctx: &SessionContext,
    link: &mut SerialLink<T>,
    table: &VoltageCodeTable,
    cfg: &CurrentConfig,
) -> StageOutcome {
    let dac = dac_for_current(cfg.target_current_a, cfg.r_ref_ohms, cfg.v_ref_dac_volts);
    let ceiling = cfg.v_ref_dac_volts / cfg.r_ref_ohms;
    if cfg.target_current_a > ceiling {
        warn!(
            requested_ma = cfg.target_current_a * 1000.0,
            max_ma = ceiling * 1000.0,
            "requested current above sink capability"
        );
    }
    info!(
        session = %session_tag(ctx),
        target_ma = cfg.target_current_a * 1000.0,
        dac,
        codes = cfg.voltage_codes.len(),
        "current check"
    );

    let mut report = CurrentReport {
        target_current_a: cfg.target_current_a,
        dac,
        band: cfg.current_band,
        samples: Vec::with_capacity(cfg.voltage_codes.len()),
        error: None,
    };

    if let Err(e) = check_codes(ctx, link, table, cfg, dac, &mut report) {
        warn!(error = %e, "current check stopped");
        note_error(&mut report.error, &e);
    }

    let passed = report.error.is_none() && report.failed() == 0;
    info!(
        passed = report.samples.len() - report.failed(),
        failed = report.failed(),
        "current check summary"
    );
    StageOutcome::from_verdict(passed, Diagnostics::Current(report))
}

fn check_codes<T: Transport>(
    ctx: &SessionContext,
    link: &mut SerialLink<T>,
    table: &VoltageCodeTable,
    cfg: &CurrentConfig,
    dac: u16,
    report: &mut CurrentReport,
) -> Result<(), QcError> {
    let mut guard = PowerGuard::energize(link, StageId::Current);

    for &code in &cfg.voltage_codes {
        guard.cancel_token().check()?;
        let expected_v = table.voltage_for_code(code, cfg.switches);
        let band = ToleranceBand {
            expected: expected_v,
            tolerance: cfg.voltage_tolerance_v,
        };
        report.samples.push(CurrentSample::new(code, expected_v));
        let Some(sample) = report.samples.last_mut() else {
            continue;
        };

        // 1. rail stability
        match guard.set_vcan_voltage(code) {
            Ok((a, b)) => {
                sample.voltage.spi_a = Some(a);
                sample.voltage.spi_b = Some(b);
            }
            Err(e) => soft(e, &mut sample.errors)?,
        }
        for ch in Channel::BOTH {
            match guard.read_i2c_voltage(ch) {
                Ok(v) => match ch {
                    Channel::A => sample.voltage.i2c_a = Some(v),
                    Channel::B => sample.voltage.i2c_b = Some(v),
                },
                Err(e) => soft(e, &mut sample.errors)?,
            }
        }
        let v = sample.voltage;
        sample.voltage_ok = [v.spi_a, v.spi_b, v.i2c_a, v.i2c_b]
            .into_iter()
            .all(|r| r.is_some_and(|x| band.accepts(x)));
        if !sample.voltage_ok {
            warn!(
                code = %format!("{:#04x}", code),
                expected_v,
                readings = ?v,
                "voltage not stable before current test"
            );
            continue;
        }

        // 2. command current
        match guard.set_current_dac(dac) {
            Ok(()) => sample.current_ack = true,
            Err(e) => {
                soft(e, &mut sample.errors)?;
                warn!(code = %format!("{:#04x}", code), "no acknowledgement for current set");
                continue;
            }
        }
        guard.cancel_token().sleep(cfg.settle)?;

        // 3. measure
        match guard.read_master_spi() {
            Ok((_, i_a)) => sample.i_a = Some(i_a),
            Err(e) => soft(e, &mut sample.errors)?,
        }
        match guard.read_adc() {
            Ok(snapshot) => sample.i_b = Some(snapshot.vcan_i),
            Err(e) => soft(e, &mut sample.errors)?,
        }

        let limit = ctx.ranges.vcan_current.max;
        for (ch, reading) in [(Channel::A, sample.i_a), (Channel::B, sample.i_b)] {
            if let Some(i) = reading.filter(|i| *i > limit) {
                return Err(QcError::SafetyViolation(format!(
                    "channel {} current {:.1} mA above limit {:.1} mA",
                    ch,
                    i * 1000.0,
                    limit * 1000.0
                )));
            }
        }

        let in_band = |r: Option<f64>| r.is_some_and(|i| cfg.current_band.contains(i));
        sample.passed = in_band(sample.i_a) && in_band(sample.i_b);
        if sample.passed {
            info!(
                code = %format!("{:#04x}", code),
                i_a_ma = sample.i_a.unwrap_or_default() * 1000.0,
                i_b_ma = sample.i_b.unwrap_or_default() * 1000.0,
                "currents ok"
            );
        } else {
            warn!(
                code = %format!("{:#04x}", code),
                i_a = ?sample.i_a,
                i_b = ?sample.i_b,
                band = %cfg.current_band,
                "currents out of range"
            );
        }
    }

    guard.release()
}

/// Record a non-fatal error against the sample; interruption propagates.
fn soft(err: QcError, errors: &mut Vec<String>) -> Result<(), QcError> {
    if is_interrupt(&err) {
        return Err(err);
    }
    errors.push(err.to_string());
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dac_rounds_to_nearest() {
        // 0.1 A · 10 Ω · 4095 / 3.3 V = 1240.9
        assert_eq!(dac_for_current(0.1, 10.0, 3.3), 1241);
        assert_eq!(dac_for_current(0.0, 10.0, 3.3), 0);
    }

    #[test]
    fn dac_is_clamped() {
        assert_eq!(dac_for_current(10.0, 10.0, 3.3), DAC_FULL_SCALE);
        assert_eq!(dac_for_current(-1.0, 10.0, 3.3), 0);
        assert_eq!(dac_for_current(f64::NAN, 10.0, 3.3), 0);
    }
}
