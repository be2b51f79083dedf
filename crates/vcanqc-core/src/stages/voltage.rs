//! # Voltage Sweep
//!
//! Drives every code `0x00..=0xFF` with the switch bank OFF, then ON, and
//! checks both channels on both measurement paths.
//!
//! ## Per code
//!
//! 1. `SET_VCAN_VOLTAGE <code>` → `VCAN_DATA:a,b` (fast SPI path)
//! 2. `READ_I2C_VOLTAGE_A`, `READ_I2C_VOLTAGE_B` (precise I2C path)
//! 3. expected level from the code table, tolerance per path
//!
//! A code fails if any of its four readings is missing or outside
//! `expected ± tolerance`. The ON pass is skipped when the OFF pass has any
//! failing code. The board is powered down after each pass and before the
//! operator is asked to touch the switches.

use super::{Diagnostics, Operator, StageOutcome, is_interrupt, note_error, session_tag};
use crate::link::{SerialLink, Transport};
use crate::power::PowerGuard;
use crate::tolerance::ToleranceModel;
use crate::types::{Channel, QcError, SessionContext, StageId, SwitchState};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct VoltageConfig {
    /// Wait after the switches are set, before the first code.
    pub pass_settle: Duration,
}

impl Default for VoltageConfig {
    fn default() -> Self {
        Self {
            pass_settle: Duration::from_millis(500),
        }
    }
}

/// The four readings taken for one code. `None` means missing or unparseable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CodeReadings {
    pub spi_a: Option<f64>,
    pub spi_b: Option<f64>,
    pub i2c_a: Option<f64>,
    pub i2c_b: Option<f64>,
}

impl CodeReadings {
    fn spi(&self, channel: Channel) -> Option<f64> {
        match channel {
            Channel::A => self.spi_a,
            Channel::B => self.spi_b,
        }
    }

    fn i2c(&self, channel: Channel) -> Option<f64> {
        match channel {
            Channel::A => self.i2c_a,
            Channel::B => self.i2c_b,
        }
    }
}

/// Verdict for one code in one pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeSample {
    pub code: u8,
    pub switches: SwitchState,
    pub expected: f64,
    pub spi_tolerance: f64,
    pub i2c_tolerance: f64,
    pub readings: CodeReadings,
    pub fail_a: bool,
    pub fail_b: bool,
    /// Transport problems seen while reading this code.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl CodeSample {
    #[must_use]
    pub fn passed(&self) -> bool {
        !self.fail_a && !self.fail_b
    }
}

/// One full 256-code pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub switches: SwitchState,
    pub samples: Vec<CodeSample>,
}

impl PassReport {
    #[must_use]
    pub fn failed_codes(&self) -> usize {
        self.samples.iter().filter(|s| !s.passed()).count()
    }

    /// All 256 codes were read and none failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.samples.len() == 256 && self.failed_codes() == 0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VoltageReport {
    pub table: String,
    pub passes: Vec<PassReport>,
    pub on_pass_skipped: bool,
    pub error: Option<String>,
}

/// Judge one code's readings. Pure.
#[must_use]
pub fn evaluate_code(
    model: &ToleranceModel,
    code: u8,
    switches: SwitchState,
    readings: CodeReadings,
) -> CodeSample {
    let spi = model.spi_band(code, switches);
    let i2c = model.i2c_band(code, switches);
    let channel_fails = |ch: Channel| {
        let spi_ok = readings.spi(ch).is_some_and(|v| spi.accepts(v));
        let i2c_ok = readings.i2c(ch).is_some_and(|v| i2c.accepts(v));
        !(spi_ok && i2c_ok)
    };
    CodeSample {
        code,
        switches,
        expected: spi.expected,
        spi_tolerance: spi.tolerance,
        i2c_tolerance: i2c.tolerance,
        readings,
        fail_a: channel_fails(Channel::A),
        fail_b: channel_fails(Channel::B),
        errors: Vec::new(),
    }
}

/// Run the OFF and ON sweeps.
pub fn run<T: Transport>(
    ctx: &SessionContext,
    link: &mut SerialLink<T>,
    model: &ToleranceModel,
    cfg: &VoltageConfig,
    operator: &mut dyn Operator,
) -> StageOutcome {
    info!(session = %session_tag(ctx), table = %model.table.label(), "voltage sweep");
    let mut report = VoltageReport {
        table: model.table.label().to_string(),
        ..VoltageReport::default()
    };

    if let Err(e) = sweep_both(link, model, cfg, operator, &mut report) {
        warn!(error = %e, "voltage sweep stopped");
        note_error(&mut report.error, &e);
    }

    let passed = report.error.is_none()
        && report.passes.len() == SwitchState::ALL.len()
        && report.passes.iter().all(PassReport::is_clean);
    for pass in &report.passes {
        info!(
            switches = %pass.switches,
            tested = pass.samples.len(),
            failed = pass.failed_codes(),
            "pass summary"
        );
    }
    StageOutcome::from_verdict(passed, Diagnostics::Voltage(report))
}

fn sweep_both<T: Transport>(
    link: &mut SerialLink<T>,
    model: &ToleranceModel,
    cfg: &VoltageConfig,
    operator: &mut dyn Operator,
    report: &mut VoltageReport,
) -> Result<(), QcError> {
    for switches in SwitchState::ALL {
        if report.passes.last().is_some_and(|p| !p.is_clean()) {
            warn!(switches = %switches, "skipping pass, previous pass failed");
            report.on_pass_skipped = true;
            return Ok(());
        }
        operator.set_switches(switches)?;
        report.passes.push(PassReport {
            switches,
            samples: Vec::with_capacity(256),
        });
        if let Some(pass) = report.passes.last_mut() {
            sweep_pass(link, model, cfg, pass)?;
        }
    }
    Ok(())
}

fn sweep_pass<T: Transport>(
    link: &mut SerialLink<T>,
    model: &ToleranceModel,
    cfg: &VoltageConfig,
    pass: &mut PassReport,
) -> Result<(), QcError> {
    info!(switches = %pass.switches, "testing all 256 codes");
    let mut guard = PowerGuard::energize(link, StageId::Voltage);
    guard.cancel_token().sleep(cfg.pass_settle)?;

    for code in 0..=255u8 {
        guard.cancel_token().check()?;
        let mut errors = Vec::new();

        let (spi_a, spi_b) = match keep(guard.set_vcan_voltage(code), &mut errors)? {
            Some((a, b)) => (Some(a), Some(b)),
            None => (None, None),
        };
        let i2c_a = keep(guard.read_i2c_voltage(Channel::A), &mut errors)?;
        let i2c_b = keep(guard.read_i2c_voltage(Channel::B), &mut errors)?;

        let readings = CodeReadings {
            spi_a,
            spi_b,
            i2c_a,
            i2c_b,
        };
        let mut sample = evaluate_code(model, code, pass.switches, readings);
        sample.errors = errors;

        if sample.passed() {
            debug!(code = %format!("{:#04x}", code), expected = sample.expected, "ok");
        } else {
            warn!(
                code = %format!("{:#04x}", code),
                expected = sample.expected,
                fail_a = sample.fail_a,
                fail_b = sample.fail_b,
                readings = ?sample.readings,
                "code out of tolerance"
            );
        }
        pass.samples.push(sample);
    }

    guard.release()
}

/// Turn a non-fatal read error into a missing reading; interruption propagates.
fn keep<V>(result: Result<V, QcError>, errors: &mut Vec<String>) -> Result<Option<V>, QcError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if is_interrupt(&e) => Err(e),
        Err(e) => {
            errors.push(e.to_string());
            Ok(None)
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
