//! # Temperature Check
//!
//! One `READ_TEMP` exchange reporting the master and slave sensors.
//!
//! Non-critical: the stage always lets the sequence continue. A slave
//! reading equal to the device's sentinel is recorded as PARTIAL; no valid
//! response at all is recorded as FAIL.

use super::{Diagnostics, StageOutcome, note_error, session_tag};
use crate::link::{SerialLink, Transport};
use crate::protocol::{SerialCommand, SerialResponse};
use crate::types::{QcError, SessionContext, TestStatus};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Value the firmware substitutes for an unreadable slave sensor.
pub const SLAVE_SENTINEL: f64 = 99.0;

#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureConfig {
    pub timeout: Duration,
    pub slave_sentinel: f64,
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            slave_sentinel: SLAVE_SENTINEL,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TemperatureReport {
    pub master_c: Option<f64>,
    pub slave_c: Option<f64>,
    pub slave_sensor_failed: bool,
    pub error: Option<String>,
}

/// Read both temperatures. `passed` is always true.
pub fn run<T: Transport>(
    ctx: &SessionContext,
    link: &mut SerialLink<T>,
    cfg: &TemperatureConfig,
) -> StageOutcome {
    info!(session = %session_tag(ctx), "temperature check");
    let mut report = TemperatureReport::default();

    match read(link, cfg.timeout) {
        Ok((master, slave)) => {
            report.master_c = Some(master);
            report.slave_c = Some(slave);
            report.slave_sensor_failed = slave == cfg.slave_sentinel;
            info!(master_c = master, "master temperature");
            if report.slave_sensor_failed {
                warn!(slave_c = slave, "slave temperature read failed on device");
            } else {
                info!(slave_c = slave, "slave temperature");
            }
        }
        Err(e) => {
            warn!(error = %e, "no valid TEMPERATURES response");
            note_error(&mut report.error, &e);
        }
    }

    let status = if report.error.is_some() {
        TestStatus::Fail
    } else if report.slave_sensor_failed {
        TestStatus::Partial
    } else {
        TestStatus::Pass
    };
    StageOutcome {
        passed: true,
        status,
        diagnostics: Diagnostics::Temperature(report),
    }
}

/// Wait for the first well-formed `TEMPERATURES` line, skipping others.
fn read<T: Transport>(link: &mut SerialLink<T>, timeout: Duration) -> Result<(f64, f64), QcError> {
    link.drain()?;
    link.send(&SerialCommand::ReadTemp)?;
    let deadline = Instant::now() + timeout;
    let mut last_parse_error = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match link.receive(remaining) {
            Ok(SerialResponse::Temperatures { master, slave }) => return Ok((master, slave)),
            Ok(_) => {}
            Err(QcError::ProtocolParse(msg)) => last_parse_error = Some(msg),
            Err(QcError::ProtocolTimeout { command, timeout_ms }) => {
                return Err(match last_parse_error {
                    Some(msg) => QcError::ProtocolParse(msg),
                    None => QcError::ProtocolTimeout {
                        command,
                        timeout_ms,
                    },
                });
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
