//! # Wire Protocol
//!
//! ASCII, newline-terminated command/response vocabulary spoken by the
//! embedded tester.
//!
//! ## Commands
//!
//! | Command | Response |
//! |---------|----------|
//! | `SET_VCAN_VOLTAGE <code>` | `VCAN_DATA:v_a,v_b` |
//! | `SET_I2C_CURRENT <dac>` | `ACK_CURRENT_SET` |
//! | `READ_I2C_VOLTAGE_<A\|B>` | `I2C_VOLTAGE_<ch>:value` |
//! | `CHECK_SPI_ADC` | `DATA:cic_v,cic_i,vcan_v,vcan_i` |
//! | `READ_MASTER_SPI` | `MASTER_SPI:v_a,i_a[,...]` |
//! | `RUN_CAN_TEST <n>` | `CAN_TEST_PROGRESS:...`* then `CAN_TEST_FINAL:PASS\|FAIL:<detail>` |
//! | `RUN_BURNOUT_TEST <dur_s> <maxV> <maxI> <vmin> <vmax> <imin> <imax>` | `BURNOUT_PROGRESS:...`* then `BURNOUT_FINAL:...` |
//! | `READ_TEMP` | `TEMPERATURES:Master=<f>,Slave=<f>` |
//! | `GET_TEST_INFO` | `TEST_INFO:<master_id>:<psu_voltage>` |

use crate::types::{Channel, QcError};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Line terminator appended to every outbound command.
pub const LINE_TERMINATOR: &str = "\n";

/// Acknowledgement line for `SET_I2C_CURRENT`.
pub const ACK_CURRENT_SET: &str = "ACK_CURRENT_SET";

// =============================================================================
// COMMANDS
// =============================================================================

/// An outbound command line.
#[derive(Debug, Clone, PartialEq)]
pub enum SerialCommand {
    SetVcanVoltage(u8),
    SetI2cCurrent(u16),
    ReadI2cVoltage(Channel),
    CheckSpiAdc,
    ReadMasterSpi,
    RunCanTest(u32),
    RunBurnoutTest(BurnoutParams),
    ReadTemp,
    GetTestInfo,
}

/// Parameters of the firmware-monitored burnout command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BurnoutParams {
    pub duration_s: u64,
    pub max_voltage_code: u8,
    pub max_current_dac: u16,
    pub v_min: f64,
    pub v_max: f64,
    pub i_min: f64,
    pub i_max: f64,
}

impl BurnoutParams {
    /// All-zero parameters, which the firmware treats as "stop".
    pub const STOP: BurnoutParams = BurnoutParams {
        duration_s: 0,
        max_voltage_code: 0,
        max_current_dac: 0,
        v_min: 0.0,
        v_max: 0.0,
        i_min: 0.0,
        i_max: 0.0,
    };
}

impl SerialCommand {
    /// The full framed line, including the terminator.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!("{}{}", self, LINE_TERMINATOR)
    }

    /// True for commands that put voltage or current onto the board.
    #[must_use]
    pub fn energizes(&self) -> bool {
        match self {
            SerialCommand::SetVcanVoltage(code) => *code != 0,
            SerialCommand::SetI2cCurrent(dac) => *dac != 0,
            SerialCommand::RunBurnoutTest(p) => p.duration_s != 0,
            _ => false,
        }
    }
}

impl fmt::Display for SerialCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialCommand::SetVcanVoltage(code) => write!(f, "SET_VCAN_VOLTAGE {}", code),
            SerialCommand::SetI2cCurrent(dac) => write!(f, "SET_I2C_CURRENT {}", dac),
            SerialCommand::ReadI2cVoltage(ch) => write!(f, "READ_I2C_VOLTAGE_{}", ch.letter()),
            SerialCommand::CheckSpiAdc => f.write_str("CHECK_SPI_ADC"),
            SerialCommand::ReadMasterSpi => f.write_str("READ_MASTER_SPI"),
            SerialCommand::RunCanTest(n) => write!(f, "RUN_CAN_TEST {}", n),
            SerialCommand::RunBurnoutTest(p) => write!(
                f,
                "RUN_BURNOUT_TEST {} {} {} {} {} {} {}",
                p.duration_s,
                p.max_voltage_code,
                p.max_current_dac,
                p.v_min,
                p.v_max,
                p.i_min,
                p.i_max
            ),
            SerialCommand::ReadTemp => f.write_str("READ_TEMP"),
            SerialCommand::GetTestInfo => f.write_str("GET_TEST_INFO"),
        }
    }
}

impl FromStr for SerialCommand {
    type Err = QcError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let mut words = line.split_whitespace();
        let name = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();

        let bad = || QcError::ProtocolParse(format!("malformed command '{}'", line));
        let arg = |i: usize| args.get(i).copied().ok_or_else(bad);

        let command = match name {
            "SET_VCAN_VOLTAGE" => SerialCommand::SetVcanVoltage(arg(0)?.parse().map_err(|_| bad())?),
            "SET_I2C_CURRENT" => SerialCommand::SetI2cCurrent(arg(0)?.parse().map_err(|_| bad())?),
            "READ_I2C_VOLTAGE_A" => SerialCommand::ReadI2cVoltage(Channel::A),
            "READ_I2C_VOLTAGE_B" => SerialCommand::ReadI2cVoltage(Channel::B),
            "CHECK_SPI_ADC" => SerialCommand::CheckSpiAdc,
            "READ_MASTER_SPI" => SerialCommand::ReadMasterSpi,
            "RUN_CAN_TEST" => SerialCommand::RunCanTest(arg(0)?.parse().map_err(|_| bad())?),
            "RUN_BURNOUT_TEST" => {
                let float = |i: usize| -> Result<f64, QcError> { arg(i)?.parse().map_err(|_| bad()) };
                SerialCommand::RunBurnoutTest(BurnoutParams {
                    duration_s: arg(0)?.parse().map_err(|_| bad())?,
                    max_voltage_code: arg(1)?.parse().map_err(|_| bad())?,
                    max_current_dac: arg(2)?.parse().map_err(|_| bad())?,
                    v_min: float(3)?,
                    v_max: float(4)?,
                    i_min: float(5)?,
                    i_max: float(6)?,
                })
            }
            "READ_TEMP" => SerialCommand::ReadTemp,
            "GET_TEST_INFO" => SerialCommand::GetTestInfo,
            _ => return Err(QcError::ProtocolParse(format!("unknown command '{}'", line))),
        };
        Ok(command)
    }
}

// =============================================================================
// RESPONSES
// =============================================================================

/// Snapshot returned by `CHECK_SPI_ADC`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdcSnapshot {
    pub cic_v: f64,
    pub cic_i: f64,
    pub vcan_v: f64,
    pub vcan_i: f64,
}

/// Terminal line of a firmware burnout run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BurnoutVerdict {
    Complete,
    Fail(String),
}

/// A parsed inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum SerialResponse {
    Data(AdcSnapshot),
    VcanData { a: f64, b: f64 },
    MasterSpi { voltage: f64, current: f64 },
    I2cVoltage { channel: Channel, volts: f64 },
    CanProgress(String),
    CanFinal { passed: bool, detail: String },
    BurnoutProgress(String),
    BurnoutFinal(BurnoutVerdict),
    Temperatures { master: f64, slave: f64 },
    TestInfo { master_id: String, psu_voltage: f64 },
    AckCurrentSet,
    Unrecognized(String),
}

impl SerialResponse {
    /// Parse one line (terminator already stripped).
    ///
    /// A known prefix with a bad payload is a `ProtocolParse` error; text with
    /// no known prefix is returned as `Unrecognized`.
    pub fn parse(line: &str) -> Result<Self, QcError> {
        let line = line.trim();
        let bad = |what: &str| QcError::ProtocolParse(format!("bad {} line '{}'", what, line));

        if let Some(rest) = line.strip_prefix("DATA:") {
            let v = parse_floats(rest).ok_or_else(|| bad("DATA"))?;
            if v.len() != 4 {
                return Err(bad("DATA"));
            }
            return Ok(SerialResponse::Data(AdcSnapshot {
                cic_v: v[0],
                cic_i: v[1],
                vcan_v: v[2],
                vcan_i: v[3],
            }));
        }
        if let Some(rest) = line.strip_prefix("VCAN_DATA:") {
            let v = parse_floats(rest).ok_or_else(|| bad("VCAN_DATA"))?;
            if v.len() != 2 {
                return Err(bad("VCAN_DATA"));
            }
            return Ok(SerialResponse::VcanData { a: v[0], b: v[1] });
        }
        if let Some(rest) = line.strip_prefix("MASTER_SPI:") {
            let v = parse_floats(rest).ok_or_else(|| bad("MASTER_SPI"))?;
            if v.len() < 2 {
                return Err(bad("MASTER_SPI"));
            }
            return Ok(SerialResponse::MasterSpi {
                voltage: v[0],
                current: v[1],
            });
        }
        if let Some(rest) = line.strip_prefix("I2C_VOLTAGE_") {
            let (ch, value) = rest.split_once(':').ok_or_else(|| bad("I2C_VOLTAGE"))?;
            let mut letters = ch.chars();
            let channel = match (letters.next(), letters.next()) {
                (Some(c), None) => Channel::from_letter(c),
                _ => None,
            }
            .ok_or_else(|| bad("I2C_VOLTAGE"))?;
            let volts = value.trim().parse().map_err(|_| bad("I2C_VOLTAGE"))?;
            return Ok(SerialResponse::I2cVoltage { channel, volts });
        }
        if let Some(rest) = line.strip_prefix("CAN_TEST_PROGRESS") {
            return Ok(SerialResponse::CanProgress(payload(rest)));
        }
        if let Some(rest) = line.strip_prefix("CAN_TEST_FINAL:") {
            let (verdict, detail) = rest.split_once(':').unwrap_or((rest, ""));
            let passed = match verdict.trim() {
                "PASS" => true,
                "FAIL" => false,
                _ => return Err(bad("CAN_TEST_FINAL")),
            };
            return Ok(SerialResponse::CanFinal {
                passed,
                detail: detail.trim().to_string(),
            });
        }
        if let Some(rest) = line.strip_prefix("BURNOUT_PROGRESS") {
            return Ok(SerialResponse::BurnoutProgress(payload(rest)));
        }
        if let Some(rest) = line.strip_prefix("BURNOUT_FINAL:") {
            let (verdict, reason) = rest.split_once(':').unwrap_or((rest, ""));
            return match verdict.trim() {
                "COMPLETE" => Ok(SerialResponse::BurnoutFinal(BurnoutVerdict::Complete)),
                "FAIL" => Ok(SerialResponse::BurnoutFinal(BurnoutVerdict::Fail(
                    reason.trim().to_string(),
                ))),
                _ => Err(bad("BURNOUT_FINAL")),
            };
        }
        if let Some(rest) = line.strip_prefix("TEMPERATURES:") {
            let mut master = None;
            let mut slave = None;
            for field in rest.split(',') {
                let (key, value) = field.split_once('=').ok_or_else(|| bad("TEMPERATURES"))?;
                let value: f64 = value.trim().parse().map_err(|_| bad("TEMPERATURES"))?;
                match key.trim() {
                    "Master" => master = Some(value),
                    "Slave" => slave = Some(value),
                    _ => {}
                }
            }
            return match (master, slave) {
                (Some(master), Some(slave)) => Ok(SerialResponse::Temperatures { master, slave }),
                _ => Err(bad("TEMPERATURES")),
            };
        }
        if let Some(rest) = line.strip_prefix("TEST_INFO:") {
            let (id, psu) = rest.rsplit_once(':').ok_or_else(|| bad("TEST_INFO"))?;
            let psu_voltage = psu.trim().parse().map_err(|_| bad("TEST_INFO"))?;
            return Ok(SerialResponse::TestInfo {
                master_id: id.trim().to_string(),
                psu_voltage,
            });
        }
        if line == ACK_CURRENT_SET {
            return Ok(SerialResponse::AckCurrentSet);
        }

        Ok(SerialResponse::Unrecognized(line.to_string()))
    }

    /// Short tag name, for diagnostics.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            SerialResponse::Data(_) => "DATA",
            SerialResponse::VcanData { .. } => "VCAN_DATA",
            SerialResponse::MasterSpi { .. } => "MASTER_SPI",
            SerialResponse::I2cVoltage { .. } => "I2C_VOLTAGE",
            SerialResponse::CanProgress(_) => "CAN_TEST_PROGRESS",
            SerialResponse::CanFinal { .. } => "CAN_TEST_FINAL",
            SerialResponse::BurnoutProgress(_) => "BURNOUT_PROGRESS",
            SerialResponse::BurnoutFinal(_) => "BURNOUT_FINAL",
            SerialResponse::Temperatures { .. } => "TEMPERATURES",
            SerialResponse::TestInfo { .. } => "TEST_INFO",
            SerialResponse::AckCurrentSet => "ACK_CURRENT_SET",
            SerialResponse::Unrecognized(_) => "UNRECOGNIZED",
        }
    }
}

/// Comma-separated floats; `None` if any field fails to parse.
fn parse_floats(s: &str) -> Option<Vec<f64>> {
    s.split(',').map(|p| p.trim().parse::<f64>().ok()).collect()
}

/// Text after an optional `:` following a progress tag.
fn payload(rest: &str) -> String {
    rest.strip_prefix(':').unwrap_or(rest).trim().to_string()
}

/// Build a `ProtocolParse` error for a response that has the wrong tag.
pub(crate) fn unexpected(expected: &str, got: &SerialResponse) -> QcError {
    match got {
        SerialResponse::Unrecognized(line) => {
            QcError::ProtocolParse(format!("expected {}, got '{}'", expected, line))
        }
        other => QcError::ProtocolParse(format!("expected {}, got {}", expected, other.tag())),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn command_framing() {
        assert_eq!(SerialCommand::SetVcanVoltage(31).to_line(), "SET_VCAN_VOLTAGE 31\n");
        assert_eq!(
            SerialCommand::ReadI2cVoltage(Channel::B).to_string(),
            "READ_I2C_VOLTAGE_B"
        );
        assert_eq!(SerialCommand::RunCanTest(10).to_string(), "RUN_CAN_TEST 10");
    }

    #[test]
    fn burnout_command_carries_all_limits() {
        let cmd = SerialCommand::RunBurnoutTest(BurnoutParams {
            duration_s: 600,
            max_voltage_code: 255,
            max_current_dac: 4095,
            v_min: 3.0,
            v_max: 3.6,
            i_min: 0.01,
            i_max: 0.5,
        });
        assert_eq!(cmd.to_string(), "RUN_BURNOUT_TEST 600 255 4095 3 3.6 0.01 0.5");
        let parsed: SerialCommand = cmd.to_string().parse().expect("parse");
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn stop_command_is_all_zero() {
        let cmd = SerialCommand::RunBurnoutTest(BurnoutParams::STOP);
        assert_eq!(cmd.to_string(), "RUN_BURNOUT_TEST 0 0 0 0 0 0 0");
        assert!(!cmd.energizes());
    }

    #[test]
    fn energizing_commands() {
        assert!(SerialCommand::SetVcanVoltage(3).energizes());
        assert!(!SerialCommand::SetVcanVoltage(0).energizes());
        assert!(SerialCommand::SetI2cCurrent(100).energizes());
        assert!(!SerialCommand::ReadTemp.energizes());
    }

    #[test]
    fn unknown_command_rejected() {
        assert!("FORMAT_FLASH".parse::<SerialCommand>().is_err());
        assert!("SET_VCAN_VOLTAGE 256".parse::<SerialCommand>().is_err());
        assert!("SET_VCAN_VOLTAGE".parse::<SerialCommand>().is_err());
    }

    #[test]
    fn parse_data_line() {
        let r = SerialResponse::parse("DATA:3.30,0.120,3.28,0.050").expect("parse");
        assert_eq!(
            r,
            SerialResponse::Data(AdcSnapshot {
                cic_v: 3.30,
                cic_i: 0.120,
                vcan_v: 3.28,
                vcan_i: 0.050
            })
        );
    }

    #[test]
    fn parse_data_with_wrong_arity_fails() {
        assert!(SerialResponse::parse("DATA:3.3,0.1,3.2").is_err());
        assert!(SerialResponse::parse("VCAN_DATA:abc,1.0").is_err());
    }

    #[test]
    fn parse_master_spi_uses_first_two_fields() {
        let r = SerialResponse::parse("MASTER_SPI:3.31,0.042,17").expect("parse");
        assert_eq!(
            r,
            SerialResponse::MasterSpi {
                voltage: 3.31,
                current: 0.042
            }
        );
    }

    #[test]
    fn parse_i2c_voltage() {
        let r = SerialResponse::parse("I2C_VOLTAGE_B:1.987").expect("parse");
        assert_eq!(
            r,
            SerialResponse::I2cVoltage {
                channel: Channel::B,
                volts: 1.987
            }
        );
        assert!(SerialResponse::parse("I2C_VOLTAGE_C:1.0").is_err());
    }

    #[test]
    fn parse_can_lines() {
        assert_eq!(
            SerialResponse::parse("CAN_TEST_PROGRESS: 50/100").expect("parse"),
            SerialResponse::CanProgress("50/100".into())
        );
        assert_eq!(
            SerialResponse::parse("CAN_TEST_FINAL:FAIL:B lost 3 frames").expect("parse"),
            SerialResponse::CanFinal {
                passed: false,
                detail: "B lost 3 frames".into()
            }
        );
        assert_eq!(
            SerialResponse::parse("CAN_TEST_FINAL:PASS").expect("parse"),
            SerialResponse::CanFinal {
                passed: true,
                detail: String::new()
            }
        );
    }

    #[test]
    fn parse_burnout_final() {
        assert_eq!(
            SerialResponse::parse("BURNOUT_FINAL:COMPLETE").expect("parse"),
            SerialResponse::BurnoutFinal(BurnoutVerdict::Complete)
        );
        assert_eq!(
            SerialResponse::parse("BURNOUT_FINAL:FAIL:V_A over limit").expect("parse"),
            SerialResponse::BurnoutFinal(BurnoutVerdict::Fail("V_A over limit".into()))
        );
    }

    #[test]
    fn parse_temperatures_and_info() {
        assert_eq!(
            SerialResponse::parse("TEMPERATURES:Master=24.50,Slave=99.00").expect("parse"),
            SerialResponse::Temperatures {
                master: 24.5,
                slave: 99.0
            }
        );
        assert_eq!(
            SerialResponse::parse("TEST_INFO:QC-Station-01:12.0").expect("parse"),
            SerialResponse::TestInfo {
                master_id: "QC-Station-01".into(),
                psu_voltage: 12.0
            }
        );
    }

    #[test]
    fn unknown_text_is_unrecognized() {
        assert_eq!(
            SerialResponse::parse("Guru Meditation Error").expect("parse"),
            SerialResponse::Unrecognized("Guru Meditation Error".into())
        );
        assert_eq!(
            SerialResponse::parse("ACK_CURRENT_SET\r").expect("parse"),
            SerialResponse::AckCurrentSet
        );
    }
}
