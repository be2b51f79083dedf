//! # Configuration
//!
//! TOML bench configuration, validated once into [`QcConfig`].
//!
//! The file is first deserialized into raw, all-optional section structs,
//! then every key is checked and converted. Any missing or malformed key is
//! a [`QcError::Configuration`] naming its `section.key` path, so a bad file
//! is rejected before the serial port is opened.
//!
//! ## Sections
//!
//! | Section | Required | Contents |
//! |---------|----------|----------|
//! | `[serial]` | no | port, baud rate, response timeout |
//! | `[tester]` | no | operator default, serial-number rules, lab PSU voltage |
//! | `[calibration]` | **yes** | `revision` or custom `off`/`on` bins |
//! | `[tolerances]` | **yes** | SPI/I2C absolute tolerances |
//! | `[nominal]` / `[ranges]` | **yes** (one of) | safety range derivation / explicit overrides |
//! | `[initial_check]`, `[voltage]`, `[can]`, `[temperature]` | no | stage timing |
//! | `[current]` | **yes** | current sink and band |
//! | `[burnout]` | **yes** | soak duration and drive levels |
//! | `[sequence]` | no | stage order |

use crate::stages::{
    BurnoutConfig, BurnoutMode, BusBringUp, CanConfig, CurrentConfig, InitialCheckConfig,
    TemperatureConfig, VoltageConfig, can::voltage_code_for_target,
};
use crate::tolerance::{
    BinSpec, CalibrationBins, DEFAULT_HIGH_VOLTAGE_CUTOFF, LOWEST_ENABLED_VOLTS, Revision,
    ToleranceModel, ToleranceThresholds, VoltageCodeTable, range_from_nominal,
};
use crate::types::{QcError, SafetyRange, SafetyRanges, StageId, SwitchState};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default serial line speed.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

// =============================================================================
// TYPED CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    /// Port name; `None` means discover.
    pub port: Option<String>,
    pub baud_rate: u32,
    pub response_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TesterSettings {
    pub operator_name: String,
    pub serial_number_length: Option<usize>,
    pub serial_number_numeric_only: bool,
    /// Used for range derivation when the tester does not report one.
    pub lab_power_supply_voltage_v: Option<f64>,
}

/// Inputs of the safety-range derivation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NominalSettings {
    pub tolerance_percent: Option<f64>,
    pub cic_voltage_v: Option<f64>,
    pub cic_current_ma: Option<f64>,
    pub cic_current_min_ma: f64,
    pub vcan_current_ma: Option<f64>,
    pub vcan_current_min_ma: f64,
}

/// Explicit `[ranges]` overrides; each wins over its derived counterpart.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RangeOverrides {
    pub cic_voltage: Option<SafetyRange>,
    pub cic_current: Option<SafetyRange>,
    pub vcan_voltage: Option<SafetyRange>,
    pub vcan_current: Option<SafetyRange>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeSpec {
    pub nominal: NominalSettings,
    pub overrides: RangeOverrides,
}

impl RangeSpec {
    /// Resolve all four ranges. `psu_voltage` feeds the VCAN voltage range.
    pub fn resolve(&self, psu_voltage: Option<f64>) -> Result<SafetyRanges, QcError> {
        let fixed = self.resolve_fixed()?;
        let vcan_voltage = match fixed.vcan_voltage {
            Some(r) => r,
            None => {
                let psu = psu_voltage.ok_or_else(|| {
                    QcError::Configuration(
                        "ranges.vcan_v_min/vcan_v_max or a lab power supply voltage is required"
                            .to_string(),
                    )
                })?;
                let derived = range_from_nominal(psu, self.percent()?);
                check_range("vcan voltage", derived)?
            }
        };
        Ok(SafetyRanges {
            cic_voltage: fixed.cic_voltage,
            cic_current: fixed.cic_current,
            vcan_voltage,
            vcan_current: fixed.vcan_current,
        })
    }

    /// Resolve and check every range that does not depend on the PSU
    /// voltage. Needs no tester, so it runs before the first exchange.
    pub fn resolve_fixed(&self) -> Result<FixedRanges, QcError> {
        let n = &self.nominal;
        let o = &self.overrides;
        let p = |percent: f64| percent / 100.0;

        let cic_voltage = match o.cic_voltage {
            Some(r) => r,
            None => range_from_nominal(
                require(n.cic_voltage_v, "nominal.cic_voltage_v")?,
                self.percent()?,
            ),
        };
        let cic_current = match o.cic_current {
            Some(r) => r,
            None => {
                let nominal = require(n.cic_current_ma, "nominal.cic_current_ma")? / 1000.0;
                SafetyRange::new(n.cic_current_min_ma / 1000.0, nominal * (1.0 + p(self.percent()?)))
            }
        };
        let vcan_current = match o.vcan_current {
            Some(r) => r,
            None => {
                let nominal = require(n.vcan_current_ma, "nominal.vcan_current_ma")? / 1000.0;
                SafetyRange::new(n.vcan_current_min_ma / 1000.0, nominal * (1.0 + p(self.percent()?)))
            }
        };
        let vcan_voltage = match o.vcan_voltage {
            Some(r) => Some(check_range("vcan voltage", r)?),
            None => {
                self.percent()?;
                None
            }
        };

        Ok(FixedRanges {
            cic_voltage: check_range("cic voltage", cic_voltage)?,
            cic_current: check_range("cic current", cic_current)?,
            vcan_voltage,
            vcan_current: check_range("vcan current", vcan_current)?,
        })
    }

    fn percent(&self) -> Result<f64, QcError> {
        require(self.nominal.tolerance_percent, "nominal.tolerance_percent")
    }
}

/// The ranges known before the tester reports its supply voltage.
///
/// `vcan_voltage` is `Some` only when `[ranges]` overrides it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedRanges {
    pub cic_voltage: SafetyRange,
    pub cic_current: SafetyRange,
    pub vcan_voltage: Option<SafetyRange>,
    pub vcan_current: SafetyRange,
}

fn check_range(name: &str, r: SafetyRange) -> Result<SafetyRange, QcError> {
    if r.min.is_finite() && r.max.is_finite() && r.min <= r.max {
        Ok(r)
    } else {
        Err(QcError::Configuration(format!(
            "ranges: {} range {} is empty or not finite",
            name, r
        )))
    }
}

/// The whole validated bench configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct QcConfig {
    pub serial: SerialSettings,
    pub tester: TesterSettings,
    pub model: ToleranceModel,
    pub ranges: RangeSpec,
    pub initial_check: InitialCheckConfig,
    pub voltage: VoltageConfig,
    pub current: CurrentConfig,
    pub can: CanConfig,
    pub temperature: TemperatureConfig,
    pub burnout: BurnoutConfig,
    pub sequence: Vec<StageId>,
}

/// Stage order of the full sequence when `[sequence]` is absent.
pub const DEFAULT_SEQUENCE: [StageId; 7] = [
    StageId::InitialCheck,
    StageId::Voltage,
    StageId::Current,
    StageId::Temperature,
    StageId::Can,
    StageId::Burnout,
    StageId::CanPostBurnout,
];

impl QcConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self, QcError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            QcError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, QcError> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| QcError::Configuration(e.to_string()))?;
        raw.validate()
    }

    /// Check a device serial number against the `[tester]` rules.
    pub fn validate_serial_number(&self, serial: &str) -> Result<(), QcError> {
        if serial.is_empty() {
            return Err(QcError::Configuration("serial number is empty".to_string()));
        }
        if let Some(len) = self.tester.serial_number_length {
            if serial.chars().count() != len {
                return Err(QcError::Configuration(format!(
                    "serial number must be {} characters, got {}",
                    len,
                    serial.chars().count()
                )));
            }
        }
        if self.tester.serial_number_numeric_only && !serial.chars().all(|c| c.is_ascii_digit()) {
            return Err(QcError::Configuration(
                "serial number must contain only digits".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// RAW (SERDE) LAYER
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    serial: Option<RawSerial>,
    tester: Option<RawTester>,
    calibration: Option<RawCalibration>,
    tolerances: Option<RawTolerances>,
    nominal: Option<RawNominal>,
    ranges: Option<RawRanges>,
    initial_check: Option<RawInitialCheck>,
    voltage: Option<RawVoltage>,
    current: Option<RawCurrent>,
    can: Option<RawCan>,
    temperature: Option<RawTemperature>,
    burnout: Option<RawBurnout>,
    sequence: Option<RawSequence>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSerial {
    port: Option<String>,
    baud_rate: Option<u32>,
    response_timeout_s: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTester {
    operator_name: Option<String>,
    serial_number_length: Option<usize>,
    serial_number_numeric_only: Option<bool>,
    lab_power_supply_voltage_v: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCalibration {
    revision: Option<String>,
    enabled_fallback_v: Option<f64>,
    off: Option<Vec<BinSpec>>,
    on: Option<Vec<BinSpec>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTolerances {
    zero_threshold_v: Option<f64>,
    voltage_test_tolerance_v: Option<f64>,
    high_voltage_tolerance_v: Option<f64>,
    i2c_voltage_tolerance_v: Option<f64>,
    i2c_high_voltage_tolerance_v: Option<f64>,
    high_voltage_cutoff_v: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNominal {
    tolerance_percent: Option<f64>,
    cic_voltage_v: Option<f64>,
    cic_current_ma: Option<f64>,
    cic_current_min_ma: Option<f64>,
    vcan_current_ma: Option<f64>,
    vcan_current_min_ma: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRanges {
    cic_v_min: Option<f64>,
    cic_v_max: Option<f64>,
    cic_i_min: Option<f64>,
    cic_i_max: Option<f64>,
    vcan_v_min: Option<f64>,
    vcan_v_max: Option<f64>,
    vcan_i_min: Option<f64>,
    vcan_i_max: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInitialCheck {
    duration_s: Option<f64>,
    pre_check_duration_s: Option<f64>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVoltage {
    pass_settle_s: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCurrent {
    r_ref_ohms: Option<f64>,
    v_ref_dac_volts: Option<f64>,
    voltage_codes: Option<Vec<i64>>,
    switches: Option<SwitchState>,
    target_current_a: Option<f64>,
    current_min_a: Option<f64>,
    current_max_a: Option<f64>,
    settle_s: Option<f64>,
    voltage_tolerance_v: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCan {
    short_run_messages: Option<u32>,
    long_run_messages: Option<u32>,
    base_timeout_s: Option<f64>,
    per_message_s: Option<f64>,
    phase_gap_s: Option<f64>,
    bring_up: Option<RawBringUp>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBringUp {
    target_voltage_v: Option<f64>,
    code: Option<i64>,
    settle_s: Option<f64>,
    tolerance_v: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTemperature {
    timeout_s: Option<f64>,
    slave_sentinel: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBurnout {
    mode: Option<BurnoutMode>,
    duration_s: Option<f64>,
    poll_interval_s: Option<f64>,
    max_vcan_code: Option<i64>,
    max_i2c_dac: Option<i64>,
    settle_s: Option<f64>,
    firmware_grace_s: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSequence {
    stages: Option<Vec<String>>,
}

// =============================================================================
// VALIDATION
// =============================================================================

fn missing(path: &str) -> QcError {
    QcError::Configuration(format!("missing key {}", path))
}

fn require<T>(value: Option<T>, path: &str) -> Result<T, QcError> {
    value.ok_or_else(|| missing(path))
}

/// Longest duration any timing key accepts: 30 days.
pub const MAX_SECONDS: f64 = 30.0 * 24.0 * 3600.0;

/// A finite, non-negative number of seconds no larger than [`MAX_SECONDS`].
pub fn seconds(value: f64, path: &str) -> Result<Duration, QcError> {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|_| value <= MAX_SECONDS)
        .ok_or_else(|| {
            QcError::Configuration(format!(
                "{} must be between 0 and {} seconds, got {}",
                path, MAX_SECONDS, value
            ))
        })
}

fn seconds_or(value: Option<f64>, path: &str, default: Duration) -> Result<Duration, QcError> {
    value.map_or(Ok(default), |v| seconds(v, path))
}

fn positive(value: f64, path: &str) -> Result<f64, QcError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(QcError::Configuration(format!("{} must be positive, got {}", path, value)))
    }
}

fn non_negative(value: f64, path: &str) -> Result<f64, QcError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(QcError::Configuration(format!(
            "{} must be non-negative, got {}",
            path, value
        )))
    }
}

fn code(value: i64, path: &str) -> Result<u8, QcError> {
    u8::try_from(value).map_err(|_| {
        QcError::Configuration(format!("{} must be a code in 0..=255, got {}", path, value))
    })
}

fn explicit_range(
    min: Option<f64>,
    max: Option<f64>,
    min_path: &str,
    max_path: &str,
) -> Result<Option<SafetyRange>, QcError> {
    match (min, max) {
        (None, None) => Ok(None),
        (Some(min), Some(max)) => {
            if min.is_finite() && max.is_finite() && min <= max {
                Ok(Some(SafetyRange::new(min, max)))
            } else {
                Err(QcError::Configuration(format!(
                    "{} ({}) must not exceed {} ({})",
                    min_path, min, max_path, max
                )))
            }
        }
        (Some(_), None) => Err(missing(max_path)),
        (None, Some(_)) => Err(missing(min_path)),
    }
}

impl RawConfig {
    fn validate(self) -> Result<QcConfig, QcError> {
        let serial = validate_serial(self.serial.unwrap_or_default())?;
        let tester = validate_tester(self.tester.unwrap_or_default())?;
        let table = validate_calibration(self.calibration)?;
        let (spi, i2c) = validate_tolerances(self.tolerances)?;
        let ranges = validate_ranges(self.nominal, self.ranges)?;
        let initial_check = validate_initial(self.initial_check.unwrap_or_default())?;
        let voltage = VoltageConfig {
            pass_settle: seconds_or(
                self.voltage.unwrap_or_default().pass_settle_s,
                "voltage.pass_settle_s",
                VoltageConfig::default().pass_settle,
            )?,
        };
        let current = validate_current(self.current)?;
        let can = validate_can(self.can.unwrap_or_default(), spi.standard)?;
        let temperature = validate_temperature(self.temperature.unwrap_or_default())?;
        let burnout = validate_burnout(self.burnout)?;
        let sequence = validate_sequence(self.sequence.unwrap_or_default())?;

        ranges.resolve_fixed()?;
        // With a PSU voltage on file every range is resolvable now.
        if let Some(psu) = tester.lab_power_supply_voltage_v {
            ranges.resolve(Some(psu))?;
        }

        Ok(QcConfig {
            serial,
            tester,
            model: ToleranceModel { table, spi, i2c },
            ranges,
            initial_check,
            voltage,
            current,
            can,
            temperature,
            burnout,
            sequence,
        })
    }
}

fn validate_serial(raw: RawSerial) -> Result<SerialSettings, QcError> {
    let baud_rate = raw.baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    if baud_rate == 0 {
        return Err(QcError::Configuration("serial.baud_rate must be non-zero".to_string()));
    }
    Ok(SerialSettings {
        port: raw.port.filter(|p| !p.trim().is_empty()),
        baud_rate,
        response_timeout: seconds_or(
            raw.response_timeout_s,
            "serial.response_timeout_s",
            crate::link::DEFAULT_RESPONSE_TIMEOUT,
        )?,
    })
}

fn validate_tester(raw: RawTester) -> Result<TesterSettings, QcError> {
    let psu = raw
        .lab_power_supply_voltage_v
        .map(|v| positive(v, "tester.lab_power_supply_voltage_v"))
        .transpose()?;
    if raw.serial_number_length == Some(0) {
        return Err(QcError::Configuration(
            "tester.serial_number_length must be at least 1".to_string(),
        ));
    }
    Ok(TesterSettings {
        operator_name: raw.operator_name.unwrap_or_default(),
        serial_number_length: raw.serial_number_length,
        serial_number_numeric_only: raw.serial_number_numeric_only.unwrap_or(false),
        lab_power_supply_voltage_v: psu,
    })
}

fn validate_calibration(raw: Option<RawCalibration>) -> Result<VoltageCodeTable, QcError> {
    let raw = raw.ok_or_else(|| {
        QcError::Configuration(
            "missing section [calibration]: name a revision or supply custom bins".to_string(),
        )
    })?;
    let custom = raw.off.is_some() || raw.on.is_some();
    match (raw.revision, custom) {
        (Some(_), true) => Err(QcError::Configuration(
            "calibration.revision and custom calibration bins are mutually exclusive".to_string(),
        )),
        (Some(key), false) => Revision::from_key(&key)
            .map(VoltageCodeTable::from_revision)
            .ok_or_else(|| {
                QcError::Configuration(format!(
                    "calibration.revision '{}' is unknown (expected top-4v7 or top-4v6)",
                    key
                ))
            }),
        (None, true) => {
            let bins = CalibrationBins {
                off: raw.off.unwrap_or_default(),
                on: raw.on.unwrap_or_default(),
                enabled_fallback: raw.enabled_fallback_v.unwrap_or(LOWEST_ENABLED_VOLTS),
            };
            VoltageCodeTable::from_bins("custom", &bins)
        }
        (None, false) => Err(missing("calibration.revision")),
    }
}

fn validate_tolerances(
    raw: Option<RawTolerances>,
) -> Result<(ToleranceThresholds, ToleranceThresholds), QcError> {
    let raw = raw.ok_or_else(|| missing("tolerances.zero_threshold_v"))?;
    let get = |v: Option<f64>, path: &str| -> Result<f64, QcError> { positive(require(v, path)?, path) };

    let zero = get(raw.zero_threshold_v, "tolerances.zero_threshold_v")?;
    let cutoff = match raw.high_voltage_cutoff_v {
        Some(v) => positive(v, "tolerances.high_voltage_cutoff_v")?,
        None => DEFAULT_HIGH_VOLTAGE_CUTOFF,
    };
    let spi = ToleranceThresholds {
        zero_threshold: zero,
        standard: get(raw.voltage_test_tolerance_v, "tolerances.voltage_test_tolerance_v")?,
        high_voltage: get(raw.high_voltage_tolerance_v, "tolerances.high_voltage_tolerance_v")?,
        high_voltage_cutoff: cutoff,
    };
    let i2c = ToleranceThresholds {
        zero_threshold: zero,
        standard: get(raw.i2c_voltage_tolerance_v, "tolerances.i2c_voltage_tolerance_v")?,
        high_voltage: get(
            raw.i2c_high_voltage_tolerance_v,
            "tolerances.i2c_high_voltage_tolerance_v",
        )?,
        high_voltage_cutoff: cutoff,
    };
    Ok((spi, i2c))
}

fn validate_ranges(
    nominal: Option<RawNominal>,
    ranges: Option<RawRanges>,
) -> Result<RangeSpec, QcError> {
    if nominal.is_none() && ranges.is_none() {
        return Err(QcError::Configuration(
            "missing section [nominal] or [ranges]: safety ranges cannot be derived".to_string(),
        ));
    }
    let n = nominal.unwrap_or_default();
    let r = ranges.unwrap_or_default();

    let opt_non_negative = |v: Option<f64>, path: &str| v.map(|v| non_negative(v, path)).transpose();
    let nominal = NominalSettings {
        tolerance_percent: opt_non_negative(n.tolerance_percent, "nominal.tolerance_percent")?,
        cic_voltage_v: opt_non_negative(n.cic_voltage_v, "nominal.cic_voltage_v")?,
        cic_current_ma: opt_non_negative(n.cic_current_ma, "nominal.cic_current_ma")?,
        cic_current_min_ma: opt_non_negative(n.cic_current_min_ma, "nominal.cic_current_min_ma")?
            .unwrap_or(0.0),
        vcan_current_ma: opt_non_negative(n.vcan_current_ma, "nominal.vcan_current_ma")?,
        vcan_current_min_ma: opt_non_negative(
            n.vcan_current_min_ma,
            "nominal.vcan_current_min_ma",
        )?
        .unwrap_or(0.0),
    };
    let overrides = RangeOverrides {
        cic_voltage: explicit_range(r.cic_v_min, r.cic_v_max, "ranges.cic_v_min", "ranges.cic_v_max")?,
        cic_current: explicit_range(r.cic_i_min, r.cic_i_max, "ranges.cic_i_min", "ranges.cic_i_max")?,
        vcan_voltage: explicit_range(
            r.vcan_v_min,
            r.vcan_v_max,
            "ranges.vcan_v_min",
            "ranges.vcan_v_max",
        )?,
        vcan_current: explicit_range(
            r.vcan_i_min,
            r.vcan_i_max,
            "ranges.vcan_i_min",
            "ranges.vcan_i_max",
        )?,
    };

    // Every range needs an override or the inputs to derive it.
    let spec = RangeSpec { nominal, overrides };
    let o = &spec.overrides;
    let n = &spec.nominal;
    let needs_percent = o.cic_voltage.is_none()
        || o.cic_current.is_none()
        || o.vcan_voltage.is_none()
        || o.vcan_current.is_none();
    if needs_percent && n.tolerance_percent.is_none() {
        return Err(missing("nominal.tolerance_percent"));
    }
    if o.cic_voltage.is_none() && n.cic_voltage_v.is_none() {
        return Err(missing("nominal.cic_voltage_v"));
    }
    if o.cic_current.is_none() && n.cic_current_ma.is_none() {
        return Err(missing("nominal.cic_current_ma"));
    }
    if o.vcan_current.is_none() && n.vcan_current_ma.is_none() {
        return Err(missing("nominal.vcan_current_ma"));
    }
    Ok(spec)
}

fn validate_initial(raw: RawInitialCheck) -> Result<InitialCheckConfig, QcError> {
    let d = InitialCheckConfig::default();
    Ok(InitialCheckConfig {
        duration: seconds_or(raw.duration_s, "initial_check.duration_s", d.duration)?,
        pre_check_duration: seconds_or(
            raw.pre_check_duration_s,
            "initial_check.pre_check_duration_s",
            d.pre_check_duration,
        )?,
        poll_interval: raw.poll_interval_ms.map_or(d.poll_interval, Duration::from_millis),
    })
}

fn validate_current(raw: Option<RawCurrent>) -> Result<CurrentConfig, QcError> {
    let raw = raw.ok_or_else(|| missing("current.r_ref_ohms"))?;
    let r_ref_ohms = positive(require(raw.r_ref_ohms, "current.r_ref_ohms")?, "current.r_ref_ohms")?;
    let v_ref_dac_volts = positive(
        require(raw.v_ref_dac_volts, "current.v_ref_dac_volts")?,
        "current.v_ref_dac_volts",
    )?;
    let voltage_codes = require(raw.voltage_codes, "current.voltage_codes")?
        .into_iter()
        .map(|c| code(c, "current.voltage_codes"))
        .collect::<Result<Vec<u8>, QcError>>()?;
    if voltage_codes.is_empty() {
        return Err(QcError::Configuration(
            "current.voltage_codes must list at least one code".to_string(),
        ));
    }
    let target_current_a = non_negative(
        require(raw.target_current_a, "current.target_current_a")?,
        "current.target_current_a",
    )?;
    let current_band = explicit_range(
        raw.current_min_a,
        raw.current_max_a,
        "current.current_min_a",
        "current.current_max_a",
    )?
    .ok_or_else(|| missing("current.current_min_a"))?;

    Ok(CurrentConfig {
        r_ref_ohms,
        v_ref_dac_volts,
        voltage_codes,
        switches: raw.switches.unwrap_or(SwitchState::On),
        target_current_a,
        current_band,
        settle: seconds(require(raw.settle_s, "current.settle_s")?, "current.settle_s")?,
        voltage_tolerance_v: positive(
            require(raw.voltage_tolerance_v, "current.voltage_tolerance_v")?,
            "current.voltage_tolerance_v",
        )?,
    })
}

fn validate_can(raw: RawCan, default_tolerance: f64) -> Result<CanConfig, QcError> {
    let d = CanConfig::default();
    let bring_up = match raw.bring_up {
        None => None,
        Some(b) => {
            let target_v = positive(
                require(b.target_voltage_v, "can.bring_up.target_voltage_v")?,
                "can.bring_up.target_voltage_v",
            )?;
            let code = match b.code {
                Some(c) => code(c, "can.bring_up.code")?,
                None => voltage_code_for_target(target_v),
            };
            if code == 0 {
                return Err(QcError::Configuration(format!(
                    "can.bring_up.target_voltage_v {} is outside the bus range",
                    target_v
                )));
            }
            Some(BusBringUp {
                code,
                target_v,
                settle: seconds_or(b.settle_s, "can.bring_up.settle_s", Duration::from_millis(500))?,
                tolerance_v: match b.tolerance_v {
                    Some(v) => positive(v, "can.bring_up.tolerance_v")?,
                    None => default_tolerance,
                },
            })
        }
    };
    let can = CanConfig {
        short_messages: raw.short_run_messages.unwrap_or(d.short_messages),
        long_messages: raw.long_run_messages.unwrap_or(d.long_messages),
        base_timeout: seconds_or(raw.base_timeout_s, "can.base_timeout_s", d.base_timeout)?,
        per_message: seconds_or(raw.per_message_s, "can.per_message_s", d.per_message)?,
        phase_gap: seconds_or(raw.phase_gap_s, "can.phase_gap_s", d.phase_gap)?,
        bring_up,
    };
    let longest = can.timeout_for(can.short_messages.max(can.long_messages));
    if longest.as_secs_f64() > MAX_SECONDS {
        return Err(QcError::Configuration(format!(
            "can run deadline of {:.0} s exceeds {} s; lower can.per_message_s or the message counts",
            longest.as_secs_f64(),
            MAX_SECONDS
        )));
    }
    Ok(can)
}

fn validate_temperature(raw: RawTemperature) -> Result<TemperatureConfig, QcError> {
    let d = TemperatureConfig::default();
    Ok(TemperatureConfig {
        timeout: seconds_or(raw.timeout_s, "temperature.timeout_s", d.timeout)?,
        slave_sentinel: raw.slave_sentinel.unwrap_or(d.slave_sentinel),
    })
}

fn validate_burnout(raw: Option<RawBurnout>) -> Result<BurnoutConfig, QcError> {
    let raw = raw.ok_or_else(|| missing("burnout.duration_s"))?;
    let d = BurnoutConfig::default();
    let max_current_dac = match raw.max_i2c_dac {
        Some(v) if (0..=4095).contains(&v) => v as u16,
        Some(v) => {
            return Err(QcError::Configuration(format!(
                "burnout.max_i2c_dac must be in 0..=4095, got {}",
                v
            )));
        }
        None => d.max_current_dac,
    };
    let poll_interval = seconds_or(raw.poll_interval_s, "burnout.poll_interval_s", d.poll_interval)?;
    if poll_interval.is_zero() {
        return Err(QcError::Configuration(
            "burnout.poll_interval_s must be positive".to_string(),
        ));
    }
    Ok(BurnoutConfig {
        mode: raw.mode.unwrap_or(d.mode),
        duration: seconds(require(raw.duration_s, "burnout.duration_s")?, "burnout.duration_s")?,
        poll_interval,
        max_voltage_code: match raw.max_vcan_code {
            Some(c) => code(c, "burnout.max_vcan_code")?,
            None => d.max_voltage_code,
        },
        max_current_dac,
        step_gap: d.step_gap,
        settle: seconds_or(raw.settle_s, "burnout.settle_s", d.settle)?,
        firmware_grace: seconds_or(raw.firmware_grace_s, "burnout.firmware_grace_s", d.firmware_grace)?,
    })
}

fn validate_sequence(raw: RawSequence) -> Result<Vec<StageId>, QcError> {
    let Some(keys) = raw.stages else {
        return Ok(DEFAULT_SEQUENCE.to_vec());
    };
    if keys.is_empty() {
        return Err(QcError::Configuration("sequence.stages is empty".to_string()));
    }
    keys.iter()
        .map(|k| {
            StageId::from_key(k).ok_or_else(|| {
                QcError::Configuration(format!("sequence.stages: unknown stage '{}'", k))
            })
        })
        .collect()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[calibration]
revision = "top-4v6"

[tolerances]
zero_threshold_v = 0.05
voltage_test_tolerance_v = 0.05
high_voltage_tolerance_v = 0.15
i2c_voltage_tolerance_v = 0.03
i2c_high_voltage_tolerance_v = 0.10

[nominal]
tolerance_percent = 10.0
cic_voltage_v = 3.3
cic_current_ma = 150.0
cic_current_min_ma = 50.0
vcan_current_ma = 400.0

[current]
r_ref_ohms = 10.0
v_ref_dac_volts = 3.3
voltage_codes = [0x1f, 0xff]
target_current_a = 0.1
current_min_a = 0.08
current_max_a = 0.12
settle_s = 0.5
voltage_tolerance_v = 0.1

[burnout]
duration_s = 600
"#;

    fn with(extra: &str) -> String {
        format!("{}\n{}", MINIMAL, extra)
    }

    fn config_error(text: &str) -> String {
        match QcConfig::from_toml_str(text) {
            Err(QcError::Configuration(msg)) => msg,
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn minimal_config_validates_with_defaults() {
        let cfg = QcConfig::from_toml_str(MINIMAL).expect("valid");
        assert_eq!(cfg.model.table.label(), "top-4v6");
        assert_eq!(cfg.model.spi.high_voltage_cutoff, 4.0);
        assert_eq!(cfg.model.i2c.zero_threshold, 0.05);
        assert_eq!(cfg.serial.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(cfg.current.voltage_codes, vec![0x1f, 0xff]);
        assert_eq!(cfg.can.timeout_for(10), Duration::from_secs(6));
        assert_eq!(cfg.sequence, DEFAULT_SEQUENCE.to_vec());
        assert_eq!(cfg.burnout.mode, BurnoutMode::Host);
    }

    #[test]
    fn ranges_derive_from_nominal_and_psu() {
        let cfg = QcConfig::from_toml_str(MINIMAL).expect("valid");
        let r = cfg.ranges.resolve(Some(12.0)).expect("ranges");
        assert!((r.vcan_voltage.min - 10.8).abs() < 1e-9);
        assert!((r.vcan_voltage.max - 13.2).abs() < 1e-9);
        assert!((r.cic_voltage.min - 2.97).abs() < 1e-9);
        assert!((r.cic_current.min - 0.05).abs() < 1e-12);
        assert!((r.cic_current.max - 0.165).abs() < 1e-9);
        assert!((r.vcan_current.max - 0.44).abs() < 1e-9);
    }

    #[test]
    fn vcan_voltage_needs_psu_or_override() {
        let cfg = QcConfig::from_toml_str(MINIMAL).expect("valid");
        assert!(matches!(cfg.ranges.resolve(None), Err(QcError::Configuration(_))));

        let cfg = QcConfig::from_toml_str(&with("[ranges]\nvcan_v_min = 3.0\nvcan_v_max = 3.6\n"))
            .expect("valid");
        let r = cfg.ranges.resolve(None).expect("ranges");
        assert_eq!(r.vcan_voltage, SafetyRange::new(3.0, 3.6));
    }

    #[test]
    fn empty_derived_range_rejected_at_load() {
        let text = MINIMAL.replace("cic_current_min_ma = 50.0", "cic_current_min_ma = 500.0");
        assert!(config_error(&text).contains("cic current"));
    }

    #[test]
    fn calibration_is_mandatory() {
        let text = MINIMAL.replace("[calibration]\nrevision = \"top-4v6\"\n", "");
        assert!(config_error(&text).contains("calibration"));
    }

    #[test]
    fn unknown_revision_rejected() {
        let text = MINIMAL.replace("top-4v6", "top-9v9");
        assert!(config_error(&text).contains("top-9v9"));
    }

    #[test]
    fn custom_bins_accepted() {
        let text = MINIMAL.replace(
            "revision = \"top-4v6\"",
            "on = [{ volts = 3.3, codes = [0xff] }]\noff = []",
        );
        let cfg = QcConfig::from_toml_str(&text).expect("valid");
        assert_eq!(cfg.model.table.label(), "custom");
        assert_eq!(cfg.model.expected(0xff, SwitchState::On), 3.3);
    }

    #[test]
    fn missing_key_names_its_path() {
        let text = MINIMAL.replace("settle_s = 0.5\n", "");
        assert_eq!(config_error(&text), "missing key current.settle_s");
        let text = MINIMAL.replace("i2c_voltage_tolerance_v = 0.03\n", "");
        assert!(config_error(&text).contains("tolerances.i2c_voltage_tolerance_v"));
    }

    #[test]
    fn malformed_values_rejected() {
        assert!(config_error(&MINIMAL.replace("0x1f, 0xff", "0x1f, 256")).contains("0..=255"));
        assert!(config_error(&MINIMAL.replace("duration_s = 600", "duration_s = -1")).contains("burnout.duration_s"));
        assert!(config_error(&with("[ranges]\ncic_v_min = 3.0\n")).contains("ranges.cic_v_max"));
        assert!(config_error(&with("[serial]\nparity = \"odd\"\n")).contains("parity"));
    }

    #[test]
    fn oversized_durations_are_configuration_errors() {
        let text = MINIMAL.replace("duration_s = 600", "duration_s = 1e20");
        assert!(config_error(&text).contains("burnout.duration_s"));
        let text = MINIMAL.replace("duration_s = 600", "duration_s = 1e9");
        assert!(config_error(&text).contains("burnout.duration_s"));
        assert!(config_error(&with("[can]\nper_message_s = 1e20\n")).contains("can.per_message_s"));
        assert!(
            config_error(&with("[can]\nper_message_s = 3600\nlong_run_messages = 100000\n"))
                .contains("can run deadline")
        );
        assert!(seconds(MAX_SECONDS, "x").is_ok());
    }

    #[test]
    fn sequence_keys_resolve() {
        let cfg = QcConfig::from_toml_str(&with("[sequence]\nstages = [\"voltage\", \"can\"]\n"))
            .expect("valid");
        assert_eq!(cfg.sequence, vec![StageId::Voltage, StageId::Can]);
        assert!(config_error(&with("[sequence]\nstages = [\"warp\"]\n")).contains("warp"));
    }

    #[test]
    fn bring_up_code_computed_from_target() {
        let cfg = QcConfig::from_toml_str(&with("[can.bring_up]\ntarget_voltage_v = 3.3\n"))
            .expect("valid");
        let b = cfg.can.bring_up.expect("bring-up");
        assert_eq!(b.code, 0xff);
        assert_eq!(b.tolerance_v, 0.05);
    }

    #[test]
    fn serial_number_rules() {
        let cfg = QcConfig::from_toml_str(&with(
            "[tester]\nserial_number_length = 8\nserial_number_numeric_only = true\n",
        ))
        .expect("valid");
        assert!(cfg.validate_serial_number("12345678").is_ok());
        assert!(cfg.validate_serial_number("1234567").is_err());
        assert!(cfg.validate_serial_number("1234567A").is_err());
        assert!(cfg.validate_serial_number("").is_err());
    }
}
