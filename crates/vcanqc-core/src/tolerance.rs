//! # Tolerance Model
//!
//! Maps a drive code and switch state to the expected VCAN level, and an
//! expected level to the tolerance it is judged with.
//!
//! ## Code table
//!
//! The board decodes the 8-bit drive code into one of a few discrete levels
//! ("bins"). Bits 0 and 1 are the power-enable pair: with either cleared the
//! rail is off. A code with both set that is not listed in any named bin
//! sits at the lowest enabled level.
//!
//! Bench revisions disagree on bin membership and on the top level, so the
//! table is calibration data: it is built once from a named [`Revision`] or
//! from custom bins and is never assumed.
//!
//! ## Tolerance classes
//!
//! | Class | Predicate on expected `v` |
//! |-------|---------------------------|
//! | Zero | `|v| < ZERO_EPSILON` |
//! | HighVoltage | `v > high_voltage_cutoff` |
//! | Standard | otherwise |

use crate::types::{QcError, SafetyRange, SwitchState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Bits that must both be set for the rail to be enabled.
pub const POWER_ENABLE_MASK: u8 = 0x03;

/// Level of the lowest enabled bin on every known revision.
pub const LOWEST_ENABLED_VOLTS: f64 = 1.25;

/// Below this magnitude an expected level counts as "off".
pub const ZERO_EPSILON: f64 = 1e-9;

/// Default cutoff above which the high-voltage tolerance applies.
pub const DEFAULT_HIGH_VOLTAGE_CUTOFF: f64 = 4.0;

/// True when both power-enable bits are set.
#[must_use]
pub fn power_enabled(code: u8) -> bool {
    code & POWER_ENABLE_MASK == POWER_ENABLE_MASK
}

// =============================================================================
// CALIBRATION REVISIONS
// =============================================================================

/// Codes of the 1.25 V bin with switches OFF: every power-enabled code.
const OFF_1V25: [u8; 64] = [
    0x03, 0x07, 0x0b, 0x0f, 0x13, 0x17, 0x1b, 0x1f, 0x23, 0x27, 0x2b, 0x2f, 0x33, 0x37, 0x3b, 0x3f,
    0x43, 0x47, 0x4b, 0x4f, 0x53, 0x57, 0x5b, 0x5f, 0x63, 0x67, 0x6b, 0x6f, 0x73, 0x77, 0x7b, 0x7f,
    0x83, 0x87, 0x8b, 0x8f, 0x93, 0x97, 0x9b, 0x9f, 0xa3, 0xa7, 0xab, 0xaf, 0xb3, 0xb7, 0xbb, 0xbf,
    0xc3, 0xc7, 0xcb, 0xcf, 0xd3, 0xd7, 0xdb, 0xdf, 0xe3, 0xe7, 0xeb, 0xef, 0xf3, 0xf7, 0xfb, 0xff,
];

const ON_1V9: [u8; 27] = [
    0x03, 0x07, 0x0b, 0x13, 0x17, 0x1b, 0x23, 0x27, 0x2b, 0x43, 0x47, 0x4b, 0x53, 0x57, 0x5b, 0x63,
    0x67, 0x6b, 0x83, 0x87, 0x8b, 0x93, 0x97, 0x9b, 0xa3, 0xa7, 0xab,
];
const ON_2V0: [u8; 9] = [0x0f, 0x1f, 0x2f, 0x4f, 0x5f, 0x6f, 0x8f, 0x9f, 0xaf];
const ON_2V4: [u8; 9] = [0x33, 0x37, 0x3b, 0x73, 0x77, 0x7b, 0xb3, 0xb7, 0xbb];
const ON_2V6: [u8; 3] = [0x3f, 0x7f, 0xbf];
const ON_2V8: [u8; 9] = [0xc3, 0xc7, 0xcb, 0xd3, 0xd7, 0xdb, 0xe3, 0xe7, 0xeb];
const ON_3V5: [u8; 3] = [0xcf, 0xdf, 0xef];
const ON_4V2: [u8; 3] = [0xf3, 0xf7, 0xfb];
const ON_TOP: [u8; 1] = [0xff];

/// Built-in calibration revisions recorded on the bench.
///
/// They share every bin except the top one, which is reached only by `0xFF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Revision {
    /// Top bin at 4.7 V.
    Top4v7,
    /// Top bin at 4.6 V.
    Top4v6,
}

impl Revision {
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            Revision::Top4v7 => "top-4v7",
            Revision::Top4v6 => "top-4v6",
        }
    }

    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "top-4v7" => Some(Revision::Top4v7),
            "top-4v6" => Some(Revision::Top4v6),
            _ => None,
        }
    }

    fn top_volts(&self) -> f64 {
        match self {
            Revision::Top4v7 => 4.7,
            Revision::Top4v6 => 4.6,
        }
    }

    /// Named bins for this revision.
    #[must_use]
    pub fn bins(&self) -> CalibrationBins {
        let bin = |volts: f64, codes: &[u8]| BinSpec {
            volts,
            codes: codes.to_vec(),
        };
        CalibrationBins {
            off: vec![bin(1.25, &OFF_1V25)],
            on: vec![
                bin(1.9, &ON_1V9),
                bin(2.0, &ON_2V0),
                bin(2.4, &ON_2V4),
                bin(2.6, &ON_2V6),
                bin(2.8, &ON_2V8),
                bin(3.5, &ON_3V5),
                bin(4.2, &ON_4V2),
                bin(self.top_volts(), &ON_TOP),
            ],
            enabled_fallback: LOWEST_ENABLED_VOLTS,
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// One named bin: a level and the codes that select it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinSpec {
    pub volts: f64,
    pub codes: Vec<u8>,
}

/// Raw bin lists for both switch positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBins {
    pub off: Vec<BinSpec>,
    pub on: Vec<BinSpec>,
    /// Level of power-enabled codes not listed in any bin.
    pub enabled_fallback: f64,
}

// =============================================================================
// VOLTAGE CODE TABLE
// =============================================================================

/// Immutable, fully expanded (code, switch state) → expected volts table.
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageCodeTable {
    label: String,
    off: [f64; 256],
    on: [f64; 256],
}

impl VoltageCodeTable {
    /// Expand a built-in revision.
    #[must_use]
    pub fn from_revision(revision: Revision) -> Self {
        // Built-in bins are validated by the test suite.
        Self::expand(revision.key(), &revision.bins())
    }

    /// Validate and expand custom bins.
    ///
    /// Rejects a code listed twice within one switch position, two bins with
    /// the same level, a listed code without both power-enable bits, and
    /// non-positive levels.
    pub fn from_bins(label: impl Into<String>, bins: &CalibrationBins) -> Result<Self, QcError> {
        for (state, list) in [(SwitchState::Off, &bins.off), (SwitchState::On, &bins.on)] {
            let mut owner: BTreeMap<u8, f64> = BTreeMap::new();
            for (i, bin) in list.iter().enumerate() {
                if !(bin.volts > 0.0) {
                    return Err(QcError::Configuration(format!(
                        "calibration: switches {} bin #{} has non-positive level {}",
                        state, i, bin.volts
                    )));
                }
                if list[..i].iter().any(|b| b.volts == bin.volts) {
                    return Err(QcError::Configuration(format!(
                        "calibration: switches {} has two bins at {} V",
                        state, bin.volts
                    )));
                }
                for &code in &bin.codes {
                    if !power_enabled(code) {
                        return Err(QcError::Configuration(format!(
                            "calibration: code {:#04x} in {} V bin lacks the power-enable bits",
                            code, bin.volts
                        )));
                    }
                    if let Some(prev) = owner.insert(code, bin.volts) {
                        return Err(QcError::Configuration(format!(
                            "calibration: code {:#04x} listed in both {} V and {} V bins (switches {})",
                            code, prev, bin.volts, state
                        )));
                    }
                }
            }
        }
        if !(bins.enabled_fallback > 0.0) {
            return Err(QcError::Configuration(
                "calibration: enabled_fallback must be positive".to_string(),
            ));
        }
        Ok(Self::expand(label, bins))
    }

    fn expand(label: impl Into<String>, bins: &CalibrationBins) -> Self {
        let fill = |list: &[BinSpec]| {
            let mut table = [0.0f64; 256];
            for code in 0..=255u8 {
                if power_enabled(code) {
                    table[code as usize] = bins.enabled_fallback;
                }
            }
            for bin in list {
                for &code in &bin.codes {
                    table[code as usize] = bin.volts;
                }
            }
            table
        };
        Self {
            label: label.into(),
            off: fill(&bins.off),
            on: fill(&bins.on),
        }
    }

    /// Name of the calibration this table was built from.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Expected VCAN level for a drive code.
    #[must_use]
    pub fn voltage_for_code(&self, code: u8, state: SwitchState) -> f64 {
        match state {
            SwitchState::Off => self.off[code as usize],
            SwitchState::On => self.on[code as usize],
        }
    }

    /// Distinct levels the table can return (including 0.0), ascending.
    #[must_use]
    pub fn levels(&self) -> Vec<f64> {
        let mut levels: Vec<f64> = self.off.iter().chain(self.on.iter()).copied().collect();
        levels.sort_by(f64::total_cmp);
        levels.dedup();
        levels
    }

    /// Highest code whose expected level with switches ON is the table maximum.
    #[must_use]
    pub fn max_voltage_code(&self) -> u8 {
        let mut best = 0u8;
        for code in 0..=255u8 {
            if self.on[code as usize] > self.on[best as usize] {
                best = code;
            }
        }
        best
    }
}

// =============================================================================
// TOLERANCE THRESHOLDS
// =============================================================================

/// Which of the three magnitudes applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ToleranceClass {
    Zero,
    Standard,
    HighVoltage,
}

/// Absolute tolerances for one measurement path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToleranceThresholds {
    pub zero_threshold: f64,
    pub standard: f64,
    pub high_voltage: f64,
    pub high_voltage_cutoff: f64,
}

impl ToleranceThresholds {
    /// Classify an expected level. The three predicates are disjoint.
    #[must_use]
    pub fn classify(&self, expected: f64) -> ToleranceClass {
        if expected.abs() < ZERO_EPSILON {
            ToleranceClass::Zero
        } else if expected > self.high_voltage_cutoff {
            ToleranceClass::HighVoltage
        } else {
            ToleranceClass::Standard
        }
    }

    /// Absolute tolerance for an expected level.
    #[must_use]
    pub fn tolerance_for(&self, expected: f64) -> f64 {
        match self.classify(expected) {
            ToleranceClass::Zero => self.zero_threshold,
            ToleranceClass::Standard => self.standard,
            ToleranceClass::HighVoltage => self.high_voltage,
        }
    }

    /// Band for an expected level.
    #[must_use]
    pub fn band(&self, expected: f64) -> ToleranceBand {
        ToleranceBand {
            expected,
            tolerance: self.tolerance_for(expected),
        }
    }
}

/// `expected ± tolerance`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ToleranceBand {
    pub expected: f64,
    pub tolerance: f64,
}

impl ToleranceBand {
    /// Inclusive check. NaN is never accepted.
    #[must_use]
    pub fn accepts(&self, measured: f64) -> bool {
        (measured - self.expected).abs() <= self.tolerance
    }

    #[must_use]
    pub fn as_range(&self) -> SafetyRange {
        SafetyRange::new(self.expected - self.tolerance, self.expected + self.tolerance)
    }
}

// =============================================================================
// TOLERANCE MODEL
// =============================================================================

/// Code table plus one set of thresholds per measurement path.
///
/// The fast SPI readback and the precise I2C readback are judged with their
/// own standard and high-voltage magnitudes; the zero threshold is shared.
#[derive(Debug, Clone, PartialEq)]
pub struct ToleranceModel {
    pub table: VoltageCodeTable,
    pub spi: ToleranceThresholds,
    pub i2c: ToleranceThresholds,
}

impl ToleranceModel {
    #[must_use]
    pub fn expected(&self, code: u8, state: SwitchState) -> f64 {
        self.table.voltage_for_code(code, state)
    }

    #[must_use]
    pub fn spi_band(&self, code: u8, state: SwitchState) -> ToleranceBand {
        self.spi.band(self.expected(code, state))
    }

    #[must_use]
    pub fn i2c_band(&self, code: u8, state: SwitchState) -> ToleranceBand {
        self.i2c.band(self.expected(code, state))
    }
}

// =============================================================================
// RANGE DERIVATION
// =============================================================================

/// Symmetric range `nominal · (1 ∓ percent/100)`.
#[must_use]
pub fn range_from_nominal(nominal: f64, percent: f64) -> SafetyRange {
    let p = percent / 100.0;
    let a = nominal * (1.0 - p);
    let b = nominal * (1.0 + p);
    SafetyRange::new(a.min(b), a.max(b))
}

// =============================================================================
// TESTS
// =============================================================================
