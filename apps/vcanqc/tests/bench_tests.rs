//! Command tests against the simulated tester, with config and result log
//! in a temporary directory.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use vcanqc::cli::{RunOptions, cmd_burnout, cmd_sequence, cmd_stage, cmd_validate};
use vcanqc_core::{CancelToken, QcConfig, QcError, StageId};

const BENCH_CONFIG: &str = r#"
[tester]
serial_number_length = 8
serial_number_numeric_only = true

[calibration]
revision = "top-4v7"

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

[initial_check]
duration_s = 0.05
pre_check_duration_s = 0.02
poll_interval_ms = 10

[voltage]
pass_settle_s = 0

[current]
r_ref_ohms = 10.0
v_ref_dac_volts = 3.3
voltage_codes = [0x1f]
target_current_a = 0.1
current_min_a = 0.08
current_max_a = 0.12
settle_s = 0
voltage_tolerance_v = 0.1

[can]
base_timeout_s = 0.2
per_message_s = 0.001
phase_gap_s = 0

[burnout]
duration_s = 0.05
poll_interval_s = 0.01
settle_s = 0
"#;

fn write_config(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("vcanqc.toml");
    std::fs::write(&path, text).unwrap();
    path
}

fn options(dir: &TempDir, config: PathBuf) -> RunOptions {
    RunOptions {
        config,
        port: None,
        baud: None,
        simulate: true,
        operator: Some("alice".to_string()),
        serial_number: Some("00001234".to_string()),
        psu_voltage: None,
        yes: true,
        results: Some(dir.path().join("results.jsonl")),
        json_mode: false,
    }
}

fn log_records(opts: &RunOptions) -> Vec<serde_json::Value> {
    let text = std::fs::read_to_string(opts.results.as_ref().unwrap()).unwrap();
    text.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

// =============================================================================
// SEQUENCE
// =============================================================================

#[test]
fn test_simulated_sequence_logs_every_stage_and_summary() {
    let dir = TempDir::new().unwrap();
    let opts = options(&dir, write_config(dir.path(), BENCH_CONFIG));

    let passed = cmd_sequence(&opts, CancelToken::new()).unwrap();
    assert!(passed);

    let records = log_records(&opts);
    assert_eq!(records.len(), 8);
    for record in &records[..7] {
        assert_eq!(record["record"], "result");
        assert_eq!(record["serial_number"], "00001234");
        assert_eq!(record["operator"], "alice");
        assert_eq!(record["master_id"], "QC-Station-01");
    }
    assert_eq!(records[0]["stage"], "initial-check");
    assert_eq!(records[6]["stage"], "can-post-burnout");

    let summary = &records[7];
    assert_eq!(summary["record"], "summary");
    assert_eq!(summary["overall"], "PASS");
    assert_eq!(summary["state"], "completed");
    assert_eq!(summary["stages"].as_array().unwrap().len(), 7);
}

#[test]
fn test_log_is_appended_across_runs() {
    let dir = TempDir::new().unwrap();
    let opts = options(&dir, write_config(dir.path(), BENCH_CONFIG));

    assert!(cmd_stage(&opts, CancelToken::new(), StageId::Temperature).unwrap());
    assert!(cmd_stage(&opts, CancelToken::new(), StageId::Temperature).unwrap());

    let records = log_records(&opts);
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r["stage"] == "temperature"));
    assert_eq!(records[0]["diagnostics"]["kind"], "temperature");
}

#[test]
fn test_cancelled_run_is_interrupted() {
    let dir = TempDir::new().unwrap();
    let opts = options(&dir, write_config(dir.path(), BENCH_CONFIG));
    let cancel = CancelToken::new();
    cancel.cancel();

    // cancelled before the tester is even identified
    let err = cmd_sequence(&opts, cancel).unwrap_err();
    assert!(matches!(err, QcError::Interrupted));
}

// =============================================================================
// CONFIGURATION ERRORS
// =============================================================================

#[test]
fn test_bad_config_stops_before_port_is_opened() {
    let dir = TempDir::new().unwrap();
    let broken = BENCH_CONFIG.replace("[calibration]\nrevision = \"top-4v7\"\n", "");
    let mut opts = options(&dir, write_config(dir.path(), &broken));
    opts.simulate = false;
    opts.port = Some("/dev/vcanqc-no-such-port".to_string());

    let err = cmd_sequence(&opts, CancelToken::new()).unwrap_err();
    assert!(matches!(err, QcError::Configuration(_)), "{err}");
    assert!(err.to_string().contains("calibration"));
    assert!(!opts.results.as_ref().unwrap().exists());
}

#[test]
fn test_bad_serial_number_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut opts = options(&dir, write_config(dir.path(), BENCH_CONFIG));
    opts.serial_number = Some("12AB".to_string());

    let err = cmd_stage(&opts, CancelToken::new(), StageId::Voltage).unwrap_err();
    assert!(matches!(err, QcError::Configuration(_)), "{err}");
}

#[test]
fn test_out_of_range_burnout_duration_is_rejected() {
    let dir = TempDir::new().unwrap();
    let opts = options(&dir, write_config(dir.path(), BENCH_CONFIG));

    for secs in [-1.0, 1e20, f64::NAN] {
        let err = cmd_burnout(&opts, CancelToken::new(), None, Some(secs)).unwrap_err();
        assert!(matches!(err, QcError::Configuration(_)), "{secs}: {err}");
        assert!(err.to_string().contains("--duration"));
    }
}

#[test]
fn test_oversized_config_duration_is_a_configuration_error() {
    let dir = TempDir::new().unwrap();
    let text = BENCH_CONFIG.replace("duration_s = 0.05
poll_interval_s", "duration_s = 1e20
poll_interval_s");
    let opts = options(&dir, write_config(dir.path(), &text));

    let err = cmd_validate(&opts).unwrap_err();
    assert!(matches!(err, QcError::Configuration(_)), "{err}");
    assert!(err.to_string().contains("burnout.duration_s"));
}

#[test]
fn test_validate_accepts_bench_config() {
    let dir = TempDir::new().unwrap();
    let mut opts = options(&dir, write_config(dir.path(), BENCH_CONFIG));
    opts.json_mode = true;
    cmd_validate(&opts).unwrap();
}

#[test]
fn test_shipped_sample_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../vcanqc.toml");
    let config = QcConfig::load(&path).unwrap();
    assert_eq!(config.sequence.len(), 7);
    assert_eq!(config.tester.serial_number_length, Some(8));
    assert_eq!(config.model.table.label(), "top-4v7");
}
