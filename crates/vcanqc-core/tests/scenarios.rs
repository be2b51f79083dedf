//! # Acceptance Scenarios
//!
//! End-to-end behaviour against the simulated tester: tolerance decisions,
//! burnout abort, CAN timeout and sequence halting.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::time::Duration;
use vcanqc_core::sim::CanBehavior;
use vcanqc_core::stages::voltage::{CodeReadings, evaluate_code};
use vcanqc_core::stages::{self, BurnoutConfig, BurnoutMode, CanConfig, Diagnostics};
use vcanqc_core::{
    CancelToken, Channel, ConfiguredStages, QcConfig, Revision, SafetyRange, SafetyRanges,
    SequenceState, SerialCommand, SerialLink, SessionContext, SimulatedTester, StageId,
    SwitchState, TestResult, TestStatus, ToleranceModel, ToleranceThresholds, VoltageCodeTable,
    run_sequence,
};

fn model() -> ToleranceModel {
    let thresholds = ToleranceThresholds {
        zero_threshold: 0.05,
        standard: 0.05,
        high_voltage: 0.15,
        high_voltage_cutoff: 4.0,
    };
    ToleranceModel {
        table: VoltageCodeTable::from_revision(Revision::Top4v7),
        spi: thresholds,
        i2c: thresholds,
    }
}

fn readings(a: f64, b: f64) -> CodeReadings {
    CodeReadings {
        spi_a: Some(a),
        spi_b: Some(b),
        i2c_a: Some(a),
        i2c_b: Some(b),
    }
}

fn session(vcan_voltage: SafetyRange) -> SessionContext {
    SessionContext::new(
        "operator",
        "00001234",
        "QC-Station-01",
        SafetyRanges {
            cic_voltage: SafetyRange::new(2.97, 3.63),
            cic_current: SafetyRange::new(0.05, 0.2),
            vcan_voltage,
            vcan_current: SafetyRange::new(0.0, 0.5),
        },
    )
}

// =============================================================================
// SCENARIO A / B: code evaluation
// =============================================================================

#[test]
fn scenario_a_code_1f_on_passes_at_two_volts() {
    let sample = evaluate_code(&model(), 0x1f, SwitchState::On, readings(2.0, 2.0));
    assert_eq!(sample.expected, 2.0);
    assert_eq!(sample.spi_tolerance, 0.05);
    assert!(sample.passed());
}

#[test]
fn scenario_b_zero_code_uses_zero_threshold() {
    let ok = evaluate_code(&model(), 0x00, SwitchState::Off, readings(0.02, 0.0));
    assert_eq!(ok.expected, 0.0);
    assert!(ok.passed());

    let bad = evaluate_code(&model(), 0x00, SwitchState::Off, readings(0.2, 0.0));
    assert!(!bad.passed());
    assert!(bad.fail_a);
    assert!(!bad.fail_b);
}

// =============================================================================
// SCENARIO C: burnout abort
// =============================================================================

#[test]
fn scenario_c_burnout_aborts_on_third_poll_and_powers_down() {
    let sim = SimulatedTester::default().with_rail_script([3.2, 3.3, 4.0]);
    let mut link = SerialLink::new(sim, CancelToken::new());
    let cfg = BurnoutConfig {
        mode: BurnoutMode::Host,
        duration: Duration::from_secs(10),
        poll_interval: Duration::from_millis(10),
        step_gap: Duration::ZERO,
        settle: Duration::ZERO,
        ..BurnoutConfig::default()
    };

    let outcome = stages::burnout::run(&session(SafetyRange::new(3.0, 3.6)), &mut link, &cfg);

    assert!(!outcome.passed);
    assert_eq!(outcome.status, TestStatus::Fail);
    let Diagnostics::Burnout(report) = &outcome.diagnostics else {
        panic!("unexpected diagnostics {:?}", outcome.diagnostics);
    };
    assert_eq!(report.polls, 3);
    assert!(!report.completed);
    assert!(report.abort_reason.as_deref().unwrap().starts_with("V_A 4.000"));

    let sim = link.into_inner();
    assert!(!sim.is_energized());
    let log = sim.commands();
    assert_eq!(
        &log[log.len() - 2..],
        &[SerialCommand::SetVcanVoltage(0), SerialCommand::SetI2cCurrent(0)]
    );
}

// =============================================================================
// SCENARIO D: CAN timeout
// =============================================================================

#[test]
fn scenario_d_can_timeout_for_ten_messages() {
    assert_eq!(CanConfig::default().timeout_for(10), Duration::from_secs(6));
}

#[test]
fn scenario_d_silent_firmware_fails_with_timeout_detail() {
    let sim = SimulatedTester::default().with_can(CanBehavior::Silent);
    let mut link = SerialLink::new(sim, CancelToken::new());
    let cfg = CanConfig {
        base_timeout: Duration::from_millis(100),
        per_message: Duration::from_millis(5),
        ..CanConfig::default()
    };

    let outcome = stages::can::run_phases(
        &session(SafetyRange::new(3.0, 3.6)),
        &mut link,
        &cfg,
        StageId::Can,
        &[10],
    );

    assert!(!outcome.passed);
    assert_eq!(outcome.status, TestStatus::Fail);
    let Diagnostics::Can(report) = &outcome.diagnostics else {
        panic!("unexpected diagnostics {:?}", outcome.diagnostics);
    };
    let phase = &report.phases[0];
    assert!(phase.timed_out);
    assert_eq!(phase.timeout_ms, 150);
    assert!(phase.detail.starts_with("timeout after"));
    // all progress lines were seen before the deadline
    assert_eq!(phase.progress.len(), 4);
    assert!(!link.into_inner().is_energized());
}

// =============================================================================
// SCENARIO E: sequence halts after a failing stage
// =============================================================================

const BENCH_CONFIG: &str = r#"
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

#[test]
fn scenario_e_voltage_failure_halts_sequence() {
    let config = QcConfig::from_toml_str(BENCH_CONFIG).unwrap();
    let sim = SimulatedTester::default().with_code_fault(0x1f, Channel::A, 0.5);
    let mut switches = sim.switches();
    let mut link = SerialLink::new(sim, CancelToken::new());
    let ctx = session(SafetyRange::new(2.97, 3.63));

    let sequence = [StageId::Voltage, StageId::Current, StageId::Can];
    let mut sink: Vec<TestResult> = Vec::new();
    let report = {
        let mut runner = ConfiguredStages::new(&mut link, &config, &mut switches);
        run_sequence(&ctx, &mut runner, &sequence, &mut sink)
    };

    assert_eq!(report.state, SequenceState::Aborted { at: 0 });
    assert_eq!(report.overall(), TestStatus::Fail);
    assert_eq!(report.results.len(), 1);
    assert_eq!(sink.len(), 1);
    assert_eq!(sink[0].stage, StageId::Voltage);
    assert_eq!(sink[0].status, TestStatus::Fail);

    let sim = link.into_inner();
    assert!(!sim.is_energized());
    for command in sim.commands() {
        assert!(!matches!(command, SerialCommand::RunCanTest(_)), "CAN test ran");
        assert!(
            !matches!(command, SerialCommand::SetI2cCurrent(dac) if *dac != 0),
            "current check ran"
        );
    }
}

#[test]
fn full_sequence_passes_on_a_healthy_board() {
    let config = QcConfig::from_toml_str(BENCH_CONFIG).unwrap();
    let sim = SimulatedTester::default()
        .with_rail_voltage(Channel::A, 3.3)
        .with_rail_voltage(Channel::B, 3.3);
    let mut switches = sim.switches();
    let mut link = SerialLink::new(sim, CancelToken::new());
    let ctx = session(SafetyRange::new(2.97, 3.63));

    let mut sink: Vec<TestResult> = Vec::new();
    let report = {
        let mut runner = ConfiguredStages::new(&mut link, &config, &mut switches);
        run_sequence(&ctx, &mut runner, &config.sequence, &mut sink)
    };

    let statuses: Vec<_> = sink.iter().map(|r| (r.stage, r.status)).collect();
    assert_eq!(report.state, SequenceState::Completed, "{statuses:?}");
    assert_eq!(report.overall(), TestStatus::Pass);
    assert_eq!(sink.len(), 7);
    assert!(!link.into_inner().is_energized());
}
