//! # Sequence Orchestrator
//!
//! Runs an ordered list of stages with a pre-check before each one and stops
//! at the first failure.
//!
//! ```text
//! NotStarted ─▶ Running(0) ─▶ Running(1) ─▶ ... ─▶ Completed
//!                   │              │
//!                   └──────────────┴─▶ Aborted { at }
//! ```
//!
//! - The initial check is never pre-checked; it *is* the check.
//! - A failed pre-check records the stage it guarded as ABORTED.
//! - A stage returning `passed = false` is recorded with its own status.
//! - Unreached stages are never recorded.
//!
//! Results go to a [`ResultSink`] as they are produced; a failing sink is
//! logged and does not affect the run.

use crate::config::QcConfig;
use crate::link::{SerialLink, Transport};
use crate::stages::{self, Operator, StageOutcome};
use crate::types::{QcError, SessionContext, StageId, TestResult, TestStatus};
use serde::Serialize;
use tracing::{error, info, warn};

// =============================================================================
// RESULTS
// =============================================================================

/// Where the orchestrator hands each finished result.
pub trait ResultSink {
    fn record(&mut self, result: &TestResult, ctx: &SessionContext) -> Result<(), QcError>;
}

/// Collects results in memory.
impl ResultSink for Vec<TestResult> {
    fn record(&mut self, result: &TestResult, _ctx: &SessionContext) -> Result<(), QcError> {
        self.push(result.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceState {
    NotStarted,
    Running(usize),
    /// Stopped before or at stage index `at`.
    Aborted { at: usize },
    Completed,
}

/// Every attempted stage of one run, in order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultSet {
    results: Vec<TestResult>,
}

impl ResultSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: TestResult) {
        self.results.push(result);
    }

    #[must_use]
    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    #[must_use]
    pub fn get(&self, stage: StageId) -> Option<&TestResult> {
        self.results.iter().find(|r| r.stage == stage)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Final state and results of a sequence.
#[derive(Debug, Clone, Serialize)]
pub struct SequenceReport {
    pub state: SequenceState,
    pub results: ResultSet,
}

impl SequenceReport {
    /// PASS only when every stage ran and every result is PASS.
    ///
    /// A completed run with PARTIAL or non-blocking FAIL results (the
    /// temperature check) is PARTIAL; an aborted run is FAIL.
    #[must_use]
    pub fn overall(&self) -> TestStatus {
        match self.state {
            SequenceState::NotStarted | SequenceState::Running(_) => TestStatus::Skipped,
            SequenceState::Aborted { .. } => TestStatus::Fail,
            SequenceState::Completed => {
                if self
                    .results
                    .results()
                    .iter()
                    .all(|r| r.status == TestStatus::Pass)
                {
                    TestStatus::Pass
                } else {
                    TestStatus::Partial
                }
            }
        }
    }
}

// =============================================================================
// STAGE DISPATCH
// =============================================================================

/// Something that can run stages by id.
pub trait StageRunner {
    /// Short-form initial check gating the next stage.
    fn pre_check(&mut self, ctx: &SessionContext) -> StageOutcome;
    fn run(&mut self, ctx: &SessionContext, stage: StageId) -> StageOutcome;
    /// Whether the operator asked to stop.
    fn is_cancelled(&self) -> bool;
}

/// The real stages, wired to a link, the validated config and an operator.
pub struct ConfiguredStages<'a, T: Transport> {
    link: &'a mut SerialLink<T>,
    config: &'a QcConfig,
    operator: &'a mut dyn Operator,
}

type StageFn<T> = fn(&mut ConfiguredStages<'_, T>, &SessionContext) -> StageOutcome;

impl<'a, T: Transport> ConfiguredStages<'a, T> {
    pub fn new(
        link: &'a mut SerialLink<T>,
        config: &'a QcConfig,
        operator: &'a mut dyn Operator,
    ) -> Self {
        Self {
            link,
            config,
            operator,
        }
    }

    /// Dispatch table from stage id to stage entry point.
    fn entry(stage: StageId) -> StageFn<T> {
        match stage {
            StageId::InitialCheck => {
                |s, ctx| stages::initial::run(ctx, &mut *s.link, &s.config.initial_check)
            }
            StageId::Voltage => |s, ctx| {
                let cfg = s.config;
                stages::voltage::run(ctx, &mut *s.link, &cfg.model, &cfg.voltage, &mut *s.operator)
            },
            StageId::Current => |s, ctx| {
                let cfg = s.config;
                stages::current::run(ctx, &mut *s.link, &cfg.model.table, &cfg.current)
            },
            StageId::Temperature => {
                |s, ctx| stages::temperature::run(ctx, &mut *s.link, &s.config.temperature)
            }
            StageId::Can => |s, ctx| stages::can::run(ctx, &mut *s.link, &s.config.can),
            StageId::Burnout => |s, ctx| stages::burnout::run(ctx, &mut *s.link, &s.config.burnout),
            StageId::CanPostBurnout => {
                |s, ctx| stages::can::run_post_burnout(ctx, &mut *s.link, &s.config.can)
            }
        }
    }
}

impl<T: Transport> StageRunner for ConfiguredStages<'_, T> {
    fn pre_check(&mut self, ctx: &SessionContext) -> StageOutcome {
        stages::initial::pre_check(ctx, &mut *self.link, &self.config.initial_check)
    }

    fn run(&mut self, ctx: &SessionContext, stage: StageId) -> StageOutcome {
        Self::entry(stage)(self, ctx)
    }

    fn is_cancelled(&self) -> bool {
        self.link.cancel_token().is_cancelled()
    }
}

// =============================================================================
// ORCHESTRATION
// =============================================================================

fn record(
    sink: &mut dyn ResultSink,
    set: &mut ResultSet,
    ctx: &SessionContext,
    result: TestResult,
) {
    if let Err(e) = sink.record(&result, ctx) {
        warn!(stage = %result.stage, error = %e, "result sink failed");
    }
    set.push(result);
}

/// Run `sequence` in order, gating each stage on a pre-check.
pub fn run_sequence<R: StageRunner + ?Sized>(
    ctx: &SessionContext,
    runner: &mut R,
    sequence: &[StageId],
    sink: &mut dyn ResultSink,
) -> SequenceReport {
    let mut results = ResultSet::new();
    let mut state = SequenceState::NotStarted;
    info!(
        operator = %ctx.operator,
        serial = %ctx.serial_number,
        master = %ctx.master_id,
        stages = sequence.len(),
        "starting test sequence"
    );

    for (i, &stage) in sequence.iter().enumerate() {
        if runner.is_cancelled() {
            warn!(stage = %stage, "sequence interrupted before stage");
            state = SequenceState::Aborted { at: i };
            break;
        }
        state = SequenceState::Running(i);
        info!(step = i + 1, of = sequence.len(), stage = %stage, "stage");

        if stage != StageId::InitialCheck {
            let pre = runner.pre_check(ctx);
            if !pre.passed {
                error!(stage = %stage, "pre-check failed, aborting sequence");
                record(
                    sink,
                    &mut results,
                    ctx,
                    TestResult::new(stage, TestStatus::Aborted, pre.diagnostics),
                );
                state = SequenceState::Aborted { at: i };
                break;
            }
        }

        let outcome = runner.run(ctx, stage);
        let passed = outcome.passed;
        record(
            sink,
            &mut results,
            ctx,
            TestResult::new(stage, outcome.status, outcome.diagnostics),
        );
        if !passed {
            error!(stage = %stage, "stage failed, aborting sequence");
            state = SequenceState::Aborted { at: i };
            break;
        }
    }

    if !matches!(state, SequenceState::Aborted { .. }) {
        state = SequenceState::Completed;
    }
    let report = SequenceReport { state, results };
    info!(overall = %report.overall(), attempted = report.results.len(), "sequence finished");
    report
}

/// Run one stage on its own, after its pre-check.
///
/// A failed pre-check records the stage as SKIPPED without running it.
pub fn run_single<R: StageRunner + ?Sized>(
    ctx: &SessionContext,
    runner: &mut R,
    stage: StageId,
    sink: &mut dyn ResultSink,
) -> TestResult {
    let mut set = ResultSet::new();
    let result = if stage == StageId::InitialCheck {
        let outcome = runner.run(ctx, stage);
        TestResult::new(stage, outcome.status, outcome.diagnostics)
    } else {
        let pre = runner.pre_check(ctx);
        if pre.passed {
            let outcome = runner.run(ctx, stage);
            TestResult::new(stage, outcome.status, outcome.diagnostics)
        } else {
            warn!(stage = %stage, "initial checks failed, stage skipped");
            TestResult::new(stage, TestStatus::Skipped, pre.diagnostics)
        }
    };
    record(sink, &mut set, ctx, result.clone());
    result
}

// =============================================================================
// SESSION SETUP
// =============================================================================

/// Operator-supplied identity for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub operator: String,
    pub serial_number: String,
    /// Lab supply voltage entered at the bench; wins over every other source.
    pub psu_voltage: Option<f64>,
}

/// Validate the identity, query the tester and resolve the safety ranges.
///
/// The PSU voltage used for the VCAN range is the operator's, else the
/// tester's `TEST_INFO` report, else the configured lab supply. A tester
/// that does not answer `GET_TEST_INFO` leaves the master id as `unknown`.
///
/// Identity and every range that does not need the PSU voltage are checked
/// before anything is written to the link.
pub fn open_session<T: Transport>(
    link: &mut SerialLink<T>,
    config: &QcConfig,
    request: &SessionRequest,
) -> Result<SessionContext, QcError> {
    if request.operator.trim().is_empty() {
        return Err(QcError::Configuration("operator name is empty".to_string()));
    }
    config.validate_serial_number(&request.serial_number)?;
    config.ranges.resolve_fixed()?;

    let (master_id, reported_psu) = match link.test_info() {
        Ok((id, psu)) => {
            info!(master = %id, psu_v = psu, "tester identified");
            (id, Some(psu))
        }
        Err(QcError::Interrupted) => return Err(QcError::Interrupted),
        Err(e) => {
            warn!(error = %e, "tester did not report TEST_INFO");
            ("unknown".to_string(), None)
        }
    };

    let psu = request
        .psu_voltage
        .or(reported_psu.filter(|v| *v > 0.0))
        .or(config.tester.lab_power_supply_voltage_v);
    let ranges = config.ranges.resolve(psu)?;

    let ctx = SessionContext::new(
        request.operator.trim(),
        request.serial_number.as_str(),
        master_id,
        ranges,
    );
    Ok(match psu {
        Some(v) => ctx.with_psu_voltage(v),
        None => ctx,
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::stages::Diagnostics;
    use crate::types::{SafetyRange, SafetyRanges};
    use std::collections::BTreeMap;

    /// Runner with canned outcomes; any stage not listed passes.
    #[derive(Default)]
    struct Canned {
        fail_stage: BTreeMap<StageId, TestStatus>,
        fail_pre_check_at: Option<usize>,
        pre_checks: usize,
        ran: Vec<StageId>,
        cancelled: bool,
    }

    impl StageRunner for Canned {
        fn pre_check(&mut self, _ctx: &SessionContext) -> StageOutcome {
            let i = self.pre_checks;
            self.pre_checks += 1;
            StageOutcome::from_verdict(self.fail_pre_check_at != Some(i), Diagnostics::None)
        }

        fn run(&mut self, _ctx: &SessionContext, stage: StageId) -> StageOutcome {
            self.ran.push(stage);
            match self.fail_stage.get(&stage) {
                Some(TestStatus::Partial) => StageOutcome {
                    passed: true,
                    status: TestStatus::Partial,
                    diagnostics: Diagnostics::None,
                },
                Some(_) => StageOutcome::fail(Diagnostics::None),
                None => StageOutcome::pass(Diagnostics::None),
            }
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled
        }
    }

    fn ctx() -> SessionContext {
        let r = SafetyRange::new(0.0, 1.0);
        SessionContext::new(
            "op",
            "1",
            "m",
            SafetyRanges {
                cic_voltage: r,
                cic_current: r,
                vcan_voltage: r,
                vcan_current: r,
            },
        )
    }

    const ALL: [StageId; 7] = crate::config::DEFAULT_SEQUENCE;

    #[test]
    fn all_passing_completes() {
        let mut runner = Canned::default();
        let mut sink = Vec::new();
        let report = run_sequence(&ctx(), &mut runner, &ALL, &mut sink);
        assert_eq!(report.state, SequenceState::Completed);
        assert_eq!(report.overall(), TestStatus::Pass);
        assert_eq!(report.results.len(), 7);
        assert_eq!(sink.len(), 7);
        // no pre-check before the initial check
        assert_eq!(runner.pre_checks, 6);
    }

    #[test]
    fn failed_stage_stops_the_sequence() {
        let mut runner = Canned::default();
        runner.fail_stage.insert(StageId::Current, TestStatus::Fail);
        let mut sink = Vec::new();
        let report = run_sequence(&ctx(), &mut runner, &ALL, &mut sink);

        assert_eq!(report.state, SequenceState::Aborted { at: 2 });
        assert_eq!(runner.ran, vec![StageId::InitialCheck, StageId::Voltage, StageId::Current]);
        assert_eq!(report.results.get(StageId::Current).unwrap().status, TestStatus::Fail);
        assert!(report.results.get(StageId::Temperature).is_none());
        assert_eq!(report.overall(), TestStatus::Fail);
    }

    #[test]
    fn failed_pre_check_records_aborted() {
        let mut runner = Canned {
            fail_pre_check_at: Some(1),
            ..Canned::default()
        };
        let mut sink = Vec::new();
        let report = run_sequence(&ctx(), &mut runner, &ALL, &mut sink);

        assert_eq!(report.state, SequenceState::Aborted { at: 2 });
        assert_eq!(runner.ran, vec![StageId::InitialCheck, StageId::Voltage]);
        let last = report.results.results().last().unwrap();
        assert_eq!(last.stage, StageId::Current);
        assert_eq!(last.status, TestStatus::Aborted);
    }

    #[test]
    fn partial_stage_continues_but_marks_overall() {
        let mut runner = Canned::default();
        runner.fail_stage.insert(StageId::Temperature, TestStatus::Partial);
        let mut sink = Vec::new();
        let report = run_sequence(&ctx(), &mut runner, &ALL, &mut sink);
        assert_eq!(report.state, SequenceState::Completed);
        assert_eq!(report.overall(), TestStatus::Partial);
    }

    #[test]
    fn cancelled_before_start_records_nothing() {
        let mut runner = Canned {
            cancelled: true,
            ..Canned::default()
        };
        let mut sink = Vec::new();
        let report = run_sequence(&ctx(), &mut runner, &ALL, &mut sink);
        assert_eq!(report.state, SequenceState::Aborted { at: 0 });
        assert!(report.results.is_empty());
        assert!(runner.ran.is_empty());
    }

    #[test]
    fn single_stage_skipped_when_pre_check_fails() {
        let mut runner = Canned {
            fail_pre_check_at: Some(0),
            ..Canned::default()
        };
        let mut sink = Vec::new();
        let result = run_single(&ctx(), &mut runner, StageId::Can, &mut sink);
        assert_eq!(result.status, TestStatus::Skipped);
        assert!(runner.ran.is_empty());
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn failing_sink_does_not_stop_the_run() {
        struct Broken;
        impl ResultSink for Broken {
            fn record(&mut self, _: &TestResult, _: &SessionContext) -> Result<(), QcError> {
                Err(QcError::Io("disk full".into()))
            }
        }
        let mut runner = Canned::default();
        let report = run_sequence(&ctx(), &mut runner, &ALL, &mut Broken);
        assert_eq!(report.state, SequenceState::Completed);
        assert_eq!(report.results.len(), 7);
    }
}
