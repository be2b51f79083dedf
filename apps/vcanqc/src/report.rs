//! # Result Log
//!
//! Stage results leave the engine through [`ResultSink`]. This module has
//! the two sinks the bench uses:
//!
//! | Sink | Output |
//! |------|--------|
//! | [`JsonLinesSink`] | one JSON object per line, appended to a file |
//! | [`Console`] | one human line (or JSON line) per result on stdout, then forwards |
//!
//! Every result record carries the session identity so a log file can be
//! grepped by serial number without any other context.

use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;
use vcanqc_core::{
    Diagnostics, QcError, ResultSink, SequenceReport, SequenceState, SessionContext, StageId,
    TestResult, TestStatus,
};

// =============================================================================
// RECORDS
// =============================================================================

#[derive(Serialize)]
struct ResultRecord<'a> {
    record: &'static str,
    timestamp_ms: u64,
    operator: &'a str,
    serial_number: &'a str,
    master_id: &'a str,
    psu_voltage: Option<f64>,
    stage: StageId,
    stage_name: &'static str,
    status: TestStatus,
    diagnostics: &'a Diagnostics,
}

impl<'a> ResultRecord<'a> {
    fn new(result: &'a TestResult, ctx: &'a SessionContext) -> Self {
        Self {
            record: "result",
            timestamp_ms: result.timestamp_ms,
            operator: &ctx.operator,
            serial_number: &ctx.serial_number,
            master_id: &ctx.master_id,
            psu_voltage: ctx.psu_voltage,
            stage: result.stage,
            stage_name: result.stage.name(),
            status: result.status,
            diagnostics: &result.diagnostics,
        }
    }
}

#[derive(Serialize)]
struct StageLine {
    stage: StageId,
    status: TestStatus,
}

#[derive(Serialize)]
struct SummaryRecord<'a> {
    record: &'static str,
    timestamp_ms: u64,
    operator: &'a str,
    serial_number: &'a str,
    master_id: &'a str,
    state: SequenceState,
    overall: TestStatus,
    stages: Vec<StageLine>,
}

impl<'a> SummaryRecord<'a> {
    fn new(report: &SequenceReport, ctx: &'a SessionContext) -> Self {
        Self {
            record: "summary",
            timestamp_ms: vcanqc_core::types::unix_millis(),
            operator: &ctx.operator,
            serial_number: &ctx.serial_number,
            master_id: &ctx.master_id,
            state: report.state,
            overall: report.overall(),
            stages: report
                .results
                .results()
                .iter()
                .map(|r| StageLine {
                    stage: r.stage,
                    status: r.status,
                })
                .collect(),
        }
    }
}

fn to_line<T: Serialize>(value: &T) -> Result<String, QcError> {
    serde_json::to_string(value).map_err(|e| QcError::Io(format!("cannot encode record: {}", e)))
}

// =============================================================================
// JSON LINES SINK
// =============================================================================

/// Appends one JSON record per line.
pub struct JsonLinesSink<W: Write> {
    out: W,
    records: usize,
}

impl JsonLinesSink<BufWriter<File>> {
    /// Open `path` for appending, creating it if needed.
    pub fn append(path: &Path) -> Result<Self, QcError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| QcError::Io(format!("cannot open {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "result log opened");
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out, records: 0 }
    }

    /// Records written so far.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Write the closing record of a sequence run.
    pub fn write_summary(
        &mut self,
        report: &SequenceReport,
        ctx: &SessionContext,
    ) -> Result<(), QcError> {
        self.write_line(&SummaryRecord::new(report, ctx))
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line<T: Serialize>(&mut self, value: &T) -> Result<(), QcError> {
        let line = to_line(value)?;
        writeln!(self.out, "{}", line)?;
        // a crash mid-sequence must not lose finished stages
        self.out.flush()?;
        self.records += 1;
        Ok(())
    }
}

impl<W: Write> ResultSink for JsonLinesSink<W> {
    fn record(&mut self, result: &TestResult, ctx: &SessionContext) -> Result<(), QcError> {
        self.write_line(&ResultRecord::new(result, ctx))
    }
}

// =============================================================================
// CONSOLE
// =============================================================================

/// One line for the operator.
pub fn render_result(result: &TestResult) -> String {
    let tag = format!("[{}]", result.status);
    let mut line = format!("{:<10} {}", tag, result.stage.name());
    if let Diagnostics::Error { message } = &result.diagnostics {
        line.push_str(&format!(": {}", message));
    }
    line
}

/// Echoes every result to stdout and forwards it to the log, if any.
pub struct Console<'a> {
    json_mode: bool,
    log: Option<&'a mut dyn ResultSink>,
}

impl<'a> Console<'a> {
    pub fn new(json_mode: bool, log: Option<&'a mut dyn ResultSink>) -> Self {
        Self { json_mode, log }
    }
}

impl ResultSink for Console<'_> {
    fn record(&mut self, result: &TestResult, ctx: &SessionContext) -> Result<(), QcError> {
        if self.json_mode {
            println!("{}", to_line(&ResultRecord::new(result, ctx))?);
        } else {
            println!("{}", render_result(result));
        }
        match self.log.as_deref_mut() {
            Some(log) => log.record(result, ctx),
            None => Ok(()),
        }
    }
}

/// Print the end-of-run summary.
pub fn print_summary(report: &SequenceReport, ctx: &SessionContext, json_mode: bool) {
    if json_mode {
        match to_line(&SummaryRecord::new(report, ctx)) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "summary not printed"),
        }
        return;
    }

    println!();
    println!("QC Summary");
    println!("==========");
    println!("Operator:      {}", ctx.operator);
    println!("Serial number: {}", ctx.serial_number);
    println!("Master:        {}", ctx.master_id);
    println!();
    for result in report.results.results() {
        println!("  {}", render_result(result));
    }
    println!();
    println!("Overall: {}", report.overall());
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use vcanqc_core::{SafetyRange, SafetyRanges};

    fn ctx() -> SessionContext {
        let r = SafetyRange::new(0.0, 1.0);
        SessionContext::new(
            "alice",
            "00001234",
            "QC-Station-01",
            SafetyRanges {
                cic_voltage: r,
                cic_current: r,
                vcan_voltage: r,
                vcan_current: r,
            },
        )
    }

    #[test]
    fn render_includes_error_message() {
        let err = QcError::Interrupted;
        let result = TestResult::new(StageId::Voltage, TestStatus::Fail, Diagnostics::error(&err));
        let line = render_result(&result);
        assert!(line.starts_with("[FAIL]"));
        assert!(line.contains("Voltage Channels"));
        assert!(line.ends_with("Interrupted by user"));
    }

    #[test]
    fn record_line_carries_session_identity() {
        let mut sink = JsonLinesSink::new(Vec::new());
        let result = TestResult::new(StageId::Temperature, TestStatus::Pass, Diagnostics::None);
        sink.record(&result, &ctx()).unwrap();
        assert_eq!(sink.records(), 1);

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value["record"], "result");
        assert_eq!(value["serial_number"], "00001234");
        assert_eq!(value["stage"], "temperature");
        assert_eq!(value["status"], "PASS");
        assert_eq!(value["diagnostics"]["kind"], "none");
    }

    #[test]
    fn console_forwards_to_log() {
        let mut log: Vec<TestResult> = Vec::new();
        {
            let mut console = Console::new(false, Some(&mut log));
            let result = TestResult::new(StageId::Can, TestStatus::Pass, Diagnostics::None);
            console.record(&result, &ctx()).unwrap();
        }
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].stage, StageId::Can);
    }
}
