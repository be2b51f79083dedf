//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.
//!
//! Every testing command follows the same path: load and validate the
//! config, connect to the tester, identify the session, run, report. A
//! configuration error stops the command before the port is opened.

use super::Cli;
use crate::port::{self, PortTransport};
use crate::prompt::{Prompter, StdioPrompter};
use crate::report::{self, Console, JsonLinesSink};
use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::PathBuf;
use tracing::info;
use vcanqc_core::sim::SimSwitches;
use vcanqc_core::stages::BurnoutMode;
use vcanqc_core::{
    CancelToken, ConfiguredStages, Operator, QcConfig, QcError, ResultSink, SerialLink,
    SessionContext, SessionRequest, SimulatedTester, StageId, TestStatus, Transport,
    open_session, run_sequence, run_single,
};

// =============================================================================
// RUN OPTIONS
// =============================================================================

/// The global flags every command reads.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub config: PathBuf,
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub simulate: bool,
    pub operator: Option<String>,
    pub serial_number: Option<String>,
    pub psu_voltage: Option<f64>,
    pub yes: bool,
    pub results: Option<PathBuf>,
    pub json_mode: bool,
}

impl RunOptions {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            port: cli.port.clone(),
            baud: cli.baud,
            simulate: cli.simulate,
            operator: cli.operator.clone(),
            serial_number: cli.serial_number.clone(),
            psu_voltage: cli.psu_voltage,
            yes: cli.yes,
            results: (!cli.no_log).then(|| cli.results.clone()),
            json_mode: cli.json_mode,
        }
    }

    fn load_config(&self) -> Result<QcConfig, QcError> {
        let config = QcConfig::load(&self.config)?;
        info!(
            path = %self.config.display(),
            calibration = config.model.table.label(),
            stages = config.sequence.len(),
            "configuration loaded"
        );
        Ok(config)
    }
}

fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_default()
    );
}

// =============================================================================
// BENCH CONNECTION
// =============================================================================

/// An open link to the tester.
///
/// With `--simulate` the switch bank is the simulator's and no operator
/// is needed to flip it.
pub struct Bench {
    pub link: SerialLink<Box<dyn Transport>>,
    pub switches: Option<SimSwitches>,
}

impl Bench {
    pub fn connect(
        opts: &RunOptions,
        config: &QcConfig,
        cancel: CancelToken,
    ) -> Result<Self, QcError> {
        let (transport, switches) = if opts.simulate {
            let sim = SimulatedTester::new(config.model.table.clone())
                .with_current_sink(config.current.r_ref_ohms, config.current.v_ref_dac_volts);
            let switches = sim.switches();
            info!("using the simulated tester");
            let transport: Box<dyn Transport> = Box::new(sim);
            (transport, Some(switches))
        } else {
            let name = resolve_port(opts.port.as_deref().or(config.serial.port.as_deref()))?;
            let baud = opts.baud.unwrap_or(config.serial.baud_rate);
            let transport: Box<dyn Transport> = Box::new(PortTransport::open(&name, baud)?);
            (transport, None)
        };

        let link = SerialLink::new(transport, cancel)
            .with_response_timeout(config.serial.response_timeout);
        Ok(Self { link, switches })
    }

    /// The switch operator: the simulator's bank, else the prompter.
    fn operator<'a, R: BufRead + 'a, W: Write + 'a>(
        switches: &'a mut Option<SimSwitches>,
        prompt: &'a mut Prompter<R, W>,
    ) -> &'a mut dyn Operator {
        match switches {
            Some(s) => s as &mut dyn Operator,
            None => prompt as &mut dyn Operator,
        }
    }
}

/// The given port, else the only candidate the OS reports.
fn resolve_port(explicit: Option<&str>) -> Result<String, QcError> {
    if let Some(name) = explicit {
        return Ok(name.to_string());
    }
    let ports = port::list_ports()?;
    match port::auto_select(&ports) {
        Some(only) => {
            info!(port = %only.name, description = %only.description, "serial port auto-selected");
            Ok(only.name.clone())
        }
        None if ports.is_empty() => Err(QcError::Configuration(
            "no serial port found; pass --port or set [serial].port".to_string(),
        )),
        None => {
            let names: Vec<&str> = ports.iter().map(|p| p.name.as_str()).collect();
            Err(QcError::Configuration(format!(
                "several serial ports found ({}); pass --port or set [serial].port",
                names.join(", ")
            )))
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Gather operator and serial number, query the tester, confirm.
pub fn identify<T: Transport, R: BufRead, W: Write>(
    link: &mut SerialLink<T>,
    config: &QcConfig,
    opts: &RunOptions,
    prompt: &mut Prompter<R, W>,
) -> Result<SessionContext, QcError> {
    let operator = match &opts.operator {
        Some(name) => name.clone(),
        None => prompt.ask_with_default("Operator name", &config.tester.operator_name)?,
    };
    let serial_number = match &opts.serial_number {
        Some(serial) => serial.clone(),
        None => prompt.ask_until("Device serial number", |s| config.validate_serial_number(s))?,
    };

    let request = SessionRequest {
        operator,
        serial_number,
        psu_voltage: opts.psu_voltage,
    };
    let ctx = open_session(link, config, &request)?;

    if !opts.yes {
        prompt.say("")?;
        prompt.say(&format!("Operator:      {}", ctx.operator))?;
        prompt.say(&format!("Serial number: {}", ctx.serial_number))?;
        prompt.say(&format!("Master:        {}", ctx.master_id))?;
        prompt.say(&format!("VCAN range:    {}", ctx.ranges.vcan_voltage))?;
        if !prompt.confirm("Start testing?")? {
            return Err(QcError::Interrupted);
        }
    }
    Ok(ctx)
}

fn open_log(opts: &RunOptions) -> Result<Option<JsonLinesSink<BufWriter<File>>>, QcError> {
    opts.results
        .as_deref()
        .map(JsonLinesSink::append)
        .transpose()
}

// =============================================================================
// PORTS / VALIDATE / INFO
// =============================================================================

/// List usable serial ports.
pub fn cmd_ports(json_mode: bool) -> Result<(), QcError> {
    let ports = port::list_ports()?;

    if json_mode {
        print_json(&serde_json::json!({ "ports": ports }));
        return Ok(());
    }

    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }
    println!("Serial Ports");
    println!("============");
    for p in &ports {
        println!("{:<20} {}", p.name, p.description);
    }
    if let Some(only) = port::auto_select(&ports) {
        println!();
        println!("{} will be selected automatically.", only.name);
    }
    Ok(())
}

/// Load the config and show what it resolves to.
pub fn cmd_validate(opts: &RunOptions) -> Result<(), QcError> {
    let config = opts.load_config()?;
    let psu = opts.psu_voltage.or(config.tester.lab_power_supply_voltage_v);
    let ranges = config.ranges.resolve(psu).ok();
    let sequence: Vec<&str> = config.sequence.iter().map(|s| s.key()).collect();

    if opts.json_mode {
        print_json(&serde_json::json!({
            "config": opts.config.to_string_lossy(),
            "calibration": config.model.table.label(),
            "sequence": sequence,
            "port": config.serial.port,
            "baud_rate": config.serial.baud_rate,
            "ranges": ranges,
        }));
        return Ok(());
    }

    println!("Configuration OK");
    println!("================");
    println!("File:        {}", opts.config.display());
    println!("Calibration: {}", config.model.table.label());
    println!(
        "Port:        {} @ {} baud",
        config.serial.port.as_deref().unwrap_or("(auto)"),
        config.serial.baud_rate
    );
    println!("Sequence:    {}", sequence.join(" -> "));
    match ranges {
        Some(r) => {
            println!("CIC V:       {}", r.cic_voltage);
            println!("CIC I:       {}", r.cic_current);
            println!("VCAN V:      {}", r.vcan_voltage);
            println!("VCAN I:      {}", r.vcan_current);
        }
        None => println!("Ranges:      VCAN voltage resolved from the tester at session start"),
    }
    Ok(())
}

/// Query the tester's identity.
pub fn cmd_info(opts: &RunOptions, cancel: CancelToken) -> Result<(), QcError> {
    let config = opts.load_config()?;
    let mut bench = Bench::connect(opts, &config, cancel)?;
    let (master_id, psu_voltage) = bench.link.test_info()?;

    if opts.json_mode {
        print_json(&serde_json::json!({
            "master_id": master_id,
            "psu_voltage": psu_voltage,
        }));
    } else {
        println!("Master:      {}", master_id);
        println!("PSU voltage: {:.2} V", psu_voltage);
    }
    Ok(())
}

// =============================================================================
// STAGE COMMANDS
// =============================================================================

/// Run one stage after its pre-check.
pub fn cmd_stage(opts: &RunOptions, cancel: CancelToken, stage: StageId) -> Result<bool, QcError> {
    let config = opts.load_config()?;
    run_one(opts, &config, cancel, stage)
}

/// Run the burnout soak, optionally overriding mode and duration.
pub fn cmd_burnout(
    opts: &RunOptions,
    cancel: CancelToken,
    mode: Option<BurnoutMode>,
    duration_s: Option<f64>,
) -> Result<bool, QcError> {
    let mut config = opts.load_config()?;
    if let Some(mode) = mode {
        config.burnout.mode = mode;
    }
    if let Some(secs) = duration_s {
        config.burnout.duration = vcanqc_core::config::seconds(secs, "--duration")?;
    }
    run_one(opts, &config, cancel, StageId::Burnout)
}

fn run_one(
    opts: &RunOptions,
    config: &QcConfig,
    cancel: CancelToken,
    stage: StageId,
) -> Result<bool, QcError> {
    let mut log = open_log(opts)?;
    let mut prompt = StdioPrompter::stdio(cancel.clone());
    let mut bench = Bench::connect(opts, config, cancel)?;
    let ctx = identify(&mut bench.link, config, opts, &mut prompt)?;

    let result = {
        let mut console = Console::new(
            opts.json_mode,
            log.as_mut().map(|l| l as &mut dyn ResultSink),
        );
        let operator = Bench::operator(&mut bench.switches, &mut prompt);
        let mut runner = ConfiguredStages::new(&mut bench.link, config, operator);
        run_single(&ctx, &mut runner, stage, &mut console)
    };

    if result.status == TestStatus::Skipped && !opts.json_mode {
        println!("Test SKIPPED: Initial checks failed");
    }
    Ok(result.status == TestStatus::Pass)
}

/// Run the configured sequence.
pub fn cmd_sequence(opts: &RunOptions, cancel: CancelToken) -> Result<bool, QcError> {
    let config = opts.load_config()?;
    let mut log = open_log(opts)?;
    let mut prompt = StdioPrompter::stdio(cancel.clone());
    let mut bench = Bench::connect(opts, &config, cancel)?;
    let ctx = identify(&mut bench.link, &config, opts, &mut prompt)?;

    let report = {
        let mut console = Console::new(
            opts.json_mode,
            log.as_mut().map(|l| l as &mut dyn ResultSink),
        );
        let operator = Bench::operator(&mut bench.switches, &mut prompt);
        let mut runner = ConfiguredStages::new(&mut bench.link, &config, operator);
        run_sequence(&ctx, &mut runner, &config.sequence, &mut console)
    };

    if let Some(log) = log.as_mut() {
        log.write_summary(&report, &ctx)?;
    }
    report::print_summary(&report, &ctx, opts.json_mode);
    Ok(report.overall() == TestStatus::Pass)
}
