//! # vcanqc CLI Module
//!
//! This module implements the bench command line.
//!
//! ## Available Commands
//!
//! - `ports` - List serial ports that look like a tester
//! - `validate` - Load and validate the config file, then exit
//! - `info` - Ask the tester for its id and supply voltage
//! - `check` - Setup & initial checks
//! - `voltage` - 256-code VCAN sweep, switches OFF then ON
//! - `current` - Current channel check
//! - `temperature` - Master/slave temperature readout
//! - `can` - CAN & crosstalk test
//! - `burnout` - Soak at maximum safe voltage and current
//! - `sequence` - The full gated sequence (default)

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use vcanqc_core::stages::BurnoutMode;
use vcanqc_core::{CancelToken, QcError, StageId};

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// vcanqc - CIC/VCAN power-delivery board QC station
///
/// Drives the embedded tester over its serial link and records a
/// PASS/FAIL verdict per stage.
#[derive(Parser, Debug)]
#[command(name = "vcanqc")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the bench configuration
    #[arg(short = 'c', long, global = true, default_value = "vcanqc.toml")]
    pub config: PathBuf,

    /// Serial port of the tester (overrides [serial].port)
    #[arg(short, long, global = true)]
    pub port: Option<String>,

    /// Baud rate (overrides [serial].baud_rate)
    #[arg(short, long, global = true)]
    pub baud: Option<u32>,

    /// Run against the in-process simulated tester instead of a port
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Operator name (skips the prompt)
    #[arg(long, global = true)]
    pub operator: Option<String>,

    /// Device serial number (skips the prompt)
    #[arg(short, long, global = true)]
    pub serial_number: Option<String>,

    /// Lab supply voltage in volts; wins over the tester's report
    #[arg(long, global = true)]
    pub psu_voltage: Option<f64>,

    /// Start without the confirmation prompt
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Result log (JSON lines, appended)
    #[arg(short = 'o', long, global = true, default_value = "vcanqc-results.jsonl")]
    pub results: PathBuf,

    /// Do not write the result log
    #[arg(long, global = true)]
    pub no_log: bool,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List candidate serial ports
    Ports,

    /// Validate the config file and print what it resolves to
    Validate,

    /// Query the tester's id and supply voltage
    Info,

    /// Setup & initial checks
    Check,

    /// Voltage channels (OFF and ON sweeps)
    Voltage,

    /// Current channels
    Current,

    /// Temperature communication
    Temperature,

    /// CAN communication and crosstalk
    Can {
        /// Long run only, as after the burnout soak
        #[arg(long)]
        post_burnout: bool,
    },

    /// Burnout soak
    Burnout {
        /// Who supervises the soak (overrides [burnout].mode)
        #[arg(short, long)]
        mode: Option<BurnoutModeArg>,

        /// Soak duration in seconds (overrides [burnout].duration_s)
        #[arg(short, long)]
        duration: Option<f64>,
    },

    /// Full test sequence
    Sequence,
}

/// Burnout supervision on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurnoutModeArg {
    Host,
    Firmware,
}

impl From<BurnoutModeArg> for BurnoutMode {
    fn from(mode: BurnoutModeArg) -> Self {
        match mode {
            BurnoutModeArg::Host => BurnoutMode::Host,
            BurnoutModeArg::Firmware => BurnoutMode::Firmware,
        }
    }
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
///
/// Returns whether the board passed; commands that test nothing return
/// `true` on success.
pub fn execute(cli: Cli, cancel: CancelToken) -> Result<bool, QcError> {
    let opts = RunOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Ports) => cmd_ports(opts.json_mode).map(|()| true),
        Some(Commands::Validate) => cmd_validate(&opts).map(|()| true),
        Some(Commands::Info) => cmd_info(&opts, cancel).map(|()| true),
        Some(Commands::Check) => cmd_stage(&opts, cancel, StageId::InitialCheck),
        Some(Commands::Voltage) => cmd_stage(&opts, cancel, StageId::Voltage),
        Some(Commands::Current) => cmd_stage(&opts, cancel, StageId::Current),
        Some(Commands::Temperature) => cmd_stage(&opts, cancel, StageId::Temperature),
        Some(Commands::Can { post_burnout }) => {
            let stage = if post_burnout {
                StageId::CanPostBurnout
            } else {
                StageId::Can
            };
            cmd_stage(&opts, cancel, stage)
        }
        Some(Commands::Burnout { mode, duration }) => {
            cmd_burnout(&opts, cancel, mode.map(BurnoutMode::from), duration)
        }
        Some(Commands::Sequence) | None => cmd_sequence(&opts, cancel),
    }
}
