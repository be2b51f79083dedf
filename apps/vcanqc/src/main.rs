//! # vcanqc - CIC/VCAN QC Station
//!
//! The bench binary for quality control of the CIC/VCAN power-delivery
//! board.
//!
//! This application provides:
//! - CLI interface for single stages and the full sequence
//! - Serial link to the embedded tester (or an in-process simulator)
//! - JSON-lines result log
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      apps/vcanqc (THE BINARY)                   │
//! │                                                                 │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────┐     │
//! │  │   CLI       │    │ Serial port │    │   Result log     │     │
//! │  │  (clap)     │    │(serialport) │    │  (JSON lines)    │     │
//! │  └──────┬──────┘    └──────┬──────┘    └────────┬─────────┘     │
//! │         │                  │                    │               │
//! │         └──────────────────┼────────────────────┘               │
//! │                            ▼                                    │
//! │                    ┌───────────────┐                            │
//! │                    │  vcanqc-core  │                            │
//! │                    │ (THE LOGIC)   │                            │
//! │                    └───────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Full sequence on the only attached tester
//! vcanqc --operator alice --serial-number 00001234
//!
//! # One stage on a named port
//! vcanqc --port /dev/ttyACM0 voltage
//!
//! # Try the flow without hardware
//! vcanqc --simulate --yes -s 00000001 sequence
//! ```
//!
//! Exit status: 0 when the board passed, 2 when it did not, 1 on error.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vcanqc::cli;
use vcanqc_core::CancelToken;

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // Parse CLI arguments
    let cli = cli::Cli::parse();

    init_tracing(cli.verbose);

    // Display startup banner
    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    let cancel = CancelToken::new();
    tokio::spawn(watch_interrupt(cancel.clone()));

    // The engine is synchronous; keep it off the runtime threads.
    let outcome = tokio::task::spawn_blocking(move || cli::execute(cli, cancel)).await;

    match outcome {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => std::process::exit(2),
        Ok(Err(e)) => {
            tracing::error!("Error: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Worker failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Initialize tracing; VCANQC_LOG_FORMAT=json enables machine-parseable output.
///
/// Logs go to stderr so `--json-mode` output on stdout stays parseable.
fn init_tracing(verbose: bool) {
    let log_format = std::env::var("VCANQC_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let default_filter = if verbose {
        "vcanqc=debug,vcanqc_core=debug"
    } else {
        "vcanqc=info,vcanqc_core=info"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// First Ctrl+C cancels the run (the active stage still powers down);
/// a second one exits immediately.
async fn watch_interrupt(cancel: CancelToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::warn!("interrupt received, stopping after power-down (Ctrl+C again to exit now)");
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        std::process::exit(130);
    }
}

/// Print the vcanqc startup banner.
fn print_banner() {
    println!(
        r#"
  ██╗   ██╗ ██████╗ █████╗ ███╗   ██╗ ██████╗  ██████╗
  ██║   ██║██╔════╝██╔══██╗████╗  ██║██╔═══██╗██╔════╝
  ██║   ██║██║     ███████║██╔██╗ ██║██║   ██║██║
  ╚██╗ ██╔╝██║     ██╔══██║██║╚██╗██║██║▄▄ ██║██║
   ╚████╔╝ ╚██████╗██║  ██║██║ ╚████║╚██████╔╝╚██████╗
    ╚═══╝   ╚═════╝╚═╝  ╚═╝╚═╝  ╚═══╝ ╚══▀▀═╝  ╚═════╝

  CIC/VCAN QC Station v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
