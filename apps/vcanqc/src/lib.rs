//! # vcanqc
//!
//! Bench-side pieces of the QC station: the command line, the serial-port
//! adapter, operator prompts and the result log. The engine itself lives in
//! `vcanqc-core`.

pub mod cli;
pub mod port;
pub mod prompt;
pub mod report;
