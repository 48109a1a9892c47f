use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod bench;
pub mod doctor;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Measure message throughput and sync round-trip latency in-process.
    Bench(BenchArgs),
    /// Run local environment health checks.
    Doctor(DoctorArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Bench(args) => bench::run(args, format),
        Command::Doctor(args) => doctor::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct BenchArgs {
    /// Async messages to send for the throughput pass.
    #[arg(long, default_value = "10000")]
    pub messages: u64,
    /// Sync round trips for the latency pass.
    #[arg(long, default_value = "1000")]
    pub round_trips: u64,
    /// Payload size in bytes for every message.
    #[arg(long, default_value = "64")]
    pub payload: usize,
    /// Throttle dispatch on the receiving side.
    #[arg(long)]
    pub throttle: bool,
    /// Upper bound for each pass (e.g. 30s, 500ms).
    #[arg(long, default_value = "30s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct DoctorArgs {
    /// Upper bound for each check (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

impl Default for DoctorArgs {
    fn default() -> Self {
        Self {
            timeout: "5s".to_string(),
        }
    }
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
