mod cmd;
mod exit;
mod logging;
mod output;
mod probe;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "ipclink", version, about = "ipclink diagnostics CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        env = "IPCLINK_LOG_LEVEL",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bench_subcommand() {
        let cli = Cli::try_parse_from([
            "ipclink",
            "bench",
            "--messages",
            "500",
            "--payload",
            "1024",
            "--throttle",
        ])
        .expect("bench args should parse");

        match cli.command {
            Command::Bench(args) => {
                assert_eq!(args.messages, 500);
                assert_eq!(args.payload, 1024);
                assert!(args.throttle);
                assert_eq!(args.round_trips, 1000);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_format() {
        let err = Cli::try_parse_from(["ipclink", "--format", "xml", "doctor"])
            .expect_err("unknown format should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn log_level_flag_parses() {
        let cli = Cli::try_parse_from(["ipclink", "--log-level", "debug", "version"])
            .expect("log level should parse");
        assert_eq!(cli.log_level, LogLevel::Debug);
    }

    #[test]
    fn parses_doctor_subcommand() {
        let cli = Cli::try_parse_from(["ipclink", "doctor", "--timeout", "3s"])
            .expect("doctor args should parse");
        assert!(matches!(cli.command, Command::Doctor(_)));
    }
}
