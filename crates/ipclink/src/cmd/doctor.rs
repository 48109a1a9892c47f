use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ipclink_connection::{Connection, ConnectionConfig, SendSyncOptions};
use ipclink_transport::create_identifier_pair;
use serde::Serialize;

use crate::cmd::{parse_duration, DoctorArgs};
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::{print_json, print_table, round2, OutputFormat};
use crate::probe::{self, Bootstrap, Echo, Ping, ProbePair, Requester};

const THROTTLED_PINGS: u64 = 2300;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Info,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: &'static str,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    schema_id: &'static str,
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;

    let mut checks = vec![platform_transport_check(), identifier_pair_check()];
    match probe::registry() {
        Ok(registry) => {
            let config = ConnectionConfig::new(registry);
            checks.push(round_trip_check(config.clone(), timeout));
            checks.push(handle_passing_check(config.clone(), timeout));
            checks.push(throttled_drain_check(config, timeout));
        }
        Err(err) => checks.push(CheckResult::fail("probe_registry", err.to_string())),
    }
    checks.push(compiled_features_check());

    let output = summarize(checks);
    print_doctor(&output, format);

    if output.overall == "pass" {
        Ok(SUCCESS)
    } else {
        Ok(HEALTH_CHECK_FAILED)
    }
}

fn summarize(checks: Vec<CheckResult>) -> DoctorOutput {
    let has_fail = checks.iter().any(|c| c.status == CheckStatus::Fail);
    DoctorOutput {
        schema_id: "https://schemas.3leaps.dev/ipclink/cli/v1/doctor-report.schema.json",
        checks,
        overall: if has_fail { "fail" } else { "pass" },
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table => {
            let rows = output
                .checks
                .iter()
                .map(|c| {
                    vec![
                        c.name.to_string(),
                        status_text(c.status).to_string(),
                        c.detail.clone(),
                    ]
                })
                .collect();
            print_table(&["CHECK", "STATUS", "DETAIL"], rows);
        }
        OutputFormat::Pretty => {
            println!("ipclink doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<22} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Info => "INFO",
        CheckStatus::Skip => "SKIP",
    }
}

fn platform_transport_check() -> CheckResult {
    if cfg!(unix) {
        CheckResult::pass("platform_transport", "Unix socket pairs with SCM_RIGHTS")
    } else {
        CheckResult {
            name: "platform_transport",
            status: CheckStatus::Skip,
            detail: "no transport backend for this platform".to_string(),
        }
    }
}

fn identifier_pair_check() -> CheckResult {
    match create_identifier_pair() {
        Ok(_) => CheckResult::pass("identifier_pair", "socket pair created"),
        Err(err) => CheckResult::fail("identifier_pair", err.to_string()),
    }
}

fn round_trip_check(config: ConnectionConfig, timeout: Duration) -> CheckResult {
    const NAME: &str = "round_trip";
    let pair = match ProbePair::open(config, timeout) {
        Ok(pair) => pair,
        Err(err) => return CheckResult::fail(NAME, err.to_string()),
    };
    let start = Instant::now();
    match echo(&pair.requester, timeout) {
        Ok(()) => CheckResult::pass(
            NAME,
            format!(
                "sync echo answered in {} ms",
                round2(start.elapsed().as_secs_f64() * 1000.0)
            ),
        ),
        Err(detail) => CheckResult::fail(NAME, detail),
    }
}

fn handle_passing_check(config: ConnectionConfig, timeout: Duration) -> CheckResult {
    const NAME: &str = "handle_passing";
    let pair = match ProbePair::open(config.clone(), timeout) {
        Ok(pair) => pair,
        Err(err) => return CheckResult::fail(NAME, err.to_string()),
    };
    let identifiers = match create_identifier_pair() {
        Ok(identifiers) => identifiers,
        Err(err) => return CheckResult::fail(NAME, err.to_string()),
    };
    if let Err(err) = pair.requester.send(Bootstrap(identifiers.server), 0) {
        return CheckResult::fail(NAME, format!("bootstrap send failed: {err}"));
    }

    let child = Connection::client(identifiers.client, config);
    if !child.open(Arc::new(Requester)) {
        return CheckResult::fail(NAME, "sub-connection did not open");
    }
    let result = echo(&child, timeout);
    child.invalidate();
    match result {
        Ok(()) => CheckResult::pass(NAME, "sub-connection served over a passed socket"),
        Err(detail) => CheckResult::fail(NAME, detail),
    }
}

fn throttled_drain_check(config: ConnectionConfig, timeout: Duration) -> CheckResult {
    const NAME: &str = "throttled_drain";
    let pair = match ProbePair::open(config, timeout) {
        Ok(pair) => pair,
        Err(err) => return CheckResult::fail(NAME, err.to_string()),
    };
    pair.throttle_responder();
    for _ in 0..THROTTLED_PINGS {
        if let Err(err) = pair.requester.send(Ping(Bytes::new()), 0) {
            return CheckResult::fail(NAME, format!("ping send failed: {err}"));
        }
    }
    match probe::ping_count(&pair.requester, timeout) {
        Ok(count) if count == THROTTLED_PINGS => {
            CheckResult::pass(NAME, format!("{count} messages drained in order"))
        }
        Ok(count) => CheckResult::fail(
            NAME,
            format!("responder saw {count} of {THROTTLED_PINGS} messages"),
        ),
        Err(err) => CheckResult::fail(NAME, err.to_string()),
    }
}

fn echo(connection: &Connection, timeout: Duration) -> Result<(), String> {
    let payload = Bytes::from_static(b"ipclink-doctor");
    match connection.send_sync(
        Echo(payload.clone()),
        0,
        Some(timeout),
        SendSyncOptions::empty(),
    ) {
        Ok(reply) if reply == payload => Ok(()),
        Ok(_) => Err("echo reply did not match request".to_string()),
        Err(err) => Err(format!("sync echo failed: {err}")),
    }
}

fn compiled_features_check() -> CheckResult {
    let mut features = Vec::new();
    if cfg!(feature = "connection") {
        features.push("connection");
    }
    if cfg!(feature = "cli") {
        features.push("cli");
    }

    CheckResult {
        name: "compiled_features",
        status: CheckStatus::Info,
        detail: features.join(", "),
    }
}
