use std::time::{Duration, Instant};

use bytes::Bytes;
use ipclink_connection::{ConnectionConfig, SendSyncOptions};
use serde::Serialize;
use tracing::info;

use crate::cmd::{parse_duration, BenchArgs};
use crate::exit::{connection_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_json, print_table, round2, OutputFormat};
use crate::probe::{self, Echo, Ping, ProbePair};

#[derive(Debug, Serialize)]
struct ThroughputReport {
    messages: u64,
    payload_bytes: usize,
    elapsed_ms: f64,
    messages_per_sec: f64,
    mib_per_sec: f64,
}

#[derive(Debug, Serialize, PartialEq)]
struct LatencyReport {
    round_trips: u64,
    min_us: f64,
    p50_us: f64,
    p99_us: f64,
    max_us: f64,
}

#[derive(Debug, Serialize)]
struct BenchReport {
    schema_id: &'static str,
    throttled: bool,
    throughput: ThroughputReport,
    latency: Option<LatencyReport>,
}

pub fn run(args: BenchArgs, format: OutputFormat) -> CliResult<i32> {
    if args.messages == 0 {
        return Err(CliError::new(USAGE, "--messages must be greater than zero"));
    }
    let timeout = parse_duration(&args.timeout)?;
    let config = ConnectionConfig::new(probe::registry()?);
    let pair = ProbePair::open(config, timeout)?;
    if args.throttle {
        pair.throttle_responder();
    }

    let payload = Bytes::from(vec![0xA5u8; args.payload]);
    let throughput = measure_throughput(&pair, &payload, args.messages, timeout)?;
    info!(
        messages = throughput.messages,
        elapsed_ms = throughput.elapsed_ms,
        "throughput pass finished"
    );

    let latency = measure_latency(&pair, &payload, args.round_trips, timeout)?;

    let report = BenchReport {
        schema_id: "https://schemas.3leaps.dev/ipclink/cli/v1/bench-report.schema.json",
        throttled: args.throttle,
        throughput,
        latency,
    };
    print_report(&report, format);
    Ok(SUCCESS)
}

fn measure_throughput(
    pair: &ProbePair,
    payload: &Bytes,
    messages: u64,
    timeout: Duration,
) -> CliResult<ThroughputReport> {
    let start = Instant::now();
    for _ in 0..messages {
        pair.requester
            .send(Ping(payload.clone()), 0)
            .map_err(|err| connection_error("ping", err))?;
    }
    // The count reply is ordered behind every ping.
    let seen = probe::ping_count(&pair.requester, timeout)?;
    let elapsed = start.elapsed();
    if seen != messages {
        return Err(CliError::new(
            TIMEOUT,
            format!("responder saw {seen} of {messages} pings"),
        ));
    }

    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let bytes = messages as f64 * payload.len() as f64;
    Ok(ThroughputReport {
        messages,
        payload_bytes: payload.len(),
        elapsed_ms: round2(secs * 1000.0),
        messages_per_sec: round2(messages as f64 / secs),
        mib_per_sec: round2(bytes / secs / (1024.0 * 1024.0)),
    })
}

fn measure_latency(
    pair: &ProbePair,
    payload: &Bytes,
    round_trips: u64,
    timeout: Duration,
) -> CliResult<Option<LatencyReport>> {
    let mut samples = Vec::with_capacity(round_trips as usize);
    for _ in 0..round_trips {
        let start = Instant::now();
        pair.requester
            .send_sync(
                Echo(payload.clone()),
                0,
                Some(timeout),
                SendSyncOptions::empty(),
            )
            .map_err(|err| connection_error("echo", err))?;
        samples.push(start.elapsed());
    }
    Ok(summarize(samples))
}

fn summarize(mut samples: Vec<Duration>) -> Option<LatencyReport> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_unstable();
    let micros = |d: Duration| round2(d.as_secs_f64() * 1_000_000.0);
    let percentile = |p: usize| samples[(samples.len() - 1) * p / 100];
    Some(LatencyReport {
        round_trips: samples.len() as u64,
        min_us: micros(samples[0]),
        p50_us: micros(percentile(50)),
        p99_us: micros(percentile(99)),
        max_us: micros(samples[samples.len() - 1]),
    })
}

fn print_report(report: &BenchReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            let mut rows = vec![
                vec!["messages".to_string(), report.throughput.messages.to_string()],
                vec![
                    "payload_bytes".to_string(),
                    report.throughput.payload_bytes.to_string(),
                ],
                vec![
                    "messages_per_sec".to_string(),
                    report.throughput.messages_per_sec.to_string(),
                ],
                vec![
                    "mib_per_sec".to_string(),
                    report.throughput.mib_per_sec.to_string(),
                ],
            ];
            if let Some(latency) = &report.latency {
                rows.push(vec!["sync_p50_us".to_string(), latency.p50_us.to_string()]);
                rows.push(vec!["sync_p99_us".to_string(), latency.p99_us.to_string()]);
            }
            print_table(&["METRIC", "VALUE"], rows);
        }
        OutputFormat::Pretty => {
            let t = &report.throughput;
            println!(
                "async: {} messages x {} bytes in {} ms ({} msg/s, {} MiB/s){}",
                t.messages,
                t.payload_bytes,
                t.elapsed_ms,
                t.messages_per_sec,
                t.mib_per_sec,
                if report.throttled { " [throttled]" } else { "" }
            );
            if let Some(l) = &report.latency {
                println!(
                    "sync:  {} round trips min={}us p50={}us p99={}us max={}us",
                    l.round_trips, l.min_us, l.p50_us, l.p99_us, l.max_us
                );
            }
        }
    }
}
