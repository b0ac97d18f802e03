//! CLI for the tally metrics aggregation engine.
//!
//! Provides commands for replaying observation logs through the engine,
//! simulating detection scenarios, and benchmarking the ingest path.

use std::io::BufRead;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use tally::{Calc, Filter, FlushRecord, Key, Manager, Observation};

/// tally — Embedded metrics aggregation engine CLI.
#[derive(Parser)]
#[command(name = "tally", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON-lines observation log through the engine and print
    /// the flushed per-key epoch results.
    Replay {
        /// Path to the observation log (one JSON object per line).
        log_path: PathBuf,

        /// Metric id to register the filter against.
        #[arg(long, default_value = "replay")]
        metric: String,

        /// Epoch duration in seconds.
        #[arg(long, default_value = "60")]
        epoch: u64,

        /// Calculations to maintain.
        #[arg(long, value_delimiter = ',', default_value = "sum,min,max,avg")]
        measures: Vec<Measure>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Simulate a password brute-force detection scenario.
    Simulate {
        /// Number of attacking hosts.
        #[arg(long, default_value = "3")]
        attackers: u32,

        /// Number of benign hosts.
        #[arg(long, default_value = "20")]
        benign: u32,

        /// Epochs to simulate.
        #[arg(long, default_value = "4")]
        epochs: u32,

        /// Distinct-attempt threshold per epoch.
        #[arg(long, default_value = "12")]
        threshold: u32,

        /// RNG seed for reproducible traffic.
        #[arg(long, default_value = "7")]
        seed: u64,
    },

    /// Run an ingest-path microbenchmark.
    Bench {
        /// Number of observations to feed.
        #[arg(long, default_value = "10000000")]
        observations: u64,

        /// Number of distinct keys.
        #[arg(long, default_value = "1000")]
        keys: u32,
    },
}

/// Calculation names accepted on the command line.
#[derive(Clone, Copy, ValueEnum)]
enum Measure {
    Sum,
    Min,
    Max,
    Avg,
    Variance,
    StdDev,
    Unique,
}

impl From<Measure> for Calc {
    fn from(measure: Measure) -> Self {
        match measure {
            Measure::Sum => Calc::Sum,
            Measure::Min => Calc::Min,
            Measure::Max => Calc::Max,
            Measure::Avg => Calc::Avg,
            Measure::Variance => Calc::Variance,
            Measure::StdDev => Calc::StdDev,
            Measure::Unique => Calc::Unique,
        }
    }
}

/// Output format for flushed results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// One JSON object per record.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Replay {
            log_path,
            metric,
            epoch,
            measures,
            format,
        } => cmd_replay(&log_path, &metric, epoch, &measures, &format),
        Commands::Simulate {
            attackers,
            benign,
            epochs,
            threshold,
            seed,
        } => cmd_simulate(attackers, benign, epochs, threshold, seed),
        Commands::Bench { observations, keys } => cmd_bench(observations, keys),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `tally replay <log_path>`.
///
/// Each log line is a JSON object: `{"ts": <nanoseconds>, "host": "<ip>"}`
/// plus either `"value": <number>` or `"text": "<string>"`. Lines sharing
/// no recognizable shape are reported and skipped.
fn cmd_replay(
    log_path: &PathBuf,
    metric: &str,
    epoch_secs: u64,
    measures: &[Measure],
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let file = std::fs::File::open(log_path)
        .map_err(|e| format!("Cannot open '{}': {e}", log_path.display()))?;
    let reader = std::io::BufReader::new(file);

    let mut lines = 0u64;
    let mut skipped = 0u64;
    let mut observations = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;
        match parse_log_line(&line) {
            Some(parsed) => observations.push(parsed),
            None => skipped += 1,
        }
    }

    // The first epoch is anchored at the first observation's timestamp;
    // out-of-order lines within an epoch are fine, the engine clock only
    // moves forward.
    let start = observations.first().map_or(0, |(ts, _, _)| *ts);
    let mut manager = Manager::new(start);
    let sink_format = format.clone();
    manager.set_flush_sink(Box::new(move |record| print_record(&record, &sink_format)));

    let calcs: Vec<Calc> = measures.iter().map(|m| Calc::from(*m)).collect();
    manager.add_filter(
        metric,
        Filter::new("replay", Duration::from_secs(epoch_secs), calcs),
    );

    if matches!(format, OutputFormat::Csv) {
        println!("epoch_ts,key,num,sum,min,max,avg,variance,std_dev,unique");
    }
    for (ts, key, obs) in &observations {
        manager.advance_to(*ts);
        manager.add_data(metric, key, obs);
    }

    // Flush the final, partial epoch
    if let Some(next) = manager.next_epoch() {
        manager.advance_to(next);
    }

    eprintln!("# replayed {lines} lines ({skipped} skipped)");
    Ok(())
}

/// Parses one observation log line.
fn parse_log_line(line: &str) -> Option<(u64, Key, Observation)> {
    let json: serde_json::Value = serde_json::from_str(line).ok()?;
    let ts = json.get("ts")?.as_u64()?;

    let key = if let Some(host) = json.get("host").and_then(|h| h.as_str()) {
        Key::host(host.parse().ok()?)
    } else if let Some(name) = json.get("name").and_then(|n| n.as_str()) {
        Key::name(name)
    } else {
        return None;
    };

    let obs = if let Some(value) = json.get("value").and_then(serde_json::Value::as_f64) {
        Observation::Value(value)
    } else if let Some(text) = json.get("text").and_then(|t| t.as_str()) {
        Observation::Text(text.to_string())
    } else {
        Observation::Count(1)
    };

    Some((ts, key, obs))
}

/// Prints one flushed record in the requested format.
fn print_record(record: &FlushRecord, format: &OutputFormat) {
    match format {
        OutputFormat::Csv => {
            let agg = &record.aggregate;
            let opt = |v: Option<f64>| v.map_or(String::new(), |v| format!("{v}"));
            let unique = agg.unique.map_or(String::new(), |u| format!("{u}"));
            println!(
                "{},{},{},{},{},{},{},{},{},{}",
                record.timestamp,
                record.key,
                agg.num,
                opt(agg.sum),
                opt(agg.min),
                opt(agg.max),
                opt(agg.avg),
                opt(agg.variance),
                opt(agg.std_dev),
                unique,
            );
        }
        OutputFormat::Json => match serde_json::to_string(record) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Error: cannot serialize record: {e}"),
        },
    }
}

/// Implements `tally simulate`.
///
/// Registers the canonical brute-force filter (distinct failed-login
/// attempts per source host per epoch) and feeds it synthetic traffic:
/// benign hosts retry a couple of passwords, attackers walk a wordlist.
fn cmd_simulate(
    attackers: u32,
    benign: u32,
    epochs: u32,
    threshold: u32,
    seed: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    const SECOND: u64 = 1_000_000_000;
    let epoch = Duration::from_secs(900);

    println!("tally brute-force simulation");
    println!("  Attackers: {attackers}");
    println!("  Benign hosts: {benign}");
    println!("  Threshold: {threshold} distinct attempts / 15 min");
    println!();

    let mut manager = Manager::new(0);

    let mut filter = Filter::new(
        "bruteforcers",
        epoch,
        vec![Calc::Sum, Calc::Unique],
    );
    filter.threshold = Some(f64::from(threshold));
    filter.samples = 5;
    filter.crossed = Some(Box::new(|key, agg| {
        println!(
            "ALERT {key}: {} attempts, {} distinct (e.g. {:?})",
            agg.num,
            agg.unique.unwrap_or(0),
            agg.samples,
        );
    }));
    manager.add_filter("ftp.failed_auth", filter);

    let mut rng = XorShift::new(seed);
    let epoch_ns = epoch.as_secs() * SECOND;

    for e in 0..epochs {
        let start = u64::from(e) * epoch_ns;
        println!("--- epoch {} ---", e + 1);

        // Benign hosts: a handful of attempts, mostly repeated typos
        for h in 0..benign {
            let key = Key::host(std::net::IpAddr::V4(std::net::Ipv4Addr::from(
                0xc633_6400 + h, // 198.51.100.0/24
            )));
            let attempts = 1 + rng.below(4);
            for _ in 0..attempts {
                let password = format!("typo{}", rng.below(3));
                manager.advance_to(start + rng.below(800) * SECOND);
                manager.add_data("ftp.failed_auth", &key, &Observation::Text(password));
            }
        }

        // Attackers: a wordlist walk, distinct every time
        for h in 0..attackers {
            let key = Key::host(std::net::IpAddr::V4(std::net::Ipv4Addr::from(
                0xcb00_7100 + h, // 203.0.113.0/24
            )));
            let attempts = u64::from(threshold) + rng.below(10);
            for i in 0..attempts {
                manager.advance_to(start + rng.below(800) * SECOND);
                manager.add_data(
                    "ftp.failed_auth",
                    &key,
                    &Observation::Text(format!("wordlist-{e}-{i}")),
                );
            }
        }

        manager.advance_to(start + epoch_ns);
    }

    Ok(())
}

/// Implements `tally bench`.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)] // Benchmark stats are fine with f64 precision
fn cmd_bench(observations: u64, key_count: u32) -> Result<(), Box<dyn std::error::Error>> {
    println!("tally ingest-path benchmark");
    println!("  Observations: {observations}");
    println!("  Keys: {key_count}");
    println!();

    let mut manager = Manager::new(0);
    manager.add_filter(
        "bench",
        Filter::new(
            "bench",
            Duration::from_secs(3600),
            vec![Calc::Sum, Calc::Min, Calc::Max, Calc::Avg, Calc::Variance],
        ),
    );

    let keys: Vec<Key> = (0..key_count)
        .map(|i| Key::host(std::net::IpAddr::V4(std::net::Ipv4Addr::from(0x0a00_0000 + i))))
        .collect();

    println!("Feeding {observations} observations across {key_count} keys...");

    let mut rng = XorShift::new(42);
    let start = Instant::now();

    for i in 0..observations {
        let key = &keys[(i % u64::from(key_count)) as usize];
        let value = rng.below(10_000) as f64 / 100.0;
        manager.add_data("bench", key, &Observation::Value(value));
    }

    let elapsed = start.elapsed();
    let ns_per_obs = elapsed.as_nanos() as f64 / observations as f64;
    let obs_per_sec = observations as f64 / elapsed.as_secs_f64();

    println!();
    println!("Results:");
    println!("  Elapsed: {elapsed:.3?}");
    println!("  Avg latency: {ns_per_obs:.1} ns/observation");
    println!("  Throughput: {obs_per_sec:.0} observations/sec");

    Ok(())
}

/// Tiny xorshift64 PRNG for reproducible synthetic traffic.
struct XorShift {
    state: u64,
}

impl XorShift {
    fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform-ish value in `[0, bound)`.
    fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xorshift_is_deterministic_and_bounded() {
        let mut a = XorShift::new(7);
        let mut b = XorShift::new(7);
        for _ in 0..100 {
            let v = a.below(800);
            assert_eq!(v, b.below(800));
            assert!(v < 800);
        }
    }

    #[test]
    fn test_attacker_attempts_always_reach_the_threshold() {
        // The threshold arrives as a u32 CLI argument and is widened
        // before mixing with the u64 RNG output
        let threshold: u32 = 12;
        let mut rng = XorShift::new(1);
        for _ in 0..50 {
            let attempts = u64::from(threshold) + rng.below(10);
            assert!(attempts >= u64::from(threshold));
            assert!(attempts < u64::from(threshold) + 10);
        }
    }
}
