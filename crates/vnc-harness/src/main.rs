#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::env;
use std::path::Path;
use vnc_core::{TUNABLE_KEYS, Tunables};
use vnc_harness::{ChurnConfig, load_tunables, run_churn};

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("churn") => churn(&args[1..]),
        Some("tunables") => tunables(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn churn(args: &[String]) -> Result<()> {
    let mut config = ChurnConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--config" => {
                let raw = args.get(index + 1).context("--config requires a value")?;
                config = ChurnConfig::load(Path::new(raw))?;
                index += 2;
            }
            "--tunables" => {
                let raw = args.get(index + 1).context("--tunables requires a value")?;
                config.cache.tunables = load_tunables(Path::new(raw))?;
                index += 2;
            }
            "--threads" => {
                let raw = args.get(index + 1).context("--threads requires a value")?;
                config.threads = raw.parse().context("invalid --threads value")?;
                index += 2;
            }
            "--iterations" => {
                let raw = args
                    .get(index + 1)
                    .context("--iterations requires a value")?;
                config.iterations = raw.parse().context("invalid --iterations value")?;
                index += 2;
            }
            other => {
                bail!("unknown churn option: {other}");
            }
        }
    }

    let report = run_churn(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed {
        bail!(
            "churn did not settle: {} live vnodes, desired {}",
            report.stats.live_vnodes,
            report.desired_vnodes
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct TunableRow {
    key: &'static str,
    value: u64,
}

fn tunables(args: &[String]) -> Result<()> {
    let tunables = match args.first() {
        Some(path) => load_tunables(Path::new(path))?,
        None => Tunables::default(),
    };
    let rows = TUNABLE_KEYS
        .iter()
        .map(|&key| {
            let value = tunables
                .get(key)
                .with_context(|| format!("missing tunable {key}"))?;
            Ok(TunableRow { key, value })
        })
        .collect::<Result<Vec<_>>>()?;
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

fn print_usage() {
    println!("vnc-harness — vnode cache workload driver");
    println!();
    println!("USAGE:");
    println!(
        "  vnc-harness churn [--config FILE] [--tunables FILE] [--threads N] [--iterations N]"
    );
    println!("  vnc-harness tunables [FILE]");
    println!();
    println!("CHURN:");
    println!("  Runs open/write/close cycles from several threads with the reclaimer and");
    println!("  syncer running, waits for the live population to settle below the");
    println!("  reclaim trigger and prints a JSON report. Exits non-zero if it never does.");
    println!();
    println!("TUNABLES:");
    println!("  Validates a JSON tunables file (or the defaults) and prints every key.");
    println!();
    println!("EXAMPLES:");
    println!("  vnc-harness churn --threads 8 --iterations 100000");
    println!("  vnc-harness tunables conf/small.json");
}
