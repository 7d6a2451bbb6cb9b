#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use dstack_error::StoreError;
use dstack_harness::{parse_trace, run_trace, Policy, RunSummary, StackConfig};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        let fatal = error
            .downcast_ref::<StoreError>()
            .is_some_and(StoreError::is_fatal);
        if fatal {
            eprintln!("fatal corruption: {error:#}");
        } else {
            eprintln!("error: {error:#}");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "replay" => {
            let Some(trace_path) = args.next() else {
                bail!("replay requires a trace file argument");
            };
            let remaining: Vec<String> = args.collect();
            replay_cmd(Path::new(&trace_path), &remaining)
        }
        "demo" => demo_cmd(),
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("dstack-harness\n");
    println!("USAGE:");
    println!("  dstack-harness replay <trace-file> [OPTIONS]");
    println!("  dstack-harness demo\n");
    println!("OPTIONS:");
    println!("  --blocks <N>        initial backend size in blocks (default 128)");
    println!("  --cache-blocks <N>  cache capacity in slots (default 16)");
    println!("  --policy <P>        eviction policy: clock or lru (default clock)");
    println!("  --image <PATH>      file-backed leaf instead of RAM");
    println!("  --json              machine-readable summary on stdout");
}

fn parse_config(options: &[String]) -> Result<(StackConfig, bool)> {
    let mut config = StackConfig::default();
    let mut json = false;

    let mut iter = options.iter();
    while let Some(option) = iter.next() {
        let mut value = |what: &str| -> Result<&String> {
            iter.next()
                .with_context(|| format!("{option} requires a {what}"))
        };
        match option.as_str() {
            "--blocks" => config.store_blocks = value("count")?.parse().context("--blocks")?,
            "--cache-blocks" => {
                config.cache_blocks = value("count")?.parse().context("--cache-blocks")?;
            }
            "--policy" => config.policy = value("policy name")?.parse::<Policy>()?,
            "--image" => config.image = Some(PathBuf::from(value("path")?)),
            "--json" => json = true,
            other => bail!("unknown option: {other}"),
        }
    }
    Ok((config, json))
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).context("serialize summary")?
        );
        return Ok(());
    }

    // Human-readable dumps go to stderr; stdout stays clean for piping.
    eprintln!("replay: {} ops, {} reads, {} writes, {} resizes",
        summary.report.ops, summary.report.reads, summary.report.writes, summary.report.resizes);
    eprintln!(
        "checks: {} count checks, {} count mismatches, {} content mismatches, {} io errors",
        summary.report.count_checks,
        summary.report.count_mismatches,
        summary.report.content_mismatches,
        summary.report.io_errors
    );
    eprintln!(
        "cache:  {} read hits, {} read misses, {} write hits, {} write misses",
        summary.cache.read_hits,
        summary.cache.read_misses,
        summary.cache.write_hits,
        summary.cache.write_misses
    );
    eprintln!("backend ops:\n{}", summary.store);
    Ok(())
}

fn replay_cmd(trace_path: &Path, options: &[String]) -> Result<()> {
    let (config, json) = parse_config(options)?;
    let text = fs::read_to_string(trace_path)
        .with_context(|| format!("reading trace {}", trace_path.display()))?;
    let ops = parse_trace(&text)?;

    let summary = run_trace(&config, &ops)?;
    print_summary(&summary, json)?;

    if !summary.report.clean() {
        bail!("replay finished with mismatches");
    }
    Ok(())
}

fn demo_cmd() -> Result<()> {
    // A small built-in workload: fill a working set larger than the cache,
    // re-read it, shrink, and grow back.
    let trace = "\
w:0:1\nw:1:1\nw:2:1\nw:3:1\nw:4:1\nw:5:1\n\
r:0\nr:1\nr:2\nr:3\nr:4\nr:5\n\
n:16\ns:4\nn:4\ns:16\nr:9\n";
    let config = StackConfig {
        store_blocks: 16,
        cache_blocks: 4,
        ..StackConfig::default()
    };
    let ops = parse_trace(trace).expect("built-in trace parses");
    let summary = run_trace(&config, &ops)?;
    print_summary(&summary, false)
}
