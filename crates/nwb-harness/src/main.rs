#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use nwb_harness::{check_fixture_dir, check_scenario_file, load_scenario, run_scenario};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FIXTURES: &str = "conformance/fixtures";

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let log_file = take_option(&mut args, "--log-file")?;
    init_logging(log_file.as_deref())?;

    let cmd = args.first().map(String::as_str);
    match cmd {
        Some("check-fixtures") => {
            let dir = args.get(1).map_or(DEFAULT_FIXTURES, String::as_str);
            let reports = check_fixture_dir(Path::new(dir))?;
            for report in &reports {
                println!(
                    "ok: {} upload={:?} cache={:?}",
                    report.name, report.upload, report.cache
                );
            }
            println!("{} scenario(s) conform", reports.len());
            Ok(())
        }
        Some("run") => run_cmd(&args[1..]),
        Some("check") => {
            let path = args.get(1).context("usage: nwb-harness check <scenario.json>")?;
            let report = check_scenario_file(Path::new(path))?;
            println!("ok: {}", report.name);
            Ok(())
        }
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

/// Run one scenario and print (or save) its report without checking it.
fn run_cmd(args: &[String]) -> Result<()> {
    let mut out: Option<PathBuf> = None;
    let mut path: Option<&str> = None;
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--out" => {
                let raw = args.get(index + 1).context("--out requires a value")?;
                out = Some(PathBuf::from(raw));
                index += 2;
            }
            other if other.starts_with("--") => bail!("unknown run option: {other}"),
            other => {
                path = Some(other);
                index += 1;
            }
        }
    }
    let path = path.context("usage: nwb-harness run <scenario.json> [--out <report.json>]")?;

    let scenario = load_scenario(Path::new(path))?;
    let report = run_scenario(&scenario)?;
    let json = serde_json::to_string_pretty(&report)?;
    match out {
        Some(out) => fs::write(&out, json)
            .with_context(|| format!("failed to write {}", out.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

fn take_option(args: &mut Vec<String>, name: &str) -> Result<Option<String>> {
    let Some(at) = args.iter().position(|arg| arg == name) else {
        return Ok(None);
    };
    if at + 1 >= args.len() {
        bail!("{name} requires a value");
    }
    let value = args.remove(at + 1);
    args.remove(at);
    Ok(Some(value))
}

fn init_logging(log_file: Option<&str>) -> Result<()> {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true);
    if let Some(path) = log_file {
        let file = fs::File::create(path)
            .with_context(|| format!("failed to create log file {path}"))?;
        subscriber.with_ansi(false).with_writer(Arc::new(file)).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }
    Ok(())
}

fn print_usage() {
    eprintln!(
        "\
nwb-harness: write-back scenario runner

USAGE:
  nwb-harness [--log-file <path>] <command>

COMMANDS:
  check-fixtures [dir]                  Run and check every scenario (default: {DEFAULT_FIXTURES})
  check <scenario.json>                 Run and check one scenario
  run <scenario.json> [--out <path>]    Run one scenario and print its report

Logging is controlled by RUST_LOG (e.g. RUST_LOG=nwb::write_issue=trace)."
    );
}
