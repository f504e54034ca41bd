//! stimmon command-line entry point.
//!
//! Reads a spike-train file, stimulates the board for the requested
//! window while monitoring it, and writes the monitored events as
//! `timestamp_us<TAB>address` lines. Logs go to stderr so stdout can carry
//! the event stream.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use stimmon_common::config::SessionConfig;
use stimmon_common::event::{MonitoredEvent, StimulusEvent};
use stimmon_common::format::{read_monitored_events, read_stimulus_file};
use stimmon_common::time::role_durations;
use stimmon_runtime::session::{Session, SessionReport};
use stimmon_runtime::simulated::{MonitorScript, SimulatedDriver};
use tracing::{error, info, warn};

/// Exit status for any fatal error (`-1` as seen by the shell).
const EXIT_FAILURE: u8 = 255;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "stimmon",
    about = "Synchronized AER stimulation and monitoring",
    version,
    long_about = None
)]
struct Args {
    /// Stimulus file: one `interval_us<TAB>address` line per event.
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Stimulation window in milliseconds (zero or negative sends nothing).
    #[arg(value_name = "STIM_MS", allow_hyphen_values = true)]
    stim_ms: f64,

    /// Monitoring window in milliseconds (defaults to STIM_MS).
    #[arg(value_name = "MON_MS", allow_hyphen_values = true)]
    mon_ms: Option<f64>,

    /// Path to a session configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write monitored events here instead of stdout.
    #[arg(long, short = 'o', value_name = "FILE")]
    output: Option<PathBuf>,

    /// Write a JSON session summary to this file.
    #[arg(long, value_name = "FILE")]
    summary: Option<PathBuf>,

    /// Make the simulated monitor echo the stimulus back.
    #[arg(long)]
    loopback: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

/// JSON summary written by `--summary`.
#[derive(Debug, Serialize)]
struct Summary<'a> {
    input: &'a Path,
    report: &'a SessionReport,
    events: &'a [MonitoredEvent],
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting stimmon");

    match run(&args) {
        Ok(report) if report.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(EXIT_FAILURE),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Initialize logging on stderr; `RUST_LOG` overrides `level`.
fn init_logging(level: &str) {
    let filter = format!("stimmon={level},stimmon_runtime={level},stimmon_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_writer(io::stderr)
        .with_target(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `STIMMON_CONFIG` environment variable
/// 3. `/etc/stimmon/config.toml` (system path)
/// 4. Built-in defaults
fn load_config(args: &Args) -> Result<SessionConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return SessionConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()));
    }

    if let Ok(env_path) = std::env::var("STIMMON_CONFIG") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from STIMMON_CONFIG");
            return SessionConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from STIMMON_CONFIG={env_path}"));
        }
        warn!(
            path = %env_path,
            "STIMMON_CONFIG set but file does not exist, checking other locations"
        );
    }

    let system_path = PathBuf::from("/etc/stimmon/config.toml");
    if system_path.exists() {
        info!(?system_path, "Loading config from system path");
        return SessionConfig::from_file(&system_path)
            .with_context(|| format!("Failed to load config from {}", system_path.display()));
    }

    info!("No config file found, using built-in defaults");
    Ok(SessionConfig::default())
}

fn run(args: &Args) -> Result<SessionReport> {
    let config = load_config(args)?;
    let (stim_duration, mon_duration) = role_durations(args.stim_ms, args.mon_ms);
    let events = load_events(&args.input, stim_duration)?;

    let mut driver = SimulatedDriver::new();
    if args.loopback {
        driver = driver.with_monitor_script(MonitorScript::loopback(&events));
    }

    let mut sink = tempfile::tempfile().context("Failed to create monitor sink")?;
    let mut session = Session::new(driver, config);
    let report = session
        .run(&events, stim_duration, mon_duration, &mut sink)
        .context("Session failed")?;

    if let Some(path) = &args.summary {
        write_summary(path, &args.input, &report, &mut sink)?;
    }
    copy_events(&mut sink, args.output.as_deref())?;

    if !report.is_success() {
        error!(
            stimulation = report.stimulation_error.as_deref().unwrap_or("ok"),
            monitoring = report.monitoring_error.as_deref().unwrap_or("ok"),
            "Session finished with errors"
        );
    }
    Ok(report)
}

/// Stimulus events for the window; a zero window never touches `input`.
fn load_events(input: &Path, stim_duration: Duration) -> Result<Vec<StimulusEvent>> {
    if stim_duration.is_zero() {
        info!(input = %input.display(), "Zero stimulation window; stimulus file not read");
        return Ok(Vec::new());
    }
    read_stimulus_file(input)
        .with_context(|| format!("Failed to read stimulus file {}", input.display()))
}

/// Transcribe the sink and write the JSON summary; leaves the sink rewound.
fn write_summary(path: &Path, input: &Path, report: &SessionReport, sink: &mut File) -> Result<()> {
    let events = read_monitored_events(BufReader::new(&mut *sink))
        .context("Failed to transcribe monitored events")?;
    sink.seek(SeekFrom::Start(0))?;

    let summary = Summary {
        input,
        report,
        events: &events,
    };
    let file = File::create(path)
        .with_context(|| format!("Failed to create summary file {}", path.display()))?;
    serde_json::to_writer_pretty(file, &summary).context("Failed to write summary")?;
    info!(path = %path.display(), "Session summary written");
    Ok(())
}

/// Copy the rewound sink to `output`, or stdout when absent.
fn copy_events(sink: &mut File, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            let mut file = File::create(path)
                .with_context(|| format!("Failed to create output file {}", path.display()))?;
            io::copy(sink, &mut file).context("Failed to write monitored events")?;
            file.flush()?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            io::copy(sink, &mut stdout).context("Failed to write monitored events")?;
            stdout.flush()?;
        }
    }
    Ok(())
}
