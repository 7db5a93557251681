mod activity;
mod config;
mod expression;
mod history;
mod job;
mod operations;
mod retry;
mod shell;
mod signals;
mod status;
mod strategy;
mod supervisor;
mod watchdog;

use activity::ActivityMonitor;
use chrono::Local;
use clap::Parser;
use config::{Config, ConfigError};
use expression::TimeoutExpression;
use history::{BuildHistory, HistoryError};
use job::Execution;
use retry::{RetryDecision, RetryPolicy};
use shell::ShellJob;
use status::{StatusError, StatusFile, StatusTracker, SupervisorState};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use strategy::ArmContext;
use supervisor::{ExecutionReport, Supervisor};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Runs a build command under a timeout strategy: when the strategy fires,
/// the configured operations abort or fail the build, describe it, or
/// restart it.
#[derive(Parser, Debug)]
#[command(name = "build-timeout", version, about)]
pub struct Cli {
    /// Config file path (a missing file means defaults)
    #[arg(short, long, default_value = "build-timeout.toml")]
    config: PathBuf,

    /// Build parameter, merged over [job.parameters] (repeatable)
    #[arg(short = 'p', long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Override the strategy's timeout expression
    #[arg(long, value_name = "EXPR")]
    timeout: Option<String>,

    /// Print the resolved configuration and effective timeout, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (watchdog polls, latch decisions)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings, errors and the final result
    #[arg(short, long)]
    quiet: bool,

    /// Print the last report from the status file and exit
    #[arg(long)]
    status: bool,

    /// Write the resolved configuration (file, flags and defaults) to the
    /// config path and exit
    #[arg(long)]
    init: bool,

    /// Command to supervise (overrides job.command)
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("no command to run: set job.command or pass one after `--`")]
    NoCommand,
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got `{raw}`")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "build-timeout failed");
            eprintln!("error: {e}");
            ExitCode::from(3)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let mut config = Config::load_or_default(&cli.config)?;
    apply_overrides(&mut config, &cli);

    if let Some(secs) = config.supervisor.minimum_timeout_secs {
        expression::set_minimum_timeout(Duration::from_secs(secs));
    }
    let options = config.to_options();

    if cli.status {
        print_status(&config)?;
        return Ok(ExitCode::SUCCESS);
    }

    if cli.init {
        ensure_parent(&cli.config)?;
        config.save(&cli.config)?;
        println!("Wrote {}", cli.config.display());
        return Ok(ExitCode::SUCCESS);
    }

    let mut history = BuildHistory::load(&config.storage.history_file)?;

    if cli.dry_run {
        print_dry_run(&config, options.minimum_timeout, &history);
        return Ok(ExitCode::SUCCESS);
    }

    if config.job.command.trim().is_empty() {
        return Err(CliError::NoCommand);
    }
    ensure_parent(&config.storage.status_file)?;
    ensure_parent(&config.storage.history_file)?;

    let pipeline = Arc::new(config.pipeline());
    let mut tracker = StatusTracker::new(
        config.storage.status_file.clone(),
        config.job.name.as_str(),
        config.timeout.strategy.kind(),
    );
    let mut retry = RetryPolicy::new();

    tracing::info!(
        job = %config.job.name,
        strategy = config.timeout.strategy.kind(),
        operations = ?pipeline.names(),
        "build-timeout starting"
    );

    loop {
        let execution = Execution::new(config.job.name.as_str());
        let listener = signals::install(execution.clone());
        tracker.update(SupervisorState::Running, None);

        let job = Box::new(ShellJob::new(
            config.job.name.as_str(),
            config.job.command.as_str(),
        ));
        let report = Supervisor::new(options.clone())
            .with_history(history.clone())
            .run_execution(
                execution,
                job,
                &config.timeout.strategy,
                pipeline.clone(),
                config.job.parameters.clone(),
            )
            .await;
        listener.abort();

        history.push(report.record());
        if let Err(e) = history.save(&config.storage.history_file) {
            tracing::warn!(error = %e, "failed to save build history");
        }

        match retry.evaluate(&report) {
            RetryDecision::Restart { attempt } => {
                tracker.set_attempt(attempt);
                tracker.update(SupervisorState::Restarting, Some(&report));
                print_summary(&report, cli.quiet);
            }
            RetryDecision::Finish => {
                tracker.update(SupervisorState::Finished, Some(&report));
                print_summary(&report, cli.quiet);
                tracing::info!(
                    result = %report.result,
                    restarts = retry.restarts(),
                    "build-timeout finished"
                );
                return Ok(ExitCode::from(report.result.exit_code()));
            }
        }
    }
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    for (name, value) in &cli.params {
        config.job.parameters.insert(name.clone(), value.clone());
    }

    if let Some(timeout) = &cli.timeout {
        if !config
            .timeout
            .strategy
            .set_expression(TimeoutExpression::new(timeout.as_str()))
        {
            tracing::warn!(
                strategy = config.timeout.strategy.kind(),
                "strategy has no timeout expression, ignoring --timeout"
            );
        }
    }

    if !cli.command.is_empty() {
        config.job.command = cli.command.join(" ");
    }
}

fn ensure_parent(path: &Path) -> Result<(), CliError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            std::fs::create_dir_all(dir).map_err(|source| CliError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}

fn print_dry_run(config: &Config, floor: Duration, history: &BuildHistory) {
    println!("build-timeout v{}", env!("CARGO_PKG_VERSION"));
    println!("Job: {} ({})", config.job.name, config.job.command);
    for (name, value) in &config.job.parameters {
        println!("  {name}={value}");
    }
    println!("Strategy: {}", config.timeout.strategy.kind());
    if let Some(expr) = config.timeout.strategy.expression() {
        println!("Expression: {expr}");
    }
    println!("Minimum timeout: {}s", floor.as_secs());
    println!("History: {} recorded executions", history.records().len());

    let activity = Arc::new(ActivityMonitor::new());
    let ctx = ArmContext {
        started: tokio::time::Instant::now(),
        wall_clock: Local::now(),
        parameters: &config.job.parameters,
        floor,
        activity: &activity,
        history,
    };
    match config.timeout.strategy.arm(&ctx) {
        Ok(armed) => println!(
            "Effective timeout: {}s ({})",
            armed.effective().as_secs(),
            armed.description()
        ),
        Err(e) => println!("Timeout not armed: {e}"),
    }
    println!("Operations: {}", config.pipeline().names().join(", "));
}

fn print_status(config: &Config) -> Result<(), CliError> {
    let data = StatusFile::new(config.storage.status_file.clone()).read()?;
    println!(
        "{} (pid {}) {:?}, attempt {}, updated {}",
        data.job,
        data.pid,
        data.state,
        data.attempt,
        data.last_update.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(report) = &data.report {
        print_summary(report, false);
    }
    Ok(())
}

fn print_summary(report: &ExecutionReport, quiet: bool) {
    if !quiet {
        if let Some(info) = &report.timed_out {
            println!(
                "Timed out after {}s ({})",
                info.effective_ms / 1000,
                info.strategy
            );
        }
        if let Some(description) = &report.description {
            println!("Description: {description}");
        }
        if report.interrupt_expired {
            println!("Job did not stop after interruption and was abandoned");
        }
    }
    println!(
        "Finished: {} in {:.1}s",
        report.result,
        report.duration_ms as f64 / 1000.0
    );
}
