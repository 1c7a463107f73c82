// CLI module - User-facing command-line interface

mod output;

use crate::config::{StagehandConfig, SupervisorSettings};
use crate::logs::{FileSink, FileSinkOptions};
use crate::process::Supervisor;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

/// Exit code for configuration and setup failures
pub const SETUP_FAILURE: u8 = 2;

/// Stagehand - launch a pipeline of processes in order and keep them up together
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start every stage in order and supervise them until stopped
    Run {
        /// Path to the configuration file (.toml or .json)
        config: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Validate a configuration file and list its stages
    Check {
        /// Path to the configuration file (.toml or .json)
        config: PathBuf,
    },
}

/// Command-line overrides for the `[supervisor]` table
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Seconds to wait between launching consecutive stages
    #[arg(long, value_name = "SECS")]
    pub stage_delay: Option<u64>,

    /// Seconds to wait after SIGTERM before sending SIGKILL
    #[arg(long, value_name = "SECS")]
    pub grace_period: Option<u64>,

    /// Milliseconds between liveness checks
    #[arg(long, value_name = "MS")]
    pub poll_interval: Option<u64>,

    /// Log file path
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Do not echo log records to the console
    #[arg(long)]
    pub no_console: bool,
}

impl Overrides {
    pub fn apply(&self, settings: &mut SupervisorSettings) {
        if let Some(secs) = self.stage_delay {
            settings.stage_delay_secs = secs;
        }
        if let Some(secs) = self.grace_period {
            settings.grace_period_secs = secs;
        }
        if let Some(ms) = self.poll_interval {
            settings.poll_interval_ms = ms;
        }
        if let Some(ref path) = self.log_file {
            settings.log_file = path.clone();
        }
        if self.no_console {
            settings.console = false;
        }
    }
}

impl Cli {
    /// Parse arguments and run; every error that escapes is a setup failure
    pub async fn run() -> ExitCode {
        let cli = Cli::parse();
        match cli.execute().await {
            Ok(code) => code,
            Err(e) => {
                output::print_error(&format!("{:#}", e));
                ExitCode::from(SETUP_FAILURE)
            }
        }
    }

    /// Execute the parsed command
    pub async fn execute(&self) -> anyhow::Result<ExitCode> {
        match &self.command {
            Commands::Run { config, overrides } => run_stages(config, overrides).await,
            Commands::Check { config } => check_config(config),
        }
    }
}

async fn run_stages(path: &Path, overrides: &Overrides) -> anyhow::Result<ExitCode> {
    let config = load_config(path, overrides)?;
    let stages = config.stage_specs()?;
    let settings = &config.supervisor;

    // Listen before any child exists so an early signal still takes the clean path
    let stop = shutdown_signal().context("Failed to install signal handlers")?;

    let options = FileSinkOptions {
        console: settings.console,
        color: std::io::stdout().is_terminal(),
        max_size: settings.max_log_size,
    };
    let sink = FileSink::open(&settings.log_file, options)
        .await
        .with_context(|| format!("Failed to open log file {}", settings.log_file.display()))?;

    info!(
        "Supervising {} stage(s), logging to {}",
        stages.len(),
        settings.log_file.display()
    );

    let supervisor = Supervisor::with_system_control(settings.timings(), Arc::new(sink));
    let report = supervisor.run(&stages, stop).await;

    if !settings.console {
        output::print_run_summary(&report);
    }

    Ok(ExitCode::from(report.outcome.exit_code() as u8))
}

fn check_config(path: &Path) -> anyhow::Result<ExitCode> {
    let config = load_config(path, &Overrides::default())?;
    let stages = config.stage_specs()?;

    output::print_stage_table(&stages);
    output::print_settings(&config.supervisor);
    output::print_success_msg(&format!("{} is valid", path.display()));

    Ok(ExitCode::SUCCESS)
}

fn load_config(path: &Path, overrides: &Overrides) -> anyhow::Result<StagehandConfig> {
    let mut config = StagehandConfig::from_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    overrides.apply(&mut config.supervisor);
    config.validate()?;

    Ok(config)
}

/// Resolves on the first SIGINT or SIGTERM.
///
/// The listeners are registered when this is called, not when the future is
/// first polled.
#[cfg(unix)]
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    })
}

#[cfg(not(unix))]
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    Ok(async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl-C");
    })
}
