// Output formatting and display for CLI

use crate::config::SupervisorSettings;
use crate::process::{RunOutcome, RunReport, ShutdownPath, StageSpec};
use colored::*;
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a success message
pub fn print_success_msg(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a formatted table of stages in launch order
pub fn print_stage_table(stages: &[StageSpec]) {
    #[derive(Tabled)]
    struct StageRow {
        #[tabled(rename = "#")]
        order: usize,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Command")]
        command: String,
        #[tabled(rename = "Cwd")]
        cwd: String,
        #[tabled(rename = "Env")]
        env: usize,
    }

    let rows: Vec<StageRow> = stages
        .iter()
        .enumerate()
        .map(|(index, stage)| StageRow {
            order: index + 1,
            name: truncate(&stage.name, 20),
            command: truncate(&stage.command.display(), 50),
            cwd: stage
                .command
                .cwd
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
            env: stage.command.env.len(),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!("Total: {} stage(s)", stages.len()).dimmed().italic()
    );
}

/// Print the effective supervisor settings
pub fn print_settings(settings: &SupervisorSettings) {
    let timings = settings.timings();

    println!("\n{}", "Supervisor".bold().underline());
    println!();
    println!(
        "  {:<15} {}",
        "Stage delay:".bold(),
        format_duration(&timings.stage_delay)
    );
    println!(
        "  {:<15} {}",
        "Poll interval:".bold(),
        format_duration(&timings.poll_interval)
    );
    println!(
        "  {:<15} {}",
        "Grace period:".bold(),
        format_duration(&timings.grace_period)
    );
    println!(
        "  {:<15} {}",
        "Log file:".bold(),
        settings.log_file.display()
    );
    println!("  {:<15} {}", "Console:".bold(), settings.console);
    println!();
}

/// Print how the run ended and how each stage was shut down
pub fn print_run_summary(report: &RunReport) {
    match &report.outcome {
        RunOutcome::Stopped => print_success_msg("All processes stopped"),
        other => print_error(&format_outcome(other)),
    }

    for handle in &report.shutdown.handles {
        let path = format_path_colored(handle.path);
        let pid = handle
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        print_info(&format!("{} (PID: {}): {}", handle.name.cyan(), pid, path));
        for error in &handle.errors {
            print_error(&error.to_string());
        }
    }

    if report.shutdown.drain.abandoned > 0 {
        print_error(&format!(
            "{} log reader(s) did not finish in time",
            report.shutdown.drain.abandoned
        ));
    }
}

fn format_outcome(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Stopped => "stopped on request".to_string(),
        RunOutcome::UnexpectedExit { name, exit } => {
            format!("{} exited unexpectedly ({})", name, exit)
        }
        RunOutcome::LaunchFailed { name } => format!("{} failed to launch", name),
    }
}

/// Format a shutdown path with color coding
fn format_path_colored(path: ShutdownPath) -> String {
    match path {
        ShutdownPath::Graceful => path.to_string().green().to_string(),
        ShutdownPath::Forced => path.to_string().red().bold().to_string(),
        ShutdownPath::AlreadyExited => path.to_string().yellow().to_string(),
        ShutdownPath::AlreadyTerminated => path.to_string().bright_black().to_string(),
    }
}

/// Format a duration in human-readable format
fn format_duration(duration: &Duration) -> String {
    let millis = duration.as_millis();
    let secs = duration.as_secs();

    if millis % 1000 != 0 {
        format!("{}ms", millis)
    } else if secs < 60 {
        format!("{}s", secs)
    } else {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    }
}

/// Truncate a string to a maximum length
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
