use crate::error::{Result, StagehandError};
use crate::process::types::{CommandSpec, ExitOutcome, ProcessHandle};
use std::process::Stdio;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Environment overrides injected into every child so its output decodes as UTF-8
/// regardless of host locale defaults. Stage-level `env` entries are applied after.
pub const UTF8_ENV_OVERRIDES: &[(&str, &str)] = &[("PYTHONIOENCODING", "utf-8")];

/// Captured output pipes of a freshly launched process
#[derive(Debug)]
pub struct OutputStreams {
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Result of a successful launch: the running handle plus its output pipes,
/// which the caller hands to the log router.
#[derive(Debug)]
pub struct Launched {
    pub handle: ProcessHandle,
    pub streams: OutputStreams,
}

/// Launch one stage.
///
/// Spawns the process with stdout/stderr piped and stdin closed, then hands
/// the child to a waiter task that reaps it and publishes its exit outcome.
/// Returns as soon as the OS has accepted the spawn.
///
/// # Arguments
/// * `name` - Stage name, used for error attribution
/// * `command` - Executable, arguments and environment overrides
///
/// # Returns
/// * `Ok(Launched)` - Handle in `Running` state with its pid populated
/// * `Err(StagehandError::Launch)` - Executable missing or spawn refused
pub fn launch(name: &str, command: &CommandSpec) -> Result<Launched> {
    let launch_error = |cause: String| StagehandError::Launch {
        name: name.to_string(),
        cause,
    };

    // Bare program names are resolved through PATH by the OS; explicit paths
    // are checked up front for a clearer error. A relative path resolves
    // against the child's working directory, not ours.
    let resolved = match command.cwd {
        Some(ref cwd) if command.program.is_relative() => cwd.join(&command.program),
        _ => command.program.clone(),
    };
    if command.program.components().count() > 1 && !resolved.exists() {
        return Err(launch_error(format!(
            "executable does not exist: {}",
            command.program.display()
        )));
    }

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);

    if let Some(ref cwd) = command.cwd {
        cmd.current_dir(cwd);
    }

    for (key, value) in UTF8_ENV_OVERRIDES {
        cmd.env(key, value);
    }
    for (key, value) in &command.env {
        cmd.env(key, value);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    // Own process group: a terminal Ctrl-C reaches only the supervisor,
    // which then runs the ordered shutdown.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| launch_error(format!("spawn failed: {}", e)))?;

    let pid = child
        .id()
        .ok_or_else(|| launch_error("process exited before its pid was read".to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| launch_error("stdout pipe unavailable".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| launch_error("stderr pipe unavailable".to_string()))?;

    let (exit_tx, exit_rx) = watch::channel(None);
    let waiter_name = name.to_string();
    tokio::spawn(async move {
        let outcome = match child.wait().await {
            Ok(status) => ExitOutcome::from(status),
            Err(e) => {
                warn!("Failed to wait on {} (PID: {}): {}", waiter_name, pid, e);
                ExitOutcome::unknown()
            }
        };
        debug!("{} (PID: {}) exited: {}", waiter_name, pid, outcome);
        let _ = exit_tx.send(Some(outcome));
    });

    debug!("Launched {} (PID: {}): {}", name, pid, command.display());

    Ok(Launched {
        handle: ProcessHandle::running(name, command.clone(), pid, exit_rx),
        streams: OutputStreams { stdout, stderr },
    })
}
