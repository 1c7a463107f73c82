use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    NotStarted,
    Running,
    ExitedClean,
    ExitedError,
    Terminating,
    Terminated,
}

impl ProcessState {
    pub fn has_exited(self) -> bool {
        matches!(self, ProcessState::ExitedClean | ProcessState::ExitedError)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::NotStarted => write!(f, "not-started"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::ExitedClean => write!(f, "exited-clean"),
            ProcessState::ExitedError => write!(f, "exited-error"),
            ProcessState::Terminating => write!(f, "terminating"),
            ProcessState::Terminated => write!(f, "terminated"),
        }
    }
}

/// How a child process ended, as published by its exit waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal number, if the process was killed by a signal
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Outcome used when the exit status could not be collected
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Executable, arguments and environment overrides for one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Applied on top of the inherited environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Command line rendered for display
    pub fn display(&self) -> String {
        let mut rendered = self.program.display().to_string();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

/// One named stage in launch order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    pub command: CommandSpec,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            name: name.into(),
            command,
        }
    }
}

/// In-process record of one launched program and its observed lifecycle.
///
/// The OS pid is fixed at construction and present exactly when the handle
/// left `NotStarted`. Output streams are not held here; they belong to the
/// log router's reader tasks.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    command: CommandSpec,
    pid: Option<u32>,
    state: Mutex<ProcessState>,
    exit: Option<watch::Receiver<Option<ExitOutcome>>>,
}

impl ProcessHandle {
    pub fn not_started(name: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            name: name.into(),
            command,
            pid: None,
            state: Mutex::new(ProcessState::NotStarted),
            exit: None,
        }
    }

    /// Handle for a process that is already running.
    ///
    /// `exit` must be fed by whoever waits on the child; it flips to `Some`
    /// once the process has exited and been reaped.
    pub fn running(
        name: impl Into<String>,
        command: CommandSpec,
        pid: u32,
        exit: watch::Receiver<Option<ExitOutcome>>,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            pid: Some(pid),
            state: Mutex::new(ProcessState::Running),
            exit: Some(exit),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.lock_state()
    }

    /// Exit outcome if the process has already exited; never blocks
    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.exit.as_ref().and_then(|rx| *rx.borrow())
    }

    /// Wait until the process exits or `timeout` elapses.
    ///
    /// Returns `None` on timeout. A handle that never started resolves
    /// immediately with `None`.
    pub async fn wait_exit(&self, timeout: std::time::Duration) -> Option<ExitOutcome> {
        let mut rx = self.exit.clone()?;
        let observed =
            match tokio::time::timeout(timeout, rx.wait_for(|outcome| outcome.is_some())).await {
                Ok(Ok(outcome)) => *outcome,
                // Sender dropped without publishing: treat as exited, status unknown
                Ok(Err(_)) => Some(ExitOutcome::unknown()),
                Err(_) => None,
            };
        observed
    }

    /// Record an exit the supervisor observed while the handle was running
    pub fn mark_exited(&self, outcome: &ExitOutcome) -> bool {
        let next = if outcome.success() {
            ProcessState::ExitedClean
        } else {
            ProcessState::ExitedError
        };
        let mut state = self.lock_state();
        if *state != ProcessState::Running {
            return false;
        }
        *state = next;
        true
    }

    /// Claim the handle for termination.
    ///
    /// Returns the prior state when this caller now owns the termination
    /// sequence, or `None` when another shutdown already claimed or finished it.
    pub fn begin_termination(&self) -> Option<ProcessState> {
        let mut state = self.lock_state();
        match *state {
            ProcessState::Terminating | ProcessState::Terminated => None,
            prior => {
                *state = ProcessState::Terminating;
                Some(prior)
            }
        }
    }

    pub fn mark_terminated(&self) {
        *self.lock_state() = ProcessState::Terminated;
    }

    fn lock_state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
