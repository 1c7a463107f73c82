use crate::error::{Result, StagehandError};
use crate::logs::{LogRecord, LogRouter, LogSink, Severity, SUPERVISOR_TAG};
use crate::process::monitor::{Health, LivenessMonitor, DEFAULT_POLL_INTERVAL};
use crate::process::shutdown::{
    ShutdownCoordinator, ShutdownReport, DEFAULT_DRAIN_TIMEOUT, DEFAULT_GRACE_PERIOD,
};
use crate::process::spawner::launch;
use crate::process::{
    ExitOutcome, ProcessControl, ProcessHandle, Registry, StageSpec, SystemControl,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Default pause between launching one stage and the next
pub const DEFAULT_STAGE_DELAY: Duration = Duration::from_secs(2);

/// Timing knobs of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Pause after each successful launch before the next stage
    pub stage_delay: Duration,
    /// Interval between liveness polls
    pub poll_interval: Duration,
    /// Wait after a graceful termination request before force killing
    pub grace_period: Duration,
    /// Bounded wait for log readers at the end of shutdown
    pub drain_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            stage_delay: DEFAULT_STAGE_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// How startup ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    Complete,
    /// A stop request arrived during an inter-stage delay
    Interrupted,
}

/// Why the supervised group came down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Operator requested the stop
    Stopped,
    /// A stage exited on its own
    UnexpectedExit { name: String, exit: ExitOutcome },
    /// A stage could not be launched
    LaunchFailed { name: String },
}

impl RunOutcome {
    /// Process exit code for the supervisor itself
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Stopped => 0,
            RunOutcome::UnexpectedExit { .. } | RunOutcome::LaunchFailed { .. } => 1,
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub shutdown: ShutdownReport,
}

/// Launches stages in order, watches them, and tears the whole group down on
/// the first unexpected exit, a launch failure or an operator stop.
///
/// The supervisor is the only writer of the registry; the monitor and the
/// shutdown coordinator work from snapshots.
pub struct Supervisor {
    registry: Arc<RwLock<Registry>>,
    router: LogRouter,
    monitor: LivenessMonitor,
    coordinator: ShutdownCoordinator,
    sink: Arc<dyn LogSink>,
    stage_delay: Duration,
}

impl Supervisor {
    pub fn new(
        timings: Timings,
        sink: Arc<dyn LogSink>,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        let coordinator = ShutdownCoordinator::new(control, Arc::clone(&sink))
            .with_grace_period(timings.grace_period)
            .with_drain_timeout(timings.drain_timeout);

        Self {
            registry: Arc::new(RwLock::new(Registry::new())),
            router: LogRouter::new(Arc::clone(&sink)),
            monitor: LivenessMonitor::new(timings.poll_interval),
            coordinator,
            sink,
            stage_delay: timings.stage_delay,
        }
    }

    /// Supervisor using the real OS process table and signals
    pub fn with_system_control(timings: Timings, sink: Arc<dyn LogSink>) -> Self {
        Self::new(timings, sink, Arc::new(SystemControl::new()))
    }

    pub fn registry(&self) -> Arc<RwLock<Registry>> {
        Arc::clone(&self.registry)
    }

    pub async fn handle(&self, name: &str) -> Option<Arc<ProcessHandle>> {
        self.registry.read().await.get(name)
    }

    /// Launch one stage, attach its output to the router and register it.
    ///
    /// A name that is already registered is refused before anything is
    /// spawned; the registry is only changed on success.
    pub async fn launch_stage(&self, stage: &StageSpec) -> Result<Arc<ProcessHandle>> {
        let mut registry = self.registry.write().await;

        let launched = if registry.contains(&stage.name) {
            Err(StagehandError::DuplicateName(stage.name.clone()))
        } else {
            launch(&stage.name, &stage.command)
        };

        let launched = match launched {
            Ok(launched) => launched,
            Err(e) => {
                drop(registry);
                self.emit(Severity::Error, e.to_string()).await;
                return Err(e);
            }
        };

        let handle = Arc::new(launched.handle);
        self.router.attach(&stage.name, launched.streams);
        registry.insert(Arc::clone(&handle))?;
        drop(registry);

        info!(
            "Started process {} (PID: {})",
            stage.name,
            handle.pid().unwrap_or_default()
        );
        self.emit(
            Severity::Info,
            format!(
                "{} started (PID: {}): {}",
                stage.name,
                handle.pid().unwrap_or_default(),
                stage.command.display()
            ),
        )
        .await;

        Ok(handle)
    }

    /// Launch all stages in order with the inter-stage delay.
    ///
    /// Fail-fast: if any launch fails, everything launched so far is shut
    /// down and the remaining stages are never attempted.
    pub async fn start(&self, stages: &[StageSpec]) -> Result<()> {
        let mut never = std::future::pending::<()>();
        match self.launch_all(stages, &mut never).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.shutdown_all().await;
                Err(e)
            }
        }
    }

    /// Poll liveness on the configured interval until a stage exits on its
    /// own or `stop` resolves.
    ///
    /// An exited stage is recorded as `ExitedClean`/`ExitedError` before
    /// returning. Does not shut anything down.
    pub async fn monitor_until<S>(&self, stop: &mut S) -> RunOutcome
    where
        S: Future<Output = ()> + Unpin,
    {
        let mut ticker = tokio::time::interval(self.monitor.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut *stop => {
                    self.emit(Severity::Info, "Stop requested, stopping all processes").await;
                    return RunOutcome::Stopped;
                }
                _ = ticker.tick() => {
                    let snapshot = self.registry.read().await.snapshot();
                    if let Health::Unhealthy { name, exit } = self.monitor.poll_once(&snapshot) {
                        if let Some(handle) = snapshot.iter().find(|h| h.name() == name) {
                            handle.mark_exited(&exit);
                        }
                        let error = StagehandError::UnexpectedExit {
                            name: name.clone(),
                            status: exit,
                        };
                        self.emit(Severity::Error, error.to_string()).await;
                        return RunOutcome::UnexpectedExit { name, exit };
                    }
                }
            }
        }
    }

    /// Terminate every registered process tree and drain the log readers
    pub async fn shutdown_all(&self) -> ShutdownReport {
        let snapshot = self.registry.read().await.snapshot();
        self.coordinator.shutdown_all(&snapshot, &self.router).await
    }

    /// Full lifecycle: start in order, monitor, and always shut down.
    ///
    /// `stop` is the operator stop request; it is honored both during the
    /// inter-stage delays and while monitoring.
    pub async fn run<S>(&self, stages: &[StageSpec], stop: S) -> RunReport
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(stop);

        let outcome = match self.launch_all(stages, &mut stop).await {
            Ok(Startup::Complete) => self.monitor_until(&mut stop).await,
            Ok(Startup::Interrupted) => RunOutcome::Stopped,
            Err(e) => RunOutcome::LaunchFailed {
                name: e.stage().unwrap_or_default().to_string(),
            },
        };

        let shutdown = self.shutdown_all().await;
        let (severity, text) = match &outcome {
            RunOutcome::Stopped => (Severity::Info, "All processes stopped".to_string()),
            RunOutcome::UnexpectedExit { name, .. } => (
                Severity::Error,
                format!("All processes stopped after {} exited unexpectedly", name),
            ),
            RunOutcome::LaunchFailed { name } => (
                Severity::Error,
                format!("Startup aborted: {} failed to launch", name),
            ),
        };
        self.emit(severity, text).await;

        RunReport { outcome, shutdown }
    }

    async fn launch_all<S>(&self, stages: &[StageSpec], stop: &mut S) -> Result<Startup>
    where
        S: Future<Output = ()> + Unpin,
    {
        for (index, stage) in stages.iter().enumerate() {
            self.launch_stage(stage).await?;

            if index + 1 < stages.len() {
                debug!(
                    "Waiting {:?} before launching {}",
                    self.stage_delay,
                    stages[index + 1].name
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.stage_delay) => {}
                    _ = &mut *stop => {
                        self.emit(Severity::Info, "Stop requested during startup").await;
                        return Ok(Startup::Interrupted);
                    }
                }
            }
        }

        let names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        self.emit(
            Severity::Info,
            format!("All {} stage(s) started: {}", stages.len(), names.join(", ")),
        )
        .await;

        Ok(Startup::Complete)
    }

    async fn emit(&self, severity: Severity, text: impl Into<String>) {
        self.sink
            .emit(LogRecord::component(SUPERVISOR_TAG, severity, text))
            .await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::logs::MemorySink;
    use crate::process::{CommandSpec, ProcessState, ShutdownPath};

    fn fast() -> Timings {
        Timings {
            stage_delay: Duration::from_millis(50),
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_secs(2),
            drain_timeout: Duration::from_millis(500),
        }
    }

    fn sleeper(name: &str) -> StageSpec {
        StageSpec::new(name, CommandSpec::new("/bin/sleep").arg("30"))
    }

    #[tokio::test]
    async fn test_start_registers_in_order() {
        let sink = Arc::new(MemorySink::new());
        let supervisor = Supervisor::with_system_control(fast(), sink.clone());

        supervisor
            .start(&[sleeper("A"), sleeper("B")])
            .await
            .unwrap();

        let names = supervisor.registry().read().await.names();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(
            supervisor.handle("A").await.unwrap().state(),
            ProcessState::Running
        );

        let report = supervisor.shutdown_all().await;
        assert!(report.handles.iter().all(|h| h.path == ShutdownPath::Graceful));
    }

    #[tokio::test]
    async fn test_duplicate_stage_name_is_refused() {
        let sink = Arc::new(MemorySink::new());
        let supervisor = Supervisor::with_system_control(fast(), sink.clone());

        let first = supervisor.launch_stage(&sleeper("A")).await.unwrap();
        let second = supervisor.launch_stage(&sleeper("A")).await;

        assert!(matches!(second, Err(StagehandError::DuplicateName(_))));
        assert_eq!(supervisor.registry().read().await.len(), 1);
        assert!(Arc::ptr_eq(&supervisor.handle("A").await.unwrap(), &first));

        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_monitor_detects_exit() {
        let sink = Arc::new(MemorySink::new());
        let supervisor = Supervisor::with_system_control(fast(), sink.clone());
        let stage = StageSpec::new(
            "short",
            CommandSpec::new("/bin/sh").arg("-c").arg("exit 3"),
        );

        supervisor.start(&[stage]).await.unwrap();
        let mut never = std::future::pending::<()>();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            supervisor.monitor_until(&mut never),
        )
        .await
        .unwrap();

        assert_eq!(
            outcome,
            RunOutcome::UnexpectedExit {
                name: "short".to_string(),
                exit: ExitOutcome::from_code(3),
            }
        );
        assert_eq!(
            supervisor.handle("short").await.unwrap().state(),
            ProcessState::ExitedError
        );
        assert!(sink
            .from_source(SUPERVISOR_TAG)
            .iter()
            .any(|r| r.severity == Severity::Error && r.text.contains("short exited unexpectedly")));

        let report = supervisor.shutdown_all().await;
        assert_eq!(report.get("short").unwrap().path, ShutdownPath::AlreadyExited);
    }

    #[tokio::test]
    async fn test_run_stops_on_request() {
        let sink = Arc::new(MemorySink::new());
        let supervisor = Supervisor::with_system_control(fast(), sink.clone());

        let stop = tokio::time::sleep(Duration::from_millis(300));
        let report = supervisor.run(&[sleeper("A"), sleeper("B")], stop).await;

        assert_eq!(report.outcome, RunOutcome::Stopped);
        assert_eq!(report.outcome.exit_code(), 0);
        assert_eq!(report.shutdown.handles.len(), 2);
        for handle in supervisor.registry().read().await.snapshot() {
            assert_eq!(handle.state(), ProcessState::Terminated);
        }
    }

    #[tokio::test]
    async fn test_stop_during_stage_delay_skips_remaining() {
        let sink = Arc::new(MemorySink::new());
        let mut timings = fast();
        timings.stage_delay = Duration::from_secs(10);
        let supervisor = Supervisor::with_system_control(timings, sink.clone());

        let stop = tokio::time::sleep(Duration::from_millis(100));
        let report = supervisor.run(&[sleeper("A"), sleeper("B")], stop).await;

        assert_eq!(report.outcome, RunOutcome::Stopped);
        assert_eq!(supervisor.registry().read().await.names(), vec!["A"]);
    }
}
