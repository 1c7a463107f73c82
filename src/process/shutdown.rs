use crate::error::StagehandError;
use crate::logs::{DrainOutcome, LogRecord, LogRouter, LogSink, Severity, SHUTDOWN_TAG};
use crate::process::{ProcessControl, ProcessHandle};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default wait after a graceful termination request before force killing
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
/// Default bounded wait for log readers to drain after all processes stopped
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// How long to wait for the OS to reap a process after a forceful kill
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(1);
const DESCENDANT_POLL: Duration = Duration::from_millis(50);

/// Which path concluded a handle's shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPath {
    /// Exited within the grace period after the termination request
    Graceful,
    /// Grace period elapsed; a forceful kill was sent
    Forced,
    /// Another shutdown already claimed or finished this handle; nothing signaled
    AlreadyTerminated,
    /// Process had exited before shutdown began; only its descendants were signaled
    AlreadyExited,
}

impl fmt::Display for ShutdownPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownPath::Graceful => write!(f, "graceful"),
            ShutdownPath::Forced => write!(f, "forced"),
            ShutdownPath::AlreadyTerminated => write!(f, "already-terminated"),
            ShutdownPath::AlreadyExited => write!(f, "already-exited"),
        }
    }
}

/// Outcome of shutting down one handle
#[derive(Debug)]
pub struct HandleReport {
    pub name: String,
    pub pid: Option<u32>,
    pub path: ShutdownPath,
    /// Process tree snapshot taken when shutdown began, nearest generation first
    pub descendants: Vec<u32>,
    /// Signal failures; none of them stopped the sequence
    pub errors: Vec<StagehandError>,
}

impl HandleReport {
    fn new(handle: &ProcessHandle) -> Self {
        Self {
            name: handle.name().to_string(),
            pid: handle.pid(),
            path: ShutdownPath::AlreadyTerminated,
            descendants: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn signal_failed(&mut self, pid: u32, cause: std::io::Error) {
        warn!("Failed to signal {} (PID: {}): {}", self.name, pid, cause);
        self.errors.push(StagehandError::Signal {
            name: self.name.clone(),
            pid,
            cause: cause.to_string(),
        });
    }
}

/// Per-handle outcomes in registry order, plus the log drain result
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub handles: Vec<HandleReport>,
    pub drain: DrainOutcome,
}

impl ShutdownReport {
    pub fn get(&self, name: &str) -> Option<&HandleReport> {
        self.handles.iter().find(|h| h.name == name)
    }

    /// True when no signal failed for any handle
    pub fn is_clean(&self) -> bool {
        self.handles.iter().all(|h| h.errors.is_empty())
    }
}

/// Terminates every handle's process tree: descendants first, then the
/// launched process, escalating to a forceful kill after the grace period.
pub struct ShutdownCoordinator {
    control: Arc<dyn ProcessControl>,
    sink: Arc<dyn LogSink>,
    grace_period: Duration,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(control: Arc<dyn ProcessControl>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            control,
            sink,
            grace_period: DEFAULT_GRACE_PERIOD,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Shut down every handle concurrently, then drain the log readers.
    ///
    /// Always runs to completion. Handles already `Terminated` are skipped
    /// without any OS signal, so calling this twice is safe.
    pub async fn shutdown_all(
        &self,
        handles: &[Arc<ProcessHandle>],
        router: &LogRouter,
    ) -> ShutdownReport {
        info!("Shutting down {} process(es)", handles.len());

        let mut tasks = JoinSet::new();
        for (index, handle) in handles.iter().enumerate() {
            let handle = Arc::clone(handle);
            let control = Arc::clone(&self.control);
            let sink = Arc::clone(&self.sink);
            let grace_period = self.grace_period;
            tasks.spawn(async move {
                let report = terminate_tree(&handle, control.as_ref(), grace_period).await;
                announce(sink.as_ref(), &report).await;
                (index, report)
            });
        }

        let mut slots: Vec<Option<HandleReport>> = handles.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(e) => warn!("Shutdown task failed: {}", e),
            }
        }

        let reports = slots
            .into_iter()
            .zip(handles)
            .map(|(slot, handle)| {
                slot.unwrap_or_else(|| {
                    // The task died mid-sequence; the handle is still done for
                    handle.mark_terminated();
                    let mut report = HandleReport::new(handle);
                    report.errors.push(StagehandError::Signal {
                        name: handle.name().to_string(),
                        pid: handle.pid().unwrap_or_default(),
                        cause: "shutdown task aborted".to_string(),
                    });
                    report
                })
            })
            .collect();

        let drain = router.drain(self.drain_timeout).await;
        if drain.abandoned > 0 {
            self.sink
                .emit(LogRecord::component(
                    SHUTDOWN_TAG,
                    Severity::Warning,
                    format!("{} log reader(s) did not finish draining", drain.abandoned),
                ))
                .await;
        }

        ShutdownReport {
            handles: reports,
            drain,
        }
    }
}

/// Run the termination sequence for one handle
async fn terminate_tree(
    handle: &ProcessHandle,
    control: &dyn ProcessControl,
    grace_period: Duration,
) -> HandleReport {
    let mut report = HandleReport::new(handle);

    let Some(prior) = handle.begin_termination() else {
        debug!("{} already terminated, skipping", handle.name());
        return report;
    };
    let Some(pid) = handle.pid() else {
        handle.mark_terminated();
        return report;
    };

    // Snapshot taken once; not re-polled while signaling
    let descendants = control.list_descendants(pid);
    debug!("{} (PID: {}) has descendants {:?}", handle.name(), pid, descendants);

    // Deepest generation first, the launched process last
    for &child in descendants.iter().rev() {
        if let Err(e) = control.terminate(child) {
            report.signal_failed(child, e);
        }
    }

    let deadline = Instant::now() + grace_period;

    if prior.has_exited() || handle.exit_outcome().is_some() {
        report.path = ShutdownPath::AlreadyExited;
    } else {
        if let Err(e) = control.terminate(pid) {
            report.signal_failed(pid, e);
        }

        if handle.wait_exit(grace_period).await.is_some() {
            report.path = ShutdownPath::Graceful;
        } else {
            warn!(
                "{} (PID: {}) did not exit within {:?}, sending SIGKILL",
                handle.name(),
                pid,
                grace_period
            );
            report.path = ShutdownPath::Forced;
            match control.kill(pid) {
                Ok(()) => {
                    let _ = handle.wait_exit(KILL_REAP_TIMEOUT).await;
                }
                Err(e) => report.signal_failed(pid, e),
            }
        }
    }

    // Descendants that outlive the window get the forceful kill as well
    for child in await_descendants(control, &descendants, deadline).await {
        warn!("Descendant {} of {} still alive, sending SIGKILL", child, handle.name());
        if let Err(e) = control.kill(child) {
            report.signal_failed(child, e);
        }
    }

    report.descendants = descendants;
    handle.mark_terminated();
    report
}

/// Poll until every pid is gone or `deadline` passes; returns the survivors
async fn await_descendants(
    control: &dyn ProcessControl,
    descendants: &[u32],
    deadline: Instant,
) -> Vec<u32> {
    loop {
        let alive: Vec<u32> = descendants
            .iter()
            .copied()
            .filter(|&pid| control.is_alive(pid))
            .collect();
        if alive.is_empty() || Instant::now() >= deadline {
            return alive;
        }
        tokio::time::sleep(DESCENDANT_POLL).await;
    }
}

async fn announce(sink: &dyn LogSink, report: &HandleReport) {
    for error in &report.errors {
        sink.emit(LogRecord::component(
            SHUTDOWN_TAG,
            Severity::Error,
            error.to_string(),
        ))
        .await;
    }

    let (severity, text) = match report.path {
        ShutdownPath::Graceful => (Severity::Info, format!("{} stopped", report.name)),
        ShutdownPath::Forced => (
            Severity::Warning,
            format!("{} force killed after grace period", report.name),
        ),
        ShutdownPath::AlreadyExited => (
            Severity::Info,
            format!("{} had already exited", report.name),
        ),
        ShutdownPath::AlreadyTerminated => return,
    };
    sink.emit(LogRecord::component(SHUTDOWN_TAG, severity, text))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::MemorySink;
    use crate::process::{CommandSpec, ExitOutcome, ProcessState};
    use std::collections::{HashMap, HashSet};
    use std::io;
    use std::sync::Mutex;
    use tokio::sync::watch;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        List(u32),
        Term(u32),
        Kill(u32),
    }

    /// In-memory process table recording every call
    #[derive(Default)]
    struct FakeControl {
        tree: HashMap<u32, Vec<u32>>,
        exits: Mutex<HashMap<u32, watch::Sender<Option<ExitOutcome>>>>,
        alive: Mutex<HashSet<u32>>,
        ignores_term: HashSet<u32>,
        refuses_kill: HashSet<u32>,
        calls: Mutex<Vec<Call>>,
    }

    impl FakeControl {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn signal_calls(&self) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|c| !matches!(c, Call::List(_)))
                .collect()
        }

        fn spawn(&self, name: &str, pid: u32) -> Arc<ProcessHandle> {
            let (tx, rx) = watch::channel(None);
            self.exits.lock().unwrap().insert(pid, tx);
            self.alive.lock().unwrap().insert(pid);
            for kids in self.tree.get(&pid).into_iter().flatten() {
                self.alive.lock().unwrap().insert(*kids);
            }
            Arc::new(ProcessHandle::running(
                name,
                CommandSpec::new("/bin/fake"),
                pid,
                rx,
            ))
        }

        fn exit(&self, pid: u32, outcome: ExitOutcome) {
            self.alive.lock().unwrap().remove(&pid);
            if let Some(tx) = self.exits.lock().unwrap().get(&pid) {
                let _ = tx.send(Some(outcome));
            }
        }

        fn descendants(&self, pid: u32) -> Vec<u32> {
            let mut found = Vec::new();
            let mut queue = vec![pid];
            while let Some(p) = queue.pop() {
                for &kid in self.tree.get(&p).into_iter().flatten() {
                    found.push(kid);
                    queue.push(kid);
                }
            }
            found
        }
    }

    impl ProcessControl for FakeControl {
        fn list_descendants(&self, pid: u32) -> Vec<u32> {
            self.calls.lock().unwrap().push(Call::List(pid));
            let alive = self.alive.lock().unwrap();
            self.descendants(pid)
                .into_iter()
                .filter(|p| alive.contains(p))
                .collect()
        }

        fn terminate(&self, pid: u32) -> io::Result<()> {
            self.calls.lock().unwrap().push(Call::Term(pid));
            if !self.alive.lock().unwrap().contains(&pid) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such process"));
            }
            if !self.ignores_term.contains(&pid) {
                self.exit(pid, ExitOutcome::from_signal(15));
            }
            Ok(())
        }

        fn kill(&self, pid: u32) -> io::Result<()> {
            self.calls.lock().unwrap().push(Call::Kill(pid));
            if self.refuses_kill.contains(&pid) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "not permitted"));
            }
            self.exit(pid, ExitOutcome::from_signal(9));
            Ok(())
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }
    }

    fn coordinator(control: Arc<FakeControl>, sink: Arc<MemorySink>) -> ShutdownCoordinator {
        ShutdownCoordinator::new(control, sink)
            .with_grace_period(Duration::from_millis(200))
            .with_drain_timeout(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_graceful_shutdown_marks_terminated() {
        let control = Arc::new(FakeControl::default());
        let sink = Arc::new(MemorySink::new());
        let router = LogRouter::new(sink.clone());
        let a = control.spawn("A", 100);
        let b = control.spawn("B", 200);

        let report = coordinator(control.clone(), sink.clone())
            .shutdown_all(&[a.clone(), b.clone()], &router)
            .await;

        assert_eq!(a.state(), ProcessState::Terminated);
        assert_eq!(b.state(), ProcessState::Terminated);
        assert_eq!(report.get("A").unwrap().path, ShutdownPath::Graceful);
        assert_eq!(report.get("B").unwrap().path, ShutdownPath::Graceful);
        assert!(report.is_clean());
        assert_eq!(report.handles[0].name, "A");
        assert_eq!(sink.from_source(SHUTDOWN_TAG).len(), 2);
    }

    #[tokio::test]
    async fn test_descendants_signaled_before_parent() {
        let control = Arc::new(FakeControl {
            tree: HashMap::from([(100, vec![101]), (101, vec![102])]),
            ..Default::default()
        });
        let sink = Arc::new(MemorySink::new());
        let router = LogRouter::new(sink.clone());
        let a = control.spawn("A", 100);
        control.alive.lock().unwrap().insert(102);

        let report = coordinator(control.clone(), sink)
            .shutdown_all(&[a], &router)
            .await;

        assert_eq!(
            control.signal_calls(),
            vec![Call::Term(102), Call::Term(101), Call::Term(100)]
        );
        assert_eq!(report.get("A").unwrap().descendants, vec![101, 102]);
        assert!(!control.is_alive(101));
        assert!(!control.is_alive(102));
    }

    #[tokio::test]
    async fn test_stubborn_process_is_force_killed() {
        let control = Arc::new(FakeControl {
            ignores_term: HashSet::from([100]),
            ..Default::default()
        });
        let sink = Arc::new(MemorySink::new());
        let router = LogRouter::new(sink.clone());
        let a = control.spawn("A", 100);

        let report = coordinator(control.clone(), sink.clone())
            .shutdown_all(&[a.clone()], &router)
            .await;

        assert_eq!(report.get("A").unwrap().path, ShutdownPath::Forced);
        assert_eq!(control.signal_calls(), vec![Call::Term(100), Call::Kill(100)]);
        assert_eq!(a.state(), ProcessState::Terminated);
        assert!(sink
            .from_source(SHUTDOWN_TAG)
            .iter()
            .any(|r| r.severity == Severity::Warning && r.text.contains("force killed")));
    }

    #[tokio::test]
    async fn test_stubborn_descendant_is_force_killed() {
        let control = Arc::new(FakeControl {
            tree: HashMap::from([(100, vec![101])]),
            ignores_term: HashSet::from([101]),
            ..Default::default()
        });
        let sink = Arc::new(MemorySink::new());
        let router = LogRouter::new(sink.clone());
        let a = control.spawn("A", 100);

        let report = coordinator(control.clone(), sink)
            .shutdown_all(&[a], &router)
            .await;

        assert_eq!(report.get("A").unwrap().path, ShutdownPath::Graceful);
        assert_eq!(
            control.signal_calls(),
            vec![Call::Term(101), Call::Term(100), Call::Kill(101)]
        );
        assert!(!control.is_alive(101));
    }

    #[tokio::test]
    async fn test_failed_kill_is_reported_and_does_not_block_others() {
        let control = Arc::new(FakeControl {
            ignores_term: HashSet::from([100]),
            refuses_kill: HashSet::from([100]),
            ..Default::default()
        });
        let sink = Arc::new(MemorySink::new());
        let router = LogRouter::new(sink.clone());
        let a = control.spawn("A", 100);
        let b = control.spawn("B", 200);

        let report = coordinator(control.clone(), sink.clone())
            .shutdown_all(&[a.clone(), b.clone()], &router)
            .await;

        let a_report = report.get("A").unwrap();
        assert_eq!(a_report.path, ShutdownPath::Forced);
        assert_eq!(a_report.errors.len(), 1);
        assert!(matches!(
            a_report.errors[0],
            StagehandError::Signal { ref name, pid: 100, .. } if name == "A"
        ));
        assert_eq!(a.state(), ProcessState::Terminated);

        assert_eq!(report.get("B").unwrap().path, ShutdownPath::Graceful);
        assert_eq!(b.state(), ProcessState::Terminated);
        assert!(!report.is_clean());
        assert!(sink
            .from_source(SHUTDOWN_TAG)
            .iter()
            .any(|r| r.severity == Severity::Error && r.text.contains("not permitted")));
    }

    #[tokio::test]
    async fn test_second_shutdown_sends_no_signals() {
        let control = Arc::new(FakeControl::default());
        let sink = Arc::new(MemorySink::new());
        let router = LogRouter::new(sink.clone());
        let a = control.spawn("A", 100);
        let coordinator = coordinator(control.clone(), sink);

        coordinator.shutdown_all(&[a.clone()], &router).await;
        let calls_after_first = control.calls().len();

        let report = coordinator.shutdown_all(&[a.clone()], &router).await;
        assert_eq!(control.calls().len(), calls_after_first);
        assert_eq!(report.get("A").unwrap().path, ShutdownPath::AlreadyTerminated);
        assert!(report.is_clean());
        assert_eq!(a.state(), ProcessState::Terminated);
    }

    #[tokio::test]
    async fn test_exited_process_only_descendants_signaled() {
        let control = Arc::new(FakeControl {
            tree: HashMap::from([(100, vec![101])]),
            ..Default::default()
        });
        let sink = Arc::new(MemorySink::new());
        let router = LogRouter::new(sink.clone());
        let a = control.spawn("A", 100);
        control.exit(100, ExitOutcome::from_code(1));
        a.mark_exited(&ExitOutcome::from_code(1));

        let report = coordinator(control.clone(), sink)
            .shutdown_all(&[a.clone()], &router)
            .await;

        assert_eq!(report.get("A").unwrap().path, ShutdownPath::AlreadyExited);
        assert_eq!(control.signal_calls(), vec![Call::Term(101)]);
        assert_eq!(a.state(), ProcessState::Terminated);
    }

    #[tokio::test]
    async fn test_not_started_handle_is_noop() {
        let control = Arc::new(FakeControl::default());
        let sink = Arc::new(MemorySink::new());
        let router = LogRouter::new(sink.clone());
        let idle = Arc::new(ProcessHandle::not_started(
            "idle",
            CommandSpec::new("/bin/fake"),
        ));

        let report = coordinator(control.clone(), sink)
            .shutdown_all(&[idle.clone()], &router)
            .await;

        assert!(control.calls().is_empty());
        assert_eq!(idle.state(), ProcessState::Terminated);
        assert_eq!(report.get("idle").unwrap().path, ShutdownPath::AlreadyTerminated);
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let control = Arc::new(FakeControl::default());
        let sink = Arc::new(MemorySink::new());
        let router = LogRouter::new(sink.clone());

        let report = coordinator(control, sink).shutdown_all(&[], &router).await;
        assert!(report.handles.is_empty());
        assert_eq!(report.drain, DrainOutcome::default());
    }

    #[tokio::test]
    async fn test_handles_shut_down_concurrently() {
        let stubborn: HashSet<u32> = (1..=4).map(|i| i * 100).collect();
        let control = Arc::new(FakeControl {
            ignores_term: stubborn,
            ..Default::default()
        });
        let sink = Arc::new(MemorySink::new());
        let router = LogRouter::new(sink.clone());
        let handles: Vec<_> = (1..=4)
            .map(|i| control.spawn(&format!("H{}", i), i * 100))
            .collect();

        let started = std::time::Instant::now();
        let report = coordinator(control, sink)
            .shutdown_all(&handles, &router)
            .await;

        // Four sequential grace periods would take at least 800ms
        assert!(started.elapsed() < Duration::from_millis(700));
        assert!(report
            .handles
            .iter()
            .all(|h| h.path == ShutdownPath::Forced));
    }
}
