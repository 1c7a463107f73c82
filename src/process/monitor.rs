use crate::process::{ExitOutcome, ProcessHandle, ProcessState};
use std::sync::Arc;
use std::time::Duration;

/// Default interval between liveness polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Result of one liveness poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// A handle still marked `Running` whose process has exited on its own
    Unhealthy { name: String, exit: ExitOutcome },
}

/// Detects processes that exited while the registry still marks them running.
///
/// Read-only: it never changes handle state, the supervisor does that.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Check every `Running` handle without blocking.
    ///
    /// Handles in any other state are skipped, which is how handles being shut
    /// down are excluded. Returns the first exited handle in snapshot
    /// (launch) order.
    pub fn poll_once(&self, handles: &[Arc<ProcessHandle>]) -> Health {
        handles
            .iter()
            .filter(|handle| handle.state() == ProcessState::Running)
            .find_map(|handle| {
                handle.exit_outcome().map(|exit| Health::Unhealthy {
                    name: handle.name().to_string(),
                    exit,
                })
            })
            .unwrap_or(Health::Healthy)
    }
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandSpec;
    use tokio::sync::watch;

    type ExitSender = watch::Sender<Option<ExitOutcome>>;

    fn running(name: &str, pid: u32) -> (Arc<ProcessHandle>, ExitSender) {
        let (tx, rx) = watch::channel(None);
        let handle = ProcessHandle::running(name, CommandSpec::new("/bin/true"), pid, rx);
        (Arc::new(handle), tx)
    }

    #[test]
    fn test_all_running_is_healthy() {
        let monitor = LivenessMonitor::default();
        let (a, _ta) = running("A", 10);
        let (b, _tb) = running("B", 11);

        assert_eq!(monitor.poll_once(&[a, b]), Health::Healthy);
        assert_eq!(monitor.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_empty_registry_is_healthy() {
        assert_eq!(LivenessMonitor::default().poll_once(&[]), Health::Healthy);
    }

    #[test]
    fn test_reports_first_exited_in_order() {
        let monitor = LivenessMonitor::default();
        let (a, _ta) = running("A", 10);
        let (b, tb) = running("B", 11);
        let (c, tc) = running("C", 12);

        tc.send(Some(ExitOutcome::from_code(0))).unwrap();
        tb.send(Some(ExitOutcome::from_signal(9))).unwrap();

        assert_eq!(
            monitor.poll_once(&[a, b, c]),
            Health::Unhealthy {
                name: "B".to_string(),
                exit: ExitOutcome::from_signal(9),
            }
        );
    }

    #[test]
    fn test_clean_exit_is_still_unexpected() {
        let monitor = LivenessMonitor::default();
        let (a, ta) = running("A", 10);
        ta.send(Some(ExitOutcome::from_code(0))).unwrap();

        assert!(matches!(monitor.poll_once(&[a]), Health::Unhealthy { .. }));
    }

    #[test]
    fn test_terminating_handles_are_skipped() {
        let monitor = LivenessMonitor::default();
        let (a, ta) = running("A", 10);
        a.begin_termination();
        ta.send(Some(ExitOutcome::from_signal(15))).unwrap();

        assert_eq!(monitor.poll_once(&[a]), Health::Healthy);
    }

    #[test]
    fn test_poll_does_not_change_state() {
        let monitor = LivenessMonitor::default();
        let (a, ta) = running("A", 10);
        ta.send(Some(ExitOutcome::from_code(1))).unwrap();

        let _ = monitor.poll_once(&[Arc::clone(&a)]);
        assert_eq!(a.state(), ProcessState::Running);
    }
}
