use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Mutex, MutexGuard};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

/// OS-facing operations the shutdown sequence needs.
///
/// Kept behind a trait so the termination algorithm can run against a fake
/// without spawning real processes.
pub trait ProcessControl: Send + Sync {
    /// All live descendants of `pid`, recursively, nearest generation first.
    /// `pid` itself is not included.
    fn list_descendants(&self, pid: u32) -> Vec<u32>;

    /// Ask the process to exit (SIGTERM on unix)
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Force the process to exit (SIGKILL on unix)
    fn kill(&self, pid: u32) -> io::Result<()>;

    /// Whether `pid` names a live, non-zombie process
    fn is_alive(&self, pid: u32) -> bool;
}

/// Real implementation: process table from sysinfo, signals via nix on unix
pub struct SystemControl {
    system: Mutex<System>,
}

impl SystemControl {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SystemControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessControl for SystemControl {
    fn list_descendants(&self, pid: u32) -> Vec<u32> {
        let mut system = self.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new(),
        );

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (child_pid, process) in system.processes() {
            // Threads show up as tasks on Linux; only real processes count
            if process.thread_kind().is_some()
                || matches!(process.status(), ProcessStatus::Zombie)
            {
                continue;
            }
            if let Some(parent) = process.parent() {
                children
                    .entry(parent.as_u32())
                    .or_default()
                    .push(child_pid.as_u32());
            }
        }

        collect_descendants(pid, &children)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        #[cfg(unix)]
        {
            send_signal(pid, nix::sys::signal::Signal::SIGTERM)
        }
        #[cfg(not(unix))]
        {
            self.kill(pid)
        }
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        #[cfg(unix)]
        {
            send_signal(pid, nix::sys::signal::Signal::SIGKILL)
        }
        #[cfg(not(unix))]
        {
            let mut system = self.lock();
            let sys_pid = Pid::from_u32(pid);
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[sys_pid]),
                true,
                ProcessRefreshKind::new(),
            );
            match system.process(sys_pid) {
                Some(process) if process.kill() => Ok(()),
                Some(_) => Err(io::Error::new(io::ErrorKind::Other, "kill refused")),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "no such process")),
            }
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut system = self.lock();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new(),
        );
        system
            .process(sys_pid)
            .map(|p| !matches!(p.status(), ProcessStatus::Zombie))
            .unwrap_or(false)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> io::Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), signal).map_err(io::Error::from)
}

/// Breadth-first walk of a parent → children table
fn collect_descendants(root: u32, children: &HashMap<u32, Vec<u32>>) -> Vec<u32> {
    let mut found = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);

    while let Some(parent) = queue.pop_front() {
        if let Some(kids) = children.get(&parent) {
            for &kid in kids {
                if seen.insert(kid) {
                    found.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }

    found
}
