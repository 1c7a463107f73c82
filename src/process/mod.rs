// Process module - Stage launch, liveness and shutdown

pub mod control;
pub mod monitor;
mod registry;
pub mod shutdown;
pub mod spawner;
pub mod supervisor;
mod types;

pub use control::{ProcessControl, SystemControl};
pub use monitor::{Health, LivenessMonitor};
pub use registry::Registry;
pub use shutdown::{HandleReport, ShutdownCoordinator, ShutdownPath, ShutdownReport};
pub use spawner::{launch, Launched, OutputStreams};
pub use supervisor::{RunOutcome, RunReport, Startup, Supervisor, Timings};
pub use types::{CommandSpec, ExitOutcome, ProcessHandle, ProcessState, StageSpec};
