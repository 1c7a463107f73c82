// Logs module - Child output routing and the record sink

mod classify;
mod record;
mod router;
mod sink;

pub use classify::{Classifier, Pattern, Rule};
pub use record::{
    LogRecord, Severity, StreamKind, ROUTER_TAG, SHUTDOWN_TAG, SUPERVISOR_TAG, TIMESTAMP_FORMAT,
};
pub use router::{DrainOutcome, LogRouter};
pub use sink::{FileSink, FileSinkOptions, LogSink, MemorySink, DEFAULT_MAX_LOG_SIZE};
