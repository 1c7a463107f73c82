use crate::error::StagehandError;
use crate::logs::{Classifier, LogRecord, LogSink, Severity, StreamKind, ROUTER_TAG};
use crate::process::OutputStreams;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;

/// How many reader tasks finished draining within the bounded wait
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    pub finished: usize,
    pub abandoned: usize,
}

/// Reads every child's stdout and stderr line by line, classifies each line
/// and forwards it to the shared sink.
///
/// Each attached stream gets its own task. Tasks are kept so shutdown can
/// wait for them to drain instead of orphaning them.
pub struct LogRouter {
    sink: Arc<dyn LogSink>,
    classifier: Arc<Classifier>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl LogRouter {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self::with_classifier(sink, Classifier::standard())
    }

    pub fn with_classifier(sink: Arc<dyn LogSink>, classifier: Classifier) -> Self {
        Self {
            sink,
            classifier: Arc::new(classifier),
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Start one reader task per stream for the process named `name`
    pub fn attach(&self, name: &str, streams: OutputStreams) {
        let stdout = self.spawn_reader(name, StreamKind::Stdout, streams.stdout);
        let stderr = self.spawn_reader(name, StreamKind::Stderr, streams.stderr);

        let mut readers = self.readers.lock().unwrap_or_else(|p| p.into_inner());
        readers.push(stdout);
        readers.push(stderr);
    }

    /// Start a reader task for an arbitrary stream
    pub fn spawn_reader<R>(&self, name: &str, stream: StreamKind, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(read_stream(
            name.to_string(),
            stream,
            reader,
            Arc::clone(&self.classifier),
            Arc::clone(&self.sink),
        ))
    }

    /// Number of reader tasks not yet collected by [`LogRouter::drain`]
    pub fn pending(&self) -> usize {
        self.readers.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Wait up to `timeout` overall for all reader tasks to finish.
    ///
    /// Tasks still running at the deadline are detached, not aborted: a
    /// pending pipe read cannot be preempted reliably.
    pub async fn drain(&self, timeout: Duration) -> DrainOutcome {
        let readers: Vec<JoinHandle<()>> = {
            let mut guard = self.readers.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let mut outcome = DrainOutcome::default();

        for reader in readers {
            match tokio::time::timeout_at(deadline, reader).await {
                Ok(_) => outcome.finished += 1,
                Err(_) => outcome.abandoned += 1,
            }
        }

        debug!(
            "Log readers drained: {} finished, {} abandoned",
            outcome.finished, outcome.abandoned
        );
        outcome
    }
}

async fn read_stream<R>(
    name: String,
    stream: StreamKind,
    reader: R,
    classifier: Arc<Classifier>,
    sink: Arc<dyn LogSink>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let severity = classifier.classify(stream, &line);
                sink.emit(LogRecord::from_child(&name, stream, severity, line.trim()))
                    .await;
            }
            Err(e) => {
                let error = StagehandError::StreamRead {
                    name: name.clone(),
                    stream,
                    cause: e.to_string(),
                };
                sink.emit(LogRecord::component(ROUTER_TAG, Severity::Error, error.to_string()))
                    .await;
                break;
            }
        }
    }

    debug!("{} {} reached end of stream", name, stream);
}
