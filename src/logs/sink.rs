use crate::error::{Result, StagehandError};
use crate::logs::{LogRecord, Severity};
use async_trait::async_trait;
use chrono::Local;
use colored::Colorize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use tokio::fs::File as TokioFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Default maximum log file size before rotation (10MB)
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Destination for log records.
///
/// Shared by every reader task; implementations must write each record as
/// a unit even under concurrent calls.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn emit(&self, record: LogRecord);
}

/// Options for a [`FileSink`]
#[derive(Debug, Clone)]
pub struct FileSinkOptions {
    /// Echo every record to stdout as well
    pub console: bool,
    /// Color the severity on the console echo
    pub color: bool,
    /// Maximum size in bytes before rotation
    pub max_size: u64,
}

impl Default for FileSinkOptions {
    fn default() -> Self {
        Self {
            console: true,
            color: true,
            max_size: DEFAULT_MAX_LOG_SIZE,
        }
    }
}

struct FileState {
    file: TokioFile,
    size: u64,
}

/// Appends rendered records to a log file, rotating it by size, with an
/// optional console echo.
pub struct FileSink {
    path: PathBuf,
    options: FileSinkOptions,
    state: Mutex<FileState>,
}

impl FileSink {
    /// Open (or create) the log file in append mode
    ///
    /// # Arguments
    /// * `path` - Log file path; parent directories are created
    /// * `options` - Console echo and rotation settings
    pub async fn open<P: AsRef<Path>>(path: P, options: FileSinkOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StagehandError::LogFile(format!("Failed to create log directory: {}", e))
            })?;
        }

        let (file, size) = open_append(&path)?;

        Ok(Self {
            path,
            options,
            state: Mutex::new(FileState { file, size }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the active log file
    pub async fn size(&self) -> u64 {
        self.state.lock().await.size
    }

    async fn write_record(&self, state: &mut FileState, line: &str) -> Result<()> {
        if state.size >= self.options.max_size {
            rotate(&self.path).await?;
            let (file, size) = open_append(&self.path)?;
            state.file = file;
            state.size = size;
        }

        let mut entry = Vec::with_capacity(line.len() + 1);
        entry.extend_from_slice(line.as_bytes());
        entry.push(b'\n');

        state.file.write_all(&entry).await?;
        state.file.flush().await?;
        state.size += entry.len() as u64;

        Ok(())
    }

    fn echo(&self, record: &LogRecord) {
        if !self.options.color {
            println!("{}", record.render());
            return;
        }

        let severity = match record.severity {
            Severity::Info => record.severity.to_string().green(),
            Severity::Warning => record.severity.to_string().yellow(),
            Severity::Error => record.severity.to_string().red().bold(),
        };
        println!(
            "{} - {} - {}: {}",
            record.observed_at.format(crate::logs::TIMESTAMP_FORMAT),
            severity,
            record.source.cyan(),
            record.text
        );
    }
}

#[async_trait]
impl LogSink for FileSink {
    async fn emit(&self, record: LogRecord) {
        let line = record.render();
        let mut state = self.state.lock().await;

        if let Err(e) = self.write_record(&mut state, &line).await {
            tracing::warn!("Failed to write log record to {}: {}", self.path.display(), e);
        }

        // Echo while holding the lock so console order matches file order
        if self.options.console {
            self.echo(&record);
        }
    }
}

fn open_append(path: &Path) -> Result<(TokioFile, u64)> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            StagehandError::LogFile(format!("Failed to open {}: {}", path.display(), e))
        })?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((TokioFile::from_std(file), size))
}

/// Rename the active file with a timestamp suffix
async fn rotate(path: &Path) -> Result<()> {
    let timestamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let rotated = rotated_path(path, &timestamp)?;
    tokio::fs::rename(path, &rotated)
        .await
        .map_err(|e| StagehandError::LogRotation(format!("Failed to rotate log: {}", e)))?;

    Ok(())
}

/// `<stem>-<timestamp>.<ext>`, with `-N` appended when that name is taken
fn rotated_path(path: &Path, timestamp: &str) -> Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| StagehandError::LogRotation("Invalid log file path".to_string()))?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| StagehandError::LogRotation("Invalid log file name".to_string()))?;
    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("log");

    let mut rotated = parent.join(format!("{}-{}.{}", stem, timestamp, extension));
    let mut attempt = 1;
    while rotated.exists() {
        rotated = parent.join(format!("{}-{}-{}.{}", stem, timestamp, attempt, extension));
        attempt += 1;
    }

    Ok(rotated)
}

/// Keeps records in memory; used by tests and embedders that route records
/// elsewhere themselves.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: StdMutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Records whose source is `source`, in arrival order
    pub fn from_source(&self, source: &str) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.source == source)
            .collect()
    }
}

#[async_trait]
impl LogSink for MemorySink {
    async fn emit(&self, record: LogRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }
}
