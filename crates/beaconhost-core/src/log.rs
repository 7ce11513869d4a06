use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::event::{now_unix_ms, Event, EventRecord};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to open event log {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to append to event log {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to read event log {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to encode event record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("malformed record at {path}:{line}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
}

/// Append-only newline-delimited JSON event log.
///
/// Every call to [`EventLog::record`] opens the file, appends one line, syncs
/// and closes it, so no handle outlives a single append and external rotation
/// is picked up on the next write. Lines are written with one `write_all` on an
/// `O_APPEND` handle; concurrent appenders never split a record.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    echo: bool,
    last_ts: AtomicU64,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            echo: true,
            last_ts: AtomicU64::new(0),
        }
    }

    /// Disables mirroring of each record to stdout.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stamps `event` with the host clock and appends it durably. The line is
    /// echoed to stdout only after it is on disk.
    pub fn record(&self, event: Event) -> Result<EventRecord, LogError> {
        if self.echo {
            self.record_echoed(event, &mut io::stdout().lock())
        } else {
            self.record_echoed(event, &mut io::sink())
        }
    }

    fn record_echoed(&self, event: Event, echo: &mut dyn Write) -> Result<EventRecord, LogError> {
        let record = EventRecord {
            ts: self.next_timestamp(),
            event,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        self.append_line(line.as_bytes())?;

        let _ = echo.write_all(line.as_bytes());
        let _ = echo.flush();
        Ok(record)
    }

    // The wall clock may step backwards; records must not.
    fn next_timestamp(&self) -> u64 {
        let now = now_unix_ms();
        let previous = self.last_ts.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }

    fn append_line(&self, line: &[u8]) -> Result<(), LogError> {
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| LogError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| LogError::Open {
                path: self.path.clone(),
                source,
            })?;

        file.write_all(line)
            .and_then(|()| file.sync_data())
            .map_err(|source| LogError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

/// Reads every record from a JSONL event log, skipping blank lines.
pub fn read_events(path: &Path) -> Result<Vec<EventRecord>, LogError> {
    let file = fs::File::open(path).map_err(|source| LogError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| LogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| LogError::Parse {
            path: path.to_path_buf(),
            line: index + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}
