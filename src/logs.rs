//! Log aggregation for managed service output.
use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Read, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, warn};

/// Number of lines returned by `get_logs` when no limit is given.
pub const DEFAULT_LOG_LIMIT: usize = 500;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One captured line of service output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub service: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub stream: LogStream,
}

/// Bounded ring of log lines shared by every reader thread.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<LogLine>>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a line, evicting the oldest entries beyond capacity.
    pub fn push(&self, line: LogLine) {
        let mut lines = self
            .lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn append(&self, service: &str, stream: LogStream, message: impl Into<String>) {
        self.push(LogLine {
            service: service.to_string(),
            timestamp: Utc::now(),
            message: message.into(),
            stream,
        });
    }

    /// Most recent `limit` lines, newest last, optionally for one service.
    pub fn get(&self, service: Option<&str>, limit: usize) -> Vec<LogLine> {
        let lines = self
            .lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut selected: Vec<LogLine> = lines
            .iter()
            .rev()
            .filter(|line| service.is_none_or(|id| line.service == id))
            .take(limit)
            .cloned()
            .collect();
        selected.reverse();
        selected
    }

    pub fn clear(&self) {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn open_log_file(path: &PathBuf) -> Option<File> {
    if let Some(parent) = path.parent()
        && let Err(err) = fs::create_dir_all(parent)
    {
        warn!("Unable to create log directory {}: {err}", parent.display());
        return None;
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            warn!("Unable to open log file {}: {err}", path.display());
            None
        }
    }
}

/// Spawns a thread that reads `reader` line by line into `buffer`.
///
/// Invalid UTF-8 is decoded lossily. When `log_file` is set every line is
/// also appended there. The thread ends when the stream closes.
pub fn spawn_log_reader<R>(
    service: &str,
    stream: LogStream,
    reader: R,
    buffer: LogBuffer,
    log_file: Option<PathBuf>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    let service = service.to_string();
    thread::spawn(move || {
        let mut file = log_file.as_ref().and_then(open_log_file);
        let mut reader = BufReader::new(reader);
        let mut raw = Vec::new();

        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw) {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(raw.last(), Some(b'\n' | b'\r')) {
                        raw.pop();
                    }
                    let message = String::from_utf8_lossy(&raw).into_owned();

                    if let Some(handle) = file.as_mut()
                        && let Err(err) = writeln!(handle, "{message}")
                    {
                        warn!("Dropping persistent log for '{service}': {err}");
                        file = None;
                    }
                    buffer.append(&service, stream, message);
                }
                Err(err) => {
                    debug!("Log reader for '{service}' {stream} stopped: {err}");
                    break;
                }
            }
        }
    })
}
