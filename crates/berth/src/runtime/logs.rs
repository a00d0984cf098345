//! JSON container logs, one object per line.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use berth_common::BerthResult;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::exec::StreamKind;

/// One log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Raw line, including its trailing newline when it had one.
    pub log: String,
    /// `stdout` or `stderr`.
    pub stream: String,
    /// When the line was captured.
    pub time: DateTime<Utc>,
}

/// Appends log records to a container's log file. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JsonLogWriter {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl JsonLogWriter {
    /// Open (or create) the log at `path` in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> BerthResult<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Log file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line captured from `stream`. Failures are logged, not returned,
    /// so a full disk never stalls the container's output.
    pub fn append(&self, stream: StreamKind, line: &[u8]) {
        let entry = LogEntry {
            log: String::from_utf8_lossy(line).into_owned(),
            stream: stream.as_str().to_string(),
            time: Utc::now(),
        };

        let result = serde_json::to_vec(&entry).map_err(std::io::Error::other).and_then(|mut json| {
            json.push(b'\n');
            self.file.lock().write_all(&json)
        });

        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write log line");
        }
    }
}

/// Read every record of the log at `path`. A missing log reads as empty.
///
/// # Errors
///
/// Returns an error on read failures or malformed lines.
pub fn read_log(path: &Path) -> BerthResult<Vec<LogEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lines_have_the_documented_shape() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("c-json.log");
        let writer = JsonLogWriter::open(&path).unwrap();

        writer.append(StreamKind::Stdout, b"hello\n");
        writer.append(StreamKind::Stderr, b"oops");

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with(r#"{"log":"hello\n","stream":"stdout""#));

        let entries = read_log(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].log, "oops");
        assert_eq!(entries[1].stream, "stderr");
    }

    #[test]
    fn missing_log_is_empty() {
        let temp = tempdir().unwrap();
        assert!(read_log(&temp.path().join("none.log")).unwrap().is_empty());
    }
}
