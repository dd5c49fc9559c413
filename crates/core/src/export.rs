//! Human-readable `key,value` mirror of the events emitted this session.

use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
    time::SystemTime,
};

use tracing::debug;

use crate::{
    error::{Result, TelemetryError},
    record::{EventRecord, Session, unix_millis},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub key: String,
    pub value: String,
}

impl LogLine {
    pub fn from_record(record: &EventRecord) -> Self {
        Self {
            key: format!("{}:{}", record.category, record.key),
            value: record
                .headline()
                .map(ToString::to_string)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct EventLog {
    lines: Mutex<Vec<LogLine>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: &EventRecord) {
        self.lines
            .lock()
            .expect("EventLog poisoned")
            .push(LogLine::from_record(record));
    }

    pub fn len(&self) -> usize {
        self.lines.lock().expect("EventLog poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// CSV text with a `key,value` header, or `None` when nothing was logged.
    pub fn to_csv(&self) -> Option<String> {
        let lines = self.lines.lock().expect("EventLog poisoned");
        if lines.is_empty() {
            return None;
        }
        Some(render(&lines))
    }

    /// Write the log to a fresh file in `dir` and clear it.
    ///
    /// Returns `Ok(None)` when the log is empty. The log is kept if the write
    /// fails.
    pub fn export(&self, dir: &Path, session: &Session) -> Result<Option<PathBuf>> {
        let mut lines = self.lines.lock().expect("EventLog poisoned");
        if lines.is_empty() {
            return Ok(None);
        }

        std::fs::create_dir_all(dir)?;
        let path = dir.join(export_file_name(session));
        write_csv_file(&path, &render(&lines))?;

        debug!(path = %path.display(), lines = lines.len(), "Exported event log");
        lines.clear();
        Ok(Some(path))
    }
}

pub fn export_file_name(session: &Session) -> String {
    let unix_secs = unix_millis(SystemTime::now()) / 1000;
    format!(
        "telespool_{unix_secs}_{}.csv",
        session.offset().as_secs()
    )
}

/// Create `path` and write `content`; an existing file is never touched.
pub fn write_csv_file(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => TelemetryError::ExportExists(path.to_path_buf()),
            _ => TelemetryError::Io(e),
        })?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn render(lines: &[LogLine]) -> String {
    let mut out = String::from("key,value\n");
    for line in lines {
        out.push_str(&quote(&line.key));
        out.push(',');
        out.push_str(&quote(&line.value));
        out.push('\n');
    }
    out
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
