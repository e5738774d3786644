//! File sinks for the event bus.
//!
//! Two rotating text logs (`deploy.log` with everything, `<host>.log` per
//! host) plus a per-host `events.jsonl` under the run directory for
//! machine-readable replay. Sink write errors are logged and swallowed; a
//! full disk must not take down a deployment in flight.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::warn;

use super::{Event, EventSink};

/// Rotation threshold for the text logs.
const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Rotated backups kept per log file (`.1` newest, `.5` oldest).
const MAX_LOG_BACKUPS: usize = 5;

// ============================================================================
// Rolling file
// ============================================================================

/// Append-only log file with size-based rotation.
struct RollingFile {
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl RollingFile {
    fn open(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            written,
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if self.written + line.len() as u64 + 1 > MAX_LOG_BYTES {
            self.rotate()?;
        }
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.written += line.len() as u64 + 1;
        Ok(())
    }

    /// Shifts `.N` backups up and reopens a fresh file.
    fn rotate(&mut self) -> std::io::Result<()> {
        self.writer.flush()?;
        let oldest = backup_path(&self.path, MAX_LOG_BACKUPS);
        let _ = std::fs::remove_file(&oldest);
        for n in (1..MAX_LOG_BACKUPS).rev() {
            let from = backup_path(&self.path, n);
            if from.exists() {
                std::fs::rename(&from, backup_path(&self.path, n + 1))?;
            }
        }
        std::fs::rename(&self.path, backup_path(&self.path, 1))?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.written = 0;
        Ok(())
    }

    fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

fn timestamped(event: &Event) -> String {
    format!(
        "[{}] {}",
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        event.summary()
    )
}

// ============================================================================
// Main log sink
// ============================================================================

/// Writes every event as a human-readable line to a rotating `deploy.log`.
pub struct MainLogSink {
    file: Mutex<RollingFile>,
}

impl MainLogSink {
    pub fn new(log_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = RollingFile::open(log_dir.as_ref().join("deploy.log"))?;
        Ok(Self { file: Mutex::new(file) })
    }
}

impl EventSink for MainLogSink {
    fn write(&self, event: &Event) {
        let mut file = self.file.lock();
        if let Err(e) = file.write_line(&timestamped(event)) {
            warn!(error = %e, "failed to write deploy.log");
        }
    }

    fn flush(&self) {
        self.file.lock().flush();
    }
}

// ============================================================================
// Per-host log sink
// ============================================================================

/// Routes each host-scoped event into a rotating `<host>.log`.
pub struct HostLogSink {
    log_dir: PathBuf,
    files: Mutex<HashMap<String, RollingFile>>,
}

impl HostLogSink {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            files: Mutex::new(HashMap::new()),
        }
    }
}

impl EventSink for HostLogSink {
    fn write(&self, event: &Event) {
        let Some(host) = event.host() else { return };
        let mut files = self.files.lock();
        if !files.contains_key(host) {
            match RollingFile::open(self.log_dir.join(format!("{host}.log"))) {
                Ok(file) => {
                    files.insert(host.to_string(), file);
                }
                Err(e) => {
                    warn!(host, error = %e, "failed to open host log");
                    return;
                }
            }
        }
        if let Some(file) = files.get_mut(host) {
            if let Err(e) = file.write_line(&timestamped(event)) {
                warn!(host, error = %e, "failed to write host log");
            }
        }
    }

    fn flush(&self) {
        for file in self.files.lock().values_mut() {
            file.flush();
        }
    }
}

// ============================================================================
// JSONL sink
// ============================================================================

/// Persists each host's events as one JSON object per line under
/// `run/<timestamp>/<host>/events.jsonl`, giving a replayable record.
pub struct JsonlSink {
    run_dir: PathBuf,
    files: Mutex<HashMap<String, BufWriter<File>>>,
}

impl JsonlSink {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            files: Mutex::new(HashMap::new()),
        }
    }
}

impl EventSink for JsonlSink {
    fn write(&self, event: &Event) {
        let Some(host) = event.host() else { return };
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize event");
                return;
            }
        };
        let mut files = self.files.lock();
        if !files.contains_key(host) {
            let dir = self.run_dir.join(host);
            let opened = std::fs::create_dir_all(&dir)
                .and_then(|()| OpenOptions::new().create(true).append(true).open(dir.join("events.jsonl")));
            match opened {
                Ok(file) => {
                    files.insert(host.to_string(), BufWriter::new(file));
                }
                Err(e) => {
                    warn!(host, error = %e, "failed to open events.jsonl");
                    return;
                }
            }
        }
        if let Some(writer) = files.get_mut(host) {
            if writeln!(writer, "{line}").is_err() {
                warn!(host, "failed to write events.jsonl");
            }
        }
    }

    fn flush(&self) {
        for writer in self.files.lock().values_mut() {
            let _ = writer.flush();
        }
    }
}
