//! Access and error log sinks with size-triggered rotation.
//!
//! Every request writes to the same two sinks from its own task, so each sink
//! sits behind a mutex: rotation bookkeeping (the byte counter, the open file,
//! the backup shuffle) is only ever touched by one writer at a time.
//!
//! # Rotation
//!
//! With `max_size > 0`, a write that would push the active file past
//! `max_size` first rotates:
//!
//! ```text
//! access.log.<n>.*        deleted when n >= backups
//! access.log.<i>.<ts>  →  access.log.<i+1>.<ts>     (highest index first)
//! access.log           →  access.log.1.<YYYYmmdd-HHMMSS>
//! access.log              reopened empty, counter reset
//! ```
//!
//! So after any number of rotations at most `backups` archives exist next to
//! the active file, index 1 being the most recent.
//!
//! Runtime failures never reach the request that triggered them: they are
//! reported through `tracing` and the line is written best-effort or dropped.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::Error;

enum Target {
    Stdout,
    Stderr,
    File(RotatingFile),
}

/// One append-only log destination, safe to share across tasks.
pub struct LogSink {
    name: &'static str,
    target: Mutex<Option<Target>>,
}

impl LogSink {
    /// Opens (creating parent directories) a file-backed sink.
    ///
    /// `max_size == 0` disables rotation. Fails if the file cannot be opened;
    /// callers treat that as fatal at startup.
    pub fn open(name: &'static str, path: impl Into<PathBuf>, max_size: u64, backups: usize) -> Result<Self, Error> {
        let mut file = RotatingFile { path: path.into(), max_size, backups, state: FileState::Pending };
        file.ensure_open().map_err(|source| Error::Log { path: file.path.clone(), source })?;
        Ok(Self { name, target: Mutex::new(Some(Target::File(file))) })
    }

    pub fn stdout(name: &'static str) -> Self {
        Self { name, target: Mutex::new(Some(Target::Stdout)) }
    }

    pub fn stderr(name: &'static str) -> Self {
        Self { name, target: Mutex::new(Some(Target::Stderr)) }
    }

    /// File sink when `path` is set, `fallback` otherwise.
    pub(crate) fn from_settings(
        name: &'static str,
        path: Option<&Path>,
        max_size: u64,
        backups: usize,
        fallback: fn(&'static str) -> Self,
    ) -> Result<Self, Error> {
        match path {
            Some(path) => Self::open(name, path, max_size, backups),
            None => Ok(fallback(name)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Appends `line` plus a newline. Dropped silently once closed.
    pub fn write_line(&self, line: &str) {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.write(&buf);
    }

    /// Appends raw bytes. Dropped silently once closed.
    pub fn write(&self, payload: &[u8]) {
        let mut guard = self.target.lock();
        let result = match guard.as_mut() {
            None => return,
            Some(Target::Stdout) => io::stdout().lock().write_all(payload),
            Some(Target::Stderr) => io::stderr().lock().write_all(payload),
            Some(Target::File(file)) => file.write(payload),
        };
        if let Err(e) = result {
            warn!(sink = self.name, "log write dropped: {e}");
        }
    }

    /// Closes the sink. Idempotent; returns `true` only for the call that
    /// actually closed it.
    pub fn close(&self) -> bool {
        let Some(target) = self.target.lock().take() else {
            return false;
        };
        if let Target::File(mut file) = target {
            if let Err(e) = file.flush_and_close() {
                warn!(sink = self.name, "log close failed: {e}");
            }
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.target.lock().is_none()
    }
}

/// The server's access and error sinks.
pub struct LogSinks {
    pub access: LogSink,
    pub error: LogSink,
}

impl LogSinks {
    /// Closes access, then error. Returns `true` if either was still open.
    pub fn close(&self) -> bool {
        let access = self.access.close();
        let error = self.error.close();
        access || error
    }
}

// ── Rotating file ─────────────────────────────────────────────────────────────

enum FileState {
    Pending,
    Open { file: File, written: u64 },
}

struct RotatingFile {
    path: PathBuf,
    max_size: u64,
    backups: usize,
    state: FileState,
}

impl RotatingFile {
    fn write(&mut self, payload: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        if self.needs_rotation(payload.len() as u64) {
            if let Err(e) = self.rotate() {
                warn!(path = %self.path.display(), "log rotation failed, appending to active file: {e}");
            }
            self.ensure_open()?;
        }
        let FileState::Open { file, written } = &mut self.state else {
            unreachable!("ensure_open leaves the file open");
        };
        file.write_all(payload)?;
        *written += payload.len() as u64;
        Ok(())
    }

    fn needs_rotation(&self, incoming: u64) -> bool {
        match &self.state {
            // An empty file has nothing to archive, even if the payload alone
            // exceeds the limit.
            FileState::Open { written, .. } => self.max_size > 0 && *written > 0 && written + incoming > self.max_size,
            FileState::Pending => false,
        }
    }

    fn ensure_open(&mut self) -> io::Result<()> {
        if matches!(self.state, FileState::Open { .. }) {
            return Ok(());
        }
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.state = FileState::Open { file, written };
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.flush_and_close()?;

        let mut archived = self.archives()?;
        archived.sort_by(|a, b| b.0.cmp(&a.0));
        for (index, stamp, path) in archived {
            if index >= self.backups {
                fs::remove_file(&path)?;
            } else {
                fs::rename(&path, self.archive_path(index + 1, &stamp))?;
            }
        }

        if self.backups == 0 {
            fs::remove_file(&self.path)?;
        } else {
            let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
            fs::rename(&self.path, self.archive_path(1, &stamp))?;
        }
        Ok(())
    }

    fn flush_and_close(&mut self) -> io::Result<()> {
        if let FileState::Open { mut file, .. } = std::mem::replace(&mut self.state, FileState::Pending) {
            file.flush()?;
        }
        Ok(())
    }

    fn archive_path(&self, index: usize, stamp: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{index}.{stamp}"));
        PathBuf::from(name)
    }

    /// Archives on disk as `(index, stamp, path)`, unordered.
    fn archives(&self) -> io::Result<Vec<(usize, String, PathBuf)>> {
        let Some(file_name) = self.path.file_name().and_then(|n| n.to_str()) else {
            return Ok(Vec::new());
        };
        let prefix = format!("{file_name}.");
        let dir = match self.path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(rest) = name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
                continue;
            };
            let Some((index, stamp)) = rest.split_once('.') else {
                continue;
            };
            if let Ok(index) = index.parse::<usize>() {
                out.push((index, stamp.to_owned(), entry.path()));
            }
        }
        Ok(out)
    }
}
