//! Append-only log storage.
//!
//! Each directory partition keeps two logs: a data log holding data
//! blocks and an index log holding table indexes, filters, the meta
//! block, and the footer. Writes go through a `LogSink`, reads through a
//! `LogSource`.
//!
//! A sink tracks two offsets. The logical offset counts every byte
//! accepted by `lwrite` and keeps increasing across log rotations; it is
//! the offset recorded in block handles. The physical offset is the
//! number of bytes actually written into the current file, which lags
//! behind while small writes sit in the in-memory staging buffer.
//!
//! Buffered data may be lost until the next `lsync`. Rotation closes the
//! current physical file and redirects future writes to a freshly named
//! one; when it happens is left to external coordination code.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Which of the two partition logs a sink or source serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogKind {
    Data,
    Index,
}

impl LogKind {
    fn file_name(self, rotation: Option<u32>) -> String {
        let stem = match self {
            LogKind::Data => "data",
            LogKind::Index => "index",
        };
        match rotation {
            None => format!("{stem}.log"),
            Some(index) => format!("{stem}-{index}.log"),
        }
    }

    /// Path of the initial (un-rotated) log file under `dir`.
    pub fn path(self, dir: &Path) -> PathBuf {
        dir.join(self.file_name(None))
    }
}

/// Write buffering for a sink. Writes smaller than `min_buf` are
/// collapsed in memory and written out in chunks of at least `min_buf`
/// bytes; the staging buffer never grows past `max_buf`. Zero disables
/// buffering.
#[derive(Clone, Copy, Debug)]
pub struct LogOptions {
    pub min_buf: usize,
    pub max_buf: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            min_buf: 32 * 1024,
            max_buf: 64 * 1024,
        }
    }
}

impl LogOptions {
    /// Buffering sized from a single byte budget.
    pub fn buffered(bytes: usize) -> Self {
        Self {
            min_buf: bytes / 2,
            max_buf: bytes,
        }
    }

    pub fn unbuffered() -> Self {
        Self {
            min_buf: 0,
            max_buf: 0,
        }
    }
}

struct SinkFile {
    file: File,
    buf: Vec<u8>,
    physical: u64,
}

impl SinkFile {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            buf: Vec::new(),
            physical: 0,
        })
    }

    fn append(&mut self, data: &[u8], opts: &LogOptions) -> Result<()> {
        if opts.max_buf == 0 {
            return self.write_through(data);
        }
        if self.buf.len() + data.len() > opts.max_buf && !self.buf.is_empty() {
            self.write_out()?;
        }
        if data.len() >= opts.max_buf {
            return self.write_through(data);
        }
        self.buf.extend_from_slice(data);
        if self.buf.len() >= opts.min_buf {
            self.write_out()?;
        }
        Ok(())
    }

    fn write_through(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        self.physical += data.len() as u64;
        Ok(())
    }

    fn write_out(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.file.write_all(&self.buf)?;
            self.physical += self.buf.len() as u64;
            self.buf.clear();
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.write_out()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn finish(&mut self, sync: bool) -> Result<()> {
        self.write_out()?;
        if sync {
            self.file.sync_all()?;
        }
        self.file.flush()?;
        Ok(())
    }
}

struct SinkInner {
    file: Option<SinkFile>,
    offset: u64,
}

/// Shared append-only writer over one log. Every operation takes the
/// sink's own mutex, so a logger and its background compactor can share
/// a sink through an `Arc`.
pub struct LogSink {
    dir: PathBuf,
    kind: LogKind,
    opts: LogOptions,
    inner: Mutex<SinkInner>,
}

impl LogSink {
    /// Creates the initial log file for `kind` under `dir`.
    pub fn open(dir: &Path, kind: LogKind, opts: LogOptions) -> Result<LogSink> {
        let file = SinkFile::open(&dir.join(kind.file_name(None)))?;
        Ok(LogSink {
            dir: dir.to_path_buf(),
            kind,
            opts,
            inner: Mutex::new(SinkInner {
                file: Some(file),
                offset: 0,
            }),
        })
    }

    /// Appends `data` and advances the logical offset. Data may sit in
    /// the staging buffer until the next sync, rotation, or close.
    pub fn lwrite(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock()?;
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| Error::AssertionFailed(self.closed_message()))?;
        file.append(data, &self.opts)?;
        inner.offset += data.len() as u64;
        Ok(())
    }

    /// Current logical write offset.
    pub fn ltell(&self) -> u64 {
        self.inner.lock().map(|inner| inner.offset).unwrap_or(0)
    }

    /// Physical offset in the current log file.
    pub fn ptell(&self) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.file.as_ref().map(|f| f.physical))
            .unwrap_or(0)
    }

    /// Forces buffered data down to storage.
    pub fn lsync(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        match inner.file.as_mut() {
            Some(file) => file.sync(),
            None => Ok(()),
        }
    }

    /// Finalizes the current log file and redirects future writes to a
    /// new file named with `index`. The logical offset keeps counting
    /// across the switch.
    pub fn lrotate(&self, index: u32, sync: bool) -> Result<()> {
        let mut inner = self.inner.lock()?;
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| Error::AssertionFailed(self.closed_message()))?;
        file.finish(sync)?;
        let path = self.dir.join(self.kind.file_name(Some(index)));
        tracing::debug!(path = %path.display(), "rotating log");
        inner.file = Some(SinkFile::open(&path)?);
        Ok(())
    }

    /// Flushes and closes the log. Further writes fail.
    pub fn lclose(&self, sync: bool) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if let Some(mut file) = inner.file.take() {
            file.finish(sync)?;
        }
        Ok(())
    }

    fn closed_message(&self) -> String {
        format!("{} log already closed", self.kind.file_name(None))
    }
}

/// Random-access reader over one finished log file.
pub struct LogSource {
    file: File,
    size: u64,
}

impl LogSource {
    pub fn open(path: &Path) -> Result<LogSource> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(LogSource { file, size })
    }

    /// Total log size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reads up to `n` bytes starting at `offset`. A read past the end
    /// of the log returns the bytes that exist; callers detect
    /// truncation by checking the returned length.
    pub fn read(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;

        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = self.file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}
