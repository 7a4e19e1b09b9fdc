//! The monitored file and its offset/rotation bookkeeping.
//!
//! `MonitoredFile` is the OffsetTracker: it remembers how far the stream has
//! been delivered (`last_offset`) and how big the file was at the last check
//! (`last_known_size`). Every check re-derives the situation from the file's
//! current size, never from how many change signals arrived, so signals can
//! be dropped or coalesced freely.
//!
//! Checking is split in two steps so a failed delivery pipeline never
//! corrupts the bookkeeping:
//!
//! ```text
//! scan(&self)  ──▶  Scan { change, lines, end_offset, .. }  ──▶  apply(&mut self)
//!   (read-only)                                                  (single writer)
//! ```
//!
//! If `scan` fails, nothing is applied and the next check starts from the
//! same baseline.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{TailError, TailResult};
use crate::line::Line;
use crate::reader::LineReader;

/// How the file changed since the last applied scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    /// Size equals the last known size; nothing is read
    Unchanged,

    /// File grew; reading resumes from the last delivered offset
    Grown,

    /// File shrank (truncated or replaced); reading restarts at offset 0
    Rotated,
}

/// Outcome of one read-only check of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    /// Classification against the previous baseline
    pub change: FileChange,

    /// File size observed when the file was opened
    pub observed_size: u64,

    /// Offset reading started from
    pub start_offset: u64,

    /// Offset just past the last complete line; the next read resumes here
    pub end_offset: u64,

    /// Offset reading stopped at (`observed_size` unless the read window was
    /// smaller than the new data)
    pub window_end: u64,

    /// Complete lines in file order
    pub lines: Vec<Line>,

    /// True when a full window held no delimiter and was emitted as one line
    pub oversized: bool,
}

impl Scan {
    /// Returns true if data between `window_end` and `observed_size` is
    /// still waiting to be read.
    pub fn is_partial(&self) -> bool {
        self.window_end < self.observed_size
    }
}

/// A file being tailed, with its delivery offset and last observed size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredFile {
    path: PathBuf,
    last_offset: u64,
    last_known_size: u64,
}

impl MonitoredFile {
    /// Starts monitoring `path` from its current end.
    ///
    /// The path is canonicalized and must name a regular file. Only lines
    /// appended after this call are ever delivered.
    ///
    /// # Errors
    ///
    /// - `TailError::Open` if the path cannot be resolved
    /// - `TailError::Stat` if its metadata cannot be read
    /// - `TailError::NotAFile` if it is a directory or other special file
    pub fn open(path: impl AsRef<Path>) -> TailResult<Self> {
        let path = path.as_ref();
        let path = fs::canonicalize(path).map_err(|e| TailError::Open {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let metadata = fs::metadata(&path).map_err(|e| TailError::Stat {
            path: path.clone(),
            error: e.to_string(),
        })?;

        if !metadata.is_file() {
            return Err(TailError::NotAFile { path });
        }

        let size = metadata.len();
        Ok(Self::with_baseline(path, size))
    }

    /// Creates a tracker with an explicit baseline, without touching the
    /// filesystem. `with_baseline(path, 0)` delivers the whole file.
    pub fn with_baseline(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            last_offset: offset,
            last_known_size: offset,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte position already delivered.
    pub fn last_offset(&self) -> u64 {
        self.last_offset
    }

    /// Size recorded at the last applied scan.
    pub fn last_known_size(&self) -> u64 {
        self.last_known_size
    }

    /// Classifies a freshly observed size against the baseline.
    pub fn classify(&self, size: u64) -> FileChange {
        if size == self.last_known_size {
            FileChange::Unchanged
        } else if size < self.last_known_size {
            FileChange::Rotated
        } else {
            FileChange::Grown
        }
    }

    /// Opens and stats the file, then reads the complete lines available
    /// from the resolved resume offset.
    ///
    /// At most `max_read_bytes` are read; see [`Scan::is_partial`]. If an
    /// entire window of that size holds no delimiter, the window is returned
    /// as a single unterminated line so the stream keeps moving.
    pub fn scan(&self, max_read_bytes: u64) -> TailResult<Scan> {
        let file = File::open(&self.path).map_err(|e| TailError::Open {
            path: self.path.clone(),
            error: e.to_string(),
        })?;

        let size = file
            .metadata()
            .map_err(|e| TailError::Stat {
                path: self.path.clone(),
                error: e.to_string(),
            })?
            .len();

        let change = self.classify(size);
        debug!(
            path = %self.path.display(),
            offset = self.last_offset,
            last_size = self.last_known_size,
            size,
            change = ?change,
            "Checked monitored file"
        );

        let start = match change {
            FileChange::Unchanged => {
                return Ok(Scan {
                    change,
                    observed_size: size,
                    start_offset: self.last_offset,
                    end_offset: self.last_offset,
                    window_end: self.last_known_size,
                    lines: Vec::new(),
                    oversized: false,
                });
            }
            FileChange::Rotated => 0,
            FileChange::Grown => self.last_offset,
        };

        let window_end = size.min(start.saturating_add(max_read_bytes.max(1)));
        let mut reader = LineReader::new(file, &self.path);
        let mut extracted = reader.read_range(start, window_end)?;

        let mut oversized = false;
        if window_end < size && extracted.lines.is_empty() && !extracted.fragment.is_empty() {
            let chunk = std::mem::take(&mut extracted.fragment);
            extracted.consumed = chunk.len() as u64;
            extracted.lines.push(Line::new(chunk));
            oversized = true;
        }

        Ok(Scan {
            change,
            observed_size: size,
            start_offset: start,
            end_offset: start + extracted.consumed,
            window_end,
            lines: extracted.lines,
            oversized,
        })
    }

    /// Records a scan whose lines have been handed to the broadcaster.
    pub fn apply(&mut self, scan: &Scan) {
        self.last_known_size = scan.window_end;
        self.last_offset = scan.end_offset;
    }
}
