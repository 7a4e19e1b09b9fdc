//! Extraction of complete lines from a byte range of the monitored file.
//!
//! The reader seeks to a start offset, reads forward up to (not past) an end
//! offset, and splits what it finds on [`LINE_DELIMITER`]. Bytes after the
//! last delimiter are returned separately as a fragment and are never turned
//! into a line here: the writer may still be in the middle of that line.

use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;

use crate::error::{TailError, TailResult};
use crate::line::{Line, LINE_DELIMITER};

/// Result of reading one byte range.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Extracted {
    /// Complete lines, in file order, each ending with the delimiter
    pub lines: Vec<Line>,

    /// Bytes covered by `lines`; `start + consumed` is where the next read
    /// must resume
    pub consumed: u64,

    /// Trailing bytes with no delimiter yet
    pub fragment: Vec<u8>,
}

/// Reads complete lines out of a seekable source.
pub struct LineReader<R> {
    inner: R,
    path: PathBuf,
}

impl<R: Read + Seek> LineReader<R> {
    /// Wraps a source. `path` is only used for error reporting.
    pub fn new(inner: R, path: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            path: path.into(),
        }
    }

    /// Reads every complete line in `[start, end)`.
    ///
    /// If `end <= start` nothing is read and an empty result is returned.
    pub fn read_range(&mut self, start: u64, end: u64) -> TailResult<Extracted> {
        self.inner
            .seek(SeekFrom::Start(start))
            .map_err(|e| TailError::Seek {
                path: self.path.clone(),
                offset: start,
                error: e.to_string(),
            })?;

        let window = end.saturating_sub(start);
        let mut reader = BufReader::new((&mut self.inner).take(window));
        let mut extracted = Extracted::default();

        loop {
            let mut buf = Vec::new();
            let bytes_read = reader
                .read_until(LINE_DELIMITER, &mut buf)
                .map_err(|e| TailError::Read {
                    path: self.path.clone(),
                    offset: start + extracted.consumed,
                    error: e.to_string(),
                })?;

            if bytes_read == 0 {
                break;
            }

            if buf.last() == Some(&LINE_DELIMITER) {
                extracted.consumed += bytes_read as u64;
                extracted.lines.push(Line::new(buf));
            } else {
                // read_until only stops short of the delimiter at the end of the window
                extracted.fragment = buf;
                break;
            }
        }

        Ok(extracted)
    }
}
