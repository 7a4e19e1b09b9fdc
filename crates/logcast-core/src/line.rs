//! A single newline-terminated line extracted from the monitored file.

use std::borrow::Cow;
use std::fmt;

/// Byte that terminates a line.
pub const LINE_DELIMITER: u8 = b'\n';

/// One line of the monitored file, including its trailing delimiter.
///
/// Lines are raw bytes: the file is not required to be UTF-8. A line is
/// immutable once extracted.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Line(Vec<u8>);

impl Line {
    /// Wraps raw bytes as a line.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw bytes, delimiter included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the line as `&str` if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Lossy UTF-8 view, for logging.
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Line({:?})", self.to_string_lossy())
    }
}

impl From<&str> for Line {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl AsRef<[u8]> for Line {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
