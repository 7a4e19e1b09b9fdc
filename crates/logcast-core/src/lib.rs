//! logcast core - offset tracking and line extraction
//!
//! This crate holds the synchronous half of the tail engine, shared by the
//! daemon (`logcastd`) and its tests:
//! - `file` - the monitored file and its offset/rotation bookkeeping
//! - `reader` - extraction of complete lines from a byte range
//! - `line` - the immutable line value handed to the broadcaster
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod file;
pub mod line;
pub mod reader;

// Re-exports for convenience
pub use error::{TailError, TailResult};
pub use file::{FileChange, MonitoredFile, Scan};
pub use line::{Line, LINE_DELIMITER};
pub use reader::{Extracted, LineReader};
