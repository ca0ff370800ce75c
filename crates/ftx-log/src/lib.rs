//! Segmented append-only recovery log.
//!
//! The log is a flat directory of segment files holding a packed stream of
//! framed records (see [`record::LogRecord`]). Normal operation only ever
//! appends; recovery reads the stream backward to the last checkpoint and
//! then forward to the tail.

pub mod codec;
pub mod cursor;
pub mod record;
pub mod segment;
pub mod writer;

pub use cursor::LogCursor;
pub use record::LogRecord;
pub use segment::{LOG_VERSION, segment_file_name};
pub use writer::{DEFAULT_LG_MAX, LogWriter};
