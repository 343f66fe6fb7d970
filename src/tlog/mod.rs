//! Append-only transaction logs
//!
//! Every write to a volume produces a Location record in the volume's
//! current TLog. SCO boundaries are sealed with an SCO-CRC record covering
//! all Location records since the previous boundary; a TLog is sealed with
//! a final TLog-CRC covering every byte before it. Sealed TLogs are
//! uploaded to the backend under `tlog_<uuid>` and are the unit of
//! durability: once a TLog is on the backend, the writes it describes are
//! stable and their DTL copies can be dropped.
//!
//! On-disk framing, little-endian:
//!
//! ```text
//! [len: u32][tag: u8][bincode payload][crc32 of tag + payload]
//! ```

use thiserror::Error;

pub mod reader;
pub mod records;
pub mod writer;

pub use reader::{
    scan_open_tlog, CombinedTLogReader, OpenTLogScan, TLogProcessor, TLogReader, TLogSource,
};
pub use records::TLogRecord;
pub use writer::TLogWriter;

/// TLog error types
#[derive(Error, Debug)]
pub enum TLogError {
    /// A sealed TLog's final CRC does not match its contents
    #[error("tlog CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    WrongCrc {
        /// CRC found in the final record
        stored: u32,
        /// CRC recomputed over the log bytes
        computed: u32,
    },

    /// A non-current TLog ends without its final CRC record
    #[error("tlog is missing its final CRC")]
    WithoutFinalCrc,

    /// An SCO boundary passed without an SCO-CRC record
    #[error("sco switch without sco CRC")]
    ScoSwitchWithoutScoCrc,

    /// An SCO-CRC record disagrees with the location records it covers
    #[error("sco CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ScoCrcMismatch {
        /// CRC found in the record
        stored: u32,
        /// CRC recomputed over the covered location records
        computed: u32,
    },

    /// A single record frame failed its CRC check
    #[error("record CRC mismatch at offset {0}")]
    RecordCrcMismatch(u64),

    /// The log ends inside a frame
    #[error("truncated record frame at offset {0}")]
    TruncatedFrame(u64),

    /// A record payload would not decode
    #[error("record decode error: {0}")]
    Decode(String),

    /// Records may not follow the final TLog-CRC
    #[error("record after final CRC")]
    RecordAfterFinalCrc,

    /// Underlying file I/O failed
    #[error("tlog I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Fetching a TLog object from the backend failed
    #[error("tlog backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),
}

/// Result type for TLog operations
pub type TLogResult<T> = Result<T, TLogError>;
