//! Error taxonomy for the decode/assembly/WAL pipeline (spec §7).
//!
//! Every layer returns `Result<T, E>` explicitly rather than signalling
//! failure through a sentinel value; callers decide how far to unwind
//! (abort the tuple, the record, or the segment) based on which variant
//! they receive.

use thiserror::Error;

/// Failures that can occur while decoding a single attribute value.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("alignment padding of {needed} bytes required but only {available} available at offset {offset}")]
    AlignmentFailure {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("field requires {needed} bytes but only {available} available at offset {offset}")]
    ShortInput {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("varlena header or numeric special bits did not match any known shape at offset {offset}")]
    FormatInvalid { offset: usize },

    #[error("decompression failed: {reason}")]
    DecompressionFailed { reason: &'static str },

    #[error("TOAST assembly failed for value_oid={value_oid}: {reason}")]
    AssemblyFailed { value_oid: u32, reason: String },

    #[error("allocation of {requested} bytes exceeded the configured workspace limit")]
    MemoryExhausted { requested: usize },
}

impl DecodeError {
    /// Whether this error should abort only the current tuple (true for all
    /// per-attribute errors) as opposed to terminating the whole scan.
    pub fn aborts_tuple_only(&self) -> bool {
        !matches!(self, DecodeError::MemoryExhausted { .. })
    }
}

/// Failures at the WAL record/page/segment level (spec §7, second row).
#[derive(Debug, Error)]
pub enum WalError {
    #[error("WAL segment {0} is missing from disk")]
    SegmentMissing(String),

    #[error("record at LSN {lsn} declared length {declared} but continuation totalled {actual}")]
    InvalidContinuation {
        lsn: u64,
        declared: u32,
        actual: u32,
    },

    #[error("CRC mismatch for record at LSN {lsn}: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        lsn: u64,
        expected: u32,
        computed: u32,
    },

    #[error("segment truncated while reading record at LSN {lsn}")]
    Truncated { lsn: u64 },

    #[error("page header at LSN {lsn} failed validation: {reason}")]
    InvalidPageHeader { lsn: u64, reason: &'static str },
}

/// Top-level error returned by scan/assembly entry points.
#[derive(Debug, Error)]
pub enum RecoverError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
