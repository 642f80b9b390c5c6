//! Error types surfaced by the store and the checkpoint loader.

use std::io;

use thiserror::Error;

/// Errors produced by the fixed-width record codec.
///
/// The codec is pure: the only failure modes are a buffer of the wrong
/// length and a chain-work value that does not fit the record version.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The input or output buffer does not have the width of any known
    /// record version.
    #[error("record has unexpected length {actual} (expected {expected})")]
    UnexpectedLength { expected: usize, actual: usize },

    /// The cumulative chain work does not fit in the record's work field.
    /// V1 records cap the work at 2^96 - 1; callers past that ceiling must
    /// encode V2.
    #[error("chain work does not fit in a {0} record")]
    ChainWorkOverflow(&'static str),
}

/// Errors produced by the block store.
///
/// Open-time errors are fatal for the given file; lookup misses are not
/// errors and surface as `None`.
#[derive(Debug, Error)]
pub enum BlockStoreError {
    /// Another process holds the exclusive lock on the store file.
    #[error("store file is locked by another process")]
    FileLocked,

    /// The file's magic bytes do not identify any store format version.
    #[error("file magic does not identify a block store")]
    BadMagic,

    /// The store exists with a different capacity and growing was not
    /// requested.
    #[error("store capacity mismatch: requested {requested}, on disk {actual}")]
    CapacityMismatch { requested: u32, actual: u32 },

    /// The requested capacity is smaller than what the file holds.
    #[error("shrinking an existing store is not supported")]
    ShrinkNotAllowed,

    /// The file is a legacy V1 store and the caller did not opt in to
    /// migration.
    #[error("store uses the legacy v1 format and migration was not enabled")]
    MigrationRequired,

    /// An invariant violation was discovered on open.
    #[error("block store is corrupt: {reason}")]
    Corrupt { reason: String },

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors produced while reading or writing checkpoint archives.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The input does not start with a known archive magic.
    #[error("unsupported checkpoint archive format")]
    BadMagic,

    /// The archive ends before all promised bytes were read.
    #[error("checkpoint archive ends prematurely")]
    Truncated,

    /// A checkpoint record has a length that matches no known version.
    #[error("unknown checkpoint record length {0}")]
    UnknownRecordLength(usize),

    /// The declared signature count exceeds the format maximum of 256.
    #[error("signature count {0} exceeds the maximum of 256")]
    TooManySignatures(u32),

    /// The archive declares zero checkpoints.
    #[error("archive contains no checkpoints")]
    Empty,

    /// A line of a textual archive could not be parsed.
    #[error("malformed checkpoint archive line: {0}")]
    BadLine(String),

    /// The requested lookup time does not postdate the genesis block.
    #[error("timestamp {0} does not postdate the genesis block")]
    TimeBeforeGenesis(u64),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Store(#[from] BlockStoreError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
