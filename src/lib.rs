//! Bounded, persistent block header storage for SPV nodes.
//!
//! An SPV client keeps only a suffix of the header chain: enough to follow
//! the tip, survive reorgs, and prove payment inclusion, without ever
//! holding full blocks. This crate provides the two pieces that make that
//! durable:
//!
//! - [`SpvBlockStore`], a fixed-capacity memory-mapped ring of
//!   hash-indexed stored blocks with a persisted chain-head pointer,
//!   process-exclusive file locking, and in-place migration from the
//!   legacy V1 record layout;
//! - [`CheckpointManager`], which parses signed checkpoint archives
//!   (binary or textual), authenticates them with a SHA-256 data hash,
//!   and seeds a fresh store with the checkpoints straddling a wallet
//!   birthday.
//!
//! Chain validation, networking, and wallet logic live elsewhere; the
//! store only ever sees headers, cumulative work, and heights.

pub mod block;
pub mod checkpoint;
pub mod error;
pub mod params;
pub mod store;

pub use block::{BlockHeader, RecordVersion, StoredBlock, HEADER_SIZE};
pub use checkpoint::{
    write_binary_checkpoints, write_textual_checkpoints, CheckpointManager,
};
pub use error::{BlockStoreError, CheckpointError, RecordError};
pub use params::{Network, Params};
pub use store::{
    file_size, SpvBlockStore, StoreOptions, DEFAULT_CAPACITY, FILE_PROLOGUE_BYTES,
    RECORD_SIZE_V1, RECORD_SIZE_V2,
};
