//! Whole-file store rebuilds.
//!
//! Two open-time paths rewrite the backing file: migrating a legacy V1
//! store to the V2 record layout, and growing a V2 store to a larger
//! capacity. Both share the same shape: read the live records out of the
//! old mapping in cursor order (oldest first), write a fresh file with the
//! records packed from slot zero, then atomically rename it over the
//! original. Packing from slot zero keeps the occupied region contiguous
//! behind the cursor, which the lookup scan relies on to treat an empty
//! slot as a definite miss.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::block::{RecordVersion, StoredBlock};
use crate::error::BlockStoreError;

use super::{
    file_size, read_cursor_raw, CHAIN_HEAD_RANGE, FILE_PROLOGUE_BYTES, MAGIC_V2, RECORD_SIZE_V2,
};

/// The live contents of a ring, oldest record first. Slot hashes are
/// carried verbatim rather than recomputed.
pub(super) struct RingImage {
    pub records: Vec<([u8; 32], StoredBlock)>,
    pub chain_head: [u8; 32],
}

/// Reads the live records of a mapped ring in FIFO order.
pub(super) fn read_ring(map: &[u8], version: RecordVersion) -> Result<RingImage, BlockStoreError> {
    let record_size = 32 + version.body_len();
    let prologue = FILE_PROLOGUE_BYTES as usize;
    let len = map.len();
    if len < prologue + record_size {
        return Err(BlockStoreError::Corrupt {
            reason: format!("file of {len} bytes is too small to hold any record"),
        });
    }
    if (len - prologue) % record_size != 0 {
        return Err(BlockStoreError::Corrupt {
            reason: "slot region is not a whole number of records".to_string(),
        });
    }

    let cursor = read_cursor_raw(map) as usize;
    if cursor < prologue || cursor > len || (cursor - prologue) % record_size != 0 {
        return Err(BlockStoreError::Corrupt {
            reason: format!("ring cursor {cursor} is out of range"),
        });
    }
    let cursor = if cursor == len { prologue } else { cursor };

    let mut chain_head = [0u8; 32];
    chain_head.copy_from_slice(&map[CHAIN_HEAD_RANGE]);

    // The ring has wrapped exactly when the slot under the cursor is
    // occupied; the oldest record then sits at the cursor itself.
    let wrapped = map[cursor..cursor + 32].iter().any(|b| *b != 0);
    let mut offsets = Vec::new();
    if wrapped {
        offsets.extend((cursor..len).step_by(record_size));
        offsets.extend((prologue..cursor).step_by(record_size));
    } else {
        offsets.extend((prologue..cursor).step_by(record_size));
    }

    let mut records = Vec::with_capacity(offsets.len());
    for offset in offsets {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&map[offset..offset + 32]);
        if hash.iter().all(|b| *b == 0) {
            // Torn trailing slot; the record after it was never cursor-committed.
            continue;
        }
        let block = StoredBlock::deserialize_compact(&map[offset + 32..offset + record_size])?;
        records.push((hash, block));
    }

    Ok(RingImage {
        records,
        chain_head,
    })
}

/// Writes a fresh V2 file holding the image, packed from slot zero, and
/// renames it over `path`.
pub(super) fn write_ring(
    path: &Path,
    capacity: u32,
    image: &RingImage,
) -> Result<(), BlockStoreError> {
    if image.records.len() > capacity as usize {
        return Err(BlockStoreError::ShrinkNotAllowed);
    }

    let record_size = RECORD_SIZE_V2 as usize;
    let mut buf = vec![0u8; file_size(capacity) as usize];
    buf[0..4].copy_from_slice(&MAGIC_V2);
    let mut offset = FILE_PROLOGUE_BYTES as usize;
    for (hash, block) in &image.records {
        buf[offset..offset + 32].copy_from_slice(hash);
        block.serialize_compact(
            RecordVersion::V2,
            &mut buf[offset + 32..offset + record_size],
        )?;
        offset += record_size;
    }
    buf[4..8].copy_from_slice(&(offset as u32).to_be_bytes());
    buf[CHAIN_HEAD_RANGE].copy_from_slice(&image.chain_head);

    let tmp = rebuild_path(path);
    fs::write(&tmp, &buf)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Rewrites a legacy V1 file as V2 at the requested capacity.
pub(super) fn migrate_v1(
    path: &Path,
    map: &[u8],
    capacity: u32,
) -> Result<(), BlockStoreError> {
    let image = read_ring(map, RecordVersion::V1)?;
    write_ring(path, capacity, &image)?;
    info!(
        path = %path.display(),
        records = image.records.len(),
        "migrated v1 block store to v2"
    );
    Ok(())
}

/// Rewrites a V2 file at a larger capacity.
pub(super) fn grow(path: &Path, map: &[u8], capacity: u32) -> Result<(), BlockStoreError> {
    let image = read_ring(map, RecordVersion::V2)?;
    write_ring(path, capacity, &image)?;
    info!(
        path = %path.display(),
        capacity,
        records = image.records.len(),
        "grew block store"
    );
    Ok(())
}

fn rebuild_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".rebuild");
    path.with_file_name(name)
}
