//! Memory-mapped SPV block header store.
//!
//! The store keeps a bounded suffix of the header chain in a single
//! memory-mapped file: a fixed prologue (magic, ring cursor, chain-head
//! hash) followed by a fixed-capacity array of hash-prefixed records. The
//! ring cursor is the FIFO eviction pointer: new records land at the
//! cursor and the oldest record is overwritten once the ring wraps.
//! Lookups scan backward from the cursor, newest first, so the chain tip
//! and its recent ancestors are found in a probe or two; an LRU cache of
//! slot offsets short-circuits the scan for hot keys.
//!
//! The backing file is held under an exclusive OS lock between `open` and
//! `close`, so at most one process writes it at a time. After open, all
//! operations work against the mapping and issue no explicit I/O.

mod cache;
mod migrate;

use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use alloy_primitives::B256;
use fs4::fs_std::FileExt;
use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::info;

use crate::block::{RecordVersion, StoredBlock};
use crate::error::BlockStoreError;
use crate::params::Params;

use cache::SlotCache;

/// Bytes reserved at the start of the file for the magic, the ring
/// cursor, the chain-head hash, and future prologue fields.
pub const FILE_PROLOGUE_BYTES: u32 = 1024;

/// Default ring capacity, in records.
pub const DEFAULT_CAPACITY: u32 = 10_000;

/// On-disk slot width for V1 records: 32-byte hash plus the record body.
pub const RECORD_SIZE_V1: u32 = 32 + RecordVersion::V1.body_len() as u32;

/// On-disk slot width for V2 records.
pub const RECORD_SIZE_V2: u32 = 32 + RecordVersion::V2.body_len() as u32;

/// File magic for the legacy V1 layout.
pub(crate) const MAGIC_V1: [u8; 4] = *b"SPVB";

/// File magic for the current V2 layout.
pub(crate) const MAGIC_V2: [u8; 4] = *b"SPV2";

const CURSOR_RANGE: Range<usize> = 4..8;
const CHAIN_HEAD_RANGE: Range<usize> = 8..40;

/// Size in bytes of a store file with the given capacity.
pub fn file_size(capacity: u32) -> u64 {
    u64::from(FILE_PROLOGUE_BYTES) + u64::from(capacity) * u64::from(RECORD_SIZE_V2)
}

/// How to open a block store file.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    capacity: u32,
    grow: bool,
    migrate_v1: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            grow: false,
            migrate_v1: true,
        }
    }
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ring capacity, in records. Must be positive.
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Allow an existing smaller store to be grown to the requested
    /// capacity. Without this, a capacity mismatch fails the open.
    pub fn grow(mut self, grow: bool) -> Self {
        self.grow = grow;
        self
    }

    /// Whether a legacy V1 file may be rewritten to the V2 layout on
    /// open. On by default; when disabled, opening a V1 file fails with
    /// [`BlockStoreError::MigrationRequired`].
    pub fn migrate_v1(mut self, migrate: bool) -> Self {
        self.migrate_v1 = migrate;
        self
    }

    /// Opens (creating if absent) the store file at `path`.
    pub fn open(
        self,
        params: Params,
        path: impl AsRef<Path>,
    ) -> Result<SpvBlockStore, BlockStoreError> {
        SpvBlockStore::open_with(params, path.as_ref(), self)
    }
}

struct State {
    // Held only for its exclusive lock; dropping it releases the lock.
    _file: File,
    map: MmapMut,
    cache: SlotCache,
}

/// A fixed-capacity, memory-mapped block header store.
///
/// Operations take `&self`; a single internal mutex serializes access to
/// the mapping, which also gives cross-thread visibility for chain-head
/// and cursor updates.
pub struct SpvBlockStore {
    params: Params,
    path: PathBuf,
    capacity: u32,
    state: Mutex<State>,
}

impl std::fmt::Debug for SpvBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpvBlockStore")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl SpvBlockStore {
    /// Opens the store at `path` with default options, creating and
    /// seeding it with the genesis block if it does not exist.
    pub fn open(params: Params, path: impl AsRef<Path>) -> Result<Self, BlockStoreError> {
        StoreOptions::default().open(params, path)
    }

    fn open_with(
        params: Params,
        path: &Path,
        options: StoreOptions,
    ) -> Result<Self, BlockStoreError> {
        assert!(options.capacity > 0, "store capacity must be positive");

        let mut file = open_locked(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Self::create_new(params, path, options.capacity, file);
        }

        let mut magic = [0u8; 4];
        if len < 4 {
            return Err(BlockStoreError::BadMagic);
        }
        file.read_exact(&mut magic)?;

        if magic == MAGIC_V1 {
            if !options.migrate_v1 {
                return Err(BlockStoreError::MigrationRequired);
            }
            let map = map_readonly(&file)?;
            migrate::migrate_v1(path, &map, options.capacity)?;
            drop(map);
            // The rename left `file` pointing at the unlinked V1 inode;
            // take a lock on the new file before letting the old one go.
            let migrated = open_locked(path)?;
            file = migrated;
        } else if magic == MAGIC_V2 {
            let actual = capacity_for_len(len)?;
            if options.capacity < actual {
                return Err(BlockStoreError::ShrinkNotAllowed);
            }
            if options.capacity > actual {
                if !options.grow {
                    return Err(BlockStoreError::CapacityMismatch {
                        requested: options.capacity,
                        actual,
                    });
                }
                let map = map_readonly(&file)?;
                migrate::grow(path, &map, options.capacity)?;
                drop(map);
                let grown = open_locked(path)?;
                file = grown;
            }
        } else {
            return Err(BlockStoreError::BadMagic);
        }

        let len = file.metadata()?.len();
        if len != file_size(options.capacity) {
            return Err(BlockStoreError::Corrupt {
                reason: format!(
                    "file length {len} does not match capacity {}",
                    options.capacity
                ),
            });
        }
        let map = map_writable(&file)?;
        if map[0..4] != MAGIC_V2 {
            return Err(BlockStoreError::BadMagic);
        }
        validate_cursor(&map)?;

        info!(path = %path.display(), capacity = options.capacity, "opened block store");
        Ok(Self {
            params,
            path: path.to_path_buf(),
            capacity: options.capacity,
            state: Mutex::new(State {
                _file: file,
                map,
                cache: SlotCache::new(),
            }),
        })
    }

    fn create_new(
        params: Params,
        path: &Path,
        capacity: u32,
        file: File,
    ) -> Result<Self, BlockStoreError> {
        file.set_len(file_size(capacity))?;
        let mut map = map_writable(&file)?;
        map[0..4].copy_from_slice(&MAGIC_V2);
        write_cursor(&mut map, FILE_PROLOGUE_BYTES);

        let store = Self {
            params,
            path: path.to_path_buf(),
            capacity,
            state: Mutex::new(State {
                _file: file,
                map,
                cache: SlotCache::new(),
            }),
        };
        let genesis = store.params.genesis_stored();
        store.put(&genesis)?;
        store.set_chain_head(&genesis)?;
        info!(path = %path.display(), capacity, "created new block store");
        Ok(store)
    }

    /// The configured ring capacity, in records.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// The path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The raw ring cursor: the byte offset that will receive the next
    /// newly inserted record (possibly the pre-wrap resting value equal to
    /// the file size).
    pub fn ring_cursor(&self) -> u32 {
        let state = self.state.lock().expect("store lock");
        read_cursor_raw(&state.map)
    }

    /// Inserts or updates the record for the block's hash.
    ///
    /// A block whose slot is still known to the offset cache is updated in
    /// place. Otherwise the record is written at the ring cursor,
    /// overwriting the oldest record once the ring has wrapped; no scan is
    /// made for an existing slot with the same hash, so re-inserting a key
    /// that fell out of the cache can briefly leave two slots carrying it.
    /// Use [`SpvBlockStore::contains`] first when that matters.
    pub fn put(&self, block: &StoredBlock) -> Result<(), BlockStoreError> {
        let hash = block.hash();
        let mut body = [0u8; RecordVersion::V2.body_len()];
        block.serialize_compact(RecordVersion::V2, &mut body)?;

        let mut state = self.state.lock().expect("store lock");
        let State { map, cache, .. } = &mut *state;

        if let Some(offset) = cache.offset(&hash) {
            let offset = offset as usize;
            if map[offset..offset + 32] == hash[..] {
                map[offset + 32..offset + RECORD_SIZE_V2 as usize].copy_from_slice(&body);
                return Ok(());
            }
            // The ring lapped this slot since it was cached.
            cache.forget(&hash);
        }

        let len = map.len() as u32;
        let cursor = normalize_cursor(read_cursor_raw(map), len);
        let offset = cursor as usize;
        map[offset..offset + 32].copy_from_slice(hash.as_slice());
        map[offset + 32..offset + RECORD_SIZE_V2 as usize].copy_from_slice(&body);
        // The cursor advances only after the record bytes are in place, so
        // a crash can tear at most the slot the cursor still names.
        write_cursor(map, cursor + RECORD_SIZE_V2);
        cache.note_found(hash, cursor);
        Ok(())
    }

    /// Returns the stored block for the hash, or `None` if the ring does
    /// not hold it. Absence is not an error.
    pub fn get(&self, hash: B256) -> Result<Option<StoredBlock>, BlockStoreError> {
        if hash == B256::ZERO {
            return Ok(None);
        }
        let mut state = self.state.lock().expect("store lock");
        match self.find_slot(&mut state, hash) {
            Some(offset) => decode_slot(&state.map, offset).map(Some),
            None => Ok(None),
        }
    }

    /// Whether the ring currently holds a record for the hash.
    pub fn contains(&self, hash: B256) -> Result<bool, BlockStoreError> {
        if hash == B256::ZERO {
            return Ok(false);
        }
        let mut state = self.state.lock().expect("store lock");
        Ok(self.find_slot(&mut state, hash).is_some())
    }

    /// Returns the block the store regards as the tip of the best chain.
    ///
    /// A store whose head pointer is still the all-zero sentinel reports
    /// the network's genesis block.
    pub fn chain_head(&self) -> Result<StoredBlock, BlockStoreError> {
        let mut state = self.state.lock().expect("store lock");
        let head = B256::from_slice(&state.map[CHAIN_HEAD_RANGE]);
        if head == B256::ZERO {
            return Ok(self.params.genesis_stored());
        }
        match self.find_slot(&mut state, head) {
            Some(offset) => decode_slot(&state.map, offset),
            None => Err(BlockStoreError::Corrupt {
                reason: format!("chain head {head} is not present in the ring"),
            }),
        }
    }

    /// Points the chain head at the block's hash.
    ///
    /// This does not insert the block; callers must have `put` it first.
    /// Setting a head that is not present is not detected here, but every
    /// later [`SpvBlockStore::chain_head`] will fail.
    pub fn set_chain_head(&self, block: &StoredBlock) -> Result<(), BlockStoreError> {
        let hash = block.hash();
        let mut state = self.state.lock().expect("store lock");
        state.map[CHAIN_HEAD_RANGE].copy_from_slice(hash.as_slice());
        Ok(())
    }

    /// Returns the store to its freshly created state: only the genesis
    /// block present and at the head. The file lock is kept throughout.
    pub fn clear(&self) -> Result<(), BlockStoreError> {
        {
            let mut state = self.state.lock().expect("store lock");
            let State { map, cache, .. } = &mut *state;
            map[4..].fill(0);
            write_cursor(map, FILE_PROLOGUE_BYTES);
            cache.clear();
        }
        let genesis = self.params.genesis_stored();
        self.put(&genesis)?;
        self.set_chain_head(&genesis)?;
        info!(path = %self.path.display(), "cleared block store");
        Ok(())
    }

    /// Flushes the mapping and releases the file lock.
    pub fn close(self) -> Result<(), BlockStoreError> {
        {
            let state = self.state.lock().expect("store lock");
            state.map.flush()?;
        }
        Ok(())
    }

    /// Locates the slot holding `hash`, consulting the caches first and
    /// falling back to a backward scan from the ring cursor.
    fn find_slot(&self, state: &mut State, hash: B256) -> Option<u32> {
        let State { map, cache, .. } = &mut *state;
        if let Some(offset) = cache.offset(&hash) {
            if map[offset as usize..offset as usize + 32] == hash[..] {
                return Some(offset);
            }
            cache.forget(&hash);
        }
        if cache.is_known_missing(&hash) {
            return None;
        }
        match scan_ring(map, hash) {
            Some(offset) => {
                cache.note_found(hash, offset);
                Some(offset)
            }
            None => {
                cache.note_missing(hash);
                None
            }
        }
    }
}

impl Drop for SpvBlockStore {
    fn drop(&mut self) {
        if let Ok(state) = self.state.lock() {
            let _ = state.map.flush();
        }
    }
}

/// Scans the ring backward from the cursor, newest record first.
///
/// Termination: a matching hash (hit), an all-zero hash (miss — the
/// occupied region behind the cursor is contiguous, so an empty slot means
/// every older slot is empty too), or a full lap of the ring (miss).
fn scan_ring(map: &[u8], hash: B256) -> Option<u32> {
    let len = map.len() as u32;
    let start = normalize_cursor(read_cursor_raw(map), len);
    let mut cursor = start;
    loop {
        cursor = if cursor == FILE_PROLOGUE_BYTES {
            len - RECORD_SIZE_V2
        } else {
            cursor - RECORD_SIZE_V2
        };
        let slot = &map[cursor as usize..cursor as usize + 32];
        if slot == hash.as_slice() {
            return Some(cursor);
        }
        if slot.iter().all(|b| *b == 0) {
            return None;
        }
        if cursor == start {
            return None;
        }
    }
}

fn decode_slot(map: &[u8], offset: u32) -> Result<StoredBlock, BlockStoreError> {
    let offset = offset as usize;
    let body = &map[offset + 32..offset + RECORD_SIZE_V2 as usize];
    StoredBlock::deserialize_compact(body).map_err(Into::into)
}

fn open_locked(path: &Path) -> Result<File, BlockStoreError> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    if !file.try_lock_exclusive()? {
        return Err(BlockStoreError::FileLocked);
    }
    Ok(file)
}

fn map_readonly(file: &File) -> Result<Mmap, BlockStoreError> {
    // SAFETY: the file is under our exclusive lock, so no other process
    // mutates it behind the mapping.
    unsafe { MmapOptions::new().map(file) }.map_err(Into::into)
}

fn map_writable(file: &File) -> Result<MmapMut, BlockStoreError> {
    // SAFETY: as above; this process is the only writer.
    unsafe { MmapOptions::new().map_mut(file) }.map_err(Into::into)
}

fn capacity_for_len(len: u64) -> Result<u32, BlockStoreError> {
    let body = len
        .checked_sub(u64::from(FILE_PROLOGUE_BYTES))
        .filter(|body| *body > 0 && body % u64::from(RECORD_SIZE_V2) == 0)
        .ok_or_else(|| BlockStoreError::Corrupt {
            reason: format!("file length {len} does not describe a whole ring"),
        })?;
    u32::try_from(body / u64::from(RECORD_SIZE_V2)).map_err(|_| BlockStoreError::Corrupt {
        reason: format!("file length {len} implies an impossible capacity"),
    })
}

pub(crate) fn read_cursor_raw(map: &[u8]) -> u32 {
    u32::from_be_bytes(map[CURSOR_RANGE].try_into().expect("4 bytes"))
}

fn write_cursor(map: &mut [u8], cursor: u32) {
    map[CURSOR_RANGE].copy_from_slice(&cursor.to_be_bytes());
}

/// Folds the pre-wrap resting cursor (== file size) back to the first slot.
fn normalize_cursor(cursor: u32, len: u32) -> u32 {
    if cursor == len {
        FILE_PROLOGUE_BYTES
    } else {
        cursor
    }
}

fn validate_cursor(map: &[u8]) -> Result<(), BlockStoreError> {
    let cursor = read_cursor_raw(map);
    let len = map.len() as u32;
    if cursor < FILE_PROLOGUE_BYTES
        || cursor > len
        || (cursor - FILE_PROLOGUE_BYTES) % RECORD_SIZE_V2 != 0
    {
        return Err(BlockStoreError::Corrupt {
            reason: format!("ring cursor {cursor} is out of range"),
        });
    }
    Ok(())
}
