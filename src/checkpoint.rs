//! Checkpoint archives.
//!
//! Checkpoints are hardcoded, externally distributed stored blocks used to
//! bootstrap a fresh header store near a wallet's birthday instead of
//! syncing headers from genesis. An archive carries a signature section
//! (read and preserved, not yet verified) and an ordered run of
//! compact-serialized stored blocks, in one of two encodings:
//!
//! - binary: `"CHECKPOINTS 1"` magic, big-endian `u32` signature count
//!   (at most 256), 65-byte ECDSA signatures, big-endian `u32` checkpoint
//!   count, then fixed-width record bodies;
//! - textual: `"TXT CHECKPOINTS 1"` line, signature count line, signature
//!   lines, checkpoint count line, then one unpadded Base64 record per
//!   line. US-ASCII, LF line endings.
//!
//! Both encodings digest to the same SHA-256 `data_hash`: the big-endian
//! checkpoint count followed by the raw record bytes. Signature bytes are
//! excluded so that re-signing an archive does not change its identity.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use alloy_primitives::B256;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::block::{RecordVersion, StoredBlock};
use crate::error::CheckpointError;
use crate::params::Params;
use crate::store::SpvBlockStore;

/// Magic prefix of a binary archive. No terminator follows it.
pub const BINARY_MAGIC: &[u8; 13] = b"CHECKPOINTS 1";

/// First line of a textual archive.
pub const TEXTUAL_MAGIC: &str = "TXT CHECKPOINTS 1";

const MAX_SIGNATURES: u32 = 256;
const SIGNATURE_LEN: usize = 65;

/// Wallet birthdays are pulled back by a week of clock-drift slack before
/// the checkpoint lookup.
const DRIFT_SLACK_SECS: u64 = 7 * 86_400;

/// A parsed checkpoint archive: stored blocks indexed by their header
/// timestamp, plus the archive's integrity digest and preserved
/// signature bytes.
pub struct CheckpointManager {
    params: Params,
    checkpoints: BTreeMap<u64, StoredBlock>,
    signatures: Vec<Vec<u8>>,
    data_hash: B256,
}

impl CheckpointManager {
    /// Reads an archive, sniffing the encoding from its first byte.
    pub fn read<R: Read>(params: Params, mut input: R) -> Result<Self, CheckpointError> {
        let mut data = Vec::new();
        input.read_to_end(&mut data)?;
        match data.first() {
            Some(b) if *b == BINARY_MAGIC[0] => Self::read_binary(params, &data),
            Some(b) if *b == TEXTUAL_MAGIC.as_bytes()[0] => Self::read_textual(params, &data),
            _ => Err(CheckpointError::BadMagic),
        }
    }

    fn read_binary(params: Params, data: &[u8]) -> Result<Self, CheckpointError> {
        if !data.starts_with(BINARY_MAGIC) {
            return Err(CheckpointError::BadMagic);
        }
        let mut pos = BINARY_MAGIC.len();

        let num_signatures = read_u32_be(data, &mut pos)?;
        if num_signatures > MAX_SIGNATURES {
            return Err(CheckpointError::TooManySignatures(num_signatures));
        }
        let mut signatures = Vec::with_capacity(num_signatures as usize);
        for _ in 0..num_signatures {
            let sig = data
                .get(pos..pos + SIGNATURE_LEN)
                .ok_or(CheckpointError::Truncated)?;
            signatures.push(sig.to_vec());
            pos += SIGNATURE_LEN;
        }

        // Everything from the checkpoint count onward is covered by the digest.
        let data_hash = sha256(&data[pos..]);

        let num_checkpoints = read_u32_be(data, &mut pos)?;
        if num_checkpoints == 0 {
            return Err(CheckpointError::Empty);
        }
        let remaining = data.len() - pos;
        let count = num_checkpoints as usize;
        if remaining % count != 0 {
            return Err(CheckpointError::Truncated);
        }
        let width = remaining / count;
        if width != RecordVersion::V1.body_len() && width != RecordVersion::V2.body_len() {
            return Err(CheckpointError::UnknownRecordLength(width));
        }

        let mut checkpoints = BTreeMap::new();
        for chunk in data[pos..].chunks_exact(width) {
            let block = StoredBlock::deserialize_compact(chunk)?;
            checkpoints.insert(block.header().time_secs(), block);
        }

        info!(
            count = checkpoints.len(),
            hash = %data_hash,
            "read binary checkpoint archive"
        );
        Ok(Self {
            params,
            checkpoints,
            signatures,
            data_hash,
        })
    }

    fn read_textual(params: Params, data: &[u8]) -> Result<Self, CheckpointError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| CheckpointError::BadLine("archive is not ASCII text".to_string()))?;
        let mut lines = text.lines();

        let magic = lines.next().ok_or(CheckpointError::Truncated)?;
        if magic != TEXTUAL_MAGIC {
            return Err(CheckpointError::BadMagic);
        }

        let num_signatures = parse_count(lines.next())?;
        if num_signatures > MAX_SIGNATURES {
            return Err(CheckpointError::TooManySignatures(num_signatures));
        }
        let mut signatures = Vec::with_capacity(num_signatures as usize);
        for _ in 0..num_signatures {
            let line = lines.next().ok_or(CheckpointError::Truncated)?;
            signatures.push(line.as_bytes().to_vec());
        }

        let num_checkpoints = parse_count(lines.next())?;
        if num_checkpoints == 0 {
            return Err(CheckpointError::Empty);
        }

        // Hash the count the way the binary form does, so both encodings of
        // the same sequence share a digest.
        let mut hasher = Sha256::new();
        hasher.update(num_checkpoints.to_be_bytes());
        let mut checkpoints = BTreeMap::new();
        for _ in 0..num_checkpoints {
            let line = lines.next().ok_or(CheckpointError::Truncated)?;
            let bytes = STANDARD_NO_PAD
                .decode(line)
                .map_err(|_| CheckpointError::BadLine(line.to_string()))?;
            hasher.update(&bytes);
            if bytes.len() != RecordVersion::V1.body_len()
                && bytes.len() != RecordVersion::V2.body_len()
            {
                return Err(CheckpointError::UnknownRecordLength(bytes.len()));
            }
            let block = StoredBlock::deserialize_compact(&bytes)?;
            checkpoints.insert(block.header().time_secs(), block);
        }
        let data_hash = B256::from(<[u8; 32]>::from(hasher.finalize()));

        info!(
            count = checkpoints.len(),
            hash = %data_hash,
            "read textual checkpoint archive"
        );
        Ok(Self {
            params,
            checkpoints,
            signatures,
            data_hash,
        })
    }

    /// Number of checkpoints loaded from the archive.
    pub fn num_checkpoints(&self) -> usize {
        self.checkpoints.len()
    }

    /// SHA-256 over the checkpoint count and record bytes.
    pub fn data_hash(&self) -> B256 {
        self.data_hash
    }

    /// The archive's signature section, byte for byte as read. Verification
    /// is not performed yet; the bytes are kept so a later signing scheme
    /// can check them.
    pub fn signatures(&self) -> &[Vec<u8>] {
        &self.signatures
    }

    /// The last checkpoint at or before `time_secs`, or the genesis block
    /// when no checkpoint is that old. `time_secs` must postdate genesis.
    pub fn checkpoint_before(&self, time_secs: u64) -> Result<StoredBlock, CheckpointError> {
        if time_secs <= self.params.genesis_block().time_secs() {
            return Err(CheckpointError::TimeBeforeGenesis(time_secs));
        }
        Ok(self
            .checkpoints
            .range(..=time_secs)
            .next_back()
            .map(|(_, block)| *block)
            .unwrap_or_else(|| self.params.genesis_stored()))
    }

    /// Like [`checkpoint_before`](Self::checkpoint_before), but also emits
    /// the checkpoint one height below it when the archive holds one.
    ///
    /// Litecoin's difficulty retarget looks a full interval back where
    /// Bitcoin looks one block less, so validators seeded from a
    /// transition-point checkpoint also need its direct predecessor. The
    /// result is ordered predecessor first, primary last.
    pub fn checkpoints_before(&self, time_secs: u64) -> Result<Vec<StoredBlock>, CheckpointError> {
        if time_secs <= self.params.genesis_block().time_secs() {
            return Err(CheckpointError::TimeBeforeGenesis(time_secs));
        }
        let primary = self
            .checkpoints
            .range(..=time_secs)
            .next_back()
            .map(|(_, block)| *block);
        let Some(primary) = primary else {
            return Ok(vec![self.params.genesis_stored()]);
        };
        let mut out = Vec::with_capacity(2);
        if let Some(companion) = self.block_at_height(primary.height() - 1) {
            out.push(companion);
        }
        out.push(primary);
        Ok(out)
    }

    fn block_at_height(&self, height: i32) -> Option<StoredBlock> {
        self.checkpoints
            .values()
            .find(|block| block.height() == height)
            .copied()
    }

    /// One-shot store seeding: reads the archive, picks the checkpoints
    /// preceding `time_secs` less a week of drift slack, inserts them, and
    /// points the chain head at the last one. Meant for freshly created
    /// stores.
    pub fn checkpoint<R: Read>(
        params: &Params,
        input: R,
        store: &SpvBlockStore,
        time_secs: u64,
    ) -> Result<(), CheckpointError> {
        let adjusted = time_secs.saturating_sub(DRIFT_SLACK_SECS);
        if adjusted == 0 {
            return Err(CheckpointError::TimeBeforeGenesis(time_secs));
        }
        info!(time = adjusted, "seeding block store from checkpoint archive");

        let manager = Self::read(params.clone(), input)?;
        let blocks = manager.checkpoints_before(adjusted)?;
        let last = blocks.len() - 1;
        for (i, block) in blocks.iter().enumerate() {
            store.put(block)?;
            if i == last {
                store.set_chain_head(block)?;
            }
        }
        Ok(())
    }
}

/// Writes a binary archive with an empty signature section and returns the
/// data hash. Records share one width: V1 when every block's work fits,
/// V2 otherwise.
///
/// Blocks must be ordered by height, the order the checkpoint builder
/// collects them in.
pub fn write_binary_checkpoints<W: Write>(
    checkpoints: &[StoredBlock],
    mut out: W,
) -> Result<B256, CheckpointError> {
    if checkpoints.is_empty() {
        return Err(CheckpointError::Empty);
    }
    let version = uniform_version(checkpoints);

    out.write_all(BINARY_MAGIC)?;
    out.write_all(&0u32.to_be_bytes())?; // Signatures are appended by a separate signing step.

    let mut hasher = Sha256::new();
    let count = checkpoints.len() as u32;
    out.write_all(&count.to_be_bytes())?;
    hasher.update(count.to_be_bytes());

    let mut buf = vec![0u8; version.body_len()];
    for block in checkpoints {
        block.serialize_compact(version, &mut buf)?;
        out.write_all(&buf)?;
        hasher.update(&buf);
    }
    Ok(B256::from(<[u8; 32]>::from(hasher.finalize())))
}

/// Writes a textual archive with an empty signature section and returns
/// the data hash. Each record uses the narrowest version that holds its
/// work, so archives spanning the V1 work ceiling stay readable.
pub fn write_textual_checkpoints<W: Write>(
    checkpoints: &[StoredBlock],
    mut out: W,
) -> Result<B256, CheckpointError> {
    if checkpoints.is_empty() {
        return Err(CheckpointError::Empty);
    }

    writeln!(out, "{TEXTUAL_MAGIC}")?;
    writeln!(out, "0")?;
    writeln!(out, "{}", checkpoints.len())?;

    let mut hasher = Sha256::new();
    hasher.update((checkpoints.len() as u32).to_be_bytes());
    for block in checkpoints {
        let version = block.narrowest_version();
        let mut buf = vec![0u8; version.body_len()];
        block.serialize_compact(version, &mut buf)?;
        hasher.update(&buf);
        writeln!(out, "{}", STANDARD_NO_PAD.encode(&buf))?;
    }
    Ok(B256::from(<[u8; 32]>::from(hasher.finalize())))
}

fn uniform_version(checkpoints: &[StoredBlock]) -> RecordVersion {
    if checkpoints
        .iter()
        .all(|block| block.narrowest_version() == RecordVersion::V1)
    {
        RecordVersion::V1
    } else {
        RecordVersion::V2
    }
}

fn sha256(data: &[u8]) -> B256 {
    B256::from(<[u8; 32]>::from(Sha256::digest(data)))
}

fn read_u32_be(data: &[u8], pos: &mut usize) -> Result<u32, CheckpointError> {
    let bytes = data.get(*pos..*pos + 4).ok_or(CheckpointError::Truncated)?;
    *pos += 4;
    Ok(u32::from_be_bytes(bytes.try_into().expect("4 bytes")))
}

fn parse_count(line: Option<&str>) -> Result<u32, CheckpointError> {
    let line = line.ok_or(CheckpointError::Truncated)?;
    line.trim()
        .parse::<u32>()
        .map_err(|_| CheckpointError::BadLine(line.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockHeader;
    use crate::store::StoreOptions;
    use alloy_primitives::{B256, U256};
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path() -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time moves forward")
            .as_nanos();
        let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
        let mut path = std::env::temp_dir();
        path.push(format!(
            "spvstore-checkpoint-test-{now}-{}-{suffix}",
            std::process::id()
        ));
        path
    }

    fn params() -> Params {
        Params::unit_test()
    }

    /// Genesis plus `n` blocks, ten minutes apart.
    fn chain(n: usize) -> Vec<StoredBlock> {
        let mut blocks = vec![params().genesis_stored()];
        for i in 0..n {
            let prev = blocks[blocks.len() - 1];
            blocks.push(prev.build(BlockHeader {
                version: 1,
                prev_hash: prev.hash(),
                merkle_root: B256::ZERO,
                time: prev.header().time + 600,
                bits: prev.header().bits,
                nonce: i as u32 + 1,
            }));
        }
        blocks
    }

    #[test]
    fn binary_roundtrip() {
        let blocks = chain(3);
        let checkpoints = &blocks[1..];

        let mut bytes = Vec::new();
        let written_hash = write_binary_checkpoints(checkpoints, &mut bytes).expect("write");

        let manager = CheckpointManager::read(params(), bytes.as_slice()).expect("read");
        assert_eq!(manager.num_checkpoints(), 3);
        assert_eq!(manager.data_hash(), written_hash);
        assert!(manager.signatures().is_empty());

        let tip = checkpoints[2];
        let got = manager
            .checkpoint_before(tip.header().time_secs())
            .expect("lookup");
        assert_eq!(got, tip);
    }

    #[test]
    fn textual_roundtrip_matches_binary_digest() {
        let blocks = chain(3);
        let checkpoints = &blocks[1..];

        let mut binary = Vec::new();
        let binary_hash = write_binary_checkpoints(checkpoints, &mut binary).expect("write");

        let mut textual = Vec::new();
        let textual_hash = write_textual_checkpoints(checkpoints, &mut textual).expect("write");
        assert_eq!(binary_hash, textual_hash);

        let manager = CheckpointManager::read(params(), textual.as_slice()).expect("read");
        assert_eq!(manager.data_hash(), binary_hash);
        assert_eq!(manager.num_checkpoints(), 3);
    }

    #[test]
    fn textual_carries_wide_work_records() {
        let blocks = chain(2);
        let wide = StoredBlock::new(*blocks[2].header(), U256::from(1u8) << 100, 2);
        let checkpoints = vec![blocks[1], wide];

        let mut textual = Vec::new();
        write_textual_checkpoints(&checkpoints, &mut textual).expect("write");

        let manager = CheckpointManager::read(params(), textual.as_slice()).expect("read");
        let got = manager
            .checkpoint_before(wide.header().time_secs())
            .expect("lookup");
        assert_eq!(got.chain_work(), U256::from(1u8) << 100);
    }

    #[test]
    fn checkpoint_before_picks_floor_entry() {
        let blocks = chain(4);
        let mut bytes = Vec::new();
        write_textual_checkpoints(&blocks[1..], &mut bytes).expect("write");
        let manager = CheckpointManager::read(params(), bytes.as_slice()).expect("read");

        // Between the second and third checkpoints: the second wins.
        let between = blocks[2].header().time_secs() + 1;
        assert_eq!(manager.checkpoint_before(between).expect("lookup"), blocks[2]);

        // Before the first checkpoint but after genesis: genesis.
        let early = blocks[1].header().time_secs() - 1;
        let got = manager.checkpoint_before(early).expect("lookup");
        assert_eq!(got, params().genesis_stored());
    }

    #[test]
    fn checkpoints_before_emits_predecessor_companion() {
        let blocks = chain(4);
        let mut bytes = Vec::new();
        write_textual_checkpoints(&blocks[1..], &mut bytes).expect("write");
        let manager = CheckpointManager::read(params(), bytes.as_slice()).expect("read");

        let at = blocks[3].header().time_secs();
        let picked = manager.checkpoints_before(at).expect("lookup");
        assert_eq!(picked, vec![blocks[2], blocks[3]]);

        // The height-1 block is missing from an archive holding only the tip.
        let mut tip_only = Vec::new();
        write_textual_checkpoints(&blocks[3..=3], &mut tip_only).expect("write");
        let manager = CheckpointManager::read(params(), tip_only.as_slice()).expect("read");
        let picked = manager.checkpoints_before(at).expect("lookup");
        assert_eq!(picked, vec![blocks[3]]);

        // Nothing old enough: genesis alone.
        let picked = manager
            .checkpoints_before(blocks[1].header().time_secs())
            .expect("lookup");
        assert_eq!(picked, vec![params().genesis_stored()]);
    }

    #[test]
    fn lookup_rejects_pre_genesis_time() {
        let blocks = chain(1);
        let mut bytes = Vec::new();
        write_textual_checkpoints(&blocks[1..], &mut bytes).expect("write");
        let manager = CheckpointManager::read(params(), bytes.as_slice()).expect("read");

        let genesis_time = params().genesis_block().time_secs();
        assert!(matches!(
            manager.checkpoint_before(genesis_time),
            Err(CheckpointError::TimeBeforeGenesis(_))
        ));
    }

    #[test]
    fn seeder_installs_checkpoints_and_head() {
        let blocks = chain(4);
        let mut bytes = Vec::new();
        write_textual_checkpoints(&blocks[1..], &mut bytes).expect("write");

        let path = temp_path();
        let store = StoreOptions::new()
            .capacity(32)
            .open(params(), &path)
            .expect("open");

        // Birthday lands just past block 3 once the week of slack comes off.
        let birthday = blocks[3].header().time_secs() + DRIFT_SLACK_SECS + 1;
        CheckpointManager::checkpoint(&params(), bytes.as_slice(), &store, birthday)
            .expect("seed");

        assert_eq!(store.chain_head().expect("chain head"), blocks[3]);
        assert_eq!(store.get(blocks[2].hash()).expect("get"), Some(blocks[2]));
        // Only the companion and the head were seeded.
        assert_eq!(store.get(blocks[1].hash()).expect("get"), None);
        store.close().expect("close");

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn binary_signature_section_is_preserved_and_unhashed() {
        let blocks = chain(2);
        let mut plain = Vec::new();
        let plain_hash = write_binary_checkpoints(&blocks[1..], &mut plain).expect("write");

        // Splice two dummy signatures into the empty signature section.
        let body = &plain[BINARY_MAGIC.len() + 4..];
        let mut signed = Vec::new();
        signed.extend_from_slice(BINARY_MAGIC);
        signed.extend_from_slice(&2u32.to_be_bytes());
        signed.extend_from_slice(&[0xabu8; SIGNATURE_LEN]);
        signed.extend_from_slice(&[0xcdu8; SIGNATURE_LEN]);
        signed.extend_from_slice(body);

        let manager = CheckpointManager::read(params(), signed.as_slice()).expect("read");
        assert_eq!(manager.signatures().len(), 2);
        assert_eq!(manager.signatures()[0], vec![0xabu8; SIGNATURE_LEN]);
        assert_eq!(manager.data_hash(), plain_hash);
    }

    #[test]
    fn textual_signature_lines_are_skipped_but_kept() {
        let blocks = chain(1);
        let mut record = Vec::new();
        let hash = write_textual_checkpoints(&blocks[1..], &mut record).expect("write");
        let text = String::from_utf8(record).expect("ascii");
        let record_line = text.lines().last().expect("record line").to_string();

        let signed = format!(
            "{TEXTUAL_MAGIC}\n2\nsig-one\nsig-two\n1\n{record_line}\n"
        );
        let manager = CheckpointManager::read(params(), signed.as_bytes()).expect("read");
        assert_eq!(manager.num_checkpoints(), 1);
        assert_eq!(manager.signatures().len(), 2);
        assert_eq!(manager.signatures()[0], b"sig-one".to_vec());
        assert_eq!(manager.data_hash(), hash);
    }

    #[test]
    fn malformed_archives_are_rejected() {
        assert!(matches!(
            CheckpointManager::read(params(), &b"JUNKDATA"[..]),
            Err(CheckpointError::BadMagic)
        ));

        let blocks = chain(2);
        let mut binary = Vec::new();
        write_binary_checkpoints(&blocks[1..], &mut binary).expect("write");

        // Chop a few bytes off the record tail.
        let truncated = &binary[..binary.len() - 5];
        assert!(matches!(
            CheckpointManager::read(params(), truncated),
            Err(CheckpointError::Truncated)
        ));

        // Zero checkpoints.
        let mut empty = Vec::new();
        empty.extend_from_slice(BINARY_MAGIC);
        empty.extend_from_slice(&0u32.to_be_bytes());
        empty.extend_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            CheckpointManager::read(params(), empty.as_slice()),
            Err(CheckpointError::Empty)
        ));

        // A record width that matches no version.
        let bogus = format!(
            "{TEXTUAL_MAGIC}\n0\n1\n{}\n",
            STANDARD_NO_PAD.encode([0u8; 50])
        );
        assert!(matches!(
            CheckpointManager::read(params(), bogus.as_bytes()),
            Err(CheckpointError::UnknownRecordLength(50))
        ));

        // An oversized signature count.
        let toomany = format!("{TEXTUAL_MAGIC}\n257\n");
        assert!(matches!(
            CheckpointManager::read(params(), toomany.as_bytes()),
            Err(CheckpointError::TooManySignatures(257))
        ));
    }
}
