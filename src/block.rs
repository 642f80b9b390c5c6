//! Block headers and the fixed-width stored-block record codec.

use alloy_primitives::{B256, U256};
use sha2::{Digest, Sha256};

use crate::error::{BlockStoreError, RecordError};
use crate::store::SpvBlockStore;

/// Width of a serialized block header.
pub const HEADER_SIZE: usize = 80;

/// Stored-block record versions. The versions differ only in the width of
/// the cumulative-work field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordVersion {
    /// 12-byte work field, 96-byte record body.
    V1,
    /// 32-byte work field, 116-byte record body.
    V2,
}

impl RecordVersion {
    /// Width of the work field in bytes.
    pub const fn work_len(self) -> usize {
        match self {
            RecordVersion::V1 => 12,
            RecordVersion::V2 => 32,
        }
    }

    /// Width of a serialized record body: work, height, header.
    pub const fn body_len(self) -> usize {
        self.work_len() + 4 + HEADER_SIZE
    }

    const fn name(self) -> &'static str {
        match self {
            RecordVersion::V1 => "v1",
            RecordVersion::V2 => "v2",
        }
    }
}

/// An 80-byte block header.
///
/// Hashes are kept in display order (big-endian, the way block explorers
/// print them); the wire encoding reverses them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: B256,
    pub merkle_root: B256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Serializes the header into its 80-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&reversed(&self.prev_hash));
        out[36..68].copy_from_slice(&reversed(&self.merkle_root));
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Parses an 80-byte wire-form header.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() != HEADER_SIZE {
            return Err(RecordError::UnexpectedLength {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&bytes[4..36]);
        prev.reverse();
        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(&bytes[36..68]);
        merkle.reverse();
        Ok(Self {
            version: i32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes")),
            prev_hash: B256::from(prev),
            merkle_root: B256::from(merkle),
            time: u32::from_le_bytes(bytes[68..72].try_into().expect("4 bytes")),
            bits: u32::from_le_bytes(bytes[72..76].try_into().expect("4 bytes")),
            nonce: u32::from_le_bytes(bytes[76..80].try_into().expect("4 bytes")),
        })
    }

    /// The header's identity: double SHA-256 of the wire form, in display
    /// order.
    pub fn hash(&self) -> B256 {
        let first = Sha256::digest(self.encode());
        let mut second: [u8; 32] = Sha256::digest(first).into();
        second.reverse();
        B256::from(second)
    }

    /// Proof-of-work contributed by a block at this header's difficulty.
    pub fn work(&self) -> U256 {
        let target = decode_compact_target(self.bits);
        if target.is_zero() || target == U256::MAX {
            return U256::ZERO;
        }
        // floor(2^256 / (target + 1)), computed in 256-bit arithmetic.
        (!target / (target + U256::from(1u8))) + U256::from(1u8)
    }

    /// Header timestamp in seconds since the epoch.
    pub fn time_secs(&self) -> u64 {
        u64::from(self.time)
    }
}

/// Expands a compact-bits (nBits) difficulty encoding into a full target.
///
/// Encodings with the sign bit set, or that would not fit 256 bits, decode
/// to zero.
pub fn decode_compact_target(bits: u32) -> U256 {
    let size = (bits >> 24) as usize;
    let word = bits & 0x007f_ffff;
    let overflow = word != 0
        && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));
    if bits & 0x0080_0000 != 0 || overflow {
        return U256::ZERO;
    }
    if size <= 3 {
        U256::from(word >> (8 * (3 - size)))
    } else {
        U256::from(word) << (8 * (size - 3))
    }
}

/// A block header annotated with its position in the chain: the cumulative
/// work of the chain ending at this block, and its height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredBlock {
    header: BlockHeader,
    chain_work: U256,
    height: i32,
}

impl StoredBlock {
    pub fn new(header: BlockHeader, chain_work: U256, height: i32) -> Self {
        Self {
            header,
            chain_work,
            height,
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn chain_work(&self) -> U256 {
        self.chain_work
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    /// The identity hash of the underlying header.
    pub fn hash(&self) -> B256 {
        self.header.hash()
    }

    /// Creates the stored block for a header building directly on this one.
    pub fn build(&self, header: BlockHeader) -> StoredBlock {
        StoredBlock {
            header,
            chain_work: self.chain_work.saturating_add(header.work()),
            height: self.height + 1,
        }
    }

    /// Fetches this block's predecessor from the store, if it is retained.
    pub fn prev(&self, store: &SpvBlockStore) -> Result<Option<StoredBlock>, BlockStoreError> {
        store.get(self.header.prev_hash)
    }

    /// Encodes the record body (work, height, header) at the given version.
    ///
    /// `buf` must be exactly `version.body_len()` bytes. Fails when the
    /// chain work does not fit the version's work field.
    pub fn serialize_compact(
        &self,
        version: RecordVersion,
        buf: &mut [u8],
    ) -> Result<(), RecordError> {
        let body = version.body_len();
        if buf.len() != body {
            return Err(RecordError::UnexpectedLength {
                expected: body,
                actual: buf.len(),
            });
        }
        let work_len = version.work_len();
        if self.chain_work.bit_len() > work_len * 8 {
            return Err(RecordError::ChainWorkOverflow(version.name()));
        }
        let work = self.chain_work.to_be_bytes::<32>();
        buf[..work_len].copy_from_slice(&work[32 - work_len..]);
        buf[work_len..work_len + 4].copy_from_slice(&self.height.to_be_bytes());
        buf[work_len + 4..].copy_from_slice(&self.header.encode());
        Ok(())
    }

    /// Decodes a record body, discriminating the version by length.
    pub fn deserialize_compact(buf: &[u8]) -> Result<StoredBlock, RecordError> {
        let version = match buf.len() {
            n if n == RecordVersion::V1.body_len() => RecordVersion::V1,
            n if n == RecordVersion::V2.body_len() => RecordVersion::V2,
            n => {
                return Err(RecordError::UnexpectedLength {
                    expected: RecordVersion::V2.body_len(),
                    actual: n,
                })
            }
        };
        let work_len = version.work_len();
        let chain_work = U256::from_be_slice(&buf[..work_len]);
        let height = i32::from_be_bytes(buf[work_len..work_len + 4].try_into().expect("4 bytes"));
        let header = BlockHeader::decode(&buf[work_len + 4..])?;
        Ok(StoredBlock {
            header,
            chain_work,
            height,
        })
    }

    /// The record version with the narrowest work field that can hold this
    /// block's chain work.
    pub fn narrowest_version(&self) -> RecordVersion {
        if self.chain_work.bit_len() <= RecordVersion::V1.work_len() * 8 {
            RecordVersion::V1
        } else {
            RecordVersion::V2
        }
    }
}

fn reversed(hash: &B256) -> [u8; 32] {
    let mut out: [u8; 32] = hash.0;
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Params;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 2,
            prev_hash: B256::from([0x11u8; 32]),
            merkle_root: B256::from([0x22u8; 32]),
            time: 1_400_000_000,
            bits: 0x1e0f_fff0,
            nonce: 42,
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = sample_header();
        let encoded = header.encode();
        let decoded = BlockHeader::decode(&encoded).expect("decode");
        assert_eq!(header, decoded);
    }

    #[test]
    fn header_decode_rejects_bad_length() {
        assert!(matches!(
            BlockHeader::decode(&[0u8; 79]),
            Err(RecordError::UnexpectedLength { .. })
        ));
    }

    #[test]
    fn genesis_hashes_match_known_constants() {
        let mainnet = Params::mainnet();
        assert_eq!(
            mainnet.genesis_block().hash(),
            mainnet.genesis_hash(),
            "mainnet genesis header must hash to its published value"
        );
        let testnet = Params::testnet();
        assert_eq!(testnet.genesis_block().hash(), testnet.genesis_hash());
    }

    #[test]
    fn easiest_target_work_is_two() {
        let mut header = sample_header();
        header.bits = 0x207f_ffff;
        assert_eq!(header.work(), U256::from(2u8));
    }

    #[test]
    fn compact_target_small_sizes() {
        assert_eq!(decode_compact_target(0x0100_0012), U256::ZERO);
        assert_eq!(decode_compact_target(0x0200_1200), U256::from(0x12u8));
        assert_eq!(decode_compact_target(0x0312_3456), U256::from(0x0012_3456u32));
        assert_eq!(decode_compact_target(0x0080_0000), U256::ZERO);
    }

    #[test]
    fn record_roundtrip_both_versions() {
        let block = StoredBlock::new(sample_header(), U256::from(123_456_789u64), 7);
        for version in [RecordVersion::V1, RecordVersion::V2] {
            let mut buf = vec![0u8; version.body_len()];
            block.serialize_compact(version, &mut buf).expect("encode");
            let decoded = StoredBlock::deserialize_compact(&buf).expect("decode");
            assert_eq!(block, decoded);
        }
    }

    #[test]
    fn v1_rejects_oversized_work() {
        let work = U256::from(1u8) << 96;
        let block = StoredBlock::new(sample_header(), work, 7);
        let mut buf = vec![0u8; RecordVersion::V1.body_len()];
        assert!(matches!(
            block.serialize_compact(RecordVersion::V1, &mut buf),
            Err(RecordError::ChainWorkOverflow(_))
        ));

        // The ceiling itself still fits.
        let block = StoredBlock::new(sample_header(), work - U256::from(1u8), 7);
        block
            .serialize_compact(RecordVersion::V1, &mut buf)
            .expect("2^96 - 1 fits v1");
        let decoded = StoredBlock::deserialize_compact(&buf).expect("decode");
        assert_eq!(decoded.chain_work(), work - U256::from(1u8));
    }

    #[test]
    fn deserialize_rejects_unknown_width() {
        assert!(matches!(
            StoredBlock::deserialize_compact(&[0u8; 100]),
            Err(RecordError::UnexpectedLength { .. })
        ));
    }

    #[test]
    fn build_extends_height_and_work() {
        let params = Params::unit_test();
        let genesis = params.genesis_stored();
        let next = BlockHeader {
            version: 1,
            prev_hash: genesis.hash(),
            merkle_root: B256::ZERO,
            time: genesis.header().time + 600,
            bits: genesis.header().bits,
            nonce: 1,
        };
        let built = genesis.build(next);
        assert_eq!(built.height(), 1);
        assert_eq!(
            built.chain_work(),
            genesis.chain_work() + next.work()
        );
        assert_eq!(built.header().prev_hash, genesis.hash());
    }
}
