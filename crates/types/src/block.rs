//! Block and BlockHeader types for consensus.

use crate::{
    header_sign_message, BlockIndex, Hash, Signature, Transaction, ValidatorIndex,
};
use sbor::prelude::*;

/// Current block format version.
pub const BLOCK_VERSION: u32 = 0;

/// Block header containing consensus metadata.
///
/// The header is what validators commit to. During a round each proposal
/// slot carries a partially filled header (index, version, previous hash,
/// and primary index preset); the proposing primary's timestamp, nonce, and
/// the transaction merkle root are stamped in when its PrepareRequest is
/// accepted, after which the header is final and commit signatures cover it.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct BlockHeader {
    /// Block format version.
    pub version: u32,

    /// Position of this block in the chain.
    pub index: BlockIndex,

    /// Hash of the previous block.
    pub prev_hash: Hash,

    /// Merkle root over the proposed transaction hashes, in proposal order.
    pub merkle_root: Hash,

    /// Unix timestamp (milliseconds) chosen by the proposing primary.
    pub timestamp_ms: u64,

    /// Random nonce chosen by the proposing primary.
    pub nonce: u64,

    /// Index of the validator whose proposal produced this block.
    pub primary_index: ValidatorIndex,
}

impl BlockHeader {
    /// Compute the header hash.
    pub fn hash(&self) -> Hash {
        let bytes = basic_encode(self).expect("header serialization should never fail");
        Hash::from_bytes(&bytes)
    }

    /// The message commit signatures cover for this header on the given network.
    pub fn sign_data(&self, network: u32) -> Vec<u8> {
        header_sign_message(network, &self.hash())
    }
}

/// A finalized block: header, ordered transactions, and the quorum witness.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Block {
    /// The finalized header.
    pub header: BlockHeader,

    /// Transactions in proposal order.
    pub transactions: Vec<Transaction>,

    /// Commit signatures from a safety quorum, sorted by validator index.
    pub witness: Vec<(ValidatorIndex, Signature)>,
}

impl Block {
    /// Compute the block hash (the header hash).
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Encoded size in bytes, as counted against the block size limit.
    pub fn size(&self) -> usize {
        basic_encode(self)
            .map(|bytes| bytes.len())
            .unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header(nonce: u64) -> BlockHeader {
        BlockHeader {
            version: BLOCK_VERSION,
            index: BlockIndex(100),
            prev_hash: Hash::from_bytes(b"prev"),
            merkle_root: Hash::from_bytes(b"root"),
            timestamp_ms: 1_700_000_000_000,
            nonce,
            primary_index: ValidatorIndex(0),
        }
    }

    #[test]
    fn test_header_hash_changes_with_contents() {
        assert_eq!(make_header(1).hash(), make_header(1).hash());
        assert_ne!(make_header(1).hash(), make_header(2).hash());
    }

    #[test]
    fn test_sign_data_binds_network() {
        let header = make_header(1);
        assert_ne!(header.sign_data(0x4e454f01), header.sign_data(0x4e454f02));
    }

    #[test]
    fn test_block_hash_is_header_hash() {
        let header = make_header(1);
        let block = Block {
            header: header.clone(),
            transactions: vec![],
            witness: vec![],
        };
        assert_eq!(block.hash(), header.hash());
    }
}
