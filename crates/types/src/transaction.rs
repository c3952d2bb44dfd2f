//! Transaction type.
//!
//! Consensus treats transactions as mostly-opaque payloads: it orders them,
//! enforces aggregate policy limits (fees, block size), and checks the
//! expiry window. Full semantic verification belongs to the mempool and
//! execution layers.

use crate::{BlockIndex, Hash, ScriptHash};
use sbor::prelude::*;

/// A user transaction.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Transaction {
    /// Random nonce distinguishing otherwise-identical transactions.
    pub nonce: u64,

    /// Script hash of the account that submitted and paid for this transaction.
    pub sender: ScriptHash,

    /// Fee charged for on-chain execution, in the smallest fee unit.
    pub system_fee: u64,

    /// Fee paid for network priority, in the smallest fee unit.
    pub network_fee: u64,

    /// Last block index at which this transaction may be included.
    pub valid_until: BlockIndex,

    /// Opaque invocation payload.
    pub data: Vec<u8>,
}

impl Transaction {
    /// Compute the transaction hash.
    pub fn hash(&self) -> Hash {
        let bytes = basic_encode(self).expect("transaction serialization should never fail");
        Hash::from_bytes(&bytes)
    }

    /// Encoded size in bytes, as counted against the block size limit.
    pub fn size(&self) -> usize {
        basic_encode(self)
            .map(|bytes| bytes.len())
            .unwrap_or(usize::MAX)
    }
}
