//! Consensus configuration.

/// Consensus protocol configuration.
///
/// The policy caps mirror the network's policy contract; every honest node
/// runs with the same values, so a proposal that violates them is rejected
/// identically everywhere.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Network magic number, mixed into every signature domain.
    pub network: u32,

    /// Target interval between blocks, in milliseconds. Also the unit all
    /// round-timer arithmetic is expressed in.
    pub ms_per_block: u64,

    /// Maximum transactions a proposal may carry.
    pub max_transactions_per_block: usize,

    /// Maximum encoded block size in bytes.
    pub max_block_size: usize,

    /// Maximum combined system fee of a block, in the smallest fee unit.
    pub max_block_system_fee: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            network: 0x5444_4e31, // "TDN1"
            ms_per_block: 15_000,
            max_transactions_per_block: 512,
            max_block_size: 262_144,
            max_block_system_fee: 900_000_000_000,
        }
    }
}

impl ConsensusConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the network magic number.
    pub fn with_network(mut self, network: u32) -> Self {
        self.network = network;
        self
    }

    /// Set the block interval in milliseconds.
    pub fn with_ms_per_block(mut self, ms: u64) -> Self {
        self.ms_per_block = ms;
        self
    }

    /// Set the maximum transactions per block.
    pub fn with_max_transactions(mut self, max: usize) -> Self {
        self.max_transactions_per_block = max;
        self
    }

    /// Set the maximum encoded block size.
    pub fn with_max_block_size(mut self, max: usize) -> Self {
        self.max_block_size = max;
        self
    }

    /// Set the maximum combined system fee per block.
    pub fn with_max_block_system_fee(mut self, max: u64) -> Self {
        self.max_block_system_fee = max;
        self
    }
}
