//! Shared test fixtures.
//!
//! - [`TestValidators`]: a deterministic committee with signing keys
//! - [`MemoryMempool`] / [`MemoryLedger`] / [`MemoryStateStore`]: in-memory
//!   collaborator implementations for driving the state machine in tests
//! - [`fixtures`]: signed envelope and transaction builders

use std::collections::HashSet;
use std::sync::Mutex;
use tandem_core::{ChainTip, ConsensusSnapshot, ConsensusStateStore, LedgerView, MempoolView};
use tandem_types::{keypair_from_seed, BlockIndex, Hash, PrivateKey, PublicKey, Transaction};

pub mod fixtures;

/// A deterministic committee of validators for tests.
///
/// Keys are derived from fixed seeds, so committee `i` is the same across
/// runs and across test binaries.
pub struct TestValidators {
    keys: Vec<PrivateKey>,
}

impl TestValidators {
    /// Create a committee of `n` validators.
    pub fn new(n: usize) -> Self {
        let keys = (0..n)
            .map(|i| keypair_from_seed(&[i as u8 + 1; 32]))
            .collect();
        Self { keys }
    }

    /// Committee size.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the committee is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Signing key of validator `index`.
    pub fn key(&self, index: usize) -> &PrivateKey {
        &self.keys[index]
    }

    /// A fresh copy of validator `index`'s signing key.
    pub fn key_clone(&self, index: usize) -> PrivateKey {
        let seed = [index as u8 + 1; 32];
        keypair_from_seed(&seed)
    }

    /// Public keys in committee order.
    pub fn public_keys(&self) -> Vec<PublicKey> {
        self.keys.iter().map(|k| k.public_key()).collect()
    }
}

/// In-memory mempool with separate verified and unverified pools.
#[derive(Default)]
pub struct MemoryMempool {
    inner: Mutex<MempoolInner>,
}

#[derive(Default)]
struct MempoolInner {
    verified: Vec<Transaction>,
    unverified: Vec<Transaction>,
}

impl MemoryMempool {
    /// An empty mempool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transaction to the verified pool.
    pub fn add_verified(&self, tx: Transaction) {
        self.inner.lock().unwrap().verified.push(tx);
    }

    /// Add a transaction to the unverified pool.
    pub fn add_unverified(&self, tx: Transaction) {
        self.inner.lock().unwrap().unverified.push(tx);
    }
}

impl MempoolView for MemoryMempool {
    fn verified_transactions(&self) -> Vec<Transaction> {
        self.inner.lock().unwrap().verified.clone()
    }

    fn try_get(&self, hash: &Hash) -> Option<(Transaction, bool)> {
        let inner = self.inner.lock().unwrap();
        if let Some(tx) = inner.verified.iter().find(|tx| tx.hash() == *hash) {
            return Some((tx.clone(), true));
        }
        inner
            .unverified
            .iter()
            .find(|tx| tx.hash() == *hash)
            .map(|tx| (tx.clone(), false))
    }
}

/// In-memory ledger view: a chain tip plus the set of finalized tx hashes.
pub struct MemoryLedger {
    inner: Mutex<LedgerInner>,
}

struct LedgerInner {
    tip: ChainTip,
    finalized: HashSet<Hash>,
}

impl MemoryLedger {
    /// A ledger whose tip is the given position.
    pub fn new(tip: ChainTip) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                tip,
                finalized: HashSet::new(),
            }),
        }
    }

    /// A ledger positioned so the next height is `next_index`.
    pub fn at_height(next_index: u32, timestamp_ms: u64) -> Self {
        Self::new(ChainTip {
            index: BlockIndex(next_index - 1),
            hash: Hash::from_bytes(&next_index.to_le_bytes()),
            timestamp_ms,
        })
    }

    /// Move the tip.
    pub fn set_tip(&self, tip: ChainTip) {
        self.inner.lock().unwrap().tip = tip;
    }

    /// Mark a transaction as finalized on chain.
    pub fn insert_transaction(&self, hash: Hash) {
        self.inner.lock().unwrap().finalized.insert(hash);
    }
}

impl LedgerView for MemoryLedger {
    fn tip(&self) -> ChainTip {
        self.inner.lock().unwrap().tip
    }

    fn contains_transaction(&self, hash: &Hash) -> bool {
        self.inner.lock().unwrap().finalized.contains(hash)
    }
}

/// In-memory snapshot store.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Option<ConsensusSnapshot>>,
}

impl MemoryStateStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsensusStateStore for MemoryStateStore {
    fn save(&self, snapshot: &ConsensusSnapshot) {
        *self.inner.lock().unwrap() = Some(snapshot.clone());
    }

    fn load(&self) -> Option<ConsensusSnapshot> {
        self.inner.lock().unwrap().clone()
    }
}
