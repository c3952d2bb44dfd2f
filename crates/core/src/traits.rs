//! Core traits: the state machine and its external collaborators.
//!
//! The consensus core owns no I/O. Peers, the task manager, the ledger
//! write path, and persistence are all reached through returned actions;
//! the mempool and ledger read paths are synchronous snapshot views
//! injected at construction.

use crate::{Action, Event};
use sbor::prelude::*;
use std::time::Duration;
use tandem_messages::Envelope;
use tandem_types::{BlockIndex, Hash, Transaction, ViewNumber};

/// A state machine that processes events.
///
/// All consensus logic is implemented as a state machine that is:
///
/// - **Synchronous**: No async, no `.await`
/// - **Deterministic**: Same state + event = same actions
/// - **Pure-ish**: Mutates self, but performs no I/O
pub trait StateMachine {
    /// Process an event, returning actions for the runner to execute.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Set the current time.
    ///
    /// Called by the runner before each `handle()` call to provide the
    /// current wall-clock or simulation time.
    fn set_time(&mut self, now: Duration);

    /// Get the time that was last set via `set_time()`.
    fn now(&self) -> Duration;
}

/// Snapshot view of the mempool.
///
/// Reads must be cheap, synchronous, and non-blocking: they run inside
/// consensus message handlers.
pub trait MempoolView: Send + Sync {
    /// Transactions that passed full verification, in fee-priority order.
    fn verified_transactions(&self) -> Vec<Transaction>;

    /// Look up a transaction in either pool (verified or unverified).
    ///
    /// Returns the transaction and whether it came from the verified pool.
    fn try_get(&self, hash: &Hash) -> Option<(Transaction, bool)>;
}

/// The ledger position consensus builds on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    /// Index of the latest persisted block.
    pub index: BlockIndex,

    /// Hash of the latest persisted block.
    pub hash: Hash,

    /// Timestamp of the latest persisted block (milliseconds).
    pub timestamp_ms: u64,
}

/// Snapshot view of the finalized ledger.
pub trait LedgerView: Send + Sync {
    /// The latest persisted block's position.
    fn tip(&self) -> ChainTip;

    /// Whether a transaction is already finalized on chain.
    fn contains_transaction(&self, hash: &Hash) -> bool;
}

/// The node's signed round state, persisted for crash recovery.
///
/// Holds exactly the envelopes this node has signed for the current round.
/// On restart they are replayed verbatim - never re-signed - so a recovered
/// node reissues the same Commit instead of signing a conflicting one.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ConsensusSnapshot {
    /// Height the round belongs to.
    pub block_index: BlockIndex,

    /// View the envelopes were signed in.
    pub view_number: ViewNumber,

    /// Our PrepareRequest, when we proposed this round.
    pub prepare_request: Option<Envelope>,

    /// Our PrepareResponse, when we acknowledged a proposal.
    pub prepare_response: Option<Envelope>,

    /// Our PreCommit, when we reached the preparation threshold.
    pub pre_commit: Option<Envelope>,

    /// Our Commit, when we locked a signature.
    pub commit: Option<Envelope>,
}

impl ConsensusSnapshot {
    /// An empty snapshot for a fresh round.
    pub fn empty(block_index: BlockIndex, view_number: ViewNumber) -> Self {
        Self {
            block_index,
            view_number,
            prepare_request: None,
            prepare_response: None,
            pre_commit: None,
            commit: None,
        }
    }
}

/// Durable storage for the node's own signed round state.
///
/// All methods take `&self` - implementations use interior mutability.
pub trait ConsensusStateStore: Send + Sync {
    /// Persist the snapshot, replacing any previous one.
    fn save(&self, snapshot: &ConsensusSnapshot);

    /// Load the snapshot persisted before the last shutdown, if any.
    fn load(&self) -> Option<ConsensusSnapshot>;
}
