//! Action types emitted by the consensus state machine.

use crate::ConsensusSnapshot;
use tandem_messages::Envelope;
use tandem_types::{Block, BlockIndex, Hash, ViewNumber};

/// All possible outputs from the consensus state machine.
///
/// The runner executes each action: network sends, timer scheduling,
/// ledger submission, and durable persistence all happen outside the
/// state machine.
#[derive(Debug, Clone)]
pub enum Action {
    /// Relay a consensus envelope to peers.
    Broadcast(Envelope),

    /// Ask the task manager to (re)start fetching these transactions.
    FetchTransactions(Vec<Hash>),

    /// Hand a finalized block to the ledger.
    /// Boxed to keep the enum small; blocks carry full transaction lists.
    SubmitBlock(Box<Block>),

    /// (Re)arm the single-shot round timer.
    ///
    /// Replaces any previously armed deadline. The round token is echoed
    /// back in [`Event::TimerFired`](crate::Event::TimerFired) so stale
    /// timers can be ignored.
    SetTimer {
        /// Absolute deadline, milliseconds since the Unix epoch.
        fire_at_ms: u64,
        /// Height the timer is armed for.
        block_index: BlockIndex,
        /// View the timer is armed for.
        view_number: ViewNumber,
    },

    /// Persist the node's signed round state for crash recovery.
    SaveState(Box<ConsensusSnapshot>),
}

impl Action {
    /// Get a human-readable name for this action type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast(_) => "Broadcast",
            Action::FetchTransactions(_) => "FetchTransactions",
            Action::SubmitBlock(_) => "SubmitBlock",
            Action::SetTimer { .. } => "SetTimer",
            Action::SaveState(_) => "SaveState",
        }
    }
}
