//! Event types for the consensus state machine.

use tandem_messages::Envelope;
use tandem_types::{Block, BlockIndex, Transaction, ViewNumber};

/// All possible events the consensus state machine can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events serially and returns actions; there
/// is no other way in, so reentrancy is ruled out by construction.
#[derive(Debug, Clone)]
pub enum Event {
    /// The node finished bootstrapping; consensus may initialize its first
    /// round (replaying any persisted self-state first).
    Started,

    /// The round deadline fired.
    ///
    /// Carries the round it was armed for; a fired timer from a superseded
    /// round is ignored.
    TimerFired {
        /// Height the timer was armed at.
        block_index: BlockIndex,
        /// View the timer was armed at.
        view_number: ViewNumber,
    },

    /// A consensus envelope arrived from the P2P layer.
    PayloadReceived {
        /// The raw signed envelope.
        envelope: Envelope,
    },

    /// A transaction requested from the task manager arrived.
    TransactionReceived {
        /// The fetched transaction.
        tx: Transaction,
    },

    /// The ledger persisted a block; consensus moves to the next height.
    BlockPersisted {
        /// The block that was persisted.
        block: Block,
    },
}

impl Event {
    /// Get a human-readable name for this event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Started => "Started",
            Event::TimerFired { .. } => "TimerFired",
            Event::PayloadReceived { .. } => "PayloadReceived",
            Event::TransactionReceived { .. } => "TransactionReceived",
            Event::BlockPersisted { .. } => "BlockPersisted",
        }
    }
}
