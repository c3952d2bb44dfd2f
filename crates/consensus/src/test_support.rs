//! Shared setup for the unit tests in this crate.

use crate::{ConsensusConfig, DbftState};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{Action, ConsensusSnapshot, Event, StateMachine};
use tandem_messages::{ConsensusPayload, Envelope};
use tandem_test_helpers::{MemoryLedger, MemoryMempool, TestValidators};

pub(crate) const NETWORK: u32 = 0x5445_5354;

/// Chain-tip timestamp every test ledger starts from.
pub(crate) const TIP_TIMESTAMP_MS: u64 = 1_000_000;

/// A state machine wired to in-memory collaborators.
pub(crate) struct TestNode {
    pub state: DbftState,
    pub mempool: Arc<MemoryMempool>,
    pub ledger: Arc<MemoryLedger>,
}

impl TestNode {
    /// Build the node for validator `index` of `committee`, positioned so
    /// the next height is `next_height`.
    pub fn new(committee: &TestValidators, index: usize, next_height: u32) -> Self {
        Self::build(committee, Some(index), next_height, None)
    }

    /// Build a watch-only node.
    pub fn watch_only(committee: &TestValidators, next_height: u32) -> Self {
        Self::build(committee, None, next_height, None)
    }

    /// Build a node restoring `snapshot` on start.
    pub fn recovered(
        committee: &TestValidators,
        index: usize,
        next_height: u32,
        snapshot: ConsensusSnapshot,
    ) -> Self {
        Self::build(committee, Some(index), next_height, Some(snapshot))
    }

    fn build(
        committee: &TestValidators,
        index: Option<usize>,
        next_height: u32,
        snapshot: Option<ConsensusSnapshot>,
    ) -> Self {
        let mempool = Arc::new(MemoryMempool::new());
        let ledger = Arc::new(MemoryLedger::at_height(next_height, TIP_TIMESTAMP_MS));
        let state = DbftState::new(
            ConsensusConfig::default().with_network(NETWORK),
            committee.public_keys(),
            index.map(|i| committee.key_clone(i)),
            mempool.clone(),
            ledger.clone(),
            snapshot,
        );
        Self {
            state,
            mempool,
            ledger,
        }
    }

    /// Start the node at `now_ms`.
    pub fn start(&mut self, now_ms: u64) -> Vec<Action> {
        self.state.set_time(Duration::from_millis(now_ms));
        self.state.handle(Event::Started)
    }

    /// Deliver an envelope at the current time.
    pub fn deliver(&mut self, envelope: Envelope) -> Vec<Action> {
        self.state.handle(Event::PayloadReceived { envelope })
    }

    /// Deliver an envelope at `now_ms`.
    pub fn deliver_at(&mut self, now_ms: u64, envelope: Envelope) -> Vec<Action> {
        self.state.set_time(Duration::from_millis(now_ms));
        self.deliver(envelope)
    }

    /// Fire the round timer for the current round.
    pub fn fire_timer(&mut self, now_ms: u64) -> Vec<Action> {
        self.state.set_time(Duration::from_millis(now_ms));
        let (block_index, view_number) = self.state.round();
        self.state.handle(Event::TimerFired {
            block_index,
            view_number,
        })
    }
}

/// Envelopes broadcast by a batch of actions, filtered by message kind.
pub(crate) fn broadcasts(actions: &[Action], kind: &str) -> Vec<Envelope> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::Broadcast(envelope) => Some(envelope.clone()),
            _ => None,
        })
        .filter(|envelope| {
            envelope
                .decode_message()
                .map(|m| m.payload.kind() == kind)
                .unwrap_or(false)
        })
        .collect()
}

/// The single broadcast of `kind` in `actions`, if any.
pub(crate) fn broadcast(actions: &[Action], kind: &str) -> Option<Envelope> {
    let mut found = broadcasts(actions, kind);
    match found.len() {
        0 => None,
        1 => Some(found.remove(0)),
        n => panic!("expected at most one {kind} broadcast, found {n}"),
    }
}

/// The payload of an envelope, for assertions.
pub(crate) fn payload_of(envelope: &Envelope) -> ConsensusPayload {
    envelope
        .decode_message()
        .expect("test envelope should decode")
        .payload
}

/// Snapshots persisted by a batch of actions.
pub(crate) fn saved_snapshots(actions: &[Action]) -> Vec<ConsensusSnapshot> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::SaveState(snapshot) => Some((**snapshot).clone()),
            _ => None,
        })
        .collect()
}

/// Blocks submitted by a batch of actions.
pub(crate) fn submitted_blocks(actions: &[Action]) -> Vec<tandem_types::Block> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::SubmitBlock(block) => Some((**block).clone()),
            _ => None,
        })
        .collect()
}
