//! End-to-end consensus scenarios over a deterministic in-process network.
//!
//! Four validators (`N=4`, `F=1`, `M=3`) run real state machines wired to
//! in-memory collaborators; the harness routes broadcast envelopes between
//! them with full control over ordering, partitions, and the clock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tandem_consensus::{ConsensusConfig, DbftState};
use tandem_core::{Action, ConsensusSnapshot, ConsensusStateStore, Event, LedgerView, StateMachine};
use tandem_messages::{
    ChangeViewReason, Commit, ConsensusPayload, Envelope, RecoveryMessage, RecoveryRequest, SlotId,
};
use tandem_types::{Block, BlockIndex, Hash, Transaction, ValidatorIndex, ViewNumber};
use tandem_test_helpers::{fixtures, MemoryLedger, MemoryMempool, MemoryStateStore, TestValidators};
use tracing_test::traced_test;

const NETWORK: u32 = 0x5343_4e31;
const HEIGHT: u32 = 100;
const TIP_TIMESTAMP_MS: u64 = 1_000_000;
const MS_PER_BLOCK: u64 = 15_000;
const START_MS: u64 = TIP_TIMESTAMP_MS + MS_PER_BLOCK;

struct TestNode {
    state: DbftState,
    mempool: Arc<MemoryMempool>,
    ledger: Arc<MemoryLedger>,
    inbox: VecDeque<Envelope>,
    timer: Option<(u64, BlockIndex, ViewNumber)>,
    submitted: Vec<Block>,
    saved: Vec<ConsensusSnapshot>,
    sent: Vec<Envelope>,
}

struct TestNet {
    nodes: Vec<TestNode>,
    now_ms: u64,
    muted: Vec<bool>,
}

impl TestNet {
    fn new(committee: &TestValidators) -> Self {
        let nodes = (0..committee.len())
            .map(|i| {
                let mempool = Arc::new(MemoryMempool::new());
                let ledger = Arc::new(MemoryLedger::at_height(HEIGHT, TIP_TIMESTAMP_MS));
                let state = DbftState::new(
                    ConsensusConfig::default().with_network(NETWORK),
                    committee.public_keys(),
                    Some(committee.key_clone(i)),
                    mempool.clone(),
                    ledger.clone(),
                    None,
                );
                TestNode {
                    state,
                    mempool,
                    ledger,
                    inbox: VecDeque::new(),
                    timer: None,
                    submitted: Vec::new(),
                    saved: Vec::new(),
                    sent: Vec::new(),
                }
            })
            .collect();
        Self {
            nodes,
            now_ms: START_MS,
            muted: vec![false; committee.len()],
        }
    }

    fn add_verified_everywhere(&mut self, tx: &Transaction) {
        for node in &self.nodes {
            node.mempool.add_verified(tx.clone());
        }
    }

    fn mute(&mut self, index: usize) {
        self.muted[index] = true;
    }

    fn start_all(&mut self) {
        for index in 0..self.nodes.len() {
            let node = &mut self.nodes[index];
            node.state.set_time(Duration::from_millis(self.now_ms));
            let actions = node.state.handle(Event::Started);
            self.route(index, actions);
        }
    }

    fn route(&mut self, from: usize, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast(envelope) => {
                    self.nodes[from].sent.push(envelope.clone());
                    if self.muted[from] {
                        continue;
                    }
                    for (target, node) in self.nodes.iter_mut().enumerate() {
                        if target != from {
                            node.inbox.push_back(envelope.clone());
                        }
                    }
                }
                Action::SetTimer {
                    fire_at_ms,
                    block_index,
                    view_number,
                } => {
                    self.nodes[from].timer = Some((fire_at_ms, block_index, view_number));
                }
                Action::SubmitBlock(block) => {
                    self.nodes[from].submitted.push(*block);
                }
                Action::SaveState(snapshot) => {
                    self.nodes[from].saved.push(*snapshot);
                }
                Action::FetchTransactions(_) => {}
            }
        }
    }

    /// Deliver queued envelopes round-robin until every inbox is drained.
    fn deliver_all(&mut self) {
        for _ in 0..10_000 {
            let mut progressed = false;
            for index in 0..self.nodes.len() {
                let Some(envelope) = self.nodes[index].inbox.pop_front() else {
                    continue;
                };
                progressed = true;
                let node = &mut self.nodes[index];
                node.state.set_time(Duration::from_millis(self.now_ms));
                let actions = node.state.handle(Event::PayloadReceived { envelope });
                self.route(index, actions);
            }
            if !progressed {
                return;
            }
        }
        panic!("message storm: inboxes never drained");
    }

    /// Fire node `index`'s armed timer, if any.
    fn fire_timer(&mut self, index: usize) {
        let Some((_, block_index, view_number)) = self.nodes[index].timer.take() else {
            return;
        };
        let node = &mut self.nodes[index];
        node.state.set_time(Duration::from_millis(self.now_ms));
        let actions = node.state.handle(Event::TimerFired {
            block_index,
            view_number,
        });
        self.route(index, actions);
    }

    /// Advance the clock and fire every timer that is now due.
    fn advance_and_fire_due(&mut self, delta_ms: u64) {
        self.now_ms += delta_ms;
        for index in 0..self.nodes.len() {
            let due = self.nodes[index]
                .timer
                .map(|(deadline, _, _)| deadline <= self.now_ms)
                .unwrap_or(false);
            if due {
                self.fire_timer(index);
            }
        }
    }

    /// Push an envelope to every node's inbox.
    fn inject_to_all(&mut self, envelope: &Envelope) {
        for node in &mut self.nodes {
            node.inbox.push_back(envelope.clone());
        }
    }

    /// Envelopes of `kind` sent by node `index` so far.
    fn sent_of_kind(&self, index: usize, kind: &str) -> Vec<Envelope> {
        self.nodes[index]
            .sent
            .iter()
            .filter(|envelope| {
                envelope
                    .decode_message()
                    .map(|m| m.payload.kind() == kind)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Happy path through the priority primary
// ═══════════════════════════════════════════════════════════════════════════

#[test]
#[traced_test]
fn happy_path_through_priority_primary() {
    let committee = TestValidators::new(4);
    let mut net = TestNet::new(&committee);
    let tx_a = fixtures::make_transaction(&committee, 0xA);
    let tx_b = fixtures::make_transaction(&committee, 0xB);
    net.add_verified_everywhere(&tx_a);
    net.add_verified_everywhere(&tx_b);

    net.start_all();
    net.fire_timer(0); // node 0 is the priority primary at (100, 0)
    net.deliver_all();

    // Every node assembled the same block with the proposed transactions.
    for (index, node) in net.nodes.iter().enumerate() {
        assert_eq!(node.submitted.len(), 1, "node {index} submitted a block");
        let block = &node.submitted[0];
        assert_eq!(block.header.index, BlockIndex(HEIGHT));
        assert_eq!(block.header.primary_index, ValidatorIndex(0));
        assert_eq!(block.transactions, vec![tx_a.clone(), tx_b.clone()]);
        assert_eq!(block.witness.len(), 3);
    }

    // Safety: all submitted blocks are byte-identical.
    let reference = net.nodes[0].submitted[0].hash();
    for node in &net.nodes {
        assert_eq!(node.submitted[0].hash(), reference);
    }

    // The backups acknowledged and pre-committed; nobody asked to leave.
    for index in [1usize, 2] {
        assert_eq!(net.sent_of_kind(index, "PrepareResponse").len(), 1);
        assert_eq!(net.sent_of_kind(index, "PreCommit").len(), 1);
        assert_eq!(net.sent_of_kind(index, "Commit").len(), 1);
    }
    for index in 0..4 {
        assert!(net.sent_of_kind(index, "ChangeView").is_empty());
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Priority primary silent, fallback slot completes the height
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn fallback_primary_succeeds_without_view_change() {
    let committee = TestValidators::new(4);
    let mut net = TestNet::new(&committee);
    let tx_c = fixtures::make_transaction(&committee, 0xC);
    net.add_verified_everywhere(&tx_c);

    net.mute(0); // the priority primary says nothing
    net.start_all();
    net.fire_timer(3); // (100 - 0 - 1) mod 4 = 3 is the fallback primary
    net.deliver_all();

    for index in [1usize, 2, 3] {
        let node = &net.nodes[index];
        assert_eq!(node.submitted.len(), 1, "node {index} submitted a block");
        let block = &node.submitted[0];
        assert_eq!(block.header.primary_index, ValidatorIndex(3));
        assert_eq!(block.transactions, vec![tx_c.clone()]);
    }

    // The fallback path never needed a view change.
    for index in 0..4 {
        assert!(net.sent_of_kind(index, "ChangeView").is_empty());
        assert_eq!(net.nodes[index].state.round().1, ViewNumber::ZERO);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Policy-violating proposal forces a view change
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn policy_rejection_triggers_view_change() {
    let committee = TestValidators::new(4);
    let mut net = TestNet::new(&committee);

    // Two transactions that fit individually but exceed the block fee cap
    // together. Backups hold them in their verified pools, so only the
    // block-level policy check can object.
    let cap = ConsensusConfig::default().max_block_system_fee;
    let tx_a = fixtures::make_transaction_with_fee(&committee, 1, cap / 2 + 1);
    let tx_b = fixtures::make_transaction_with_fee(&committee, 2, cap / 2 + 1);
    net.add_verified_everywhere(&tx_a);
    net.add_verified_everywhere(&tx_b);

    net.start_all();

    // A misbehaving primary proposes both transactions anyway.
    let request = fixtures::make_prepare_request(
        &committee,
        NETWORK,
        0,
        BlockIndex(HEIGHT),
        ViewNumber::ZERO,
        SlotId::Priority,
        net.nodes[1].ledger.tip().hash,
        TIP_TIMESTAMP_MS + 1,
        vec![tx_a.hash(), tx_b.hash()],
    );
    net.inject_to_all(&request);
    net.deliver_all();

    // The backups rejected the block and everyone agreed to move on.
    for index in [1usize, 2, 3] {
        let rejections: Vec<_> = net
            .sent_of_kind(index, "ChangeView")
            .iter()
            .filter_map(|envelope| match envelope.decode_message().unwrap().payload {
                ConsensusPayload::ChangeView(cv) => Some(cv.reason),
                _ => None,
            })
            .collect();
        assert!(
            rejections.contains(&ChangeViewReason::BlockRejectedByPolicy),
            "node {index} rejected the proposal"
        );
    }
    for index in 0..4 {
        assert_eq!(
            net.nodes[index].state.round(),
            (BlockIndex(HEIGHT), ViewNumber(1)),
            "node {index} moved to view 1"
        );
    }

    // The round may legitimately finish under view 1's rotated primary
    // (recovery hands it the floor), but the rejected proposal itself
    // never becomes a block: nothing submitted carries the view-0 primary
    // or breaks the fee cap.
    for node in &net.nodes {
        for block in &node.submitted {
            assert_eq!(block.header.primary_index, ValidatorIndex(3));
            let total_fee: u64 = block.transactions.iter().map(|tx| tx.system_fee).sum();
            assert!(total_fee <= cap, "submitted block respects the fee cap");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// An equivocating commit does not inflate the threshold
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn equivocating_commit_rejected() {
    let committee = TestValidators::new(4);
    let mut net = TestNet::new(&committee);
    net.start_all();

    // Node 1 accepts the proposal and reaches its own commit once a full
    // quorum of preparations is visible.
    let request = fixtures::make_prepare_request(
        &committee,
        NETWORK,
        0,
        BlockIndex(HEIGHT),
        ViewNumber::ZERO,
        SlotId::Priority,
        net.nodes[1].ledger.tip().hash,
        TIP_TIMESTAMP_MS + 1,
        vec![],
    );
    let request_hash = request.hash();
    net.nodes[1].inbox.push_back(request);
    net.deliver_all();
    net.nodes[1].inbox.push_back(fixtures::make_prepare_response(
        &committee,
        NETWORK,
        2,
        BlockIndex(HEIGHT),
        ViewNumber::ZERO,
        SlotId::Priority,
        request_hash,
    ));
    net.deliver_all();
    assert!(net.nodes[1].state.context().commit_sent);
    for node in &mut net.nodes {
        node.inbox.clear();
    }

    let header = net.nodes[1]
        .state
        .context()
        .slot(SlotId::Priority)
        .header
        .clone();

    // Validator 2 commits with σ₁, then equivocates with σ₂ ≠ σ₁.
    let first = fixtures::make_commit(
        &committee,
        NETWORK,
        2,
        ViewNumber::ZERO,
        SlotId::Priority,
        &header,
    );
    let second = fixtures::make_envelope(
        &committee,
        NETWORK,
        2,
        BlockIndex(HEIGHT),
        ViewNumber::ZERO,
        ConsensusPayload::Commit(Commit {
            id: SlotId::Priority,
            signature: committee.key(2).sign(b"conflicting commitment"),
        }),
    );
    net.nodes[1].inbox.push_back(first.clone());
    net.nodes[1].inbox.push_back(second);
    net.deliver_all();

    let slot_commits = net.nodes[1]
        .state
        .context()
        .slot(SlotId::Priority)
        .count_commits();
    assert_eq!(slot_commits, 2, "own commit plus validator 2's first commit");

    // A third honest commit completes the block; the witness carries σ₁.
    let third = fixtures::make_commit(
        &committee,
        NETWORK,
        0,
        ViewNumber::ZERO,
        SlotId::Priority,
        &header,
    );
    net.nodes[1].inbox.push_back(third);
    net.deliver_all();

    assert_eq!(net.nodes[1].submitted.len(), 1);
    let block = &net.nodes[1].submitted[0];
    let first_signature = match first.decode_message().unwrap().payload {
        ConsensusPayload::Commit(c) => c.signature,
        _ => unreachable!(),
    };
    assert!(block
        .witness
        .iter()
        .any(|(index, signature)| *index == ValidatorIndex(2) && *signature == first_signature));
}

// ═══════════════════════════════════════════════════════════════════════════
// Crash after persisting, restart re-emits the identical Commit
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn restart_reissues_the_same_commit() {
    let committee = TestValidators::new(4);
    let mut net = TestNet::new(&committee);
    net.start_all();

    // Drive node 1 to the commit transition.
    let request = fixtures::make_prepare_request(
        &committee,
        NETWORK,
        0,
        BlockIndex(HEIGHT),
        ViewNumber::ZERO,
        SlotId::Priority,
        net.nodes[1].ledger.tip().hash,
        TIP_TIMESTAMP_MS + 1,
        vec![],
    );
    let request_hash = request.hash();
    net.nodes[1].inbox.push_back(request);
    net.deliver_all();
    net.nodes[1].inbox.push_back(fixtures::make_prepare_response(
        &committee,
        NETWORK,
        2,
        BlockIndex(HEIGHT),
        ViewNumber::ZERO,
        SlotId::Priority,
        request_hash,
    ));
    net.deliver_all();

    // Persist each snapshot the way a runner executing SaveState would.
    let store = MemoryStateStore::new();
    for snapshot in &net.nodes[1].saved {
        store.save(snapshot);
    }
    let snapshot = store.load().expect("snapshot persisted");
    let original_commit = snapshot
        .commit
        .clone()
        .expect("commit persisted before broadcast");

    // The crash loses everything in memory; only the snapshot survives.
    let mempool = Arc::new(MemoryMempool::new());
    let ledger = Arc::new(MemoryLedger::at_height(HEIGHT, TIP_TIMESTAMP_MS));
    let mut restarted = DbftState::new(
        ConsensusConfig::default().with_network(NETWORK),
        committee.public_keys(),
        Some(committee.key_clone(1)),
        mempool,
        ledger,
        Some(snapshot),
    );
    restarted.set_time(Duration::from_millis(START_MS + 5_000));
    let actions = restarted.handle(Event::Started);

    let reissued: Vec<&Envelope> = actions
        .iter()
        .filter_map(|action| match action {
            Action::Broadcast(envelope) => Some(envelope),
            _ => None,
        })
        .filter(|envelope| {
            matches!(
                envelope.decode_message().map(|m| m.payload),
                Ok(ConsensusPayload::Commit(_))
            )
        })
        .collect();
    assert_eq!(reissued.len(), 1);
    assert_eq!(
        reissued[0].hash(),
        original_commit.hash(),
        "the identical envelope is replayed, never re-signed"
    );
    assert!(restarted.context().commit_sent);
}

// ═══════════════════════════════════════════════════════════════════════════
// Commits from a prior view complete that view's block
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn late_commits_complete_prior_view_block() {
    let committee = TestValidators::new(4);
    let mut net = TestNet::new(&committee);
    net.start_all();

    // Node 1 sees the view-0 proposal but never reaches commit.
    let request = fixtures::make_prepare_request(
        &committee,
        NETWORK,
        0,
        BlockIndex(HEIGHT),
        ViewNumber::ZERO,
        SlotId::Priority,
        net.nodes[1].ledger.tip().hash,
        TIP_TIMESTAMP_MS + 1,
        vec![],
    );
    net.nodes[1].inbox.push_back(request);
    net.deliver_all();
    for node in &mut net.nodes {
        node.inbox.clear();
    }
    let view0_header = net.nodes[1]
        .state
        .context()
        .slot(SlotId::Priority)
        .header
        .clone();
    assert!(!net.nodes[1].state.context().commit_sent);

    // A view change moves node 1 to view 1; the view-0 proposal is archived.
    for signer in [0usize, 2, 3] {
        net.nodes[1].inbox.push_back(fixtures::make_change_view(
            &committee,
            NETWORK,
            signer,
            BlockIndex(HEIGHT),
            ViewNumber::ZERO,
            ViewNumber(1),
            ChangeViewReason::Timeout,
        ));
    }
    net.deliver_all();
    for node in &mut net.nodes {
        node.inbox.clear();
    }
    assert_eq!(net.nodes[1].state.round().1, ViewNumber(1));

    // A recovery message carries the view-0 commits of a quorum that did
    // lock. Matched against the archived header they verify and complete
    // the view-0 block.
    let bundle = RecoveryMessage {
        commits: [0usize, 2, 3]
            .iter()
            .map(|signer| {
                fixtures::make_commit(
                    &committee,
                    NETWORK,
                    *signer,
                    ViewNumber::ZERO,
                    SlotId::Priority,
                    &view0_header,
                )
            })
            .collect(),
        ..RecoveryMessage::default()
    };
    let recovery = fixtures::make_envelope(
        &committee,
        NETWORK,
        0,
        BlockIndex(HEIGHT),
        ViewNumber::ZERO,
        ConsensusPayload::RecoveryMessage(bundle),
    );
    net.nodes[1].inbox.push_back(recovery);
    net.deliver_all();

    assert_eq!(net.nodes[1].submitted.len(), 1);
    let block = &net.nodes[1].submitted[0];
    assert_eq!(block.header, view0_header, "the view-0 block was completed");
    assert_eq!(block.witness.len(), 3);
}

// ═══════════════════════════════════════════════════════════════════════════
// Property: a recovery request is answered by at most F nodes
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn recovery_fanout_is_bounded_by_f() {
    let committee = TestValidators::new(4);
    let mut net = TestNet::new(&committee);
    net.start_all();

    let request = fixtures::make_envelope(
        &committee,
        NETWORK,
        3,
        BlockIndex(HEIGHT),
        ViewNumber::ZERO,
        ConsensusPayload::RecoveryRequest(RecoveryRequest {
            timestamp_ms: START_MS,
        }),
    );
    net.inject_to_all(&request);
    net.deliver_all();

    let responders: Vec<usize> = (0..4)
        .filter(|&index| !net.sent_of_kind(index, "RecoveryMessage").is_empty())
        .collect();
    assert_eq!(responders, vec![0], "only (3 + 1) mod 4 answers while uncommitted");
}

// ═══════════════════════════════════════════════════════════════════════════
// Property: honest nodes at the same height never produce different blocks
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn submitted_blocks_agree_across_partitions() {
    let committee = TestValidators::new(4);
    let mut net = TestNet::new(&committee);
    let tx = fixtures::make_transaction(&committee, 0xD);
    net.add_verified_everywhere(&tx);

    net.start_all();
    // Both primaries race their proposals.
    net.fire_timer(0);
    net.fire_timer(3);
    net.deliver_all();
    // Give any straggler timers a chance to resend or recover.
    net.advance_and_fire_due(4 * MS_PER_BLOCK);
    net.deliver_all();

    let mut hashes: Vec<Hash> = net
        .nodes
        .iter()
        .flat_map(|node| node.submitted.iter().map(Block::hash))
        .collect();
    hashes.sort();
    hashes.dedup();
    assert!(
        hashes.len() <= 1,
        "conflicting blocks were submitted: {hashes:?}"
    );
}
