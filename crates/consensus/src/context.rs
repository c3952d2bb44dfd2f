//! Per-round consensus state.
//!
//! A [`RoundContext`] is created when a `(height, view)` round is
//! initialized and mutated only by the dispatcher and phase logic. It
//! carries two parallel [`ProposalSlot`]s - the priority primary's and the
//! fallback primary's - plus the view-scoped singleton state: change-view
//! votes, recovery dedup hashes, flags, and the archive of proposals from
//! earlier views at the same height (which lets commits from those views
//! still complete a block).

use crate::ConsensusConfig;
use std::collections::{HashMap, HashSet};
use tandem_core::ChainTip;
use tandem_messages::{ConsensusPayload, Envelope, SlotId};
use tandem_types::{
    compute_merkle_root, BlockHeader, BlockIndex, Hash, Transaction, ValidatorIndex, ValidatorSet,
    ViewNumber, BLOCK_VERSION,
};

/// Accumulator used to reject proposals that would exceed aggregate
/// policy limits across the transactions admitted so far.
#[derive(Debug, Clone, Default)]
pub struct TransactionVerificationContext {
    cumulative_system_fee: u64,
    cumulative_size: usize,
}

impl TransactionVerificationContext {
    /// A fresh accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether admitting `tx` would keep the aggregate within policy.
    pub fn check(&self, tx: &Transaction, config: &ConsensusConfig) -> bool {
        self.cumulative_system_fee.saturating_add(tx.system_fee) <= config.max_block_system_fee
            && self.cumulative_size.saturating_add(tx.size()) <= config.max_block_size
    }

    /// Admit `tx` into the aggregate.
    pub fn add(&mut self, tx: &Transaction) {
        self.cumulative_system_fee = self.cumulative_system_fee.saturating_add(tx.system_fee);
        self.cumulative_size = self.cumulative_size.saturating_add(tx.size());
    }

    /// Combined system fee admitted so far.
    pub fn system_fee(&self) -> u64 {
        self.cumulative_system_fee
    }

    /// Combined encoded size admitted so far.
    pub fn size(&self) -> usize {
        self.cumulative_size
    }
}

/// One of the two parallel proposal tracks within a view.
///
/// The skeleton header (index, version, previous hash, primary index) is
/// preset at round initialization; the proposing primary's timestamp,
/// nonce, and the transaction merkle root are stamped in when its
/// PrepareRequest is accepted, at which point the header is final and
/// commit signatures can be verified against it.
#[derive(Debug, Clone)]
pub struct ProposalSlot {
    /// The slot's block header; final once `header_finalized` is set.
    pub header: BlockHeader,

    /// Whether the header carries the primary's proposal and may be signed.
    pub header_finalized: bool,

    /// Envelope hash of the accepted PrepareRequest.
    pub request_hash: Option<Hash>,

    /// Proposed transaction hashes in block order.
    pub transaction_hashes: Vec<Hash>,

    /// Transactions obtained so far, keyed by hash.
    pub transactions: HashMap<Hash, Transaction>,

    /// Aggregate policy accumulator for the admitted transactions.
    pub verification_context: TransactionVerificationContext,

    /// PrepareRequest/PrepareResponse envelopes, one entry per validator.
    /// The primary's entry holds its request; backups' entries hold
    /// responses referencing that request.
    pub preparations: Vec<Option<Envelope>>,

    /// PreCommit envelopes, one entry per validator.
    pub pre_commits: Vec<Option<Envelope>>,

    /// Signature-verified Commit envelopes for the current view.
    pub commits: Vec<Option<Envelope>>,

    /// Current-view commits that arrived before the header was finalized.
    /// Verified (or discarded) once the proposal lands.
    pub parked_commits: Vec<Option<Envelope>>,
}

impl ProposalSlot {
    fn new(
        n: usize,
        index: BlockIndex,
        prev_hash: Hash,
        primary_index: ValidatorIndex,
    ) -> Self {
        Self {
            header: BlockHeader {
                version: BLOCK_VERSION,
                index,
                prev_hash,
                merkle_root: Hash::ZERO,
                timestamp_ms: 0,
                nonce: 0,
                primary_index,
            },
            header_finalized: false,
            request_hash: None,
            transaction_hashes: Vec::new(),
            transactions: HashMap::new(),
            verification_context: TransactionVerificationContext::new(),
            preparations: vec![None; n],
            pre_commits: vec![None; n],
            commits: vec![None; n],
            parked_commits: vec![None; n],
        }
    }

    /// Stamp the primary's proposal into the skeleton header and reset the
    /// transaction state for collection.
    pub fn install_proposal(
        &mut self,
        request_hash: Hash,
        timestamp_ms: u64,
        nonce: u64,
        transaction_hashes: Vec<Hash>,
    ) {
        self.header.timestamp_ms = timestamp_ms;
        self.header.nonce = nonce;
        self.header.merkle_root = compute_merkle_root(&transaction_hashes);
        self.transaction_hashes = transaction_hashes;
        self.transactions = HashMap::new();
        self.verification_context = TransactionVerificationContext::new();
        self.request_hash = Some(request_hash);
        self.header_finalized = true;
    }

    /// Whether every proposed transaction has been obtained.
    ///
    /// Only meaningful once a proposal is installed; an empty slot
    /// vacuously reports `false`.
    pub fn all_transactions_present(&self) -> bool {
        self.header_finalized && self.transactions.len() == self.transaction_hashes.len()
    }

    /// Proposed transaction hashes not yet obtained.
    pub fn missing_transactions(&self) -> Vec<Hash> {
        self.transaction_hashes
            .iter()
            .filter(|h| !self.transactions.contains_key(h))
            .copied()
            .collect()
    }

    /// Number of preparation entries (request plus responses).
    pub fn count_preparations(&self) -> usize {
        self.preparations.iter().flatten().count()
    }

    /// Number of PreCommit entries.
    pub fn count_pre_commits(&self) -> usize {
        self.pre_commits.iter().flatten().count()
    }

    /// Number of verified current-view Commit entries.
    pub fn count_commits(&self) -> usize {
        self.commits.iter().flatten().count()
    }

    /// Transactions in proposal order; `None` until all are present.
    pub fn ordered_transactions(&self) -> Option<Vec<Transaction>> {
        if !self.all_transactions_present() {
            return None;
        }
        self.transaction_hashes
            .iter()
            .map(|h| self.transactions.get(h).cloned())
            .collect()
    }
}

/// A finalized proposal from an earlier view at the same height.
///
/// Kept so that commits for that view, arriving late or via recovery, can
/// still be verified against the header they actually signed and - at a
/// safety quorum - complete the block.
#[derive(Debug, Clone)]
pub struct ArchivedProposal {
    /// The finalized header of the archived slot.
    pub header: BlockHeader,

    /// Proposed transaction hashes in block order.
    pub transaction_hashes: Vec<Hash>,

    /// Transactions obtained while the view was live.
    pub transactions: HashMap<Hash, Transaction>,

    /// Signature-verified Commit envelopes for that view.
    pub commits: Vec<Option<Envelope>>,
}

impl ArchivedProposal {
    /// Number of verified Commit entries.
    pub fn count_commits(&self) -> usize {
        self.commits.iter().flatten().count()
    }

    /// Whether every proposed transaction was obtained.
    pub fn all_transactions_present(&self) -> bool {
        self.transactions.len() == self.transaction_hashes.len()
    }

    /// Transactions in proposal order; `None` until all are present.
    pub fn ordered_transactions(&self) -> Option<Vec<Transaction>> {
        if !self.all_transactions_present() {
            return None;
        }
        self.transaction_hashes
            .iter()
            .map(|h| self.transactions.get(h).cloned())
            .collect()
    }
}

/// The per-`(height, view)` consensus state.
#[derive(Debug, Clone)]
pub struct RoundContext {
    /// Height being agreed on.
    pub block_index: BlockIndex,

    /// Current view at this height.
    pub view_number: ViewNumber,

    /// Hash of the previous (persisted) block.
    pub prev_hash: Hash,

    /// Timestamp of the previous block, milliseconds.
    pub prev_timestamp_ms: u64,

    /// The priority primary for this view.
    pub priority_primary: ValidatorIndex,

    /// The fallback primary for this view; `None` when the slot is inert.
    pub fallback_primary: Option<ValidatorIndex>,

    /// The two parallel proposal slots, indexed by [`SlotId`].
    slots: [ProposalSlot; 2],

    /// Latest ChangeView envelope per validator.
    pub change_views: Vec<Option<Envelope>>,

    /// Commits for views other than the current one, keyed by the view and
    /// slot they claim, parked until a matching proposal is known.
    pub parked_cross_view_commits: HashMap<(ViewNumber, SlotId), Vec<Option<Envelope>>>,

    /// Finalized proposals from earlier views at this height.
    pub prior_proposals: HashMap<(ViewNumber, SlotId), ArchivedProposal>,

    /// Recovery-request envelope hashes already answered this round.
    pub known_recovery_hashes: HashSet<Hash>,

    /// Whether a PrepareRequest has been sent or accepted this view.
    pub request_sent_or_received: bool,

    /// Whether this node has signed a Commit at this height.
    pub commit_sent: bool,

    /// Whether this node has submitted a block for this height.
    pub block_sent: bool,

    /// Whether this node has asked for a view change and stopped accepting
    /// preparation-phase payloads.
    pub not_accepting_payloads_due_to_view_changing: bool,
}

impl RoundContext {
    /// Build the context for a fresh height on top of `tip`.
    pub fn new(tip: &ChainTip, view: ViewNumber, validators: &ValidatorSet) -> Self {
        let block_index = tip.index.next();
        let n = validators.len();
        let priority = validators.priority_primary(block_index, view);
        let fallback = validators.fallback_primary(block_index, view);

        Self {
            block_index,
            view_number: view,
            prev_hash: tip.hash,
            prev_timestamp_ms: tip.timestamp_ms,
            priority_primary: priority,
            fallback_primary: fallback,
            slots: [
                ProposalSlot::new(n, block_index, tip.hash, priority),
                ProposalSlot::new(n, block_index, tip.hash, fallback.unwrap_or(priority)),
            ],
            change_views: vec![None; n],
            parked_cross_view_commits: HashMap::new(),
            prior_proposals: HashMap::new(),
            known_recovery_hashes: HashSet::new(),
            request_sent_or_received: false,
            commit_sent: false,
            block_sent: false,
            not_accepting_payloads_due_to_view_changing: false,
        }
    }

    /// Move this height's context to `new_view`.
    ///
    /// Finalized slots are archived (their verified commits stay countable),
    /// unverifiable commit claims stay parked, spent change-view votes are
    /// scrubbed, and both slots restart empty under the new primaries.
    pub fn advance_view(&mut self, new_view: ViewNumber, validators: &ValidatorSet) {
        let n = validators.len();
        let old_view = self.view_number;

        for slot_id in SlotId::ALL {
            let slot = std::mem::replace(
                &mut self.slots[slot_id.index()],
                ProposalSlot::new(n, self.block_index, self.prev_hash, self.priority_primary),
            );

            if slot.header_finalized {
                self.prior_proposals.insert(
                    (old_view, slot_id),
                    ArchivedProposal {
                        header: slot.header,
                        transaction_hashes: slot.transaction_hashes,
                        transactions: slot.transactions,
                        commits: slot.commits,
                    },
                );
            } else if slot.parked_commits.iter().any(Option::is_some) {
                self.parked_cross_view_commits
                    .insert((old_view, slot_id), slot.parked_commits);
            }
        }

        self.view_number = new_view;
        self.priority_primary = validators.priority_primary(self.block_index, new_view);
        self.fallback_primary = validators.fallback_primary(self.block_index, new_view);

        self.slots = [
            ProposalSlot::new(n, self.block_index, self.prev_hash, self.priority_primary),
            ProposalSlot::new(
                n,
                self.block_index,
                self.prev_hash,
                self.fallback_primary.unwrap_or(self.priority_primary),
            ),
        ];

        // Commits that were parked for this view become resolvable once its
        // proposal lands; hand them to the fresh slots.
        for slot_id in SlotId::ALL {
            if let Some(parked) = self.parked_cross_view_commits.remove(&(new_view, slot_id)) {
                self.slots[slot_id.index()].parked_commits = parked;
            }
        }

        // A recorded change-view vote targeting a view we have now reached
        // is spent.
        for entry in self.change_views.iter_mut() {
            let spent = entry
                .as_ref()
                .and_then(decoded_new_view)
                .is_some_and(|v| v <= new_view);
            if spent {
                *entry = None;
            }
        }

        self.known_recovery_hashes.clear();
        self.request_sent_or_received = false;
        self.not_accepting_payloads_due_to_view_changing = false;
    }

    /// Shared access to a slot.
    pub fn slot(&self, id: SlotId) -> &ProposalSlot {
        &self.slots[id.index()]
    }

    /// Mutable access to a slot.
    pub fn slot_mut(&mut self, id: SlotId) -> &mut ProposalSlot {
        &mut self.slots[id.index()]
    }

    /// Map a sender index onto the slot it is primary of, if any.
    pub fn slot_of_primary(&self, index: ValidatorIndex) -> Option<SlotId> {
        if index == self.priority_primary {
            Some(SlotId::Priority)
        } else if Some(index) == self.fallback_primary {
            Some(SlotId::Fallback)
        } else {
            None
        }
    }

    /// Number of validators known to have signed a Commit at this height,
    /// in any view or slot.
    pub fn count_committed(&self) -> usize {
        let n = self.change_views.len();
        let mut committed = vec![false; n];

        let mark = |committed: &mut Vec<bool>, entries: &[Option<Envelope>]| {
            for (i, entry) in entries.iter().enumerate() {
                if entry.is_some() {
                    committed[i] = true;
                }
            }
        };

        for slot in &self.slots {
            mark(&mut committed, &slot.commits);
            mark(&mut committed, &slot.parked_commits);
        }
        for archive in self.prior_proposals.values() {
            mark(&mut committed, &archive.commits);
        }
        for parked in self.parked_cross_view_commits.values() {
            mark(&mut committed, parked);
        }

        committed.iter().filter(|c| **c).count()
    }
}

/// Read the `new_view_number` out of a stored ChangeView envelope.
pub fn decoded_new_view(envelope: &Envelope) -> Option<ViewNumber> {
    match envelope.decode_message().ok()?.payload {
        ConsensusPayload::ChangeView(cv) => Some(cv.new_view_number),
        _ => None,
    }
}
