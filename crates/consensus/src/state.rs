//! The consensus state machine.
//!
//! This module implements the dual-primary dBFT round as a synchronous,
//! event-driven state machine: envelopes, timer fires, fetched transactions,
//! and ledger notifications come in; broadcasts, fetch requests, timer
//! re-arms, persistence writes, and finalized blocks come out.
//!
//! The dispatcher and the prepare/pre-commit/commit handlers live here;
//! view-change handling is in [`crate::view_change`] and the recovery
//! engine in [`crate::recovery`].

use crate::context::{RoundContext, TransactionVerificationContext};
use crate::ConsensusConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{
    Action, ConsensusSnapshot, Event, LedgerView, MempoolView, RoundTimer, StateMachine,
};
use tandem_messages::{
    Commit, ConsensusMessage, ConsensusPayload, Envelope, PreCommit, PrepareRequest,
    PrepareResponse, SlotId,
};
use tandem_types::{
    verify_signature, Block, BlockHeader, BlockIndex, Hash, PrivateKey, PublicKey, Transaction,
    ValidatorIndex, ValidatorSet, ViewNumber, BLOCK_VERSION,
};
use tracing::{debug, info, trace, warn};

/// Proposal timestamps may run at most this many block intervals ahead of
/// the local clock.
const MAX_TIMESTAMP_DRIFT_BLOCKS: u64 = 8;

/// Operational counters for the consensus core.
#[derive(Debug, Clone, Default)]
pub struct DbftStats {
    /// Envelopes handed to the dispatcher.
    pub payloads_received: u64,

    /// Envelopes dropped before reaching a handler.
    pub payloads_dropped: u64,

    /// View changes this node has agreed to.
    pub view_changes: u64,

    /// Recovery requests this node has broadcast.
    pub recovery_requests_sent: u64,

    /// Recovery messages this node has answered with.
    pub recoveries_sent: u64,

    /// Recovery messages this node has processed.
    pub recoveries_received: u64,

    /// Blocks this node has assembled and submitted.
    pub blocks_built: u64,

    /// Height of the most recently assembled block.
    pub block_received_index: Option<BlockIndex>,

    /// Local time when the most recent block was assembled (milliseconds).
    pub block_received_time_ms: u64,
}

/// The dual-primary dBFT consensus state machine.
///
/// One logical actor owns this state; every event is handled to completion
/// before the next, so no handler ever observes a half-applied mutation.
pub struct DbftState {
    pub(crate) config: ConsensusConfig,
    pub(crate) validators: ValidatorSet,
    pub(crate) key: Option<PrivateKey>,
    pub(crate) mempool: Arc<dyn MempoolView>,
    pub(crate) ledger: Arc<dyn LedgerView>,
    pub(crate) ctx: RoundContext,
    pub(crate) timer: RoundTimer,

    /// Highest height each validator has been heard at. Keyed by public key
    /// so the record survives height changes.
    pub(crate) last_seen: HashMap<PublicKey, BlockIndex>,

    /// Snapshot loaded from storage, consumed on `Event::Started`.
    recovered: Option<ConsensusSnapshot>,

    /// Set while a recovery message is being unpacked.
    pub(crate) is_recovering: bool,

    pub(crate) stats: DbftStats,
    now: Duration,
}

impl DbftState {
    /// Create the state machine.
    ///
    /// `key` is `None` for watch-only nodes; `recovered` carries the
    /// snapshot persisted before the last shutdown, if any.
    pub fn new(
        config: ConsensusConfig,
        validator_keys: Vec<PublicKey>,
        key: Option<PrivateKey>,
        mempool: Arc<dyn MempoolView>,
        ledger: Arc<dyn LedgerView>,
        recovered: Option<ConsensusSnapshot>,
    ) -> Self {
        let my_key = key.as_ref().map(|k| k.public_key());
        let validators = ValidatorSet::new(validator_keys, my_key.as_ref());
        let tip = ledger.tip();
        let ctx = RoundContext::new(&tip, ViewNumber::ZERO, &validators);

        Self {
            config,
            validators,
            key,
            mempool,
            ledger,
            ctx,
            timer: RoundTimer::new(),
            last_seen: HashMap::new(),
            recovered,
            is_recovering: false,
            stats: DbftStats::default(),
            now: Duration::ZERO,
        }
    }

    /// Read-only view of the current round state.
    pub fn context(&self) -> &RoundContext {
        &self.ctx
    }

    /// Operational counters.
    pub fn stats(&self) -> &DbftStats {
        &self.stats
    }

    /// The current `(height, view)` round.
    pub fn round(&self) -> (BlockIndex, ViewNumber) {
        (self.ctx.block_index, self.ctx.view_number)
    }

    /// The validator registry this node runs against.
    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Round lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    fn on_started(&mut self) -> Vec<Action> {
        let tip = self.ledger.tip();
        let height = tip.index.next();

        let snapshot = self
            .recovered
            .take()
            .filter(|snap| snap.block_index == height);
        let view = snapshot
            .as_ref()
            .map(|snap| snap.view_number)
            .unwrap_or(ViewNumber::ZERO);

        let mut actions = self.begin_height(view);

        if let Some(snap) = snapshot {
            info!(
                height = %snap.block_index,
                view = %snap.view_number,
                had_commit = snap.commit.is_some(),
                "replaying persisted round state"
            );

            for envelope in [&snap.prepare_request, &snap.prepare_response, &snap.pre_commit]
                .into_iter()
                .flatten()
            {
                self.process_payload(envelope.clone(), &mut actions);
            }

            if let Some(commit) = snap.commit {
                self.process_payload(commit.clone(), &mut actions);
                // The commit was signed before the crash; it stands whether
                // or not the proposal it refers to is locally known yet.
                self.ctx.commit_sent = true;
                actions.push(Action::Broadcast(commit));
            }
        }

        actions
    }

    pub(crate) fn begin_height(&mut self, view: ViewNumber) -> Vec<Action> {
        let tip = self.ledger.tip();
        self.ctx = RoundContext::new(&tip, view, &self.validators);

        let height = self.ctx.block_index;
        for pk in self.validators.public_keys() {
            self.last_seen.entry(*pk).or_insert(height);
        }
        if let Some(key) = &self.key {
            self.last_seen.insert(key.public_key(), height);
        }

        let mut actions = Vec::new();
        self.log_round_role();
        self.arm_initial_timer(&mut actions);
        actions
    }

    pub(crate) fn begin_view(&mut self, view: ViewNumber) -> Vec<Action> {
        self.ctx.advance_view(view, &self.validators);

        let mut actions = Vec::new();
        self.log_round_role();
        self.arm_initial_timer(&mut actions);
        actions
    }

    fn log_round_role(&self) {
        let role = match self.validators.my_index() {
            None => "watch-only",
            Some(my) if my == self.ctx.priority_primary => "priority-primary",
            Some(my) if Some(my) == self.ctx.fallback_primary => "fallback-primary",
            Some(_) => "backup",
        };
        info!(
            height = %self.ctx.block_index,
            view = %self.ctx.view_number,
            priority = %self.ctx.priority_primary,
            fallback = ?self.ctx.fallback_primary,
            role,
            "initialized consensus round"
        );
    }

    fn on_block_persisted(&mut self, block: Block) -> Vec<Action> {
        if block.header.index < self.ctx.block_index {
            trace!(index = %block.header.index, "ignoring stale persisted block");
            return Vec::new();
        }
        info!(
            index = %block.header.index,
            block_hash = %block.hash(),
            "ledger advanced; starting next round"
        );
        self.begin_height(ViewNumber::ZERO)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Timer plumbing
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn now_ms(&self) -> u64 {
        self.now.as_millis() as u64
    }

    fn set_timer_action(&self, fire_at_ms: u64) -> Action {
        Action::SetTimer {
            fire_at_ms,
            block_index: self.ctx.block_index,
            view_number: self.ctx.view_number,
        }
    }

    /// Push the deadline forward by `factor` base delays; emits a re-arm
    /// only when the deadline actually moved.
    pub(crate) fn extend_timer(&mut self, factor: u64, actions: &mut Vec<Action>) {
        let base = self.config.ms_per_block / self.validators.m() as u64;
        if let Some(deadline) = self.timer.extend_by_factor(self.now_ms(), factor, base) {
            actions.push(self.set_timer_action(deadline));
        }
    }

    /// Unconditionally re-arm the deadline to `now + delay`.
    pub(crate) fn change_timer(&mut self, delay_ms: u64, actions: &mut Vec<Action>) {
        let deadline = self.timer.change(self.now_ms(), delay_ms);
        actions.push(self.set_timer_action(deadline));
    }

    /// Exponential per-view backoff used for non-primary waits.
    pub(crate) fn backoff_delay(&self, view: ViewNumber) -> u64 {
        self.config
            .ms_per_block
            .checked_shl(u32::from(view.0) + 1)
            .unwrap_or(u64::MAX)
    }

    fn arm_initial_timer(&mut self, actions: &mut Vec<Action>) {
        let delay = if self.my_primary_slot().is_some() {
            // Primaries aim for one block interval after the previous block.
            let elapsed = self.now_ms().saturating_sub(self.ctx.prev_timestamp_ms);
            self.config.ms_per_block.saturating_sub(elapsed)
        } else {
            self.backoff_delay(self.ctx.view_number)
        };
        self.change_timer(delay, actions);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity helpers
    // ═══════════════════════════════════════════════════════════════════════

    /// The slot this node is primary of in the current view, if any.
    pub(crate) fn my_primary_slot(&self) -> Option<SlotId> {
        let my = self.validators.my_index()?;
        self.ctx.slot_of_primary(my)
    }

    pub(crate) fn is_a_primary(&self) -> bool {
        self.my_primary_slot().is_some()
    }

    /// Sign a consensus message for the current round.
    ///
    /// Returns `None` for watch-only nodes, which never sign.
    pub(crate) fn make_envelope(&self, payload: ConsensusPayload) -> Option<Envelope> {
        let key = self.key.as_ref()?;
        let validator_index = self.validators.my_index()?;
        let message = ConsensusMessage {
            block_index: self.ctx.block_index,
            validator_index,
            view_number: self.ctx.view_number,
            payload,
        };
        Some(Envelope::sign(self.config.network, &message, key))
    }

    /// Our own Commit envelope for this height, if we signed one.
    pub(crate) fn my_commit_envelope(&self) -> Option<Envelope> {
        let my = self.validators.my_index()?.as_usize();
        SlotId::ALL
            .iter()
            .find_map(|slot| self.ctx.slot(*slot).commits[my].clone())
    }

    /// Everything this node has signed for the current round.
    pub(crate) fn snapshot(&self) -> ConsensusSnapshot {
        let mut snap = ConsensusSnapshot::empty(self.ctx.block_index, self.ctx.view_number);
        let Some(my) = self.validators.my_index() else {
            return snap;
        };
        let my = my.as_usize();

        for slot_id in SlotId::ALL {
            let slot = self.ctx.slot(slot_id);
            if let Some(envelope) = &slot.preparations[my] {
                match envelope.decode_message().map(|m| m.payload) {
                    Ok(ConsensusPayload::PrepareRequest(_)) => {
                        snap.prepare_request = Some(envelope.clone());
                    }
                    Ok(ConsensusPayload::PrepareResponse(_)) => {
                        snap.prepare_response = Some(envelope.clone());
                    }
                    _ => {}
                }
            }
            if let Some(envelope) = &slot.pre_commits[my] {
                snap.pre_commit = Some(envelope.clone());
            }
            if let Some(envelope) = &slot.commits[my] {
                snap.commit = Some(envelope.clone());
            }
        }
        snap
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Dispatcher
    // ═══════════════════════════════════════════════════════════════════════

    /// Validate an envelope and route it to the matching handler.
    ///
    /// Returns `false` when the envelope was dropped before routing; the
    /// recovery engine uses this to count how many carried payloads were
    /// still meaningful.
    pub(crate) fn process_payload(
        &mut self,
        envelope: Envelope,
        actions: &mut Vec<Action>,
    ) -> bool {
        self.stats.payloads_received += 1;

        if self.ctx.block_sent {
            trace!("block already sent; dropping payload");
            self.stats.payloads_dropped += 1;
            return false;
        }

        let message = match envelope.decode_message() {
            Ok(message) => message,
            Err(error) => {
                debug!(?error, "dropping undecodable consensus payload");
                self.stats.payloads_dropped += 1;
                return false;
            }
        };

        if message.block_index != self.ctx.block_index {
            if message.block_index > self.ctx.block_index {
                warn!(
                    theirs = %message.block_index,
                    ours = %self.ctx.block_index,
                    "chain behind: dropping consensus payload from a future height"
                );
            } else {
                trace!(theirs = %message.block_index, "dropping stale consensus payload");
            }
            self.stats.payloads_dropped += 1;
            return false;
        }

        if !self.validators.contains_index(message.validator_index) {
            warn!(
                validator = %message.validator_index,
                "dropping payload with out-of-range validator index"
            );
            self.stats.payloads_dropped += 1;
            return false;
        }
        let public_key = *self
            .validators
            .public_key(message.validator_index)
            .expect("index bound checked above");

        if Some(envelope.sender) != self.validators.script_hash(message.validator_index) {
            warn!(
                validator = %message.validator_index,
                "dropping payload whose sender does not match the claimed validator"
            );
            self.stats.payloads_dropped += 1;
            return false;
        }

        if !envelope.verify_witness(self.config.network, &public_key) {
            debug!(
                validator = %message.validator_index,
                "dropping payload with an invalid witness"
            );
            self.stats.payloads_dropped += 1;
            return false;
        }

        self.last_seen.insert(public_key, message.block_index);

        let ConsensusMessage {
            validator_index,
            view_number,
            payload,
            ..
        } = message;

        trace!(
            kind = payload.kind(),
            from = %validator_index,
            view = %view_number,
            "dispatching consensus payload"
        );

        match payload {
            ConsensusPayload::ChangeView(cv) => {
                self.on_change_view(envelope, validator_index, cv, actions)
            }
            ConsensusPayload::PrepareRequest(request) => {
                self.on_prepare_request(envelope, validator_index, view_number, request, actions)
            }
            ConsensusPayload::PrepareResponse(response) => {
                self.on_prepare_response(envelope, validator_index, view_number, response, actions)
            }
            ConsensusPayload::PreCommit(pre_commit) => {
                self.on_pre_commit(envelope, validator_index, view_number, pre_commit, actions)
            }
            ConsensusPayload::Commit(commit) => {
                self.on_commit(envelope, validator_index, view_number, commit, actions)
            }
            ConsensusPayload::RecoveryRequest(_) => {
                self.on_recovery_request(envelope, validator_index, actions)
            }
            ConsensusPayload::RecoveryMessage(recovery) => {
                self.on_recovery_message(validator_index, view_number, recovery, actions)
            }
        }

        true
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Proposal (PrepareRequest)
    // ═══════════════════════════════════════════════════════════════════════

    /// Propose a block for the slot this node is primary of.
    pub(crate) fn send_prepare_request(&mut self, slot_id: SlotId, actions: &mut Vec<Action>) {
        let Some(my) = self.validators.my_index() else {
            return;
        };
        if self.ctx.request_sent_or_received {
            return;
        }
        if self.ctx.slot_of_primary(my) != Some(slot_id) {
            return;
        }

        // Select transactions under the policy caps. The verified pool is
        // fee-ordered, so selection stops at the first transaction that
        // would overflow a cap.
        let mut vctx = TransactionVerificationContext::new();
        let mut transactions = Vec::new();
        for tx in self.mempool.verified_transactions() {
            if transactions.len() == self.config.max_transactions_per_block {
                break;
            }
            if tx.valid_until < self.ctx.block_index {
                continue;
            }
            if !vctx.check(&tx, &self.config) {
                break;
            }
            vctx.add(&tx);
            transactions.push(tx);
        }

        let timestamp_ms = self.now_ms().max(self.ctx.prev_timestamp_ms + 1);
        let nonce = self.proposal_nonce(timestamp_ms);
        let transaction_hashes: Vec<Hash> = transactions.iter().map(|tx| tx.hash()).collect();

        let Some(envelope) = self.make_envelope(ConsensusPayload::PrepareRequest(PrepareRequest {
            id: slot_id,
            version: BLOCK_VERSION,
            prev_hash: self.ctx.prev_hash,
            timestamp_ms,
            nonce,
            transaction_hashes: transaction_hashes.clone(),
        })) else {
            return;
        };
        let request_hash = envelope.hash();

        {
            let slot = self.ctx.slot_mut(slot_id);
            slot.install_proposal(request_hash, timestamp_ms, nonce, transaction_hashes);
            for tx in &transactions {
                slot.verification_context.add(tx);
                slot.transactions.insert(tx.hash(), tx.clone());
            }
            slot.preparations[my.as_usize()] = Some(envelope.clone());
        }
        self.ctx.request_sent_or_received = true;

        info!(
            slot = %slot_id,
            tx_count = transactions.len(),
            request_hash = ?request_hash,
            "proposing block"
        );
        actions.push(Action::Broadcast(envelope));
        let backoff = self.backoff_delay(self.ctx.view_number);
        self.change_timer(backoff, actions);
    }

    fn proposal_nonce(&self, timestamp_ms: u64) -> u64 {
        let pk = self
            .key
            .as_ref()
            .map(|k| k.public_key())
            .unwrap_or(PublicKey([0u8; 32]));
        let hash = Hash::from_parts(&[
            b"proposal-nonce",
            pk.as_bytes(),
            &self.ctx.block_index.0.to_le_bytes(),
            &[self.ctx.view_number.0],
            &timestamp_ms.to_le_bytes(),
        ]);
        u64::from_le_bytes(hash.as_bytes()[..8].try_into().expect("hash has 32 bytes"))
    }

    fn on_prepare_request(
        &mut self,
        envelope: Envelope,
        validator_index: ValidatorIndex,
        view_number: ViewNumber,
        request: PrepareRequest,
        actions: &mut Vec<Action>,
    ) {
        if self.ctx.request_sent_or_received {
            trace!("proposal already accepted this view");
            return;
        }
        if self.ctx.not_accepting_payloads_due_to_view_changing {
            trace!("view change pending; not accepting proposals");
            return;
        }
        if view_number != self.ctx.view_number {
            debug!(theirs = %view_number, ours = %self.ctx.view_number, "proposal for a different view");
            return;
        }

        let Some(slot_id) = self.ctx.slot_of_primary(validator_index) else {
            warn!(from = %validator_index, "proposal from a non-primary validator");
            return;
        };
        if request.id != slot_id {
            warn!(
                from = %validator_index,
                claimed = %request.id,
                actual = %slot_id,
                "proposal claims the wrong slot"
            );
            return;
        }

        {
            let slot = self.ctx.slot(slot_id);
            if request.version != slot.header.version || request.prev_hash != slot.header.prev_hash
            {
                warn!(from = %validator_index, "proposal disagrees with the local chain tip");
                return;
            }
        }
        if request.transaction_hashes.len() > self.config.max_transactions_per_block {
            warn!(
                count = request.transaction_hashes.len(),
                "proposal exceeds the transaction count cap"
            );
            return;
        }

        let horizon = self.now_ms() + MAX_TIMESTAMP_DRIFT_BLOCKS * self.config.ms_per_block;
        if request.timestamp_ms <= self.ctx.prev_timestamp_ms || request.timestamp_ms > horizon {
            warn!(
                timestamp = request.timestamp_ms,
                prev = self.ctx.prev_timestamp_ms,
                horizon,
                "proposal timestamp outside the acceptance window"
            );
            return;
        }

        if request
            .transaction_hashes
            .iter()
            .any(|hash| self.ledger.contains_transaction(hash))
        {
            warn!("proposal contains a transaction that is already on chain");
            return;
        }

        info!(
            slot = %slot_id,
            from = %validator_index,
            tx_count = request.transaction_hashes.len(),
            "accepted block proposal"
        );

        self.extend_timer(2, actions);
        self.ctx.request_sent_or_received = true;

        let request_hash = envelope.hash();
        let network = self.config.network;
        let public_keys: Vec<PublicKey> = self.validators.public_keys().to_vec();
        {
            let slot = self.ctx.slot_mut(slot_id);
            slot.install_proposal(
                request_hash,
                request.timestamp_ms,
                request.nonce,
                request.transaction_hashes.clone(),
            );

            // Responses collected early only count if they acknowledge this
            // exact proposal.
            for entry in slot.preparations.iter_mut() {
                let keep = entry
                    .as_ref()
                    .and_then(|env| env.decode_message().ok())
                    .map(|m| match m.payload {
                        ConsensusPayload::PrepareResponse(r) => r.preparation_hash == request_hash,
                        _ => false,
                    })
                    .unwrap_or(false);
                if !keep {
                    *entry = None;
                }
            }

            // Commits that arrived before the proposal can be checked now.
            let sign_data = slot.header.sign_data(network);
            for index in 0..slot.parked_commits.len() {
                let Some(parked) = slot.parked_commits[index].take() else {
                    continue;
                };
                let verified = parked
                    .decode_message()
                    .ok()
                    .and_then(|m| match m.payload {
                        ConsensusPayload::Commit(c) => Some(c.signature),
                        _ => None,
                    })
                    .is_some_and(|sig| verify_signature(&sign_data, &sig, &public_keys[index]));
                if verified {
                    slot.commits[index] = Some(parked);
                } else {
                    warn!(validator = index, "discarding parked commit that does not verify");
                }
            }

            slot.preparations[validator_index.as_usize()] = Some(envelope);
        }

        if request.transaction_hashes.is_empty() {
            self.check_prepare_response(slot_id, actions);
            return;
        }

        // Collect the proposed transactions: verified pool first, then
        // unverified hits, then a fetch for whatever is still missing.
        let wanted = request.transaction_hashes;
        for tx in self.mempool.verified_transactions() {
            let hash = tx.hash();
            if !wanted.contains(&hash) {
                continue;
            }
            if self.ctx.slot(slot_id).transactions.contains_key(&hash) {
                continue;
            }
            if !self.add_transaction(slot_id, tx, false, actions) {
                return;
            }
        }

        let remaining = self.ctx.slot(slot_id).missing_transactions();
        for hash in remaining {
            if let Some((tx, from_verified_pool)) = self.mempool.try_get(&hash) {
                if !self.add_transaction(slot_id, tx, !from_verified_pool, actions) {
                    return;
                }
            }
        }

        let missing = self.ctx.slot(slot_id).missing_transactions();
        if !missing.is_empty() {
            debug!(count = missing.len(), "requesting missing transactions");
            actions.push(Action::FetchTransactions(missing));
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transaction accumulation
    // ═══════════════════════════════════════════════════════════════════════

    fn on_transaction(&mut self, tx: Transaction) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.ctx.block_sent {
            return actions;
        }
        let hash = tx.hash();
        for slot_id in SlotId::ALL {
            let slot = self.ctx.slot(slot_id);
            let wanted = slot.request_hash.is_some()
                && slot.transaction_hashes.contains(&hash)
                && !slot.transactions.contains_key(&hash);
            if wanted && !self.add_transaction(slot_id, tx.clone(), true, &mut actions) {
                break;
            }
        }
        actions
    }

    /// Admit a proposed transaction into a slot.
    ///
    /// `verify` is set for transactions that did not come out of the
    /// verified mempool view; those are checked against the expiry window,
    /// the ledger, and the slot's aggregate policy accumulator. A failure
    /// requests a view change and returns `false`, aborting proposal
    /// processing.
    pub(crate) fn add_transaction(
        &mut self,
        slot_id: SlotId,
        tx: Transaction,
        verify: bool,
        actions: &mut Vec<Action>,
    ) -> bool {
        let hash = tx.hash();
        {
            let slot = self.ctx.slot(slot_id);
            if !slot.transaction_hashes.contains(&hash) || slot.transactions.contains_key(&hash) {
                return true;
            }
        }

        if verify {
            if self.ledger.contains_transaction(&hash) || tx.valid_until < self.ctx.block_index {
                warn!(tx = ?hash, "proposed transaction is expired or already on chain");
                self.request_change_view(tandem_messages::ChangeViewReason::TxInvalid, actions);
                return false;
            }
            if !self
                .ctx
                .slot(slot_id)
                .verification_context
                .check(&tx, &self.config)
            {
                warn!(tx = ?hash, "proposed transaction breaks an aggregate policy limit");
                self.request_change_view(
                    tandem_messages::ChangeViewReason::TxRejectedByPolicy,
                    actions,
                );
                return false;
            }
        }

        {
            let slot = self.ctx.slot_mut(slot_id);
            slot.verification_context.add(&tx);
            slot.transactions.insert(hash, tx);
        }

        let slot = self.ctx.slot(slot_id);
        if slot.request_hash.is_some() && slot.all_transactions_present() {
            self.check_prepare_response(slot_id, actions);
        }
        true
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PrepareResponse / PreCommit reception
    // ═══════════════════════════════════════════════════════════════════════

    fn on_prepare_response(
        &mut self,
        envelope: Envelope,
        validator_index: ValidatorIndex,
        view_number: ViewNumber,
        response: PrepareResponse,
        actions: &mut Vec<Action>,
    ) {
        let slot_id = response.id;
        let idx = validator_index.as_usize();

        if view_number != self.ctx.view_number {
            trace!(theirs = %view_number, "preparation for a different view");
            return;
        }
        if self.ctx.not_accepting_payloads_due_to_view_changing {
            trace!("view change pending; not accepting preparations");
            return;
        }
        if self.ctx.slot(slot_id).preparations[idx].is_some() {
            trace!(from = %validator_index, "duplicate preparation");
            return;
        }
        if let Some(request_hash) = self.ctx.slot(slot_id).request_hash {
            if response.preparation_hash != request_hash {
                debug!(
                    from = %validator_index,
                    "preparation acknowledges a different proposal"
                );
                return;
            }
        }

        debug!(slot = %slot_id, from = %validator_index, "recorded preparation");
        self.extend_timer(2, actions);
        self.ctx.slot_mut(slot_id).preparations[idx] = Some(envelope);

        if !self.validators.is_watch_only()
            && !self.ctx.commit_sent
            && self.ctx.request_sent_or_received
        {
            self.check_preparations(slot_id, actions);
        }
    }

    fn on_pre_commit(
        &mut self,
        envelope: Envelope,
        validator_index: ValidatorIndex,
        view_number: ViewNumber,
        pre_commit: PreCommit,
        actions: &mut Vec<Action>,
    ) {
        let slot_id = pre_commit.id;
        let idx = validator_index.as_usize();

        if view_number != self.ctx.view_number {
            trace!(theirs = %view_number, "pre-commit for a different view");
            return;
        }
        if self.ctx.not_accepting_payloads_due_to_view_changing {
            trace!("view change pending; not accepting pre-commits");
            return;
        }
        if self.ctx.slot(slot_id).pre_commits[idx].is_some() {
            trace!(from = %validator_index, "duplicate pre-commit");
            return;
        }
        // A pre-commit that arrives ahead of the proposal is acceptable as
        // long as it does not contradict a proposal we have already pinned.
        if let Some(request_hash) = self.ctx.slot(slot_id).request_hash {
            if pre_commit.preparation_hash != request_hash {
                debug!(from = %validator_index, "pre-commit gates on a different proposal");
                return;
            }
        }

        debug!(slot = %slot_id, from = %validator_index, "recorded pre-commit");
        self.extend_timer(2, actions);
        self.ctx.slot_mut(slot_id).pre_commits[idx] = Some(envelope);

        if !self.validators.is_watch_only()
            && !self.ctx.commit_sent
            && self.ctx.request_sent_or_received
        {
            self.check_pre_commits(slot_id, false, actions);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Commit reception
    // ═══════════════════════════════════════════════════════════════════════

    fn on_commit(
        &mut self,
        envelope: Envelope,
        validator_index: ValidatorIndex,
        view_number: ViewNumber,
        commit: Commit,
        actions: &mut Vec<Action>,
    ) {
        let slot_id = commit.id;
        let idx = validator_index.as_usize();

        // One commit per validator per (view, slot); a second, different
        // envelope is equivocation and never replaces the first.
        let existing = self.existing_commit_hash(view_number, slot_id, idx);
        if let Some(existing_hash) = existing {
            if existing_hash != envelope.hash() {
                warn!(
                    from = %validator_index,
                    view = %view_number,
                    "equivocating commit discarded"
                );
            } else {
                trace!(from = %validator_index, "duplicate commit");
            }
            return;
        }

        self.extend_timer(4, actions);

        if view_number == self.ctx.view_number {
            if !self.ctx.slot(slot_id).header_finalized {
                debug!(
                    slot = %slot_id,
                    from = %validator_index,
                    "parking commit: no proposal for the slot yet"
                );
                self.ctx.slot_mut(slot_id).parked_commits[idx] = Some(envelope);
                return;
            }

            let sign_data = self.ctx.slot(slot_id).header.sign_data(self.config.network);
            let public_key = *self
                .validators
                .public_key(validator_index)
                .expect("dispatcher bounds the index");
            if verify_signature(&sign_data, &commit.signature, &public_key) {
                debug!(slot = %slot_id, from = %validator_index, "recorded commit");
                self.ctx.slot_mut(slot_id).commits[idx] = Some(envelope);
                self.check_commits(slot_id, actions);
            } else {
                warn!(from = %validator_index, "commit signature does not verify");
            }
        } else {
            self.park_cross_view_commit(
                view_number,
                slot_id,
                validator_index,
                envelope,
                commit.signature,
                actions,
            );
        }
    }

    fn existing_commit_hash(
        &self,
        view_number: ViewNumber,
        slot_id: SlotId,
        idx: usize,
    ) -> Option<Hash> {
        if view_number == self.ctx.view_number {
            let slot = self.ctx.slot(slot_id);
            slot.commits[idx]
                .as_ref()
                .or(slot.parked_commits[idx].as_ref())
                .map(Envelope::hash)
        } else if let Some(archive) = self.ctx.prior_proposals.get(&(view_number, slot_id)) {
            archive.commits[idx].as_ref().map(Envelope::hash)
        } else {
            self.ctx
                .parked_cross_view_commits
                .get(&(view_number, slot_id))
                .and_then(|entries| entries[idx].as_ref())
                .map(Envelope::hash)
        }
    }

    /// Handle a commit for a view other than the current one.
    ///
    /// If the matching proposal from that view is archived, the commit is
    /// verified against its header immediately and can complete that
    /// proposal's block at a safety quorum; otherwise the claim is parked
    /// until the header data shows up (typically via recovery).
    fn park_cross_view_commit(
        &mut self,
        view_number: ViewNumber,
        slot_id: SlotId,
        validator_index: ValidatorIndex,
        envelope: Envelope,
        signature: tandem_types::Signature,
        actions: &mut Vec<Action>,
    ) {
        let idx = validator_index.as_usize();
        let network = self.config.network;
        let m = self.validators.m();
        let public_key = *self
            .validators
            .public_key(validator_index)
            .expect("dispatcher bounds the index");

        if let Some(archive) = self.ctx.prior_proposals.get_mut(&(view_number, slot_id)) {
            if !verify_signature(&archive.header.sign_data(network), &signature, &public_key) {
                warn!(
                    from = %validator_index,
                    view = %view_number,
                    "cross-view commit signature does not verify"
                );
                return;
            }
            debug!(from = %validator_index, view = %view_number, "verified commit for an earlier view");
            archive.commits[idx] = Some(envelope);

            if archive.count_commits() >= m && archive.all_transactions_present() {
                let header = archive.header.clone();
                let transactions = archive
                    .ordered_transactions()
                    .expect("all transactions present");
                let commits = archive.commits.clone();
                self.submit_block(header, transactions, &commits, actions);
            }
        } else {
            debug!(
                from = %validator_index,
                view = %view_number,
                "parking commit for another view"
            );
            let n = self.validators.len();
            let entries = self
                .ctx
                .parked_cross_view_commits
                .entry((view_number, slot_id))
                .or_insert_with(|| vec![None; n]);
            entries[idx] = Some(envelope);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Phase logic thresholds
    // ═══════════════════════════════════════════════════════════════════════

    /// Runs once a slot's proposal is accepted and fully disseminated:
    /// enforce block-level policy, acknowledge the proposal, and start
    /// counting preparations.
    pub(crate) fn check_prepare_response(
        &mut self,
        slot_id: SlotId,
        actions: &mut Vec<Action>,
    ) -> bool {
        if self.is_a_primary() || self.validators.is_watch_only() {
            return true;
        }
        let Some(my) = self.validators.my_index() else {
            return true;
        };

        if self.ctx.slot(slot_id).preparations[my.as_usize()].is_none() {
            let Some(preparation_hash) = self.ctx.slot(slot_id).request_hash else {
                return false;
            };

            // Block-level policy: the assembled block must fit the caps.
            let slot = self.ctx.slot(slot_id);
            let transactions = slot.ordered_transactions().unwrap_or_default();
            let assembled = Block {
                header: slot.header.clone(),
                transactions,
                witness: Vec::new(),
            };
            let system_fee = slot.verification_context.system_fee();
            if assembled.size() > self.config.max_block_size
                || system_fee > self.config.max_block_system_fee
            {
                warn!(
                    size = assembled.size(),
                    system_fee,
                    "assembled proposal violates block policy"
                );
                self.request_change_view(
                    tandem_messages::ChangeViewReason::BlockRejectedByPolicy,
                    actions,
                );
                return false;
            }

            self.extend_timer(2, actions);
            let Some(envelope) =
                self.make_envelope(ConsensusPayload::PrepareResponse(PrepareResponse {
                    id: slot_id,
                    preparation_hash,
                }))
            else {
                return false;
            };
            info!(slot = %slot_id, "acknowledging proposal");
            self.ctx.slot_mut(slot_id).preparations[my.as_usize()] = Some(envelope.clone());
            actions.push(Action::Broadcast(envelope));
        }

        self.check_preparations(slot_id, actions);
        true
    }

    /// Move a slot to the pre-commit phase when its preparation threshold
    /// is met: `F + 1` entries for the priority slot, `M` for the fallback.
    pub(crate) fn check_preparations(&mut self, slot_id: SlotId, actions: &mut Vec<Action>) {
        if self.ctx.block_sent {
            return;
        }
        let (count, ready) = {
            let slot = self.ctx.slot(slot_id);
            (
                slot.count_preparations(),
                slot.request_hash.is_some() && slot.all_transactions_present(),
            )
        };
        if !ready {
            return;
        }

        let threshold = match slot_id {
            SlotId::Priority => self.validators.f() + 1,
            SlotId::Fallback => self.validators.m(),
        };
        if count >= threshold {
            self.send_pre_commit(slot_id, actions);
            self.check_pre_commits(slot_id, false, actions);
        }

        // Speed-up: a priority proposal that already has a full safety
        // quorum of preparations skips the pre-commit round trip.
        if slot_id == SlotId::Priority && count >= self.validators.m() {
            self.check_pre_commits(slot_id, true, actions);
        }
    }

    fn send_pre_commit(&mut self, slot_id: SlotId, actions: &mut Vec<Action>) {
        let Some(my) = self.validators.my_index() else {
            return;
        };
        if self.ctx.commit_sent || self.ctx.slot(slot_id).pre_commits[my.as_usize()].is_some() {
            return;
        }
        let Some(preparation_hash) = self.ctx.slot(slot_id).request_hash else {
            return;
        };

        let Some(envelope) = self.make_envelope(ConsensusPayload::PreCommit(PreCommit {
            id: slot_id,
            preparation_hash,
        })) else {
            return;
        };
        self.ctx.slot_mut(slot_id).pre_commits[my.as_usize()] = Some(envelope.clone());

        // Durable before visible: a restarted node must reissue exactly this.
        actions.push(Action::SaveState(Box::new(self.snapshot())));
        info!(slot = %slot_id, "sending pre-commit");
        actions.push(Action::Broadcast(envelope));
        self.change_timer(self.config.ms_per_block, actions);
    }

    /// Lock a commit signature once `M` pre-commits are in (or the
    /// preparation speed-up forced the transition).
    pub(crate) fn check_pre_commits(
        &mut self,
        slot_id: SlotId,
        forced: bool,
        actions: &mut Vec<Action>,
    ) {
        if self.ctx.block_sent {
            return;
        }
        let ready = {
            let slot = self.ctx.slot(slot_id);
            slot.header_finalized && slot.all_transactions_present()
        };
        if !ready {
            return;
        }
        if !forced && self.ctx.slot(slot_id).count_pre_commits() < self.validators.m() {
            return;
        }

        self.send_commit(slot_id, actions);
        self.check_commits(slot_id, actions);
    }

    fn send_commit(&mut self, slot_id: SlotId, actions: &mut Vec<Action>) {
        let Some(my) = self.validators.my_index() else {
            return;
        };
        if self.ctx.commit_sent || self.ctx.slot(slot_id).commits[my.as_usize()].is_some() {
            return;
        }
        let Some(key) = self.key.as_ref() else {
            return;
        };

        let sign_data = self.ctx.slot(slot_id).header.sign_data(self.config.network);
        let signature = key.sign(&sign_data);
        let Some(envelope) = self.make_envelope(ConsensusPayload::Commit(Commit {
            id: slot_id,
            signature,
        })) else {
            return;
        };
        self.ctx.slot_mut(slot_id).commits[my.as_usize()] = Some(envelope.clone());
        self.ctx.commit_sent = true;

        actions.push(Action::SaveState(Box::new(self.snapshot())));
        info!(slot = %slot_id, "sending commit");
        actions.push(Action::Broadcast(envelope));
        self.change_timer(self.config.ms_per_block, actions);
    }

    /// Assemble and submit the block once `M` verified commits agree on a
    /// slot's finalized header.
    pub(crate) fn check_commits(&mut self, slot_id: SlotId, actions: &mut Vec<Action>) {
        if self.ctx.block_sent {
            return;
        }
        let m = self.validators.m();
        let slot = self.ctx.slot(slot_id);
        if !slot.header_finalized
            || slot.count_commits() < m
            || !slot.all_transactions_present()
        {
            return;
        }

        let header = slot.header.clone();
        let transactions = slot
            .ordered_transactions()
            .expect("all transactions present");
        let commits = slot.commits.clone();
        self.submit_block(header, transactions, &commits, actions);
    }

    fn submit_block(
        &mut self,
        header: BlockHeader,
        transactions: Vec<Transaction>,
        commits: &[Option<Envelope>],
        actions: &mut Vec<Action>,
    ) {
        let block = build_block(header, transactions, commits, self.validators.m());
        info!(
            index = %block.header.index,
            block_hash = %block.hash(),
            tx_count = block.transactions.len(),
            signatures = block.witness.len(),
            "block reached commit quorum"
        );

        self.stats.blocks_built += 1;
        self.stats.block_received_index = Some(block.header.index);
        self.stats.block_received_time_ms = self.now_ms();
        self.ctx.block_sent = true;
        actions.push(Action::SubmitBlock(Box::new(block)));
    }
}

/// Assemble a block from a finalized header and a quorum of commits.
fn build_block(
    header: BlockHeader,
    transactions: Vec<Transaction>,
    commits: &[Option<Envelope>],
    m: usize,
) -> Block {
    let mut witness = Vec::with_capacity(m);
    for (index, entry) in commits.iter().enumerate() {
        if witness.len() == m {
            break;
        }
        let Some(envelope) = entry else { continue };
        if let Ok(message) = envelope.decode_message() {
            if let ConsensusPayload::Commit(commit) = message.payload {
                witness.push((ValidatorIndex(index as u8), commit.signature));
            }
        }
    }
    Block {
        header,
        transactions,
        witness,
    }
}

impl StateMachine for DbftState {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::Started => self.on_started(),
            Event::TimerFired {
                block_index,
                view_number,
            } => self.on_timer(block_index, view_number),
            Event::PayloadReceived { envelope } => {
                let mut actions = Vec::new();
                self.process_payload(envelope, &mut actions);
                actions
            }
            Event::TransactionReceived { tx } => self.on_transaction(tx),
            Event::BlockPersisted { block } => self.on_block_persisted(block),
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}
