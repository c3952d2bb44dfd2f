//! Recovery engine.
//!
//! Recovery brings a lagging peer back into the round by retransmitting
//! the envelopes the responder has accumulated. Three rules keep it cheap
//! and abuse-resistant:
//!
//! - each request envelope is answered at most once per round
//!   (`known_recovery_hashes`),
//! - while uncommitted, only the `F` validators after the requester in
//!   rotation order respond, bounding fan-out per request, and
//! - a committed node always responds, since its locked commit is exactly
//!   what a stuck round needs to make progress.

use crate::state::DbftState;
use tandem_core::Action;
use tandem_messages::{ConsensusPayload, Envelope, RecoveryMessage, SlotId};
use tandem_types::{ValidatorIndex, ViewNumber};
use tracing::{debug, info, trace};

impl DbftState {
    /// Handle a RecoveryRequest message.
    pub(crate) fn on_recovery_request(
        &mut self,
        envelope: Envelope,
        validator_index: ValidatorIndex,
        actions: &mut Vec<Action>,
    ) {
        self.respond_with_recovery(envelope, validator_index, actions);
    }

    /// Answer a recovery solicitation (explicit request or stale change
    /// view) if this node is among the designated responders.
    pub(crate) fn respond_with_recovery(
        &mut self,
        envelope: Envelope,
        requester: ValidatorIndex,
        actions: &mut Vec<Action>,
    ) {
        if !self.ctx.known_recovery_hashes.insert(envelope.hash()) {
            trace!(from = %requester, "recovery request already answered");
            return;
        }
        if self.validators.is_watch_only() {
            return;
        }
        if !self.should_send_recovery(requester) {
            trace!(from = %requester, "not a designated responder for this request");
            return;
        }

        let recovery = self.make_recovery_message();
        let Some(reply) = self.make_envelope(ConsensusPayload::RecoveryMessage(recovery)) else {
            return;
        };
        self.stats.recoveries_sent += 1;
        info!(to = %requester, "sending recovery message");
        actions.push(Action::Broadcast(reply));
    }

    /// The rotating-responder rule: while uncommitted, only the `F`
    /// validators following the requester answer; once committed, always.
    pub(crate) fn should_send_recovery(&self, requester: ValidatorIndex) -> bool {
        if self.ctx.commit_sent {
            return true;
        }
        let Some(my) = self.validators.my_index() else {
            return false;
        };
        let n = self.validators.len();
        (1..=self.validators.f()).any(|i| (requester.as_usize() + i) % n == my.as_usize())
    }

    /// Bundle the current round's envelopes for a lagging peer.
    pub(crate) fn make_recovery_message(&self) -> RecoveryMessage {
        let mut recovery = RecoveryMessage {
            change_views: self.ctx.change_views.iter().flatten().cloned().collect(),
            ..RecoveryMessage::default()
        };

        for slot_id in SlotId::ALL {
            let slot = self.ctx.slot(slot_id);
            for envelope in slot.preparations.iter().flatten() {
                match envelope.decode_message().map(|m| m.payload) {
                    Ok(ConsensusPayload::PrepareRequest(_)) => {
                        recovery.prepare_request = Some(envelope.clone());
                    }
                    Ok(ConsensusPayload::PrepareResponse(_)) => {
                        recovery.preparations.push(envelope.clone());
                    }
                    _ => {}
                }
            }
            recovery
                .pre_commits
                .extend(slot.pre_commits.iter().flatten().cloned());
            recovery
                .commits
                .extend(slot.commits.iter().flatten().cloned());
            recovery
                .commits
                .extend(slot.parked_commits.iter().flatten().cloned());
        }

        // Commits from earlier views still prove who is locked.
        for archive in self.ctx.prior_proposals.values() {
            recovery
                .commits
                .extend(archive.commits.iter().flatten().cloned());
        }

        recovery
    }

    /// Handle a received RecoveryMessage by re-injecting the carried
    /// payloads through the dispatcher.
    pub(crate) fn on_recovery_message(
        &mut self,
        validator_index: ValidatorIndex,
        view_number: ViewNumber,
        recovery: RecoveryMessage,
        actions: &mut Vec<Action>,
    ) {
        self.stats.recoveries_received += 1;
        self.is_recovering = true;

        let mut total = 0usize;
        let mut valid = 0usize;

        // Change views from a later view can pull us forward.
        if view_number > self.ctx.view_number && !self.ctx.commit_sent {
            for envelope in &recovery.change_views {
                self.reinject(envelope.clone(), actions, &mut total, &mut valid);
            }
        }

        // Same view (possibly just adopted above): take the proposal and
        // the preparation-phase payloads.
        if view_number == self.ctx.view_number
            && !self.ctx.not_accepting_payloads_due_to_view_changing
            && !self.ctx.commit_sent
        {
            if !self.ctx.request_sent_or_received {
                if let Some(request) = &recovery.prepare_request {
                    self.reinject(request.clone(), actions, &mut total, &mut valid);
                } else if let Some(slot_id) = self.my_primary_slot() {
                    // No proposal in flight anywhere: a primary may (re)issue
                    // its own. The fallback only does so in the initial view.
                    let may_synthesize =
                        slot_id == SlotId::Priority || view_number == ViewNumber::ZERO;
                    if may_synthesize {
                        self.send_prepare_request(slot_id, actions);
                    }
                }
            }
            for envelope in &recovery.preparations {
                self.reinject(envelope.clone(), actions, &mut total, &mut valid);
            }
            for envelope in &recovery.pre_commits {
                self.reinject(envelope.clone(), actions, &mut total, &mut valid);
            }
        }

        // Commits are always worth re-injecting for current or earlier
        // views: matched against archived header data they can still
        // complete a block.
        if view_number <= self.ctx.view_number {
            for envelope in &recovery.commits {
                self.reinject(envelope.clone(), actions, &mut total, &mut valid);
            }
        }

        self.is_recovering = false;
        debug!(
            from = %validator_index,
            valid,
            total,
            "processed recovery message"
        );
    }

    fn reinject(
        &mut self,
        envelope: Envelope,
        actions: &mut Vec<Action>,
        total: &mut usize,
        valid: &mut usize,
    ) {
        *total += 1;
        if self.process_payload(envelope, actions) {
            *valid += 1;
        }
    }
}
