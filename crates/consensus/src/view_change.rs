//! Timeout handling and view changes.
//!
//! A view change abandons the current round's primaries and restarts the
//! height under the next rotation. Nodes vote with ChangeView messages;
//! once `M` validators ask for a view at or beyond some target, everyone
//! moves. Two rules protect safety and liveness:
//!
//! - a node that has signed a Commit never votes to leave its view, and
//! - a node that can see that more than `F` validators are already
//!   committed or unreachable solicits recovery instead of voting, since a
//!   view change could no longer gather `M` votes anyway.

use crate::context::decoded_new_view;
use crate::state::DbftState;
use tandem_core::Action;
use tandem_messages::{ChangeView, ChangeViewReason, ConsensusPayload, Envelope};
use tandem_types::{BlockIndex, ValidatorIndex, ViewNumber};
use tracing::{debug, info, trace, warn};

impl DbftState {
    /// Handle the round timer firing.
    ///
    /// A primary that has not proposed yet proposes now. A node that has
    /// locked a commit re-broadcasts it (its most advanced message) and
    /// re-arms. Anyone else has made no further progress and votes to
    /// change the view.
    pub(crate) fn on_timer(
        &mut self,
        block_index: BlockIndex,
        view_number: ViewNumber,
    ) -> Vec<Action> {
        let mut actions = Vec::new();

        if block_index != self.ctx.block_index || view_number != self.ctx.view_number {
            trace!(%block_index, %view_number, "stale timer");
            return actions;
        }
        if self.ctx.block_sent || self.validators.is_watch_only() {
            return actions;
        }

        debug!(
            height = %self.ctx.block_index,
            view = %self.ctx.view_number,
            "round timer expired"
        );

        if self.is_a_primary() && !self.ctx.request_sent_or_received {
            if let Some(slot_id) = self.my_primary_slot() {
                self.send_prepare_request(slot_id, &mut actions);
            }
        } else if self.ctx.commit_sent {
            if let Some(envelope) = self.my_commit_envelope() {
                debug!("re-broadcasting commit");
                actions.push(Action::Broadcast(envelope));
            }
            self.change_timer(self.config.ms_per_block, &mut actions);
        } else {
            // Distinguish a round stuck on missing payload from one that is
            // simply quiet.
            let awaiting_transactions = tandem_messages::SlotId::ALL.iter().any(|slot_id| {
                let slot = self.ctx.slot(*slot_id);
                slot.request_hash.is_some() && !slot.all_transactions_present()
            });
            let reason = if awaiting_transactions {
                ChangeViewReason::TxNotFound
            } else {
                ChangeViewReason::Timeout
            };
            self.request_change_view(reason, &mut actions);
        }

        actions
    }

    /// Vote to abandon the current view.
    pub(crate) fn request_change_view(
        &mut self,
        reason: ChangeViewReason,
        actions: &mut Vec<Action>,
    ) {
        if self.validators.is_watch_only() || self.ctx.commit_sent || self.ctx.block_sent {
            return;
        }

        self.ctx.not_accepting_payloads_due_to_view_changing = true;
        let new_view = self.ctx.view_number.next();

        // If more than F validators have locked a commit or gone quiet, a
        // view change can no longer gather M votes; ask for their state
        // instead of voting.
        let committed = self.ctx.count_committed();
        let failed = self.count_failed();
        if committed + failed > self.validators.f() {
            warn!(
                committed,
                failed,
                "nodes committed or lost beyond the fault budget; soliciting recovery"
            );
            if let Some(envelope) =
                self.make_envelope(ConsensusPayload::RecoveryRequest(
                    tandem_messages::RecoveryRequest {
                        timestamp_ms: self.now_ms(),
                    },
                ))
            {
                self.stats.recovery_requests_sent += 1;
                actions.push(Action::Broadcast(envelope));
            }
            let backoff = self.backoff_delay(new_view);
            self.change_timer(backoff, actions);
            return;
        }

        info!(%new_view, ?reason, "requesting view change");
        let Some(envelope) = self.make_envelope(ConsensusPayload::ChangeView(ChangeView {
            new_view_number: new_view,
            timestamp_ms: self.now_ms(),
            reason,
        })) else {
            return;
        };
        if let Some(my) = self.validators.my_index() {
            self.ctx.change_views[my.as_usize()] = Some(envelope.clone());
        }
        actions.push(Action::Broadcast(envelope));

        let backoff = self.backoff_delay(new_view);
        self.change_timer(backoff, actions);
        self.check_expected_view(new_view, actions);
    }

    /// Handle a received ChangeView message.
    pub(crate) fn on_change_view(
        &mut self,
        envelope: Envelope,
        validator_index: ValidatorIndex,
        change_view: ChangeView,
        actions: &mut Vec<Action>,
    ) {
        let idx = validator_index.as_usize();

        if change_view.new_view_number <= self.ctx.view_number {
            // The sender is behind and needs our state; answer, then fall
            // through so its vote is still recorded and carried in future
            // recovery bundles.
            trace!(
                from = %validator_index,
                target = %change_view.new_view_number,
                "stale change view treated as recovery request"
            );
            self.respond_with_recovery(envelope.clone(), validator_index, actions);
        }

        if self.ctx.commit_sent {
            trace!(from = %validator_index, "commit locked; ignoring change view");
            return;
        }

        // Per-validator monotonicity: a validator can only raise its target.
        let expected = self.ctx.change_views[idx]
            .as_ref()
            .and_then(decoded_new_view)
            .unwrap_or(ViewNumber::ZERO);
        if change_view.new_view_number <= expected {
            trace!(
                from = %validator_index,
                target = %change_view.new_view_number,
                %expected,
                "non-monotonic change view"
            );
            return;
        }

        debug!(
            from = %validator_index,
            target = %change_view.new_view_number,
            reason = ?change_view.reason,
            "recorded change view"
        );
        self.ctx.change_views[idx] = Some(envelope);
        self.check_expected_view(change_view.new_view_number, actions);
    }

    /// Adopt `target` once `M` validators ask for it (or beyond).
    pub(crate) fn check_expected_view(&mut self, target: ViewNumber, actions: &mut Vec<Action>) {
        if self.ctx.view_number >= target {
            return;
        }

        let count = self
            .ctx
            .change_views
            .iter()
            .flatten()
            .filter_map(decoded_new_view)
            .filter(|v| *v >= target)
            .count();
        if count < self.validators.m() {
            return;
        }

        // Join the agreement before moving, so peers still counting can
        // reach the threshold from our vote too.
        if let Some(my) = self.validators.my_index() {
            let mine = self.ctx.change_views[my.as_usize()]
                .as_ref()
                .and_then(decoded_new_view);
            if mine.map_or(true, |v| v < target) {
                if let Some(envelope) =
                    self.make_envelope(ConsensusPayload::ChangeView(ChangeView {
                        new_view_number: target,
                        timestamp_ms: self.now_ms(),
                        reason: ChangeViewReason::ChangeAgreement,
                    }))
                {
                    self.ctx.change_views[my.as_usize()] = Some(envelope.clone());
                    actions.push(Action::Broadcast(envelope));
                }
            }
        }

        self.stats.view_changes += 1;
        info!(%target, "view change agreed; moving to new view");
        let follow_up = self.begin_view(target);
        actions.extend(follow_up);
    }

    /// Validators that have been quiet for more than a full height.
    ///
    /// A validator heard at the previous height still counts as alive; only
    /// falling further behind marks it failed.
    pub(crate) fn count_failed(&self) -> usize {
        self.validators
            .public_keys()
            .iter()
            .filter(|pk| {
                self.last_seen
                    .get(*pk)
                    .map(|seen| seen.0 + 1 < self.ctx.block_index.0)
                    .unwrap_or(true)
            })
            .count()
    }
}
