//! Recovery message payload.

use crate::Envelope;
use sbor::prelude::*;

/// Bundled retransmission of a node's current round state.
///
/// Carries the original envelopes verbatim, grouped by kind, so a lagging
/// peer can re-inject each one through its own dispatcher and arrive at the
/// same state the sender holds. Carrying full envelopes (rather than
/// compacted signatures) keeps re-injection byte-identical with first
/// delivery: same hashes, same witnesses, same dedup behavior.
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct RecoveryMessage {
    /// Latest ChangeView envelope per validator that sent one.
    pub change_views: Vec<Envelope>,

    /// The accepted PrepareRequest for this round, if any.
    pub prepare_request: Option<Envelope>,

    /// PrepareResponse envelopes received this round, both slots.
    pub preparations: Vec<Envelope>,

    /// PreCommit envelopes received this round, both slots.
    pub pre_commits: Vec<Envelope>,

    /// Commit envelopes received this round, both slots.
    pub commits: Vec<Envelope>,
}

impl RecoveryMessage {
    /// Total number of carried payloads, for logging.
    pub fn payload_count(&self) -> usize {
        self.change_views.len()
            + usize::from(self.prepare_request.is_some())
            + self.preparations.len()
            + self.pre_commits.len()
            + self.commits.len()
    }

    /// Whether the bundle carries nothing at all.
    pub fn is_empty(&self) -> bool {
        self.payload_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_count_empty() {
        let message = RecoveryMessage::default();
        assert!(message.is_empty());
        assert_eq!(message.payload_count(), 0);
    }
}
