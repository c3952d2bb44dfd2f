//! Typed consensus messages.
//!
//! The seven message kinds are one tagged enum with a shared header, so
//! dispatch is exhaustive pattern matching with no default arm.

use crate::RecoveryMessage;
use sbor::prelude::*;
use tandem_types::{BlockIndex, Hash, Signature, ValidatorIndex, ViewNumber};

/// One of the two parallel proposal tracks within a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BasicSbor)]
#[repr(u8)]
pub enum SlotId {
    /// The priority primary's slot.
    Priority = 0,

    /// The fallback primary's slot.
    Fallback = 1,
}

impl SlotId {
    /// Both slots, priority first.
    pub const ALL: [SlotId; 2] = [SlotId::Priority, SlotId::Fallback];

    /// Table index for this slot.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotId::Priority => write!(f, "priority"),
            SlotId::Fallback => write!(f, "fallback"),
        }
    }
}

/// Why a validator asked for a view change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
#[repr(u8)]
pub enum ChangeViewReason {
    /// The round timer expired without enough progress.
    Timeout = 0,

    /// Joining a view change that already has agreement.
    ChangeAgreement = 1,

    /// A proposed transaction could not be obtained.
    TxNotFound = 2,

    /// A proposed transaction violates an aggregate policy limit.
    TxRejectedByPolicy = 3,

    /// A proposed transaction failed verification.
    TxInvalid = 4,

    /// The assembled block violates a policy limit.
    BlockRejectedByPolicy = 5,
}

/// Vote to abandon the current view.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ChangeView {
    /// The view this validator wants to move to.
    pub new_view_number: ViewNumber,

    /// Sender's clock when the request was made (milliseconds).
    pub timestamp_ms: u64,

    /// Why the change was requested.
    pub reason: ChangeViewReason,
}

/// A primary's block proposal for its slot.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct PrepareRequest {
    /// Which slot this proposal fills.
    pub id: SlotId,

    /// Block format version the proposal targets.
    pub version: u32,

    /// Hash of the previous block.
    pub prev_hash: Hash,

    /// Proposed block timestamp (milliseconds).
    pub timestamp_ms: u64,

    /// Proposed block nonce.
    pub nonce: u64,

    /// Proposed transaction hashes, in block order. May be empty.
    pub transaction_hashes: Vec<Hash>,
}

/// A backup's acknowledgement of a slot's proposal.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct PrepareResponse {
    /// Which slot is being acknowledged.
    pub id: SlotId,

    /// Envelope hash of the PrepareRequest being acknowledged.
    pub preparation_hash: Hash,
}

/// Progress gate between preparation and commit.
///
/// Sent once a slot's preparation threshold is met and every proposed
/// transaction is locally available; signals readiness to lock signatures.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct PreCommit {
    /// Which slot is ready.
    pub id: SlotId,

    /// Envelope hash of the PrepareRequest being gated on.
    pub preparation_hash: Hash,
}

/// A validator's signature over a slot's finalized block header.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Commit {
    /// Which slot the signature is for.
    pub id: SlotId,

    /// Signature over the slot header's sign-data.
    pub signature: Signature,
}

/// Plea for peers to retransmit the current round's state.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct RecoveryRequest {
    /// Sender's clock when the request was made (milliseconds).
    pub timestamp_ms: u64,
}

/// The message variants, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum ConsensusPayload {
    /// Vote to abandon the current view.
    ChangeView(ChangeView),

    /// A primary's block proposal.
    PrepareRequest(PrepareRequest),

    /// A backup's acknowledgement of a proposal.
    PrepareResponse(PrepareResponse),

    /// Readiness gate before signature locking.
    PreCommit(PreCommit),

    /// Signature over a finalized slot header.
    Commit(Commit),

    /// Plea for round-state retransmission.
    RecoveryRequest(RecoveryRequest),

    /// Bundled round-state retransmission.
    RecoveryMessage(RecoveryMessage),
}

impl ConsensusPayload {
    /// Human-readable kind for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusPayload::ChangeView(_) => "ChangeView",
            ConsensusPayload::PrepareRequest(_) => "PrepareRequest",
            ConsensusPayload::PrepareResponse(_) => "PrepareResponse",
            ConsensusPayload::PreCommit(_) => "PreCommit",
            ConsensusPayload::Commit(_) => "Commit",
            ConsensusPayload::RecoveryRequest(_) => "RecoveryRequest",
            ConsensusPayload::RecoveryMessage(_) => "RecoveryMessage",
        }
    }
}

/// A consensus message: shared header plus kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ConsensusMessage {
    /// Height this message belongs to.
    pub block_index: BlockIndex,

    /// Index of the sending validator.
    pub validator_index: ValidatorIndex,

    /// View this message was produced in.
    pub view_number: ViewNumber,

    /// Kind-specific payload.
    pub payload: ConsensusPayload,
}

impl ConsensusMessage {
    /// Encode to SBOR bytes for an envelope body.
    pub fn encode(&self) -> Vec<u8> {
        basic_encode(self).expect("consensus message serialization should never fail")
    }

    /// Decode from an envelope body.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageDecodeError> {
        basic_decode(bytes).map_err(MessageDecodeError::Sbor)
    }
}

/// Errors that can occur when decoding a consensus message body.
#[derive(Debug, thiserror::Error)]
pub enum MessageDecodeError {
    /// The body is not a valid SBOR encoding of a consensus message.
    #[error("invalid consensus message encoding: {0:?}")]
    Sbor(sbor::DecodeError),
}
