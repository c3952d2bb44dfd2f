//! Network messages for the consensus protocol.
//!
//! A consensus message travels inside an [`Envelope`]: a signed, sender-
//! attributed container whose body is the SBOR encoding of a
//! [`ConsensusMessage`]. The seven message kinds share a common header
//! (block index, validator index, view number) and differ in their
//! [`ConsensusPayload`] variant.

mod consensus;
mod envelope;
mod recovery;

pub use consensus::{
    ChangeView, ChangeViewReason, Commit, ConsensusMessage, ConsensusPayload, MessageDecodeError,
    PreCommit, PrepareRequest, PrepareResponse, RecoveryRequest, SlotId,
};
pub use envelope::Envelope;
pub use recovery::RecoveryMessage;
