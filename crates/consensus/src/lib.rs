//! Dual-primary dBFT consensus state machine.
//!
//! This crate provides a synchronous consensus implementation for a
//! permissioned validator set: once per block height the set agrees on an
//! ordered list of transactions and produces a signed block.
//!
//! # Architecture
//!
//! The state machine processes events synchronously:
//!
//! - `Event::Started` → restore persisted self-state, arm the round timer
//! - `Event::PayloadReceived` → validate, dispatch to the typed handler
//! - `Event::TimerFired` → propose, re-broadcast, or request a view change
//! - `Event::TransactionReceived` → fill in a proposal's missing payload
//! - `Event::BlockPersisted` → move to the next height
//!
//! All I/O is performed by the runner via returned `Action`s.
//!
//! # Protocol
//!
//! Each view runs **two primaries in parallel**: a priority primary at
//! `(h - v) mod N` and a fallback at `(h - v - 1) mod N`. Both may propose;
//! every backup acknowledges whichever proposal reaches it first, so a slow
//! priority primary degrades into the fallback's slot instead of forcing an
//! immediate view change. The slots differ only in their preparation
//! thresholds: `F + 1` for priority, `M` for fallback. Since
//! `(F + 1) + M > N`, at most one slot can gather a preparation quorum.
//!
//! Between preparation and commit sits an explicit **PreCommit** phase:
//! a validator advertises that it holds the full proposal (every
//! transaction included) before anyone locks a signature. Once `M`
//! pre-commits are in - or a priority proposal reaches `M` preparations
//! outright, which skips the round trip - validators sign the finalized
//! slot header and a block forms at `M` matching commits.
//!
//! ## Safety
//!
//! - **Commit locking**: a validator that has signed a Commit never votes
//!   for a view change and never signs a second, conflicting commit; after
//!   a crash it replays the persisted envelope verbatim.
//! - **Quorum intersection**: any two `M`-quorums overlap in an honest
//!   validator, so conflicting blocks cannot both gather commit quorums.
//!
//! ## Liveness
//!
//! - **Timeout-driven view change**: a round that stalls before the commit
//!   lock is abandoned by ChangeView agreement among `M` validators, with
//!   exponential per-view backoff.
//! - **Recovery**: lagging peers are brought forward by bundled
//!   retransmission of the round's envelopes, rate-limited to `F`
//!   responders per request.

mod config;
mod context;
mod recovery;
mod state;
mod view_change;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::ConsensusConfig;
pub use context::{
    ArchivedProposal, ProposalSlot, RoundContext, TransactionVerificationContext,
};
pub use state::{DbftState, DbftStats};
