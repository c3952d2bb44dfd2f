//! Signed fixture builders for test data.
//!
//! These functions create properly-signed envelopes and transactions that
//! exercise real verification paths in the dispatcher and handlers.

use crate::TestValidators;
use tandem_messages::{
    ChangeView, ChangeViewReason, Commit, ConsensusMessage, ConsensusPayload, Envelope, PreCommit,
    PrepareRequest, PrepareResponse, SlotId,
};
use tandem_types::{
    BlockHeader, BlockIndex, Hash, ScriptHash, Transaction, ValidatorIndex, ViewNumber,
    BLOCK_VERSION,
};

/// Build a test transaction with a deterministic payload.
pub fn make_transaction(committee: &TestValidators, seed: u8) -> Transaction {
    Transaction {
        nonce: u64::from(seed),
        sender: ScriptHash::from_pubkey(&committee.key(0).public_key()),
        system_fee: 100,
        network_fee: 10,
        valid_until: BlockIndex(1_000_000),
        data: vec![seed; 8],
    }
}

/// Build a test transaction with an explicit system fee.
pub fn make_transaction_with_fee(committee: &TestValidators, seed: u8, system_fee: u64) -> Transaction {
    Transaction {
        system_fee,
        ..make_transaction(committee, seed)
    }
}

/// Sign a consensus message as validator `signer`.
pub fn make_envelope(
    committee: &TestValidators,
    network: u32,
    signer: usize,
    block_index: BlockIndex,
    view_number: ViewNumber,
    payload: ConsensusPayload,
) -> Envelope {
    let message = ConsensusMessage {
        block_index,
        validator_index: ValidatorIndex(signer as u8),
        view_number,
        payload,
    };
    Envelope::sign(network, &message, committee.key(signer))
}

/// A signed PrepareRequest envelope.
#[allow(clippy::too_many_arguments)]
pub fn make_prepare_request(
    committee: &TestValidators,
    network: u32,
    signer: usize,
    block_index: BlockIndex,
    view_number: ViewNumber,
    slot: SlotId,
    prev_hash: Hash,
    timestamp_ms: u64,
    transaction_hashes: Vec<Hash>,
) -> Envelope {
    make_envelope(
        committee,
        network,
        signer,
        block_index,
        view_number,
        ConsensusPayload::PrepareRequest(PrepareRequest {
            id: slot,
            version: BLOCK_VERSION,
            prev_hash,
            timestamp_ms,
            nonce: 0xD00D + timestamp_ms,
            transaction_hashes,
        }),
    )
}

/// A signed PrepareResponse envelope acknowledging `preparation_hash`.
pub fn make_prepare_response(
    committee: &TestValidators,
    network: u32,
    signer: usize,
    block_index: BlockIndex,
    view_number: ViewNumber,
    slot: SlotId,
    preparation_hash: Hash,
) -> Envelope {
    make_envelope(
        committee,
        network,
        signer,
        block_index,
        view_number,
        ConsensusPayload::PrepareResponse(PrepareResponse {
            id: slot,
            preparation_hash,
        }),
    )
}

/// A signed PreCommit envelope gating on `preparation_hash`.
pub fn make_pre_commit(
    committee: &TestValidators,
    network: u32,
    signer: usize,
    block_index: BlockIndex,
    view_number: ViewNumber,
    slot: SlotId,
    preparation_hash: Hash,
) -> Envelope {
    make_envelope(
        committee,
        network,
        signer,
        block_index,
        view_number,
        ConsensusPayload::PreCommit(PreCommit {
            id: slot,
            preparation_hash,
        }),
    )
}

/// A signed Commit envelope whose signature covers `header`.
pub fn make_commit(
    committee: &TestValidators,
    network: u32,
    signer: usize,
    view_number: ViewNumber,
    slot: SlotId,
    header: &BlockHeader,
) -> Envelope {
    let signature = committee.key(signer).sign(&header.sign_data(network));
    make_envelope(
        committee,
        network,
        signer,
        header.index,
        view_number,
        ConsensusPayload::Commit(Commit {
            id: slot,
            signature,
        }),
    )
}

/// A signed ChangeView envelope targeting `new_view`.
pub fn make_change_view(
    committee: &TestValidators,
    network: u32,
    signer: usize,
    block_index: BlockIndex,
    view_number: ViewNumber,
    new_view: ViewNumber,
    reason: ChangeViewReason,
) -> Envelope {
    make_envelope(
        committee,
        network,
        signer,
        block_index,
        view_number,
        ConsensusPayload::ChangeView(ChangeView {
            new_view_number: new_view,
            timestamp_ms: 0,
            reason,
        }),
    )
}
