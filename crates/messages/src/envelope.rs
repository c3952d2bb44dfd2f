//! Signed consensus envelope.
//!
//! The envelope is the unit the P2P layer moves around: an opaque body,
//! the sender's script hash, and a witness signature. The envelope hash
//! covers sender and body but not the witness, so re-signing the same
//! content can never produce a "new" message.

use crate::{ConsensusMessage, MessageDecodeError};
use sbor::prelude::*;
use tandem_types::{
    envelope_sign_message, verify_signature, Hash, MessagePriority, NetworkMessage, PrivateKey,
    PublicKey, ScriptHash, Signature,
};

/// A signed, sender-attributed consensus message container.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Envelope {
    /// Script hash identifying the sending account.
    pub sender: ScriptHash,

    /// SBOR-encoded [`ConsensusMessage`].
    pub data: Vec<u8>,

    /// Signature over the envelope sign-data.
    pub witness: Signature,
}

impl Envelope {
    /// Build and sign an envelope for `message` on the given network.
    ///
    /// The sender script hash is derived from the signing key, so the
    /// witness always matches the claimed sender.
    pub fn sign(network: u32, message: &ConsensusMessage, key: &PrivateKey) -> Self {
        let sender = ScriptHash::from_pubkey(&key.public_key());
        let data = message.encode();
        let hash = content_hash(&sender, &data);
        let witness = key.sign(&envelope_sign_message(network, &hash));
        Self {
            sender,
            data,
            witness,
        }
    }

    /// The envelope identity: hash over sender and body, witness excluded.
    pub fn hash(&self) -> Hash {
        content_hash(&self.sender, &self.data)
    }

    /// Verify the witness signature against a claimed public key.
    ///
    /// The caller is responsible for checking that `public_key` is the one
    /// the sender script hash commits to.
    pub fn verify_witness(&self, network: u32, public_key: &PublicKey) -> bool {
        let message = envelope_sign_message(network, &self.hash());
        verify_signature(&message, &self.witness, public_key)
    }

    /// Decode the body into a typed consensus message.
    pub fn decode_message(&self) -> Result<ConsensusMessage, MessageDecodeError> {
        ConsensusMessage::decode(&self.data)
    }
}

fn content_hash(sender: &ScriptHash, data: &[u8]) -> Hash {
    Hash::from_parts(&[sender.as_bytes(), data])
}

impl NetworkMessage for Envelope {
    fn message_type_id() -> &'static str {
        "consensus.envelope"
    }

    fn priority() -> MessagePriority {
        MessagePriority::Critical
    }
}
