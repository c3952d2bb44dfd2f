//! Cryptographic key and signature types.
//!
//! Thin newtype wrappers over `ed25519_dalek` so the rest of the workspace
//! never touches vendor types directly. Validators carry one Ed25519 key;
//! every consensus artifact (envelope witness, commit signature) is a single
//! signature from one validator. There is no aggregation in this protocol.
//!
//! ## Helper Functions
//! - `generate_keypair()` - Random key generation
//! - `keypair_from_seed()` - Deterministic key generation (tests/simulation)
//! - `verify_signature()` - Single signature verification
//! - `zero_signature()` - Testing placeholder

use sbor::prelude::*;
use std::fmt;

/// An Ed25519 public key (32 bytes, compressed Edwards point).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
#[sbor(transparent)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// Get bytes as slice reference.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.0);
        write!(f, "PublicKey({}..)", &hex[..8])
    }
}

/// An Ed25519 signature (64 bytes).
#[derive(Clone, Copy, PartialEq, Eq, BasicSbor)]
#[sbor(transparent)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    /// Get bytes as slice reference.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(&self.0[..4]);
        write!(f, "Signature({}..)", hex)
    }
}

/// An Ed25519 signing key.
///
/// Not `Clone` by accident: handing out copies of key material is always an
/// explicit decision at the call site.
pub struct PrivateKey(ed25519_dalek::SigningKey);

impl PrivateKey {
    /// Derive the public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        use ed25519_dalek::Signer;
        Signature(self.0.sign(message).to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({:?})", self.public_key())
    }
}

/// Generate a new random Ed25519 keypair.
pub fn generate_keypair() -> PrivateKey {
    let mut csprng = rand::rngs::OsRng;
    PrivateKey(ed25519_dalek::SigningKey::generate(&mut csprng))
}

/// Generate an Ed25519 keypair from a seed (deterministic, for testing/simulation).
pub fn keypair_from_seed(seed: &[u8; 32]) -> PrivateKey {
    PrivateKey(ed25519_dalek::SigningKey::from_bytes(seed))
}

/// Verify an Ed25519 signature.
///
/// Returns `false` for malformed keys or signatures rather than erroring;
/// callers treat any failure as an invalid signature.
pub fn verify_signature(message: &[u8], signature: &Signature, public_key: &PublicKey) -> bool {
    let Ok(verifying_key) = ed25519_dalek::VerifyingKey::from_bytes(&public_key.0) else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
    use ed25519_dalek::Verifier;
    verifying_key.verify(message, &signature).is_ok()
}

/// Create a zero/placeholder signature for testing.
pub fn zero_signature() -> Signature {
    Signature([0u8; 64])
}
