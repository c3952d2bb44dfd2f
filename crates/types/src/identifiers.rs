//! Identifier newtypes.
//!
//! Small wrappers that keep block heights, view numbers, and validator
//! indices from being confused with each other in signatures and tables.

use crate::{Hash, PublicKey};
use sbor::prelude::*;
use std::fmt;

/// Position of a block in the chain (genesis = 0).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BasicSbor,
)]
#[sbor(transparent)]
pub struct BlockIndex(pub u32);

impl BlockIndex {
    /// The index following this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic counter identifying the consensus attempt at a given height.
///
/// View 0 is the initial attempt; each agreed view change increments it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BasicSbor,
)]
#[sbor(transparent)]
pub struct ViewNumber(pub u8);

impl ViewNumber {
    /// The initial view at every height.
    pub const ZERO: Self = Self(0);

    /// The view following this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ViewNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a validator within the ordered validator set of a height.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BasicSbor,
)]
#[sbor(transparent)]
pub struct ValidatorIndex(pub u8);

impl ValidatorIndex {
    /// Index as a usize for table access.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValidatorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Domain tag for deriving a script hash from a public key.
const VERIFICATION_SCRIPT_TAG: &[u8] = b"tandem-verification-script:v1";

/// Hash of a single-signature verification script (20 bytes).
///
/// Consensus envelopes carry the sender's script hash; the dispatcher
/// authenticates the sender by matching it against the script hash derived
/// from the claimed validator index's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
#[sbor(transparent)]
pub struct ScriptHash(pub [u8; 20]);

impl ScriptHash {
    /// Derive the script hash of a validator's single-sig verification script.
    pub fn from_pubkey(public_key: &PublicKey) -> Self {
        let full = Hash::from_parts(&[VERIFICATION_SCRIPT_TAG, public_key.as_bytes()]);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&full.as_bytes()[..20]);
        Self(bytes)
    }

    /// Get bytes as slice reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.0);
        write!(f, "ScriptHash({}..)", &hex[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_keypair;

    #[test]
    fn test_next_increments() {
        assert_eq!(BlockIndex(7).next(), BlockIndex(8));
        assert_eq!(ViewNumber::ZERO.next(), ViewNumber(1));
    }

    #[test]
    fn test_script_hash_is_stable_per_key() {
        let key = generate_keypair();
        let pk = key.public_key();
        assert_eq!(ScriptHash::from_pubkey(&pk), ScriptHash::from_pubkey(&pk));

        let other = generate_keypair().public_key();
        assert_ne!(ScriptHash::from_pubkey(&pk), ScriptHash::from_pubkey(&other));
    }
}
