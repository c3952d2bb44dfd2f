//! Validator registry and quorum arithmetic.
//!
//! The validator set is immutable for the lifetime of a height: an ordered
//! list of `N` public keys, plus this node's own position in it (or none,
//! for watch-only nodes that follow consensus without signing).
//!
//! # Quorum arithmetic
//!
//! With `N` validators the protocol tolerates `F = (N - 1) / 3` faults and
//! requires `M = N - F` matching signatures for safety. `F + 1` is the
//! liveness threshold used by the priority slot's preparation phase; since
//! `(F + 1) + M > N`, the priority and fallback slots can never both gather
//! disjoint preparation quorums.
//!
//! # Primary derivation
//!
//! Each view `v` at height `h` has two primaries running in parallel:
//! the priority primary at index `(h - v) mod N` and the fallback primary
//! at `(h - v - 1) mod N`. Should the two ever coincide, the fallback slot
//! is inert for that view.

use crate::{BlockIndex, PublicKey, ScriptHash, ValidatorIndex, ViewNumber};

/// The ordered validator set for one height, plus the local node's identity.
#[derive(Debug, Clone)]
pub struct ValidatorSet {
    /// Validator public keys, in consensus order.
    validators: Vec<PublicKey>,

    /// This node's index, or `None` when watch-only.
    my_index: Option<ValidatorIndex>,
}

impl ValidatorSet {
    /// Create a validator set.
    ///
    /// `my_key` is matched against the list to find the local index; a key
    /// not in the list (or `None`) yields a watch-only set.
    pub fn new(validators: Vec<PublicKey>, my_key: Option<&PublicKey>) -> Self {
        let my_index = my_key
            .and_then(|key| validators.iter().position(|v| v == key))
            .map(|i| ValidatorIndex(i as u8));
        Self {
            validators,
            my_index,
        }
    }

    /// Number of validators `N`.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Maximum number of tolerated faulty validators, `F = (N - 1) / 3`.
    pub fn f(&self) -> usize {
        (self.len() - 1) / 3
    }

    /// Safety quorum `M = N - F`.
    pub fn m(&self) -> usize {
        self.len() - self.f()
    }

    /// This node's index, or `None` when watch-only.
    pub fn my_index(&self) -> Option<ValidatorIndex> {
        self.my_index
    }

    /// Whether this node follows consensus without a validator slot.
    pub fn is_watch_only(&self) -> bool {
        self.my_index.is_none()
    }

    /// Public key of the validator at `index`.
    pub fn public_key(&self, index: ValidatorIndex) -> Option<&PublicKey> {
        self.validators.get(index.as_usize())
    }

    /// All public keys in consensus order.
    pub fn public_keys(&self) -> &[PublicKey] {
        &self.validators
    }

    /// Script hash authenticating the validator at `index`.
    pub fn script_hash(&self, index: ValidatorIndex) -> Option<ScriptHash> {
        self.public_key(index).map(ScriptHash::from_pubkey)
    }

    /// Whether `index` is within the set.
    pub fn contains_index(&self, index: ValidatorIndex) -> bool {
        index.as_usize() < self.len()
    }

    /// Priority primary for `(height, view)`: `(h - v) mod N`.
    pub fn priority_primary(&self, height: BlockIndex, view: ViewNumber) -> ValidatorIndex {
        self.rotate(height, i64::from(view.0))
    }

    /// Fallback primary for `(height, view)`: `(h - v - 1) mod N`, or `None`
    /// when it would coincide with the priority primary.
    pub fn fallback_primary(
        &self,
        height: BlockIndex,
        view: ViewNumber,
    ) -> Option<ValidatorIndex> {
        let fallback = self.rotate(height, i64::from(view.0) + 1);
        (fallback != self.priority_primary(height, view)).then_some(fallback)
    }

    fn rotate(&self, height: BlockIndex, back: i64) -> ValidatorIndex {
        let n = self.len() as i64;
        let index = (i64::from(height.0) - back).rem_euclid(n);
        ValidatorIndex(index as u8)
    }
}
