//! Blake3-based content hashing.

use sbor::prelude::*;
use std::fmt;

/// A 32-byte Blake3 digest.
///
/// Cheap to copy, usable as a map key, and deterministic: the same input
/// always produces the same digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
#[sbor(transparent)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Size of hash in bytes.
    pub const BYTES: usize = 32;

    /// Zero hash (all bytes are 0x00).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Digest a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Digest several byte slices as one message.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let digest = parts
            .iter()
            .fold(blake3::Hasher::new(), |mut hasher, part| {
                hasher.update(part);
                hasher
            })
            .finalize();
        Self(*digest.as_bytes())
    }

    /// Parse a digest from its 64-character hex form.
    pub fn from_hex(hex: &str) -> Result<Self, HexError> {
        if hex.len() != 2 * Self::BYTES {
            return Err(HexError::BadLength(hex.len()));
        }
        let mut bytes = [0u8; Self::BYTES];
        hex::decode_to_slice(hex, &mut bytes).map_err(|_| HexError::BadDigit)?;
        Ok(Self(bytes))
    }

    /// Hex form of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get bytes as slice reference.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

/// Compute a binary merkle root over `leaves`.
///
/// Layers are reduced pairwise with Blake3; a trailing leaf on an
/// odd-length layer carries into the next layer unchanged. Block headers
/// use this over the proposed transaction hashes in proposal order, so the
/// root commits to both membership and ordering. An empty list yields
/// `Hash::ZERO`.
pub fn compute_merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return Hash::ZERO;
    }

    let mut layer = leaves.to_vec();
    while layer.len() > 1 {
        let mut above = Vec::with_capacity(layer.len() / 2 + 1);
        let mut pairs = layer.chunks_exact(2);
        for pair in pairs.by_ref() {
            above.push(Hash::from_parts(&[pair[0].as_bytes(), pair[1].as_bytes()]));
        }
        above.extend_from_slice(pairs.remainder());
        layer = above;
    }
    layer[0]
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First six bytes are plenty to tell digests apart in logs.
        write!(f, "Hash({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Why a hex string failed to parse as a [`Hash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HexError {
    /// Wrong input length; a digest is 64 hex characters.
    #[error("expected 64 hex characters, got {0}")]
    BadLength(usize),

    /// Input contains a non-hex character.
    #[error("not a hex string")]
    BadDigit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let data = b"tandem block";
        assert_eq!(Hash::from_bytes(data), Hash::from_bytes(data));
        assert_ne!(Hash::from_bytes(b"a"), Hash::from_bytes(b"b"));
    }

    #[test]
    fn test_from_parts_matches_concatenation() {
        assert_eq!(
            Hash::from_parts(&[b"tan", b"dem"]),
            Hash::from_bytes(b"tandem")
        );
    }

    #[test]
    fn test_hex_roundtrip() {
        let original = Hash::from_bytes(b"test data");
        let parsed = Hash::from_hex(&original.to_hex()).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert_eq!(Hash::from_hex("abcd"), Err(HexError::BadLength(4)));
        assert_eq!(Hash::from_hex(&"zz".repeat(32)), Err(HexError::BadDigit));
    }

    #[test]
    fn test_is_zero() {
        assert!(Hash::ZERO.is_zero());
        assert!(!Hash::from_bytes(b"test").is_zero());
    }

    #[test]
    fn test_merkle_root_empty_and_single() {
        assert_eq!(compute_merkle_root(&[]), Hash::ZERO);
        let h = Hash::from_bytes(b"single");
        assert_eq!(compute_merkle_root(&[h]), h);
    }

    #[test]
    fn test_merkle_root_order_matters() {
        let h0 = Hash::from_bytes(b"a");
        let h1 = Hash::from_bytes(b"b");
        assert_ne!(compute_merkle_root(&[h0, h1]), compute_merkle_root(&[h1, h0]));
    }

    #[test]
    fn test_merkle_root_two_is_pair_hash() {
        let h0 = Hash::from_bytes(b"left");
        let h1 = Hash::from_bytes(b"right");
        let expected = Hash::from_parts(&[h0.as_bytes(), h1.as_bytes()]);
        assert_eq!(compute_merkle_root(&[h0, h1]), expected);
    }

    #[test]
    fn test_merkle_root_odd_leaf_carries_up() {
        // With three leaves the last one pairs against the first layer's
        // combined node: root = H(H(h0, h1), h2).
        let h0 = Hash::from_bytes(b"0");
        let h1 = Hash::from_bytes(b"1");
        let h2 = Hash::from_bytes(b"2");

        let left = Hash::from_parts(&[h0.as_bytes(), h1.as_bytes()]);
        let expected = Hash::from_parts(&[left.as_bytes(), h2.as_bytes()]);

        assert_eq!(compute_merkle_root(&[h0, h1, h2]), expected);
    }

    #[test]
    fn test_merkle_root_five_leaves() {
        // Five leaves: the straggler rides through two layers before it is
        // absorbed at the root.
        let leaves: Vec<Hash> = (0u8..5).map(|i| Hash::from_bytes(&[i])).collect();

        let a = Hash::from_parts(&[leaves[0].as_bytes(), leaves[1].as_bytes()]);
        let b = Hash::from_parts(&[leaves[2].as_bytes(), leaves[3].as_bytes()]);
        let ab = Hash::from_parts(&[a.as_bytes(), b.as_bytes()]);
        let expected = Hash::from_parts(&[ab.as_bytes(), leaves[4].as_bytes()]);

        assert_eq!(compute_merkle_root(&leaves), expected);
    }
}
