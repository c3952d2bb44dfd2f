//! Canonical signing message construction.
//!
//! Every signature in the protocol covers a domain-separated message that
//! includes the network magic number, so signatures can never be replayed
//! across networks or between envelope witnesses and header commitments.

use crate::Hash;

/// Domain tag for envelope witness signatures.
pub const DOMAIN_ENVELOPE: &[u8] = b"tandem-envelope:";

/// Domain tag for block header commit signatures.
pub const DOMAIN_HEADER: &[u8] = b"tandem-header:";

/// Build the message an envelope witness signs: domain tag, network magic,
/// and the envelope hash (which covers sender and body, not the witness).
pub fn envelope_sign_message(network: u32, envelope_hash: &Hash) -> Vec<u8> {
    let mut message = Vec::with_capacity(DOMAIN_ENVELOPE.len() + 4 + Hash::BYTES);
    message.extend_from_slice(DOMAIN_ENVELOPE);
    message.extend_from_slice(&network.to_le_bytes());
    message.extend_from_slice(envelope_hash.as_bytes());
    message
}

/// Build the message a Commit signature covers: domain tag, network magic,
/// and the finalized block header hash.
pub fn header_sign_message(network: u32, header_hash: &Hash) -> Vec<u8> {
    let mut message = Vec::with_capacity(DOMAIN_HEADER.len() + 4 + Hash::BYTES);
    message.extend_from_slice(DOMAIN_HEADER);
    message.extend_from_slice(&network.to_le_bytes());
    message.extend_from_slice(header_hash.as_bytes());
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domains_do_not_collide() {
        let hash = Hash::from_bytes(b"payload");
        assert_ne!(envelope_sign_message(5, &hash), header_sign_message(5, &hash));
    }

    #[test]
    fn test_network_magic_separates_messages() {
        let hash = Hash::from_bytes(b"payload");
        assert_ne!(envelope_sign_message(1, &hash), envelope_sign_message(2, &hash));
    }
}
