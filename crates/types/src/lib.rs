//! Core types for the Tandem consensus protocol.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: `Hash`, Ed25519 keys and signatures
//! - **Identifiers**: `BlockIndex`, `ViewNumber`, `ValidatorIndex`, `ScriptHash`
//! - **Chain types**: `Transaction`, `Block`, `BlockHeader`
//! - **Registry**: `ValidatorSet` with quorum arithmetic and primary derivation
//! - **Network traits**: message markers for serialization and routing
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod block;
mod crypto;
mod hash;
mod identifiers;
mod network;
mod signing;
mod transaction;
mod validator;

pub use block::{Block, BlockHeader, BLOCK_VERSION};
pub use crypto::{
    generate_keypair, keypair_from_seed, verify_signature, zero_signature, PrivateKey, PublicKey,
    Signature,
};
pub use hash::{compute_merkle_root, Hash, HexError};
pub use identifiers::{BlockIndex, ScriptHash, ValidatorIndex, ViewNumber};
pub use network::{MessagePriority, NetworkMessage};
pub use signing::{envelope_sign_message, header_sign_message, DOMAIN_ENVELOPE, DOMAIN_HEADER};
pub use transaction::Transaction;
pub use validator::ValidatorSet;
