//! Core Bitcoin types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod network;
pub mod outpoint;
pub mod transaction;

/// 32-byte hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];

pub use block::{Block, BlockHeader, HEADER_LEN};
pub use hash::{hash160, sha256, sha256d};
pub use merkle::{merkle_branch, merkle_root, verify_merkle_branch};
pub use network::Network;
pub use outpoint::{OutPoint, OutPointKey, OUTPOINT_KEY_LEN};
pub use transaction::{Transaction, TxIn, TxOut};
