//! Hierarchical-deterministic key derivation (BIP-32) and scriptPubKey
//! assembly for the script kinds faro tracks.

pub mod base58;
pub mod bip32;
pub mod hmac512;
pub mod script;

pub use bip32::{parse_path, Bip32Error, ExtendedKey, HARDENED};
pub use hmac512::hmac_sha512;
pub use script::{derive_range, Branch, Kind, ScriptError};
