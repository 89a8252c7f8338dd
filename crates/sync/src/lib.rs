//! The wallet-sync and script-index engine.
//!
//! The [`Engine`] follows the chain through a [`ChainSource`], derives and
//! lazily extends the tracked scriptPubKey set from the configured HD
//! wallets, classifies every block's outputs and inputs against that set,
//! maintains the persistent history/UTXO indices, rolls back on reorgs, and
//! drives header and script-status subscriptions.

pub mod engine;
pub mod source;
pub mod status;
pub mod subs;
pub mod wallet;

pub use engine::{Engine, EngineConfig};
pub use source::ChainSource;
pub use status::status_hash;
pub use subs::{ConnectionId, Notification};
pub use wallet::{WalletConfig, GAP};

use faro_hd::bip32::Bip32Error;
use faro_hd::script::DeriveError;
use faro_node::NodeError;
use faro_primitives::encoding::DecodeError;
use faro_store::StoreError;

#[derive(Debug)]
pub enum SyncError {
    Store(StoreError),
    Node(NodeError),
    Decode(DecodeError),
    Derive(DeriveError),
    NotFound,
    /// A header row the chain invariants guarantee was absent.
    MissingHeader(i64),
    /// The peer serves a chain that does not connect to ours at all.
    ChainMismatch,
    /// The chain diverged deeper than the rollback safety bound.
    ReorgTooDeep { depth: i64 },
}

impl SyncError {
    /// Fatal errors terminate the engine; everything else is retried on the
    /// next sync tick.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::ReorgTooDeep { .. }
                | SyncError::ChainMismatch
                | SyncError::MissingHeader(_)
        )
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Store(err) => write!(f, "store: {err}"),
            SyncError::Node(err) => write!(f, "{err}"),
            SyncError::Decode(err) => write!(f, "decode: {err}"),
            SyncError::Derive(err) => write!(f, "derivation: {err}"),
            SyncError::NotFound => write!(f, "not found"),
            SyncError::MissingHeader(height) => {
                write!(f, "missing header at height {height}")
            }
            SyncError::ChainMismatch => write!(f, "peer chain does not connect to ours"),
            SyncError::ReorgTooDeep { depth } => {
                write!(f, "chain reorg deeper than the safety margin: {depth}")
            }
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Store(err)
    }
}

impl From<NodeError> for SyncError {
    fn from(err: NodeError) -> Self {
        SyncError::Node(err)
    }
}

impl From<DecodeError> for SyncError {
    fn from(err: DecodeError) -> Self {
        SyncError::Decode(err)
    }
}

impl From<DeriveError> for SyncError {
    fn from(err: DeriveError) -> Self {
        SyncError::Derive(err)
    }
}

impl From<Bip32Error> for SyncError {
    fn from(err: Bip32Error) -> Self {
        SyncError::Derive(DeriveError::Bip32(err))
    }
}
