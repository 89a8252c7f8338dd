//! Tracked-wallet state: persistent identity, branch cursors, and the
//! gap-limit derivation bookkeeping that feeds the script lookup map.

use std::collections::HashMap;

use faro_hd::bip32::ExtendedKey;
use faro_hd::script::{derive_range, Branch, Kind};
use faro_primitives::{sha256, Hash256};
use faro_store::WalletRecord;

use crate::SyncError;

/// Address-discovery lookahead per branch: how many scriptPubKeys beyond the
/// highest seen child index stay derived and tracked at all times.
pub const GAP: u32 = 2000;

#[derive(Clone)]
pub struct WalletConfig {
    pub kind: Kind,
    pub required_sigs: u8,
    pub master_keys: Vec<ExtendedKey>,
    /// Height the wallet starts scanning from when first seen.
    pub birth_height: i64,
}

/// Where a tracked scriptPubKey came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScriptInfo {
    pub wallet_index: usize,
    pub branch: Branch,
    pub child_index: u32,
}

pub(crate) struct WalletState {
    kind: Kind,
    required_sigs: u8,
    receive_keys: Vec<ExtendedKey>,
    change_keys: Vec<ExtendedKey>,
    pub hash: Hash256,
    pub height: i64,
    pub next_receive_index: u32,
    pub next_change_index: u32,
    pub receive_derived: u32,
    pub change_derived: u32,
}

/// Persistent wallet identity:
/// `SHA256(kind_byte ∥ reqsigs ∥ concat(master public keys))`.
pub fn wallet_hash(config: &WalletConfig) -> Result<Hash256, SyncError> {
    let mut preimage = Vec::with_capacity(2 + config.master_keys.len() * 33);
    preimage.push(config.kind.as_byte());
    preimage.push(config.required_sigs);
    for key in &config.master_keys {
        preimage.extend_from_slice(&key.public_key_bytes()?);
    }
    Ok(sha256(&preimage))
}

impl WalletState {
    /// Builds the in-memory state from the config and its stored record,
    /// deriving the two branch-level keys per master.
    pub fn new(
        config: &WalletConfig,
        hash: Hash256,
        record: &WalletRecord,
    ) -> Result<Self, SyncError> {
        let mut receive_keys = Vec::with_capacity(config.master_keys.len());
        let mut change_keys = Vec::with_capacity(config.master_keys.len());
        for key in &config.master_keys {
            receive_keys.push(key.derive_pub(&[Branch::Receive.child_index()])?);
            change_keys.push(key.derive_pub(&[Branch::Change.child_index()])?);
        }
        Ok(Self {
            kind: config.kind,
            required_sigs: config.required_sigs,
            receive_keys,
            change_keys,
            hash,
            height: record.height,
            next_receive_index: record.next_receive_index,
            next_change_index: record.next_change_index,
            receive_derived: 0,
            change_derived: 0,
        })
    }

    /// Bumps the branch cursor if `child_index` reaches it. Returns whether
    /// anything changed (the caller then persists and refills).
    pub fn advance(&mut self, branch: Branch, child_index: u32) -> bool {
        let next = match branch {
            Branch::Receive => &mut self.next_receive_index,
            Branch::Change => &mut self.next_change_index,
        };
        if child_index < *next {
            return false;
        }
        *next = child_index + 1;
        true
    }

    /// Extends both branches so that `derived >= next_index + GAP`, adding
    /// every new script hash to the lookup map.
    pub fn refill(
        &mut self,
        wallet_index: usize,
        scripts: &mut HashMap<Hash256, ScriptInfo>,
    ) -> Result<(), SyncError> {
        for branch in [Branch::Receive, Branch::Change] {
            let (next, derived) = match branch {
                Branch::Receive => (self.next_receive_index, self.receive_derived),
                Branch::Change => (self.next_change_index, self.change_derived),
            };
            let target = next + GAP;
            if derived >= target {
                continue;
            }
            let offset = derived;
            let count = target - derived;
            let keys = match branch {
                Branch::Receive => &self.receive_keys,
                Branch::Change => &self.change_keys,
            };
            let derived_scripts = derive_range(self.kind, self.required_sigs, keys, offset, count)?;
            for (i, script) in derived_scripts.iter().enumerate() {
                scripts.insert(
                    sha256(script),
                    ScriptInfo {
                        wallet_index,
                        branch,
                        child_index: offset + i as u32,
                    },
                );
            }
            match branch {
                Branch::Receive => self.receive_derived = target,
                Branch::Change => self.change_derived = target,
            }
        }
        Ok(())
    }
}
