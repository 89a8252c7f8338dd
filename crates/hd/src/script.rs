//! scriptPubKey assembly for the tracked script kinds.

use faro_primitives::{hash160, sha256};

use crate::bip32::{Bip32Error, ExtendedKey};

const OP_0: u8 = 0x00;
const OP_PUSHBYTES_20: u8 = 0x14;
const OP_PUSHBYTES_32: u8 = 0x20;
const OP_PUSHBYTES_33: u8 = 0x21;
const OP_1: u8 = 0x51;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;

const MAX_MULTISIG_KEYS: usize = 16;

/// HD account branch: external receive addresses or internal change.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Branch {
    Receive,
    Change,
}

impl Branch {
    pub fn child_index(self) -> u32 {
        match self {
            Branch::Receive => 0,
            Branch::Change => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Kind {
    P2pk,
    P2pkh,
    P2ms,
    P2shMultisig,
    P2shWpkh,
    P2wpkh,
    P2wshMultisig,
}

impl Kind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "p2pk" => Some(Self::P2pk),
            "p2pkh" => Some(Self::P2pkh),
            "p2ms" => Some(Self::P2ms),
            "p2sh" => Some(Self::P2shMultisig),
            "p2sh_wpkh" => Some(Self::P2shWpkh),
            "p2wpkh" => Some(Self::P2wpkh),
            "p2wsh" => Some(Self::P2wshMultisig),
            _ => None,
        }
    }

    /// Stable byte used in the persistent wallet identity hash.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::P2pk => 1,
            Self::P2pkh => 2,
            Self::P2ms => 3,
            Self::P2shMultisig => 4,
            Self::P2shWpkh => 5,
            Self::P2wpkh => 6,
            Self::P2wshMultisig => 7,
        }
    }

    /// Kinds that combine several keys and therefore sort them first.
    pub fn is_multi_key(self) -> bool {
        matches!(self, Self::P2ms | Self::P2shMultisig | Self::P2wshMultisig)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    NoKeys,
    TooManyKeys,
    BadRequiredSigs,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::NoKeys => write!(f, "no public keys"),
            ScriptError::TooManyKeys => write!(f, "more than 16 multisig keys"),
            ScriptError::BadRequiredSigs => write!(f, "required signatures out of range"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Assembles one scriptPubKey from compressed public keys. Multi-key kinds
/// expect `pubkeys` pre-sorted.
pub fn assemble(kind: Kind, reqsigs: u8, pubkeys: &[[u8; 33]]) -> Result<Vec<u8>, ScriptError> {
    let first = pubkeys.first().ok_or(ScriptError::NoKeys)?;
    match kind {
        Kind::P2pk => {
            let mut script = Vec::with_capacity(1 + 33 + 1);
            script.push(OP_PUSHBYTES_33);
            script.extend_from_slice(first);
            script.push(OP_CHECKSIG);
            Ok(script)
        }
        Kind::P2pkh => {
            let digest = hash160(first);
            let mut script = Vec::with_capacity(25);
            script.push(OP_DUP);
            script.push(OP_HASH160);
            script.push(OP_PUSHBYTES_20);
            script.extend_from_slice(&digest);
            script.push(OP_EQUALVERIFY);
            script.push(OP_CHECKSIG);
            Ok(script)
        }
        Kind::P2ms => multisig_script(reqsigs, pubkeys),
        Kind::P2shMultisig => {
            let redeem = multisig_script(reqsigs, pubkeys)?;
            Ok(p2sh_script(&hash160(&redeem)))
        }
        Kind::P2shWpkh => {
            let mut redeem = Vec::with_capacity(22);
            redeem.push(OP_0);
            redeem.push(OP_PUSHBYTES_20);
            redeem.extend_from_slice(&hash160(first));
            Ok(p2sh_script(&hash160(&redeem)))
        }
        Kind::P2wpkh => {
            let digest = hash160(first);
            let mut script = Vec::with_capacity(22);
            script.push(OP_0);
            script.push(OP_PUSHBYTES_20);
            script.extend_from_slice(&digest);
            Ok(script)
        }
        Kind::P2wshMultisig => {
            let witness_script = multisig_script(reqsigs, pubkeys)?;
            let digest = sha256(&witness_script);
            let mut script = Vec::with_capacity(34);
            script.push(OP_0);
            script.push(OP_PUSHBYTES_32);
            script.extend_from_slice(&digest);
            Ok(script)
        }
    }
}

fn multisig_script(reqsigs: u8, pubkeys: &[[u8; 33]]) -> Result<Vec<u8>, ScriptError> {
    let nkeys = pubkeys.len();
    if nkeys == 0 {
        return Err(ScriptError::NoKeys);
    }
    if nkeys > MAX_MULTISIG_KEYS {
        return Err(ScriptError::TooManyKeys);
    }
    if reqsigs < 1 || usize::from(reqsigs) > nkeys {
        return Err(ScriptError::BadRequiredSigs);
    }
    let mut script = Vec::with_capacity(1 + nkeys * 34 + 2);
    script.push(OP_1 - 1 + reqsigs);
    for key in pubkeys {
        script.push(OP_PUSHBYTES_33);
        script.extend_from_slice(key);
    }
    script.push(OP_1 - 1 + nkeys as u8);
    script.push(OP_CHECKMULTISIG);
    Ok(script)
}

fn p2sh_script(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.push(OP_HASH160);
    script.push(OP_PUSHBYTES_20);
    script.extend_from_slice(script_hash);
    script.push(OP_EQUAL);
    script
}

#[derive(Debug)]
pub enum DeriveError {
    Bip32(Bip32Error),
    Script(ScriptError),
}

impl std::fmt::Display for DeriveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeriveError::Bip32(err) => write!(f, "{err}"),
            DeriveError::Script(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DeriveError {}

impl From<Bip32Error> for DeriveError {
    fn from(err: Bip32Error) -> Self {
        DeriveError::Bip32(err)
    }
}

impl From<ScriptError> for DeriveError {
    fn from(err: ScriptError) -> Self {
        DeriveError::Script(err)
    }
}

/// Derives `count` scriptPubKeys for child indices `offset..offset+count`
/// from branch-level account keys. Private keys are neutered first; for
/// multi-key kinds the per-index pubkeys are sorted lexicographically before
/// assembly.
pub fn derive_range(
    kind: Kind,
    reqsigs: u8,
    branch_keys: &[ExtendedKey],
    offset: u32,
    count: u32,
) -> Result<Vec<Vec<u8>>, DeriveError> {
    let mut public_keys = Vec::with_capacity(branch_keys.len());
    for key in branch_keys {
        public_keys.push(key.to_public()?);
    }
    let mut scripts = Vec::with_capacity(count as usize);
    for i in 0..count {
        let index = offset + i;
        let mut pubkeys = Vec::with_capacity(public_keys.len());
        for key in &public_keys {
            let child = key.derive_pub(&[index])?;
            pubkeys.push(child.public_key_bytes()?);
        }
        if kind.is_multi_key() {
            pubkeys.sort_unstable();
        }
        scripts.push(assemble(kind, reqsigs, &pubkeys)?);
    }
    Ok(scripts)
}
