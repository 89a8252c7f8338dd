//! BIP-32 extended keys: base58check codec, master-from-seed, and child
//! derivation on secp256k1.
//!
//! When IL falls outside the curve order or a derived key degenerates (zero
//! scalar, point at infinity), the child index is incremented and derivation
//! retried, per BIP-32. The retry loop is bounded; hitting the bound would
//! require a cryptographically negligible run of invalid candidates.

use std::sync::OnceLock;

use secp256k1::{All, PublicKey, Scalar, Secp256k1, SecretKey};

use faro_primitives::hash160;

use crate::base58::{self, Base58Error};
use crate::hmac512::hmac_sha512;

pub const HARDENED: u32 = 1 << 31;

const SERIALIZED_LEN: usize = 4 + 1 + 4 + 4 + 32 + 33;
const BITCOIN_SEED_KEY: &[u8] = b"Bitcoin seed";
const MAX_DERIVE_RETRIES: u32 = 8;

const VERSION_MAINNET_PUBLIC: [u8; 4] = [0x04, 0x88, 0xb2, 0x1e];
const VERSION_MAINNET_PRIVATE: [u8; 4] = [0x04, 0x88, 0xad, 0xe4];
const VERSION_TESTNET_PUBLIC: [u8; 4] = [0x04, 0x35, 0x87, 0xcf];
const VERSION_TESTNET_PRIVATE: [u8; 4] = [0x04, 0x35, 0x83, 0x94];

fn secp() -> &'static Secp256k1<All> {
    static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bip32Error {
    Base58(Base58Error),
    BadLength,
    UnknownVersion,
    BadKeyPrefix,
    ZeroDepthNonZeroParent,
    NotOnCurve,
    NotPrivate,
    HardenedFromPublic,
    Overflow,
    BadSeed,
    BadPath,
}

impl std::fmt::Display for Bip32Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bip32Error::Base58(err) => write!(f, "{err}"),
            Bip32Error::BadLength => write!(f, "bad extended key length"),
            Bip32Error::UnknownVersion => write!(f, "unknown extended key version"),
            Bip32Error::BadKeyPrefix => write!(f, "bad key prefix byte"),
            Bip32Error::ZeroDepthNonZeroParent => {
                write!(f, "zero-depth key with non-zero parent data")
            }
            Bip32Error::NotOnCurve => write!(f, "key material not on the curve"),
            Bip32Error::NotPrivate => write!(f, "operation requires a private key"),
            Bip32Error::HardenedFromPublic => {
                write!(f, "hardened derivation from a public key")
            }
            Bip32Error::Overflow => write!(f, "child derivation overflow"),
            Bip32Error::BadSeed => write!(f, "seed produces an invalid master key"),
            Bip32Error::BadPath => write!(f, "bad derivation path"),
        }
    }
}

impl std::error::Error for Bip32Error {}

impl From<Base58Error> for Bip32Error {
    fn from(err: Base58Error) -> Self {
        Bip32Error::Base58(err)
    }
}

/// An extended key. `key` is the 33-byte field of the serialization: a
/// compressed public key, or 0x00 followed by the 32-byte secret scalar.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExtendedKey {
    pub version: [u8; 4],
    pub depth: u8,
    pub parent_fingerprint: [u8; 4],
    pub child_number: u32,
    pub chain_code: [u8; 32],
    pub key: [u8; 33],
}

impl std::fmt::Debug for ExtendedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never renders private material.
        f.debug_struct("ExtendedKey")
            .field("depth", &self.depth)
            .field("child_number", &self.child_number)
            .field("private", &self.is_private())
            .finish()
    }
}

impl ExtendedKey {
    pub fn is_private(&self) -> bool {
        self.key[0] == 0x00
    }

    pub fn master_from_seed(seed: &[u8]) -> Result<Self, Bip32Error> {
        let digest = hmac_sha512(BITCOIN_SEED_KEY, seed);
        let mut key = [0u8; 33];
        key[1..].copy_from_slice(&digest[..32]);
        SecretKey::from_slice(&digest[..32]).map_err(|_| Bip32Error::BadSeed)?;
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&digest[32..]);
        Ok(Self {
            version: VERSION_MAINNET_PRIVATE,
            depth: 0,
            parent_fingerprint: [0u8; 4],
            child_number: 0,
            chain_code,
            key,
        })
    }

    pub fn decode(input: &str) -> Result<Self, Bip32Error> {
        let data = base58::check_decode(input)?;
        if data.len() != SERIALIZED_LEN {
            return Err(Bip32Error::BadLength);
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&data[..4]);
        let depth = data[4];
        let mut parent_fingerprint = [0u8; 4];
        parent_fingerprint.copy_from_slice(&data[5..9]);
        let mut child_bytes = [0u8; 4];
        child_bytes.copy_from_slice(&data[9..13]);
        let child_number = u32::from_be_bytes(child_bytes);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&data[13..45]);
        let mut key = [0u8; 33];
        key.copy_from_slice(&data[45..78]);

        match version {
            VERSION_MAINNET_PUBLIC | VERSION_TESTNET_PUBLIC => {
                if !(key[0] == 0x02 || key[0] == 0x03) {
                    return Err(Bip32Error::BadKeyPrefix);
                }
                PublicKey::from_slice(&key).map_err(|_| Bip32Error::NotOnCurve)?;
            }
            VERSION_MAINNET_PRIVATE | VERSION_TESTNET_PRIVATE => {
                if key[0] != 0x00 {
                    return Err(Bip32Error::BadKeyPrefix);
                }
                SecretKey::from_slice(&key[1..]).map_err(|_| Bip32Error::NotOnCurve)?;
            }
            _ => return Err(Bip32Error::UnknownVersion),
        }
        if depth == 0 && (parent_fingerprint != [0u8; 4] || child_number != 0) {
            return Err(Bip32Error::ZeroDepthNonZeroParent);
        }
        Ok(Self {
            version,
            depth,
            parent_fingerprint,
            child_number,
            chain_code,
            key,
        })
    }

    pub fn encode(&self) -> String {
        let mut data = [0u8; SERIALIZED_LEN];
        data[..4].copy_from_slice(&self.version);
        data[4] = self.depth;
        data[5..9].copy_from_slice(&self.parent_fingerprint);
        data[9..13].copy_from_slice(&self.child_number.to_be_bytes());
        data[13..45].copy_from_slice(&self.chain_code);
        data[45..78].copy_from_slice(&self.key);
        base58::check_encode(&data)
    }

    fn secret_key(&self) -> Result<SecretKey, Bip32Error> {
        if !self.is_private() {
            return Err(Bip32Error::NotPrivate);
        }
        SecretKey::from_slice(&self.key[1..]).map_err(|_| Bip32Error::NotOnCurve)
    }

    fn public_point(&self) -> Result<PublicKey, Bip32Error> {
        if self.is_private() {
            let sk = self.secret_key()?;
            Ok(PublicKey::from_secret_key(secp(), &sk))
        } else {
            PublicKey::from_slice(&self.key).map_err(|_| Bip32Error::NotOnCurve)
        }
    }

    /// Compressed public key bytes, deriving them first when this key is
    /// private.
    pub fn public_key_bytes(&self) -> Result<[u8; 33], Bip32Error> {
        Ok(self.public_point()?.serialize())
    }

    pub fn fingerprint(&self) -> Result<[u8; 4], Bip32Error> {
        let pubkey = self.public_key_bytes()?;
        let digest = hash160(&pubkey);
        let mut out = [0u8; 4];
        out.copy_from_slice(&digest[..4]);
        Ok(out)
    }

    /// The same key with private material replaced by the public point
    /// (identity when already public).
    pub fn to_public(&self) -> Result<Self, Bip32Error> {
        if !self.is_private() {
            return Ok(*self);
        }
        let version = match self.version {
            VERSION_MAINNET_PRIVATE => VERSION_MAINNET_PUBLIC,
            VERSION_TESTNET_PRIVATE => VERSION_TESTNET_PUBLIC,
            _ => return Err(Bip32Error::UnknownVersion),
        };
        let mut out = *self;
        out.version = version;
        out.key = self.public_key_bytes()?;
        Ok(out)
    }

    pub fn derive_priv(&self, path: &[u32]) -> Result<Self, Bip32Error> {
        let mut current = *self;
        for element in path {
            current = current.derive_priv_child(*element)?;
        }
        Ok(current)
    }

    pub fn derive_pub(&self, path: &[u32]) -> Result<Self, Bip32Error> {
        let mut current = if self.is_private() {
            self.to_public()?
        } else {
            *self
        };
        for element in path {
            current = current.derive_pub_child(*element)?;
        }
        Ok(current)
    }

    fn derive_priv_child(&self, index: u32) -> Result<Self, Bip32Error> {
        let sk = self.secret_key()?;
        let mut index = index;
        for _ in 0..MAX_DERIVE_RETRIES {
            match self.try_priv_child(&sk, index) {
                Err(Bip32Error::Overflow) => index = index.wrapping_add(1),
                other => return other,
            }
        }
        Err(Bip32Error::Overflow)
    }

    fn try_priv_child(&self, sk: &SecretKey, index: u32) -> Result<Self, Bip32Error> {
        let mut data = [0u8; 37];
        if index & HARDENED != 0 {
            data[1..33].copy_from_slice(&self.key[1..]);
        } else {
            data[..33].copy_from_slice(&self.public_key_bytes()?);
        }
        data[33..].copy_from_slice(&index.to_be_bytes());
        let digest = hmac_sha512(&self.chain_code, &data);

        let mut il = [0u8; 32];
        il.copy_from_slice(&digest[..32]);
        let tweak = Scalar::from_be_bytes(il).map_err(|_| Bip32Error::Overflow)?;
        let child = sk.add_tweak(&tweak).map_err(|_| Bip32Error::Overflow)?;

        let mut key = [0u8; 33];
        key[1..].copy_from_slice(&child.secret_bytes());
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&digest[32..]);
        Ok(Self {
            version: self.version,
            depth: self.depth.wrapping_add(1),
            parent_fingerprint: self.fingerprint()?,
            child_number: index,
            chain_code,
            key,
        })
    }

    fn derive_pub_child(&self, index: u32) -> Result<Self, Bip32Error> {
        if index & HARDENED != 0 {
            return Err(Bip32Error::HardenedFromPublic);
        }
        let point = self.public_point()?;
        let mut index = index;
        for _ in 0..MAX_DERIVE_RETRIES {
            match self.try_pub_child(&point, index) {
                Err(Bip32Error::Overflow) => index += 1,
                other => return other,
            }
        }
        Err(Bip32Error::Overflow)
    }

    fn try_pub_child(&self, point: &PublicKey, index: u32) -> Result<Self, Bip32Error> {
        let mut data = [0u8; 37];
        data[..33].copy_from_slice(&self.key);
        data[33..].copy_from_slice(&index.to_be_bytes());
        let digest = hmac_sha512(&self.chain_code, &data);

        let mut il = [0u8; 32];
        il.copy_from_slice(&digest[..32]);
        let tweak = Scalar::from_be_bytes(il).map_err(|_| Bip32Error::Overflow)?;
        let child = point
            .add_exp_tweak(secp(), &tweak)
            .map_err(|_| Bip32Error::Overflow)?;

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&digest[32..]);
        Ok(Self {
            version: self.version,
            depth: self.depth.wrapping_add(1),
            parent_fingerprint: self.fingerprint()?,
            child_number: index,
            chain_code,
            key: child.serialize(),
        })
    }
}

/// Parses `m`, `m/0/1`, `m/84'/0h/0H`, mixing `'`/`h`/`H` hardened markers.
pub fn parse_path(path: &str) -> Result<Vec<u32>, Bip32Error> {
    let mut elements = Vec::new();
    let mut parts = path.split('/');
    if parts.next() != Some("m") {
        return Err(Bip32Error::BadPath);
    }
    for part in parts {
        if part.is_empty() {
            return Err(Bip32Error::BadPath);
        }
        let (digits, hardened) = match part.strip_suffix(['\'', 'h', 'H']) {
            Some(stripped) => (stripped, HARDENED),
            None => (part, 0),
        };
        let index: u32 = digits.parse().map_err(|_| Bip32Error::BadPath)?;
        if index & HARDENED != 0 {
            return Err(Bip32Error::BadPath);
        }
        elements.push(index | hardened);
    }
    Ok(elements)
}
