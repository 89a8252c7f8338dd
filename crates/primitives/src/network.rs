//! Network selection: wire magic and the compiled-in genesis header.

use crate::block::BlockHeader;
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

// Shared by all three networks.
const GENESIS_MERKLE_ROOT: Hash256 = [
    0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f,
    0x61, 0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e,
    0x5e, 0x4a,
];

impl Network {
    pub fn from_str_lossy(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" => Self::Mainnet,
            "testnet" => Self::Testnet,
            _ => Self::Regtest,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }

    pub fn magic(self) -> [u8; 4] {
        match self {
            Self::Mainnet => [0xf9, 0xbe, 0xb4, 0xd9],
            Self::Testnet => [0x0b, 0x11, 0x09, 0x07],
            Self::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
        }
    }

    /// The network's genesis header. Height 0 is never stored; it is
    /// synthesised from this whenever a caller asks for it.
    pub fn genesis_header(self) -> BlockHeader {
        let (time, bits, nonce) = match self {
            Self::Mainnet => (1_231_006_505, 0x1d00_ffff, 2_083_236_893),
            Self::Testnet => (1_296_688_602, 0x1d00_ffff, 414_098_458),
            Self::Regtest => (1_296_688_602, 0x207f_ffff, 2),
        };
        BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: GENESIS_MERKLE_ROOT,
            time,
            bits,
            nonce,
        }
    }

    pub fn genesis_hash(self) -> Hash256 {
        self.genesis_header().hash()
    }
}
