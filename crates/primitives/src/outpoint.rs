use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::Hash256;

pub const OUTPOINT_KEY_LEN: usize = 36;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn null() -> Self {
        Self {
            txid: [0u8; 32],
            vout: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid == [0u8; 32] && self.vout == u32::MAX
    }

    pub fn key(&self) -> OutPointKey {
        OutPointKey::new(&self.txid, self.vout)
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.txid);
        encoder.write_u32_le(self.vout);
    }

    pub fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let txid = decoder.read_hash()?;
        let vout = decoder.read_u32_le()?;
        Ok(Self { txid, vout })
    }
}

/// 36-byte UTXO index key: txid followed by the little-endian vout.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPointKey([u8; OUTPOINT_KEY_LEN]);

impl OutPointKey {
    pub fn new(txid: &Hash256, vout: u32) -> Self {
        let mut bytes = [0u8; OUTPOINT_KEY_LEN];
        bytes[..32].copy_from_slice(txid);
        bytes[32..].copy_from_slice(&vout.to_le_bytes());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != OUTPOINT_KEY_LEN {
            return None;
        }
        let mut out = [0u8; OUTPOINT_KEY_LEN];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }

    pub fn txid(&self) -> Hash256 {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0[..32]);
        out
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl AsRef<[u8]> for OutPointKey {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let mut txid = [0u8; 32];
        txid[0] = 0xaa;
        txid[31] = 0xbb;
        let key = OutPointKey::new(&txid, 0x0102_0304);
        assert_eq!(&key.as_bytes()[..32], &txid);
        assert_eq!(&key.as_bytes()[32..], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(key.txid(), txid);
    }

    #[test]
    fn null_outpoint() {
        assert!(OutPoint::null().is_null());
        let real = OutPoint {
            txid: [1u8; 32],
            vout: 0,
        };
        assert!(!real.is_null());
    }
}
