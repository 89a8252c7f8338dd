//! Transaction types and serialization (BIP-144 witness encoding).

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;
use crate::Hash256;

const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    fn encode(&self, encoder: &mut Encoder) {
        self.prevout.encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }

    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }

    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_u64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

/// Witness stack for one input.
pub type Witness = Vec<Vec<u8>>;

/// A transaction in witness form. `witnesses` is either empty (legacy
/// encoding) or holds exactly one stack per input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub witnesses: Vec<Witness>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_segwit(&self) -> bool {
        !self.witnesses.is_empty()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_to(&mut encoder);
        encoder.into_inner()
    }

    pub fn encode_to(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        if self.is_segwit() {
            encoder.write_u8(SEGWIT_MARKER);
            encoder.write_u8(SEGWIT_FLAG);
        }
        encoder.write_compact_size(self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode(encoder);
        }
        encoder.write_compact_size(self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(encoder);
        }
        if self.is_segwit() {
            for witness in &self.witnesses {
                encoder.write_compact_size(witness.len() as u64);
                for item in witness {
                    encoder.write_var_bytes(item);
                }
            }
        }
        encoder.write_u32_le(self.lock_time);
    }

    /// Legacy encoding without marker, flag, or witness data. This is the
    /// preimage of the txid.
    pub fn encode_stripped(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        encoder.write_compact_size(self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode(&mut encoder);
        }
        encoder.write_compact_size(self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(&mut encoder);
        }
        encoder.write_u32_le(self.lock_time);
        encoder.into_inner()
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode_stripped())
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let mut input_count = decoder.read_compact_size()?;
        let segwit = input_count == 0;
        if segwit {
            let flag = decoder.read_u8()?;
            if flag != SEGWIT_FLAG {
                return Err(DecodeError::InvalidData("bad segwit flag"));
            }
            input_count = decoder.read_compact_size()?;
        }
        let input_count = usize::try_from(input_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(TxIn::decode(decoder)?);
        }
        let output_count = decoder.read_compact_size()?;
        let output_count = usize::try_from(output_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(TxOut::decode(decoder)?);
        }
        let mut witnesses = Vec::new();
        if segwit {
            witnesses.reserve(input_count);
            for _ in 0..input_count {
                let item_count = decoder.read_compact_size()?;
                let item_count =
                    usize::try_from(item_count).map_err(|_| DecodeError::SizeTooLarge)?;
                let mut stack = Vec::with_capacity(item_count);
                for _ in 0..item_count {
                    stack.push(decoder.read_var_bytes()?);
                }
                witnesses.push(stack);
            }
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            witnesses,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx(segwit: bool) -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![TxIn {
                prevout: OutPoint {
                    txid: [0x11; 32],
                    vout: 1,
                },
                script_sig: if segwit { Vec::new() } else { vec![0x51] },
                sequence: 0xffff_fffd,
            }],
            outputs: vec![
                TxOut {
                    value: 50_000,
                    script_pubkey: vec![0x00, 0x14, 0xab, 0xcd],
                },
                TxOut {
                    value: 9_000,
                    script_pubkey: vec![0x51],
                },
            ],
            witnesses: if segwit {
                vec![vec![vec![0x30, 0x45], vec![0x02, 0x21]]]
            } else {
                Vec::new()
            },
            lock_time: 0,
        }
    }

    #[test]
    fn legacy_round_trip() {
        let tx = sample_tx(false);
        let bytes = tx.consensus_encode();
        let decoded = Transaction::consensus_decode(&bytes).unwrap();
        assert_eq!(decoded, tx);
        assert!(!decoded.is_segwit());
    }

    #[test]
    fn segwit_round_trip() {
        let tx = sample_tx(true);
        let bytes = tx.consensus_encode();
        let decoded = Transaction::consensus_decode(&bytes).unwrap();
        assert_eq!(decoded, tx);
        assert!(decoded.is_segwit());
    }

    #[test]
    fn txid_ignores_witness() {
        let mut with_witness = sample_tx(false);
        let without_witness = with_witness.clone();
        with_witness.witnesses = vec![vec![vec![0xde, 0xad]]];
        assert_eq!(with_witness.txid(), without_witness.txid());
        assert_ne!(
            with_witness.consensus_encode(),
            without_witness.consensus_encode()
        );
    }

    #[test]
    fn stripped_equals_legacy_encoding() {
        let tx = sample_tx(false);
        assert_eq!(tx.encode_stripped(), tx.consensus_encode());
    }

    #[test]
    fn rejects_bad_segwit_flag() {
        let mut bytes = sample_tx(true).consensus_encode();
        // marker sits right after the 4-byte version, the flag after it
        assert_eq!(bytes[4], 0x00);
        bytes[5] = 0x02;
        assert!(Transaction::consensus_decode(&bytes).is_err());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = sample_tx(false).consensus_encode();
        bytes.push(0x00);
        assert_eq!(
            Transaction::consensus_decode(&bytes),
            Err(DecodeError::TrailingBytes)
        );
    }
}
