//! Wire message framing and the payloads this client speaks.
//!
//! Frame layout: 4-byte network magic, 12-byte zero-padded command, 4-byte
//! LE payload length, 4-byte checksum (leading bytes of double-SHA-256 of
//! the payload), payload. Integers are little-endian except the address
//! ports inside `version`, which are big-endian.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt};

use faro_primitives::encoding::{DecodeError, Decoder, Encoder};
use faro_primitives::{sha256d, BlockHeader, Hash256};

use crate::NodeError;

pub type Command = [u8; 12];

pub const CMD_VERSION: Command = *b"version\0\0\0\0\0";
pub const CMD_VERACK: Command = *b"verack\0\0\0\0\0\0";
pub const CMD_PING: Command = *b"ping\0\0\0\0\0\0\0\0";
pub const CMD_PONG: Command = *b"pong\0\0\0\0\0\0\0\0";
pub const CMD_GETHEADERS: Command = *b"getheaders\0\0";
pub const CMD_HEADERS: Command = *b"headers\0\0\0\0\0";
pub const CMD_GETDATA: Command = *b"getdata\0\0\0\0\0";
pub const CMD_BLOCK: Command = *b"block\0\0\0\0\0\0\0";
pub const CMD_INV: Command = *b"inv\0\0\0\0\0\0\0\0\0";
pub const CMD_TX: Command = *b"tx\0\0\0\0\0\0\0\0\0\0";

pub const INV_TX: u32 = 0x0000_0001;
pub const INV_BLOCK: u32 = 0x0000_0002;
pub const INV_WITNESS_TX: u32 = 0x4000_0001;
pub const INV_WITNESS_BLOCK: u32 = 0x4000_0002;

pub const PROTOCOL_VERSION: u32 = 70016;
const USER_AGENT: &str = concat!("/farod:", env!("CARGO_PKG_VERSION"), "/");

const FRAME_HEADER_LEN: usize = 24;
const MAX_PAYLOAD_SIZE: usize = 8 * 1024 * 1024;
const MAX_HEADERS_RESULTS: usize = 2000;
const MAX_INV_RESULTS: usize = 50_000;

pub fn command_name(command: &Command) -> String {
    command
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as char)
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    pub command: Command,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    pub fn encode(&self, magic: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&magic);
        out.extend_from_slice(&self.command);
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        let checksum = sha256d(&self.payload);
        out.extend_from_slice(&checksum[..4]);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Reads one framed message, validating magic, size bound, and checksum.
pub async fn read_message<R>(reader: &mut R, magic: [u8; 4]) -> Result<RawMessage, NodeError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    if header[..4] != magic {
        return Err(NodeError::Protocol("invalid magic"));
    }
    let mut command = [0u8; 12];
    command.copy_from_slice(&header[4..16]);
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(NodeError::Protocol("payload too large"));
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    let checksum = sha256d(&payload);
    if header[20..24] != checksum[..4] {
        return Err(NodeError::Protocol("invalid payload checksum"));
    }
    Ok(RawMessage { command, payload })
}

pub fn build_version_payload(start_height: u32) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u32_le(PROTOCOL_VERSION);
    encoder.write_u64_le(0); // services: none
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    encoder.write_i64_le(timestamp);
    write_net_addr(&mut encoder);
    write_net_addr(&mut encoder);
    encoder.write_u64_le(rand::random());
    encoder.write_var_str(USER_AGENT);
    encoder.write_u32_le(start_height);
    encoder.write_u8(0); // no tx relay
    encoder.into_inner()
}

fn write_net_addr(encoder: &mut Encoder) {
    encoder.write_u64_le(0); // services
    encoder.write_bytes(&[0u8; 16]); // ip
    encoder.write_u16_be(0); // port
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub protocol_version: u32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: u32,
}

pub fn parse_version_payload(payload: &[u8]) -> Result<VersionInfo, NodeError> {
    let mut decoder = Decoder::new(payload);
    let protocol_version = decoder.read_u32_le()?;
    let services = decoder.read_u64_le()?;
    decoder.read_u64_le()?; // timestamp
    skip_net_addr(&mut decoder)?;
    skip_net_addr(&mut decoder)?;
    decoder.read_u64_le()?; // nonce
    let user_agent = decoder.read_var_str()?;
    let start_height = decoder.read_u32_le()?;
    // the relay flag is optional; ignore it and anything after
    Ok(VersionInfo {
        protocol_version,
        services,
        user_agent,
        start_height,
    })
}

fn skip_net_addr(decoder: &mut Decoder) -> Result<(), NodeError> {
    decoder.read_u64_le()?; // services
    decoder.read_fixed::<16>()?; // ip
    decoder.read_u16_be()?; // port
    Ok(())
}

pub fn build_getheaders_payload(locator: &[Hash256], stop: &Hash256) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u32_le(PROTOCOL_VERSION);
    encoder.write_compact_size(locator.len() as u64);
    for hash in locator {
        encoder.write_hash(hash);
    }
    encoder.write_hash(stop);
    encoder.into_inner()
}

/// Each `headers` entry is an 80-byte header followed by a transaction count
/// varint, always zero on this path; it is read and discarded.
pub fn parse_headers_payload(payload: &[u8]) -> Result<Vec<BlockHeader>, NodeError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_compact_size()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    if count > MAX_HEADERS_RESULTS {
        return Err(NodeError::Protocol("too many headers"));
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        headers.push(BlockHeader::decode_from(&mut decoder)?);
        decoder.read_compact_size()?;
    }
    if !decoder.is_empty() {
        return Err(NodeError::Decode(DecodeError::TrailingBytes));
    }
    Ok(headers)
}

pub fn build_inv_payload(entries: &[(u32, Hash256)]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_compact_size(entries.len() as u64);
    for (inv_type, hash) in entries {
        encoder.write_u32_le(*inv_type);
        encoder.write_hash(hash);
    }
    encoder.into_inner()
}

/// Parses `inv` and `getdata` payloads (same layout).
pub fn parse_inv_payload(payload: &[u8]) -> Result<Vec<(u32, Hash256)>, NodeError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_compact_size()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    if count > MAX_INV_RESULTS {
        return Err(NodeError::Protocol("too many inventory entries"));
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let inv_type = decoder.read_u32_le()?;
        let hash = decoder.read_hash()?;
        out.push((inv_type, hash));
    }
    if !decoder.is_empty() {
        return Err(NodeError::Decode(DecodeError::TrailingBytes));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let magic = [0xfa, 0xbf, 0xb5, 0xda];
        let message = RawMessage::new(CMD_PING, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let bytes = message.encode(magic);
        assert_eq!(bytes.len(), FRAME_HEADER_LEN + 8);

        let (mut tx, mut rx) = tokio::io::duplex(256);
        tokio::io::AsyncWriteExt::write_all(&mut tx, &bytes)
            .await
            .unwrap();
        let decoded = read_message(&mut rx, magic).await.unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn frame_rejects_wrong_magic() {
        let message = RawMessage::new(CMD_VERACK, Vec::new());
        let bytes = message.encode([0xf9, 0xbe, 0xb4, 0xd9]);
        let (mut tx, mut rx) = tokio::io::duplex(256);
        tokio::io::AsyncWriteExt::write_all(&mut tx, &bytes)
            .await
            .unwrap();
        let err = read_message(&mut rx, [0x0b, 0x11, 0x09, 0x07])
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Protocol("invalid magic")));
    }

    #[tokio::test]
    async fn frame_rejects_bad_checksum() {
        let magic = [0xfa, 0xbf, 0xb5, 0xda];
        let mut bytes = RawMessage::new(CMD_PING, vec![9; 8]).encode(magic);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let (mut tx, mut rx) = tokio::io::duplex(256);
        tokio::io::AsyncWriteExt::write_all(&mut tx, &bytes)
            .await
            .unwrap();
        let err = read_message(&mut rx, magic).await.unwrap_err();
        assert!(matches!(err, NodeError::Protocol("invalid payload checksum")));
    }

    #[test]
    fn command_names() {
        assert_eq!(command_name(&CMD_GETHEADERS), "getheaders");
        assert_eq!(command_name(&CMD_TX), "tx");
    }

    #[test]
    fn getheaders_layout() {
        let locator = [[0x11u8; 32]];
        let stop = [0u8; 32];
        let payload = build_getheaders_payload(&locator, &stop);
        assert_eq!(payload.len(), 4 + 1 + 32 + 32);
        assert_eq!(&payload[..4], &PROTOCOL_VERSION.to_le_bytes());
        assert_eq!(payload[4], 1);
        assert_eq!(&payload[5..37], &[0x11u8; 32]);
        assert_eq!(&payload[37..], &[0u8; 32]);
    }

    #[test]
    fn headers_payload_round_trip() {
        let headers: Vec<BlockHeader> = (0u8..3)
            .map(|i| BlockHeader {
                version: 2,
                prev_block: [i; 32],
                merkle_root: [i + 10; 32],
                time: 1_600_000_000 + i as u32,
                bits: 0x1d00_ffff,
                nonce: i as u32,
            })
            .collect();
        let mut encoder = Encoder::new();
        encoder.write_compact_size(headers.len() as u64);
        for header in &headers {
            header.encode_to(&mut encoder);
            encoder.write_compact_size(0);
        }
        let parsed = parse_headers_payload(&encoder.into_inner()).unwrap();
        assert_eq!(parsed, headers);
    }

    #[test]
    fn inv_round_trip() {
        let entries = vec![(INV_WITNESS_BLOCK, [0xabu8; 32]), (INV_TX, [0x01u8; 32])];
        let payload = build_inv_payload(&entries);
        assert_eq!(parse_inv_payload(&payload).unwrap(), entries);
    }

    #[test]
    fn version_payload_shape() {
        let payload = build_version_payload(0);
        // fixed fields + user agent varstr + height + relay flag
        assert_eq!(payload.len(), 4 + 8 + 8 + 26 + 26 + 8 + 1 + USER_AGENT.len() + 4 + 1);
        assert_eq!(&payload[..4], &PROTOCOL_VERSION.to_le_bytes());
        let ua_len = payload[80] as usize;
        assert_eq!(ua_len, USER_AGENT.len());
        assert_eq!(&payload[81..81 + ua_len], USER_AGENT.as_bytes());
    }

    #[test]
    fn version_payload_parses_back() {
        let info = parse_version_payload(&build_version_payload(812_345)).unwrap();
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
        assert_eq!(info.services, 0);
        assert_eq!(info.user_agent, USER_AGENT);
        assert_eq!(info.start_height, 812_345);
    }
}
