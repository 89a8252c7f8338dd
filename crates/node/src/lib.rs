//! Client side of the Bitcoin peer protocol against a single trusted node:
//! message framing, version handshake, and the request primitives the sync
//! engine needs (`getheaders`, `getdata` for blocks, witness-tx broadcast).

pub mod client;
pub mod message;
pub mod persistent;

pub use client::NodeClient;
pub use message::RawMessage;
pub use persistent::PersistentNode;

use faro_primitives::encoding::DecodeError;

#[derive(Debug)]
pub enum NodeError {
    Io(std::io::Error),
    Protocol(&'static str),
    Decode(DecodeError),
    Timeout,
    Closed,
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::Io(err) => write!(f, "node i/o: {err}"),
            NodeError::Protocol(message) => write!(f, "node protocol: {message}"),
            NodeError::Decode(err) => write!(f, "node payload: {err}"),
            NodeError::Timeout => write!(f, "node request timed out"),
            NodeError::Closed => write!(f, "node connection closed"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err)
    }
}

impl From<DecodeError> for NodeError {
    fn from(err: DecodeError) -> Self {
        NodeError::Decode(err)
    }
}
