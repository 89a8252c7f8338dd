//! Electrum script-status hashes.

use std::fmt::Write;

use faro_primitives::{sha256, Hash256};
use faro_store::HistoryEntry;

/// SHA-256 over the concatenation of `<txid_hex>:<height>:` for the ordered
/// confirmed history, with txids in big-endian display order. `None` for an
/// empty history.
pub fn status_hash(history: &[HistoryEntry]) -> Option<Hash256> {
    if history.is_empty() {
        return None;
    }
    let mut preimage = String::with_capacity(history.len() * 76);
    for entry in history {
        let mut txid = entry.txid;
        txid.reverse();
        let _ = write!(preimage, "{}:{}:", hex::encode(txid), entry.height);
    }
    Some(sha256(preimage.as_bytes()))
}
