//! Per-method handlers. Script hashes, txids, and Merkle siblings cross the
//! wire in reversed (big-endian display) byte order; headers, raw
//! transactions, and status hashes as-is.

use serde_json::{json, Value};
use tokio::sync::mpsc;

use faro_primitives::Hash256;
use faro_sync::{ChainSource, ConnectionId, Engine, Notification, SyncError};

use crate::{PROTOCOL_VERSION, SERVER_NAME};

const MAX_HEADER_CHUNK: usize = 2016;
const STATIC_FEE_BTC_PER_KB: f64 = 0.0001;
const STATIC_RELAY_FEE_BTC_PER_KB: f64 = 0.00001;

#[derive(Debug)]
pub enum RpcError {
    UnknownMethod(String),
    BadParams(&'static str),
    NotFound,
    Internal(String),
}

impl RpcError {
    pub fn code(&self) -> i64 {
        match self {
            RpcError::UnknownMethod(_) => -32601,
            RpcError::BadParams(_) => -32602,
            RpcError::NotFound | RpcError::Internal(_) => 1,
        }
    }

    pub fn message(&self) -> String {
        match self {
            RpcError::UnknownMethod(method) => format!("unknown method: {method}"),
            RpcError::BadParams(message) => format!("bad params: {message}"),
            RpcError::NotFound => "not found".to_string(),
            RpcError::Internal(message) => message.clone(),
        }
    }
}

impl From<SyncError> for RpcError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NotFound => RpcError::NotFound,
            other => RpcError::Internal(other.to_string()),
        }
    }
}

pub async fn dispatch<S: ChainSource>(
    id: ConnectionId,
    engine: &Engine<S>,
    events: &mpsc::Sender<Notification>,
    method: &str,
    params: &Value,
) -> Result<Value, RpcError> {
    match method {
        "blockchain.block.header" => block_header(engine, params).await,
        "blockchain.block.headers" => block_headers(engine, params).await,
        "blockchain.estimatefee" => Ok(json!(STATIC_FEE_BTC_PER_KB)),
        "blockchain.relayfee" => Ok(json!(STATIC_RELAY_FEE_BTC_PER_KB)),
        "blockchain.headers.subscribe" => headers_subscribe(id, engine, events).await,
        "blockchain.scripthash.get_balance" => script_balance(engine, params).await,
        "blockchain.scripthash.get_history" => script_history(engine, params).await,
        "blockchain.scripthash.get_mempool" => Ok(json!([])),
        "blockchain.scripthash.listunspent" => script_unspent(engine, params).await,
        "blockchain.scripthash.subscribe" => script_subscribe(id, engine, events, params).await,
        "blockchain.scripthash.unsubscribe" => Ok(json!(false)),
        "blockchain.transaction.broadcast" => broadcast(engine, params).await,
        "blockchain.transaction.get" => transaction_get(engine, params).await,
        "blockchain.transaction.get_merkle" => transaction_merkle(engine, params).await,
        "blockchain.transaction.id_from_pos" => transaction_id_from_pos(engine, params).await,
        "mempool.get_fee_histogram" => Ok(json!([])),
        "mempool.get_info" => Ok(json!({
            "mempoolminfee": STATIC_RELAY_FEE_BTC_PER_KB,
            "minrelaytxfee": STATIC_RELAY_FEE_BTC_PER_KB,
            "incrementalrelayfee": STATIC_RELAY_FEE_BTC_PER_KB,
        })),
        "server.banner" => Ok(json!(SERVER_NAME)),
        "server.donation_address" => Ok(json!("")),
        "server.peers.subscribe" => Ok(json!([])),
        "server.ping" => Ok(Value::Null),
        "server.version" => server_version(params),
        other => Err(RpcError::UnknownMethod(other.to_string())),
    }
}

async fn block_header<S: ChainSource>(
    engine: &Engine<S>,
    params: &Value,
) -> Result<Value, RpcError> {
    let height = height_param(params, 0)?;
    let header = engine.get_header(height).await?;
    Ok(json!(hex::encode(header)))
}

async fn block_headers<S: ChainSource>(
    engine: &Engine<S>,
    params: &Value,
) -> Result<Value, RpcError> {
    let start = height_param(params, 0)?;
    let count = height_param(params, 1)?;
    let count = usize::try_from(count)
        .map_err(|_| RpcError::BadParams("negative count"))?
        .min(MAX_HEADER_CHUNK);
    let headers = engine.get_headers(start, count).await?;
    let mut chunk = Vec::with_capacity(headers.len() * 80);
    for header in &headers {
        chunk.extend_from_slice(header);
    }
    Ok(json!({
        "hex": hex::encode(chunk),
        "count": headers.len(),
        "max": MAX_HEADER_CHUNK,
    }))
}

async fn headers_subscribe<S: ChainSource>(
    id: ConnectionId,
    engine: &Engine<S>,
    events: &mpsc::Sender<Notification>,
) -> Result<Value, RpcError> {
    let (height, header) = engine.tip_header().await?;
    engine.subscribe_headers(id, events.clone()).await;
    Ok(json!({
        "height": height,
        "hex": hex::encode(header),
    }))
}

async fn script_balance<S: ChainSource>(
    engine: &Engine<S>,
    params: &Value,
) -> Result<Value, RpcError> {
    let script_hash = script_hash_param(params)?;
    let (confirmed, unconfirmed) = engine.script_balance(&script_hash).await?;
    Ok(json!({
        "confirmed": confirmed,
        "unconfirmed": unconfirmed,
    }))
}

async fn script_history<S: ChainSource>(
    engine: &Engine<S>,
    params: &Value,
) -> Result<Value, RpcError> {
    let script_hash = script_hash_param(params)?;
    let history = engine.script_history(&script_hash).await?;
    let entries: Vec<Value> = history
        .iter()
        .map(|entry| {
            json!({
                "height": entry.height,
                "tx_hash": hex::encode(display_order(&entry.txid)),
            })
        })
        .collect();
    Ok(json!(entries))
}

async fn script_unspent<S: ChainSource>(
    engine: &Engine<S>,
    params: &Value,
) -> Result<Value, RpcError> {
    let script_hash = script_hash_param(params)?;
    let unspent = engine.script_unspent(&script_hash).await?;
    let entries: Vec<Value> = unspent
        .iter()
        .map(|entry| {
            json!({
                "height": entry.height,
                "tx_pos": entry.pos,
                "tx_hash": hex::encode(display_order(&entry.txid)),
                "value": entry.satoshi,
            })
        })
        .collect();
    Ok(json!(entries))
}

async fn script_subscribe<S: ChainSource>(
    id: ConnectionId,
    engine: &Engine<S>,
    events: &mpsc::Sender<Notification>,
    params: &Value,
) -> Result<Value, RpcError> {
    let script_hash = script_hash_param(params)?;
    let status = engine.script_status(&script_hash).await?;
    engine
        .subscribe_script(id, script_hash, events.clone())
        .await;
    Ok(match status {
        Some(status) => json!(hex::encode(status)),
        None => Value::Null,
    })
}

async fn broadcast<S: ChainSource>(
    engine: &Engine<S>,
    params: &Value,
) -> Result<Value, RpcError> {
    let raw = hex_param(params, 0)?;
    let txid = engine.broadcast(&raw).await?;
    Ok(json!(hex::encode(display_order(&txid))))
}

async fn transaction_get<S: ChainSource>(
    engine: &Engine<S>,
    params: &Value,
) -> Result<Value, RpcError> {
    let txid = txid_param(params, 0)?;
    let raw = engine.raw_tx(&txid).await?;
    Ok(json!(hex::encode(raw)))
}

async fn transaction_merkle<S: ChainSource>(
    engine: &Engine<S>,
    params: &Value,
) -> Result<Value, RpcError> {
    let txid = txid_param(params, 0)?;
    let height = height_param(params, 1)?;
    let (pos, branch) = engine.tx_merkle(&txid).await?;
    let merkle: Vec<String> = branch
        .iter()
        .map(|sibling| hex::encode(display_order(sibling)))
        .collect();
    Ok(json!({
        "block_height": height,
        "pos": pos,
        "merkle": merkle,
    }))
}

async fn transaction_id_from_pos<S: ChainSource>(
    engine: &Engine<S>,
    params: &Value,
) -> Result<Value, RpcError> {
    let height = height_param(params, 0)?;
    let pos = height_param(params, 1)?;
    let want_merkle = params
        .get(2)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let (txid, branch) = engine.tx_merkle_at(height, pos).await?;
    let tx_hash = hex::encode(display_order(&txid));
    if !want_merkle {
        return Ok(json!(tx_hash));
    }
    let merkle: Vec<String> = branch
        .iter()
        .map(|sibling| hex::encode(display_order(sibling)))
        .collect();
    Ok(json!({
        "tx_hash": tx_hash,
        "merkle": merkle,
    }))
}

fn server_version(params: &Value) -> Result<Value, RpcError> {
    if let Some(requested) = params.get(1) {
        let supported = match requested {
            Value::String(version) => version == PROTOCOL_VERSION,
            // [min, max] range form
            Value::Array(range) => {
                let min = range.first().and_then(Value::as_str).unwrap_or("");
                let max = range.get(1).and_then(Value::as_str).unwrap_or(min);
                min <= PROTOCOL_VERSION && PROTOCOL_VERSION <= max
            }
            _ => false,
        };
        if !supported {
            return Err(RpcError::BadParams("unsupported protocol version"));
        }
    }
    Ok(json!([SERVER_NAME, PROTOCOL_VERSION]))
}

// ---- parameter helpers -----------------------------------------------------

fn height_param(params: &Value, index: usize) -> Result<i64, RpcError> {
    params
        .get(index)
        .and_then(Value::as_i64)
        .ok_or(RpcError::BadParams("expected an integer"))
}

fn hex_param(params: &Value, index: usize) -> Result<Vec<u8>, RpcError> {
    let raw = params
        .get(index)
        .and_then(Value::as_str)
        .ok_or(RpcError::BadParams("expected a hex string"))?;
    hex::decode(raw).map_err(|_| RpcError::BadParams("invalid hex"))
}

/// A 32-byte hash sent in display order: decoded and reversed to internal
/// byte order.
fn hash_param(params: &Value, index: usize) -> Result<Hash256, RpcError> {
    let bytes = hex_param(params, index)?;
    let mut out: Hash256 = bytes
        .try_into()
        .map_err(|_| RpcError::BadParams("expected a 32-byte hash"))?;
    out.reverse();
    Ok(out)
}

fn script_hash_param(params: &Value) -> Result<Hash256, RpcError> {
    hash_param(params, 0)
}

fn txid_param(params: &Value, index: usize) -> Result<Hash256, RpcError> {
    hash_param(params, index)
}

pub(crate) fn display_order(hash: &Hash256) -> Hash256 {
    let mut out = *hash;
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_params_reverse_display_order() {
        let mut display = [0u8; 32];
        display[0] = 0xaa;
        let params = json!([hex::encode(display)]);
        let parsed = script_hash_param(&params).unwrap();
        assert_eq!(parsed[31], 0xaa);
        assert_eq!(parsed[0], 0x00);
    }

    #[test]
    fn hash_params_reject_bad_input() {
        assert!(matches!(
            script_hash_param(&json!(["zz"])),
            Err(RpcError::BadParams(_))
        ));
        assert!(matches!(
            script_hash_param(&json!(["abcd"])),
            Err(RpcError::BadParams(_))
        ));
        assert!(matches!(
            script_hash_param(&json!([])),
            Err(RpcError::BadParams(_))
        ));
    }

    #[test]
    fn version_negotiation() {
        assert!(server_version(&json!(["wallet", "1.4"])).is_ok());
        assert!(server_version(&json!(["wallet", ["1.2", "1.4"]])).is_ok());
        assert!(server_version(&json!(["wallet"])).is_ok());
        assert!(matches!(
            server_version(&json!(["wallet", "1.2"])),
            Err(RpcError::BadParams(_))
        ));
        assert!(matches!(
            server_version(&json!(["wallet", ["1.0", "1.1"]])),
            Err(RpcError::BadParams(_))
        ));
    }

    #[test]
    fn error_codes() {
        assert_eq!(RpcError::UnknownMethod("x".into()).code(), -32601);
        assert_eq!(RpcError::BadParams("x").code(), -32602);
        assert_eq!(RpcError::NotFound.code(), 1);
    }
}
