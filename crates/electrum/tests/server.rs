//! End-to-end server test: scripted chain → engine → TCP client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use faro_electrum::serve_listener;
use faro_hd::bip32::ExtendedKey;
use faro_hd::script::{derive_range, Branch, Kind};
use faro_node::NodeError;
use faro_primitives::{
    merkle_root, sha256, Block, BlockHeader, Hash256, Network, OutPoint, Transaction, TxIn, TxOut,
};
use faro_store::Index;
use faro_sync::{ChainSource, Engine, EngineConfig, WalletConfig};

const NETWORK: Network = Network::Regtest;

struct StaticChain {
    headers: Vec<BlockHeader>,
    blocks: HashMap<Hash256, Block>,
    broadcasts: Mutex<Vec<Vec<u8>>>,
}

impl StaticChain {
    fn build(blocks_txs: Vec<Vec<Transaction>>) -> Self {
        let mut headers = Vec::new();
        let mut blocks = HashMap::new();
        let mut prev = NETWORK.genesis_hash();
        for (i, transactions) in blocks_txs.into_iter().enumerate() {
            let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
            let header = BlockHeader {
                version: 2,
                prev_block: prev,
                merkle_root: merkle_root(&txids),
                time: 1_500_000_000 + i as u32,
                bits: 0x207f_ffff,
                nonce: i as u32,
            };
            prev = header.hash();
            headers.push(header);
            blocks.insert(
                header.hash(),
                Block {
                    header,
                    transactions,
                },
            );
        }
        Self {
            headers,
            blocks,
            broadcasts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ChainSource for StaticChain {
    async fn get_headers(
        &self,
        locator: &[Hash256],
        _stop: &Hash256,
    ) -> Result<Vec<BlockHeader>, NodeError> {
        let start = if locator[0] == NETWORK.genesis_hash() {
            0
        } else {
            match self
                .headers
                .iter()
                .position(|header| header.hash() == locator[0])
            {
                Some(index) => index + 1,
                None => 0,
            }
        };
        Ok(self.headers[start..].to_vec())
    }

    async fn get_block(&self, hash: &Hash256) -> Result<Block, NodeError> {
        self.blocks
            .get(hash)
            .cloned()
            .ok_or(NodeError::Protocol("unknown block requested"))
    }

    async fn broadcast_witness_tx(&self, raw: &[u8]) -> Result<(), NodeError> {
        self.broadcasts.lock().unwrap().push(raw.to_vec());
        Ok(())
    }
}

fn master_key() -> ExtendedKey {
    ExtendedKey::master_from_seed(&[11u8; 32]).unwrap()
}

fn receive_script(index: u32) -> Vec<u8> {
    let branch = master_key()
        .derive_pub(&[Branch::Receive.child_index()])
        .unwrap();
    derive_range(Kind::P2wpkh, 0, &[branch], index, 1)
        .unwrap()
        .pop()
        .unwrap()
}

fn coinbase(height: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 5_000_000_000,
            script_pubkey: vec![0x51],
        }],
        witnesses: Vec::new(),
        lock_time: 0,
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    next_id: u64,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
            next_id: 1,
        }
    }

    async fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut line = request.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
        loop {
            let line = self.lines.next_line().await.unwrap().unwrap();
            let value: Value = serde_json::from_str(&line).unwrap();
            // skip interleaved notifications
            if value.get("method").is_some() {
                continue;
            }
            assert_eq!(value["id"], id);
            return value;
        }
    }
}

struct Server {
    addr: std::net::SocketAddr,
    source: Arc<StaticChain>,
    script_hash: Hash256,
    funding_txid: Hash256,
    _shutdown: watch::Sender<bool>,
}

async fn start_server() -> Server {
    let script = receive_script(0);
    let script_hash = sha256(&script);
    let funding = Transaction {
        version: 2,
        inputs: vec![TxIn {
            prevout: OutPoint {
                txid: sha256(b"funding source"),
                vout: 0,
            },
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 123_456,
            script_pubkey: script,
        }],
        witnesses: Vec::new(),
        lock_time: 0,
    };
    let funding_txid = funding.txid();

    let source = Arc::new(StaticChain::build(vec![
        vec![coinbase(1)],
        vec![coinbase(2), funding],
    ]));
    let config = EngineConfig::new(
        NETWORK,
        vec![WalletConfig {
            kind: Kind::P2wpkh,
            required_sigs: 0,
            master_keys: vec![master_key()],
            birth_height: 0,
        }],
    );
    let engine = Arc::new(
        Engine::new(config, Index::open_in_memory().unwrap(), Arc::clone(&source)).unwrap(),
    );
    engine.sync_once().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(serve_listener(listener, engine, shutdown_rx));
    Server {
        addr,
        source,
        script_hash,
        funding_txid,
        _shutdown: shutdown_tx,
    }
}

fn display_hex(hash: &Hash256) -> String {
    let mut out = *hash;
    out.reverse();
    hex::encode(out)
}

#[tokio::test]
async fn electrum_session_round_trip() {
    let server = start_server().await;
    let (source, script_hash, funding_txid) =
        (&server.source, server.script_hash, server.funding_txid);
    let mut client = Client::connect(server.addr).await;

    let version = client
        .call("server.version", json!(["test-wallet", "1.4"]))
        .await;
    assert_eq!(version["result"][1], "1.4");

    let tip = client.call("blockchain.headers.subscribe", json!([])).await;
    assert_eq!(tip["result"]["height"], 2);
    assert_eq!(
        tip["result"]["hex"].as_str().unwrap().len(),
        160,
    );

    let genesis = client.call("blockchain.block.header", json!([0])).await;
    assert_eq!(
        genesis["result"],
        json!(hex::encode(NETWORK.genesis_header().consensus_encode()))
    );

    let headers = client
        .call("blockchain.block.headers", json!([0, 10]))
        .await;
    assert_eq!(headers["result"]["count"], 3);
    assert_eq!(headers["result"]["max"], 2016);

    let balance = client
        .call(
            "blockchain.scripthash.get_balance",
            json!([display_hex(&script_hash)]),
        )
        .await;
    assert_eq!(balance["result"]["confirmed"], 123_456);
    assert_eq!(balance["result"]["unconfirmed"], 0);

    let history = client
        .call(
            "blockchain.scripthash.get_history",
            json!([display_hex(&script_hash)]),
        )
        .await;
    assert_eq!(history["result"][0]["height"], 2);
    assert_eq!(history["result"][0]["tx_hash"], display_hex(&funding_txid));

    let mempool = client
        .call(
            "blockchain.scripthash.get_mempool",
            json!([display_hex(&script_hash)]),
        )
        .await;
    assert_eq!(mempool["result"], json!([]));

    let unspent = client
        .call(
            "blockchain.scripthash.listunspent",
            json!([display_hex(&script_hash)]),
        )
        .await;
    assert_eq!(unspent["result"][0]["value"], 123_456);
    assert_eq!(unspent["result"][0]["tx_hash"], display_hex(&funding_txid));

    let status = client
        .call(
            "blockchain.scripthash.subscribe",
            json!([display_hex(&script_hash)]),
        )
        .await;
    assert!(status["result"].is_string());

    let raw = client
        .call(
            "blockchain.transaction.get",
            json!([display_hex(&funding_txid)]),
        )
        .await;
    let raw_hex = raw["result"].as_str().unwrap();
    let decoded = Transaction::consensus_decode(&hex::decode(raw_hex).unwrap()).unwrap();
    assert_eq!(decoded.txid(), funding_txid);

    let merkle = client
        .call(
            "blockchain.transaction.get_merkle",
            json!([display_hex(&funding_txid), 2]),
        )
        .await;
    assert_eq!(merkle["result"]["block_height"], 2);
    assert_eq!(merkle["result"]["pos"], 1);
    assert_eq!(merkle["result"]["merkle"].as_array().unwrap().len(), 1);

    let id_from_pos = client
        .call("blockchain.transaction.id_from_pos", json!([2, 1]))
        .await;
    assert_eq!(id_from_pos["result"], json!(display_hex(&funding_txid)));

    let broadcast_tx = coinbase(99);
    let broadcast = client
        .call(
            "blockchain.transaction.broadcast",
            json!([hex::encode(broadcast_tx.consensus_encode())]),
        )
        .await;
    assert_eq!(
        broadcast["result"],
        json!(display_hex(&broadcast_tx.txid()))
    );
    assert_eq!(source.broadcasts.lock().unwrap().len(), 1);

    let fee = client.call("blockchain.estimatefee", json!([6])).await;
    assert_eq!(fee["result"], json!(0.0001));

    let ping = client.call("server.ping", json!([])).await;
    assert!(ping["result"].is_null());

    let unknown = client.call("blockchain.unknown.method", json!([])).await;
    assert_eq!(unknown["error"]["code"], -32601);

    let missing = client
        .call(
            "blockchain.transaction.get",
            json!([display_hex(&sha256(b"no such tx"))]),
        )
        .await;
    assert_eq!(missing["error"]["code"], 1);
}

#[tokio::test]
async fn parse_errors_do_not_kill_the_connection() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await;

    client.writer.write_all(b"this is not json\n").await.unwrap();
    let line = client.lines.next_line().await.unwrap().unwrap();
    let value: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["error"]["code"], -32700);

    // the connection still serves requests afterwards
    let pong = client.call("server.ping", json!([])).await;
    assert!(pong["result"].is_null());
}
