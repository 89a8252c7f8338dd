//! NodeClient against a scripted in-process peer.

use std::future::Future;
use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use faro_node::message::{
    build_version_payload, parse_inv_payload, read_message, Command, RawMessage, CMD_BLOCK,
    CMD_GETDATA, CMD_GETHEADERS, CMD_HEADERS, CMD_INV, CMD_PING, CMD_PONG, CMD_TX, CMD_VERACK,
    CMD_VERSION, INV_TX, INV_WITNESS_BLOCK, INV_WITNESS_TX,
};
use faro_node::NodeClient;
use faro_primitives::encoding::Encoder;
use faro_primitives::{
    sha256d, Block, BlockHeader, Network, OutPoint, Transaction, TxIn, TxOut,
};

const NETWORK: Network = Network::Regtest;

async fn send(stream: &mut TcpStream, command: Command, payload: Vec<u8>) {
    let bytes = RawMessage::new(command, payload).encode(NETWORK.magic());
    stream.write_all(&bytes).await.unwrap();
}

async fn recv(stream: &mut TcpStream) -> RawMessage {
    read_message(stream, NETWORK.magic()).await.unwrap()
}

/// Accepts one connection, performs the peer half of the handshake, then
/// hands the socket to the test script. The returned handle must be awaited
/// so the script's assertions propagate.
fn spawn_peer<F, Fut>(script: F) -> (SocketAddr, tokio::task::JoinHandle<()>)
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let listener = TcpListener::from_std(listener).unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();

        let version = recv(&mut stream).await;
        assert_eq!(version.command, CMD_VERSION);
        send(&mut stream, CMD_VERSION, build_version_payload(500)).await;
        send(&mut stream, CMD_VERACK, Vec::new()).await;
        let verack = recv(&mut stream).await;
        assert_eq!(verack.command, CMD_VERACK);

        script(stream).await;
    });
    (addr, handle)
}

fn sample_headers(count: u8) -> Vec<BlockHeader> {
    let mut prev = NETWORK.genesis_hash();
    (0..count)
        .map(|i| {
            let header = BlockHeader {
                version: 2,
                prev_block: prev,
                merkle_root: [i; 32],
                time: 1_600_000_000 + i as u32,
                bits: 0x207f_ffff,
                nonce: i as u32,
            };
            prev = header.hash();
            header
        })
        .collect()
}

fn headers_payload(headers: &[BlockHeader]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_compact_size(headers.len() as u64);
    for header in headers {
        header.encode_to(&mut encoder);
        encoder.write_compact_size(0);
    }
    encoder.into_inner()
}

fn sample_block() -> Block {
    let tx = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![0x01],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 5_000_000_000,
            script_pubkey: vec![0x51],
        }],
        witnesses: Vec::new(),
        lock_time: 0,
    };
    let header = BlockHeader {
        version: 2,
        prev_block: NETWORK.genesis_hash(),
        merkle_root: tx.txid(),
        time: 1_600_000_100,
        bits: 0x207f_ffff,
        nonce: 9,
    };
    Block {
        header,
        transactions: vec![tx],
    }
}

#[tokio::test]
async fn handshake_then_get_headers() {
    let headers = sample_headers(3);
    let payload = headers_payload(&headers);
    let (addr, peer) = spawn_peer(move |mut stream| async move {
        let request = recv(&mut stream).await;
        assert_eq!(request.command, CMD_GETHEADERS);
        send(&mut stream, CMD_HEADERS, payload).await;
    });

    let client = NodeClient::connect(&addr.to_string(), NETWORK).await.unwrap();
    let got = client
        .get_headers(&[NETWORK.genesis_hash()], &[0u8; 32])
        .await
        .unwrap();
    assert_eq!(got, headers);
    peer.await.unwrap();
}

#[tokio::test]
async fn pings_are_answered_while_a_request_is_in_flight() {
    let headers = sample_headers(1);
    let payload = headers_payload(&headers);
    let (addr, peer) = spawn_peer(move |mut stream| async move {
        let request = recv(&mut stream).await;
        assert_eq!(request.command, CMD_GETHEADERS);
        // interleave a ping before the response and expect the echo back
        let nonce = vec![1, 2, 3, 4, 5, 6, 7, 8];
        send(&mut stream, CMD_PING, nonce.clone()).await;
        let pong = recv(&mut stream).await;
        assert_eq!(pong.command, CMD_PONG);
        assert_eq!(pong.payload, nonce);
        send(&mut stream, CMD_HEADERS, payload).await;
    });

    let client = NodeClient::connect(&addr.to_string(), NETWORK).await.unwrap();
    let got = client
        .get_headers(&[NETWORK.genesis_hash()], &[0u8; 32])
        .await
        .unwrap();
    assert_eq!(got.len(), 1);
    peer.await.unwrap();
}

#[tokio::test]
async fn get_block_requests_the_witness_form() {
    let block = sample_block();
    let block_hash = block.hash();
    let block_bytes = block.consensus_encode();
    let (addr, peer) = spawn_peer(move |mut stream| async move {
        let request = recv(&mut stream).await;
        assert_eq!(request.command, CMD_GETDATA);
        let entries = parse_inv_payload(&request.payload).unwrap();
        assert_eq!(entries, vec![(INV_WITNESS_BLOCK, block_hash)]);
        send(&mut stream, CMD_BLOCK, block_bytes).await;
    });

    let client = NodeClient::connect(&addr.to_string(), NETWORK).await.unwrap();
    let got = client.get_block(&block.hash()).await.unwrap();
    assert_eq!(got, block);
    peer.await.unwrap();
}

#[tokio::test]
async fn broadcast_announces_then_serves_the_transaction() {
    let raw = sample_block().transactions[0].consensus_encode();
    let wtxid = sha256d(&raw);
    let expected_raw = raw.clone();
    let (addr, peer) = spawn_peer(move |mut stream| async move {
        let announce = recv(&mut stream).await;
        assert_eq!(announce.command, CMD_INV);
        let entries = parse_inv_payload(&announce.payload).unwrap();
        assert_eq!(entries, vec![(INV_WITNESS_TX, wtxid)]);

        // request it the way a node that wants the tx would
        let mut encoder = Encoder::new();
        encoder.write_compact_size(1);
        encoder.write_u32_le(INV_TX);
        encoder.write_hash(&wtxid);
        send(&mut stream, CMD_GETDATA, encoder.into_inner()).await;

        let tx = recv(&mut stream).await;
        assert_eq!(tx.command, CMD_TX);
        assert_eq!(tx.payload, expected_raw);
    });

    let client = NodeClient::connect(&addr.to_string(), NETWORK).await.unwrap();
    client.broadcast_witness_tx(&raw).await.unwrap();
    peer.await.unwrap();
}
