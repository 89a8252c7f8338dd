//! Connection to the trusted node: handshake, then one reader task and one
//! writer task sharing the socket. Requests install a one-shot waiter for
//! the response command before sending; the reader completes it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use faro_log::{log_debug, log_info, log_warn};
use faro_primitives::{sha256d, Block, BlockHeader, Hash256, Network};

use crate::message::{
    build_getheaders_payload, build_inv_payload, build_version_payload, command_name,
    parse_headers_payload, parse_inv_payload, parse_version_payload, read_message, Command,
    RawMessage, CMD_BLOCK, CMD_GETDATA, CMD_GETHEADERS, CMD_HEADERS, CMD_INV, CMD_PING, CMD_PONG,
    CMD_TX, CMD_VERACK, CMD_VERSION, INV_TX, INV_WITNESS_BLOCK, INV_WITNESS_TX,
};
use crate::NodeError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_QUEUE_DEPTH: usize = 16;

type Pending = Arc<Mutex<HashMap<Command, oneshot::Sender<Vec<u8>>>>>;

pub struct NodeClient {
    magic: [u8; 4],
    writer_tx: mpsc::Sender<RawMessage>,
    pending: Pending,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl NodeClient {
    pub async fn connect(addr: &str, network: Network) -> Result<Self, NodeError> {
        let magic = network.magic();
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| NodeError::Timeout)??;
        timeout(HANDSHAKE_TIMEOUT, handshake(&mut stream, magic))
            .await
            .map_err(|_| NodeError::Timeout)??;

        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let reader = tokio::spawn(run_reader(
            read_half,
            magic,
            Arc::clone(&pending),
            writer_tx.clone(),
        ));
        let writer = tokio::spawn(run_writer(write_half, magic, writer_rx));

        Ok(Self {
            magic,
            writer_tx,
            pending,
            reader,
            writer,
        })
    }

    pub async fn get_headers(
        &self,
        locator: &[Hash256],
        stop: &Hash256,
    ) -> Result<Vec<BlockHeader>, NodeError> {
        let message = RawMessage::new(CMD_GETHEADERS, build_getheaders_payload(locator, stop));
        let payload = self.request(CMD_HEADERS, message).await?;
        parse_headers_payload(&payload)
    }

    pub async fn get_block(&self, hash: &Hash256) -> Result<Block, NodeError> {
        let message = RawMessage::new(
            CMD_GETDATA,
            build_inv_payload(&[(INV_WITNESS_BLOCK, *hash)]),
        );
        let payload = self.request(CMD_BLOCK, message).await?;
        Ok(Block::consensus_decode(&payload)?)
    }

    /// Announces the transaction and serves the node's resulting `getdata`.
    /// The inventory hash is the double-SHA-256 of the raw witness bytes.
    pub async fn broadcast_witness_tx(&self, raw: &[u8]) -> Result<(), NodeError> {
        let wtxid = sha256d(raw);
        let announce = RawMessage::new(CMD_INV, build_inv_payload(&[(INV_WITNESS_TX, wtxid)]));
        let payload = self.request(CMD_GETDATA, announce).await?;
        let entries = parse_inv_payload(&payload)?;
        if entries.len() != 1 {
            return Err(NodeError::Protocol("unexpected getdata entry count"));
        }
        let (inv_type, hash) = entries[0];
        if inv_type != INV_TX && inv_type != INV_WITNESS_TX {
            return Err(NodeError::Protocol("unexpected getdata inventory type"));
        }
        if hash != wtxid {
            return Err(NodeError::Protocol("getdata for a different transaction"));
        }
        self.send(RawMessage::new(CMD_TX, raw.to_vec())).await
    }

    async fn send(&self, message: RawMessage) -> Result<(), NodeError> {
        self.writer_tx
            .send(message)
            .await
            .map_err(|_| NodeError::Closed)
    }

    async fn request(
        &self,
        response: Command,
        message: RawMessage,
    ) -> Result<Vec<u8>, NodeError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock_pending(&self.pending);
            if pending.contains_key(&response) {
                return Err(NodeError::Protocol("concurrent request for one command"));
            }
            pending.insert(response, tx);
        }
        if let Err(err) = self.send(message).await {
            lock_pending(&self.pending).remove(&response);
            return Err(err);
        }
        match timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(NodeError::Closed),
            Err(_) => {
                lock_pending(&self.pending).remove(&response);
                Err(NodeError::Timeout)
            }
        }
    }

    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }
}

impl Drop for NodeClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn lock_pending(
    pending: &Pending,
) -> std::sync::MutexGuard<'_, HashMap<Command, oneshot::Sender<Vec<u8>>>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Version/verack exchange on the raw socket, before the reader and writer
/// tasks split it. Pings seen mid-handshake are answered inline.
async fn handshake(stream: &mut TcpStream, magic: [u8; 4]) -> Result<(), NodeError> {
    let version = RawMessage::new(CMD_VERSION, build_version_payload(0));
    stream.write_all(&version.encode(magic)).await?;

    let mut got_version = false;
    let mut got_verack = false;
    while !(got_version && got_verack) {
        let message = read_message(stream, magic).await?;
        match message.command {
            CMD_VERSION => {
                got_version = true;
                match parse_version_payload(&message.payload) {
                    Ok(info) => log_info!(
                        "peer {} at height {} (protocol {})",
                        info.user_agent,
                        info.start_height,
                        info.protocol_version
                    ),
                    Err(err) => log_debug!("unparseable version payload: {err}"),
                }
                let verack = RawMessage::new(CMD_VERACK, Vec::new());
                stream.write_all(&verack.encode(magic)).await?;
            }
            CMD_VERACK => {
                got_verack = true;
            }
            CMD_PING => {
                let pong = RawMessage::new(CMD_PONG, message.payload);
                stream.write_all(&pong.encode(magic)).await?;
            }
            other => {
                log_debug!(
                    "ignoring {} during handshake",
                    command_name(&other)
                );
            }
        }
    }
    Ok(())
}

async fn run_reader(
    mut read_half: OwnedReadHalf,
    magic: [u8; 4],
    pending: Pending,
    writer_tx: mpsc::Sender<RawMessage>,
) {
    loop {
        let message = match read_message(&mut read_half, magic).await {
            Ok(message) => message,
            Err(err) => {
                log_warn!("node reader stopped: {err}");
                break;
            }
        };
        if message.command == CMD_PING {
            let pong = RawMessage::new(CMD_PONG, message.payload);
            if writer_tx.send(pong).await.is_err() {
                break;
            }
            continue;
        }
        let waiter = lock_pending(&pending).remove(&message.command);
        match waiter {
            Some(tx) => {
                let _ = tx.send(message.payload);
            }
            None => {
                log_debug!("unhandled message: {}", command_name(&message.command));
            }
        }
    }
    // fail in-flight requests fast instead of letting them hit the timeout
    lock_pending(&pending).clear();
}

async fn run_writer(
    mut write_half: OwnedWriteHalf,
    magic: [u8; 4],
    mut writer_rx: mpsc::Receiver<RawMessage>,
) {
    while let Some(message) = writer_rx.recv().await {
        let bytes = message.encode(magic);
        if let Err(err) = write_half.write_all(&bytes).await {
            log_warn!("node writer stopped: {err}");
            break;
        }
    }
}
