//! A node handle that survives connection loss. Every call connects lazily;
//! any error tears the connection down so the caller's next attempt (the
//! next sync tick) dials a fresh one.

use tokio::sync::Mutex;

use faro_log::log_info;
use faro_primitives::{Block, BlockHeader, Hash256, Network};

use crate::client::NodeClient;
use crate::NodeError;

pub struct PersistentNode {
    addr: String,
    network: Network,
    client: Mutex<Option<NodeClient>>,
}

impl PersistentNode {
    pub fn new(addr: impl Into<String>, network: Network) -> Self {
        Self {
            addr: addr.into(),
            network,
            client: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn get_headers(
        &self,
        locator: &[Hash256],
        stop: &Hash256,
    ) -> Result<Vec<BlockHeader>, NodeError> {
        let mut guard = self.client.lock().await;
        let client = connected(&self.addr, self.network, &mut guard).await?;
        let result = client.get_headers(locator, stop).await;
        if result.is_err() {
            *guard = None;
        }
        result
    }

    pub async fn get_block(&self, hash: &Hash256) -> Result<Block, NodeError> {
        let mut guard = self.client.lock().await;
        let client = connected(&self.addr, self.network, &mut guard).await?;
        let result = client.get_block(hash).await;
        if result.is_err() {
            *guard = None;
        }
        result
    }

    pub async fn broadcast_witness_tx(&self, raw: &[u8]) -> Result<(), NodeError> {
        let mut guard = self.client.lock().await;
        let client = connected(&self.addr, self.network, &mut guard).await?;
        let result = client.broadcast_witness_tx(raw).await;
        if result.is_err() {
            *guard = None;
        }
        result
    }

    pub async fn disconnect(&self) {
        *self.client.lock().await = None;
    }
}

async fn connected<'a>(
    addr: &str,
    network: Network,
    guard: &'a mut Option<NodeClient>,
) -> Result<&'a mut NodeClient, NodeError> {
    if guard.is_none() {
        log_info!("connecting to node at {addr}");
        *guard = Some(NodeClient::connect(addr, network).await?);
    }
    guard.as_mut().ok_or(NodeError::Closed)
}
