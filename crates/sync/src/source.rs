//! The seam between the engine and the node, so tests can drive the engine
//! from a scripted chain.

use async_trait::async_trait;

use faro_node::{NodeError, PersistentNode};
use faro_primitives::{Block, BlockHeader, Hash256};

#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Headers following the first locator hash the peer knows, in chain
    /// order; empty when the locator is already the tip.
    async fn get_headers(
        &self,
        locator: &[Hash256],
        stop: &Hash256,
    ) -> Result<Vec<BlockHeader>, NodeError>;

    async fn get_block(&self, hash: &Hash256) -> Result<Block, NodeError>;

    async fn broadcast_witness_tx(&self, raw: &[u8]) -> Result<(), NodeError>;
}

#[async_trait]
impl<S: ChainSource> ChainSource for std::sync::Arc<S> {
    async fn get_headers(
        &self,
        locator: &[Hash256],
        stop: &Hash256,
    ) -> Result<Vec<BlockHeader>, NodeError> {
        self.as_ref().get_headers(locator, stop).await
    }

    async fn get_block(&self, hash: &Hash256) -> Result<Block, NodeError> {
        self.as_ref().get_block(hash).await
    }

    async fn broadcast_witness_tx(&self, raw: &[u8]) -> Result<(), NodeError> {
        self.as_ref().broadcast_witness_tx(raw).await
    }
}

#[async_trait]
impl ChainSource for PersistentNode {
    async fn get_headers(
        &self,
        locator: &[Hash256],
        stop: &Hash256,
    ) -> Result<Vec<BlockHeader>, NodeError> {
        PersistentNode::get_headers(self, locator, stop).await
    }

    async fn get_block(&self, hash: &Hash256) -> Result<Block, NodeError> {
        PersistentNode::get_block(self, hash).await
    }

    async fn broadcast_witness_tx(&self, raw: &[u8]) -> Result<(), NodeError> {
        PersistentNode::broadcast_witness_tx(self, raw).await
    }
}
