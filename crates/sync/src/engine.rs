//! The sync engine: chain cursor, header sync with reorg recovery, block
//! application, and the read API served to the Electrum layer.
//!
//! One `tokio` mutex guards all engine state: wallet cursors, the script
//! lookup map, the store connection and UTXO cache, and the subscription
//! tables. The engine task is the only writer; it holds the lock across the
//! whole application of one block and releases it between blocks. Durable
//! state moves only inside one store transaction per block.

use std::collections::{HashMap, HashSet};

use tokio::sync::{watch, Mutex};
use tokio::time::Duration;

use faro_log::{log_debug, log_info, log_warn};
use faro_primitives::{
    merkle_branch, sha256, Block, Hash256, Network, OutPointKey, Transaction, HEADER_LEN,
};
use faro_store::{
    headers, txs, utxos, wallets, CachedUtxo, DbConnection, HistoryEntry, Index, StoreError,
    UnspentEntry, WalletRecord,
};

use crate::source::ChainSource;
use crate::status::status_hash;
use crate::subs::{ConnectionId, Notification, SubscriptionHub};
use crate::wallet::{wallet_hash, ScriptInfo, WalletConfig, WalletState};
use crate::SyncError;

/// Reorgs deeper than this are refused and treated as fatal.
const MAX_REORG_DEPTH: i64 = 6;

const ZERO_HASH: Hash256 = [0u8; 32];

pub struct EngineConfig {
    pub network: Network,
    pub wallets: Vec<WalletConfig>,
    pub poll_interval: Duration,
}

impl EngineConfig {
    pub fn new(network: Network, wallets: Vec<WalletConfig>) -> Self {
        Self {
            network,
            wallets,
            poll_interval: Duration::from_secs(30),
        }
    }
}

struct State {
    index: Index,
    wallets: Vec<WalletState>,
    scripts: HashMap<Hash256, ScriptInfo>,
    subs: SubscriptionHub,
    best_height: i64,
    best_hash: Hash256,
}

pub struct Engine<S> {
    source: S,
    network: Network,
    poll_interval: Duration,
    state: Mutex<State>,
    init_tx: watch::Sender<bool>,
    init_rx: watch::Receiver<bool>,
}

impl<S: ChainSource> Engine<S> {
    /// Sets up every configured wallet (creating its store row on first
    /// sight), preloads both branches of each to the gap limit, and loads
    /// the chain cursor from the store.
    pub fn new(config: EngineConfig, index: Index, source: S) -> Result<Self, SyncError> {
        let mut wallet_states = Vec::with_capacity(config.wallets.len());
        let mut scripts = HashMap::new();
        for (i, wallet_config) in config.wallets.iter().enumerate() {
            let hash = wallet_hash(wallet_config)?;
            let record = match wallets::wallet_by_hash(index.conn(), &hash)? {
                Some(record) => record,
                None => {
                    wallets::insert_wallet(index.conn(), &hash, wallet_config.birth_height)?;
                    WalletRecord {
                        height: wallet_config.birth_height,
                        next_receive_index: 0,
                        next_change_index: 0,
                    }
                }
            };
            let mut wallet = WalletState::new(wallet_config, hash, &record)?;
            wallet.refill(i, &mut scripts)?;
            wallet_states.push(wallet);
        }

        let (best_height, best_hash) = match headers::last_header(index.conn())? {
            Some(record) => (record.height, record.hash),
            None => (0, config.network.genesis_hash()),
        };
        log_info!(
            "engine starting at height {best_height} tracking {} scripts",
            scripts.len()
        );

        let (init_tx, init_rx) = watch::channel(false);
        Ok(Self {
            source,
            network: config.network,
            poll_interval: config.poll_interval,
            state: Mutex::new(State {
                index,
                wallets: wallet_states,
                scripts,
                subs: SubscriptionHub::default(),
                best_height,
                best_hash,
            }),
            init_tx,
            init_rx,
        })
    }

    /// Blocks until the first successful sync pass has completed.
    pub async fn wait_init(&self) {
        let mut rx = self.init_rx.clone();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Runs sync passes until `shutdown` flips to true. Non-fatal errors are
    /// logged and retried on the next tick; fatal ones end the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SyncError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match self.sync_once().await {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => log_warn!("sync tick failed: {err}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    // a dropped shutdown handle means the process is tearing down
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One full pass: pull headers (repairing a reorg if one is detected),
    /// then apply blocks up to the tip. The first success unblocks
    /// [`Engine::wait_init`].
    pub async fn sync_once(&self) -> Result<(), SyncError> {
        {
            let mut state = self.state.lock().await;
            self.sync_headers(&mut state).await?;
            self.sync_wallets(&mut state).await?;
        }
        self.init_tx.send_replace(true);
        Ok(())
    }

    async fn sync_headers(&self, state: &mut State) -> Result<(), SyncError> {
        'peer: loop {
            let locator = [state.best_hash];
            let headers = self.source.get_headers(&locator, &ZERO_HASH).await?;
            if headers.is_empty() {
                return Ok(());
            }
            log_debug!(
                "new headers: {} past height {}",
                headers.len(),
                state.best_height
            );
            for header in &headers {
                if header.prev_block != state.best_hash {
                    let ancestor = self.find_reorg_ancestor(state).await?;
                    self.rollback_to_ancestor(state, ancestor).await?;
                    continue 'peer;
                }
                let raw = header.consensus_encode();
                let hash = header.hash();
                let height = state.best_height + 1;
                headers::insert_header(state.index.conn(), &hash, height, &raw)?;
                state.best_height = height;
                state.best_hash = hash;
                state.subs.notify_header(height, raw).await;
            }
        }
    }

    /// Walks back from the best header probing the peer for the last height
    /// both chains share, bounded by [`MAX_REORG_DEPTH`].
    async fn find_reorg_ancestor(&self, state: &mut State) -> Result<i64, SyncError> {
        if state.best_height == 0 {
            // nothing of ours to disconnect: the peer serves another genesis
            return Err(SyncError::ChainMismatch);
        }
        let mut height = state.best_height;
        loop {
            let depth = state.best_height - (height - 1);
            if depth > MAX_REORG_DEPTH {
                return Err(SyncError::ReorgTooDeep { depth });
            }
            let anchor = self.hash_at(state, height - 1)?;
            let headers = self.source.get_headers(&[anchor], &ZERO_HASH).await?;
            if headers.is_empty() || headers[0].prev_block == anchor {
                return Ok(height - 1);
            }
            height -= 1;
        }
    }

    async fn rollback_to_ancestor(
        &self,
        state: &mut State,
        ancestor: i64,
    ) -> Result<(), SyncError> {
        log_warn!("processing reorg rollback to height {ancestor}");
        let stale_scripts = txs::scripts_above(state.index.conn(), ancestor)?;
        state.index.rollback_to(ancestor)?;
        for wallet in &mut state.wallets {
            wallet.height = wallet.height.min(ancestor);
        }
        state.best_height = ancestor;
        state.best_hash = self.hash_at(state, ancestor)?;
        for script_hash in stale_scripts {
            let history = txs::script_history(state.index.conn(), &script_hash)?;
            let status = status_hash(&history);
            state.subs.notify_script(&script_hash, status).await;
        }
        log_warn!("reorg processed");
        Ok(())
    }

    fn hash_at(&self, state: &State, height: i64) -> Result<Hash256, SyncError> {
        if height == 0 {
            return Ok(self.network.genesis_hash());
        }
        headers::hash_at(state.index.conn(), height)?.ok_or(SyncError::MissingHeader(height))
    }

    async fn sync_wallets(&self, state: &mut State) -> Result<(), SyncError> {
        let Some(min_height) = state.wallets.iter().map(|wallet| wallet.height).min() else {
            return Ok(());
        };
        let mut height = min_height.min(state.best_height);
        while height < state.best_height {
            let next = height + 1;
            let hash = self.hash_at(state, next)?;
            let block = self.source.get_block(&hash).await?;
            if let Err(err) = self.apply_block(state, &block, next, &hash).await {
                // the store transaction rolled back; resync the cache so the
                // retry on the next tick observes stored state
                state.index.reload_utxo_cache()?;
                return Err(err);
            }
            height = next;
        }
        Ok(())
    }

    /// Applies one block inside one store transaction. Outputs are walked
    /// before inputs of the same transaction; status notifications for dirty
    /// scripts go out only after the commit.
    async fn apply_block(
        &self,
        state: &mut State,
        block: &Block,
        height: i64,
        blockhash: &Hash256,
    ) -> Result<(), SyncError> {
        log_debug!("processing block {height}");
        let txids = block.txids();
        let mut dirty: HashSet<Hash256> = HashSet::new();

        let State {
            index,
            wallets: wallet_states,
            scripts,
            subs,
            ..
        } = state;

        let notifications = {
            let (conn, cache) = index.parts();
            let db = conn.transaction().map_err(StoreError::from)?;

            for (pos, tx) in block.transactions.iter().enumerate() {
                let txid = txids[pos];
                for (vout, output) in tx.outputs.iter().enumerate() {
                    let script_hash = sha256(&output.script_pubkey);
                    let Some(info) = scripts.get(&script_hash).copied() else {
                        continue;
                    };
                    log_debug!(
                        "add output; height {height}; outpoint {}:{vout}; sat {}",
                        hex::encode(display_order(&txid)),
                        output.value
                    );
                    record_transaction(&db, &txids, pos, tx, blockhash)?;
                    txs::insert_script_tx(&db, &script_hash, &txid)?;
                    let key = OutPointKey::new(&txid, vout as u32);
                    utxos::insert_unspent(&db, &key, output.value, &script_hash)?;
                    cache.insert(
                        key,
                        CachedUtxo {
                            satoshi: output.value,
                            script_hash,
                        },
                    );
                    let wallet = &mut wallet_states[info.wallet_index];
                    if wallet.advance(info.branch, info.child_index) {
                        wallets::update_wallet_indexes(
                            &db,
                            &wallet.hash,
                            wallet.next_receive_index,
                            wallet.next_change_index,
                        )?;
                        wallet.refill(info.wallet_index, scripts)?;
                    }
                    dirty.insert(script_hash);
                }
                for input in &tx.inputs {
                    let key = input.prevout.key();
                    let Some(entry) = cache.get(&key) else {
                        continue;
                    };
                    log_debug!(
                        "spent output; height {height}; outpoint {}:{}; sat {}",
                        hex::encode(display_order(&input.prevout.txid)),
                        input.prevout.vout,
                        entry.satoshi
                    );
                    record_transaction(&db, &txids, pos, tx, blockhash)?;
                    txs::insert_script_tx(&db, &entry.script_hash, &txid)?;
                    utxos::delete_unspent(&db, &key)?;
                    cache.remove(&key);
                    dirty.insert(entry.script_hash);
                }
            }

            for wallet in wallet_states.iter_mut() {
                if wallet.height < height {
                    wallets::update_wallet_height(&db, &wallet.hash, height)?;
                    wallet.height = height;
                }
            }

            let mut notifications = Vec::with_capacity(dirty.len());
            for script_hash in dirty {
                let history = txs::script_history(&db, &script_hash)?;
                notifications.push((script_hash, status_hash(&history)));
            }
            db.commit().map_err(StoreError::from)?;
            notifications
        };

        for (script_hash, status) in notifications {
            subs.notify_script(&script_hash, status).await;
        }
        Ok(())
    }

    // ---- read API -------------------------------------------------------

    pub async fn get_header(&self, height: i64) -> Result<[u8; HEADER_LEN], SyncError> {
        self.wait_init().await;
        if height == 0 {
            return Ok(self.network.genesis_header().consensus_encode());
        }
        let state = self.state.lock().await;
        headers::header_by_height(state.index.conn(), height)?.ok_or(SyncError::NotFound)
    }

    /// Up to `count` raw headers from `height`; a request starting at 0 has
    /// the synthesised genesis header prepended.
    pub async fn get_headers(
        &self,
        height: i64,
        count: usize,
    ) -> Result<Vec<[u8; HEADER_LEN]>, SyncError> {
        self.wait_init().await;
        let state = self.state.lock().await;
        let mut result = headers::headers_from(state.index.conn(), height, count)?;
        if height == 0 {
            result.insert(0, self.network.genesis_header().consensus_encode());
            result.truncate(count);
        }
        Ok(result)
    }

    pub async fn tip_header(&self) -> Result<(i64, [u8; HEADER_LEN]), SyncError> {
        self.wait_init().await;
        let state = self.state.lock().await;
        match headers::last_header(state.index.conn())? {
            Some(record) => Ok((record.height, record.serialized)),
            None => Ok((0, self.network.genesis_header().consensus_encode())),
        }
    }

    /// Confirmed and unconfirmed balance. The engine tracks no mempool, so
    /// the unconfirmed side is always zero.
    pub async fn script_balance(&self, script_hash: &Hash256) -> Result<(u64, u64), SyncError> {
        self.wait_init().await;
        let state = self.state.lock().await;
        if !state.scripts.contains_key(script_hash) {
            return Ok((0, 0));
        }
        Ok((state.index.script_balance(script_hash), 0))
    }

    pub async fn script_history(
        &self,
        script_hash: &Hash256,
    ) -> Result<Vec<HistoryEntry>, SyncError> {
        self.wait_init().await;
        let state = self.state.lock().await;
        Ok(txs::script_history(state.index.conn(), script_hash)?)
    }

    pub async fn script_unspent(
        &self,
        script_hash: &Hash256,
    ) -> Result<Vec<UnspentEntry>, SyncError> {
        self.wait_init().await;
        let state = self.state.lock().await;
        Ok(txs::script_unspent(state.index.conn(), script_hash)?)
    }

    pub async fn script_status(&self, script_hash: &Hash256) -> Result<Option<Hash256>, SyncError> {
        self.wait_init().await;
        let state = self.state.lock().await;
        let history = txs::script_history(state.index.conn(), script_hash)?;
        Ok(status_hash(&history))
    }

    pub async fn raw_tx(&self, txid: &Hash256) -> Result<Vec<u8>, SyncError> {
        self.wait_init().await;
        let state = self.state.lock().await;
        txs::raw_transaction(state.index.conn(), txid)?.ok_or(SyncError::NotFound)
    }

    /// Block position and Merkle branch of a tracked transaction.
    pub async fn tx_merkle(&self, txid: &Hash256) -> Result<(i64, Vec<Hash256>), SyncError> {
        self.wait_init().await;
        let state = self.state.lock().await;
        let record =
            txs::transaction_by_txid(state.index.conn(), txid)?.ok_or(SyncError::NotFound)?;
        Ok((record.pos, split_proof(&record.merkle_proof)?))
    }

    /// Txid and Merkle branch of the tracked transaction at `(height, pos)`.
    pub async fn tx_merkle_at(
        &self,
        height: i64,
        pos: i64,
    ) -> Result<(Hash256, Vec<Hash256>), SyncError> {
        self.wait_init().await;
        let state = self.state.lock().await;
        let record =
            txs::transaction_at(state.index.conn(), height, pos)?.ok_or(SyncError::NotFound)?;
        Ok((record.txid, split_proof(&record.merkle_proof)?))
    }

    /// Hands the raw transaction to the node and returns its txid.
    pub async fn broadcast(&self, raw: &[u8]) -> Result<Hash256, SyncError> {
        self.wait_init().await;
        let _state = self.state.lock().await;
        let tx = Transaction::consensus_decode(raw)?;
        self.source.broadcast_witness_tx(raw).await?;
        Ok(tx.txid())
    }

    pub async fn subscribe_headers(
        &self,
        id: ConnectionId,
        sender: tokio::sync::mpsc::Sender<Notification>,
    ) {
        self.wait_init().await;
        let mut state = self.state.lock().await;
        state.subs.subscribe_headers(id, sender);
    }

    pub async fn subscribe_script(
        &self,
        id: ConnectionId,
        script_hash: Hash256,
        sender: tokio::sync::mpsc::Sender<Notification>,
    ) {
        self.wait_init().await;
        let mut state = self.state.lock().await;
        state.subs.subscribe_script(id, script_hash, sender);
    }

    pub async fn unsubscribe_all(&self, id: ConnectionId) {
        let mut state = self.state.lock().await;
        state.subs.unsubscribe_all(id);
    }
}

/// Stores the transaction record with its Merkle branch; a replay of the
/// same insert is a no-op.
fn record_transaction(
    db: &DbConnection,
    txids: &[Hash256],
    pos: usize,
    tx: &Transaction,
    blockhash: &Hash256,
) -> Result<(), SyncError> {
    let branch = merkle_branch(txids, pos).ok_or(SyncError::NotFound)?;
    let mut proof = Vec::with_capacity(branch.len() * 32);
    for sibling in &branch {
        proof.extend_from_slice(sibling);
    }
    let raw = tx.consensus_encode();
    txs::insert_transaction(db, &txids[pos], blockhash, pos as i64, &raw, &proof)?;
    Ok(())
}

fn split_proof(proof: &[u8]) -> Result<Vec<Hash256>, SyncError> {
    if proof.len() % 32 != 0 {
        return Err(SyncError::Store(StoreError::Corrupt(
            "merkle proof length not a multiple of 32",
        )));
    }
    let mut out = Vec::with_capacity(proof.len() / 32);
    for chunk in proof.chunks_exact(32) {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(chunk);
        out.push(hash);
    }
    Ok(out)
}

fn display_order(hash: &Hash256) -> Hash256 {
    let mut out = *hash;
    out.reverse();
    out
}
