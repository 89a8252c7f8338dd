//! The persistent index: cached block headers, wallet cursors, tracked
//! transactions with their Merkle proofs, script-to-transaction links, and
//! the UTXO set, all in one embedded SQLite database with a process-local
//! UTXO lookup cache.
//!
//! Single writer. The sync engine owns the [`Index`] and is the only
//! mutator; readers go through the engine's lock.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::Connection;

use faro_primitives::{Hash256, OutPointKey, HEADER_LEN};

// The connection type is part of this crate's API surface: the engine opens
// its per-block transactions on it and hands them to the query functions.
pub use rusqlite::Connection as DbConnection;

pub mod headers;
pub mod txs;
pub mod utxos;
pub mod wallets;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS blockheader(
    hash BLOB PRIMARY KEY,
    height INTEGER NOT NULL UNIQUE,
    serialized BLOB NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS wallet(
    hash BLOB PRIMARY KEY,
    height INTEGER NOT NULL,
    next_receive_index INTEGER NOT NULL,
    next_change_index INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS tx(
    txid BLOB PRIMARY KEY,
    blockhash BLOB NOT NULL,
    pos INTEGER NOT NULL,
    serialized BLOB NOT NULL,
    merkle_proof BLOB NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS scriptpubkey_tx(
    scriptpubkey_hash BLOB NOT NULL,
    txid BLOB NOT NULL,
    UNIQUE(scriptpubkey_hash, txid)
);

CREATE TABLE IF NOT EXISTS unspent_output(
    txid_vout BLOB PRIMARY KEY,
    satoshi INTEGER NOT NULL,
    scriptpubkey_hash BLOB NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS tx_blockhash ON tx(blockhash);
CREATE INDEX IF NOT EXISTS scriptpubkey_tx_hash ON scriptpubkey_tx(scriptpubkey_hash);
CREATE INDEX IF NOT EXISTS unspent_output_script ON unspent_output(scriptpubkey_hash);
";

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Corrupt(&'static str),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(err) => write!(f, "{err}"),
            StoreError::Corrupt(message) => write!(f, "corrupt store: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderRecord {
    pub hash: Hash256,
    pub height: i64,
    pub serialized: [u8; HEADER_LEN],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WalletRecord {
    pub height: i64,
    pub next_receive_index: u32,
    pub next_change_index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRecord {
    pub txid: Hash256,
    pub blockhash: Hash256,
    pub pos: i64,
    pub serialized: Vec<u8>,
    pub merkle_proof: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub height: i64,
    pub txid: Hash256,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnspentEntry {
    pub height: i64,
    pub pos: i64,
    pub txid: Hash256,
    pub satoshi: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachedUtxo {
    pub satoshi: u64,
    pub script_hash: Hash256,
}

/// Process-local mirror of the `unspent_output` table, keyed by the 36-byte
/// outpoint key. Every insert/delete goes through the same call paths that
/// touch the table; reload after any rollback.
#[derive(Default)]
pub struct UtxoCache {
    map: HashMap<OutPointKey, CachedUtxo>,
}

impl UtxoCache {
    pub fn get(&self, key: &OutPointKey) -> Option<CachedUtxo> {
        self.map.get(key).copied()
    }

    pub fn insert(&mut self, key: OutPointKey, entry: CachedUtxo) {
        self.map.insert(key, entry);
    }

    pub fn remove(&mut self, key: &OutPointKey) {
        self.map.remove(key);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn balance(&self, script_hash: &Hash256) -> u64 {
        self.map
            .values()
            .filter(|entry| entry.script_hash == *script_hash)
            .map(|entry| entry.satoshi)
            .sum()
    }

    fn reload(&mut self, conn: &Connection) -> Result<(), StoreError> {
        self.map.clear();
        for (key, entry) in utxos::all_unspent(conn)? {
            self.map.insert(key, entry);
        }
        Ok(())
    }
}

/// The open database plus its UTXO cache.
pub struct Index {
    conn: Connection,
    utxo: UtxoCache,
}

impl Index {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                conn.execute_batch(SCHEMA)?;
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            }
            SCHEMA_VERSION => {}
            _ => return Err(StoreError::Corrupt("unsupported schema version")),
        }
        let mut index = Self {
            conn,
            utxo: UtxoCache::default(),
        };
        index.reload_utxo_cache()?;
        Ok(index)
    }

    /// Split borrow for block application: the caller opens a transaction on
    /// the connection while keeping the cache writable.
    pub fn parts(&mut self) -> (&mut Connection, &mut UtxoCache) {
        (&mut self.conn, &mut self.utxo)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn utxo_cache(&self) -> &UtxoCache {
        &self.utxo
    }

    pub fn reload_utxo_cache(&mut self) -> Result<(), StoreError> {
        self.utxo.reload(&self.conn)
    }

    pub fn script_balance(&self, script_hash: &Hash256) -> u64 {
        self.utxo.balance(script_hash)
    }

    /// Deletes every row above `height` (script links, unspent outputs,
    /// transactions, headers, in that order), clamps wallet cursors, then
    /// rebuilds the UTXO cache.
    pub fn rollback_to(&mut self, height: i64) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM scriptpubkey_tx
             WHERE txid IN (
                 SELECT tx.txid FROM tx
                 JOIN blockheader bh ON bh.hash = tx.blockhash
                 WHERE bh.height > ?1
             )",
            [height],
        )?;
        tx.execute(
            "DELETE FROM unspent_output
             WHERE SUBSTR(txid_vout, 1, 32) IN (
                 SELECT tx.txid FROM tx
                 JOIN blockheader bh ON bh.hash = tx.blockhash
                 WHERE bh.height > ?1
             )",
            [height],
        )?;
        tx.execute(
            "DELETE FROM tx
             WHERE blockhash IN (
                 SELECT hash FROM blockheader WHERE height > ?1
             )",
            [height],
        )?;
        tx.execute("DELETE FROM blockheader WHERE height > ?1", [height])?;
        tx.execute(
            "UPDATE wallet SET height = ?1 WHERE height > ?1",
            [height],
        )?;
        tx.commit()?;
        self.reload_utxo_cache()
    }
}

pub(crate) fn hash_from_blob(blob: &[u8]) -> Result<Hash256, StoreError> {
    let mut out = [0u8; 32];
    if blob.len() != out.len() {
        return Err(StoreError::Corrupt("hash column has wrong length"));
    }
    out.copy_from_slice(blob);
    Ok(out)
}

pub(crate) fn header_from_blob(blob: &[u8]) -> Result<[u8; HEADER_LEN], StoreError> {
    let mut out = [0u8; HEADER_LEN];
    if blob.len() != out.len() {
        return Err(StoreError::Corrupt("header column has wrong length"));
    }
    out.copy_from_slice(blob);
    Ok(out)
}
