//! Tracked-transaction and script-link queries.

use rusqlite::{params, Connection, OptionalExtension};

use faro_primitives::Hash256;

use crate::{hash_from_blob, HistoryEntry, StoreError, TxRecord, UnspentEntry};

/// Inserts a transaction record once; replaying the same insert is a no-op.
pub fn insert_transaction(
    conn: &Connection,
    txid: &Hash256,
    blockhash: &Hash256,
    pos: i64,
    serialized: &[u8],
    merkle_proof: &[u8],
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO tx (txid, blockhash, pos, serialized, merkle_proof)
         SELECT ?1, ?2, ?3, ?4, ?5
         WHERE NOT EXISTS (SELECT 1 FROM tx WHERE txid = ?1)",
        params![
            txid.as_slice(),
            blockhash.as_slice(),
            pos,
            serialized,
            merkle_proof
        ],
    )?;
    Ok(())
}

pub fn raw_transaction(conn: &Connection, txid: &Hash256) -> Result<Option<Vec<u8>>, StoreError> {
    let row = conn
        .query_row(
            "SELECT serialized FROM tx WHERE txid = ?1",
            [txid.as_slice()],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?;
    Ok(row)
}

pub fn transaction_by_txid(
    conn: &Connection,
    txid: &Hash256,
) -> Result<Option<TxRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT blockhash, pos, serialized, merkle_proof FROM tx WHERE txid = ?1",
            [txid.as_slice()],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some((blockhash, pos, serialized, merkle_proof)) => Ok(Some(TxRecord {
            txid: *txid,
            blockhash: hash_from_blob(&blockhash)?,
            pos,
            serialized,
            merkle_proof,
        })),
        None => Ok(None),
    }
}

pub fn transaction_at(
    conn: &Connection,
    height: i64,
    pos: i64,
) -> Result<Option<TxRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT tx.txid, tx.blockhash, tx.pos, tx.serialized, tx.merkle_proof
             FROM tx
             JOIN blockheader bh ON bh.hash = tx.blockhash
             WHERE bh.height = ?1 AND tx.pos = ?2",
            params![height, pos],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some((txid, blockhash, pos, serialized, merkle_proof)) => Ok(Some(TxRecord {
            txid: hash_from_blob(&txid)?,
            blockhash: hash_from_blob(&blockhash)?,
            pos,
            serialized,
            merkle_proof,
        })),
        None => Ok(None),
    }
}

/// Records that `txid` touches `script_hash`; set semantics.
pub fn insert_script_tx(
    conn: &Connection,
    script_hash: &Hash256,
    txid: &Hash256,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO scriptpubkey_tx (scriptpubkey_hash, txid)
         SELECT ?1, ?2
         WHERE NOT EXISTS (
             SELECT 1 FROM scriptpubkey_tx
             WHERE scriptpubkey_hash = ?1 AND txid = ?2
         )",
        params![script_hash.as_slice(), txid.as_slice()],
    )?;
    Ok(())
}

pub fn script_history(
    conn: &Connection,
    script_hash: &Hash256,
) -> Result<Vec<HistoryEntry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT bh.height, stx.txid
         FROM scriptpubkey_tx stx
         JOIN tx ON tx.txid = stx.txid
         JOIN blockheader bh ON bh.hash = tx.blockhash
         WHERE stx.scriptpubkey_hash = ?1
         ORDER BY bh.height ASC, tx.pos ASC",
    )?;
    let mut rows = stmt.query([script_hash.as_slice()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let height: i64 = row.get(0)?;
        let txid: Vec<u8> = row.get(1)?;
        out.push(HistoryEntry {
            height,
            txid: hash_from_blob(&txid)?,
        });
    }
    Ok(out)
}

/// Script hashes with at least one linked transaction above `height`. Used
/// to refresh subscriber status after a reorg rollback.
pub fn scripts_above(conn: &Connection, height: i64) -> Result<Vec<Hash256>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT stx.scriptpubkey_hash
         FROM scriptpubkey_tx stx
         JOIN tx ON tx.txid = stx.txid
         JOIN blockheader bh ON bh.hash = tx.blockhash
         WHERE bh.height > ?1",
    )?;
    let mut rows = stmt.query([height])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let script_hash: Vec<u8> = row.get(0)?;
        out.push(hash_from_blob(&script_hash)?);
    }
    Ok(out)
}

pub fn script_unspent(
    conn: &Connection,
    script_hash: &Hash256,
) -> Result<Vec<UnspentEntry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT bh.height, tx.pos, tx.txid, uo.satoshi
         FROM unspent_output uo
         JOIN tx ON tx.txid = SUBSTR(uo.txid_vout, 1, 32)
         JOIN blockheader bh ON bh.hash = tx.blockhash
         WHERE uo.scriptpubkey_hash = ?1
         ORDER BY bh.height ASC, tx.pos ASC",
    )?;
    let mut rows = stmt.query([script_hash.as_slice()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let height: i64 = row.get(0)?;
        let pos: i64 = row.get(1)?;
        let txid: Vec<u8> = row.get(2)?;
        let satoshi: i64 = row.get(3)?;
        out.push(UnspentEntry {
            height,
            pos,
            txid: hash_from_blob(&txid)?,
            satoshi: satoshi as u64,
        });
    }
    Ok(out)
}
