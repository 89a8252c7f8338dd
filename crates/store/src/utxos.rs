//! Unspent-output queries. Callers keep the [`crate::UtxoCache`] coherent by
//! pairing every table write with the matching cache update.

use rusqlite::{params, Connection};

use faro_primitives::{Hash256, OutPointKey};

use crate::{hash_from_blob, CachedUtxo, StoreError};

/// Inserts an unspent output once; replaying the same insert is a no-op.
pub fn insert_unspent(
    conn: &Connection,
    key: &OutPointKey,
    satoshi: u64,
    script_hash: &Hash256,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO unspent_output (txid_vout, satoshi, scriptpubkey_hash)
         SELECT ?1, ?2, ?3
         WHERE NOT EXISTS (
             SELECT 1 FROM unspent_output WHERE txid_vout = ?1
         )",
        params![key.as_bytes(), satoshi as i64, script_hash.as_slice()],
    )?;
    Ok(())
}

pub fn delete_unspent(conn: &Connection, key: &OutPointKey) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM unspent_output WHERE txid_vout = ?1",
        [key.as_bytes()],
    )?;
    Ok(())
}

pub fn all_unspent(conn: &Connection) -> Result<Vec<(OutPointKey, CachedUtxo)>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT txid_vout, satoshi, scriptpubkey_hash FROM unspent_output")?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let key: Vec<u8> = row.get(0)?;
        let satoshi: i64 = row.get(1)?;
        let script_hash: Vec<u8> = row.get(2)?;
        let key =
            OutPointKey::from_slice(&key).ok_or(StoreError::Corrupt("bad outpoint key length"))?;
        out.push((
            key,
            CachedUtxo {
                satoshi: satoshi as u64,
                script_hash: hash_from_blob(&script_hash)?,
            },
        ));
    }
    Ok(out)
}
