//! Wallet cursor queries.

use rusqlite::{params, Connection, OptionalExtension};

use faro_primitives::Hash256;

use crate::{StoreError, WalletRecord};

pub fn wallet_by_hash(
    conn: &Connection,
    hash: &Hash256,
) -> Result<Option<WalletRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT height, next_receive_index, next_change_index
             FROM wallet WHERE hash = ?1",
            [hash.as_slice()],
            |row| {
                Ok(WalletRecord {
                    height: row.get(0)?,
                    next_receive_index: row.get(1)?,
                    next_change_index: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn insert_wallet(conn: &Connection, hash: &Hash256, height: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO wallet (hash, height, next_receive_index, next_change_index)
         VALUES (?1, ?2, 0, 0)",
        params![hash.as_slice(), height],
    )?;
    Ok(())
}

pub fn update_wallet_indexes(
    conn: &Connection,
    hash: &Hash256,
    next_receive_index: u32,
    next_change_index: u32,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE wallet SET next_receive_index = ?2, next_change_index = ?3 WHERE hash = ?1",
        params![hash.as_slice(), next_receive_index, next_change_index],
    )?;
    Ok(())
}

pub fn update_wallet_height(
    conn: &Connection,
    hash: &Hash256,
    height: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE wallet SET height = ?2 WHERE hash = ?1",
        params![hash.as_slice(), height],
    )?;
    Ok(())
}
