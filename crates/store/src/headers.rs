//! Block header queries.

use rusqlite::{params, Connection, OptionalExtension};

use faro_primitives::{Hash256, HEADER_LEN};

use crate::{hash_from_blob, header_from_blob, HeaderRecord, StoreError};

pub fn insert_header(
    conn: &Connection,
    hash: &Hash256,
    height: i64,
    serialized: &[u8; HEADER_LEN],
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO blockheader (hash, height, serialized) VALUES (?1, ?2, ?3)",
        params![hash.as_slice(), height, serialized.as_slice()],
    )?;
    Ok(())
}

pub fn last_header(conn: &Connection) -> Result<Option<HeaderRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT hash, height, serialized FROM blockheader
             ORDER BY height DESC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some((hash, height, serialized)) => Ok(Some(HeaderRecord {
            hash: hash_from_blob(&hash)?,
            height,
            serialized: header_from_blob(&serialized)?,
        })),
        None => Ok(None),
    }
}

pub fn header_by_height(
    conn: &Connection,
    height: i64,
) -> Result<Option<[u8; HEADER_LEN]>, StoreError> {
    let row = conn
        .query_row(
            "SELECT serialized FROM blockheader WHERE height = ?1",
            [height],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?;
    match row {
        Some(serialized) => Ok(Some(header_from_blob(&serialized)?)),
        None => Ok(None),
    }
}

pub fn headers_from(
    conn: &Connection,
    height: i64,
    limit: usize,
) -> Result<Vec<[u8; HEADER_LEN]>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT serialized FROM blockheader
         WHERE height >= ?1 ORDER BY height ASC LIMIT ?2",
    )?;
    let mut rows = stmt.query(params![height, limit as i64])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let serialized: Vec<u8> = row.get(0)?;
        out.push(header_from_blob(&serialized)?);
    }
    Ok(out)
}

/// Hashes of stored headers from `height` upward, in ascending order.
pub fn hashes_from(
    conn: &Connection,
    height: i64,
    limit: usize,
) -> Result<Vec<Hash256>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT hash FROM blockheader
         WHERE height >= ?1 ORDER BY height ASC LIMIT ?2",
    )?;
    let mut rows = stmt.query(params![height, limit as i64])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let hash: Vec<u8> = row.get(0)?;
        out.push(hash_from_blob(&hash)?);
    }
    Ok(out)
}

pub fn hash_at(conn: &Connection, height: i64) -> Result<Option<Hash256>, StoreError> {
    let row = conn
        .query_row(
            "SELECT hash FROM blockheader WHERE height = ?1",
            [height],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?;
    match row {
        Some(hash) => Ok(Some(hash_from_blob(&hash)?)),
        None => Ok(None),
    }
}
