//! HMAC-SHA512 (RFC 2104 over SHA-512).

use sha2::{Digest, Sha512};

const BLOCK_SIZE: usize = 128;
const OUTPUT_SIZE: usize = 64;

pub fn hmac_sha512(key: &[u8], msg: &[u8]) -> [u8; OUTPUT_SIZE] {
    let mut key_block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        let hashed = Sha512::digest(key);
        key_block[..OUTPUT_SIZE].copy_from_slice(&hashed);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner_pad = [0u8; BLOCK_SIZE];
    let mut outer_pad = [0u8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        inner_pad[i] = key_block[i] ^ 0x36;
        outer_pad[i] = key_block[i] ^ 0x5c;
    }

    let mut hasher = Sha512::new();
    hasher.update(inner_pad);
    hasher.update(msg);
    let inner = hasher.finalize();

    let mut hasher = Sha512::new();
    hasher.update(outer_pad);
    hasher.update(inner);
    let digest = hasher.finalize();

    let mut out = [0u8; OUTPUT_SIZE];
    out.copy_from_slice(&digest);
    out
}
