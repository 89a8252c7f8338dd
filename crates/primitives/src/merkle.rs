//! Merkle roots and per-leaf sibling branches.
//!
//! A branch is the ordered list of sibling hashes from the leaf level up to
//! the root. Verification folds the leaf with each sibling, left-then-right
//! when the running position is even, right-then-left otherwise, halving the
//! position at every level.

use crate::hash::sha256d;
use crate::Hash256;

fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256d(&buf)
}

fn hash_level(level: &[Hash256]) -> Vec<Hash256> {
    debug_assert!(level.len() % 2 == 0);
    level
        .chunks_exact(2)
        .map(|pair| hash_pair(&pair[0], &pair[1]))
        .collect()
}

pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return [0u8; 32];
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 != 0 {
            level.push(*level.last().expect("non-empty level"));
        }
        level = hash_level(&level);
    }
    level[0]
}

/// Sibling branch for the leaf at `pos`. Returns `None` when `pos` is out of
/// range; a single-leaf tree has an empty branch.
pub fn merkle_branch(leaves: &[Hash256], pos: usize) -> Option<Vec<Hash256>> {
    if pos >= leaves.len() {
        return None;
    }
    let mut level = leaves.to_vec();
    let mut pos = pos;
    let mut branch = Vec::new();
    while level.len() > 1 {
        if level.len() % 2 != 0 {
            level.push(*level.last().expect("non-empty level"));
        }
        branch.push(level[pos ^ 1]);
        level = hash_level(&level);
        pos /= 2;
    }
    Some(branch)
}

pub fn verify_merkle_branch(
    leaf: &Hash256,
    pos: usize,
    branch: &[Hash256],
    root: &Hash256,
) -> bool {
    let mut current = *leaf;
    let mut pos = pos;
    for sibling in branch {
        current = if pos % 2 == 0 {
            hash_pair(&current, sibling)
        } else {
            hash_pair(sibling, &current)
        };
        pos /= 2;
    }
    current == *root
}
