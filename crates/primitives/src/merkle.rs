//! Double-SHA-256 merkle trees over transaction ids.

use bitcoind_consensus::Hash256;

use crate::hash::sha256d;

/// Compute the merkle root of a list of hashes, duplicating the last
/// element on odd levels.
///
/// The boolean result reports the duplicate-subtree mutation of
/// CVE-2012-2459: a block whose transaction list repeats a trailing
/// subtree produces the same root as the honest block, so any level with
/// two identical paired nodes marks the root as mutated and the block
/// must be rejected rather than cached as invalid.
pub fn compute_merkle_root(hashes: &[Hash256]) -> (Hash256, bool) {
    if hashes.is_empty() {
        return ([0u8; 32], false);
    }
    let mut mutated = false;
    let mut layer = hashes.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len() / 2 + 1);
        let mut i = 0;
        while i < layer.len() {
            let left = layer[i];
            let right = if i + 1 < layer.len() {
                if layer[i + 1] == left {
                    mutated = true;
                }
                layer[i + 1]
            } else {
                left
            };
            next.push(hash_pair(&left, &right));
            i += 2;
        }
        layer = next;
    }
    (layer[0], mutated)
}

pub fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[0..32].copy_from_slice(left);
    buf[32..64].copy_from_slice(right);
    sha256d(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_hash_is_its_own_root() {
        let hash = [0x42u8; 32];
        assert_eq!(compute_merkle_root(&[hash]), (hash, false));
    }

    #[test]
    fn odd_level_duplicates_last() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let (root, mutated) = compute_merkle_root(&[a, b, c]);
        assert!(!mutated);
        let expected = hash_pair(&hash_pair(&a, &b), &hash_pair(&c, &c));
        assert_eq!(root, expected);
    }

    #[test]
    fn duplicated_trailing_pair_is_flagged_mutated() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let (honest, _) = compute_merkle_root(&[a, b, c]);
        let (forged, mutated) = compute_merkle_root(&[a, b, c, c]);
        assert_eq!(honest, forged);
        assert!(mutated);
    }
}
