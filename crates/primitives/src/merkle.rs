use powd_consensus::Hash256;

use crate::hash::sha256d_pair;

/// Merkle root over `txids`, plus whether a duplicated terminal pair was seen
/// (two trees with the same root but different transaction lists).
pub fn merkle_root(txids: &[Hash256]) -> (Hash256, bool) {
    if txids.is_empty() {
        return ([0u8; 32], false);
    }
    let mut level = txids.to_vec();
    let mut mutated = false;
    while level.len() > 1 {
        let last = level.len() - 1;
        if level.len() % 2 == 0 && level[last] == level[last - 1] {
            mutated = true;
        }
        level = level
            .chunks(2)
            .map(|pair| sha256d_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    (level[0], mutated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_leaf_is_root() {
        let leaf = [3u8; 32];
        assert_eq!(merkle_root(&[leaf]), (leaf, false));
    }

    #[test]
    fn odd_leaf_is_paired_with_itself() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let (odd, mutated) = merkle_root(&[a, b, c]);
        let (padded, padded_mutated) = merkle_root(&[a, b, c, c]);
        assert_eq!(odd, padded);
        assert!(!mutated);
        assert!(padded_mutated);
    }

    #[test]
    fn order_matters() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_ne!(merkle_root(&[a, b]).0, merkle_root(&[b, a]).0);
    }
}
