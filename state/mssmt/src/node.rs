use std::sync::OnceLock;

use sha2::{Digest, Sha256};

/// Number of tree levels below the root; keys are traversed MSB first.
pub const TREE_HEIGHT: usize = 256;

pub type NodeHash = [u8; 32];

const LEAF_TAG: &[u8] = b"leaf";
const BRANCH_TAG: &[u8] = b"branch";

/// Hash and merkle sum describing a subtree root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeSummary {
    pub hash: NodeHash,
    pub sum: u64,
}

/// Leaf payload: opaque value bytes plus the sum the leaf contributes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Leaf {
    value: Vec<u8>,
    sum: u64,
}

impl Leaf {
    pub fn new(value: Vec<u8>, sum: u64) -> Self {
        Self { value, sum }
    }

    /// The leaf standing in for an absent key.
    pub fn empty() -> Self {
        Self {
            value: Vec::new(),
            sum: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty() && self.sum == 0
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    pub fn hash(&self) -> NodeHash {
        let mut hasher = Sha256::new();
        hasher.update(LEAF_TAG);
        hasher.update(Sha256::digest(&self.value));
        hasher.update(self.sum.to_be_bytes());
        hasher.finalize().into()
    }

    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            hash: self.hash(),
            sum: self.sum,
        }
    }
}

/// Hash of a branch over the two child summaries. The branch sum is not
/// part of this function; callers add the child sums with overflow checks.
pub fn branch_hash(left: &NodeSummary, right: &NodeSummary) -> NodeHash {
    let mut hasher = Sha256::new();
    hasher.update(BRANCH_TAG);
    hasher.update(left.hash);
    hasher.update(left.sum.to_be_bytes());
    hasher.update(right.hash);
    hasher.update(right.sum.to_be_bytes());
    hasher.finalize().into()
}

/// Bit of `key` selecting the child taken at `height` (0 = left).
pub fn key_bit(key: &[u8; 32], height: usize) -> u8 {
    (key[height / 8] >> (7 - height % 8)) & 1
}

/// Precomputed summaries of the all-empty subtree, indexed by the height
/// of the subtree root. Entry `TREE_HEIGHT` is the empty leaf itself.
pub fn empty_summaries() -> &'static [NodeSummary; TREE_HEIGHT + 1] {
    static TABLE: OnceLock<[NodeSummary; TREE_HEIGHT + 1]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [NodeSummary {
            hash: [0u8; 32],
            sum: 0,
        }; TREE_HEIGHT + 1];
        table[TREE_HEIGHT] = Leaf::empty().summary();
        for height in (0..TREE_HEIGHT).rev() {
            let child = table[height + 1];
            table[height] = NodeSummary {
                hash: branch_hash(&child, &child),
                sum: 0,
            };
        }
        table
    })
}

pub fn empty_summary(height: usize) -> NodeSummary {
    empty_summaries()[height]
}

/// Summary of a single leaf lifted to `height`: the leaf combined with
/// empty siblings along the remaining bits of its key.
pub fn compact_summary(key: &[u8; 32], leaf: &Leaf, height: usize) -> NodeSummary {
    let mut current = leaf.summary();
    for level in (height..TREE_HEIGHT).rev() {
        let sibling = empty_summary(level + 1);
        let hash = if key_bit(key, level) == 0 {
            branch_hash(&current, &sibling)
        } else {
            branch_hash(&sibling, &current)
        };
        current = NodeSummary {
            hash,
            sum: current.sum,
        };
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_is_consistent() {
        let table = empty_summaries();
        assert_eq!(table[TREE_HEIGHT], Leaf::empty().summary());
        for height in 0..TREE_HEIGHT {
            let child = table[height + 1];
            assert_eq!(table[height].hash, branch_hash(&child, &child));
            assert_eq!(table[height].sum, 0);
        }
    }

    #[test]
    fn leaf_hash_binds_value_and_sum() {
        let a = Leaf::new(vec![1, 2, 3], 10);
        let b = Leaf::new(vec![1, 2, 3], 11);
        let c = Leaf::new(vec![1, 2, 4], 10);
        assert_ne!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash(), Leaf::new(vec![1, 2, 3], 10).hash());
    }

    #[test]
    fn key_bit_is_msb_first() {
        let mut key = [0u8; 32];
        key[0] = 0b1000_0000;
        assert_eq!(key_bit(&key, 0), 1);
        assert_eq!(key_bit(&key, 1), 0);
        key[31] = 0b0000_0001;
        assert_eq!(key_bit(&key, 255), 1);
    }

    #[test]
    fn compact_summary_at_root_matches_manual_fold() {
        let key = [0xffu8; 32];
        let leaf = Leaf::new(vec![7; 16], 42);
        let lifted = compact_summary(&key, &leaf, 0);
        let mut current = leaf.summary();
        for level in (0..TREE_HEIGHT).rev() {
            let sibling = empty_summary(level + 1);
            current = NodeSummary {
                hash: branch_hash(&sibling, &current),
                sum: current.sum,
            };
        }
        assert_eq!(lifted, current);
        assert_eq!(lifted.sum, 42);
    }
}
