use thiserror::Error;

use crate::node::{branch_hash, empty_summary, key_bit, Leaf, NodeSummary, TREE_HEIGHT};

#[derive(Debug, Error)]
pub enum ProofError {
    #[error("expected {TREE_HEIGHT} proof nodes, got {0}")]
    InvalidLength(usize),
    #[error("node sum overflow during root computation")]
    SumOverflow,
    #[error("malformed compressed proof")]
    Malformed,
}

/// Merkle proof for one key: the sibling summary at every tree level,
/// ordered root-first (`nodes[h]` sits at height `h + 1`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proof {
    nodes: Vec<NodeSummary>,
}

impl Proof {
    pub(crate) fn new(nodes: Vec<NodeSummary>) -> Self {
        debug_assert_eq!(nodes.len(), TREE_HEIGHT);
        Self { nodes }
    }

    pub fn from_nodes(nodes: Vec<NodeSummary>) -> Result<Self, ProofError> {
        if nodes.len() != TREE_HEIGHT {
            return Err(ProofError::InvalidLength(nodes.len()));
        }
        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[NodeSummary] {
        &self.nodes
    }

    /// Recomputes the root implied by `leaf` sitting at `key`, adding the
    /// sums level by level with overflow checks.
    pub fn root(&self, key: &[u8; 32], leaf: &Leaf) -> Result<NodeSummary, ProofError> {
        let mut current = leaf.summary();
        for height in (0..TREE_HEIGHT).rev() {
            let sibling = self.nodes[height];
            let (left, right) = if key_bit(key, height) == 0 {
                (current, sibling)
            } else {
                (sibling, current)
            };
            let sum = left
                .sum
                .checked_add(right.sum)
                .ok_or(ProofError::SumOverflow)?;
            current = NodeSummary {
                hash: branch_hash(&left, &right),
                sum,
            };
        }
        Ok(current)
    }

    /// Inclusion check for present keys; pass `Leaf::empty()` to verify
    /// non-inclusion.
    pub fn verify(&self, key: &[u8; 32], leaf: &Leaf, root: &NodeSummary) -> bool {
        self.root(key, leaf)
            .map(|computed| computed == *root)
            .unwrap_or(false)
    }

    /// Elides every sibling that equals the empty subtree at its height.
    pub fn compress(&self) -> CompressedProof {
        let mut bits = [0u8; TREE_HEIGHT / 8];
        let mut nodes = Vec::new();
        for (height, node) in self.nodes.iter().enumerate() {
            if *node == empty_summary(height + 1) {
                bits[height / 8] |= 1 << (height % 8);
            } else {
                nodes.push(*node);
            }
        }
        CompressedProof { bits, nodes }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.compress().to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProofError> {
        CompressedProof::from_bytes(bytes)?.decompress()
    }
}

/// Wire form of a proof: a 256-bit map of elided empty siblings plus the
/// remaining summaries in height order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressedProof {
    bits: [u8; TREE_HEIGHT / 8],
    nodes: Vec<NodeSummary>,
}

impl CompressedProof {
    pub fn decompress(&self) -> Result<Proof, ProofError> {
        let mut nodes = Vec::with_capacity(TREE_HEIGHT);
        let mut next = self.nodes.iter();
        for height in 0..TREE_HEIGHT {
            if self.bits[height / 8] & (1 << (height % 8)) != 0 {
                nodes.push(empty_summary(height + 1));
            } else {
                nodes.push(*next.next().ok_or(ProofError::Malformed)?);
            }
        }
        if next.next().is_some() {
            return Err(ProofError::Malformed);
        }
        Ok(Proof { nodes })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bits.len() + 2 + self.nodes.len() * 40);
        out.extend_from_slice(&self.bits);
        out.extend_from_slice(&(self.nodes.len() as u16).to_be_bytes());
        for node in &self.nodes {
            out.extend_from_slice(&node.hash);
            out.extend_from_slice(&node.sum.to_be_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProofError> {
        let bitmap_len = TREE_HEIGHT / 8;
        if bytes.len() < bitmap_len + 2 {
            return Err(ProofError::Malformed);
        }
        let mut bits = [0u8; TREE_HEIGHT / 8];
        bits.copy_from_slice(&bytes[..bitmap_len]);
        let count = u16::from_be_bytes([bytes[bitmap_len], bytes[bitmap_len + 1]]) as usize;
        let mut rest = &bytes[bitmap_len + 2..];
        if rest.len() != count * 40 {
            return Err(ProofError::Malformed);
        }
        let mut nodes = Vec::with_capacity(count);
        while !rest.is_empty() {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&rest[..32]);
            let mut sum = [0u8; 8];
            sum.copy_from_slice(&rest[32..40]);
            nodes.push(NodeSummary {
                hash,
                sum: u64::from_be_bytes(sum),
            });
            rest = &rest[40..];
        }
        Ok(Self { bits, nodes })
    }
}
