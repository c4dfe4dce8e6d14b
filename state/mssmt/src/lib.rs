//! Merkle-sum sparse merkle tree over 256-bit keys.
//!
//! Every node carries a hash and a u64 sum; branch sums are the checked
//! addition of both children. Absent subtrees are represented by a
//! precomputed per-height table of empty hashes, and subtrees holding a
//! single leaf are stored as compacted leaves tagged with their key, so a
//! populated tree never materializes the 255 empty siblings below a leaf.

pub mod node;
pub mod proof;
pub mod tree;

pub use node::{
    branch_hash, empty_summaries, empty_summary, key_bit, Leaf, NodeHash, NodeSummary, TREE_HEIGHT,
};
pub use proof::{CompressedProof, Proof, ProofError};
pub use tree::{Tree, TreeError};
