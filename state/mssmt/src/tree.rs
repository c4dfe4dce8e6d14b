use std::sync::Arc;

use thiserror::Error;

use crate::node::{
    branch_hash, compact_summary, empty_summary, key_bit, Leaf, NodeSummary, TREE_HEIGHT,
};
use crate::proof::Proof;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("node sum overflow")]
    SumOverflow,
}

#[derive(Clone, Debug)]
enum Node {
    Empty {
        height: usize,
    },
    /// A subtree holding exactly one leaf, stored without its empty
    /// siblings. `summary` is the leaf lifted to the node's height.
    Compact {
        key: [u8; 32],
        leaf: Leaf,
        summary: NodeSummary,
    },
    Branch {
        left: Arc<Node>,
        right: Arc<Node>,
        summary: NodeSummary,
    },
}

impl Node {
    fn summary(&self) -> NodeSummary {
        match self {
            Node::Empty { height } => empty_summary(*height),
            Node::Compact { summary, .. } => *summary,
            Node::Branch { summary, .. } => *summary,
        }
    }
}

fn compact(key: [u8; 32], leaf: Leaf, height: usize) -> Arc<Node> {
    let summary = compact_summary(&key, &leaf, height);
    Arc::new(Node::Compact { key, leaf, summary })
}

fn branch(left: Arc<Node>, right: Arc<Node>) -> Result<Arc<Node>, TreeError> {
    let l = left.summary();
    let r = right.summary();
    let sum = l.sum.checked_add(r.sum).ok_or(TreeError::SumOverflow)?;
    let summary = NodeSummary {
        hash: branch_hash(&l, &r),
        sum,
    };
    Ok(Arc::new(Node::Branch {
        left,
        right,
        summary,
    }))
}

/// Full-height merkle-sum sparse merkle tree with compacted leaves.
/// Internally persistent: clones share structure.
#[derive(Clone, Debug)]
pub struct Tree {
    root: Arc<Node>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            root: Arc::new(Node::Empty { height: 0 }),
        }
    }

    pub fn root(&self) -> NodeSummary {
        self.root.summary()
    }

    pub fn is_empty(&self) -> bool {
        self.root().hash == empty_summary(0).hash
    }

    /// Inserts `leaf` at `key`. Inserting `Leaf::empty()` deletes the key.
    /// Re-inserting an identical (key, leaf) pair leaves the root unchanged.
    pub fn insert(&mut self, key: &[u8; 32], leaf: Leaf) -> Result<(), TreeError> {
        self.root = insert_at(&self.root, key, &leaf, 0)?;
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8; 32]) -> Result<(), TreeError> {
        self.insert(key, Leaf::empty())
    }

    pub fn get(&self, key: &[u8; 32]) -> Option<&Leaf> {
        let mut node = self.root.as_ref();
        let mut height = 0;
        loop {
            match node {
                Node::Empty { .. } => return None,
                Node::Compact {
                    key: existing,
                    leaf,
                    ..
                } => {
                    return if existing == key && !leaf.is_empty() {
                        Some(leaf)
                    } else {
                        None
                    };
                }
                Node::Branch { left, right, .. } => {
                    node = if key_bit(key, height) == 0 {
                        left.as_ref()
                    } else {
                        right.as_ref()
                    };
                    height += 1;
                }
            }
        }
    }

    /// Produces the 256 sibling summaries along `key`, materializing
    /// compacted and empty subtrees at the heights the proof needs. Works
    /// for absent keys too (non-inclusion proofs verify the empty leaf).
    pub fn merkle_proof(&self, key: &[u8; 32]) -> Proof {
        let mut nodes = Vec::with_capacity(TREE_HEIGHT);
        collect_siblings(&self.root, key, 0, &mut nodes);
        Proof::new(nodes)
    }
}

fn insert_at(
    node: &Arc<Node>,
    key: &[u8; 32],
    leaf: &Leaf,
    height: usize,
) -> Result<Arc<Node>, TreeError> {
    match node.as_ref() {
        Node::Empty { .. } => Ok(if leaf.is_empty() {
            Arc::new(Node::Empty { height })
        } else {
            compact(*key, leaf.clone(), height)
        }),
        Node::Compact {
            key: existing,
            leaf: existing_leaf,
            ..
        } => {
            if existing == key {
                Ok(if leaf.is_empty() {
                    Arc::new(Node::Empty { height })
                } else {
                    compact(*key, leaf.clone(), height)
                })
            } else if leaf.is_empty() {
                // Deleting an absent key is a no-op.
                Ok(node.clone())
            } else {
                split(*existing, existing_leaf.clone(), *key, leaf.clone(), height)
            }
        }
        Node::Branch { left, right, .. } => {
            let (new_left, new_right) = if key_bit(key, height) == 0 {
                (insert_at(left, key, leaf, height + 1)?, right.clone())
            } else {
                (left.clone(), insert_at(right, key, leaf, height + 1)?)
            };
            collapse(new_left, new_right, height)
        }
    }
}

/// Turns one compacted leaf into a branch chain holding both keys,
/// descending until the keys diverge.
fn split(
    key_a: [u8; 32],
    leaf_a: Leaf,
    key_b: [u8; 32],
    leaf_b: Leaf,
    height: usize,
) -> Result<Arc<Node>, TreeError> {
    let bit_a = key_bit(&key_a, height);
    let bit_b = key_bit(&key_b, height);
    if bit_a != bit_b {
        let node_a = compact(key_a, leaf_a, height + 1);
        let node_b = compact(key_b, leaf_b, height + 1);
        let (left, right) = if bit_a == 0 {
            (node_a, node_b)
        } else {
            (node_b, node_a)
        };
        branch(left, right)
    } else {
        let inner = split(key_a, leaf_a, key_b, leaf_b, height + 1)?;
        let empty = Arc::new(Node::Empty { height: height + 1 });
        let (left, right) = if bit_a == 0 {
            (inner, empty)
        } else {
            (empty, inner)
        };
        branch(left, right)
    }
}

/// Rebuilds a branch after insertion, folding a subtree that is left with
/// a single occupant back into a compacted leaf.
fn collapse(left: Arc<Node>, right: Arc<Node>, height: usize) -> Result<Arc<Node>, TreeError> {
    match (left.as_ref(), right.as_ref()) {
        (Node::Empty { .. }, Node::Empty { .. }) => Ok(Arc::new(Node::Empty { height })),
        (Node::Compact { key, leaf, .. }, Node::Empty { .. })
        | (Node::Empty { .. }, Node::Compact { key, leaf, .. }) => {
            Ok(compact(*key, leaf.clone(), height))
        }
        _ => branch(left, right),
    }
}

fn collect_siblings(node: &Arc<Node>, key: &[u8; 32], height: usize, out: &mut Vec<NodeSummary>) {
    match node.as_ref() {
        Node::Empty { .. } => {
            for level in height..TREE_HEIGHT {
                out.push(empty_summary(level + 1));
            }
        }
        Node::Compact {
            key: existing,
            leaf,
            ..
        } => {
            for level in height..TREE_HEIGHT {
                if key_bit(existing, level) == key_bit(key, level) {
                    // The stored leaf travels with the queried path.
                    out.push(empty_summary(level + 1));
                } else {
                    // Keys diverge here: the stored leaf is the sibling
                    // subtree, everything below is empty.
                    out.push(compact_summary(existing, leaf, level + 1));
                    for rest in level + 1..TREE_HEIGHT {
                        out.push(empty_summary(rest + 1));
                    }
                    return;
                }
            }
        }
        Node::Branch { left, right, .. } => {
            if key_bit(key, height) == 0 {
                out.push(right.summary());
                collect_siblings(left, key, height + 1, out);
            } else {
                out.push(left.summary());
                collect_siblings(right, key, height + 1, out);
            }
        }
    }
}
