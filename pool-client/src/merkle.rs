//! Merkle tree for inclusion paths and pool ledger roots
//!
//! # Design
//!
//! - Binary Merkle tree with SHA-256 hashing
//! - Odd levels duplicate their last hash
//! - Inclusion paths are serializable so they can travel inside state proofs
//! - The empty tree has an all-zero root

use crate::crypto::{hex_bytes, Hash};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hash a pair of hashes (used for internal nodes)
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Direction of sibling in Merkle tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sibling is on the left
    Left,
    /// Sibling is on the right
    Right,
}

/// One step of an inclusion path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStep {
    /// Side the sibling sits on
    pub side: Direction,
    /// Sibling hash
    #[serde(with = "hex_bytes")]
    pub hash: Hash,
}

/// Fold an inclusion path from a leaf up to the root it implies
pub fn derive_root(leaf_hash: &Hash, path: &[PathStep]) -> Hash {
    path.iter().fold(*leaf_hash, |current, step| match step.side {
        Direction::Left => hash_pair(&step.hash, &current),
        Direction::Right => hash_pair(&current, &step.hash),
    })
}

/// Merkle root of a list of leaf hashes
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return [0u8; 32];
    }

    let mut current_level = leaves.to_vec();
    while current_level.len() > 1 {
        current_level = next_level(&current_level);
    }

    current_level[0]
}

fn next_level(level: &[Hash]) -> Vec<Hash> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_pair(left, right),
            // Odd node out pairs with itself
            _ => hash_pair(&pair[0], &pair[0]),
        })
        .collect()
}

/// Merkle proof (path from leaf to root)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Leaf hash being proven
    pub leaf_hash: Hash,
    /// Sibling hashes along the path to root
    pub path: Vec<PathStep>,
    /// Root hash
    pub root_hash: Hash,
}

impl MerkleProof {
    /// Verify proof against its root hash
    pub fn verify(&self) -> bool {
        derive_root(&self.leaf_hash, &self.path) == self.root_hash
    }
}

/// Incremental Merkle tree
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    /// Leaf hashes (indexed by position)
    leaves: Vec<Hash>,
    /// Cached root hash
    cached_root: Option<Hash>,
}

impl MerkleTree {
    /// Create empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Create tree from existing leaves
    pub fn from_leaves(leaves: Vec<Hash>) -> Self {
        Self {
            leaves,
            cached_root: None,
        }
    }

    /// Append a new leaf
    pub fn append(&mut self, leaf_hash: Hash) {
        self.leaves.push(leaf_hash);
        self.cached_root = None;
    }

    /// Get number of leaves
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Check if tree is empty
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Compute Merkle root
    pub fn root(&mut self) -> Hash {
        if let Some(root) = self.cached_root {
            return root;
        }

        let root = merkle_root(&self.leaves);
        self.cached_root = Some(root);
        root
    }

    /// Generate Merkle proof for a leaf at given index
    pub fn generate_proof(&mut self, leaf_index: usize) -> Option<MerkleProof> {
        if leaf_index >= self.leaves.len() {
            return None;
        }

        let leaf_hash = self.leaves[leaf_index];
        let root_hash = self.root();
        let mut path = Vec::new();

        let mut current_level = self.leaves.clone();
        let mut current_index = leaf_index;

        // Walk up the tree, collecting siblings
        while current_level.len() > 1 {
            let is_left = current_index % 2 == 0;
            let step = if is_left {
                // Last node of an odd level pairs with itself
                let sibling = current_level
                    .get(current_index + 1)
                    .copied()
                    .unwrap_or(current_level[current_index]);
                PathStep {
                    side: Direction::Right,
                    hash: sibling,
                }
            } else {
                PathStep {
                    side: Direction::Left,
                    hash: current_level[current_index - 1],
                }
            };
            path.push(step);

            current_level = next_level(&current_level);
            current_index /= 2;
        }

        Some(MerkleProof {
            leaf_hash,
            path,
            root_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_bytes;

    #[test]
    fn test_empty_tree() {
        let mut tree = MerkleTree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.root(), [0u8; 32]);
    }

    #[test]
    fn test_single_leaf() {
        let mut tree = MerkleTree::new();
        let leaf = hash_bytes(b"leaf1");
        tree.append(leaf);

        assert_eq!(tree.len(), 1);
        assert_eq!(tree.root(), leaf);

        let proof = tree.generate_proof(0).unwrap();
        assert!(proof.path.is_empty());
        assert!(proof.verify());
    }

    #[test]
    fn test_odd_number_leaves() {
        let leaves = vec![hash_bytes(b"leaf1"), hash_bytes(b"leaf2"), hash_bytes(b"leaf3")];
        let mut tree = MerkleTree::from_leaves(leaves.clone());

        // With odd number, last leaf is duplicated
        let h01 = hash_pair(&leaves[0], &leaves[1]);
        let h22 = hash_pair(&leaves[2], &leaves[2]);
        assert_eq!(tree.root(), hash_pair(&h01, &h22));
        assert_eq!(merkle_root(&leaves), hash_pair(&h01, &h22));
    }

    #[test]
    fn test_every_leaf_has_valid_proof() {
        let leaves: Vec<Hash> = (0..7u8).map(|i| hash_bytes(&[i])).collect();
        let mut tree = MerkleTree::from_leaves(leaves.clone());
        let root = tree.root();

        for (i, leaf) in leaves.iter().enumerate() {
            let proof = tree.generate_proof(i).unwrap();
            assert_eq!(proof.leaf_hash, *leaf);
            assert_eq!(derive_root(leaf, &proof.path), root);
        }
        assert!(tree.generate_proof(7).is_none());
    }

    #[test]
    fn test_proof_verification_invalid() {
        let mut tree = MerkleTree::from_leaves(vec![hash_bytes(b"a"), hash_bytes(b"b")]);
        let mut proof = tree.generate_proof(0).unwrap();

        proof.root_hash = hash_bytes(b"fake_root");
        assert!(!proof.verify());
    }

    #[test]
    fn test_incremental_updates_change_root() {
        let mut tree = MerkleTree::new();
        tree.append(hash_bytes(b"leaf1"));
        let root1 = tree.root();
        tree.append(hash_bytes(b"leaf2"));
        assert_ne!(root1, tree.root());
    }

    #[test]
    fn test_path_step_serialization() {
        let step = PathStep {
            side: Direction::Left,
            hash: hash_bytes(b"x"),
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["side"], "left");
        let back: PathStep = serde_json::from_value(json).unwrap();
        assert_eq!(back, step);
    }
}
