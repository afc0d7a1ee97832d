//! Merkle certification over shard results
//!
//! Leaves are `(shard_id, output_hash)` pairs sorted by shard id. Levels are
//! hashed pairwise bottom-up; an odd node at any level is paired with itself.
//! Leaf and branch digests use distinct prefixes so a branch can never be
//! passed off as a leaf.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type Digest32 = [u8; 32];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;
const EMPTY_DOMAIN: &[u8] = b"hxo:merkle:empty";

/// One certified shard result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleLeaf {
    pub shard_id: String,
    /// Content hash of the shard output
    pub output_hash: String,
}

impl MerkleLeaf {
    pub fn new(shard_id: impl Into<String>, output_hash: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            output_hash: output_hash.into(),
        }
    }

    fn digest(&self) -> Digest32 {
        let mut hasher = Sha256::new();
        hasher.update([LEAF_PREFIX]);
        hasher.update(self.shard_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.output_hash.as_bytes());
        hasher.finalize().into()
    }
}

/// A node of the tree, addressed by level (0 = leaves) and position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    pub level: usize,
    pub index: usize,
    pub hash: String,
}

/// Which side the sibling sits on when folding a proof step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofSide {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub side: ProofSide,
    pub hash: String,
}

/// Inclusion proof for one leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub shard_id: String,
    pub path: Vec<ProofStep>,
}

/// Hash tree over a plan's shard results
#[derive(Debug, Clone)]
pub struct MerkleTree {
    leaves: Vec<MerkleLeaf>,
    levels: Vec<Vec<Digest32>>,
    root: Digest32,
}

/// Root of a tree with no leaves
pub fn empty_root() -> String {
    hex::encode(Sha256::digest(EMPTY_DOMAIN))
}

fn branch(left: &Digest32, right: &Digest32) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

impl MerkleTree {
    /// Build a tree, returning the hex root alongside it
    pub fn build(leaves: impl IntoIterator<Item = MerkleLeaf>) -> (String, MerkleTree) {
        let mut leaves: Vec<MerkleLeaf> = leaves.into_iter().collect();
        leaves.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));

        if leaves.is_empty() {
            let root: Digest32 = Sha256::digest(EMPTY_DOMAIN).into();
            let tree = MerkleTree {
                leaves,
                levels: Vec::new(),
                root,
            };
            return (hex::encode(root), tree);
        }

        let mut levels = vec![leaves.iter().map(MerkleLeaf::digest).collect::<Vec<_>>()];
        while levels.last().map_or(0, Vec::len) > 1 {
            let current = &levels[levels.len() - 1];
            let next = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => branch(left, right),
                    [only] => branch(only, only),
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
            levels.push(next);
        }

        let root = levels[levels.len() - 1][0];
        let tree = MerkleTree {
            leaves,
            levels,
            root,
        };
        (hex::encode(root), tree)
    }

    pub fn root(&self) -> String {
        hex::encode(self.root)
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Leaves in tree order
    pub fn leaves(&self) -> &[MerkleLeaf] {
        &self.leaves
    }

    pub fn index_of(&self, shard_id: &str) -> Option<usize> {
        self.leaves
            .binary_search_by(|leaf| leaf.shard_id.as_str().cmp(shard_id))
            .ok()
    }

    /// Every node, leaves first
    pub fn nodes(&self) -> impl Iterator<Item = MerkleNode> + '_ {
        self.levels.iter().enumerate().flat_map(|(level, hashes)| {
            hashes.iter().enumerate().map(move |(index, hash)| MerkleNode {
                level,
                index,
                hash: hex::encode(hash),
            })
        })
    }

    /// Inclusion proof for the leaf at `index`
    pub fn prove(&self, index: usize) -> Option<MerkleProof> {
        let leaf = self.leaves.get(index)?;
        let mut path = Vec::with_capacity(self.levels.len());
        let mut pos = index;

        for level in &self.levels[..self.levels.len() - 1] {
            let step = if pos % 2 == 0 {
                // Odd tail pairs with itself
                let sibling = level.get(pos + 1).unwrap_or(&level[pos]);
                ProofStep {
                    side: ProofSide::Right,
                    hash: hex::encode(sibling),
                }
            } else {
                ProofStep {
                    side: ProofSide::Left,
                    hash: hex::encode(level[pos - 1]),
                }
            };
            path.push(step);
            pos /= 2;
        }

        Some(MerkleProof {
            leaf_index: index,
            shard_id: leaf.shard_id.clone(),
            path,
        })
    }

    /// Evenly spaced sample of proofs, deterministic for a given tree
    pub fn sample_proofs(&self, n: usize) -> Vec<(MerkleLeaf, MerkleProof)> {
        sample_indices(self.len(), n)
            .into_iter()
            .filter_map(|i| Some((self.leaves[i].clone(), self.prove(i)?)))
            .collect()
    }
}

/// Check that `leaf` is included under `root` via `proof`
pub fn verify(root: &str, leaf: &MerkleLeaf, proof: &MerkleProof) -> bool {
    if leaf.shard_id != proof.shard_id {
        return false;
    }
    let mut acc = leaf.digest();
    for step in &proof.path {
        let sibling: Digest32 = match hex::decode(&step.hash)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
        {
            Some(d) => d,
            None => return false,
        };
        acc = match step.side {
            ProofSide::Left => branch(&sibling, &acc),
            ProofSide::Right => branch(&acc, &sibling),
        };
    }
    hex::encode(acc) == root
}

fn sample_indices(len: usize, n: usize) -> Vec<usize> {
    if len == 0 || n == 0 {
        return Vec::new();
    }
    if n >= len {
        return (0..len).collect();
    }
    let mut indices: Vec<usize> = (0..n).map(|i| i * (len - 1) / (n - 1).max(1)).collect();
    indices.dedup();
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<MerkleLeaf> {
        (0..n)
            .map(|i| MerkleLeaf::new(format!("shard-{:04}", i), format!("out-{}", i)))
            .collect()
    }

    #[test]
    fn test_empty_tree_uses_sentinel() {
        let (root, tree) = MerkleTree::build(Vec::new());
        assert_eq!(root, empty_root());
        assert!(tree.is_empty());
        assert!(tree.prove(0).is_none());
    }

    #[test]
    fn test_every_leaf_verifies() {
        for n in 1..=17 {
            let (root, tree) = MerkleTree::build(leaves(n));
            for i in 0..n {
                let proof = tree.prove(i).unwrap();
                assert!(verify(&root, &tree.leaves()[i], &proof), "n={} i={}", n, i);
            }
        }
    }

    #[test]
    fn test_tampered_leaf_rejected() {
        for n in 1..=9 {
            let (root, tree) = MerkleTree::build(leaves(n));
            for i in 0..n {
                let proof = tree.prove(i).unwrap();
                let mut forged = tree.leaves()[i].clone();
                forged.output_hash.push('x');
                assert!(!verify(&root, &forged, &proof));
            }
        }
    }

    #[test]
    fn test_tampered_path_rejected() {
        let (root, tree) = MerkleTree::build(leaves(5));
        let mut proof = tree.prove(2).unwrap();
        proof.path[0].hash = "00".repeat(32);
        assert!(!verify(&root, &tree.leaves()[2], &proof));
    }

    #[test]
    fn test_root_is_order_independent() {
        let mut reversed = leaves(6);
        reversed.reverse();
        let (a, _) = MerkleTree::build(leaves(6));
        let (b, _) = MerkleTree::build(reversed);
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_leaf_root_is_leaf_digest() {
        let (root, tree) = MerkleTree::build(leaves(1));
        assert_eq!(tree.prove(0).unwrap().path.len(), 0);
        assert_eq!(root, tree.nodes().next().unwrap().hash);
    }

    #[test]
    fn test_odd_tail_duplicates_last() {
        let (_, tree) = MerkleTree::build(leaves(3));
        let proof = tree.prove(2).unwrap();
        let own = tree.nodes().find(|n| n.level == 0 && n.index == 2).unwrap();
        assert_eq!(proof.path[0].hash, own.hash);
        assert_eq!(proof.path[0].side, ProofSide::Right);
    }

    #[test]
    fn test_sample_indices_spread() {
        assert_eq!(sample_indices(10, 3), vec![0, 4, 9]);
        assert_eq!(sample_indices(3, 5), vec![0, 1, 2]);
        assert!(sample_indices(0, 4).is_empty());
        assert_eq!(sample_indices(8, 1), vec![0]);
    }

    #[test]
    fn test_index_of() {
        let (_, tree) = MerkleTree::build(leaves(4));
        assert_eq!(tree.index_of("shard-0002"), Some(2));
        assert_eq!(tree.index_of("missing"), None);
    }
}
