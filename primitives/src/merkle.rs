//! Canonical merkle accumulator for block transaction and action roots.
//!
//! Digests are kept in append order and the root is a pure function of that
//! order. Each pairing level canonicalizes its inputs: the left node has the
//! top bit of its first byte cleared and the right node has it set, then the
//! parent is `SHA-256(left || right)`. An odd node at the end of a level is
//! paired with itself. A single digest is its own root; the empty list has
//! the zero root.
//!
//! The side marker lets a proof carry bare sibling hashes: a sibling with the
//! top bit set sits on the right.

use crate::crypto::hash_pair;
use crate::error::{ChainError, ChainResult};
use crate::types::{Hash, ZERO_HASH};

fn make_canonical_left(h: &Hash) -> Hash {
    let mut out = *h;
    out[0] &= 0x7f;
    out
}

fn make_canonical_right(h: &Hash) -> Hash {
    let mut out = *h;
    out[0] |= 0x80;
    out
}

fn is_canonical_right(h: &Hash) -> bool {
    h[0] & 0x80 != 0
}

fn canonical_parent(left: &Hash, right: &Hash) -> Hash {
    hash_pair(&make_canonical_left(left), &make_canonical_right(right))
}

/// Reduce one level, duplicating a trailing odd node.
fn next_level(level: &[Hash]) -> Vec<Hash> {
    level
        .chunks(2)
        .map(|pair| {
            let left = &pair[0];
            canonical_parent(left, pair.get(1).unwrap_or(left))
        })
        .collect()
}

/// Canonical root of an ordered digest list.
pub fn merkle_root(digests: &[Hash]) -> Hash {
    if digests.is_empty() {
        return ZERO_HASH;
    }
    let mut level = digests.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

/// Inclusion proof for one digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// The digest being proven.
    pub leaf: Hash,
    /// Canonicalized siblings from the leaf level up to the root.
    pub path: Vec<Hash>,
}

/// Build a proof for the first occurrence of `digest` in `digests`.
pub fn generate_proof(digest: &Hash, digests: &[Hash]) -> ChainResult<MerkleProof> {
    let mut index = digests
        .iter()
        .position(|d| d == digest)
        .ok_or_else(|| ChainError::Merkle("digest not in list".into()))?;

    let mut path = Vec::new();
    let mut level = digests.to_vec();
    while level.len() > 1 {
        let sibling = if index % 2 == 0 {
            let right = level.get(index + 1).unwrap_or(&level[index]);
            make_canonical_right(right)
        } else {
            make_canonical_left(&level[index - 1])
        };
        path.push(sibling);
        level = next_level(&level);
        index /= 2;
    }
    Ok(MerkleProof { leaf: *digest, path })
}

/// Check that `proof` shows `digest` under `root`.
pub fn verify_proof(digest: &Hash, proof: &MerkleProof, root: &Hash) -> bool {
    if proof.leaf != *digest {
        return false;
    }
    let mut current = *digest;
    for sibling in &proof.path {
        current = if is_canonical_right(sibling) {
            hash_pair(&make_canonical_left(&current), sibling)
        } else {
            hash_pair(sibling, &make_canonical_right(&current))
        };
    }
    current == *root
}

/// Ordered digest list feeding a block's merkle roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MerkleAccumulator {
    digests: Vec<Hash>,
}

impl MerkleAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, digest: Hash) {
        self.digests.push(digest);
    }

    pub fn root(&self) -> Hash {
        merkle_root(&self.digests)
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn digests(&self) -> &[Hash] {
        &self.digests
    }

    /// Drop the last `len() - len` digests.
    pub fn truncate(&mut self, len: usize) {
        self.digests.truncate(len);
    }

    pub fn prove(&self, digest: &Hash) -> ChainResult<MerkleProof> {
        generate_proof(digest, &self.digests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_sha256;

    fn leaves(s: &str) -> Vec<Hash> {
        s.bytes().map(|c| hash_sha256(&[c])).collect()
    }

    fn hex(h: &Hash) -> String {
        h.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn test_empty_and_single() {
        assert_eq!(merkle_root(&[]), ZERO_HASH);
        let one = leaves("a");
        assert_eq!(merkle_root(&one), one[0]);
    }

    #[test]
    fn test_two_leaf_vector() {
        assert_eq!(
            hex(&merkle_root(&leaves("ab"))),
            "39cd7110283b5980c22c81cbfc13698f0991d4d5d9fd2ef5d198ba2352bfb007"
        );
    }

    #[test]
    fn test_five_leaf_vector() {
        // e is duplicated to make six leaves at the bottom level.
        assert_eq!(
            hex(&merkle_root(&leaves("abcde"))),
            "b00459fcd0f70d36fc4c9241be0bf6df1ac2ac02b18a3bc55179bb3e5743293a"
        );
        let mut explicit = leaves("abcde");
        explicit.push(explicit[4]);
        assert_eq!(merkle_root(&explicit), merkle_root(&leaves("abcde")));
    }

    #[test]
    fn test_order_matters() {
        assert_ne!(merkle_root(&leaves("ab")), merkle_root(&leaves("ba")));
    }

    #[test]
    fn test_accumulator_matches_free_function() {
        let mut acc = MerkleAccumulator::new();
        for d in leaves("abcde") {
            acc.append(d);
        }
        assert_eq!(acc.len(), 5);
        assert_eq!(acc.root(), merkle_root(&leaves("abcde")));
        acc.truncate(2);
        assert_eq!(acc.root(), merkle_root(&leaves("ab")));
    }

    #[test]
    fn test_proof_for_odd_tail() {
        let list = leaves("abcde");
        let root = merkle_root(&list);
        let proof = generate_proof(&list[4], &list).unwrap();
        assert_eq!(proof.path.len(), 3);
        assert!(verify_proof(&list[4], &proof, &root));
    }

    #[test]
    fn test_proof_rejects_foreign_digest() {
        let list = leaves("abcd");
        let root = merkle_root(&list);
        let proof = generate_proof(&list[1], &list).unwrap();
        let outsider = hash_sha256(b"z");
        assert!(!verify_proof(&outsider, &proof, &root));
        assert!(generate_proof(&outsider, &list).is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn every_member_proves(list in prop::collection::vec(any::<[u8; 32]>(), 1..40)) {
                let root = merkle_root(&list);
                for d in &list {
                    let proof = generate_proof(d, &list).unwrap();
                    prop_assert!(verify_proof(d, &proof, &root));
                }
            }

            #[test]
            fn absent_digest_never_proves(
                list in prop::collection::vec(any::<[u8; 32]>(), 1..40),
                outsider in any::<[u8; 32]>(),
            ) {
                prop_assume!(!list.contains(&outsider));
                let root = merkle_root(&list);
                for d in &list {
                    let mut proof = generate_proof(d, &list).unwrap();
                    prop_assert!(!verify_proof(&outsider, &proof, &root));
                    proof.leaf = outsider;
                    prop_assert!(!verify_proof(&outsider, &proof, &root));
                }
            }
        }
    }
}
