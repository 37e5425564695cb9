//! Tiger tree hashes: root representation, leaf verification, file hashing.
//!
//! Files are identified by the root of a Merkle tree built from Tiger
//! hashes of 1024-byte segments. Leaf hashes prefix the data with `0x00`,
//! internal nodes prefix the concatenated children with `0x01`, and an
//! odd node at the end of a level is promoted unchanged.

use std::io::Read;

use thiserror::Error;
use tiger::{Digest, Tiger};

use crate::constants::{LEAF_BLOCK_SIZE, LEAF_WIDTH};
use crate::protocol::{base32_decode_loose, base32_encode};

/// One Tiger digest: a tree leaf or the root.
pub type Leaf = [u8; LEAF_WIDTH];

/// Errors from tree hash parsing and verification.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// The root text did not decode as base32.
    #[error("invalid tree hash text: {0:?}")]
    InvalidText(String),

    /// The decoded root is not one digest wide.
    #[error("tree hash root must be {LEAF_WIDTH} bytes, got {0}")]
    BadLength(usize),

    /// The leaf stream is shorter than a single leaf.
    #[error("leaf stream too short: {0} bytes")]
    TooShort(usize),

    /// The leaf stream is not a whole number of leaves.
    #[error("leaf stream length {0} is not a multiple of {LEAF_WIDTH}")]
    Misaligned(usize),

    /// The rebuilt root does not match the expected root.
    #[error("leaves failed verification against the root")]
    RootMismatch,
}

/// A Tiger tree root: 24 raw bytes and their base32 text. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeHash {
    raw: Leaf,
    text: String,
}

impl TreeHash {
    /// Parses a root from its 39-character base32 form.
    pub fn from_base32(s: &str) -> Result<Self, VerificationError> {
        let bytes =
            base32_decode_loose(s).map_err(|_| VerificationError::InvalidText(s.to_string()))?;
        let raw: Leaf = bytes
            .as_slice()
            .try_into()
            .map_err(|_| VerificationError::BadLength(bytes.len()))?;
        Ok(Self {
            raw,
            text: s.trim_end_matches('=').to_string(),
        })
    }

    pub fn from_raw(raw: Leaf) -> Self {
        Self {
            text: base32_encode(&raw),
            raw,
        }
    }

    pub fn raw(&self) -> &Leaf {
        &self.raw
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl std::fmt::Display for TreeHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// Verifies a received leaf stream against an expected root.
///
/// The stream must be a non-empty whole number of 24-byte leaves. The
/// root is rebuilt by pairwise combination and compared in constant time.
/// Returns the split leaves on success.
pub fn verify_leaves(stream: &[u8], expected: &TreeHash) -> Result<Vec<Leaf>, VerificationError> {
    if stream.len() < LEAF_WIDTH {
        return Err(VerificationError::TooShort(stream.len()));
    }
    if stream.len() % LEAF_WIDTH != 0 {
        return Err(VerificationError::Misaligned(stream.len()));
    }

    let leaves: Vec<Leaf> = stream
        .chunks_exact(LEAF_WIDTH)
        .map(|c| c.try_into().unwrap())
        .collect();

    let root = fold(&leaves);
    if !constant_time_eq(&root, expected.raw()) {
        return Err(VerificationError::RootMismatch);
    }
    Ok(leaves)
}

/// Combines a level of digests up to the tree root.
pub fn fold(leaves: &[Leaf]) -> Leaf {
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                if pair.len() == 2 {
                    combine(&pair[0], &pair[1])
                } else {
                    pair[0]
                }
            })
            .collect();
    }
    level[0]
}

/// Hashes one file segment into a leaf: tiger(0x00 ‖ block).
pub fn leaf_hash(block: &[u8]) -> Leaf {
    let mut hasher = Tiger::new();
    hasher.update([0u8]);
    hasher.update(block);
    hasher.finalize().into()
}

/// Internal node: tiger(0x01 ‖ left ‖ right).
fn combine(left: &Leaf, right: &Leaf) -> Leaf {
    let mut hasher = Tiger::new();
    hasher.update([1u8]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Hashes a whole stream into its tree root, returning the root and the
/// number of bytes read. An empty stream hashes as a single empty leaf.
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<(TreeHash, u64)> {
    let mut leaves = Vec::new();
    let mut block = [0u8; LEAF_BLOCK_SIZE];
    let mut total = 0u64;

    loop {
        let mut filled = 0;
        while filled < LEAF_BLOCK_SIZE {
            let n = reader.read(&mut block[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        leaves.push(leaf_hash(&block[..filled]));
        total += filled as u64;
        if filled < LEAF_BLOCK_SIZE {
            break;
        }
    }

    if leaves.is_empty() {
        leaves.push(leaf_hash(&[]));
    }

    Ok((TreeHash::from_raw(fold(&leaves)), total))
}

fn constant_time_eq(a: &Leaf, b: &Leaf) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Well-known root of the empty file.
    const EMPTY_ROOT: &str = "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ";

    #[test]
    fn test_empty_stream_root() {
        let (root, size) = hash_reader(&[][..]).unwrap();
        assert_eq!(size, 0);
        assert_eq!(root.text(), EMPTY_ROOT);
    }

    #[test]
    fn test_root_text_round_trip() {
        let root = TreeHash::from_base32(EMPTY_ROOT).unwrap();
        assert_eq!(root.text(), EMPTY_ROOT);
        assert_eq!(TreeHash::from_raw(*root.raw()), root);
    }

    #[test]
    fn test_from_base32_rejects_bad_input() {
        assert!(matches!(
            TreeHash::from_base32("MZXW6"),
            Err(VerificationError::BadLength(3))
        ));
        assert!(matches!(
            TreeHash::from_base32("!!!"),
            Err(VerificationError::InvalidText(_))
        ));
    }

    #[test]
    fn test_verify_leaves_success() {
        let leaves = [leaf_hash(b"one"), leaf_hash(b"two"), leaf_hash(b"three")];
        let root = TreeHash::from_raw(fold(&leaves));
        let stream: Vec<u8> = leaves.iter().flatten().copied().collect();

        let verified = verify_leaves(&stream, &root).unwrap();
        assert_eq!(verified, leaves);
    }

    #[test]
    fn test_verify_leaves_detects_flip() {
        let leaves = [leaf_hash(b"one"), leaf_hash(b"two"), leaf_hash(b"three")];
        let root = TreeHash::from_raw(fold(&leaves));
        let mut stream: Vec<u8> = leaves.iter().flatten().copied().collect();

        // Single bit flip in the middle leaf.
        stream[LEAF_WIDTH + 5] ^= 0x40;
        assert!(matches!(
            verify_leaves(&stream, &root),
            Err(VerificationError::RootMismatch)
        ));
    }

    #[test]
    fn test_verify_leaves_rejects_bad_sizes() {
        let root = TreeHash::from_base32(EMPTY_ROOT).unwrap();
        assert!(matches!(
            verify_leaves(&[0u8; 10], &root),
            Err(VerificationError::TooShort(10))
        ));
        assert!(matches!(
            verify_leaves(&[0u8; 25], &root),
            Err(VerificationError::Misaligned(25))
        ));
    }

    #[test]
    fn test_single_leaf_is_its_own_root() {
        let leaf = leaf_hash(b"lonely");
        assert_eq!(fold(&[leaf]), leaf);
    }

    #[test]
    fn test_hash_reader_matches_manual_fold() {
        // Two full segments and a partial third.
        let data: Vec<u8> = (0..(2 * LEAF_BLOCK_SIZE + 10)).map(|i| i as u8).collect();
        let (root, size) = hash_reader(&data[..]).unwrap();
        assert_eq!(size, data.len() as u64);

        let leaves: Vec<Leaf> = data.chunks(LEAF_BLOCK_SIZE).map(leaf_hash).collect();
        assert_eq!(leaves.len(), 3);
        assert_eq!(root.raw(), &fold(&leaves));
    }
}
