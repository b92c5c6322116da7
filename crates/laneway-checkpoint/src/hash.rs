//! Content-addressed hashing primitives
//!
//! Provides [`ContentHash`], the 32-byte Blake3 digest that identifies the
//! critical-state file set captured by a checkpoint, and [`SnapshotHasher`],
//! which folds a set of files into one digest independent of capture order.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Blake3 digest of checkpointed content, rendered as lowercase hex
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Digest of a byte buffer
    #[inline]
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Raw digest bytes
    #[inline]
    #[must_use]
    pub const fn digest(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 bytes as hex, for log lines and listings
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        let digest: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| HashError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            })?;
        Ok(Self(digest))
    }
}

// Ledgers are read by humans: hashes are stored as hex strings.
impl serde::Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        hex.parse().map_err(serde::de::Error::custom)
    }
}

/// Order-independent hasher over a set of named files
///
/// Entries are keyed by their workspace-relative path and folded in sorted
/// order, so the digest only depends on the set contents. A file that is
/// absent contributes an explicit marker distinct from an empty file.
#[derive(Debug, Default, Clone)]
pub struct SnapshotHasher {
    entries: BTreeMap<String, Option<ContentHash>>,
}

impl SnapshotHasher {
    /// Create an empty hasher
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a present file and its contents
    pub fn add_file(&mut self, path: impl Into<String>, contents: &[u8]) {
        self.entries
            .insert(path.into(), Some(ContentHash::of(contents)));
    }

    /// Record a file that does not exist
    pub fn add_missing(&mut self, path: impl Into<String>) {
        self.entries.insert(path.into(), None);
    }

    /// Fold all entries into the final digest
    #[must_use]
    pub fn finish(&self) -> ContentHash {
        let mut hasher = blake3::Hasher::new();
        for (path, digest) in &self.entries {
            hasher.update(&(path.len() as u64).to_le_bytes());
            hasher.update(path.as_bytes());
            match digest {
                Some(d) => {
                    hasher.update(&[1]);
                    hasher.update(d.digest());
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }
        hasher.finalize().into()
    }
}

/// Failure to parse a hex digest
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// Decoded digest has the wrong size
    #[error("digest is {actual} bytes, expected {expected}")]
    InvalidLength {
        /// Required byte length
        expected: usize,
        /// Decoded byte length
        actual: usize,
    },

    /// Not hex
    #[error("digest is not hex: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_digest_parses_as_wrong_length() {
        let result: Result<ContentHash, _> = "abcd".parse();
        assert!(matches!(
            result,
            Err(HashError::InvalidLength {
                expected: 32,
                actual: 2
            })
        ));
        assert!(matches!("zz".parse::<ContentHash>(), Err(HashError::HexDecode(_))));
    }

    #[test]
    fn hex_form_round_trips() {
        let hash = ContentHash::of(b"{\"stage\":1}");
        assert_eq!(hash.to_string().parse::<ContentHash>().unwrap(), hash);
        assert_eq!(hash.short().len(), 16);
        assert!(hash.to_string().starts_with(&hash.short()));
        assert_eq!(serde_json::to_string(&hash).unwrap(), format!("\"{hash}\""));
    }

    #[test]
    fn snapshot_hash_ignores_insertion_order() {
        let mut a = SnapshotHasher::new();
        a.add_file("Cargo.toml", b"[package]");
        a.add_file("src/lib.rs", b"pub fn f() {}");

        let mut b = SnapshotHasher::new();
        b.add_file("src/lib.rs", b"pub fn f() {}");
        b.add_file("Cargo.toml", b"[package]");

        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn snapshot_hash_distinguishes_missing_from_empty() {
        let mut missing = SnapshotHasher::new();
        missing.add_missing("state.json");

        let mut empty = SnapshotHasher::new();
        empty.add_file("state.json", b"");

        assert_ne!(missing.finish(), empty.finish());
    }

    #[test]
    fn snapshot_hash_changes_with_content() {
        let mut a = SnapshotHasher::new();
        a.add_file("state.json", b"{\"stage\":1}");
        let mut b = SnapshotHasher::new();
        b.add_file("state.json", b"{\"stage\":2}");
        assert_ne!(a.finish(), b.finish());
    }
}
