//! Stable short identifiers for source media paths
//!
//! A fingerprint is the first seven hex characters of the SHA-256 of the
//! source path bytes. It doubles as the cache key (the manifest is written as
//! `<fingerprint>.m3u8` in the cache directory) and as the encoder task key.
//!
//! Seven hex characters are 28 bits, which keeps file names short at the cost
//! of absolute collision resistance. That is fine for a personal library of a
//! few thousand files, not for adversarial or very large corpora.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Extension of the manifest produced for every transcoded source.
pub const MANIFEST_EXTENSION: &str = ".m3u8";

/// Deterministic short id derived from a source path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Number of hex characters kept from the digest.
    pub const LEN: usize = 7;

    /// Fingerprint a source path. Same path always yields the same id.
    pub fn of(path: &Path) -> Self {
        let hash = format!("{:x}", Sha256::digest(path.as_os_str().as_encoded_bytes()));
        Self(hash[..Self::LEN].to_string())
    }

    /// Accept an id coming back from a client (e.g. a cancel request).
    ///
    /// Only lowercase hex of the exact length is accepted so ids can never
    /// carry path separators into cache lookups.
    pub fn parse(id: &str) -> Option<Self> {
        let valid = id.len() == Self::LEN
            && id
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the manifest inside the cache directory.
    pub fn artifact_name(&self) -> String {
        format!("{}{}", self.0, MANIFEST_EXTENSION)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let path = Path::new("/mnt/movies/Heat (1995).mkv");
        assert_eq!(Fingerprint::of(path), Fingerprint::of(path));
        assert_eq!(Fingerprint::of(path).as_str().len(), Fingerprint::LEN);
    }

    #[test]
    fn test_fingerprint_matches_sha256_prefix() {
        // sha256("abc") = ba7816bf8f01cfea414140de5dae2223...
        assert_eq!(Fingerprint::of(Path::new("abc")).as_str(), "ba7816b");
    }

    #[test]
    fn test_distinct_paths_have_distinct_ids() {
        let ids: HashSet<Fingerprint> = (0..200)
            .map(|n| Fingerprint::of(Path::new(&format!("/library/show/episode-{n}.mkv"))))
            .collect();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn test_artifact_name() {
        let id = Fingerprint::of(Path::new("abc"));
        assert_eq!(id.artifact_name(), "ba7816b.m3u8");
    }

    #[test]
    fn test_parse() {
        assert!(Fingerprint::parse("ba7816b").is_some());
        assert!(Fingerprint::parse("BA7816B").is_none());
        assert!(Fingerprint::parse("ba7816").is_none());
        assert!(Fingerprint::parse("../etc1").is_none());
    }
}
