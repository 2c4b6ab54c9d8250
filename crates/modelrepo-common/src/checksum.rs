//! Checksum utilities for modelrepo
//!
//! Record payloads are protected by CRC32C stored next to their index entry.
//! Whole layer directories can be fingerprinted to prove that a read-only
//! layer was left untouched.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Checksum values computed for a block of data
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// CRC32C checksum (fast, for inline verification)
    pub crc32c: u32,
    /// xxHash64 (fast, for comparison)
    pub xxhash64: u64,
}

impl Checksum {
    /// Compute checksum from data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            xxhash64: xxhash_rust::xxh64::xxh64(data, 0),
        }
    }
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Content fingerprint of every regular file below a directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryFingerprint {
    /// Per-file checksums keyed by path relative to the root
    pub files: BTreeMap<PathBuf, Checksum>,
    /// SHA-256 over all relative paths and contents, in path order
    pub digest: [u8; 32],
}

impl DirectoryFingerprint {
    /// Fingerprint the tree rooted at `root`; a missing root yields an empty fingerprint
    pub fn compute(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut files = BTreeMap::new();
        let mut contents = BTreeMap::new();
        if root.exists() {
            collect_files(root, root, &mut contents)?;
        }

        let mut hasher = Sha256::new();
        for (rel, data) in &contents {
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update((data.len() as u64).to_le_bytes());
            hasher.update(data);
            files.insert(rel.clone(), Checksum::compute(data));
        }

        Ok(Self {
            files,
            digest: hasher.finalize().into(),
        })
    }

    /// Hex rendering of the digest
    #[must_use]
    pub fn hex(&self) -> String {
        hex_encode(&self.digest)
    }

    /// Relative paths that were added, removed or changed compared to `other`
    #[must_use]
    pub fn changed_files(&self, other: &Self) -> Vec<PathBuf> {
        let mut changed: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|(path, sum)| other.files.get(*path) != Some(sum))
            .map(|(path, _)| path.clone())
            .collect();
        changed.extend(
            other
                .files
                .keys()
                .filter(|path| !self.files.contains_key(*path))
                .cloned(),
        );
        changed.sort();
        changed
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            out.insert(rel, std::fs::read(&path)?);
        }
    }
    Ok(())
}

/// Hex encode bytes
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut result = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        result.push(HEX_CHARS[(byte >> 4) as usize] as char);
        result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    result
}
