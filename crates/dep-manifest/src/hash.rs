//! Manifest hashing
//!
//! Produces a content-addressable hash over a set of dependency declaration
//! files so that identical manifests hash identically across machines.

use crate::detect::DetectedManifest;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

/// Hash of a repository's dependency declarations
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestHash {
    /// The SHA256 hash
    pub hash: String,
    /// Source of the hash
    pub source: HashSource,
}

/// What the hash was computed from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashSource {
    /// One or more manifest files were found and hashed
    Manifests,
    /// No manifest present; hash of the empty set
    Empty,
}

impl std::fmt::Display for ManifestHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl ManifestHash {
    pub fn new(hash: String, source: HashSource) -> Self {
        ManifestHash { hash, source }
    }

    /// Get short hash (first 12 characters)
    pub fn short(&self) -> &str {
        &self.hash[..12.min(self.hash.len())]
    }
}

/// Hash the detected manifests under `root`.
///
/// Each file contributes its relative path and normalized content, in sorted
/// path order.
pub fn hash_manifests(root: &Path, manifests: &[DetectedManifest]) -> Result<ManifestHash> {
    let mut paths: Vec<&Path> = manifests.iter().map(|m| m.path.as_path()).collect();
    paths.sort();
    paths.dedup();

    let mut hasher = Sha256::new();
    for rel in &paths {
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(b"\0");

        let content = std::fs::read(root.join(rel))?;
        hasher.update(normalize_manifest(&content));
        hasher.update(b"\0");
    }

    let hash = hex::encode(hasher.finalize());
    debug!("Manifest hash: {}", &hash[..12]);

    let source = if paths.is_empty() {
        HashSource::Empty
    } else {
        HashSource::Manifests
    };
    Ok(ManifestHash::new(hash, source))
}

/// Normalize manifest text for consistent hashing
///
/// - Convert CRLF to LF
/// - Remove trailing whitespace
/// - Ensure single newline at end
pub(crate) fn normalize_manifest(content: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(content);

    let normalized: String = text
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n");

    let mut result = normalized.into_bytes();
    if !result.is_empty() && result.last() != Some(&b'\n') {
        result.push(b'\n');
    }

    result
}
