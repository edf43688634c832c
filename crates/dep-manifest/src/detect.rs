//! Manifest detection and classification
//!
//! Finds the dependency declaration files of a checked-out repository and
//! classifies requirement files as pinned (every entry `==`/`===`/direct URL)
//! or loose (ranges, bare names).

use crate::error::ManifestError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Kind of dependency declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestKind {
    /// `requirements*.txt` (root or `requirements/` directory)
    Requirements,
    /// `Pipfile.lock`
    PipfileLock,
    /// `poetry.lock`
    PoetryLock,
    /// `pyproject.toml`
    Pyproject,
    /// `setup.py`
    SetupPy,
    /// `environment.yml` / `environment.yaml` (conda)
    CondaEnv,
}

/// A manifest file found in the repository snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedManifest {
    pub kind: ManifestKind,
    /// Path relative to the repository root
    pub path: PathBuf,
    /// Whether every declared dependency has an exact version
    pub pinned: bool,
}

/// Find every dependency manifest under `root`.
///
/// Results are sorted by path so detection is deterministic.
pub fn detect_manifests(root: &Path) -> Result<Vec<DetectedManifest>> {
    if !root.is_dir() {
        return Err(ManifestError::RootNotFound(root.display().to_string()));
    }

    let mut found = Vec::new();

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let rel = PathBuf::from(&name);

        match name.as_str() {
            "Pipfile.lock" => found.push(DetectedManifest {
                kind: ManifestKind::PipfileLock,
                path: rel,
                pinned: true,
            }),
            "poetry.lock" => found.push(DetectedManifest {
                kind: ManifestKind::PoetryLock,
                path: rel,
                pinned: true,
            }),
            "pyproject.toml" => found.push(DetectedManifest {
                kind: ManifestKind::Pyproject,
                path: rel,
                pinned: false,
            }),
            "setup.py" => found.push(DetectedManifest {
                kind: ManifestKind::SetupPy,
                path: rel,
                pinned: false,
            }),
            "environment.yml" | "environment.yaml" => found.push(DetectedManifest {
                kind: ManifestKind::CondaEnv,
                path: rel,
                pinned: false,
            }),
            _ if is_requirements_name(&name) => {
                let content = std::fs::read_to_string(&path)?;
                found.push(DetectedManifest {
                    kind: ManifestKind::Requirements,
                    path: rel,
                    pinned: requirements_are_pinned(&content),
                });
            }
            _ => {}
        }
    }

    let req_dir = root.join("requirements");
    if req_dir.is_dir() {
        for entry in std::fs::read_dir(&req_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().is_file() && name.ends_with(".txt") {
                let content = std::fs::read_to_string(entry.path())?;
                found.push(DetectedManifest {
                    kind: ManifestKind::Requirements,
                    path: PathBuf::from("requirements").join(&name),
                    pinned: requirements_are_pinned(&content),
                });
            }
        }
    }

    found.sort_by(|a, b| a.path.cmp(&b.path));
    info!("Detected {} dependency manifest(s) in {:?}", found.len(), root);
    Ok(found)
}

fn is_requirements_name(name: &str) -> bool {
    name.starts_with("requirements") && name.ends_with(".txt")
}

/// Returns `true` if every requirement line pins an exact version.
///
/// Comments, blank lines, options (`-r`, `--index-url`, ...) and local
/// editable installs are ignored. A file with no requirement lines is not
/// considered pinned.
pub fn requirements_are_pinned(content: &str) -> bool {
    let mut seen = 0usize;
    for raw in content.lines() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() || line.starts_with('-') || line == "." {
            continue;
        }
        seen += 1;
        let exact = line.contains("===")
            || (line.contains("==") && !line.contains(',') && !line.contains('*'))
            || line.contains(" @ ");
        if !exact {
            debug!("Loose requirement: {}", line);
            return false;
        }
    }
    seen > 0
}

#[derive(Debug, Deserialize)]
struct PipfileLock {
    #[serde(default)]
    default: BTreeMap<String, PipfileLockEntry>,
}

#[derive(Debug, Deserialize)]
struct PipfileLockEntry {
    version: Option<String>,
}

/// Convert the `default` section of a `Pipfile.lock` into pinned requirement lines.
pub fn pinned_requirements_from_pipfile_lock(content: &str) -> Result<Vec<String>> {
    let lock: PipfileLock = serde_json::from_str(content)
        .map_err(|e| ManifestError::InvalidPipfileLock(e.to_string()))?;

    let mut lines = Vec::with_capacity(lock.default.len());
    for (name, entry) in lock.default {
        match entry.version {
            Some(version) => lines.push(format!("{name}{version}")),
            None => {
                return Err(ManifestError::InvalidPipfileLock(format!(
                    "package {name} has no locked version"
                )))
            }
        }
    }
    Ok(lines)
}
