//! Layer identities.
//!
//! Identical identity ⇒ equivalent build output. The identity digest is the
//! SHA-256 of the identity's canonical JSON encoding and is the storage key of
//! the layer in the cache.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::digest::{compute_digest, sha256_hex};
use super::error::Result;

/// Which of the three build layers an identity describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Base,
    Environment,
    Instance,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Base => "base",
            LayerKind::Environment => "environment",
            LayerKind::Instance => "instance",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared tooling: the requested tool set and the setup commands run over it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseIdentity {
    /// Tool name → resolved version line
    pub tools: BTreeMap<String, String>,
    /// Digest of the ordered setup command list
    pub setup_digest: String,
}

impl BaseIdentity {
    pub fn new(tools: BTreeMap<String, String>, setup: &[String]) -> Self {
        Self {
            tools,
            setup_digest: sha256_hex(setup.join("\n").as_bytes()),
        }
    }
}

/// One repository at one commit with its dependencies installed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentIdentity {
    /// Digest of the parent Base identity
    pub base_digest: String,
    pub repo: String,
    pub commit: String,
    /// Digest of the recipe inputs the repository snapshot does not carry
    /// (profile install commands, environment patches)
    pub manifest_digest: String,
}

/// One patch-evaluation attempt derived from an Environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceIdentity {
    pub environment: EnvironmentIdentity,
    pub patch_digest: String,
    pub extras_digest: String,
}

impl InstanceIdentity {
    /// Identity of `patch` plus `test_patch` and `extras` on top of `environment`.
    pub fn new(
        environment: EnvironmentIdentity,
        patch: &str,
        test_patch: Option<&str>,
        extras: &[String],
    ) -> Self {
        let mut patch_input = patch.to_string();
        if let Some(tp) = test_patch {
            patch_input.push('\0');
            patch_input.push_str(tp);
        }
        let mut sorted_extras = extras.to_vec();
        sorted_extras.sort();
        sorted_extras.dedup();

        Self {
            environment,
            patch_digest: sha256_hex(patch_input.as_bytes()),
            extras_digest: sha256_hex(sorted_extras.join("\n").as_bytes()),
        }
    }
}

/// Identity of a buildable layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerIdentity {
    Base(BaseIdentity),
    Environment(EnvironmentIdentity),
    Instance(InstanceIdentity),
}

impl LayerIdentity {
    pub fn kind(&self) -> LayerKind {
        match self {
            LayerIdentity::Base(_) => LayerKind::Base,
            LayerIdentity::Environment(_) => LayerKind::Environment,
            LayerIdentity::Instance(_) => LayerKind::Instance,
        }
    }

    /// SHA-256 of the canonical JSON encoding of this identity.
    pub fn digest(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        compute_digest(&value)
    }

    /// Cache key of this identity.
    pub fn key(&self) -> Result<LayerKey> {
        Ok(LayerKey {
            kind: self.kind(),
            digest: self.digest()?,
        })
    }

    /// Key of the parent layer (`None` for Base).
    pub fn parent_key(&self) -> Result<Option<LayerKey>> {
        match self {
            LayerIdentity::Base(_) => Ok(None),
            LayerIdentity::Environment(env) => Ok(Some(LayerKey {
                kind: LayerKind::Base,
                digest: env.base_digest.clone(),
            })),
            LayerIdentity::Instance(inst) => {
                let parent = LayerIdentity::Environment(inst.environment.clone());
                Ok(Some(parent.key()?))
            }
        }
    }
}

/// Storage key of a layer: its kind plus identity digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerKey {
    pub kind: LayerKind,
    pub digest: String,
}

impl LayerKey {
    /// First 12 characters of the digest.
    pub fn short(&self) -> &str {
        &self.digest[..12.min(self.digest.len())]
    }
}

impl fmt::Display for LayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.short())
    }
}
