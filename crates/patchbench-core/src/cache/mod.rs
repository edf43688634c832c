//! Image layer cache.
//!
//! Content-addressed store of built layers keyed by `(kind, identity digest)`.
//!
//! Layout under the cache root:
//! - `<kind>/<digest>/`: a stored layer, with `layer.json` describing it
//! - `.staging/`: in-progress builds, renamed into place on success
//! - `.instances/`: ephemeral Instance layers, never indexed

pub mod store;

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::builder::BuildError;
use crate::config::CacheConfig;
use crate::domain::{DomainError, LayerIdentity, LayerKey};

pub use store::{BuildContext, LayerCache, LayerLease};

/// Name of the record file inside every stored layer directory.
pub const LAYER_RECORD: &str = "layer.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStatus {
    Pending,
    Built,
    Failed,
}

/// A layer known to the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub identity: LayerIdentity,
    pub key: LayerKey,
    /// Instance → Environment, Environment → Base, Base → none
    pub parent: Option<LayerKey>,
    pub built_at: DateTime<Utc>,
    pub status: LayerStatus,
    /// Layer directory
    pub path: PathBuf,
}

/// Eviction and failure-memory settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    /// Upper bound on stored layers
    pub max_layers: usize,
    /// Layers unused for longer than this are evicted
    pub max_age: Option<Duration>,
    /// How long a failed build short-circuits retries
    pub failure_ttl: Duration,
    /// Bounded retries for storage I/O
    pub io_retries: u32,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for CachePolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            max_layers: config.max_layers,
            max_age: config.max_age_secs.map(Duration::from_secs),
            failure_ttl: Duration::from_secs(config.failure_ttl_secs),
            io_retries: config.io_retries,
        }
    }
}

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("layer {0} was evicted before it could be leased")]
    Evicted(LayerKey),

    #[error("corrupt layer record {path}: {reason}")]
    CorruptRecord { path: String, reason: String },

    #[error("identity error: {0}")]
    Domain(#[from] DomainError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
