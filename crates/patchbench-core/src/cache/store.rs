use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tempfile::{NamedTempFile, TempDir};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CacheError, CachePolicy, Layer, LayerStatus, Result, LAYER_RECORD};
use crate::builder::{BuildError, BuildErrorKind};
use crate::domain::{LayerIdentity, LayerKey, LayerKind};
use crate::metrics::METRICS;
use crate::obs;

type BuildOutcome = std::result::Result<(Layer, Arc<LayerLease>), BuildError>;
type SharedBuild = Shared<BoxFuture<'static, BuildOutcome>>;

const STAGING_DIR: &str = ".staging";
const INSTANCES_DIR: &str = ".instances";

/// Handed to a build closure: where to build and when to stop.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Empty directory that becomes the layer directory on success
    pub staging: PathBuf,
    /// Where `staging` is renamed to; absolute paths baked into the build
    /// must point here
    pub target: PathBuf,
    /// Cancelled only when the cache shuts down, never by a single waiter
    pub cancel: CancellationToken,
}

struct Entry {
    layer: Layer,
    last_used: DateTime<Utc>,
}

struct InFlight {
    identity: LayerIdentity,
    started_at: DateTime<Utc>,
    result: SharedBuild,
}

struct FailedBuild {
    identity: LayerIdentity,
    at: Instant,
    failed_at: DateTime<Utc>,
    error: BuildError,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<LayerKey, Entry>,
    leases: HashMap<LayerKey, usize>,
    inflight: HashMap<LayerKey, InFlight>,
    failures: HashMap<LayerKey, FailedBuild>,
}

impl CacheState {
    /// Stored layer whose parent chain is still stored.
    fn live(&mut self, key: &LayerKey) -> Option<Layer> {
        let parent_ok = match &self.entries.get(key)?.layer.parent {
            Some(parent) => self.entries.contains_key(parent),
            None => true,
        };
        if !parent_ok {
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.last_used = Utc::now();
        Some(entry.layer.clone())
    }

    /// `key` plus every stored descendant.
    fn subtree(&self, key: &LayerKey) -> HashSet<LayerKey> {
        let mut set = HashSet::from([key.clone()]);
        loop {
            let before = set.len();
            for (k, entry) in &self.entries {
                if let Some(parent) = &entry.layer.parent {
                    if set.contains(parent) {
                        set.insert(k.clone());
                    }
                }
            }
            if set.len() == before {
                return set;
            }
        }
    }

    fn is_leased(&self, key: &LayerKey) -> bool {
        self.leases.get(key).copied().unwrap_or(0) > 0
    }

    /// Remove `key` and its descendants unless any of them is leased.
    fn remove_subtree(&mut self, key: &LayerKey) -> Option<Vec<Layer>> {
        let subtree = self.subtree(key);
        if subtree.iter().any(|k| self.is_leased(k)) {
            return None;
        }
        Some(
            subtree
                .iter()
                .filter_map(|k| self.entries.remove(k).map(|e| e.layer))
                .collect(),
        )
    }
}

/// Shared, persistent layer store with per-identity build deduplication.
///
/// Hold it in an `Arc`: builds run on detached tasks that keep the cache alive.
pub struct LayerCache {
    root: PathBuf,
    policy: CachePolicy,
    state: Arc<Mutex<CacheState>>,
    shutdown: CancellationToken,
}

impl LayerCache {
    /// Open (or create) the cache at `root` and re-index the stored layers.
    ///
    /// Leftover staging and instance directories from an interrupted run are
    /// removed, as are layers whose record is missing or unreadable and layers
    /// whose parent is gone.
    pub fn open(root: impl AsRef<Path>, policy: CachePolicy) -> Result<Arc<Self>> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        for scratch in [STAGING_DIR, INSTANCES_DIR] {
            let dir = root.join(scratch);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            std::fs::create_dir_all(&dir)?;
        }

        let mut state = CacheState::default();
        for kind in [LayerKind::Base, LayerKind::Environment] {
            let kind_dir = root.join(kind.as_str());
            std::fs::create_dir_all(&kind_dir)?;
            for dir_entry in std::fs::read_dir(&kind_dir)? {
                let dir = dir_entry?.path();
                if !dir.is_dir() {
                    continue;
                }
                match read_record(&dir, kind) {
                    Ok(layer) => {
                        let last_used = layer.built_at;
                        state
                            .entries
                            .insert(layer.key.clone(), Entry { layer, last_used });
                    }
                    Err(e) => {
                        warn!("Discarding unreadable layer {}: {}", dir.display(), e);
                        std::fs::remove_dir_all(&dir)?;
                    }
                }
            }
        }

        let orphans: Vec<LayerKey> = state
            .entries
            .iter()
            .filter(|(_, e)| {
                e.layer
                    .parent
                    .as_ref()
                    .is_some_and(|p| !state.entries.contains_key(p))
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in orphans {
            for layer in state.remove_subtree(&key).unwrap_or_default() {
                warn!("Discarding orphaned layer {}", layer.key);
                std::fs::remove_dir_all(&layer.path)?;
            }
        }

        info!(
            "Opened layer cache at {} ({} layer(s))",
            root.display(),
            state.entries.len()
        );
        Ok(Arc::new(Self {
            root,
            policy,
            state: Arc::new(Mutex::new(state)),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Scratch directory for ephemeral Instance layers.
    pub fn instances_dir(&self) -> PathBuf {
        self.root.join(INSTANCES_DIR)
    }

    fn layer_dir(&self, key: &LayerKey) -> PathBuf {
        self.root.join(key.kind.as_str()).join(&key.digest)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stored layer for `identity`, or `None` when it (or its parent) is missing.
    pub fn resolve(&self, identity: &LayerIdentity) -> Result<Option<Layer>> {
        let key = identity.key()?;
        Ok(self.lock().live(&key))
    }

    /// Resolve `identity`, building it with `build` when missing.
    ///
    /// At most one build per identity is in flight; concurrent callers wait
    /// on the same build and receive the same `Layer`. The build runs on a
    /// detached task, so dropping this future does not cancel it. A failed
    /// build is remembered for `failure_ttl` and returned to callers without
    /// rebuilding.
    pub async fn get_or_build<F, Fut>(self: &Arc<Self>, identity: LayerIdentity, build: F) -> Result<Layer>
    where
        F: FnOnce(BuildContext) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BuildError>> + Send + 'static,
    {
        let (layer, _lease) = self.acquire(identity, build).await?;
        Ok(layer)
    }

    /// `get_or_build` returning the layer already leased.
    ///
    /// The lease is taken under the same lock as the cache hit or the store,
    /// so a concurrent `evict` can never remove the layer in between.
    pub async fn acquire<F, Fut>(
        self: &Arc<Self>,
        identity: LayerIdentity,
        build: F,
    ) -> Result<(Layer, LayerLease)>
    where
        F: FnOnce(BuildContext) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BuildError>> + Send + 'static,
    {
        let key = identity.key()?;
        let shared = {
            let mut state = self.lock();
            if let Some(layer) = state.live(&key) {
                METRICS.inc_cache_hits();
                debug!("Cache hit for {}", key);
                let lease = self.lease_locked(&mut state, &key);
                return Ok((layer, lease));
            }
            if let Some(failed) = state.failures.get(&key) {
                if failed.at.elapsed() < self.policy.failure_ttl {
                    debug!("Cached failure for {}", key);
                    return Err(CacheError::Build(failed.error.clone()));
                }
                state.failures.remove(&key);
            }
            if let Some(inflight) = state.inflight.get(&key) {
                METRICS.inc_dedup_waits();
                debug!("Joining in-flight build of {}", key);
                inflight.result.clone()
            } else {
                let cache = Arc::clone(self);
                let task_identity = identity.clone();
                let task_key = key.clone();
                let handle = tokio::spawn(async move {
                    cache.run_build(task_identity, task_key, build).await
                });
                let kind = key.kind;
                let result: SharedBuild = async move {
                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(BuildError::new(
                            kind,
                            "task",
                            BuildErrorKind::Permanent,
                            format!("build task failed: {e}"),
                        )),
                    }
                }
                .boxed()
                .shared();
                state.inflight.insert(
                    key.clone(),
                    InFlight {
                        identity,
                        started_at: Utc::now(),
                        result: result.clone(),
                    },
                );
                result
            }
        };
        let (layer, build_lease) = shared.await.map_err(CacheError::Build)?;
        // The build's lease pins the layer until this caller holds its own.
        let lease = self
            .lease(&layer.key)
            .ok_or_else(|| CacheError::Evicted(layer.key.clone()))?;
        drop(build_lease);
        Ok((layer, lease))
    }

    /// Protect a stored layer from eviction until the lease is dropped.
    pub fn lease(&self, key: &LayerKey) -> Option<LayerLease> {
        let mut state = self.lock();
        if !state.entries.contains_key(key) {
            return None;
        }
        Some(self.lease_locked(&mut state, key))
    }

    fn lease_locked(&self, state: &mut CacheState, key: &LayerKey) -> LayerLease {
        *state.leases.entry(key.clone()).or_insert(0) += 1;
        LayerLease {
            state: Arc::clone(&self.state),
            key: key.clone(),
        }
    }

    async fn run_build<F, Fut>(self: Arc<Self>, identity: LayerIdentity, key: LayerKey, build: F) -> BuildOutcome
    where
        F: FnOnce(BuildContext) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BuildError>> + Send + 'static,
    {
        let started = Instant::now();
        let kind = key.kind;
        let failure_identity = identity.clone();
        info!("Building layer {}", key);

        let outcome = match self.staging_dir(kind) {
            Err(e) => Err(BuildError::io(kind, "staging", &e)),
            Ok(staging) => {
                let ctx = BuildContext {
                    staging: staging.path().to_path_buf(),
                    target: self.layer_dir(&key),
                    cancel: self.shutdown.child_token(),
                };
                match build(ctx).await {
                    Ok(()) => match self.store_leased(identity, staging).await {
                        Ok((layer, lease)) => Ok((layer, Arc::new(lease))),
                        Err(e) => Err(BuildError::new(kind, "store", BuildErrorKind::Io, e.to_string())),
                    },
                    Err(e) => Err(e),
                }
            }
        };

        let mut state = self.lock();
        state.inflight.remove(&key);
        match &outcome {
            Ok((layer, _)) => {
                METRICS.inc_layers_built();
                obs::emit_layer_built(&layer.key, started.elapsed().as_millis() as u64);
            }
            Err(e) => {
                warn!("Build of {} failed: {}", key, e);
                if e.is_cacheable() {
                    state.failures.insert(
                        key.clone(),
                        FailedBuild {
                            identity: failure_identity,
                            at: Instant::now(),
                            failed_at: Utc::now(),
                            error: e.clone(),
                        },
                    );
                }
            }
        }
        outcome
    }

    fn staging_dir(&self, kind: LayerKind) -> std::io::Result<TempDir> {
        let staging_root = self.root.join(STAGING_DIR);
        std::fs::create_dir_all(&staging_root)?;
        tempfile::Builder::new()
            .prefix(&format!("{}-", kind.as_str()))
            .tempdir_in(staging_root)
    }

    /// Move a completed build from `staging` into the store.
    pub async fn store(&self, identity: LayerIdentity, staging: TempDir) -> Result<Layer> {
        let (layer, _lease) = self.store_leased(identity, staging).await?;
        Ok(layer)
    }

    async fn store_leased(&self, identity: LayerIdentity, staging: TempDir) -> Result<(Layer, LayerLease)> {
        let key = identity.key()?;
        let final_dir = self.layer_dir(&key);
        let layer = Layer {
            parent: identity.parent_key()?,
            identity,
            key: key.clone(),
            built_at: Utc::now(),
            status: LayerStatus::Built,
            path: final_dir.clone(),
        };

        let record = serde_json::to_vec_pretty(&layer).map_err(|e| CacheError::CorruptRecord {
            path: final_dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let staging_path = staging.path().to_path_buf();
        self.retry_io("write layer record", || {
            let mut tmp = NamedTempFile::new_in(&staging_path)?;
            tmp.write_all(&record)?;
            tmp.persist(staging_path.join(LAYER_RECORD))
                .map_err(|e| e.error)?;
            Ok(())
        })
        .await?;

        self.retry_io("rename layer into place", || {
            if final_dir.exists() {
                std::fs::remove_dir_all(&final_dir)?;
            }
            if let Some(parent) = final_dir.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&staging_path, &final_dir)
        })
        .await?;
        // `staging` now points at a moved directory; dropping it is a no-op.
        drop(staging);

        let mut state = self.lock();
        state.entries.insert(
            key.clone(),
            Entry {
                layer: layer.clone(),
                last_used: Utc::now(),
            },
        );
        let lease = self.lease_locked(&mut state, &key);
        Ok((layer, lease))
    }

    async fn retry_io<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> std::io::Result<T>,
    ) -> std::io::Result<T> {
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.policy.io_retries => {
                    attempt += 1;
                    warn!("{} failed (attempt {}): {}", what, attempt, e);
                    tokio::time::sleep(Duration::from_millis(50 * 2u64.pow(attempt - 1))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply the eviction policy. Returns the evicted keys.
    ///
    /// Expired layers go first, then least-recently-used layers until the
    /// store fits `max_layers`; Base layers are only chosen when nothing else
    /// can go. Evicting a layer evicts its descendants, and a layer whose
    /// subtree holds a lease is never evicted.
    pub async fn evict(&self) -> Result<Vec<LayerKey>> {
        let mut victims: Vec<(Layer, &'static str)> = Vec::new();
        {
            let mut state = self.lock();

            if let Some(max_age) = self.policy.max_age {
                let max_age = chrono::Duration::from_std(max_age)
                    .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
                let now = Utc::now();
                let mut expired: Vec<(DateTime<Utc>, LayerKey)> = state
                    .entries
                    .iter()
                    .filter(|(_, e)| now - e.last_used > max_age)
                    .map(|(k, e)| (e.last_used, k.clone()))
                    .collect();
                expired.sort();
                for (_, key) in expired {
                    if !state.entries.contains_key(&key) {
                        continue;
                    }
                    if let Some(removed) = state.remove_subtree(&key) {
                        victims.extend(removed.into_iter().map(|l| (l, "expired")));
                    }
                }
            }

            while state.entries.len() > self.policy.max_layers {
                let mut candidates: Vec<(bool, DateTime<Utc>, LayerKey)> = state
                    .entries
                    .iter()
                    .map(|(k, e)| (k.kind == LayerKind::Base, e.last_used, k.clone()))
                    .collect();
                candidates.sort();

                let removed = candidates
                    .iter()
                    .find_map(|(_, _, key)| state.remove_subtree(key));
                match removed {
                    Some(layers) => victims.extend(layers.into_iter().map(|l| (l, "lru"))),
                    None => {
                        warn!("Cache over capacity but every remaining layer is leased");
                        break;
                    }
                }
            }
        }

        let mut evicted = Vec::with_capacity(victims.len());
        for (layer, reason) in victims {
            let path = layer.path.clone();
            self.retry_io("remove layer", || match std::fs::remove_dir_all(&path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            })
            .await?;
            METRICS.inc_evictions();
            obs::emit_layer_evicted(&layer.key, reason);
            evicted.push(layer.key);
        }
        Ok(evicted)
    }

    /// Stored layers plus in-flight builds (`Pending`) and remembered
    /// failures (`Failed`), sorted by key.
    pub fn list(&self) -> Vec<Layer> {
        let state = self.lock();
        let mut layers: Vec<Layer> = state.entries.values().map(|e| e.layer.clone()).collect();

        for (key, inflight) in &state.inflight {
            layers.push(self.placeholder(key, &inflight.identity, inflight.started_at, LayerStatus::Pending));
        }
        for (key, failed) in &state.failures {
            if failed.at.elapsed() < self.policy.failure_ttl {
                layers.push(self.placeholder(key, &failed.identity, failed.failed_at, LayerStatus::Failed));
            }
        }
        layers.sort_by(|a, b| a.key.cmp(&b.key));
        layers
    }

    fn placeholder(
        &self,
        key: &LayerKey,
        identity: &LayerIdentity,
        at: DateTime<Utc>,
        status: LayerStatus,
    ) -> Layer {
        Layer {
            identity: identity.clone(),
            key: key.clone(),
            parent: identity.parent_key().ok().flatten(),
            built_at: at,
            status,
            path: self.layer_dir(key),
        }
    }

    /// Number of stored layers.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every in-flight build. Used on process shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn read_record(dir: &Path, kind: LayerKind) -> Result<Layer> {
    let record_path = dir.join(LAYER_RECORD);
    let corrupt = |reason: String| CacheError::CorruptRecord {
        path: record_path.display().to_string(),
        reason,
    };
    let bytes = std::fs::read(&record_path).map_err(|e| corrupt(e.to_string()))?;
    let mut layer: Layer = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;

    let key = layer.identity.key()?;
    let dir_name = dir.file_name().map(|n| n.to_string_lossy().to_string());
    if key != layer.key || key.kind != kind || dir_name.as_deref() != Some(key.digest.as_str()) {
        return Err(corrupt("identity does not match its location".to_string()));
    }
    layer.path = dir.to_path_buf();
    layer.status = LayerStatus::Built;
    Ok(layer)
}

/// RAII guard marking a stored layer as in use.
pub struct LayerLease {
    state: Arc<Mutex<CacheState>>,
    key: LayerKey,
}

impl LayerLease {
    pub fn key(&self) -> &LayerKey {
        &self.key
    }
}

impl Drop for LayerLease {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = state.leases.get_mut(&self.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.leases.remove(&self.key);
            }
        }
    }
}

impl std::fmt::Debug for LayerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerLease").field("key", &self.key).finish()
    }
}
