//! Layer builder.
//!
//! Each layer is derived from its parent by a recipe:
//! - Base: probe the tool set, record `tools.json`, run setup commands
//! - Environment: check out `repo/` at the commit, apply environment patches,
//!   install dependencies into `deps/`, record `env.json`
//! - Instance: copy the Environment's `repo/`, install extras into `extras/`,
//!   write `run_tests.sh`, then apply the data point's patches. Source roots
//!   the Environment installed in editable mode are redirected to the copy,
//!   so tests import the patched tree.
//!
//! Base and Environment layers go through the [`LayerCache`]; Instance layers
//! are ephemeral directories owned by one evaluation.

pub mod error;
pub mod steps;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use error::{classify_failure, BuildError, BuildErrorKind};
pub use steps::StepRunner;

use crate::cache::{BuildContext, CacheError, Layer, LayerCache, LayerLease};
use crate::config::{BaseConfig, BuildConfig};
use crate::domain::digest::compute_digest;
use crate::domain::{
    BaseIdentity, DataPointDescriptor, EnvironmentIdentity, InstanceIdentity, LayerIdentity,
    LayerKey, LayerKind,
};
use crate::git::clone_at_commit;
use crate::patch::{PatchApplicator, PatchOutcome};
use crate::profile::{shell_escape, RepoProfile};
use crate::sandbox::RunRequest;
use steps::{editable_source_roots, relocate_prefix};

pub const REPO_DIR: &str = "repo";
pub const DEPS_DIR: &str = "deps";
pub const EXTRAS_DIR: &str = "extras";
pub const BUILD_LOG: &str = "build.log";
pub const TOOLS_RECORD: &str = "tools.json";
pub const ENV_RECORD: &str = "env.json";
pub const RUN_SCRIPT: &str = "run_tests.sh";

/// Extras install used when the profile does not set one; package specs
/// are appended.
pub const DEFAULT_EXTRAS_INSTALL: &str =
    "\"$PATCHBENCH_PYTHON\" -m pip install --no-input --target \"$PATCHBENCH_EXTRAS\"";

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Inputs of an Environment recipe that the cache closure owns.
#[derive(Debug, Clone)]
struct EnvironmentRecipe {
    repo: String,
    source_url: String,
    commit: String,
    env_patches: Vec<String>,
    install: Option<Vec<String>>,
    base_path: PathBuf,
}

/// Builds Base and Environment layers through the cache and ephemeral
/// Instance layers for single evaluations.
#[derive(Debug, Clone)]
pub struct LayerBuilder {
    base: BaseConfig,
    build: BuildConfig,
    patcher: PatchApplicator,
    base_identity: Arc<OnceCell<BaseIdentity>>,
}

impl LayerBuilder {
    pub fn new(base: BaseConfig, build: BuildConfig) -> Self {
        Self {
            base,
            build,
            patcher: PatchApplicator::new(),
            base_identity: Arc::new(OnceCell::new()),
        }
    }

    /// Identity of the Base layer: the resolved tool versions plus the setup
    /// commands. Probed once per builder.
    pub async fn base_identity(&self) -> Result<BaseIdentity, BuildError> {
        self.base_identity
            .get_or_try_init(|| async {
                let mut tools = BTreeMap::new();
                for spec in &self.base.tools {
                    let (name, wanted) = match spec.split_once('=') {
                        Some((name, version)) => (name.trim(), Some(version.trim())),
                        None => (spec.trim(), None),
                    };
                    let version = probe_tool(name).await?;
                    if let Some(wanted) = wanted {
                        if !version.contains(wanted) {
                            return Err(BuildError::new(
                                LayerKind::Base,
                                format!("probe {name}"),
                                BuildErrorKind::Permanent,
                                format!("{name} is `{version}`, expected {wanted}"),
                            ));
                        }
                    }
                    tools.insert(name.to_string(), version);
                }
                Ok::<_, BuildError>(BaseIdentity::new(tools, &self.base.setup))
            })
            .await
            .cloned()
    }

    /// Resolve or build the Base layer and lease it.
    pub async fn ensure_base(
        &self,
        cache: &Arc<LayerCache>,
    ) -> Result<(Layer, LayerLease), CacheError> {
        let identity = self.base_identity().await?;
        let builder = self.clone();
        let recipe = identity.clone();
        cache
            .acquire(LayerIdentity::Base(identity), move |ctx| async move {
                builder.build_base(ctx, recipe).await
            })
            .await
    }

    async fn build_base(&self, ctx: BuildContext, identity: BaseIdentity) -> Result<(), BuildError> {
        let stage = LayerKind::Base;
        let bin = ctx.staging.join("bin");
        std::fs::create_dir_all(&bin).map_err(|e| BuildError::io(stage, "layout", &e))?;
        write_json(stage, &ctx.staging.join(TOOLS_RECORD), &identity.tools)?;

        let runner = StepRunner::new(stage, &self.build, ctx.cancel.clone())
            .with_log(ctx.staging.join(BUILD_LOG))
            .with_env("PATCHBENCH_BASE", ctx.staging.to_string_lossy());
        for command in &self.base.setup {
            runner.shell("setup", &ctx.staging, command).await?;
        }
        relocate_prefix(&bin, &ctx.staging, &ctx.target)
            .map_err(|e| BuildError::io(stage, "relocate", &e))?;
        Ok(())
    }

    /// Identity of the Environment for `descriptor` on top of `base`.
    ///
    /// The manifests themselves are fixed by the commit; the digest covers
    /// the recipe inputs the snapshot does not carry.
    pub async fn environment_identity(
        &self,
        base: &Layer,
        descriptor: &DataPointDescriptor,
        profile: &RepoProfile,
    ) -> Result<EnvironmentIdentity, BuildError> {
        let env_patches = read_env_patches(profile).await?;
        self.environment_identity_with(base, descriptor, profile, &env_patches)
    }

    fn environment_identity_with(
        &self,
        base: &Layer,
        descriptor: &DataPointDescriptor,
        profile: &RepoProfile,
        env_patches: &[String],
    ) -> Result<EnvironmentIdentity, BuildError> {
        let inputs = serde_json::json!({
            "install": profile.install,
            "env_patches": env_patches,
            "python": self.build.python,
        });
        let manifest_digest = compute_digest(&inputs).map_err(|e| {
            BuildError::new(LayerKind::Environment, "identity", BuildErrorKind::Permanent, e.to_string())
        })?;
        Ok(EnvironmentIdentity {
            base_digest: base.key.digest.clone(),
            repo: descriptor.repo.clone(),
            commit: descriptor.base_commit.clone(),
            manifest_digest,
        })
    }

    /// Resolve or build the Environment layer for `descriptor` and lease it.
    pub async fn ensure_environment(
        &self,
        cache: &Arc<LayerCache>,
        base: &Layer,
        descriptor: &DataPointDescriptor,
        profile: &RepoProfile,
    ) -> Result<(Layer, LayerLease), CacheError> {
        let env_patches = read_env_patches(profile).await?;
        let identity = self.environment_identity_with(base, descriptor, profile, &env_patches)?;
        let recipe = EnvironmentRecipe {
            repo: descriptor.repo.clone(),
            source_url: profile.source_url(),
            commit: descriptor.base_commit.clone(),
            env_patches,
            install: profile.install.clone(),
            base_path: base.path.clone(),
        };
        let builder = self.clone();
        cache
            .acquire(LayerIdentity::Environment(identity), move |ctx| async move {
                builder.build_environment(ctx, recipe).await
            })
            .await
    }

    async fn build_environment(
        &self,
        ctx: BuildContext,
        recipe: EnvironmentRecipe,
    ) -> Result<(), BuildError> {
        let stage = LayerKind::Environment;
        let repo = ctx.staging.join(REPO_DIR);
        let deps = ctx.staging.join(DEPS_DIR);
        let runner = StepRunner::new(stage, &self.build, ctx.cancel.clone())
            .with_log(ctx.staging.join(BUILD_LOG));

        runner
            .step("checkout", || checkout(&runner, &recipe.source_url, &repo, &recipe.commit))
            .await?;
        info!("Checked out {} at {}", recipe.repo, recipe.commit);

        for (i, patch) in recipe.env_patches.iter().enumerate() {
            match self.patcher.apply(&repo, patch).await {
                Ok(PatchOutcome::Applied { .. }) => {}
                Ok(PatchOutcome::Conflict { reason }) => {
                    return Err(runner.error(
                        "env_patch",
                        BuildErrorKind::Permanent,
                        format!("environment patch #{i} does not apply: {reason}"),
                    ));
                }
                Err(e) => return Err(runner.error("env_patch", BuildErrorKind::Io, e.to_string())),
            }
        }

        let manifest_error =
            |e: dep_manifest::ManifestError| runner.error("manifest", BuildErrorKind::Permanent, e.to_string());
        let manifests = dep_manifest::detect_manifests(&repo).map_err(manifest_error)?;
        let manifest_hash = dep_manifest::hash_manifests(&repo, &manifests).map_err(manifest_error)?;

        std::fs::create_dir_all(&deps).map_err(|e| runner.io_error("layout", &e))?;
        let commands = match &recipe.install {
            Some(commands) => commands.clone(),
            None => {
                let plan = dep_manifest::plan_install(&repo, &manifests, &self.build.python)
                    .map_err(manifest_error)?;
                for file in &plan.generated {
                    std::fs::write(deps.join(&file.name), &file.content)
                        .map_err(|e| runner.io_error("install", &e))?;
                }
                plan.commands
            }
        };
        write_json(
            stage,
            &ctx.staging.join(ENV_RECORD),
            &serde_json::json!({
                "repo": recipe.repo,
                "commit": recipe.commit,
                "manifests": manifests,
                "manifest_hash": manifest_hash,
                "install": commands,
            }),
        )?;

        let runner = runner
            .with_env(dep_manifest::DEPS_ENV, deps.to_string_lossy())
            .with_env("PATCHBENCH_BASE", recipe.base_path.to_string_lossy())
            .with_env("PATH", search_path(&[deps.join("bin"), recipe.base_path.join("bin")]));
        for command in &commands {
            runner.shell("install", &repo, command).await?;
        }

        let relocated = relocate_prefix(&deps, &ctx.staging, &ctx.target)
            .map_err(|e| runner.io_error("relocate", &e))?;
        debug!("Relocated {} file(s) in {}", relocated, deps.display());
        Ok(())
    }

    /// Build the ephemeral Instance layer for `descriptor` under
    /// `instances_dir`: copy of the Environment's tree, extras, test script.
    /// The patch is applied separately by [`LayerBuilder::apply_patch`].
    #[allow(clippy::too_many_arguments)]
    pub async fn build_instance(
        &self,
        instances_dir: &Path,
        base: &Layer,
        environment: &Layer,
        descriptor: &DataPointDescriptor,
        profile: &RepoProfile,
        golden: bool,
        cancel: &CancellationToken,
    ) -> Result<InstanceLayer, BuildError> {
        let stage = LayerKind::Instance;
        let LayerIdentity::Environment(env_identity) = &environment.identity else {
            return Err(BuildError::new(
                stage,
                "identity",
                BuildErrorKind::Permanent,
                format!("parent {} is not an environment layer", environment.key),
            ));
        };
        let identity = InstanceIdentity::new(
            env_identity.clone(),
            descriptor.selected_patch(golden),
            descriptor.test_patch.as_deref(),
            &descriptor.extra_dependencies,
        );
        let key = LayerIdentity::Instance(identity.clone())
            .key()
            .map_err(|e| BuildError::new(stage, "identity", BuildErrorKind::Permanent, e.to_string()))?;

        std::fs::create_dir_all(instances_dir).map_err(|e| BuildError::io(stage, "layout", &e))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", descriptor.instance_id))
            .tempdir_in(instances_dir)
            .map_err(|e| BuildError::io(stage, "layout", &e))?;
        let root = dir.path().to_path_buf();
        let repo = root.join(REPO_DIR);
        let extras = root.join(EXTRAS_DIR);
        let env_deps = environment.path.join(DEPS_DIR);

        let runner = StepRunner::new(stage, &self.build, cancel.clone()).with_log(root.join(BUILD_LOG));
        let copy = format!(
            "cp -a {} {}",
            shell_escape(&environment.path.join(REPO_DIR).to_string_lossy()),
            shell_escape(&repo.to_string_lossy())
        );
        runner.shell("copy", &root, &copy).await?;
        std::fs::create_dir_all(&extras).map_err(|e| runner.io_error("layout", &e))?;

        if !descriptor.extra_dependencies.is_empty() {
            let venv_python = env_deps.join("bin").join("python");
            let python = if venv_python.exists() {
                venv_python.to_string_lossy().to_string()
            } else {
                self.build.python.clone()
            };
            let prefix = profile.extras_install.as_deref().unwrap_or(DEFAULT_EXTRAS_INSTALL);
            let specs: Vec<String> = descriptor.extra_dependencies.iter().map(|d| shell_escape(d)).collect();
            let command = format!("{} {}", prefix, specs.join(" "));
            runner
                .clone()
                .with_env("PATCHBENCH_PYTHON", python)
                .with_env("PATCHBENCH_EXTRAS", extras.to_string_lossy())
                .shell("extras", &repo, &command)
                .await?;
        }

        // Editable installs point at the Environment's shared tree.
        let source_roots: Vec<PathBuf> = editable_source_roots(&env_deps, &environment.path.join(REPO_DIR))
            .map_err(|e| runner.io_error("source_roots", &e))?
            .into_iter()
            .filter(|relative| !relative.as_os_str().is_empty())
            .map(|relative| repo.join(relative))
            .collect();
        if !source_roots.is_empty() {
            debug!("Redirecting editable sources to {:?}", source_roots);
        }

        let expected = descriptor.expected_tests();
        let ids: Vec<String> = expected.all().cloned().collect::<BTreeSet<_>>().into_iter().collect();
        let test_command = profile.test_command(&ids, descriptor.test_patch.as_deref());
        let script = run_script(
            &repo,
            &source_roots,
            &extras,
            &env_deps,
            &base.path.join("bin"),
            &test_command,
        );
        std::fs::write(root.join(RUN_SCRIPT), script).map_err(|e| runner.io_error("script", &e))?;

        debug!("Instance layer {} ready at {}", key, root.display());
        Ok(InstanceLayer {
            identity,
            key,
            dir,
            read_only: vec![base.path.clone(), environment.path.clone()],
            test_command,
        })
    }

    /// Apply the selected patch, then the test patch, to `instance`.
    ///
    /// A hunk that does not apply is a `Conflict` build error; the tree is
    /// left as it was before that patch.
    pub async fn apply_patch(
        &self,
        instance: &InstanceLayer,
        descriptor: &DataPointDescriptor,
        golden: bool,
    ) -> Result<Vec<String>, BuildError> {
        let repo = instance.repo_dir();
        let mut touched = self
            .apply_one(&repo, "apply_patch", descriptor.selected_patch(golden))
            .await?;
        if let Some(test_patch) = descriptor.test_patch.as_deref().filter(|p| !p.trim().is_empty()) {
            touched.extend(self.apply_one(&repo, "apply_test_patch", test_patch).await?);
        }
        Ok(touched)
    }

    async fn apply_one(&self, repo: &Path, step: &str, patch: &str) -> Result<Vec<String>, BuildError> {
        let stage = LayerKind::Instance;
        match self.patcher.apply(repo, patch).await {
            Ok(PatchOutcome::Applied { files }) => Ok(files),
            Ok(PatchOutcome::Conflict { reason }) => {
                Err(BuildError::new(stage, step, BuildErrorKind::Conflict, reason))
            }
            Err(e) => Err(BuildError::new(stage, step, BuildErrorKind::Io, e.to_string())),
        }
    }
}

/// An Instance layer: private to one evaluation, removed on [`close`].
///
/// [`close`]: InstanceLayer::close
#[derive(Debug)]
pub struct InstanceLayer {
    pub identity: InstanceIdentity,
    pub key: LayerKey,
    dir: TempDir,
    read_only: Vec<PathBuf>,
    pub test_command: String,
}

impl InstanceLayer {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.dir.path().join(REPO_DIR)
    }

    /// Sandbox request running the materialized test script.
    pub fn run_request(&self) -> RunRequest {
        let script = self.dir.path().join(RUN_SCRIPT);
        RunRequest {
            root: self.dir.path().to_path_buf(),
            workdir: self.repo_dir(),
            command: format!("sh {}", shell_escape(&script.to_string_lossy())),
            env: Vec::new(),
            read_only: self.read_only.clone(),
        }
    }

    /// Delete the layer directory.
    pub fn close(self) -> std::io::Result<()> {
        self.dir.close()
    }
}

async fn probe_tool(name: &str) -> Result<String, BuildError> {
    let step = format!("probe {name}");
    let probe = Command::new(name)
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(BuildError::new(
                LayerKind::Base,
                step,
                BuildErrorKind::Permanent,
                format!("{name} is not available: {e}"),
            ))
        }
        Err(_) => {
            return Err(BuildError::new(
                LayerKind::Base,
                step,
                BuildErrorKind::Timeout,
                format!("{name} --version did not return"),
            ))
        }
    };
    // Some tools print their version on stderr.
    let text = if output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).into_owned()
    } else {
        String::from_utf8_lossy(&output.stdout).into_owned()
    };
    let line = text.lines().next().unwrap_or_default().trim();
    Ok(if line.is_empty() { "unknown".to_string() } else { line.to_string() })
}

async fn read_env_patches(profile: &RepoProfile) -> Result<Vec<String>, BuildError> {
    let mut patches = Vec::with_capacity(profile.env_patches.len());
    for path in &profile.env_patches {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            BuildError::new(
                LayerKind::Environment,
                "env_patch",
                BuildErrorKind::Permanent,
                format!("cannot read {}: {e}", path.display()),
            )
        })?;
        patches.push(content);
    }
    Ok(patches)
}

async fn checkout(runner: &StepRunner, source: &str, dest: &Path, commit: &str) -> Result<(), BuildError> {
    // A failed attempt may leave a partial clone behind.
    if dest.exists() {
        tokio::fs::remove_dir_all(dest)
            .await
            .map_err(|e| runner.io_error("checkout", &e))?;
    }
    clone_at_commit(source, dest, commit)
        .await
        .map_err(|e| runner.error("checkout", classify_failure(&e.stderr), e.to_string()))
}

fn write_json<T: serde::Serialize>(stage: LayerKind, path: &Path, value: &T) -> Result<(), BuildError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| BuildError::new(stage, "record", BuildErrorKind::Permanent, e.to_string()))?;
    std::fs::write(path, bytes).map_err(|e| BuildError::io(stage, "record", &e))
}

/// `dirs` prepended to the inherited PATH.
fn search_path(dirs: &[PathBuf]) -> String {
    let mut parts: Vec<String> = dirs.iter().map(|d| d.to_string_lossy().to_string()).collect();
    if let Ok(inherited) = std::env::var("PATH") {
        parts.push(inherited);
    }
    parts.join(":")
}

/// `run_tests.sh` for an instance. `source_roots` come first on
/// `PYTHONPATH` so they shadow editable installs of the Environment's tree.
fn run_script(
    repo: &Path,
    source_roots: &[PathBuf],
    extras: &Path,
    deps: &Path,
    base_bin: &Path,
    test_command: &str,
) -> String {
    let q = |p: &Path| shell_escape(&p.to_string_lossy());
    let mut script = String::from("#!/bin/sh\n");
    script.push_str(&format!(
        "PATH={}:{}:{}:\"$PATH\"\nexport PATH\n",
        q(&extras.join("bin")),
        q(&deps.join("bin")),
        q(base_bin)
    ));
    let python_path: Vec<String> = source_roots
        .iter()
        .map(|root| q(root.as_path()))
        .chain([q(repo), q(extras)])
        .collect();
    script.push_str(&format!(
        "PYTHONPATH={}${{PYTHONPATH:+:$PYTHONPATH}}\nexport PYTHONPATH\n",
        python_path.join(":")
    ));
    if deps.join("bin").join("python").exists() {
        script.push_str(&format!("VIRTUAL_ENV={}\nexport VIRTUAL_ENV\n", q(deps)));
    }
    script.push_str(&format!("cd {} || exit 127\n", q(repo)));
    script.push_str(test_command);
    script.push('\n');
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_script_prefers_instance_sources() {
        let script = run_script(
            Path::new("/i/repo"),
            &[],
            Path::new("/i/extras"),
            Path::new("/e/deps"),
            Path::new("/b/bin"),
            "pytest -rA tests/test_x.py",
        );
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("PATH=/i/extras/bin:/e/deps/bin:/b/bin:\"$PATH\""));
        assert!(script.contains("PYTHONPATH=/i/repo:/i/extras"));
        assert!(!script.contains("VIRTUAL_ENV"));
        assert!(script.trim_end().ends_with("pytest -rA tests/test_x.py"));
    }

    #[test]
    fn run_script_puts_source_roots_first() {
        let script = run_script(
            Path::new("/i/repo"),
            &[PathBuf::from("/i/repo/src")],
            Path::new("/i/extras"),
            Path::new("/e/deps"),
            Path::new("/b/bin"),
            "pytest",
        );
        assert!(script.contains("PYTHONPATH=/i/repo/src:/i/repo:/i/extras${PYTHONPATH:+:$PYTHONPATH}"));
    }

    #[tokio::test]
    async fn base_identity_records_probed_versions() {
        let builder = LayerBuilder::new(
            BaseConfig {
                tools: vec!["git".to_string()],
                setup: vec!["true".to_string()],
            },
            BuildConfig::default(),
        );
        let identity = builder.base_identity().await.unwrap();
        assert!(identity.tools["git"].starts_with("git version"));
        assert_eq!(builder.base_identity().await.unwrap(), identity);
    }

    #[tokio::test]
    async fn missing_tool_is_permanent_base_error() {
        let builder = LayerBuilder::new(
            BaseConfig {
                tools: vec!["patchbench-no-such-tool".to_string()],
                setup: Vec::new(),
            },
            BuildConfig::default(),
        );
        let err = builder.base_identity().await.unwrap_err();
        assert_eq!(err.stage, LayerKind::Base);
        assert_eq!(err.kind, BuildErrorKind::Permanent);
    }

    #[tokio::test]
    async fn pinned_tool_version_is_checked() {
        let builder = LayerBuilder::new(
            BaseConfig {
                tools: vec!["git=0.0.0-never".to_string()],
                setup: Vec::new(),
            },
            BuildConfig::default(),
        );
        assert!(builder.base_identity().await.is_err());
    }
}
