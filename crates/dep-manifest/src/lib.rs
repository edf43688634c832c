//! dep-manifest: dependency manifests for patchbench environment layers
//!
//! Reads a repository snapshot's own dependency declarations at
//! Environment-build time, hashes them, and turns them into an install plan.
//!
//! ## Install plan selection
//!
//! Pinned declarations win over loose ones so that two builds of the same
//! commit resolve the same versions:
//! 1. pinned `requirements*.txt`
//! 2. `Pipfile.lock` (converted to pinned requirements)
//! 3. `poetry.lock`
//! 4. loose `requirements*.txt`
//! 5. `environment.yml` (conda prefix)
//! 6. `pyproject.toml` / `setup.py` (editable install of the project)
//!
//! Plan commands run from the repository root with `PATCHBENCH_DEPS` set to the
//! layer's dependency prefix.

pub mod detect;
pub mod error;
pub mod hash;

pub use detect::{
    detect_manifests, pinned_requirements_from_pipfile_lock, requirements_are_pinned,
    DetectedManifest, ManifestKind,
};
pub use error::ManifestError;
pub use hash::{hash_manifests, HashSource, ManifestHash};

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Result type for dep-manifest operations
pub type Result<T> = std::result::Result<T, ManifestError>;

/// Environment variable holding the dependency prefix inside plan commands
pub const DEPS_ENV: &str = "PATCHBENCH_DEPS";

/// A file the plan needs written into the dependency prefix before running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    /// File name relative to the dependency prefix
    pub name: String,
    pub content: String,
}

/// Commands that install a repository's declared dependencies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPlan {
    /// Manifest the plan was derived from (`None` when nothing was declared)
    pub manifest: Option<DetectedManifest>,
    pub generated: Vec<GeneratedFile>,
    pub commands: Vec<String>,
}

impl InstallPlan {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Pick the preferred manifest out of a detected set.
pub fn preferred_manifest(manifests: &[DetectedManifest]) -> Option<&DetectedManifest> {
    let pinned_req = manifests
        .iter()
        .find(|m| m.kind == ManifestKind::Requirements && m.pinned);
    if pinned_req.is_some() {
        return pinned_req;
    }

    for kind in [
        ManifestKind::PipfileLock,
        ManifestKind::PoetryLock,
        ManifestKind::Requirements,
        ManifestKind::CondaEnv,
        ManifestKind::Pyproject,
        ManifestKind::SetupPy,
    ] {
        if let Some(m) = manifests.iter().find(|m| m.kind == kind) {
            return Some(m);
        }
    }
    None
}

/// Build the install plan for the repository at `root`.
///
/// `python` is the interpreter used to create the dependency prefix.
pub fn plan_install(root: &Path, manifests: &[DetectedManifest], python: &str) -> Result<InstallPlan> {
    let Some(manifest) = preferred_manifest(manifests) else {
        warn!("No dependency manifest found in {:?}", root);
        return Ok(InstallPlan {
            manifest: None,
            generated: Vec::new(),
            commands: Vec::new(),
        });
    };

    let venv_python = format!("\"${DEPS_ENV}/bin/python\"");
    let create_venv = format!("{python} -m venv \"${DEPS_ENV}\"");
    let mut generated = Vec::new();

    let commands = match manifest.kind {
        ManifestKind::Requirements => vec![
            create_venv,
            format!("{venv_python} -m pip install -r {}", manifest.path.display()),
        ],
        ManifestKind::PipfileLock => {
            let content = std::fs::read_to_string(root.join(&manifest.path))?;
            let lines = pinned_requirements_from_pipfile_lock(&content)?;
            generated.push(GeneratedFile {
                name: "pipfile-requirements.txt".to_string(),
                content: lines.join("\n") + "\n",
            });
            vec![
                create_venv,
                format!("{venv_python} -m pip install -r \"${DEPS_ENV}/pipfile-requirements.txt\""),
            ]
        }
        ManifestKind::PoetryLock => vec![
            create_venv,
            format!("{venv_python} -m pip install poetry"),
            format!(
                "VIRTUAL_ENV=\"${DEPS_ENV}\" \"${DEPS_ENV}/bin/poetry\" install --no-root --no-interaction"
            ),
        ],
        ManifestKind::CondaEnv => vec![format!(
            "conda env create --prefix \"${DEPS_ENV}\" -f {}",
            manifest.path.display()
        )],
        ManifestKind::Pyproject | ManifestKind::SetupPy => {
            vec![create_venv, format!("{venv_python} -m pip install -e .")]
        }
    };

    info!(
        "Install plan from {} ({} command(s))",
        manifest.path.display(),
        commands.len()
    );
    Ok(InstallPlan {
        manifest: Some(manifest.clone()),
        generated,
        commands,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pinned_requirements_win_over_pyproject() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), "[project]\nname='x'\n").unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "six==1.16.0\n").unwrap();

        let found = detect_manifests(dir.path()).unwrap();
        let plan = plan_install(dir.path(), &found, "python3").unwrap();

        assert_eq!(plan.manifest.unwrap().kind, ManifestKind::Requirements);
        assert_eq!(plan.commands.len(), 2);
        assert!(plan.commands[0].starts_with("python3 -m venv"));
        assert!(plan.commands[1].contains("-r requirements.txt"));
    }

    #[test]
    fn test_pipfile_lock_beats_loose_requirements() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "six\n").unwrap();
        std::fs::write(
            dir.path().join("Pipfile.lock"),
            r#"{"default": {"six": {"version": "==1.16.0"}}}"#,
        )
        .unwrap();

        let found = detect_manifests(dir.path()).unwrap();
        let plan = plan_install(dir.path(), &found, "python3").unwrap();

        assert_eq!(plan.manifest.unwrap().kind, ManifestKind::PipfileLock);
        assert_eq!(plan.generated.len(), 1);
        assert_eq!(plan.generated[0].content, "six==1.16.0\n");
    }

    #[test]
    fn test_setup_py_editable_install() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("setup.py"), "from setuptools import setup\n").unwrap();

        let found = detect_manifests(dir.path()).unwrap();
        let plan = plan_install(dir.path(), &found, "python3").unwrap();
        assert!(plan.commands.last().unwrap().ends_with("pip install -e ."));
    }

    #[test]
    fn test_conda_environment_preferred_over_setup_py() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("setup.py"), "from setuptools import setup\n").unwrap();
        std::fs::write(dir.path().join("environment.yml"), "name: demo\n").unwrap();

        let found = detect_manifests(dir.path()).unwrap();
        let plan = plan_install(dir.path(), &found, "python3").unwrap();

        assert_eq!(plan.manifest.unwrap().kind, ManifestKind::CondaEnv);
        assert_eq!(
            plan.commands,
            vec!["conda env create --prefix \"$PATCHBENCH_DEPS\" -f environment.yml".to_string()]
        );
    }

    #[test]
    fn test_no_manifest_empty_plan() {
        let dir = tempdir().unwrap();
        let plan = plan_install(dir.path(), &[], "python3").unwrap();
        assert!(plan.is_empty());
        assert!(plan.manifest.is_none());
    }
}
