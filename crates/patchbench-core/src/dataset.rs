//! Data points on disk (`<dir>/<name>.json`) and the predictions JSONL
//! handed to downstream harnesses.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::DataPointDescriptor;

pub const DEFAULT_DATA_POINTS_DIR: &str = "data_points";
pub const DEFAULT_MODEL_NAME: &str = "gpt-4";

/// Loads data-point descriptors from a directory of JSON files.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataPointLoader;

impl DataPointLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load `names` from `dir` (`.json` appended when missing), or every
    /// `*.json` file when `names` is `None`.
    ///
    /// Missing, unreadable and invalid files are logged and skipped; a
    /// missing directory yields no data points.
    pub fn load_by_files(&self, dir: &Path, names: Option<&[String]>) -> Vec<DataPointDescriptor> {
        info!("Loading data points from {}", dir.display());
        if !dir.is_dir() {
            warn!("Data points directory does not exist: {}", dir.display());
            return Vec::new();
        }

        let files = match names {
            Some(names) => names
                .iter()
                .filter_map(|name| {
                    let file_name = if name.ends_with(".json") {
                        name.clone()
                    } else {
                        format!("{name}.json")
                    };
                    let path = dir.join(&file_name);
                    if path.is_file() {
                        Some(path)
                    } else {
                        warn!("Data point file not found: {}", file_name);
                        None
                    }
                })
                .collect(),
            None => match json_files(dir) {
                Ok(files) => files,
                Err(e) => {
                    warn!("Could not list {}: {}", dir.display(), e);
                    Vec::new()
                }
            },
        };
        if files.is_empty() {
            warn!("No data point files to process in {}", dir.display());
            return Vec::new();
        }

        let data_points: Vec<DataPointDescriptor> = files
            .iter()
            .filter_map(|path| match self.load_file(path) {
                Ok(descriptor) => {
                    info!("Loaded data point {}", descriptor.instance_id);
                    Some(descriptor)
                }
                Err(e) => {
                    warn!("Skipping {}: {:#}", path.display(), e);
                    None
                }
            })
            .collect();
        info!("Loaded {} data point(s)", data_points.len());
        data_points
    }

    /// Load and validate a single data-point file.
    pub fn load_file(&self, path: &Path) -> Result<DataPointDescriptor> {
        let content = std::fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
        let descriptor: DataPointDescriptor =
            serde_json::from_str(&content).with_context(|| format!("parse {:?}", path))?;
        descriptor
            .validate()
            .with_context(|| format!("validate {}", descriptor.instance_id))?;
        Ok(descriptor)
    }
}

fn json_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// One line of a predictions file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub instance_id: String,
    pub model_name_or_path: String,
    pub model_patch: String,
}

/// Converts data points into predictions carrying their reference patch.
#[derive(Debug, Clone)]
pub struct PredictionFormatter {
    model_name: String,
}

impl Default for PredictionFormatter {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_NAME)
    }
}

impl PredictionFormatter {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn convert(&self, data_points: &[DataPointDescriptor]) -> Vec<Prediction> {
        let predictions: Vec<Prediction> = data_points
            .iter()
            .filter_map(|dp| {
                if dp.instance_id.trim().is_empty() || dp.patch.trim().is_empty() {
                    warn!(
                        "Skipping data point without instance id or patch: {:?}",
                        dp.instance_id
                    );
                    return None;
                }
                Some(Prediction {
                    instance_id: dp.instance_id.clone(),
                    model_name_or_path: self.model_name.clone(),
                    model_patch: dp.patch.clone(),
                })
            })
            .collect();
        info!(
            "Converted {} of {} data point(s) to predictions",
            predictions.len(),
            data_points.len()
        );
        predictions
    }

    /// Write `predictions` as JSON lines to `path`.
    pub fn write_jsonl(&self, predictions: &[Prediction], path: &Path) -> Result<()> {
        let mut out = std::io::BufWriter::new(
            std::fs::File::create(path).with_context(|| format!("create {:?}", path))?,
        );
        for prediction in predictions {
            let line = serde_json::to_string(prediction).context("serialize prediction")?;
            writeln!(out, "{line}").with_context(|| format!("write {:?}", path))?;
        }
        out.flush().with_context(|| format!("flush {:?}", path))?;
        info!("Wrote {} prediction(s) to {}", predictions.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_point(dir: &Path, name: &str, value: serde_json::Value) {
        std::fs::write(dir.join(name), serde_json::to_string(&value).unwrap()).unwrap();
    }

    fn point(id: &str) -> serde_json::Value {
        json!({
            "instance_id": id,
            "repo": "owner/repo",
            "base_commit": "0123abcd",
            "patch": "diff --git a/x b/x\n",
            "FAIL_TO_PASS": "[\"test_foo\"]",
            "PASS_TO_PASS": [],
        })
    }

    #[test]
    fn loads_named_files_with_or_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        write_point(dir.path(), "a.json", point("owner__repo-1"));
        write_point(dir.path(), "b.json", point("owner__repo-2"));
        let names = vec!["a".to_string(), "b.json".to_string(), "missing".to_string()];

        let loaded = DataPointLoader::new().load_by_files(dir.path(), Some(&names));
        let ids: Vec<&str> = loaded.iter().map(|d| d.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["owner__repo-1", "owner__repo-2"]);
        assert_eq!(loaded[0].fail_to_pass, vec!["test_foo"]);
    }

    #[test]
    fn skips_invalid_and_non_json_files() {
        let dir = tempfile::tempdir().unwrap();
        write_point(dir.path(), "good.json", point("owner__repo-1"));
        let mut empty_patch = point("owner__repo-2");
        empty_patch["patch"] = json!("  \n");
        write_point(dir.path(), "empty.json", empty_patch);
        let mut no_tests = point("owner__repo-3");
        no_tests["FAIL_TO_PASS"] = json!([]);
        write_point(dir.path(), "no_tests.json", no_tests);
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loaded = DataPointLoader::new().load_by_files(dir.path(), None);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].instance_id, "owner__repo-1");
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = DataPointLoader::new().load_by_files(&dir.path().join("nope"), None);
        assert!(loaded.is_empty());
    }

    #[test]
    fn predictions_jsonl_has_one_line_per_point() {
        let dir = tempfile::tempdir().unwrap();
        let points: Vec<DataPointDescriptor> = ["owner__repo-1", "owner__repo-2"]
            .iter()
            .map(|id| serde_json::from_value(point(id)).unwrap())
            .collect();
        let formatter = PredictionFormatter::default();
        let predictions = formatter.convert(&points);
        assert_eq!(predictions[0].model_name_or_path, "gpt-4");

        let path = dir.path().join("predictions.jsonl");
        formatter.write_jsonl(&predictions, &path).unwrap();
        let lines: Vec<Prediction> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, predictions);
    }

    #[test]
    fn convert_skips_points_without_patch() {
        let mut dp: DataPointDescriptor = serde_json::from_value(point("owner__repo-1")).unwrap();
        dp.patch = String::new();
        let predictions = PredictionFormatter::new("my-model").convert(&[dp]);
        assert!(predictions.is_empty());
    }
}
