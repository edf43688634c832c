//! Per-evaluation artifacts (`run_instance.log`, `report.json`) and the run
//! summary printed at the end of `patchbench validate`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{TestsStatus, Verdict, VerdictStatus};

pub const RUN_LOG: &str = "run_instance.log";
pub const REPORT_FILE: &str = "report.json";

/// One entry of `report.json`, keyed by instance id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceReport {
    pub resolved: bool,
    pub status: VerdictStatus,
    pub tests_status: TestsStatus,
    pub duration_ms: u64,
    pub truncated: bool,
}

impl From<&Verdict> for InstanceReport {
    fn from(verdict: &Verdict) -> Self {
        Self {
            resolved: verdict.resolved(),
            status: verdict.status,
            tests_status: verdict.tests_status.clone(),
            duration_ms: verdict.duration_ms,
            truncated: verdict.truncated,
        }
    }
}

/// Write `<dir>/report.json` for `verdict`.
pub fn write_instance_report(dir: &Path, verdict: &Verdict) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {:?}", dir))?;
    let mut report = BTreeMap::new();
    report.insert(verdict.instance_id.clone(), InstanceReport::from(verdict));
    let content = serde_json::to_string_pretty(&report).context("serialize report")?;
    let path = dir.join(REPORT_FILE);
    std::fs::write(&path, content).with_context(|| format!("write {:?}", path))?;
    Ok(path)
}

/// Read back a `report.json`.
pub fn read_instance_report(path: &Path) -> Result<BTreeMap<String, InstanceReport>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("parse {:?}", path))
}

/// Append-only `run_instance.log` for one evaluation.
///
/// Write failures are logged and otherwise ignored; the log must never turn
/// a verdict into an error.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    /// Create `<dir>/run_instance.log`, truncating any previous run.
    pub fn create(dir: &Path) -> Self {
        let path = dir.join(RUN_LOG);
        let created = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, ""));
        if let Err(e) = created {
            warn!("Could not create run log {}: {}", path.display(), e);
        }
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Timestamped line.
    pub fn line(&self, message: impl AsRef<str>) {
        self.append(&format!(
            "{} {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            message.as_ref()
        ));
    }

    /// Verbatim block (captured test output).
    pub fn block(&self, title: &str, body: &str) {
        let mut text = format!(">>>>> {title}\n{body}");
        if !body.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("<<<<< {title}\n"));
        self.append(&text);
    }

    fn append(&self, text: &str) {
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(text.as_bytes()));
        if let Err(e) = written {
            warn!("Could not append to run log {}: {}", self.path.display(), e);
        }
    }
}

/// Counts over one `validate` invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    /// Per instance: status and error, in evaluation order
    pub results: Vec<SummaryLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryLine {
    pub instance_id: String,
    pub status: VerdictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    pub fn from_verdicts<'a>(verdicts: impl IntoIterator<Item = &'a Verdict>) -> Self {
        let mut summary = Self::default();
        for verdict in verdicts {
            summary.record(verdict);
        }
        summary
    }

    pub fn record(&mut self, verdict: &Verdict) {
        self.total += 1;
        if verdict.resolved() {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.success_rate = if self.total == 0 {
            0.0
        } else {
            self.successful as f64 * 100.0 / self.total as f64
        };
        self.results.push(SummaryLine {
            instance_id: verdict.instance_id.clone(),
            status: verdict.status,
            error: verdict.error.clone(),
        });
    }

    /// Verdict tier for the success rate.
    pub fn tier(&self) -> &'static str {
        if self.total > 0 && self.successful == self.total {
            "All files processed successfully!"
        } else if self.success_rate >= 80.0 {
            "Most files processed successfully"
        } else if self.success_rate >= 50.0 {
            "Half of files processed"
        } else {
            "Most files failed"
        }
    }

    /// 0 only when every data point passed.
    pub fn exit_code(&self) -> i32 {
        if self.total > 0 && self.successful == self.total {
            0
        } else {
            1
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Total files: {}\n", self.total));
        out.push_str(&format!("Successful: {}\n", self.successful));
        out.push_str(&format!("Failed: {}\n", self.failed));
        out.push_str(&format!("Success rate: {:.1}%\n", self.success_rate));

        if !self.results.is_empty() {
            out.push_str("\nDetailed results:\n");
            for line in &self.results {
                let detail = match line.status {
                    VerdictStatus::Pass => "All tests passed".to_string(),
                    VerdictStatus::Fail => "Some tests failed".to_string(),
                    VerdictStatus::Timeout => "Timed out".to_string(),
                    VerdictStatus::PatchConflict => "Patch did not apply".to_string(),
                    VerdictStatus::Error => {
                        format!("Error: {}", line.error.as_deref().unwrap_or("unknown"))
                    }
                };
                out.push_str(&format!("  {}: {}\n", line.instance_id, detail));
            }
        }

        out.push_str(&format!("\n{}\n", self.tier()));
        out
    }
}
