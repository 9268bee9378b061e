use std::fs;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;

use crate::error::Result;
use crate::grid::GenerationOutcome;
use crate::package::{CommitGateVerdict, PackInfo};
use crate::scm::SourceControlStatus;
use crate::selection::SelectionOutcome;
use crate::validation::ValidationOutcome;

/// Cumulative audit record for one run. Persisted after every stage
/// transition, so a crash mid-run leaves the stages completed so far on
/// disk.
#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub timestamp: String,
    pub generated_at: String,
    pub args: serde_json::Value,
    pub git: Option<SourceControlStatus>,
    pub generation: Vec<GenerationOutcome>,
    pub selection: Option<SelectionOutcome>,
    pub validation: Option<ValidationOutcome>,
    pub commit_gate: Option<CommitGateVerdict>,
    pub pack: Option<PackInfo>,
    pub artifacts: Vec<String>,
}

impl RunMeta {
    pub fn new(ts: &str, args: serde_json::Value) -> Self {
        RunMeta {
            timestamp: ts.to_string(),
            generated_at: Utc::now().to_rfc3339(),
            args,
            git: None,
            generation: Vec::new(),
            selection: None,
            validation: None,
            commit_gate: None,
            pack: None,
            artifacts: Vec::new(),
        }
    }

    pub fn add_artifact(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.artifacts.contains(&path) {
            self.artifacts.push(path);
        }
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifacts_deduplicate() {
        let mut meta = RunMeta::new("x", serde_json::json!({}));
        meta.add_artifact("results/a.csv");
        meta.add_artifact("results/a.csv");
        meta.add_artifact("results/b.csv");
        assert_eq!(meta.artifacts, vec!["results/a.csv", "results/b.csv"]);
    }

    #[test]
    fn persist_writes_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_meta_x.json");
        let meta = RunMeta::new("x", serde_json::json!({"seed": 7}));
        meta.persist(&path).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["timestamp"], "x");
        assert_eq!(parsed["args"]["seed"], 7);
        assert!(parsed["selection"].is_null());
    }
}
