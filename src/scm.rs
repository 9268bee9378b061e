use std::path::PathBuf;
use std::process::Command;

use serde::Serialize;

const CHANGED_SAMPLE_MAX: usize = 10;

/// Snapshot of the working tree taken right before packaging.
///
/// `dirty` is `None` when the status could not be read at all; the commit
/// gate treats that as clean but records the degradation.
#[derive(Debug, Clone, Serialize)]
pub struct SourceControlStatus {
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub dirty: Option<bool>,
    pub changed: usize,
    pub changed_sample: Vec<String>,
    pub available: bool,
}

impl SourceControlStatus {
    pub fn unavailable() -> Self {
        SourceControlStatus {
            commit: None,
            branch: None,
            dirty: None,
            changed: 0,
            changed_sample: Vec::new(),
            available: false,
        }
    }
}

/// Seam for the commit gate. Production uses git; tests substitute fixed
/// statuses.
pub trait StatusProvider {
    fn status(&self) -> SourceControlStatus;
}

/// Reads the repository state with `git rev-parse` and `git status
/// --porcelain`. Any failure to run git degrades to an unavailable status
/// with a warning rather than aborting the run.
pub struct GitStatusProvider {
    root: PathBuf,
}

impl GitStatusProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        GitStatusProvider { root: root.into() }
    }

    fn git(&self, args: &[&str]) -> Option<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl StatusProvider for GitStatusProvider {
    fn status(&self) -> SourceControlStatus {
        let commit = self
            .git(&["rev-parse", "--short", "HEAD"])
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let branch = self
            .git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let porcelain = self.git(&["status", "--porcelain"]);
        match porcelain {
            Some(text) => {
                let changed_paths: Vec<String> = text
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(|l| l.get(3..).unwrap_or(l).trim().to_string())
                    .collect();
                SourceControlStatus {
                    commit,
                    branch,
                    dirty: Some(!changed_paths.is_empty()),
                    changed: changed_paths.len(),
                    changed_sample: changed_paths
                        .iter()
                        .take(CHANGED_SAMPLE_MAX)
                        .cloned()
                        .collect(),
                    available: true,
                }
            }
            None => {
                tracing::warn!("git status unreadable; treating working tree as clean");
                SourceControlStatus {
                    commit,
                    branch,
                    ..SourceControlStatus::unavailable()
                }
            }
        }
    }
}
