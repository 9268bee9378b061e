use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

use crate::error::Result;
use crate::grid::SummaryRecord;
use crate::scm::{SourceControlStatus, StatusProvider};
use crate::validation::StrictCriteria;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    Failed,
    Skipped,
    NotRequested,
}

/// Outcome of the commit-readiness check, recorded in the run metadata.
/// A `Skipped` verdict is written as a placeholder when packaging was
/// requested, so a crashed run still shows the gate never ran.
#[derive(Debug, Clone, Serialize)]
pub struct CommitGateVerdict {
    pub status: GateStatus,
    pub reason: String,
    pub recommendation: Option<String>,
    pub scm: Option<SourceControlStatus>,
}

impl CommitGateVerdict {
    pub fn not_requested() -> Self {
        CommitGateVerdict {
            status: GateStatus::NotRequested,
            reason: "packaging not requested".to_string(),
            recommendation: None,
            scm: None,
        }
    }

    pub fn skipped() -> Self {
        CommitGateVerdict {
            status: GateStatus::Skipped,
            reason: "run did not reach the packaging stage".to_string(),
            recommendation: None,
            scm: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        CommitGateVerdict {
            status: GateStatus::Failed,
            reason: reason.into(),
            recommendation: None,
            scm: None,
        }
    }
}

/// Computes the gate from a fresh source-control snapshot. A clean tree
/// passes; a dirty tree fails with a sample of the changed paths; an
/// unreadable status passes in degraded form so offline runs still package.
pub fn compute_commit_gate(provider: &dyn StatusProvider) -> CommitGateVerdict {
    let status = provider.status();
    match status.dirty {
        Some(false) => CommitGateVerdict {
            status: GateStatus::Passed,
            reason: "working tree clean".to_string(),
            recommendation: Some("no commit needed".to_string()),
            scm: Some(status),
        },
        Some(true) => {
            let sample = status.changed_sample.join(", ");
            CommitGateVerdict {
                status: GateStatus::Failed,
                reason: format!(
                    "working tree has {} uncommitted change(s): {}",
                    status.changed, sample
                ),
                recommendation: Some(format!(
                    "commit recommended ({} uncommitted)",
                    status.changed
                )),
                scm: Some(status),
            }
        }
        None => {
            tracing::warn!("commit gate degraded: status unreadable, treated as clean");
            CommitGateVerdict {
                status: GateStatus::Passed,
                reason: "source-control status unreadable; treated as clean".to_string(),
                recommendation: Some("commit status unknown".to_string()),
                scm: Some(status),
            }
        }
    }
}

/// Everything the packager needs to write the README and the zip bundle.
pub struct PackRequest<'a> {
    pub out_dir: &'a Path,
    pub ts: &'a str,
    pub equity_start: NaiveDate,
    pub equity_end: NaiveDate,
    pub strict: StrictCriteria,
    pub n_min: usize,
    pub trades_min: u64,
    pub base_grid: &'a Path,
    pub aug_grid: Option<&'a Path>,
    pub survivors: &'a [SummaryRecord],
    pub commit: Option<&'a str>,
    pub artifacts: &'a [String],
    pub repro_command: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackInfo {
    pub zip: String,
    pub readme: String,
    pub files_included: Vec<String>,
    pub missing: Vec<String>,
}

/// Writes `README_{ts}.md` and bundles it with every existing artifact into
/// `pack_{ts}.zip`. Artifact paths deduplicate; files that vanished between
/// stages are listed as missing rather than failing the pack.
pub fn create_results_pack(request: &PackRequest<'_>) -> Result<PackInfo> {
    fs::create_dir_all(request.out_dir)?;
    let readme_path = request.out_dir.join(format!("README_{}.md", request.ts));
    let zip_path = request.out_dir.join(format!("pack_{}.zip", request.ts));

    // Manifest: README first, then the artifacts in stable order, no repeats.
    let mut manifest: Vec<PathBuf> = vec![readme_path.clone()];
    let mut seen = BTreeSet::new();
    seen.insert(readme_path.clone());
    for artifact in request.artifacts {
        let path = PathBuf::from(artifact);
        if seen.insert(path.clone()) {
            manifest.push(path);
        }
    }

    let (included, missing): (Vec<_>, Vec<_>) = manifest
        .iter()
        .skip(1)
        .cloned()
        .partition(|p| p.exists());

    fs::write(&readme_path, render_readme(request, &included, &missing))?;

    let file = File::create(&zip_path)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for path in std::iter::once(&readme_path).chain(included.iter()) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        writer.start_file(name, options)?;
        io::copy(&mut File::open(path)?, &mut writer)?;
    }
    writer.finish()?;

    for path in &missing {
        tracing::warn!("pack: artifact missing, not bundled: {}", path.display());
    }
    tracing::info!(
        "pack: {} file(s) bundled into {}",
        included.len() + 1,
        zip_path.display()
    );

    Ok(PackInfo {
        zip: zip_path.display().to_string(),
        readme: readme_path.display().to_string(),
        files_included: std::iter::once(readme_path.display().to_string())
            .chain(included.iter().map(|p| p.display().to_string()))
            .collect(),
        missing: missing.iter().map(|p| p.display().to_string()).collect(),
    })
}

fn render_readme(request: &PackRequest<'_>, included: &[PathBuf], missing: &[PathBuf]) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Walk-forward calibration pack {}\n\n", request.ts));

    out.push_str("## Run conditions\n\n");
    out.push_str(&format!("- run tag: {}\n", request.ts));
    out.push_str(&format!(
        "- equity window: {} .. {}\n",
        request.equity_start, request.equity_end
    ));
    out.push_str(&format!(
        "- commit: {}\n",
        request.commit.unwrap_or("(unknown)")
    ));
    out.push_str(&format!(
        "- strict criteria: PF >= {}, return >= {}%, maxDD <= {}%, PF drift >= {}\n",
        request.strict.pf_min,
        request.strict.ret_min,
        request.strict.dd_max,
        request.strict.pf_drift_min
    ));
    out.push_str(&format!(
        "- quota: {} candidate(s), trade floor {}\n",
        request.n_min, request.trades_min
    ));
    out.push_str(&format!("- base grid: {}\n", request.base_grid.display()));
    if let Some(aug) = request.aug_grid {
        out.push_str(&format!("- augmentation grid: {}\n", aug.display()));
    }
    out.push('\n');

    out.push_str("## Final candidates\n\n");
    if request.survivors.is_empty() {
        out.push_str("(none)\n\n");
    } else {
        let param_names: Vec<&String> = request.survivors[0].values.keys().collect();
        let mut header: Vec<String> = param_names.iter().map(|s| s.to_string()).collect();
        header.extend(
            ["pf_avg", "ret_avg", "maxDD_max", "trades_min", "pf_drift"].map(String::from),
        );
        out.push_str(&format!("| {} |\n", header.join(" | ")));
        out.push_str(&format!("|{}\n", "---|".repeat(header.len())));
        for s in request.survivors {
            let mut row: Vec<String> = param_names
                .iter()
                .map(|n| s.values.get(*n).cloned().unwrap_or_default())
                .collect();
            row.push(format!("{:.4}", s.pf_avg));
            row.push(format!("{:.4}", s.ret_avg));
            row.push(format!("{:.4}", s.dd_max));
            row.push(s.trades_min.to_string());
            row.push(format!("{:.4}", s.pf_drift));
            out.push_str(&format!("| {} |\n", row.join(" | ")));
        }
        out.push('\n');
    }

    out.push_str("## Included files\n\n");
    out.push_str(&format!("- README_{}.md\n", request.ts));
    for path in included {
        out.push_str(&format!("- {}\n", path.display()));
    }
    for path in missing {
        out.push_str(&format!("- {} (missing at pack time)\n", path.display()));
    }
    out.push('\n');

    out.push_str("## Reproduce\n\n");
    out.push_str("```\n");
    out.push_str(&request.repro_command);
    out.push_str("\n```\n");
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    struct FixedProvider(SourceControlStatus);

    impl StatusProvider for FixedProvider {
        fn status(&self) -> SourceControlStatus {
            self.0.clone()
        }
    }

    fn clean() -> SourceControlStatus {
        SourceControlStatus {
            commit: Some("abc1234".to_string()),
            branch: Some("main".to_string()),
            dirty: Some(false),
            changed: 0,
            changed_sample: Vec::new(),
            available: true,
        }
    }

    #[test]
    fn clean_tree_passes_the_gate() {
        let verdict = compute_commit_gate(&FixedProvider(clean()));
        assert_eq!(verdict.status, GateStatus::Passed);
        assert_eq!(verdict.recommendation.as_deref(), Some("no commit needed"));
    }

    #[test]
    fn dirty_tree_fails_with_changed_sample() {
        let mut status = clean();
        status.dirty = Some(true);
        status.changed = 2;
        status.changed_sample = vec!["src/a.rs".to_string(), "src/b.rs".to_string()];
        let verdict = compute_commit_gate(&FixedProvider(status));
        assert_eq!(verdict.status, GateStatus::Failed);
        assert!(verdict.reason.contains("src/a.rs"));
        assert_eq!(
            verdict.recommendation.as_deref(),
            Some("commit recommended (2 uncommitted)")
        );
    }

    #[test]
    fn unreadable_status_passes_degraded() {
        let verdict = compute_commit_gate(&FixedProvider(SourceControlStatus::unavailable()));
        assert_eq!(verdict.status, GateStatus::Passed);
        assert!(verdict.reason.contains("treated as clean"));
        assert_eq!(
            verdict.recommendation.as_deref(),
            Some("commit status unknown")
        );
    }

    #[test]
    fn pack_bundles_existing_artifacts_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("final_candidates_x.csv");
        fs::write(&artifact, "X,pf_avg\n1,1.2\n").unwrap();
        let gone = dir.path().join("wf_validation_x.csv");

        let survivor = SummaryRecord {
            values: BTreeMap::from([("X".to_string(), "1".to_string())]),
            pf_avg: 1.2,
            ret_avg: 3.0,
            dd_max: 9.0,
            trades_min: 40,
            pf_drift: 0.05,
            splits: 2,
        };
        let artifacts = vec![
            artifact.display().to_string(),
            artifact.display().to_string(),
            gone.display().to_string(),
        ];
        let request = PackRequest {
            out_dir: dir.path(),
            ts: "x",
            equity_start: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            equity_end: NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
            strict: StrictCriteria::default(),
            n_min: 5,
            trades_min: 30,
            base_grid: Path::new("grids/base.json"),
            aug_grid: None,
            survivors: std::slice::from_ref(&survivor),
            commit: Some("abc1234"),
            artifacts: &artifacts,
            repro_command: "stability-runner --base-grid grids/base.json".to_string(),
        };

        let info = create_results_pack(&request).unwrap();
        assert!(Path::new(&info.zip).exists());
        assert!(Path::new(&info.readme).exists());
        // README plus the one existing artifact, duplicate collapsed.
        assert_eq!(info.files_included.len(), 2);
        assert_eq!(info.missing.len(), 1);

        let readme = fs::read_to_string(&info.readme).unwrap();
        assert!(readme.contains("equity window: 2025-01-01 .. 2025-06-30"));
        assert!(readme.contains("commit: abc1234"));
        assert!(readme.contains("| 1 | 1.2000 |") || readme.contains("1.2000"));
        assert!(readme.contains("missing at pack time"));
        assert!(readme.contains("stability-runner --base-grid"));
    }
}
