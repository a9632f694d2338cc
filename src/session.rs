//! The working session: sample table, reference, results and output folder,
//! with its reset/snapshot lifecycle and the output-folder layout.

use crate::error::PipelineError;
use crate::project::ProjectSnapshot;
use crate::rd_analysis::RdReport;
use crate::reference::ReferenceConfig;
use crate::sample_set::SampleSet;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

pub const TRIMMED_DIR: &str = "trimmed";
pub const MAPPED_DIR: &str = "mapped";
pub const RD_DIR: &str = "rd_analysis";
pub const PHYLOGENY_DIR: &str = "phylogeny";
/// RAxML run name; its outputs are `RAxML_<kind>.variants`.
pub const RAXML_RUN: &str = "variants";
/// Pooled pileup; the only variant-calling intermediate removed by cleanup.
pub const RAW_BCF: &str = "raw.bcf";
pub const CALLS_VCF: &str = "calls.vcf";
pub const FILTERED_VCF: &str = "filtered.vcf.gz";
pub const CSQ_VCF: &str = "csq.vcf";
pub const CSQ_MATRIX_FILE: &str = "csq.matrix";
pub const CORE_FASTA: &str = "core.fa";
pub const SNP_MATRIX_FILE: &str = "snp_matrix.csv";
pub const QC_REPORT: &str = "qc_report.pdf";
pub const RD_BED: &str = "rd_regions.bed";
pub const RD_MATRIX_FILE: &str = "rd_matrix.csv";

pub const VCF_FILE: &str = "vcf_file";
pub const CSQ_MATRIX: &str = "csq_matrix";
pub const SNP_FILE: &str = "snp_file";
pub const SNP_MATRIX: &str = "snp_matrix";
pub const RD_RESULT: &str = "rd_result";
pub const TREE_FILE: &str = "tree_file";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultEntry {
    Artifact(PathBuf),
    RdAnalysis(RdReport),
}

impl ResultEntry {
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            ResultEntry::Artifact(path) => Some(path),
            ResultEntry::RdAnalysis(_) => None,
        }
    }
}

/// Stage outputs by result key. Keys only grow; `new_project` clears them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowResults {
    entries: BTreeMap<String, ResultEntry>,
}

impl WorkflowResults {
    pub fn insert(&mut self, key: &str, entry: ResultEntry) {
        self.entries.insert(key.to_string(), entry);
    }

    pub fn insert_path(&mut self, key: &str, path: PathBuf) {
        self.insert(key, ResultEntry::Artifact(path));
    }

    pub fn get(&self, key: &str) -> Option<&ResultEntry> {
        self.entries.get(key)
    }

    pub fn path(&self, key: &str) -> Option<&Path> {
        self.get(key).and_then(ResultEntry::as_path)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    /// Derived sample paths dropped because their files are gone.
    pub forgotten: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub samples: SampleSet,
    pub reference: ReferenceConfig,
    pub results: WorkflowResults,
    pub output_dir: Option<PathBuf>,
    /// Where the session was last saved to or loaded from.
    pub project_file: Option<PathBuf>,
}

impl Session {
    pub fn new_project(&mut self) {
        *self = Session::default();
        info!("Started a new project");
    }

    pub fn require_output_dir(&self) -> Result<&Path, PipelineError> {
        self.output_dir
            .as_deref()
            .ok_or_else(|| PipelineError::precondition("no output folder is set"))
    }

    pub fn subdir(&self, name: &str) -> Result<PathBuf, PipelineError> {
        Ok(self.require_output_dir()?.join(name))
    }

    pub fn snapshot(&self) -> ProjectSnapshot {
        ProjectSnapshot {
            inputs: self.samples.to_snapshot(),
            outputdir: self.output_dir.clone(),
            results: self.results.clone(),
            ref_genome: self.reference.sequence_path.clone(),
            ref_gb: self.reference.annotation_path.clone(),
        }
    }

    /// Builds a fresh session from `snapshot`; nothing of `self` survives.
    pub fn from_snapshot(
        snapshot: ProjectSnapshot,
        project_file: Option<PathBuf>,
    ) -> Result<Session, PipelineError> {
        Ok(Session {
            samples: SampleSet::from_snapshot(snapshot.inputs)?,
            reference: ReferenceConfig::new(snapshot.ref_genome, snapshot.ref_gb),
            results: snapshot.results,
            output_dir: snapshot.outputdir,
            project_file,
        })
    }

    /// Empties `trimmed/` and `mapped/` and removes the pooled pileup with its
    /// index. Everything else in the output folder is left alone. Sample rows
    /// stop pointing at the removed files.
    pub fn cleanup(&mut self) -> Result<CleanupReport, PipelineError> {
        let root = self.require_output_dir()?.to_path_buf();
        let mut report = CleanupReport::default();
        for dir in [TRIMMED_DIR, MAPPED_DIR] {
            let dir = root.join(dir);
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let removed = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                match removed {
                    Ok(()) => report.removed.push(path),
                    Err(e) => warn!("Could not remove '{}': {e}", path.display()),
                }
            }
        }
        for name in [RAW_BCF.to_string(), format!("{RAW_BCF}.csi")] {
            let path = root.join(name);
            if path.exists() {
                fs::remove_file(&path).map_err(|e| {
                    PipelineError::io(format!("Could not remove '{}': {e}", path.display()))
                })?;
                report.removed.push(path);
            }
        }
        report.forgotten = self.samples.forget_missing_derived();
        info!(
            "Cleanup removed {} file(s) under '{}' and {} sample path(s)",
            report.removed.len(),
            root.display(),
            report.forgotten
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::rd_analysis::RdMatrix;
    use crate::sample_set::{BAM_FILE, Sample, TRIMMED};
    use tempfile::tempdir;

    #[test]
    fn test_results_serialize_as_plain_paths() {
        let mut results = WorkflowResults::default();
        results.insert_path(VCF_FILE, PathBuf::from("/out/filtered.vcf.gz"));
        results.insert(
            RD_RESULT,
            ResultEntry::RdAnalysis(RdReport {
                matrix: RdMatrix::default(),
                matrix_file: PathBuf::from("/out/rd_analysis/rd_matrix.csv"),
                heatmap: Default::default(),
            }),
        );
        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(json[VCF_FILE], "/out/filtered.vcf.gz");
        let back: WorkflowResults = serde_json::from_value(json).unwrap();
        assert_eq!(back, results);
        assert!(back.path(RD_RESULT).is_none());
    }

    #[test]
    fn test_cleanup_keeps_other_outputs() {
        let td = tempdir().unwrap();
        let root = td.path();
        for dir in [TRIMMED_DIR, MAPPED_DIR] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        fs::write(root.join(TRIMMED_DIR).join("A.fastq"), "x").unwrap();
        fs::write(root.join(MAPPED_DIR).join("A.bam"), "x").unwrap();
        fs::write(root.join(MAPPED_DIR).join("A.bam.bai"), "x").unwrap();
        fs::write(root.join(RAW_BCF), "x").unwrap();
        fs::write(root.join(CSQ_MATRIX_FILE), "x").unwrap();
        fs::write(root.join(CORE_FASTA), "x").unwrap();

        let mut samples = SampleSet::from_snapshot(vec![Sample::new(
            root.join("A.fastq"),
            "A".to_string(),
        )])
        .unwrap();
        samples
            .assign("A", TRIMMED, root.join(TRIMMED_DIR).join("A.fastq"))
            .unwrap();
        samples
            .assign("A", BAM_FILE, root.join(MAPPED_DIR).join("A.bam"))
            .unwrap();
        let mut session = Session {
            samples,
            output_dir: Some(root.to_path_buf()),
            ..Session::default()
        };
        let report = session.cleanup().unwrap();
        assert_eq!(report.removed.len(), 4);
        assert_eq!(report.forgotten, 2);
        let sample = session.samples.get("A").unwrap();
        assert!(sample.trimmed().is_none());
        assert!(sample.bam_file().is_none());
        assert!(session.samples.bam_files().is_empty());
        assert!(root.join(TRIMMED_DIR).exists());
        assert_eq!(fs::read_dir(root.join(TRIMMED_DIR)).unwrap().count(), 0);
        assert_eq!(fs::read_dir(root.join(MAPPED_DIR)).unwrap().count(), 0);
        assert!(!root.join(RAW_BCF).exists());
        assert!(root.join(CSQ_MATRIX_FILE).exists());
        assert!(root.join(CORE_FASTA).exists());
    }

    #[test]
    fn test_cleanup_requires_output_dir() {
        let err = Session::default().cleanup().unwrap_err();
        assert_eq!(err.code, ErrorCode::Precondition);
    }
}
