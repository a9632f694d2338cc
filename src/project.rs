use crate::error::PipelineError;
use crate::sample_set::Sample;
use crate::session::WorkflowResults;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    io::Write,
    path::{Path, PathBuf},
};

pub const PROJECT_EXTENSION: &str = "snpgenie";
pub const REQUIRED_KEYS: [&str; 5] = ["inputs", "outputdir", "results", "ref_genome", "ref_gb"];

/// The durable form of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub inputs: Vec<Sample>,
    pub outputdir: Option<PathBuf>,
    pub results: WorkflowResults,
    pub ref_genome: Option<PathBuf>,
    pub ref_gb: Option<PathBuf>,
}

pub struct ProjectStore;

impl ProjectStore {
    /// `path` with the project extension appended when it is missing.
    pub fn normalized_path(path: &Path) -> PathBuf {
        match path.extension() {
            Some(ext) if ext == PROJECT_EXTENSION => path.to_path_buf(),
            _ => {
                let mut name = path.as_os_str().to_owned();
                name.push(".");
                name.push(PROJECT_EXTENSION);
                PathBuf::from(name)
            }
        }
    }

    /// Writes to a temporary file next to the target, then renames it over
    /// the target. Returns the path actually written.
    pub fn save(snapshot: &ProjectSnapshot, path: &Path) -> Result<PathBuf, PipelineError> {
        let path = Self::normalized_path(path);
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let text = serde_json::to_string_pretty(snapshot).map_err(|e| {
            PipelineError::persistence(format!("Could not serialize project: {e}"))
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(|e| {
            PipelineError::persistence(format!(
                "Could not create temporary file in '{}': {e}",
                parent.display()
            ))
        })?;
        tmp.write_all(text.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| {
                PipelineError::persistence(format!(
                    "Could not write project '{}': {e}",
                    path.display()
                ))
            })?;
        tmp.persist(&path).map_err(|e| {
            PipelineError::persistence(format!(
                "Could not write project '{}': {}",
                path.display(),
                e.error
            ))
        })?;
        info!(
            "Saved project with {} sample(s) to '{}'",
            snapshot.inputs.len(),
            path.display()
        );
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<ProjectSnapshot, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::persistence(format!(
                "Could not read project '{}': {e}",
                path.display()
            ))
        })?;
        let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            PipelineError::persistence(format!(
                "Could not parse project '{}': {e}",
                path.display()
            ))
        })?;
        let object = value.as_object().ok_or_else(|| {
            PipelineError::persistence(format!(
                "Project '{}' is not a JSON object",
                path.display()
            ))
        })?;
        let missing: Vec<&str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| !object.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::persistence(format!(
                "Project '{}' is missing required key(s): {}",
                path.display(),
                missing.join(", ")
            )));
        }
        let snapshot: ProjectSnapshot = serde_json::from_value(value).map_err(|e| {
            PipelineError::persistence(format!(
                "Invalid project '{}': {e}",
                path.display()
            ))
        })?;
        info!(
            "Loaded project with {} sample(s) from '{}'",
            snapshot.inputs.len(),
            path.display()
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::sample_set::{BAM_FILE, TRIMMED};
    use crate::session::{CSQ_MATRIX, VCF_FILE};
    use tempfile::tempdir;

    fn snapshot() -> ProjectSnapshot {
        let mut a = Sample::new(PathBuf::from("/in/A_S1.fastq.gz"), "A_S1".to_string());
        a.read_length = Some(151);
        a.derived
            .insert(TRIMMED.to_string(), PathBuf::from("/out/trimmed/A_S1.fastq.gz"));
        a.derived
            .insert(BAM_FILE.to_string(), PathBuf::from("/out/mapped/A_S1.bam"));
        a.metadata.insert("county".to_string(), Some("Cork".to_string()));
        a.metadata.insert("year".to_string(), None);
        let b = Sample::new(PathBuf::from("/in/B.fastq"), "B".to_string());
        let mut results = WorkflowResults::default();
        results.insert_path(VCF_FILE, PathBuf::from("/out/filtered.vcf.gz"));
        results.insert_path(CSQ_MATRIX, PathBuf::from("/out/csq.matrix"));
        ProjectSnapshot {
            inputs: vec![a, b],
            outputdir: Some(PathBuf::from("/out")),
            results,
            ref_genome: Some(PathBuf::from("/ref/genome.fa")),
            ref_gb: None,
        }
    }

    #[test]
    fn test_round_trip_and_extension() {
        let td = tempdir().unwrap();
        let saved = ProjectStore::save(&snapshot(), &td.path().join("run1")).unwrap();
        assert_eq!(saved, td.path().join("run1.snpgenie"));
        let loaded = ProjectStore::load(&saved).unwrap();
        assert_eq!(loaded, snapshot());

        // overwrite in place, no stray temporaries left behind
        ProjectStore::save(&ProjectSnapshot::default(), &saved).unwrap();
        assert_eq!(ProjectStore::load(&saved).unwrap(), ProjectSnapshot::default());
        assert_eq!(std::fs::read_dir(td.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_load_failures_are_persistence_errors() {
        let td = tempdir().unwrap();
        let err = ProjectStore::load(&td.path().join("absent.snpgenie")).unwrap_err();
        assert_eq!(err.code, ErrorCode::Persistence);

        let path = td.path().join("bad.snpgenie");
        std::fs::write(&path, "{\"inputs\": [").unwrap();
        assert_eq!(ProjectStore::load(&path).unwrap_err().code, ErrorCode::Persistence);

        std::fs::write(&path, r#"{"inputs": [], "outputdir": null, "results": {}}"#).unwrap();
        let err = ProjectStore::load(&path).unwrap_err();
        assert_eq!(err.code, ErrorCode::Persistence);
        assert!(err.message.contains("ref_genome, ref_gb"));
    }

    #[test]
    fn test_save_to_missing_folder_fails() {
        let td = tempdir().unwrap();
        let err = ProjectStore::save(&snapshot(), &td.path().join("nope").join("p.snpgenie"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Persistence);
    }
}
