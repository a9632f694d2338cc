use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::Path, path::PathBuf};

pub const DEFAULT_THREADS: usize = 4;
pub const DEFAULT_QUALITY: u8 = 30;
pub const MAX_QUALITY: u8 = 60;
pub const DEFAULT_FILTERS: &str = "QUAL>=40 && INFO/DP>=20 && MQ>35";
pub const DEFAULT_RD_CUTOFF: f64 = 0.15;
pub const DEFAULT_BOOTSTRAPS: u32 = 100;
pub const MAX_BOOTSTRAPS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignerKind {
    #[default]
    Bwa,
    Bowtie2,
}

impl fmt::Display for AlignerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignerKind::Bwa => write!(f, "bwa"),
            AlignerKind::Bowtie2 => write!(f, "bowtie2"),
        }
    }
}

/// Options applied to every stage submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub threads: usize,
    /// Re-run tools even when their output already exists.
    pub overwrite: bool,
    /// Phred threshold passed to the trimmer.
    pub quality: u8,
    pub aligner: AlignerKind,
    /// bcftools `filter -i` expression.
    pub filters: String,
    pub rd_cutoff: f64,
    pub rd_regions: Option<PathBuf>,
    /// Bootstrap replicates for the phylogeny stage.
    pub bootstraps: u32,
    /// Executable overrides keyed by environment variable name.
    pub tools: BTreeMap<String, String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS.min(max_threads()),
            overwrite: false,
            quality: DEFAULT_QUALITY,
            aligner: AlignerKind::default(),
            filters: DEFAULT_FILTERS.to_string(),
            rd_cutoff: DEFAULT_RD_CUTOFF,
            rd_regions: None,
            bootstraps: DEFAULT_BOOTSTRAPS,
            tools: BTreeMap::new(),
        }
    }
}

pub fn max_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(1)
}

impl PipelineSettings {
    pub fn load_from_path(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::io(format!(
                "Could not read settings file '{}': {e}",
                path.display()
            ))
        })?;
        let settings: Self = serde_json::from_str(&text).map_err(|e| {
            PipelineError::invalid_input(format!(
                "Could not parse settings JSON '{}': {e}",
                path.display()
            ))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let max = max_threads();
        if self.threads == 0 || self.threads > max {
            return Err(PipelineError::invalid_input(format!(
                "threads must be between 1 and {max}, got {}",
                self.threads
            )));
        }
        if self.quality > MAX_QUALITY {
            return Err(PipelineError::invalid_input(format!(
                "quality must be between 0 and {MAX_QUALITY}, got {}",
                self.quality
            )));
        }
        if self.filters.trim().is_empty() {
            return Err(PipelineError::invalid_input(
                "variant filter expression is empty",
            ));
        }
        if !(self.rd_cutoff > 0.0 && self.rd_cutoff <= 1.0) {
            return Err(PipelineError::invalid_input(format!(
                "rd_cutoff must be in (0, 1], got {}",
                self.rd_cutoff
            )));
        }
        if self.bootstraps == 0 || self.bootstraps > MAX_BOOTSTRAPS {
            return Err(PipelineError::invalid_input(format!(
                "bootstraps must be between 1 and {MAX_BOOTSTRAPS}, got {}",
                self.bootstraps
            )));
        }
        if let Some(path) = &self.rd_regions {
            if !path.exists() {
                return Err(PipelineError::invalid_input(format!(
                    "RD region file '{}' does not exist",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.quality, 30);
        assert_eq!(settings.aligner, AlignerKind::Bwa);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_default_threads_fit_the_host() {
        let settings = PipelineSettings::default();
        assert!(settings.threads >= 1);
        assert!(settings.threads <= max_threads());
        assert_eq!(settings.threads, DEFAULT_THREADS.min(max_threads()));

        let settings = PipelineSettings {
            threads: max_threads() + 1,
            ..PipelineSettings::default()
        };
        assert_eq!(settings.validate().unwrap_err().code, ErrorCode::InvalidInput);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let settings = PipelineSettings {
            threads: 0,
            ..PipelineSettings::default()
        };
        assert_eq!(settings.validate().unwrap_err().code, ErrorCode::InvalidInput);

        let settings = PipelineSettings {
            threads: 1,
            quality: 99,
            ..PipelineSettings::default()
        };
        assert!(settings.validate().unwrap_err().message.contains("quality"));

        let settings = PipelineSettings {
            threads: 1,
            filters: "  ".to_string(),
            ..PipelineSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = PipelineSettings {
            threads: 1,
            rd_cutoff: 0.0,
            ..PipelineSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = PipelineSettings {
            threads: 1,
            bootstraps: 0,
            ..PipelineSettings::default()
        };
        assert!(settings.validate().unwrap_err().message.contains("bootstraps"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let td = tempdir().unwrap();
        let path = td.path().join("settings.json");
        std::fs::write(&path, r#"{"threads": 1, "aligner": "bowtie2", "overwrite": true}"#)
            .unwrap();
        let settings = PipelineSettings::load_from_path(&path).unwrap();
        assert_eq!(settings.threads, 1);
        assert!(settings.overwrite);
        assert_eq!(settings.aligner, AlignerKind::Bowtie2);
        assert_eq!(settings.filters, DEFAULT_FILTERS);
    }

    #[test]
    fn test_bad_json_is_invalid_input() {
        let td = tempdir().unwrap();
        let path = td.path().join("settings.json");
        std::fs::write(&path, "{threads:").unwrap();
        let err = PipelineSettings::load_from_path(&path).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }
}
