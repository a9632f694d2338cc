use crate::annotation::AnnotationFeature;
use crate::error::PipelineError;
use crate::stages::Stage;
use crate::tools::AnnotationParser;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the folder that holds preset genomes.
pub const DATA_DIR_ENV: &str = "SNPGENIE_DATA";
pub const DEFAULT_DATA_DIR: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferencePreset {
    pub name: &'static str,
    pub sequence_file: &'static str,
    pub annotation_file: &'static str,
}

pub const REFERENCE_PRESETS: [ReferencePreset; 2] = [
    ReferencePreset {
        name: "Mbovis-AF212297",
        sequence_file: "Mbovis_AF212297.fa",
        annotation_file: "Mbovis_AF212297.gb",
    },
    ReferencePreset {
        name: "MTB-H37Rv",
        sequence_file: "MTB-H37Rv.fa",
        annotation_file: "MTB-H37Rv.gb",
    },
];

pub fn find_preset(name: &str) -> Option<&'static ReferencePreset> {
    REFERENCE_PRESETS
        .iter()
        .find(|preset| preset.name.eq_ignore_ascii_case(name))
}

pub fn default_data_dir() -> PathBuf {
    std::env::var(DATA_DIR_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

/// The active reference sequence and annotation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub sequence_path: Option<PathBuf>,
    pub annotation_path: Option<PathBuf>,
    #[serde(skip)]
    annotation_table: Option<Vec<AnnotationFeature>>,
}

impl PartialEq for ReferenceConfig {
    fn eq(&self, other: &Self) -> bool {
        self.sequence_path == other.sequence_path && self.annotation_path == other.annotation_path
    }
}

impl ReferenceConfig {
    pub fn new(sequence_path: Option<PathBuf>, annotation_path: Option<PathBuf>) -> Self {
        Self {
            sequence_path,
            annotation_path,
            annotation_table: None,
        }
    }

    pub fn set_sequence(&mut self, path: PathBuf) {
        info!("Reference sequence set to '{}'", path.display());
        self.sequence_path = Some(path);
    }

    /// Sets the annotation path and refreshes the cached feature table. The
    /// path is kept even when parsing fails; the table is then recomputed on
    /// the next [`annotation_table`](Self::annotation_table) call.
    pub fn set_annotation(
        &mut self,
        path: PathBuf,
        parser: &dyn AnnotationParser,
    ) -> Result<usize, PipelineError> {
        info!("Reference annotation set to '{}'", path.display());
        self.annotation_table = None;
        self.annotation_path = Some(path.clone());
        match parser.parse(&path) {
            Ok(table) => {
                let count = table.len();
                self.annotation_table = Some(table);
                Ok(count)
            }
            Err(e) => {
                warn!("Could not parse annotation '{}': {e:#}", path.display());
                Err(PipelineError::invalid_input(format!(
                    "Could not parse annotation '{}': {e:#}",
                    path.display()
                )))
            }
        }
    }

    pub fn cached_annotation_table(&self) -> Option<&[AnnotationFeature]> {
        self.annotation_table.as_deref()
    }

    pub fn annotation_table(
        &mut self,
        parser: &dyn AnnotationParser,
    ) -> Result<&[AnnotationFeature], PipelineError> {
        if self.annotation_table.is_none() {
            let path = self
                .annotation_path
                .clone()
                .ok_or_else(|| PipelineError::precondition("no annotation file is set"))?;
            let table = parser.parse(&path).map_err(|e| {
                PipelineError::invalid_input(format!(
                    "Could not parse annotation '{}': {e:#}",
                    path.display()
                ))
            })?;
            self.annotation_table = Some(table);
        }
        Ok(self.annotation_table.as_deref().unwrap_or_default())
    }

    /// Resolves a preset against `data_dir` and sets both paths.
    pub fn apply_preset(
        &mut self,
        name: &str,
        data_dir: &Path,
        parser: &dyn AnnotationParser,
    ) -> Result<(), PipelineError> {
        let preset = find_preset(name).ok_or_else(|| {
            PipelineError::invalid_input(format!(
                "Unknown reference preset '{name}'; known presets: {}",
                REFERENCE_PRESETS
                    .iter()
                    .map(|p| p.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;
        let sequence = data_dir.join(preset.sequence_file);
        let annotation = data_dir.join(preset.annotation_file);
        for path in [&sequence, &annotation] {
            if !path.exists() {
                return Err(PipelineError::io(format!(
                    "Preset file '{}' does not exist",
                    path.display()
                )));
            }
        }
        self.set_sequence(sequence);
        self.set_annotation(annotation, parser)?;
        Ok(())
    }

    /// Missing reference inputs for `stage`, as user-facing phrases.
    pub fn missing_for(&self, stage: Stage) -> Vec<&'static str> {
        let mut missing = vec![];
        let needs_sequence = matches!(
            stage,
            Stage::Align | Stage::CallVariants | Stage::SnpAlignment
        );
        if needs_sequence && self.sequence_path.is_none() {
            missing.push("reference genome");
        }
        if stage == Stage::CallVariants && self.annotation_path.is_none() {
            missing.push("reference annotation");
        }
        missing
    }

    pub fn is_ready_for(&self, stage: Stage) -> bool {
        self.missing_for(stage).is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
