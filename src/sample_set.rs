use crate::error::PipelineError;
use crate::tools::ReadLengthProbe;
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

/// Derived-path field written by the Trim stage.
pub const TRIMMED: &str = "trimmed";
/// Derived-path field written by the Align stage.
pub const BAM_FILE: &str = "bam_file";

pub const FASTQ_SUFFIXES: [&str; 4] = [".fastq.gz", ".fq.gz", ".fastq", ".fq"];

/// One sequencing read file and the artifacts derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unique row key.
    pub name: String,
    /// Join key for external metadata: `name` up to the first `_`.
    pub sample: String,
    pub filename: PathBuf,
    #[serde(default)]
    pub read_length: Option<u64>,
    #[serde(default)]
    pub derived: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Option<String>>,
}

/// Splits `A_S1.fastq.gz` into (`A_S1`, `.fastq.gz`).
pub fn split_fastq_name(path: &Path) -> (String, String) {
    let file_name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let lower = file_name.to_ascii_lowercase();
    for suffix in FASTQ_SUFFIXES {
        if lower.ends_with(suffix) && lower.len() > suffix.len() {
            let cut = file_name.len() - suffix.len();
            return (file_name[..cut].to_string(), file_name[cut..].to_string());
        }
    }
    match file_name.rfind('.') {
        Some(dot) if dot > 0 => (
            file_name[..dot].to_string(),
            file_name[dot..].to_string(),
        ),
        _ => (file_name, String::new()),
    }
}

pub fn is_fastq_path(path: &Path) -> bool {
    let lower = path.to_string_lossy().to_ascii_lowercase();
    FASTQ_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

impl Sample {
    pub fn new(filename: PathBuf, name: String) -> Self {
        let sample = name.split('_').next().unwrap_or(&name).to_string();
        Self {
            name,
            sample,
            filename,
            read_length: None,
            derived: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn derived_path(&self, field: &str) -> Option<&Path> {
        self.derived.get(field).map(PathBuf::as_path)
    }

    pub fn trimmed(&self) -> Option<&Path> {
        self.derived_path(TRIMMED)
    }

    pub fn bam_file(&self) -> Option<&Path> {
        self.derived_path(BAM_FILE)
    }

    /// Trimmed reads when present, raw reads otherwise.
    pub fn reads_for_alignment(&self) -> &Path {
        self.trimmed().unwrap_or(&self.filename)
    }

    /// File name the Trim stage writes for this sample, e.g. `A.fastq.gz`.
    pub fn trimmed_file_name(&self) -> String {
        let (_, suffix) = split_fastq_name(&self.filename);
        format!("{}{}", self.name, suffix)
    }

    /// Value of a table column by name, as used for metadata joins.
    pub fn column(&self, key: &str) -> Option<String> {
        match key {
            "name" => Some(self.name.clone()),
            "sample" => Some(self.sample.clone()),
            "filename" => Some(self.filename.to_string_lossy().to_string()),
            "read_length" => self.read_length.map(|n| n.to_string()),
            other => {
                if let Some(path) = self.derived.get(other) {
                    return Some(path.to_string_lossy().to_string());
                }
                self.metadata.get(other).cloned().flatten()
            }
        }
    }

    fn has_column(&self, key: &str) -> bool {
        matches!(key, "name" | "sample" | "filename" | "read_length")
            || self.derived.contains_key(key)
            || self.metadata.contains_key(key)
    }
}

/// Ordered table of samples, unique on `filename` and on `name`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleSet {
    samples: Vec<Sample>,
}

impl SampleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Sample> {
        self.samples.iter().find(|s| s.name == name)
    }

    pub fn contains_file(&self, filename: &Path) -> bool {
        self.samples.iter().any(|s| s.filename == filename)
    }

    /// BAM paths recorded so far, in table order.
    pub fn bam_files(&self) -> Vec<PathBuf> {
        self.samples
            .iter()
            .filter_map(|s| s.bam_file().map(Path::to_path_buf))
            .collect()
    }

    fn unique_name(&self, base: &str, taken: &HashSet<String>) -> String {
        let is_free = |candidate: &str| {
            !taken.contains(candidate) && self.samples.iter().all(|s| s.name != candidate)
        };
        if is_free(base) {
            return base.to_string();
        }
        let mut i = 2usize;
        loop {
            let candidate = format!("{base}_{i}");
            if is_free(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }

    /// Appends every file not already present (exact path match) and probes
    /// the read length of the new rows. Returns the number of rows added.
    pub fn add(&mut self, filenames: &[PathBuf], probe: &dyn ReadLengthProbe) -> usize {
        if filenames.is_empty() {
            return 0;
        }
        let mut seen: HashSet<&Path> = HashSet::new();
        let mut taken: HashSet<String> = HashSet::new();
        let mut new_rows: Vec<Sample> = vec![];
        for filename in filenames {
            if !seen.insert(filename.as_path()) || self.contains_file(filename) {
                continue;
            }
            let (stem, _) = split_fastq_name(filename);
            let name = self.unique_name(&stem, &taken);
            taken.insert(name.clone());
            new_rows.push(Sample::new(filename.clone(), name));
        }

        new_rows.par_iter_mut().for_each(|sample| {
            match probe.read_length(&sample.filename) {
                Ok(len) => sample.read_length = Some(len),
                Err(e) => warn!(
                    "Could not determine read length of '{}': {e:#}",
                    sample.filename.display()
                ),
            }
        });

        let added = new_rows.len();
        self.samples.extend(new_rows);
        info!(
            "Added {added} of {} file(s); {} sample(s) in table",
            filenames.len(),
            self.samples.len()
        );
        added
    }

    /// FASTQ files directly inside `dir`, sorted by path.
    pub fn files_in_folder(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
        let entries = fs::read_dir(dir).map_err(|e| {
            PipelineError::io(format!("Could not read folder '{}': {e}", dir.display()))
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_fastq_path(path))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Left join of an external CSV/TSV table on `local_key == external_key`.
    ///
    /// Every non-key external column becomes a metadata column; samples
    /// without a match get `None` in each. The first external row wins when
    /// a key repeats. On error the table is left untouched.
    pub fn merge_metadata(
        &mut self,
        table: &Path,
        local_key: &str,
        external_key: &str,
    ) -> Result<usize, PipelineError> {
        if let Some(sample) = self.samples.iter().find(|s| !s.has_column(local_key)) {
            return Err(PipelineError::metadata(format!(
                "Join column '{local_key}' is missing for sample '{}'",
                sample.name
            )));
        }
        let delimiter = match table.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("tsv") || ext.eq_ignore_ascii_case("tab") => {
                b'\t'
            }
            _ => b',',
        };
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .from_path(table)
            .map_err(|e| {
                PipelineError::metadata(format!(
                    "Could not read metadata table '{}': {e}",
                    table.display()
                ))
            })?;
        let headers = reader
            .headers()
            .map_err(|e| {
                PipelineError::metadata(format!(
                    "Could not read header of '{}': {e}",
                    table.display()
                ))
            })?
            .clone();
        let key_idx = headers
            .iter()
            .position(|h| h == external_key)
            .ok_or_else(|| {
                PipelineError::metadata(format!(
                    "Join column '{external_key}' not found in '{}'",
                    table.display()
                ))
            })?;

        let mut rows: HashMap<String, csv::StringRecord> = HashMap::new();
        for record in reader.records() {
            let record = record.map_err(|e| {
                PipelineError::metadata(format!(
                    "Malformed row in '{}': {e}",
                    table.display()
                ))
            })?;
            if let Some(key) = record.get(key_idx) {
                rows.entry(key.to_string()).or_insert(record);
            }
        }

        let mut merged = self.samples.clone();
        let mut matched = 0;
        for sample in merged.iter_mut() {
            let row = sample.column(local_key).and_then(|value| rows.get(&value));
            if row.is_some() {
                matched += 1;
            }
            for (idx, header) in headers.iter().enumerate() {
                if idx == key_idx {
                    continue;
                }
                let value = row.and_then(|r| r.get(idx)).map(str::to_string);
                sample.metadata.insert(header.to_string(), value);
            }
        }
        self.samples = merged;
        info!(
            "Merged metadata from '{}': {matched} of {} sample(s) matched",
            table.display(),
            self.samples.len()
        );
        Ok(matched)
    }

    /// Records a derived artifact path for one sample.
    pub fn assign(&mut self, row_key: &str, field: &str, value: PathBuf) -> Result<(), PipelineError> {
        let sample = self
            .samples
            .iter_mut()
            .find(|s| s.name == row_key)
            .ok_or_else(|| PipelineError::invalid_input(format!("No sample named '{row_key}'")))?;
        sample.derived.insert(field.to_string(), value);
        Ok(())
    }

    /// Drops derived paths whose files no longer exist; returns how many.
    pub fn forget_missing_derived(&mut self) -> usize {
        let mut dropped = 0;
        for sample in self.samples.iter_mut() {
            let before = sample.derived.len();
            sample.derived.retain(|_, path| path.exists());
            dropped += before - sample.derived.len();
        }
        dropped
    }

    pub fn to_snapshot(&self) -> Vec<Sample> {
        self.samples.clone()
    }

    pub fn from_snapshot(samples: Vec<Sample>) -> Result<Self, PipelineError> {
        let mut files = HashSet::new();
        let mut names = HashSet::new();
        for sample in &samples {
            if !files.insert(sample.filename.clone()) {
                return Err(PipelineError::persistence(format!(
                    "Duplicate input file '{}'",
                    sample.filename.display()
                )));
            }
            if !names.insert(sample.name.clone()) {
                return Err(PipelineError::persistence(format!(
                    "Duplicate sample name '{}'",
                    sample.name
                )));
            }
        }
        Ok(Self { samples })
    }
}
