//! Region-of-difference (RD) typing of MTBC samples.
//!
//! Coverage over each RD is normalised by the sample's mean depth on the
//! reference contig; a region counts as present when that ratio reaches the
//! cutoff. Samples are then labelled by the first matching entry of
//! [`SPECIES_RULES`]. A sample without any usable coverage is labelled
//! [`UNKNOWN_SPECIES`] instead of being read as "every region absent".

use crate::tools::{RdClassifier, RdIndexBuilder};
use anyhow::{Context, bail};
use bio::io::bed;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const H37RV_CHROM: &str = "NC_000962.3";
pub const UNKNOWN_SPECIES: &str = "unknown";

/// Approximate H37Rv coordinates (0-based, end exclusive).
const BUILTIN_REGIONS: [(&str, u64, u64); 9] = [
    ("RD1", 4_349_000, 4_358_500),
    ("RD2", 2_220_000, 2_231_000),
    ("RD4", 1_695_000, 1_708_000),
    ("RD7", 2_207_000, 2_215_000),
    ("RD8", 4_056_000, 4_062_000),
    ("RD9", 2_330_000, 2_332_000),
    ("RD10", 264_000, 266_000),
    ("RD12", 3_484_000, 3_488_000),
    ("RD13", 3_479_000, 3_483_000),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdRegion {
    pub name: String,
    pub chrom: String,
    pub start: u64,
    pub end: u64,
}

impl RdRegion {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RdIndex {
    pub regions: Vec<RdRegion>,
}

impl RdIndex {
    pub fn builtin() -> Self {
        Self {
            regions: BUILTIN_REGIONS
                .iter()
                .map(|(name, start, end)| RdRegion {
                    name: name.to_string(),
                    chrom: H37RV_CHROM.to_string(),
                    start: *start,
                    end: *end,
                })
                .collect(),
        }
    }

    /// Regions from a BED file; unnamed lines become `region_N`.
    pub fn from_bed(path: &Path) -> anyhow::Result<Self> {
        let mut reader = bed::Reader::from_file(path)
            .with_context(|| format!("Could not read BED file '{}'", path.display()))?;
        let mut regions = vec![];
        for (line_no, record) in reader.records().enumerate() {
            let record =
                record.with_context(|| format!("Bad BED record {} in '{}'", line_no + 1, path.display()))?;
            if record.end() <= record.start() {
                bail!("Empty region on BED line {}", line_no + 1);
            }
            let name = record
                .name()
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("region_{}", regions.len() + 1));
            regions.push(RdRegion {
                name,
                chrom: record.chrom().to_string(),
                start: record.start(),
                end: record.end(),
            });
        }
        if regions.is_empty() {
            bail!("No regions in BED file '{}'", path.display());
        }
        Ok(Self { regions })
    }

    /// Distinct contigs the regions lie on, in first-seen order.
    pub fn contigs(&self) -> Vec<String> {
        self.regions
            .iter()
            .map(|r| r.chrom.clone())
            .unique()
            .collect()
    }

    pub fn to_bed(&self) -> String {
        self.regions
            .iter()
            .map(|r| format!("{}\t{}\t{}\t{}\n", r.chrom, r.start, r.end, r.name))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.regions.iter().map(|r| r.name.clone()).collect()
    }
}

/// Default [`RdIndexBuilder`]: a BED file when given, otherwise the
/// built-in H37Rv table.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinRdIndex;

impl RdIndexBuilder for BuiltinRdIndex {
    fn build(&self, regions: Option<&Path>) -> anyhow::Result<RdIndex> {
        match regions {
            Some(path) => RdIndex::from_bed(path),
            None => Ok(RdIndex::builtin()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdSampleCoverage {
    pub name: String,
    /// Mean depth over the whole reference contig.
    pub baseline: f64,
    /// Mean depth per region, in [`RdCoverage::regions`] order.
    pub depth: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RdCoverage {
    pub regions: Vec<String>,
    pub samples: Vec<RdSampleCoverage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdMatrixRow {
    pub sample: String,
    pub ratios: Vec<f64>,
    pub present: Vec<bool>,
    pub species: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RdMatrix {
    pub regions: Vec<String>,
    pub cutoff: f64,
    pub rows: Vec<RdMatrixRow>,
}

/// Presence/absence grid ready for a heatmap: rows are `sample (species)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heatmap {
    pub row_labels: Vec<String>,
    pub column_labels: Vec<String>,
    pub values: Vec<Vec<u8>>,
}

impl RdMatrix {
    pub fn heatmap(&self) -> Heatmap {
        Heatmap {
            row_labels: self
                .rows
                .iter()
                .map(|row| format!("{} ({})", row.sample, row.species))
                .collect(),
            column_labels: self.regions.clone(),
            values: self
                .rows
                .iter()
                .map(|row| row.present.iter().map(|p| u8::from(*p)).collect())
                .collect(),
        }
    }

    pub fn write_csv(&self, path: &Path) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Could not create '{}'", path.display()))?;
        let mut header = vec!["sample".to_string()];
        header.extend(self.regions.iter().cloned());
        header.push("species".to_string());
        writer.write_record(&header)?;
        for row in &self.rows {
            let mut record = vec![row.sample.clone()];
            record.extend(row.ratios.iter().map(|r| format!("{r:.3}")));
            record.push(row.species.clone());
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Stored under the `rd_result` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdReport {
    pub matrix: RdMatrix,
    pub matrix_file: PathBuf,
    pub heatmap: Heatmap,
}

pub struct SpeciesRule {
    pub label: &'static str,
    pub present: &'static [&'static str],
    pub absent: &'static [&'static str],
}

/// Checked in order; the first rule whose conditions all hold wins.
pub const SPECIES_RULES: [SpeciesRule; 6] = [
    SpeciesRule {
        label: "M. tuberculosis",
        present: &["RD9"],
        absent: &[],
    },
    SpeciesRule {
        label: "M. bovis BCG",
        present: &[],
        absent: &["RD1", "RD4"],
    },
    SpeciesRule {
        label: "M. bovis",
        present: &[],
        absent: &["RD4"],
    },
    SpeciesRule {
        label: "M. caprae",
        present: &[],
        absent: &["RD12"],
    },
    SpeciesRule {
        label: "M. africanum L6",
        present: &[],
        absent: &["RD10"],
    },
    SpeciesRule {
        label: "M. africanum L5",
        present: &[],
        absent: &[],
    },
];

const RULE_REGIONS: [&str; 5] = ["RD1", "RD4", "RD9", "RD10", "RD12"];

pub fn apply_rules(regions: &[String], present: &[bool]) -> String {
    let lookup = |name: &str| {
        regions
            .iter()
            .position(|r| r == name)
            .and_then(|i| present.get(i).copied())
    };
    if RULE_REGIONS.iter().any(|name| lookup(name).is_none()) {
        return UNKNOWN_SPECIES.to_string();
    }
    SPECIES_RULES
        .iter()
        .find(|rule| {
            rule.present.iter().all(|r| lookup(r) == Some(true))
                && rule.absent.iter().all(|r| lookup(r) == Some(false))
        })
        .map(|rule| rule.label.to_string())
        .unwrap_or_else(|| UNKNOWN_SPECIES.to_string())
}

fn median(values: &[f64]) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub fn get_matrix(coverage: &RdCoverage, cutoff: f64) -> RdMatrix {
    let rows = coverage
        .samples
        .iter()
        .map(|sample| {
            let baseline = if sample.baseline > 0.0 {
                sample.baseline
            } else {
                median(&sample.depth)
            };
            let covered = baseline > 0.0 && sample.depth.iter().any(|d| *d > 0.0);
            let ratios: Vec<f64> = sample
                .depth
                .iter()
                .map(|d| if covered { d / baseline } else { 0.0 })
                .collect();
            let present: Vec<bool> = ratios.iter().map(|r| *r >= cutoff).collect();
            let species = if covered {
                apply_rules(&coverage.regions, &present)
            } else {
                UNKNOWN_SPECIES.to_string()
            };
            RdMatrixRow {
                sample: sample.name.clone(),
                ratios,
                present,
                species,
            }
        })
        .collect();
    RdMatrix {
        regions: coverage.regions.clone(),
        cutoff,
        rows,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RuleClassifier;

impl RdClassifier for RuleClassifier {
    fn classify(&self, coverage: &RdCoverage, cutoff: f64) -> anyhow::Result<RdMatrix> {
        if let Some(sample) = coverage
            .samples
            .iter()
            .find(|s| s.depth.len() != coverage.regions.len())
        {
            bail!(
                "Coverage for '{}' has {} value(s) for {} region(s)",
                sample.name,
                sample.depth.len(),
                coverage.regions.len()
            );
        }
        Ok(get_matrix(coverage, cutoff))
    }
}
