//! Narrow interfaces to the collaborators each stage consumes.
//!
//! Every trait is object safe and `Send + Sync` so a [`Toolkit`] can be
//! shared with the worker thread. Implementations report failures as
//! `anyhow::Error`, usually wrapping an
//! [`ExternalToolError`](crate::error::ExternalToolError).

use crate::annotation::{AnnotationFeature, GenbankAnnotation, Gff3Converter};
use crate::external::{
    BcftoolsCaller, ExternalAligner, ExternalIndexer, FastpTrimmer, RaxmlTreeBuilder,
    SamtoolsRdFinder,
};
use crate::rd_analysis::{BuiltinRdIndex, RdCoverage, RdIndex, RdMatrix, RuleClassifier};
use crate::read_length::FastqReadLength;
use crate::scheduler::Progress;
use crate::settings::AlignerKind;
use crate::snp_alignment::{SnpAlignment, VcfSnpExtractor};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

pub trait ReadLengthProbe: Send + Sync {
    fn read_length(&self, filename: &Path) -> anyhow::Result<u64>;
}

pub trait Trimmer: Send + Sync {
    fn trim(&self, input: &Path, output: &Path, quality: u8) -> anyhow::Result<()>;
}

pub trait Indexer: Send + Sync {
    /// Returns the index prefix. Skips the build when the index files exist
    /// and are newer than `reference`.
    fn build_index(
        &self,
        reference: &Path,
        aligner: AlignerKind,
        progress: &Progress,
    ) -> anyhow::Result<PathBuf>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleReads {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AlignJob {
    pub reads: Vec<SampleReads>,
    pub index: PathBuf,
    pub reference: PathBuf,
    pub out_dir: PathBuf,
    pub overwrite: bool,
    pub threads: usize,
    pub aligner: AlignerKind,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignSummary {
    pub aligned: usize,
    pub skipped: usize,
}

pub trait Aligner: Send + Sync {
    /// `record(name, bam)` is called once per sample as soon as its BAM is
    /// in place, so rows are written as the stage goes.
    fn align(
        &self,
        job: &AlignJob,
        progress: &Progress,
        record: &mut dyn FnMut(&str, PathBuf) -> anyhow::Result<()>,
    ) -> anyhow::Result<AlignSummary>;
}

#[derive(Debug, Clone)]
pub struct VariantCallJob {
    pub bam_files: Vec<PathBuf>,
    pub reference: PathBuf,
    pub out_dir: PathBuf,
    pub threads: usize,
    pub overwrite: bool,
    pub filters: String,
    pub feature_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantCallArtifacts {
    pub vcf_file: PathBuf,
    pub csq_matrix: PathBuf,
}

pub trait VariantCaller: Send + Sync {
    fn call(&self, job: &VariantCallJob, progress: &Progress)
    -> anyhow::Result<VariantCallArtifacts>;
}

pub trait AnnotationConverter: Send + Sync {
    /// Writes the caller's feature file for `genbank` to `feature_file`.
    fn convert(&self, genbank: &Path, feature_file: &Path) -> anyhow::Result<PathBuf>;
}

pub trait AnnotationParser: Send + Sync {
    fn parse(&self, genbank: &Path) -> anyhow::Result<Vec<AnnotationFeature>>;
}

pub trait SnpExtractor: Send + Sync {
    fn extract(
        &self,
        vcf: &Path,
        reference: &Path,
        progress: &Progress,
    ) -> anyhow::Result<SnpAlignment>;
}

#[derive(Debug, Clone)]
pub struct TreeJob {
    /// Multiple alignment in FASTA, one row per taxon.
    pub alignment: PathBuf,
    pub out_dir: PathBuf,
    pub threads: usize,
    pub bootstraps: u32,
    pub overwrite: bool,
}

pub trait TreeBuilder: Send + Sync {
    /// Returns the Newick tree with bootstrap support values.
    fn build_tree(&self, job: &TreeJob, progress: &Progress) -> anyhow::Result<PathBuf>;
}

pub trait RdIndexBuilder: Send + Sync {
    /// `regions` is an optional BED file replacing the built-in index.
    fn build(&self, regions: Option<&Path>) -> anyhow::Result<RdIndex>;
}

pub trait RdRegionFinder: Send + Sync {
    fn find_regions(
        &self,
        samples: &[SampleReads],
        index: &RdIndex,
        out_dir: &Path,
        threads: usize,
        progress: &Progress,
    ) -> anyhow::Result<RdCoverage>;
}

pub trait RdClassifier: Send + Sync {
    fn classify(&self, coverage: &RdCoverage, cutoff: f64) -> anyhow::Result<RdMatrix>;
}

/// The full set of collaborators a pipeline runs with.
#[derive(Clone)]
pub struct Toolkit {
    pub read_length: Arc<dyn ReadLengthProbe>,
    pub trimmer: Arc<dyn Trimmer>,
    pub indexer: Arc<dyn Indexer>,
    pub aligner: Arc<dyn Aligner>,
    pub variant_caller: Arc<dyn VariantCaller>,
    pub annotation_converter: Arc<dyn AnnotationConverter>,
    pub annotation_parser: Arc<dyn AnnotationParser>,
    pub snp_extractor: Arc<dyn SnpExtractor>,
    pub tree_builder: Arc<dyn TreeBuilder>,
    pub rd_index: Arc<dyn RdIndexBuilder>,
    pub rd_finder: Arc<dyn RdRegionFinder>,
    pub rd_classifier: Arc<dyn RdClassifier>,
}

impl Toolkit {
    /// Native parsers plus the subprocess-backed tools resolved through
    /// [`tool_overrides`](crate::tool_overrides).
    pub fn system() -> Self {
        Self {
            read_length: Arc::new(FastqReadLength::default()),
            trimmer: Arc::new(FastpTrimmer),
            indexer: Arc::new(ExternalIndexer),
            aligner: Arc::new(ExternalAligner),
            variant_caller: Arc::new(BcftoolsCaller),
            annotation_converter: Arc::new(Gff3Converter),
            annotation_parser: Arc::new(GenbankAnnotation),
            snp_extractor: Arc::new(VcfSnpExtractor),
            tree_builder: Arc::new(RaxmlTreeBuilder),
            rd_index: Arc::new(BuiltinRdIndex),
            rd_finder: Arc::new(SamtoolsRdFinder),
            rd_classifier: Arc::new(RuleClassifier),
        }
    }
}

impl std::fmt::Debug for Toolkit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Toolkit")
    }
}
