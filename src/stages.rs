//! The workflow stages: their preconditions and their bodies.
//!
//! Preconditions are checked on the caller's thread before submission. A
//! body runs on the scheduler's worker and writes per-row results into the
//! shared session as each sample finishes, so a failure part-way through
//! keeps the rows already written.

use crate::error::PipelineError;
use crate::rd_analysis::{RdIndex, RdReport};
use crate::sample_set::{BAM_FILE, TRIMMED};
use crate::scheduler::Progress;
use crate::session::{
    CORE_FASTA, CSQ_MATRIX, MAPPED_DIR, PHYLOGENY_DIR, RD_DIR, RD_MATRIX_FILE, RD_RESULT,
    ResultEntry, SNP_FILE, SNP_MATRIX, SNP_MATRIX_FILE, Session, TREE_FILE, TRIMMED_DIR,
    VCF_FILE,
};
use crate::settings::PipelineSettings;
use crate::tools::{AlignJob, SampleReads, Toolkit, TreeJob, VariantCallJob};
use anyhow::{Context, anyhow};
use bio::io::fasta;
use clap::ValueEnum;
use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Trim,
    Align,
    CallVariants,
    SnpAlignment,
    RdAnalysis,
    Phylogeny,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Trim,
        Stage::Align,
        Stage::CallVariants,
        Stage::SnpAlignment,
        Stage::RdAnalysis,
        Stage::Phylogeny,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Trim => "trim",
            Stage::Align => "align",
            Stage::CallVariants => "call-variants",
            Stage::SnpAlignment => "snp-alignment",
            Stage::RdAnalysis => "rd-analysis",
            Stage::Phylogeny => "phylogeny",
        }
    }

    /// Synchronous readiness check; an `Err` means nothing is scheduled.
    pub fn check_preconditions(&self, session: &Session) -> Result<(), PipelineError> {
        let mut missing: Vec<&str> = vec![];
        if session.output_dir.is_none() {
            missing.push("output folder");
        }
        if matches!(self, Stage::Trim | Stage::Align | Stage::RdAnalysis)
            && session.samples.is_empty()
        {
            missing.push("input files");
        }
        missing.extend(session.reference.missing_for(*self));
        match self {
            Stage::CallVariants | Stage::RdAnalysis if session.samples.bam_files().is_empty() => {
                missing.push("aligned samples (run align first)");
            }
            Stage::SnpAlignment if session.results.path(VCF_FILE).is_none() => {
                missing.push("variant calls (run call-variants first)");
            }
            Stage::Phylogeny if session.results.path(SNP_FILE).is_none() => {
                missing.push("SNP alignment (run snp-alignment first)");
            }
            _ => {}
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::precondition(format!(
                "{} is not ready: missing {}",
                self.label(),
                missing.join(", ")
            )))
        }
    }

    pub fn run(self, ctx: &StageContext, progress: &Progress) -> anyhow::Result<StageReport> {
        let started = Instant::now();
        let messages = Arc::new(Mutex::new(vec![]));
        let tee = {
            let messages = messages.clone();
            let outer = progress.clone();
            Progress::new(move |message: String| {
                if let Ok(mut guard) = messages.lock() {
                    guard.push(message.clone());
                }
                outer.emit(message);
            })
        };
        let (processed, skipped) = match self {
            Stage::Trim => run_trim(ctx, &tee)?,
            Stage::Align => run_align(ctx, &tee)?,
            Stage::CallVariants => run_call_variants(ctx, &tee)?,
            Stage::SnpAlignment => run_snp_alignment(ctx, &tee)?,
            Stage::RdAnalysis => run_rd_analysis(ctx, &tee)?,
            Stage::Phylogeny => run_phylogeny(ctx, &tee)?,
        };
        let messages = match messages.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let report = StageReport {
            stage: self,
            processed,
            skipped,
            elapsed_ms: started.elapsed().as_millis(),
            messages,
        };
        info!(
            "Stage {} processed {} and skipped {} item(s)",
            self, report.processed, report.skipped
        );
        Ok(report)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub processed: usize,
    pub skipped: usize,
    pub elapsed_ms: u128,
    pub messages: Vec<String>,
}

/// Cached RD index and the BED path it was built from.
pub type RdIndexCache = Arc<Mutex<Option<(Option<PathBuf>, RdIndex)>>>;

/// Everything a stage body needs, cloned into the submitted closure.
#[derive(Clone)]
pub struct StageContext {
    pub session: Arc<Mutex<Session>>,
    pub toolkit: Toolkit,
    pub settings: PipelineSettings,
    pub rd_index: RdIndexCache,
}

impl StageContext {
    pub fn session(&self) -> MutexGuard<'_, Session> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn create_dir(path: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(path).with_context(|| format!("Could not create '{}'", path.display()))
}

fn run_trim(ctx: &StageContext, progress: &Progress) -> anyhow::Result<(usize, usize)> {
    let (out_dir, jobs) = {
        let session = ctx.session();
        let out_dir = session.subdir(TRIMMED_DIR)?;
        let jobs: Vec<(String, PathBuf, PathBuf)> = session
            .samples
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    s.filename.clone(),
                    out_dir.join(s.trimmed_file_name()),
                )
            })
            .collect();
        (out_dir, jobs)
    };
    create_dir(&out_dir)?;
    progress.emit("Running trimming");
    let started = Instant::now();
    let (mut processed, mut skipped) = (0, 0);
    for (name, input, output) in jobs {
        progress.emit(output.display().to_string());
        if output.exists() && !ctx.settings.overwrite {
            skipped += 1;
        } else {
            ctx.toolkit
                .trimmer
                .trim(&input, &output, ctx.settings.quality)
                .with_context(|| format!("Trimming '{}'", input.display()))?;
            processed += 1;
        }
        ctx.session().samples.assign(&name, TRIMMED, output)?;
    }
    progress.emit(format!(
        "took {:.1} seconds",
        started.elapsed().as_secs_f64()
    ));
    Ok((processed, skipped))
}

fn run_align(ctx: &StageContext, progress: &Progress) -> anyhow::Result<(usize, usize)> {
    let (reads, reference, out_dir) = {
        let session = ctx.session();
        let reads: Vec<SampleReads> = session
            .samples
            .iter()
            .map(|s| SampleReads {
                name: s.name.clone(),
                path: s.reads_for_alignment().to_path_buf(),
            })
            .collect();
        let reference = session
            .reference
            .sequence_path
            .clone()
            .ok_or_else(|| PipelineError::precondition("no reference genome is set"))?;
        (reads, reference, session.subdir(MAPPED_DIR)?)
    };
    progress.emit(format!(
        "Aligning {} sample(s); this may take some time",
        reads.len()
    ));
    let index = ctx
        .toolkit
        .indexer
        .build_index(&reference, ctx.settings.aligner, progress)
        .context("Building the reference index")?;
    progress.emit(format!("Using reference genome: {}", reference.display()));
    create_dir(&out_dir)?;
    let job = AlignJob {
        reads,
        index,
        reference,
        out_dir,
        overwrite: ctx.settings.overwrite,
        threads: ctx.settings.threads,
        aligner: ctx.settings.aligner,
    };
    let summary = ctx.toolkit.aligner.align(&job, progress, &mut |name, bam| {
        ctx.session().samples.assign(name, BAM_FILE, bam)?;
        Ok(())
    })?;
    Ok((summary.aligned, summary.skipped))
}

fn run_call_variants(ctx: &StageContext, progress: &Progress) -> anyhow::Result<(usize, usize)> {
    let (bam_files, reference, annotation, out_dir) = {
        let session = ctx.session();
        let bam_files: Vec<PathBuf> = session.samples.bam_files().into_iter().unique().collect();
        let reference = session
            .reference
            .sequence_path
            .clone()
            .ok_or_else(|| PipelineError::precondition("no reference genome is set"))?;
        let annotation = session
            .reference
            .annotation_path
            .clone()
            .ok_or_else(|| PipelineError::precondition("no annotation file is set"))?;
        (
            bam_files,
            reference,
            annotation,
            session.require_output_dir()?.to_path_buf(),
        )
    };
    create_dir(&out_dir)?;
    let gff_name = format!(
        "{}.gff",
        annotation
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "annotation".to_string())
    );
    let feature_file = out_dir.join(gff_name);
    if feature_file.exists() {
        progress.emit(format!("Using existing {}", feature_file.display()));
    } else {
        ctx.toolkit
            .annotation_converter
            .convert(&annotation, &feature_file)
            .context("Converting the annotation for the variant caller")?;
    }
    let job = VariantCallJob {
        bam_files,
        reference,
        out_dir,
        threads: ctx.settings.threads,
        overwrite: ctx.settings.overwrite,
        filters: ctx.settings.filters.clone(),
        feature_file,
    };
    let artifacts = ctx.toolkit.variant_caller.call(&job, progress)?;
    let mut session = ctx.session();
    session.results.insert_path(VCF_FILE, artifacts.vcf_file);
    session.results.insert_path(CSQ_MATRIX, artifacts.csq_matrix);
    Ok((job.bam_files.len(), 0))
}

fn run_snp_alignment(ctx: &StageContext, progress: &Progress) -> anyhow::Result<(usize, usize)> {
    let (vcf, reference, out_dir) = {
        let session = ctx.session();
        let vcf = session
            .results
            .path(VCF_FILE)
            .map(|p| p.to_path_buf())
            .ok_or_else(|| PipelineError::precondition("no variant calls recorded"))?;
        let reference = session
            .reference
            .sequence_path
            .clone()
            .ok_or_else(|| PipelineError::precondition("no reference genome is set"))?;
        (vcf, reference, session.require_output_dir()?.to_path_buf())
    };
    progress.emit("Making SNP alignment");
    let alignment = ctx.toolkit.snp_extractor.extract(&vcf, &reference, progress)?;
    let core = out_dir.join(CORE_FASTA);
    alignment.write_fasta(&core)?;
    let matrix = out_dir.join(SNP_MATRIX_FILE);
    alignment.write_site_matrix(&matrix)?;
    progress.emit(format!(
        "Wrote {} site(s) for {} sample(s) to {}",
        alignment.sites.len(),
        alignment.samples.len(),
        core.display()
    ));
    let mut session = ctx.session();
    session.results.insert_path(SNP_FILE, core);
    session.results.insert_path(SNP_MATRIX, matrix);
    Ok((alignment.sites.len(), 0))
}

fn rd_index(ctx: &StageContext) -> anyhow::Result<RdIndex> {
    let mut cache = match ctx.rd_index.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let key = ctx.settings.rd_regions.clone();
    if let Some((cached_key, index)) = cache.as_ref() {
        if *cached_key == key {
            return Ok(index.clone());
        }
    }
    let index = ctx.toolkit.rd_index.build(key.as_deref())?;
    *cache = Some((key, index.clone()));
    Ok(index)
}

fn run_rd_analysis(ctx: &StageContext, progress: &Progress) -> anyhow::Result<(usize, usize)> {
    let (samples, out_dir) = {
        let session = ctx.session();
        let samples: Vec<SampleReads> = session
            .samples
            .iter()
            .filter_map(|s| {
                Some(SampleReads {
                    name: s.name.clone(),
                    path: s.bam_file()?.to_path_buf(),
                })
            })
            .collect();
        (samples, session.subdir(RD_DIR)?)
    };
    let index = rd_index(ctx).context("Building the RD index")?;
    progress.emit(format!(
        "Checking {} region(s) in {} sample(s)",
        index.regions.len(),
        samples.len()
    ));
    let coverage = ctx.toolkit.rd_finder.find_regions(
        &samples,
        &index,
        &out_dir,
        ctx.settings.threads,
        progress,
    )?;
    let matrix = ctx
        .toolkit
        .rd_classifier
        .classify(&coverage, ctx.settings.rd_cutoff)?;
    create_dir(&out_dir)?;
    let matrix_file = out_dir.join(RD_MATRIX_FILE);
    matrix.write_csv(&matrix_file)?;
    for row in &matrix.rows {
        progress.emit(format!("{}: {}", row.sample, row.species));
    }
    let processed = matrix.rows.len();
    let report = RdReport {
        heatmap: matrix.heatmap(),
        matrix,
        matrix_file,
    };
    ctx.session()
        .results
        .insert(RD_RESULT, ResultEntry::RdAnalysis(report));
    Ok((processed, 0))
}

/// Fewest alignment rows a tree can be inferred from.
pub const MIN_TREE_TAXA: usize = 4;

fn count_alignment_rows(path: &Path) -> anyhow::Result<usize> {
    let reader = fasta::Reader::from_file(path)
        .map_err(|e| anyhow!("Could not open alignment '{}': {e}", path.display()))?;
    let mut rows = 0;
    for record in reader.records() {
        record.with_context(|| format!("Malformed FASTA record in '{}'", path.display()))?;
        rows += 1;
    }
    Ok(rows)
}

fn run_phylogeny(ctx: &StageContext, progress: &Progress) -> anyhow::Result<(usize, usize)> {
    let (alignment, out_dir) = {
        let session = ctx.session();
        let alignment = session
            .results
            .path(SNP_FILE)
            .map(Path::to_path_buf)
            .ok_or_else(|| PipelineError::precondition("no SNP alignment recorded"))?;
        (alignment, session.subdir(PHYLOGENY_DIR)?)
    };
    let rows = count_alignment_rows(&alignment)?;
    if rows < MIN_TREE_TAXA {
        return Err(PipelineError::invalid_input(format!(
            "a tree needs at least {MIN_TREE_TAXA} aligned sequences, '{}' has {rows}",
            alignment.display()
        ))
        .into());
    }
    let job = TreeJob {
        alignment,
        out_dir,
        threads: ctx.settings.threads,
        bootstraps: ctx.settings.bootstraps,
        overwrite: ctx.settings.overwrite,
    };
    let tree = ctx.toolkit.tree_builder.build_tree(&job, progress)?;
    progress.emit(format!("Tree written to {}", tree.display()));
    ctx.session().results.insert_path(TREE_FILE, tree);
    Ok((rows, 0))
}
