//! Subprocess-backed collaborators: fastp, bwa/bowtie2, samtools, bcftools
//! and RAxML.
//!
//! Executables are resolved through [`tool_overrides`](crate::tool_overrides)
//! on every call. A non-zero exit, or a zero exit without the expected output
//! file, is reported as an [`ExternalToolError`].

use crate::error::{ExternalToolError, PipelineError};
use crate::rd_analysis::{RdCoverage, RdIndex, RdSampleCoverage};
use crate::scheduler::Progress;
use crate::session::{
    CALLS_VCF, CSQ_MATRIX_FILE, CSQ_VCF, FILTERED_VCF, RAW_BCF, RAXML_RUN, RD_BED,
};
use crate::settings::AlignerKind;
use crate::tool_overrides::ExternalTool;
use crate::tools::{
    AlignJob, AlignSummary, Aligner, Indexer, RdRegionFinder, SampleReads, TreeBuilder, TreeJob,
    Trimmer, VariantCallArtifacts, VariantCallJob, VariantCaller,
};
use anyhow::{Context, anyhow};
use itertools::Itertools;
use log::{debug, info};
use rayon::prelude::*;
use std::{
    collections::{HashMap, HashSet},
    fs::{self, File},
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
    time::{Instant, SystemTime},
};

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn spawn_failure(executable: &str, tool: ExternalTool, args: &[String], e: std::io::Error) -> anyhow::Error {
    let stderr = if e.kind() == ErrorKind::NotFound {
        format!(
            "executable not found; install '{}' or set {}",
            tool.default_bin(),
            tool.env_var()
        )
    } else {
        e.to_string()
    };
    anyhow::Error::new(ExternalToolError {
        executable: executable.to_string(),
        args: args.to_vec(),
        status: None,
        stderr,
    })
}

fn check_status(executable: &str, args: &[String], output: &Output) -> anyhow::Result<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(anyhow::Error::new(ExternalToolError {
        executable: executable.to_string(),
        args: args.to_vec(),
        status: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }))
}

/// Runs `tool` to completion and returns its captured output.
pub fn run_tool(tool: ExternalTool, args: &[String]) -> anyhow::Result<Output> {
    let executable = tool.executable();
    debug!("Running {executable} {}", args.iter().join(" "));
    let output = Command::new(&executable)
        .args(args)
        .output()
        .map_err(|e| spawn_failure(&executable, tool, args, e))?;
    check_status(&executable, args, &output)?;
    Ok(output)
}

/// Like [`run_tool`] but streams stdout into `stdout_file`.
pub fn run_tool_to_file(
    tool: ExternalTool,
    args: &[String],
    stdout_file: &Path,
) -> anyhow::Result<()> {
    let executable = tool.executable();
    debug!(
        "Running {executable} {} > {}",
        args.iter().join(" "),
        stdout_file.display()
    );
    let file = File::create(stdout_file)
        .with_context(|| format!("Could not create '{}'", stdout_file.display()))?;
    let output = Command::new(&executable)
        .args(args)
        .stdout(Stdio::from(file))
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| spawn_failure(&executable, tool, args, e))?;
    check_status(&executable, args, &output)
}

fn expect_output(tool: ExternalTool, args: &[String], path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        return Ok(());
    }
    Err(anyhow::Error::new(ExternalToolError {
        executable: tool.executable(),
        args: args.to_vec(),
        status: Some(0),
        stderr: format!("reported success but '{}' was not written", path.display()),
    }))
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// True when every `outputs` file exists and none is older than `input`.
pub fn is_up_to_date(input: &Path, outputs: &[PathBuf]) -> bool {
    let Some(source_time) = modified(input) else {
        return false;
    };
    outputs
        .iter()
        .all(|out| modified(out).is_some_and(|t| t >= source_time))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FastpTrimmer;

impl Trimmer for FastpTrimmer {
    fn trim(&self, input: &Path, output: &Path, quality: u8) -> anyhow::Result<()> {
        let report = output.with_extension("fastp");
        let args = vec![
            "-i".to_string(),
            path_arg(input),
            "-o".to_string(),
            path_arg(output),
            "-q".to_string(),
            quality.to_string(),
            "--json".to_string(),
            format!("{}.json", report.display()),
            "--html".to_string(),
            format!("{}.html", report.display()),
        ];
        run_tool(ExternalTool::Fastp, &args)?;
        expect_output(ExternalTool::Fastp, &args, output)
    }
}

pub fn index_files(reference: &Path, aligner: AlignerKind) -> Vec<PathBuf> {
    let suffixes: &[&str] = match aligner {
        AlignerKind::Bwa => &[".amb", ".ann", ".bwt", ".pac", ".sa"],
        AlignerKind::Bowtie2 => &[".1.bt2", ".2.bt2", ".3.bt2", ".4.bt2", ".rev.1.bt2", ".rev.2.bt2"],
    };
    suffixes
        .iter()
        .map(|suffix| PathBuf::from(format!("{}{suffix}", reference.display())))
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalIndexer;

impl Indexer for ExternalIndexer {
    fn build_index(
        &self,
        reference: &Path,
        aligner: AlignerKind,
        progress: &Progress,
    ) -> anyhow::Result<PathBuf> {
        let files = index_files(reference, aligner);
        if is_up_to_date(reference, &files) {
            progress.emit(format!("{aligner} index for {} is up to date", reference.display()));
            return Ok(reference.to_path_buf());
        }
        progress.emit(format!("Building {aligner} index for {}", reference.display()));
        match aligner {
            AlignerKind::Bwa => {
                let args = vec!["index".to_string(), path_arg(reference)];
                run_tool(ExternalTool::Bwa, &args)?;
            }
            AlignerKind::Bowtie2 => {
                let args = vec![path_arg(reference), path_arg(reference)];
                run_tool(ExternalTool::Bowtie2Build, &args)?;
            }
        }
        Ok(reference.to_path_buf())
    }
}

fn align_one(job: &AlignJob, reads: &SampleReads, sam: &Path, bam: &Path) -> anyhow::Result<()> {
    let threads = job.threads.to_string();
    match job.aligner {
        AlignerKind::Bwa => {
            let args = vec![
                "mem".to_string(),
                "-t".to_string(),
                threads.clone(),
                "-R".to_string(),
                format!("@RG\\tID:{0}\\tSM:{0}", reads.name),
                path_arg(&job.index),
                path_arg(&reads.path),
            ];
            run_tool_to_file(ExternalTool::Bwa, &args, sam)?;
        }
        AlignerKind::Bowtie2 => {
            let args = vec![
                "-p".to_string(),
                threads.clone(),
                "-x".to_string(),
                path_arg(&job.index),
                "-U".to_string(),
                path_arg(&reads.path),
                "--rg-id".to_string(),
                reads.name.clone(),
                "--rg".to_string(),
                format!("SM:{}", reads.name),
                "-S".to_string(),
                path_arg(sam),
            ];
            run_tool(ExternalTool::Bowtie2, &args)?;
        }
    }
    let sort_args = vec![
        "sort".to_string(),
        "-@".to_string(),
        threads,
        "-o".to_string(),
        path_arg(bam),
        path_arg(sam),
    ];
    run_tool(ExternalTool::Samtools, &sort_args)?;
    expect_output(ExternalTool::Samtools, &sort_args, bam)?;
    run_tool(ExternalTool::Samtools, &["index".to_string(), path_arg(bam)])?;
    fs::remove_file(sam).with_context(|| format!("Could not remove '{}'", sam.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalAligner;

impl Aligner for ExternalAligner {
    fn align(
        &self,
        job: &AlignJob,
        progress: &Progress,
        record: &mut dyn FnMut(&str, PathBuf) -> anyhow::Result<()>,
    ) -> anyhow::Result<AlignSummary> {
        fs::create_dir_all(&job.out_dir)
            .with_context(|| format!("Could not create '{}'", job.out_dir.display()))?;
        let mut summary = AlignSummary::default();
        for reads in &job.reads {
            let bam = job.out_dir.join(format!("{}.bam", reads.name));
            if bam.exists() && !job.overwrite {
                progress.emit(format!("{} already aligned", reads.name));
                record(&reads.name, bam)?;
                summary.skipped += 1;
                continue;
            }
            let started = Instant::now();
            let sam = job.out_dir.join(format!("{}.sam", reads.name));
            align_one(job, reads, &sam, &bam)
                .with_context(|| format!("Aligning '{}'", reads.name))?;
            record(&reads.name, bam.clone())?;
            summary.aligned += 1;
            progress.emit(format!(
                "{} -> {} took {} seconds",
                reads.name,
                bam.display(),
                started.elapsed().as_secs()
            ));
        }
        Ok(summary)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BcftoolsCaller;

impl VariantCaller for BcftoolsCaller {
    fn call(
        &self,
        job: &VariantCallJob,
        progress: &Progress,
    ) -> anyhow::Result<VariantCallArtifacts> {
        let threads = job.threads.to_string();
        let raw = job.out_dir.join(RAW_BCF);
        if job.overwrite || !raw.exists() {
            progress.emit(format!("Pileup over {} BAM file(s)", job.bam_files.len()));
            let mut args = vec![
                "mpileup".to_string(),
                "-O".to_string(),
                "b".to_string(),
                "-o".to_string(),
                path_arg(&raw),
                "-a".to_string(),
                "AD,DP".to_string(),
                "--threads".to_string(),
                threads.clone(),
                "-f".to_string(),
                path_arg(&job.reference),
            ];
            args.extend(job.bam_files.iter().map(|p| path_arg(p)));
            run_tool(ExternalTool::Bcftools, &args)?;
            expect_output(ExternalTool::Bcftools, &args, &raw)?;
        } else {
            progress.emit(format!("Using existing {}", raw.display()));
        }

        progress.emit("Calling variants");
        let calls = job.out_dir.join(CALLS_VCF);
        run_tool(
            ExternalTool::Bcftools,
            &[
                "call".to_string(),
                "--ploidy".to_string(),
                "1".to_string(),
                "-m".to_string(),
                "-v".to_string(),
                "-O".to_string(),
                "v".to_string(),
                "-o".to_string(),
                path_arg(&calls),
                path_arg(&raw),
            ],
        )?;

        progress.emit(format!("Filtering with '{}'", job.filters));
        let filtered = job.out_dir.join(FILTERED_VCF);
        let filter_args = vec![
            "filter".to_string(),
            "-i".to_string(),
            job.filters.clone(),
            "-O".to_string(),
            "z".to_string(),
            "-o".to_string(),
            path_arg(&filtered),
            path_arg(&calls),
        ];
        run_tool(ExternalTool::Bcftools, &filter_args)?;
        expect_output(ExternalTool::Bcftools, &filter_args, &filtered)?;

        progress.emit("Predicting consequences");
        let csq = job.out_dir.join(CSQ_VCF);
        run_tool(
            ExternalTool::Bcftools,
            &[
                "csq".to_string(),
                "-p".to_string(),
                "a".to_string(),
                "-f".to_string(),
                path_arg(&job.reference),
                "-g".to_string(),
                path_arg(&job.feature_file),
                "-O".to_string(),
                "v".to_string(),
                "-o".to_string(),
                path_arg(&csq),
                path_arg(&filtered),
            ],
        )?;

        let samples = run_tool(ExternalTool::Bcftools, &["query".to_string(), "-l".to_string(), path_arg(&csq)])?;
        let names = String::from_utf8_lossy(&samples.stdout)
            .lines()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .join("\t");
        let body = run_tool(
            ExternalTool::Bcftools,
            &[
                "query".to_string(),
                "-f".to_string(),
                "%CHROM\\t%POS\\t%REF\\t%ALT\\t%BCSQ[\\t%GT]\\n".to_string(),
                path_arg(&csq),
            ],
        )?;
        let csq_matrix = job.out_dir.join(CSQ_MATRIX_FILE);
        let mut text = format!("chrom\tpos\tref\talt\tbcsq\t{names}\n");
        text.push_str(&String::from_utf8_lossy(&body.stdout));
        fs::write(&csq_matrix, text)
            .with_context(|| format!("Could not write '{}'", csq_matrix.display()))?;
        info!(
            "Variant calling wrote {} and {}",
            filtered.display(),
            csq_matrix.display()
        );
        Ok(VariantCallArtifacts {
            vcf_file: filtered,
            csq_matrix,
        })
    }
}

/// Every file of a previous RAxML run named `run` in `dir`.
pub fn raxml_outputs(dir: &Path, run: &str) -> Vec<PathBuf> {
    let suffix = format!(".{run}");
    let Ok(entries) = fs::read_dir(dir) else {
        return vec![];
    };
    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|n| n.to_string_lossy())
                .is_some_and(|n| n.starts_with("RAxML_") && n.ends_with(&suffix))
        })
        .sorted()
        .collect()
}

/// Rapid bootstrap plus best-scoring ML tree (`raxmlHPC -f a`).
#[derive(Debug, Clone, Copy, Default)]
pub struct RaxmlTreeBuilder;

impl TreeBuilder for RaxmlTreeBuilder {
    fn build_tree(&self, job: &TreeJob, progress: &Progress) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&job.out_dir)
            .with_context(|| format!("Could not create '{}'", job.out_dir.display()))?;
        // RAxML wants an absolute working directory
        let work_dir = fs::canonicalize(&job.out_dir)
            .with_context(|| format!("Could not resolve '{}'", job.out_dir.display()))?;
        let tree = work_dir.join(format!("RAxML_bipartitions.{RAXML_RUN}"));
        if tree.exists() && !job.overwrite {
            progress.emit(format!("Using existing {}", tree.display()));
            return Ok(tree);
        }
        // RAxML refuses to reuse a run name
        for stale in raxml_outputs(&work_dir, RAXML_RUN) {
            fs::remove_file(&stale)
                .with_context(|| format!("Could not remove '{}'", stale.display()))?;
        }
        progress.emit(format!(
            "Building tree from {} with {} bootstrap(s)",
            job.alignment.display(),
            job.bootstraps
        ));
        let args = vec![
            "-f".to_string(),
            "a".to_string(),
            "-N".to_string(),
            job.bootstraps.to_string(),
            "-T".to_string(),
            job.threads.max(2).to_string(),
            "-m".to_string(),
            "GTRCAT".to_string(),
            "-V".to_string(),
            "-p".to_string(),
            "1234".to_string(),
            "-x".to_string(),
            "1234".to_string(),
            "-s".to_string(),
            path_arg(&job.alignment),
            "-n".to_string(),
            RAXML_RUN.to_string(),
            "-w".to_string(),
            path_arg(&work_dir),
        ];
        run_tool(ExternalTool::Raxml, &args)?;
        expect_output(ExternalTool::Raxml, &args, &tree)?;
        info!("RAxML wrote {}", tree.display());
        Ok(tree)
    }
}

/// Mean depth of `chrom` from `samtools coverage` output.
pub fn parse_coverage_meandepth(text: &str, chrom: &str) -> Option<f64> {
    text.lines()
        .filter(|line| !line.starts_with('#'))
        .map(|line| line.split('\t').collect::<Vec<_>>())
        .find(|fields| fields.first() == Some(&chrom))
        .and_then(|fields| fields.get(6)?.parse().ok())
}

/// Contigs of `index` that `samtools coverage` does not list, i.e. that are
/// absent from the BAM header.
pub fn missing_contigs(coverage: &str, index: &RdIndex) -> Vec<String> {
    let listed: HashSet<&str> = coverage
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split('\t').next())
        .collect();
    index
        .contigs()
        .into_iter()
        .filter(|chrom| !listed.contains(chrom.as_str()))
        .collect()
}

/// Mean depth per region from `samtools bedcov` output, in `index` order.
pub fn parse_bedcov(text: &str, index: &RdIndex) -> anyhow::Result<Vec<f64>> {
    let mut sums = HashMap::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        let (Some(name), Some(sum)) = (fields.get(3), fields.last()) else {
            continue;
        };
        let sum: f64 = sum
            .parse()
            .map_err(|_| anyhow!("Unexpected bedcov line '{line}'"))?;
        sums.insert(name.to_string(), sum);
    }
    index
        .regions
        .iter()
        .map(|region| {
            let sum = sums
                .get(&region.name)
                .ok_or_else(|| anyhow!("bedcov reported no value for {}", region.name))?;
            Ok(sum / region.len().max(1) as f64)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SamtoolsRdFinder;

impl RdRegionFinder for SamtoolsRdFinder {
    fn find_regions(
        &self,
        samples: &[SampleReads],
        index: &RdIndex,
        out_dir: &Path,
        threads: usize,
        progress: &Progress,
    ) -> anyhow::Result<RdCoverage> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("Could not create '{}'", out_dir.display()))?;
        let bed = out_dir.join(RD_BED);
        fs::write(&bed, index.to_bed())
            .with_context(|| format!("Could not write '{}'", bed.display()))?;
        let chrom = index
            .regions
            .first()
            .map(|r| r.chrom.clone())
            .unwrap_or_default();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .build()
            .context("Could not start coverage worker pool")?;
        let per_sample: anyhow::Result<Vec<RdSampleCoverage>> = pool.install(|| {
            samples
                .par_iter()
                .map(|sample| {
                    let coverage = run_tool(
                        ExternalTool::Samtools,
                        &["coverage".to_string(), path_arg(&sample.path)],
                    )?;
                    let coverage = String::from_utf8_lossy(&coverage.stdout);
                    let missing = missing_contigs(&coverage, index);
                    if !missing.is_empty() {
                        return Err(anyhow::Error::new(PipelineError::precondition(format!(
                            "'{}' was not aligned against {}; RD analysis needs reads aligned to the reference the RD index uses",
                            sample.name,
                            missing.join(", ")
                        ))));
                    }
                    let baseline = parse_coverage_meandepth(&coverage, &chrom).unwrap_or(0.0);
                    let bedcov = run_tool(
                        ExternalTool::Samtools,
                        &["bedcov".to_string(), path_arg(&bed), path_arg(&sample.path)],
                    )?;
                    let depth = parse_bedcov(&String::from_utf8_lossy(&bedcov.stdout), index)
                        .with_context(|| format!("Coverage of '{}'", sample.name))?;
                    progress.emit(format!("RD coverage for {} done", sample.name));
                    Ok(RdSampleCoverage {
                        name: sample.name.clone(),
                        baseline,
                        depth,
                    })
                })
                .collect()
        });
        Ok(RdCoverage {
            regions: index.names(),
            samples: per_sample?,
        })
    }
}
