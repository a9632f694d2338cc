//! Fakes and fixtures shared by the unit tests.

use crate::annotation::{AnnotationFeature, GenbankAnnotation, Gff3Converter};
use crate::error::ExternalToolError;
use crate::rd_analysis::{
    BuiltinRdIndex, RdCoverage, RdIndex, RdMatrix, RdSampleCoverage, RuleClassifier,
};
use crate::reference::ReferenceConfig;
use crate::sample_set::SampleSet;
use crate::scheduler::Progress;
use crate::session::{CSQ_MATRIX_FILE, FILTERED_VCF, RAW_BCF, RAXML_RUN, Session};
use crate::settings::AlignerKind;
use crate::snp_alignment::{SnpAlignment, VcfSnpExtractor};
use crate::tools::{
    AlignJob, AlignSummary, Aligner, AnnotationConverter, AnnotationParser, Indexer,
    RdClassifier, RdIndexBuilder, RdRegionFinder, ReadLengthProbe, SampleReads, SnpExtractor,
    Toolkit, TreeBuilder, TreeJob, Trimmer, VariantCallArtifacts, VariantCallJob, VariantCaller,
};
use anyhow::bail;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
};

/// 60 bp; position 3 is a `G`.
pub const FIXTURE_SEQUENCE: &str =
    "atgaaacgtttgccaggcaattcaggagcaatgaaacgtttgccaggcaattcaggagca";

const GENBANK_FIXTURE: &str = "\
LOCUS       NC_TEST                   60 bp    DNA     linear   BCT 01-JAN-2020
DEFINITION  Test contig.
ACCESSION   NC_TEST
VERSION     NC_TEST.1
KEYWORDS    .
SOURCE      test organism
  ORGANISM  test organism
            Bacteria.
FEATURES             Location/Qualifiers
     gene            1..30
                     /gene=\"dnaA\"
                     /locus_tag=\"T0001\"
     CDS             1..30
                     /gene=\"dnaA\"
                     /locus_tag=\"T0001\"
                     /product=\"chromosomal replication initiator\"
     CDS             complement(31..60)
                     /locus_tag=\"T0002\"
                     /product=\"hypothetical protein\"
ORIGIN
        1 atgaaacgtt tgccaggcaa ttcaggagca atgaaacgtt tgccaggcaa ttcaggagca
//
";

pub fn write_genbank_fixture(dir: &Path) -> PathBuf {
    let path = dir.join("fixture.gb");
    fs::write(&path, GENBANK_FIXTURE).unwrap();
    path
}

pub fn write_reference_fixture(dir: &Path) -> PathBuf {
    let path = dir.join("fixture.fa");
    fs::write(&path, format!(">NC_TEST.1\n{FIXTURE_SEQUENCE}\n")).unwrap();
    path
}

/// Two four-base reads.
pub fn write_fastq(dir: &Path, name: &str) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, "@r1\nACGT\n+\nIIII\n@r2\nTTGA\n+\nIIII\n").unwrap();
    path
}

/// Samples A and B under `dir/in`, output folder `dir/out`, and the
/// fixture reference with its annotation.
pub fn fixture_session(dir: &Path) -> Session {
    let inputs = dir.join("in");
    let mut samples = SampleSet::new();
    samples.add(
        &[write_fastq(&inputs, "A.fastq"), write_fastq(&inputs, "B.fastq")],
        &FixedReadLength(4),
    );
    Session {
        samples,
        reference: ReferenceConfig::new(
            Some(write_reference_fixture(dir)),
            Some(write_genbank_fixture(dir)),
        ),
        output_dir: Some(dir.join("out")),
        ..Session::default()
    }
}

pub struct FixedReadLength(pub u64);

impl ReadLengthProbe for FixedReadLength {
    fn read_length(&self, _filename: &Path) -> anyhow::Result<u64> {
        Ok(self.0)
    }
}

#[derive(Default)]
pub struct CountingParser {
    pub calls: AtomicUsize,
}

impl AnnotationParser for CountingParser {
    fn parse(&self, genbank: &Path) -> anyhow::Result<Vec<AnnotationFeature>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        GenbankAnnotation.parse(genbank)
    }
}

/// Stands in for every external collaborator. Writes small placeholder
/// files where the real tools would write theirs and counts calls.
#[derive(Default)]
pub struct FakeTools {
    pub trims: AtomicUsize,
    pub index_builds: AtomicUsize,
    pub aligns: AtomicUsize,
    pub variant_calls: AtomicUsize,
    pub conversions: AtomicUsize,
    pub extracts: AtomicUsize,
    pub trees: AtomicUsize,
    pub rd_index_builds: AtomicUsize,
    pub rd_finds: AtomicUsize,
    pub aligned_inputs: Mutex<Vec<PathBuf>>,
    /// File stem whose trim fails.
    pub fail_trim_on: Mutex<Option<String>>,
    pub fail_variant_calling: AtomicBool,
}

impl FakeTools {
    pub fn toolkit(self: &Arc<Self>) -> Toolkit {
        Toolkit {
            read_length: Arc::new(FixedReadLength(4)),
            trimmer: self.clone(),
            indexer: self.clone(),
            aligner: self.clone(),
            variant_caller: self.clone(),
            annotation_converter: self.clone(),
            annotation_parser: Arc::new(GenbankAnnotation),
            snp_extractor: self.clone(),
            tree_builder: self.clone(),
            rd_index: self.clone(),
            rd_finder: self.clone(),
            rd_classifier: self.clone(),
        }
    }
}

impl Trimmer for FakeTools {
    fn trim(&self, input: &Path, output: &Path, _quality: u8) -> anyhow::Result<()> {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.fail_trim_on.lock().unwrap().as_deref() == Some(stem.as_str()) {
            bail!("fake trimmer refused '{}'", input.display());
        }
        self.trims.fetch_add(1, Ordering::SeqCst);
        fs::copy(input, output)?;
        Ok(())
    }
}

impl Indexer for FakeTools {
    fn build_index(
        &self,
        reference: &Path,
        _aligner: AlignerKind,
        _progress: &Progress,
    ) -> anyhow::Result<PathBuf> {
        self.index_builds.fetch_add(1, Ordering::SeqCst);
        Ok(reference.to_path_buf())
    }
}

impl Aligner for FakeTools {
    fn align(
        &self,
        job: &AlignJob,
        progress: &Progress,
        record: &mut dyn FnMut(&str, PathBuf) -> anyhow::Result<()>,
    ) -> anyhow::Result<AlignSummary> {
        let mut summary = AlignSummary::default();
        for reads in &job.reads {
            self.aligned_inputs.lock().unwrap().push(reads.path.clone());
            let bam = job.out_dir.join(format!("{}.bam", reads.name));
            if bam.exists() && !job.overwrite {
                summary.skipped += 1;
            } else {
                self.aligns.fetch_add(1, Ordering::SeqCst);
                fs::write(&bam, "BAM")?;
                summary.aligned += 1;
            }
            progress.emit(bam.display().to_string());
            record(&reads.name, bam)?;
        }
        Ok(summary)
    }
}

impl VariantCaller for FakeTools {
    fn call(
        &self,
        job: &VariantCallJob,
        _progress: &Progress,
    ) -> anyhow::Result<VariantCallArtifacts> {
        if self.fail_variant_calling.load(Ordering::SeqCst) {
            return Err(ExternalToolError {
                executable: "bcftools".to_string(),
                args: vec!["mpileup".to_string()],
                status: Some(255),
                stderr: "fake failure".to_string(),
            }
            .into());
        }
        self.variant_calls.fetch_add(1, Ordering::SeqCst);
        let names: Vec<String> = job
            .bam_files
            .iter()
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
            .collect();
        fs::write(job.out_dir.join(RAW_BCF), "BCF")?;
        let mut vcf = String::from(
            "##fileformat=VCFv4.2\n\
##contig=<ID=NC_TEST.1,length=60>\n\
##INFO=<ID=DP,Number=1,Type=Integer,Description=\"Depth\">\n\
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT",
        );
        for name in &names {
            vcf.push('\t');
            vcf.push_str(name);
        }
        vcf.push_str("\nNC_TEST.1\t3\t.\tG\tT\t60\tPASS\tDP=40\tGT");
        for _ in &names {
            vcf.push_str("\t1");
        }
        vcf.push('\n');
        let vcf_file = job.out_dir.join(FILTERED_VCF);
        fs::write(&vcf_file, vcf)?;
        let csq_matrix = job.out_dir.join(CSQ_MATRIX_FILE);
        fs::write(
            &csq_matrix,
            format!("chrom pos ref alt bcsq {}\n", names.join(" ")),
        )?;
        Ok(VariantCallArtifacts {
            vcf_file,
            csq_matrix,
        })
    }
}

impl AnnotationConverter for FakeTools {
    fn convert(&self, genbank: &Path, feature_file: &Path) -> anyhow::Result<PathBuf> {
        self.conversions.fetch_add(1, Ordering::SeqCst);
        Gff3Converter.convert(genbank, feature_file)
    }
}

impl SnpExtractor for FakeTools {
    fn extract(
        &self,
        vcf: &Path,
        reference: &Path,
        progress: &Progress,
    ) -> anyhow::Result<SnpAlignment> {
        self.extracts.fetch_add(1, Ordering::SeqCst);
        VcfSnpExtractor.extract(vcf, reference, progress)
    }
}

impl TreeBuilder for FakeTools {
    fn build_tree(&self, job: &TreeJob, _progress: &Progress) -> anyhow::Result<PathBuf> {
        self.trees.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(&job.out_dir)?;
        let tree = job.out_dir.join(format!("RAxML_bipartitions.{RAXML_RUN}"));
        fs::write(&tree, "(ref:0.1,(A:0.1,B:0.1)100:0.1,C:0.1);\n")?;
        Ok(tree)
    }
}

impl RdIndexBuilder for FakeTools {
    fn build(&self, regions: Option<&Path>) -> anyhow::Result<RdIndex> {
        self.rd_index_builds.fetch_add(1, Ordering::SeqCst);
        BuiltinRdIndex.build(regions)
    }
}

impl RdRegionFinder for FakeTools {
    /// Even coverage everywhere, so every region counts as present.
    fn find_regions(
        &self,
        samples: &[SampleReads],
        index: &RdIndex,
        _out_dir: &Path,
        _threads: usize,
        _progress: &Progress,
    ) -> anyhow::Result<RdCoverage> {
        self.rd_finds.fetch_add(1, Ordering::SeqCst);
        Ok(RdCoverage {
            regions: index.names(),
            samples: samples
                .iter()
                .map(|s| RdSampleCoverage {
                    name: s.name.clone(),
                    baseline: 40.0,
                    depth: vec![40.0; index.regions.len()],
                })
                .collect(),
        })
    }
}

impl RdClassifier for FakeTools {
    fn classify(&self, coverage: &RdCoverage, cutoff: f64) -> anyhow::Result<RdMatrix> {
        RuleClassifier.classify(coverage, cutoff)
    }
}

/// Copies its input once the test sends on the paired channel.
pub struct BlockingTrimmer {
    gate: Mutex<mpsc::Receiver<()>>,
}

impl BlockingTrimmer {
    pub fn new(gate: mpsc::Receiver<()>) -> Self {
        Self {
            gate: Mutex::new(gate),
        }
    }
}

impl Trimmer for BlockingTrimmer {
    fn trim(&self, input: &Path, output: &Path, _quality: u8) -> anyhow::Result<()> {
        let _ = self.gate.lock().unwrap().recv();
        fs::copy(input, output)?;
        Ok(())
    }
}
