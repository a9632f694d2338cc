use crate::scheduler::Progress;
use crate::tools::SnpExtractor;
use anyhow::{Context, anyhow};
use bio::io::fasta;
use rust_htslib::bcf::{self, Read, record::GenotypeAllele};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};

/// Row name of the reference sequence in the alignment.
pub const REFERENCE_ROW: &str = "ref";
const MISSING_BASE: u8 = b'N';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnpSite {
    pub chrom: String,
    /// 1-based.
    pub pos: u64,
    pub reference: char,
    pub alt: Vec<String>,
    /// One base per sample, in [`SnpAlignment::samples`] order.
    pub alleles: Vec<char>,
}

/// Variant-position alignment: one row per sample plus the reference row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnpAlignment {
    pub samples: Vec<String>,
    pub sites: Vec<SnpSite>,
    /// Reference bases at each site, read from the reference FASTA.
    pub reference_row: String,
}

impl SnpAlignment {
    /// `(id, sequence)` records, reference first.
    pub fn records(&self) -> Vec<(String, String)> {
        let mut records = vec![(REFERENCE_ROW.to_string(), self.reference_row.clone())];
        for (col, sample) in self.samples.iter().enumerate() {
            let seq: String = self.sites.iter().map(|site| site.alleles[col]).collect();
            records.push((sample.clone(), seq));
        }
        records
    }

    pub fn write_fasta(&self, path: &Path) -> anyhow::Result<()> {
        let mut writer = fasta::Writer::to_file(path)
            .with_context(|| format!("Could not create '{}'", path.display()))?;
        for (id, seq) in self.records() {
            writer
                .write(&id, None, seq.as_bytes())
                .with_context(|| format!("Could not write '{}'", path.display()))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Per-site matrix: `chrom,pos,ref,alt` then one column per sample.
    pub fn write_site_matrix(&self, path: &Path) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Could not create '{}'", path.display()))?;
        let mut header = vec!["chrom".to_string(), "pos".into(), "ref".into(), "alt".into()];
        header.extend(self.samples.iter().cloned());
        writer.write_record(&header)?;
        for site in &self.sites {
            let mut row = vec![
                site.chrom.clone(),
                site.pos.to_string(),
                site.reference.to_string(),
                site.alt.join(","),
            ];
            row.extend(site.alleles.iter().map(char::to_string));
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn read_reference(path: &Path) -> anyhow::Result<HashMap<String, Vec<u8>>> {
    let reader = fasta::Reader::from_file(path)
        .map_err(|e| anyhow!("Could not open reference '{}': {e}", path.display()))?;
    let mut contigs = HashMap::new();
    for record in reader.records() {
        let record =
            record.with_context(|| format!("Malformed FASTA record in '{}'", path.display()))?;
        contigs.insert(record.id().to_string(), record.seq().to_ascii_uppercase());
    }
    Ok(contigs)
}

fn is_snp(alleles: &[Vec<u8>]) -> bool {
    alleles.len() > 1
        && alleles
            .iter()
            .all(|a| a.len() == 1 && a[0] != b'.' && a[0] != b'*')
}

/// Base of the first allele of one sample's genotype; `N` when missing.
fn genotype_base(genotype: &[GenotypeAllele], alleles: &[Vec<u8>]) -> char {
    genotype
        .first()
        .and_then(|allele| allele.index())
        .and_then(|k| alleles.get(k as usize))
        .and_then(|a| a.first())
        .map(|b| *b as char)
        .unwrap_or(MISSING_BASE as char)
}

/// Reads SNP sites from a VCF or BCF file, plain or bgzip-compressed.
/// Indels and sites without an ALT allele are dropped.
pub fn read_vcf_snps(path: &Path) -> anyhow::Result<(Vec<String>, Vec<SnpSite>)> {
    let mut reader = bcf::Reader::from_path(path)
        .with_context(|| format!("Could not open VCF '{}'", path.display()))?;
    let samples: Vec<String> = reader
        .header()
        .samples()
        .iter()
        .map(|s| String::from_utf8_lossy(s).to_string())
        .collect();
    let mut sites = vec![];
    for (n, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Malformed VCF record {}", n + 1))?;
        let alleles: Vec<Vec<u8>> = record
            .alleles()
            .iter()
            .map(|a| a.to_ascii_uppercase())
            .collect();
        if !is_snp(&alleles) {
            continue;
        }
        let rid = record
            .rid()
            .ok_or_else(|| anyhow!("VCF record {} has no CHROM", n + 1))?;
        let chrom = String::from_utf8_lossy(record.header().rid2name(rid)?).to_string();
        let bases: Vec<char> = match record.genotypes() {
            Ok(genotypes) => (0..samples.len())
                .map(|i| genotype_base(&genotypes.get(i), &alleles))
                .collect(),
            Err(_) => vec![MISSING_BASE as char; samples.len()],
        };
        sites.push(SnpSite {
            chrom,
            pos: record.pos() as u64 + 1,
            reference: alleles[0][0] as char,
            alt: alleles[1..]
                .iter()
                .map(|a| String::from_utf8_lossy(a).to_string())
                .collect(),
            alleles: bases,
        });
    }
    Ok((samples, sites))
}

/// Native VCF/BCF reader over htslib.
#[derive(Debug, Clone, Copy, Default)]
pub struct VcfSnpExtractor;

impl SnpExtractor for VcfSnpExtractor {
    fn extract(
        &self,
        vcf: &Path,
        reference: &Path,
        progress: &Progress,
    ) -> anyhow::Result<SnpAlignment> {
        let (samples, sites) = read_vcf_snps(vcf)
            .with_context(|| format!("Could not read variants from '{}'", vcf.display()))?;
        progress.emit(format!(
            "Read {} SNP site(s) for {} sample(s) from {}",
            sites.len(),
            samples.len(),
            vcf.display()
        ));
        let contigs = read_reference(reference)?;
        // the reference FASTA wins; REF only fills contigs it does not have
        let reference_row = sites
            .iter()
            .map(|site| {
                contigs
                    .get(&site.chrom)
                    .and_then(|seq| seq.get((site.pos as usize).checked_sub(1)?))
                    .map(|b| *b as char)
                    .unwrap_or(site.reference)
            })
            .collect();
        Ok(SnpAlignment {
            samples,
            sites,
            reference_row,
        })
    }
}
