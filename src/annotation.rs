//! GenBank annotation as a flat feature table, and its GFF3 rendering in the
//! layout `bcftools csq` expects.

use crate::tools::{AnnotationConverter, AnnotationParser};
use anyhow::{Context, anyhow};
use bio::io::gff::{self, GffType};
use gb_io::seq::{Feature, Location, Seq};
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

/// Feature kinds kept in the table.
pub const TABLE_KINDS: [&str; 5] = ["CDS", "gene", "rRNA", "tRNA", "ncRNA"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationFeature {
    pub contig: String,
    pub kind: String,
    pub locus_tag: Option<String>,
    pub gene: Option<String>,
    pub product: Option<String>,
    /// 1-based, inclusive.
    pub start: i64,
    pub end: i64,
    pub reverse: bool,
}

impl AnnotationFeature {
    pub fn strand(&self) -> char {
        if self.reverse { '-' } else { '+' }
    }

    /// Stable identifier for GFF records: locus tag, then gene, then position.
    pub fn id(&self) -> String {
        self.locus_tag
            .clone()
            .or_else(|| self.gene.clone())
            .unwrap_or_else(|| format!("{}_{}_{}", self.contig, self.start, self.end))
    }
}

fn collect_strands(location: &Location, reverse: bool, strands: &mut Vec<bool>) {
    match location {
        Location::Range(_, _) | Location::Between(_, _) => strands.push(reverse),
        Location::Complement(inner) => collect_strands(inner, !reverse, strands),
        Location::Join(parts)
        | Location::Order(parts)
        | Location::Bond(parts)
        | Location::OneOf(parts) => {
            for part in parts {
                collect_strands(part, reverse, strands);
            }
        }
        Location::External(_, Some(inner)) => collect_strands(inner, reverse, strands),
        Location::External(_, None) | Location::Gap(_) => {}
    }
}

/// Majority strand of all parts of a location.
pub fn location_is_reverse(location: &Location) -> bool {
    let mut strands = Vec::new();
    collect_strands(location, false, &mut strands);
    strands.iter().filter(|r| **r).count() * 2 > strands.len()
}

fn first_qualifier(feature: &Feature, key: &str) -> Option<String> {
    feature
        .qualifier_values(key.into())
        .next()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn contig_name(seq: &Seq) -> String {
    seq.version
        .clone()
        .or_else(|| seq.accession.clone())
        .or_else(|| seq.name.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Flattens the features of every record into table rows.
pub fn feature_table(records: &[Seq]) -> Vec<AnnotationFeature> {
    records
        .iter()
        .flat_map(|seq| {
            let contig = contig_name(seq);
            seq.features.iter().filter_map(move |feature| {
                let kind = feature.kind.to_string();
                if !TABLE_KINDS.contains(&kind.as_str()) {
                    return None;
                }
                let (from, to) = feature.location.find_bounds().ok()?;
                if from < 0 || to <= from {
                    return None;
                }
                Some(AnnotationFeature {
                    contig: contig.clone(),
                    kind,
                    locus_tag: first_qualifier(feature, "locus_tag"),
                    gene: first_qualifier(feature, "gene"),
                    product: first_qualifier(feature, "product"),
                    start: from + 1,
                    end: to,
                    reverse: location_is_reverse(&feature.location),
                })
            })
        })
        .collect()
}

fn gff_escape(value: &str) -> String {
    value
        .replace('%', "%25")
        .replace(';', "%3B")
        .replace('=', "%3D")
        .replace(',', "%2C")
}

fn gff_record(
    feature: &AnnotationFeature,
    kind: &str,
    frame: &str,
    attributes: &[(&str, String)],
) -> gff::Record {
    let mut record = gff::Record::new();
    *record.seqname_mut() = feature.contig.clone();
    *record.source_mut() = "snpgenie".to_string();
    *record.feature_type_mut() = kind.to_string();
    *record.start_mut() = feature.start.max(1) as u64;
    *record.end_mut() = feature.end.max(1) as u64;
    *record.score_mut() = ".".to_string();
    *record.strand_mut() = feature.strand().to_string();
    *record.frame_mut() = frame.to_string();
    for (key, value) in attributes {
        record
            .attributes_mut()
            .insert(key.to_string(), value.clone());
    }
    record
}

/// GFF3 with gene/transcript/CDS triples for every CDS feature.
pub fn write_csq_gff3<W: Write>(features: &[AnnotationFeature], out: &mut W) -> anyhow::Result<()> {
    writeln!(out, "##gff-version 3")?;
    let mut writer = gff::Writer::new(out, GffType::GFF3);
    for feature in features.iter().filter(|f| f.kind == "CDS") {
        let id = gff_escape(&feature.id());
        let name = gff_escape(feature.gene.as_deref().unwrap_or(&feature.id()));
        let biotype = ("biotype", "protein_coding".to_string());
        writer.write(&gff_record(
            feature,
            "gene",
            ".",
            &[
                ("ID", format!("gene:{id}")),
                ("Name", name.clone()),
                biotype.clone(),
            ],
        ))?;
        writer.write(&gff_record(
            feature,
            "mRNA",
            ".",
            &[
                ("ID", format!("transcript:{id}")),
                ("Parent", format!("gene:{id}")),
                ("Name", name),
                biotype,
            ],
        ))?;
        writer.write(&gff_record(
            feature,
            "CDS",
            "0",
            &[("Parent", format!("transcript:{id}"))],
        ))?;
    }
    Ok(())
}

fn read_genbank(genbank: &Path) -> anyhow::Result<Vec<Seq>> {
    let records = gb_io::reader::parse_file(genbank)
        .map_err(|e| anyhow!("Could not parse GenBank file '{}': {e}", genbank.display()))?;
    if records.is_empty() {
        return Err(anyhow!("No records in GenBank file '{}'", genbank.display()));
    }
    Ok(records)
}

/// gb-io backed parser and converter.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenbankAnnotation;

impl AnnotationParser for GenbankAnnotation {
    fn parse(&self, genbank: &Path) -> anyhow::Result<Vec<AnnotationFeature>> {
        let records = read_genbank(genbank)?;
        let table = feature_table(&records);
        info!(
            "Parsed {} feature(s) from {} record(s) in '{}'",
            table.len(),
            records.len(),
            genbank.display()
        );
        Ok(table)
    }
}

/// Writes the GFF3 feature file `bcftools csq` reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gff3Converter;

impl AnnotationConverter for Gff3Converter {
    fn convert(&self, genbank: &Path, feature_file: &Path) -> anyhow::Result<PathBuf> {
        let features = GenbankAnnotation.parse(genbank)?;
        let mut buffer = Vec::new();
        write_csq_gff3(&features, &mut buffer)?;
        fs::write(feature_file, buffer)
            .with_context(|| format!("Could not write '{}'", feature_file.display()))?;
        Ok(feature_file.to_path_buf())
    }
}
