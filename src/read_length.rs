use crate::tools::ReadLengthProbe;
use anyhow::{Context, bail};
use bio::io::fastq;
use flate2::read::MultiGzDecoder;
use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

pub const DEFAULT_READ_SAMPLE: usize = 1000;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Opens a plain or gzip/bgzip file, sniffing the magic bytes.
pub fn open_maybe_gz(path: &Path) -> anyhow::Result<Box<dyn Read + Send>> {
    let mut magic = [0u8; 2];
    let mut probe =
        File::open(path).with_context(|| format!("Could not open '{}'", path.display()))?;
    let is_gz = probe.read(&mut magic).unwrap_or(0) == 2 && magic == GZIP_MAGIC;
    let file = File::open(path).with_context(|| format!("Could not open '{}'", path.display()))?;
    if is_gz {
        Ok(Box::new(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Mean length of the first reads of a FASTQ file.
#[derive(Debug, Clone, Copy)]
pub struct FastqReadLength {
    pub max_reads: usize,
}

impl Default for FastqReadLength {
    fn default() -> Self {
        Self {
            max_reads: DEFAULT_READ_SAMPLE,
        }
    }
}

impl ReadLengthProbe for FastqReadLength {
    fn read_length(&self, filename: &Path) -> anyhow::Result<u64> {
        let reader = fastq::Reader::new(open_maybe_gz(filename)?);
        let mut total = 0u64;
        let mut count = 0u64;
        for record in reader.records().take(self.max_reads) {
            let record = record
                .with_context(|| format!("Malformed FASTQ record in '{}'", filename.display()))?;
            total += record.seq().len() as u64;
            count += 1;
        }
        if count == 0 {
            bail!("No reads in '{}'", filename.display());
        }
        Ok((total as f64 / count as f64).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;
    use tempfile::tempdir;

    const READS: &str = "@r1\nACGTACGTAC\n+\nIIIIIIIIII\n@r2\nACGTAC\n+\nIIIIII\n";

    #[test]
    fn test_mean_length_plain() {
        let td = tempdir().unwrap();
        let path = td.path().join("A.fastq");
        std::fs::write(&path, READS).unwrap();
        assert_eq!(FastqReadLength::default().read_length(&path).unwrap(), 8);
    }

    #[test]
    fn test_mean_length_gz_and_limit() {
        let td = tempdir().unwrap();
        let path = td.path().join("A.fastq.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(READS.as_bytes()).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();
        let probe = FastqReadLength { max_reads: 1 };
        assert_eq!(probe.read_length(&path).unwrap(), 10);
    }

    #[test]
    fn test_empty_or_missing_file_fails() {
        let td = tempdir().unwrap();
        let path = td.path().join("empty.fq");
        std::fs::write(&path, "").unwrap();
        assert!(FastqReadLength::default().read_length(&path).is_err());
        assert!(
            FastqReadLength::default()
                .read_length(&td.path().join("absent.fq"))
                .is_err()
        );
    }
}
