//! Reading of VCF files into variants with per-sample genotypes.

use std::{
    io::BufRead,
    path::{Path, PathBuf},
};

use noodles_vcf as vcf;

use crate::{
    common::io::open_read_maybe_gz,
    err::LoadError,
    ingest::ds::{Genotype, Variant, VariantKey},
};

/// One data line of the VCF file.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    /// 1-based line number in the file.
    pub line_no: usize,
    pub variant: Variant,
    /// Genotypes, positionally aligned with the header's sample identifiers.
    pub genotypes: Vec<Genotype>,
}

/// Read the header from `reader`.
///
/// Consumes lines up to and including the `#CHROM` line and returns the
/// parsed header together with the number of lines consumed.  Single-`#`
/// comment lines before the `#CHROM` line are skipped.
pub fn read_header<R: BufRead>(reader: &mut R) -> Result<(vcf::Header, usize), LoadError> {
    let mut line_no = 0;
    let mut raw = String::new();
    let mut buf = String::new();
    loop {
        buf.clear();
        if reader.read_line(&mut buf)? == 0 {
            return Err(LoadError::malformed(line_no, "missing #CHROM header line"));
        }
        line_no += 1;
        let line = buf.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        } else if line.starts_with("##") {
            raw.push_str(line);
            raw.push('\n');
        } else if line.split('\t').next() == Some("#CHROM") {
            raw.push_str(line);
            raw.push('\n');
            break;
        } else if line.starts_with('#') {
            tracing::debug!("skipping comment line {}: {:?}", line_no, line);
        } else {
            return Err(LoadError::malformed(
                line_no,
                "data line before #CHROM header line",
            ));
        }
    }

    let header = raw
        .parse::<vcf::Header>()
        .map_err(|e| LoadError::malformed(line_no, format!("invalid header: {}", e)))?;
    Ok((header, line_no))
}

/// Parse a single data line against `header`.
pub fn parse_line(
    line: &str,
    line_no: usize,
    header: &vcf::Header,
) -> Result<ParsedRecord, LoadError> {
    let record = vcf::Record::try_from_str(line, header)
        .map_err(|e| LoadError::malformed(line_no, format!("invalid record: {}", e)))?;

    let n_samples = header.sample_names().len();
    let n_found = record.genotypes().values().count();
    if n_found != n_samples {
        return Err(LoadError::malformed(
            line_no,
            format!(
                "found {} genotype fields but header declares {} samples",
                n_found, n_samples
            ),
        ));
    }

    let position: usize = record.position().into();
    if position == 0 {
        return Err(LoadError::malformed(line_no, "invalid position 0"));
    }
    let n_alleles = record.alternate_bases().len() as u32 + 1;

    let variant = Variant {
        key: VariantKey {
            chromosome: record.chromosome().to_string(),
            position: position as u64,
            reference: record.reference_bases().to_string(),
            alternate: record.alternate_bases().to_string(),
        },
        vcf_id: missing_to_none(&record.ids().to_string()),
        quality: record.quality_score().map(|q| f64::from(f32::from(q))),
        filter: record
            .filters()
            .and_then(|filters| missing_to_none(&filters.to_string())),
        stats: Default::default(),
    };

    let genotypes = record
        .genotypes()
        .values()
        .map(|sample| {
            let value = match sample.get(&vcf::record::genotypes::keys::key::GENOTYPE) {
                Some(Some(vcf::record::genotypes::sample::Value::String(gt))) => gt.as_str(),
                Some(Some(other)) => {
                    return Err(LoadError::malformed(
                        line_no,
                        format!("invalid genotype value: {:?}", other),
                    ))
                }
                // key absent or value missing
                _ => ".",
            };
            let genotype = value.parse::<Genotype>().map_err(|e| {
                LoadError::malformed(line_no, format!("invalid genotype: {}", e))
            })?;
            if let Some(allele) = genotype.alleles.iter().flatten().find(|a| **a >= n_alleles) {
                return Err(LoadError::malformed(
                    line_no,
                    format!(
                        "genotype {:?} references allele {} but only {} alleles exist",
                        value, allele, n_alleles
                    ),
                ));
            }
            Ok(genotype)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ParsedRecord {
        line_no,
        variant,
        genotypes,
    })
}

fn missing_to_none(value: &str) -> Option<String> {
    match value {
        "." | "" => None,
        _ => Some(value.to_string()),
    }
}

/// Lazy iterator over the data lines of a VCF file.
pub struct Records<R: BufRead> {
    reader: R,
    header: vcf::Header,
    line_no: usize,
    buf: String,
    failed: bool,
}

impl<R: BufRead> Records<R> {
    /// Iterate the records of `reader` whose header (`header_lines` lines)
    /// was already consumed.
    pub fn new(reader: R, header: vcf::Header, header_lines: usize) -> Self {
        Self {
            reader,
            header,
            line_no: header_lines,
            buf: String::new(),
            failed: false,
        }
    }
}

impl<R: BufRead> Iterator for Records<R> {
    type Item = Result<ParsedRecord, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => (),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e.into()));
                }
            }
            self.line_no += 1;
            let line = self.buf.trim_end_matches(['\r', '\n']);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let result = parse_line(line, self.line_no, &self.header);
            self.failed = result.is_err();
            return Some(result);
        }
    }
}

/// A VCF file whose records can be iterated any number of times.
#[derive(Debug, Clone)]
pub struct VcfSource {
    path: PathBuf,
    header: vcf::Header,
    samples: Vec<String>,
}

impl VcfSource {
    /// Open the file at `path` and capture its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let mut reader = open_read_maybe_gz(path.as_ref())?;
        let (header, _) = read_header(&mut reader)?;
        let samples = header.sample_names().iter().cloned().collect::<Vec<_>>();
        tracing::debug!(
            "VCF file {} declares {} samples",
            path.as_ref().display(),
            samples.len()
        );
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            header,
            samples,
        })
    }

    /// Sample identifiers in column order.
    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    /// Iterate the records from the start of the file.
    pub fn records(&self) -> Result<Records<Box<dyn BufRead + Send>>, LoadError> {
        let mut reader = open_read_maybe_gz(&self.path)?;
        let (_, header_lines) = read_header(&mut reader)?;
        Ok(Records::new(reader, self.header.clone(), header_lines))
    }
}
