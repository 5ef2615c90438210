//! Target & reference VCF reading via `rust_htslib::bcf`. Reads phased `GT`
//! fields per sample into `Vec<u8>` haplotype allele arrays (0/1 only;
//! multi-allelic sites are reduced to a reference/non-reference bit, per
//! spec.md's "non-missing, phased" input contract).

use rust_htslib::bcf::record::GenotypeAllele;
use rust_htslib::bcf::{Read, Reader};

use crate::errors::{LaiError, LaiResult};

/// One VCF's markers and per-haplotype alleles, loaded in full (the engine
/// receives fully materialized per-chromosome data structures, per spec 5).
pub struct HaplotypePanel {
    pub chrom: String,
    pub marker_ids: Vec<String>,
    pub bp: Vec<i64>,
    /// `alleles[marker][hap]`, `hap = 2*sample_index + (0 | 1)`.
    pub alleles: Vec<Vec<u8>>,
    pub sample_names: Vec<String>,
}

impl HaplotypePanel {
    pub fn n_haps(&self) -> usize {
        self.sample_names.len() * 2
    }
}

/// Read every record of `path`, keeping only the requested chromosome if
/// given (`None` reads the first chromosome encountered and stops once a
/// different one appears, matching single-chromosome-at-a-time processing).
pub fn read_vcf(path: &str, restrict_chrom: Option<&str>) -> LaiResult<HaplotypePanel> {
    let mut reader = Reader::from_path(path).map_err(|e| {
        LaiError::io(path.to_string(), std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    })?;
    let header = reader.header().clone();
    let sample_names: Vec<String> = header
        .samples()
        .iter()
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();

    let mut chrom = String::new();
    let mut marker_ids = Vec::new();
    let mut bp = Vec::new();
    let mut alleles: Vec<Vec<u8>> = Vec::new();

    for record_result in reader.records() {
        let mut record = record_result.map_err(|e| LaiError::invalid(path, e.to_string()))?;
        let rid = record.rid().ok_or_else(|| LaiError::invalid(path, "record missing contig id"))?;
        let record_chrom = String::from_utf8_lossy(record.header().rid2name(rid).map_err(|e| {
            LaiError::invalid(path, e.to_string())
        })?)
        .into_owned();

        if let Some(want) = restrict_chrom {
            if record_chrom != want {
                continue;
            }
        } else if chrom.is_empty() {
            chrom = record_chrom.clone();
        } else if record_chrom != chrom {
            break;
        }
        if chrom.is_empty() {
            chrom = record_chrom.clone();
        }

        let id = record.id();
        let marker_id = String::from_utf8_lossy(&id).into_owned();
        bp.push(record.pos() + 1);
        marker_ids.push(marker_id);

        let genotypes = record
            .genotypes()
            .map_err(|e| LaiError::invalid(path, format!("reading GT: {e}")))?;
        let mut marker_alleles = Vec::with_capacity(sample_names.len() * 2);
        for sample_idx in 0..sample_names.len() {
            let genotype = genotypes.get(sample_idx);
            for allele in genotype.iter() {
                let coded = match allele {
                    GenotypeAllele::Phased(0) | GenotypeAllele::Unphased(0) => 0u8,
                    GenotypeAllele::Phased(_) | GenotypeAllele::Unphased(_) => 1u8,
                    GenotypeAllele::PhasedMissing | GenotypeAllele::UnphasedMissing => {
                        return Err(LaiError::invalid_field(
                            path,
                            marker_ids.last().cloned().unwrap_or_default(),
                            "missing genotype call: all markers must be non-missing and phased",
                        ));
                    }
                };
                marker_alleles.push(coded);
            }
        }
        alleles.push(marker_alleles);
    }

    Ok(HaplotypePanel {
        chrom,
        marker_ids,
        bp,
        alleles,
        sample_names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn n_haps_is_twice_sample_count() {
        let panel = HaplotypePanel {
            chrom: "1".into(),
            marker_ids: vec![],
            bp: vec![],
            alleles: vec![],
            sample_names: vec!["a".into(), "b".into(), "c".into()],
        };
        assert_eq!(panel.n_haps(), 6);
    }
}
