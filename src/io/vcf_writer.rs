//! VCF writing via `rust_htslib::bcf::Writer`: per-marker `GT:AN1:AN2
//! [:ANP1:ANP2]`, plus an `##ANCESTRY=<id=index,...>` header line
//! (spec.md section 6).

use rust_htslib::bcf::header::Header;
use rust_htslib::bcf::record::GenotypeAllele;
use rust_htslib::bcf::{Format, Writer};

use crate::errors::LaiError;
use crate::errors::LaiResult;

/// One target haplotype pair's per-marker output: argmax ancestry and
/// (optionally) the full ancestry-probability vector, rounded to 2
/// decimals before being written as the `ANP1`/`ANP2` FORMAT fields.
pub struct SampleMarkerOutput {
    pub gt: (i32, i32),
    pub an1: i32,
    pub an2: i32,
    pub anp1: Option<Vec<f64>>,
    pub anp2: Option<Vec<f64>>,
}

/// Builds a single-contig header: `chrom` becomes contig index 0, the only
/// `rid` [`write_marker`] ever sets (spec 5 processes one chromosome at a
/// time).
pub fn build_header(chrom: &str, sample_names: &[String], ancestry_names: &[String], emit_probs: bool) -> Header {
    let mut header = Header::new();
    header.push_record(br#"##source=laihmm"#);
    header.push_record(format!("##contig=<ID={chrom}>").as_bytes());
    for (idx, name) in ancestry_names.iter().enumerate() {
        header.push_record(format!("##ANCESTRY=<id={name},index={idx}>").as_bytes());
    }
    header.push_record(br#"##FORMAT=<ID=GT,Number=1,Type=String,Description="Genotype">"#);
    header.push_record(br#"##FORMAT=<ID=AN1,Number=1,Type=Integer,Description="Argmax ancestry, haplotype 1">"#);
    header.push_record(br#"##FORMAT=<ID=AN2,Number=1,Type=Integer,Description="Argmax ancestry, haplotype 2">"#);
    if emit_probs {
        header.push_record(
            br#"##FORMAT=<ID=ANP1,Number=.,Type=Float,Description="Ancestry posterior, haplotype 1">"#,
        );
        header.push_record(
            br#"##FORMAT=<ID=ANP2,Number=.,Type=Float,Description="Ancestry posterior, haplotype 2">"#,
        );
    }
    for name in sample_names {
        header.push_sample(name.as_bytes());
    }
    header
}

pub fn open_writer(path: &str, header: &Header) -> LaiResult<Writer> {
    Writer::from_path(path, header, false, Format::Vcf)
        .map_err(|e| LaiError::io(path.to_string(), std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
}

/// Write one marker's record: `chrom`/`pos`/`id` plus every sample's
/// `GT:AN1:AN2[:ANP1:ANP2]`, in marker order (spec 5's ordering guarantee).
pub fn write_marker(
    writer: &mut Writer,
    rid: u32,
    pos: i64,
    marker_id: &str,
    per_sample: &[SampleMarkerOutput],
    emit_probs: bool,
) -> LaiResult<()> {
    let io_err = |e: rust_htslib::errors::Error| {
        LaiError::io("output VCF", std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    };
    let mut record = writer.empty_record();
    record.set_rid(Some(rid));
    record.set_pos(pos);
    record.set_id(marker_id.as_bytes()).map_err(io_err)?;

    let genotypes: Vec<GenotypeAllele> = per_sample
        .iter()
        .flat_map(|s| {
            [
                GenotypeAllele::Phased(s.gt.0),
                GenotypeAllele::Phased(s.gt.1),
            ]
        })
        .collect();
    record.push_genotypes(&genotypes).map_err(io_err)?;

    let an1: Vec<i32> = per_sample.iter().map(|s| s.an1).collect();
    let an2: Vec<i32> = per_sample.iter().map(|s| s.an2).collect();
    record.push_format_integer(b"AN1", &an1).map_err(io_err)?;
    record.push_format_integer(b"AN2", &an2).map_err(io_err)?;

    if emit_probs {
        let round2 = |v: f64| (v * 100.0).round() as f32 / 100.0;
        let n_ancestries = per_sample
            .iter()
            .find_map(|s| s.anp1.as_ref().map(|v| v.len()))
            .unwrap_or(0);
        let mut anp1 = Vec::with_capacity(per_sample.len() * n_ancestries);
        let mut anp2 = Vec::with_capacity(per_sample.len() * n_ancestries);
        for s in per_sample {
            match &s.anp1 {
                Some(v) => anp1.extend(v.iter().map(|&x| round2(x))),
                None => anp1.extend(std::iter::repeat(0.0f32).take(n_ancestries)),
            }
            match &s.anp2 {
                Some(v) => anp2.extend(v.iter().map(|&x| round2(x))),
                None => anp2.extend(std::iter::repeat(0.0f32).take(n_ancestries)),
            }
        }
        record.push_format_float(b"ANP1", &anp1).map_err(io_err)?;
        record.push_format_float(b"ANP2", &anp2).map_err(io_err)?;
    }

    writer.write(&record).map_err(io_err)
}
