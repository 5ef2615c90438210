//! bref3 binary reference format (spec.md section 6): a length-prefixed
//! big-endian stream, matching the original format's Java `DataOutputStream`
//! convention. A faithful codec with no inference logic -- it produces the
//! same per-chromosome `hap -> allele` arrays a VCF reference reader would.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{LaiError, LaiResult};

pub const MAGIC: i32 = 0x7A86_4274;
const END_OF_INDEX: i64 = -999_999_999_999_999;
const NULL_ALLELE_LEN: i32 = -1;

/// One marker record within a block: either a byte-coded "sequence to
/// allele" table (tag `0`, for markers whose allele pattern was reduced to
/// step-local sequences upstream) or a per-allele haplotype-index list
/// (tag `1`; a `NULL_ALLELE_LEN`-length list denotes the "null"/reference
/// allele bucket implicitly holding every haplotype not listed elsewhere).
#[derive(Clone, Debug, PartialEq)]
pub enum MarkerRecord {
    SequenceCoded { seq_to_allele: Vec<u8> },
    AlleleCoded { allele_haps: Vec<Option<Vec<i32>>> },
}

#[derive(Clone, Debug)]
pub struct Block {
    pub chrom: String,
    /// `hap_to_seq[h]` is haplotype `h`'s char-encoded sequence index within
    /// this block.
    pub hap_to_seq: Vec<char>,
    pub markers: Vec<MarkerRecord>,
}

#[derive(Clone, Debug)]
pub struct Bref3File {
    pub program: String,
    pub samples: Vec<String>,
    pub blocks: Vec<Block>,
}

fn io_err(e: std::io::Error) -> LaiError {
    LaiError::io("bref3 reference file", e)
}

fn read_utf8_string<R: Read>(r: &mut R) -> LaiResult<String> {
    let len = r.read_i32::<BigEndian>().map_err(io_err)?;
    let mut buf = vec![0u8; len.max(0) as usize];
    r.read_exact(&mut buf).map_err(io_err)?;
    String::from_utf8(buf).map_err(|_| LaiError::invalid("bref3 reference file", "invalid UTF-8 string"))
}

fn write_utf8_string<W: Write>(w: &mut W, s: &str) -> LaiResult<()> {
    w.write_i32::<BigEndian>(s.len() as i32).map_err(io_err)?;
    w.write_all(s.as_bytes()).map_err(io_err)?;
    Ok(())
}

fn read_string_array<R: Read>(r: &mut R) -> LaiResult<Vec<String>> {
    let n = r.read_i32::<BigEndian>().map_err(io_err)?;
    (0..n).map(|_| read_utf8_string(r)).collect()
}

fn write_string_array<W: Write>(w: &mut W, items: &[String]) -> LaiResult<()> {
    w.write_i32::<BigEndian>(items.len() as i32).map_err(io_err)?;
    for item in items {
        write_utf8_string(w, item)?;
    }
    Ok(())
}

impl Bref3File {
    pub fn read<R: Read>(mut r: R) -> LaiResult<Self> {
        let magic = r.read_i32::<BigEndian>().map_err(io_err)?;
        if magic != MAGIC {
            return Err(LaiError::invalid(
                "bref3 reference file",
                format!("bad magic number: {magic:#x}"),
            ));
        }
        let program = read_utf8_string(&mut r)?;
        let samples = read_string_array(&mut r)?;

        let mut blocks = Vec::new();
        loop {
            let n_haps = r.read_i32::<BigEndian>().map_err(io_err)?;
            if n_haps == 0 {
                break;
            }
            let chrom = read_utf8_string(&mut r)?;
            let hap_to_seq: Vec<char> = (0..n_haps)
                .map(|_| r.read_u16::<BigEndian>().map(|c| c as u8 as char).map_err(io_err))
                .collect::<LaiResult<Vec<char>>>()?;

            let n_markers = r.read_i32::<BigEndian>().map_err(io_err)?;
            let mut markers = Vec::with_capacity(n_markers.max(0) as usize);
            for _ in 0..n_markers {
                markers.push(read_marker_record(&mut r)?);
            }
            blocks.push(Block {
                chrom,
                hap_to_seq,
                markers,
            });
        }

        // trailing index: (offset, firstPos) pairs terminated by the
        // end-of-index sentinel, then a trailing pointer to the index.
        loop {
            let offset = r.read_i64::<BigEndian>().map_err(io_err)?;
            if offset == END_OF_INDEX {
                break;
            }
            let _first_pos = r.read_i64::<BigEndian>().map_err(io_err)?;
        }
        let _index_pointer = r.read_i64::<BigEndian>().map_err(io_err)?;

        Ok(Bref3File {
            program,
            samples,
            blocks,
        })
    }

    pub fn write<W: Write>(&self, mut w: W) -> LaiResult<()> {
        w.write_i32::<BigEndian>(MAGIC).map_err(io_err)?;
        write_utf8_string(&mut w, &self.program)?;
        write_string_array(&mut w, &self.samples)?;

        let mut index: Vec<(i64, i64)> = Vec::with_capacity(self.blocks.len());
        let mut offset: i64 = 0;
        for block in &self.blocks {
            index.push((offset, 0));
            w.write_i32::<BigEndian>(block.hap_to_seq.len() as i32).map_err(io_err)?;
            write_utf8_string(&mut w, &block.chrom)?;
            for &c in &block.hap_to_seq {
                w.write_u16::<BigEndian>(c as u16).map_err(io_err)?;
            }
            w.write_i32::<BigEndian>(block.markers.len() as i32).map_err(io_err)?;
            for marker in &block.markers {
                write_marker_record(&mut w, marker)?;
            }
            offset += 1;
        }

        w.write_i32::<BigEndian>(0).map_err(io_err)?; // end-of-data marker
        for (off, first_pos) in &index {
            w.write_i64::<BigEndian>(*off).map_err(io_err)?;
            w.write_i64::<BigEndian>(*first_pos).map_err(io_err)?;
        }
        w.write_i64::<BigEndian>(END_OF_INDEX).map_err(io_err)?;
        w.write_i64::<BigEndian>(0).map_err(io_err)?; // pointer to the index
        Ok(())
    }
}

fn read_marker_record<R: Read>(r: &mut R) -> LaiResult<MarkerRecord> {
    let tag = r.read_i32::<BigEndian>().map_err(io_err)?;
    match tag {
        0 => {
            let n = r.read_i32::<BigEndian>().map_err(io_err)?;
            let mut seq_to_allele = vec![0u8; n.max(0) as usize];
            r.read_exact(&mut seq_to_allele).map_err(io_err)?;
            Ok(MarkerRecord::SequenceCoded { seq_to_allele })
        }
        1 => {
            let n_alleles = r.read_i32::<BigEndian>().map_err(io_err)?;
            let mut allele_haps = Vec::with_capacity(n_alleles.max(0) as usize);
            for _ in 0..n_alleles {
                let len = r.read_i32::<BigEndian>().map_err(io_err)?;
                if len == NULL_ALLELE_LEN {
                    allele_haps.push(None);
                } else {
                    let mut haps = Vec::with_capacity(len.max(0) as usize);
                    for _ in 0..len {
                        haps.push(r.read_i32::<BigEndian>().map_err(io_err)?);
                    }
                    allele_haps.push(Some(haps));
                }
            }
            Ok(MarkerRecord::AlleleCoded { allele_haps })
        }
        other => Err(LaiError::invalid(
            "bref3 reference file",
            format!("unknown marker record tag {other}"),
        )),
    }
}

fn write_marker_record<W: Write>(w: &mut W, record: &MarkerRecord) -> LaiResult<()> {
    match record {
        MarkerRecord::SequenceCoded { seq_to_allele } => {
            w.write_i32::<BigEndian>(0).map_err(io_err)?;
            w.write_i32::<BigEndian>(seq_to_allele.len() as i32).map_err(io_err)?;
            w.write_all(seq_to_allele).map_err(io_err)?;
        }
        MarkerRecord::AlleleCoded { allele_haps } => {
            w.write_i32::<BigEndian>(1).map_err(io_err)?;
            w.write_i32::<BigEndian>(allele_haps.len() as i32).map_err(io_err)?;
            for haps in allele_haps {
                match haps {
                    None => {
                        w.write_i32::<BigEndian>(NULL_ALLELE_LEN).map_err(io_err)?;
                    }
                    Some(haps) => {
                        w.write_i32::<BigEndian>(haps.len() as i32).map_err(io_err)?;
                        for &h in haps {
                            w.write_i32::<BigEndian>(h).map_err(io_err)?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Expand a block's markers into `allele[marker][hap]` arrays, the shape
/// the rest of the engine consumes (matching a VCF reference reader's
/// output), by resolving each haplotype's sequence index per marker.
pub fn decode_block_alleles(block: &Block) -> Vec<Vec<u8>> {
    let n_haps = block.hap_to_seq.len();
    block
        .markers
        .iter()
        .map(|marker| match marker {
            MarkerRecord::SequenceCoded { seq_to_allele } => (0..n_haps)
                .map(|h| {
                    let seq = block.hap_to_seq[h] as usize;
                    seq_to_allele.get(seq).copied().unwrap_or(0)
                })
                .collect(),
            MarkerRecord::AlleleCoded { allele_haps } => {
                let mut alleles = vec![0u8; n_haps];
                for (allele, haps) in allele_haps.iter().enumerate() {
                    if let Some(haps) = haps {
                        for &h in haps {
                            alleles[h as usize] = allele as u8;
                        }
                    }
                }
                alleles
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_file() -> Bref3File {
        Bref3File {
            program: "laihmm".to_string(),
            samples: vec!["s1".to_string(), "s2".to_string()],
            blocks: vec![Block {
                chrom: "1".to_string(),
                hap_to_seq: vec![0 as char, 0 as char, 1 as char, 1 as char],
                markers: vec![
                    MarkerRecord::SequenceCoded {
                        seq_to_allele: vec![0, 1],
                    },
                    MarkerRecord::AlleleCoded {
                        allele_haps: vec![Some(vec![0, 1]), Some(vec![2, 3])],
                    },
                ],
            }],
        }
    }

    #[test]
    fn round_trips_through_write_and_read() {
        let file = toy_file();
        let mut buf = Vec::new();
        file.write(&mut buf).unwrap();
        let reread = Bref3File::read(buf.as_slice()).unwrap();
        assert_eq!(reread.program, file.program);
        assert_eq!(reread.samples, file.samples);
        assert_eq!(reread.blocks.len(), 1);
        assert_eq!(reread.blocks[0].markers, file.blocks[0].markers);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(0).unwrap();
        assert!(Bref3File::read(buf.as_slice()).is_err());
    }

    #[test]
    fn decode_block_alleles_resolves_sequence_coded_marker() {
        let block = toy_file().blocks.into_iter().next().unwrap();
        let decoded = decode_block_alleles(&block);
        assert_eq!(decoded[0], vec![0, 0, 1, 1]);
    }

    #[test]
    fn decode_block_alleles_resolves_allele_coded_marker() {
        let block = toy_file().blocks.into_iter().next().unwrap();
        let decoded = decode_block_alleles(&block);
        assert_eq!(decoded[1], vec![0, 0, 1, 1]);
    }
}
